//! Gallery operations and their reported status.

use crate::gallery::{GalleryModel, InstallRequest};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

/// What a queued operation does.
#[derive(Debug, Clone)]
pub enum OpAction {
    /// Install a model by catalog name, or from `model` when given directly.
    InstallModel {
        request: InstallRequest,
        model: Option<Box<GalleryModel>>,
    },
    DeleteModel,
    /// Install a backend by catalog name.
    InstallBackend { force: bool },
    /// Install a backend straight from an OCI image, URL or directory.
    InstallBackendFromUri { uri: String, alias: String },
    DeleteBackend,
}

impl OpAction {
    pub fn is_deletion(&self) -> bool {
        matches!(self, Self::DeleteModel | Self::DeleteBackend)
    }

    pub fn is_backend(&self) -> bool {
        matches!(
            self,
            Self::InstallBackend { .. } | Self::InstallBackendFromUri { .. } | Self::DeleteBackend
        )
    }
}

/// A unit of work for the gallery worker.
#[derive(Debug, Clone)]
pub struct GalleryOp {
    pub id: String,
    /// Model or backend name, `gallery@name`, or a URI to import.
    pub gallery_element_name: String,
    pub action: OpAction,
}

impl GalleryOp {
    pub fn new(gallery_element_name: impl Into<String>, action: OpAction) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            gallery_element_name: gallery_element_name.into(),
            action,
        }
    }

    pub fn install_model(name: impl Into<String>, request: InstallRequest) -> Self {
        Self::new(
            name,
            OpAction::InstallModel {
                request,
                model: None,
            },
        )
    }

    pub fn delete_model(name: impl Into<String>) -> Self {
        Self::new(name, OpAction::DeleteModel)
    }

    pub fn install_backend(name: impl Into<String>) -> Self {
        Self::new(name, OpAction::InstallBackend { force: false })
    }

    pub fn delete_backend(name: impl Into<String>) -> Self {
        Self::new(name, OpAction::DeleteBackend)
    }
}

/// Status of an operation as served by the status endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GalleryOpStatus {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub message: String,
    /// Percentage in `0..=100`.
    #[serde(default)]
    pub progress: f64,
    #[serde(default)]
    pub file_size: String,
    #[serde(default)]
    pub downloaded_size: String,
    #[serde(default)]
    pub processed: bool,
    #[serde(default)]
    pub deletion: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub file_name: String,
    #[serde(default)]
    pub gallery_element_name: String,
    #[serde(default)]
    pub cancelled: bool,
    #[serde(default)]
    pub cancellable: bool,
}

impl GalleryOpStatus {
    pub(crate) fn cancelled(id: &str, element: &str) -> Self {
        Self {
            id: id.to_string(),
            message: "cancelled".to_string(),
            processed: true,
            gallery_element_name: element.to_string(),
            cancelled: true,
            ..Default::default()
        }
    }

    /// Whether the operation reached a final state.
    pub fn is_terminal(&self) -> bool {
        self.processed
    }
}

/// Kind of work shown next to an element being processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    Waiting,
    Installation,
    Deletion,
}

/// Element name to operation id, for elements with work in flight.
#[derive(Debug, Clone, Default)]
pub struct OpCache {
    entries: Arc<RwLock<HashMap<String, String>>>,
    backend_ops: Arc<RwLock<HashSet<String>>>,
}

impl OpCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, element: impl Into<String>, op_id: impl Into<String>) {
        self.write().insert(element.into(), op_id.into());
    }

    /// Like [`Self::set`], also remembering the element is a backend.
    pub fn set_backend(&self, element: impl Into<String>, op_id: impl Into<String>) {
        let element = element.into();
        self.backend_ops
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(element.clone());
        self.set(element, op_id);
    }

    pub fn is_backend_op(&self, element: &str) -> bool {
        self.backend_ops
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(element)
    }

    pub fn get(&self, element: &str) -> Option<String> {
        self.read().get(element).cloned()
    }

    pub fn exists(&self, element: &str) -> bool {
        self.read().contains_key(element)
    }

    /// Forget every element that points at `op_id`.
    pub fn delete_op(&self, op_id: &str) {
        let mut entries = self.write();
        let mut backend_ops = self.backend_ops.write().unwrap_or_else(|e| e.into_inner());
        entries.retain(|element, id| {
            if id == op_id {
                backend_ops.remove(element);
                false
            } else {
                true
            }
        });
    }

    pub fn map(&self) -> HashMap<String, String> {
        self.read().clone()
    }

    /// Elements in flight with the kind of work for each, given op statuses.
    pub fn task_types(
        &self,
        status_of: impl Fn(&str) -> Option<GalleryOpStatus>,
    ) -> HashMap<String, TaskType> {
        self.read()
            .iter()
            .map(|(element, op_id)| {
                let kind = match status_of(op_id) {
                    None => TaskType::Waiting,
                    Some(status) if status.deletion => TaskType::Deletion,
                    Some(_) => TaskType::Installation,
                };
                (element.clone(), kind)
            })
            .collect()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, String>> {
        self.entries.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, String>> {
        self.entries.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_json_shape() {
        let status = GalleryOpStatus {
            id: "op-1".into(),
            message: "processing".into(),
            progress: 42.0,
            file_size: "1.0 GiB".into(),
            downloaded_size: "420.0 MiB".into(),
            file_name: "model.gguf".into(),
            cancellable: true,
            ..Default::default()
        };
        let json = serde_json::to_value(&status).unwrap();
        for key in [
            "id",
            "message",
            "progress",
            "file_size",
            "downloaded_size",
            "processed",
            "deletion",
            "error",
            "file_name",
            "gallery_element_name",
            "cancelled",
            "cancellable",
        ] {
            assert!(json.get(key).is_some(), "missing {}", key);
        }
        assert_eq!(json["progress"], 42.0);
        assert!(json["error"].is_null());
    }

    #[test]
    fn test_op_cache_tracks_elements() {
        let cache = OpCache::new();
        cache.set("phi-2", "op-1");
        cache.set_backend("llama-cpp", "op-2");
        cache.set("other-name", "op-1");

        assert!(cache.exists("phi-2"));
        assert!(cache.is_backend_op("llama-cpp"));
        assert!(!cache.is_backend_op("phi-2"));

        let types = cache.task_types(|id| {
            (id == "op-2").then(|| GalleryOpStatus {
                deletion: true,
                ..Default::default()
            })
        });
        assert_eq!(types["phi-2"], TaskType::Waiting);
        assert_eq!(types["llama-cpp"], TaskType::Deletion);

        cache.delete_op("op-1");
        assert!(!cache.exists("phi-2"));
        assert!(!cache.exists("other-name"));
        assert_eq!(cache.get("llama-cpp").as_deref(), Some("op-2"));

        cache.delete_op("op-2");
        assert!(!cache.is_backend_op("llama-cpp"));
    }

    #[test]
    fn test_action_classification() {
        assert!(GalleryOp::delete_model("m").action.is_deletion());
        assert!(GalleryOp::install_backend("b").action.is_backend());
        assert!(!GalleryOp::install_model("m", InstallRequest::default()).action.is_backend());
        assert_ne!(GalleryOp::delete_model("m").id, GalleryOp::delete_model("m").id);
    }
}
