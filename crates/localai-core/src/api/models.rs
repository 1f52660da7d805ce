//! Model methods: catalog listing, install/delete operations and the runtime.

use crate::cancel::CancellationToken;
use crate::error::{LocalAiError, Result};
use crate::gallery::{
    paginate, search, sort_elements, GalleryElement, GalleryModel, InstallRequest, ModelConfig,
    SortField, SortOrder,
};
use crate::runtime::{LoadedModel, ProcessStatus};
use crate::services::{GalleryOp, GalleryOpStatus, OpAction, TaskType};
use crate::LocalAiApi;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Filtering, sorting and paging of a catalog listing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GalleryQuery {
    #[serde(default)]
    pub term: Option<String>,
    #[serde(default)]
    pub sort: Option<SortField>,
    #[serde(default)]
    pub order: SortOrder,
    /// 1-based; no paging when unset.
    #[serde(default)]
    pub page: Option<usize>,
    #[serde(default)]
    pub items_per_page: Option<usize>,
}

impl GalleryQuery {
    pub(crate) fn apply<T: GalleryElement>(&self, mut elements: Vec<T>) -> Vec<T> {
        if let Some(term) = self.term.as_deref() {
            elements = search(&elements, term);
        }
        if let Some(field) = self.sort {
            sort_elements(&mut elements, field, self.order);
        }
        match (self.page, self.items_per_page) {
            (Some(page), Some(per_page)) => paginate(&elements, page, per_page),
            (Some(page), None) => paginate(&elements, page, 21),
            _ => elements,
        }
    }
}

impl LocalAiApi {
    /// Models offered by the configured galleries.
    pub async fn list_gallery_models(&self, query: &GalleryQuery) -> Result<Vec<GalleryModel>> {
        let models = self
            .inner
            .gallery
            .available_models(&self.inner.config.galleries)
            .await?;
        Ok(query.apply(models))
    }

    /// Queue installation of gallery model `name` (or `gallery@name`, or a URI
    /// to import). Returns the operation id.
    pub fn apply_model(&self, name: &str, request: InstallRequest) -> Result<String> {
        if name.trim().is_empty() {
            return Err(LocalAiError::Validation {
                field: "id".to_string(),
                message: "model name is required".to_string(),
            });
        }
        self.inner
            .service
            .enqueue(GalleryOp::install_model(name, request))
    }

    /// Queue installation of a model entry that is not in any gallery.
    pub fn apply_model_definition(
        &self,
        model: GalleryModel,
        request: InstallRequest,
    ) -> Result<String> {
        let name = request
            .name
            .clone()
            .unwrap_or_else(|| model.metadata.name.clone());
        self.inner.service.enqueue(GalleryOp::new(
            name,
            OpAction::InstallModel {
                request,
                model: Some(Box::new(model)),
            },
        ))
    }

    /// Queue deletion of installed model `name`.
    pub fn delete_model(&self, name: &str) -> Result<String> {
        self.inner.service.enqueue(GalleryOp::delete_model(name))
    }

    /// Names of installed models, sorted.
    pub async fn installed_models(&self) -> Result<Vec<String>> {
        let gallery = self.inner.gallery.clone();
        tokio::task::spawn_blocking(move || gallery.installed_models())
            .await
            .map_err(|e| LocalAiError::Other(format!("Model listing task failed: {}", e)))?
    }

    pub async fn model_config(&self, name: &str) -> Result<ModelConfig> {
        let models_path = self.inner.config.models_path.clone();
        let name = name.to_string();
        tokio::task::spawn_blocking(move || ModelConfig::load_named(&models_path, &name))
            .await
            .map_err(|e| LocalAiError::Other(format!("Config read task failed: {}", e)))?
    }

    /// Start (or reuse) the backend serving `name`.
    pub async fn load_model(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<Arc<LoadedModel>> {
        self.inner.loader.load(name, cancel).await
    }

    pub async fn unload_model(&self, name: &str) -> Result<()> {
        self.inner.loader.shutdown_model(name).await
    }

    /// Status of every running backend.
    pub async fn loaded_models(&self) -> Vec<ProcessStatus> {
        self.inner.loader.status().await
    }

    /// Status of operation `id`; `None` while it waits in the queue.
    pub fn operation_status(&self, id: &str) -> Option<GalleryOpStatus> {
        self.inner.service.status(id)
    }

    pub fn operations(&self) -> HashMap<String, GalleryOpStatus> {
        self.inner.service.all_statuses()
    }

    pub fn cancel_operation(&self, id: &str) -> Result<()> {
        self.inner.service.cancel(id)
    }

    /// Elements with queued or running work, and the kind of work.
    pub fn processing_elements(&self) -> HashMap<String, TaskType> {
        let service = &self.inner.service;
        service.op_cache().task_types(|id| service.status(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gallery::ElementMetadata;

    fn model(name: &str) -> GalleryModel {
        GalleryModel {
            metadata: ElementMetadata {
                name: name.to_string(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_query_filters_sorts_and_pages() {
        let models = vec![model("phi-2"), model("llama-3"), model("bert"), model("phi-3")];

        let query = GalleryQuery {
            term: Some("phi".into()),
            sort: Some(SortField::Name),
            order: SortOrder::Desc,
            ..Default::default()
        };
        let names: Vec<_> = query.apply(models.clone()).into_iter().map(|m| m.metadata.name).collect();
        assert_eq!(names, vec!["phi-3", "phi-2"]);

        let page = GalleryQuery {
            sort: Some(SortField::Name),
            page: Some(2),
            items_per_page: Some(3),
            ..Default::default()
        };
        let names: Vec<_> = page.apply(models).into_iter().map(|m| m.metadata.name).collect();
        assert_eq!(names, vec!["phi-3"]);
    }
}
