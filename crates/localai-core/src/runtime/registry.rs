//! Backend name to executable mapping.

use crate::config::PathsConfig;
use crate::gallery::SystemBackends;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

/// How to start a backend: a program, its leading arguments and working dir.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub work_dir: Option<PathBuf>,
}

impl BackendCommand {
    /// Command for an installed backend's `run.sh`, run from its directory.
    pub fn run_file(path: impl Into<PathBuf>) -> Self {
        let program = path.into();
        let work_dir = program.parent().map(Path::to_path_buf);
        Self {
            program,
            args: Vec::new(),
            work_dir,
        }
    }

    /// Parse a whitespace-separated command line. Returns `None` when empty.
    pub fn parse(command: &str) -> Option<Self> {
        let mut parts = command.split_whitespace();
        let program = PathBuf::from(parts.next()?);
        Some(Self {
            args: parts.map(str::to_string).collect(),
            work_dir: None,
            program,
        })
    }

    /// Directory whose `lib/` is put on the library path.
    pub fn lib_dir(&self) -> Option<PathBuf> {
        self.work_dir
            .as_ref()
            .map(|dir| dir.join(PathsConfig::LIB_DIR))
    }
}

/// Registered backends, keyed by concrete name or alias.
#[derive(Debug, Clone, Default)]
pub struct BackendRegistry {
    entries: Arc<RwLock<HashMap<String, BackendCommand>>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: impl Into<String>, command: BackendCommand) {
        let name = name.into();
        debug!(backend = %name, "Registered backend {}", command.program.display());
        self.write().insert(name, command);
    }

    pub fn register_run_file(&self, name: impl Into<String>, run_file: impl Into<PathBuf>) {
        self.register(name, BackendCommand::run_file(run_file));
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.write().remove(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<BackendCommand> {
        self.read().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Register every backend found on disk, replacing earlier disk entries.
    pub fn register_system_backends(&self, backends: &SystemBackends) {
        let mut entries = self.write();
        for (name, backend) in backends.iter() {
            entries.insert(name.clone(), BackendCommand::run_file(&backend.run_file));
        }
    }

    /// Register command strings such as those in `external_backends.json`.
    pub fn register_external(&self, commands: &HashMap<String, String>) {
        for (name, command) in commands {
            match BackendCommand::parse(command) {
                Some(parsed) => self.register(name.clone(), parsed),
                None => warn!("Ignoring external backend {} with empty command", name),
            }
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, BackendCommand>> {
        self.entries.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, BackendCommand>> {
        self.entries.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_command_line() {
        let cmd = BackendCommand::parse("  /opt/vllm/run.sh --flag  value ").unwrap();
        assert_eq!(cmd.program, PathBuf::from("/opt/vllm/run.sh"));
        assert_eq!(cmd.args, vec!["--flag", "value"]);
        assert!(cmd.work_dir.is_none());
        assert!(BackendCommand::parse("   ").is_none());
    }

    #[test]
    fn test_run_file_uses_backend_dir() {
        let cmd = BackendCommand::run_file("/backends/cpu-llama/run.sh");
        assert_eq!(cmd.work_dir, Some(PathBuf::from("/backends/cpu-llama")));
        assert_eq!(cmd.lib_dir(), Some(PathBuf::from("/backends/cpu-llama/lib")));
    }

    #[test]
    fn test_register_and_unregister() {
        let registry = BackendRegistry::new();
        registry.register_run_file("llama-cpp", "/b/llama-cpp/run.sh");
        let mut external = HashMap::new();
        external.insert("remote".to_string(), "/usr/bin/remote-backend --port".to_string());
        external.insert("broken".to_string(), "".to_string());
        registry.register_external(&external);

        assert_eq!(registry.names(), vec!["llama-cpp", "remote"]);
        assert_eq!(registry.get("remote").unwrap().args, vec!["--port"]);
        assert!(registry.unregister("llama-cpp"));
        assert!(!registry.unregister("llama-cpp"));
        assert!(registry.get("llama-cpp").is_none());
    }
}
