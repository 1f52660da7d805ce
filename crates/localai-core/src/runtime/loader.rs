//! Single-flight model loading and per-model request serialisation.

use super::process::{BackendProcess, LaunchSpec, ReadinessProbe, TcpProbe};
use super::registry::BackendRegistry;
use super::watchdog::{collect_expired, lru_victim, ActivitySnapshot};
use super::{ProcessState, ProcessStatus, RuntimeOptions};
use crate::cancel::CancellationToken;
use crate::error::{LocalAiError, Result};
use crate::gallery::ModelConfig;
use crate::job::JobResult;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

#[derive(Debug)]
struct Activity {
    state: ProcessState,
    in_flight: usize,
    last_used: Instant,
    last_used_at: DateTime<Utc>,
    request_started: Option<(Instant, DateTime<Utc>)>,
}

/// A model whose backend is running.
#[derive(Debug)]
pub struct LoadedModel {
    name: String,
    backend: String,
    process: BackendProcess,
    permits: Arc<Semaphore>,
    parallelism: u32,
    activity: Mutex<Activity>,
}

impl LoadedModel {
    fn new(name: String, backend: String, process: BackendProcess, parallelism: u32) -> Self {
        Self {
            name,
            backend,
            process,
            permits: Arc::new(Semaphore::new(parallelism as usize)),
            parallelism,
            activity: Mutex::new(Activity {
                state: ProcessState::Ready,
                in_flight: 0,
                last_used: Instant::now(),
                last_used_at: Utc::now(),
                request_started: None,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn backend(&self) -> &str {
        &self.backend
    }

    /// `host:port` the backend listens on.
    pub fn address(&self) -> &str {
        self.process.address()
    }

    pub fn process(&self) -> &BackendProcess {
        &self.process
    }

    /// Concurrent requests allowed against this backend.
    pub fn parallelism(&self) -> u32 {
        self.parallelism
    }

    pub fn state(&self) -> ProcessState {
        if self.process.exited().is_some() {
            let state = self.activity().state;
            return if state == ProcessState::Stopped {
                state
            } else {
                ProcessState::Failed
            };
        }
        self.activity().state
    }

    pub fn status(&self) -> ProcessStatus {
        let state = self.state();
        let activity = self.activity();
        ProcessStatus {
            name: self.name.clone(),
            backend: self.backend.clone(),
            pid: self.process.pid(),
            address: Some(self.process.address().to_string()),
            state,
            last_used: Some(activity.last_used_at),
            last_request_started: activity.request_started.map(|(_, at)| at),
        }
    }

    fn snapshot(&self) -> ActivitySnapshot {
        let state = self.state();
        let activity = self.activity();
        ActivitySnapshot {
            name: self.name.clone(),
            state,
            last_used: activity.last_used,
            request_started: activity.request_started.map(|(at, _)| at),
        }
    }

    fn begin_request(&self) {
        let mut activity = self.activity();
        activity.in_flight += 1;
        activity.state = ProcessState::Busy;
        if activity.request_started.is_none() {
            activity.request_started = Some((Instant::now(), Utc::now()));
        }
    }

    fn end_request(&self) {
        let mut activity = self.activity();
        activity.in_flight = activity.in_flight.saturating_sub(1);
        activity.last_used = Instant::now();
        activity.last_used_at = Utc::now();
        if activity.in_flight == 0 {
            activity.request_started = None;
            if activity.state == ProcessState::Busy {
                activity.state = ProcessState::Idle;
            }
        }
    }

    fn mark_stopped(&self) {
        self.activity().state = ProcessState::Stopped;
    }

    fn activity(&self) -> std::sync::MutexGuard<'_, Activity> {
        self.activity.lock().unwrap_or_else(|e| e.into_inner())
    }
}

type LoadOutcome = std::result::Result<Arc<LoadedModel>, Arc<LocalAiError>>;

enum Slot {
    /// Startup in progress; the job carries the backend name.
    Loading(Arc<JobResult<String, LoadOutcome>>),
    Ready(Arc<LoadedModel>),
}

struct Inner {
    models_path: PathBuf,
    registry: BackendRegistry,
    options: RuntimeOptions,
    probe: Arc<dyn ReadinessProbe>,
    slots: tokio::sync::Mutex<HashMap<String, Slot>>,
    backend_env: RwLock<HashMap<String, String>>,
    shutdown: CancellationToken,
    spawned: AtomicUsize,
}

/// Owns every running backend.
///
/// Cheap to clone; all clones share the same set of processes.
#[derive(Clone)]
pub struct ModelLoader {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ModelLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelLoader")
            .field("models_path", &self.inner.models_path)
            .finish_non_exhaustive()
    }
}

impl ModelLoader {
    pub fn new(
        models_path: impl Into<PathBuf>,
        registry: BackendRegistry,
        options: RuntimeOptions,
    ) -> Self {
        Self::with_probe(models_path, registry, options, Arc::new(TcpProbe))
    }

    pub fn with_probe(
        models_path: impl Into<PathBuf>,
        registry: BackendRegistry,
        options: RuntimeOptions,
        probe: Arc<dyn ReadinessProbe>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                models_path: models_path.into(),
                registry,
                options,
                probe,
                slots: tokio::sync::Mutex::new(HashMap::new()),
                backend_env: RwLock::new(HashMap::new()),
                shutdown: CancellationToken::new(),
                spawned: AtomicUsize::new(0),
            }),
        }
    }

    pub fn registry(&self) -> &BackendRegistry {
        &self.inner.registry
    }

    pub fn options(&self) -> &RuntimeOptions {
        &self.inner.options
    }

    pub fn models_path(&self) -> &Path {
        &self.inner.models_path
    }

    /// Number of backend processes started so far.
    pub fn spawn_count(&self) -> usize {
        self.inner.spawned.load(Ordering::SeqCst)
    }

    /// Set an environment variable for backends started from now on.
    pub fn set_backend_env(&self, key: impl Into<String>, value: impl Into<String>) {
        let mut env = self.inner.backend_env.write().unwrap_or_else(|e| e.into_inner());
        env.insert(key.into(), value.into());
    }

    /// Load an installed model using the backend named in its config.
    pub async fn load(&self, model: &str, cancel: &CancellationToken) -> Result<Arc<LoadedModel>> {
        let models_path = self.inner.models_path.clone();
        let name = model.to_string();
        let config = tokio::task::spawn_blocking(move || ModelConfig::load_named(&models_path, &name))
            .await
            .map_err(|e| LocalAiError::Other(format!("Config load task failed: {}", e)))??;
        let backend = config.backend.clone().ok_or_else(|| LocalAiError::Validation {
            field: "backend".to_string(),
            message: format!("model {} does not name a backend", model),
        })?;
        let parallelism = config.parallelism.unwrap_or(1);
        self.load_backend(model, &backend, parallelism, cancel).await
    }

    /// Return the running backend for `model`, starting `backend` if needed.
    ///
    /// Concurrent callers for the same model share one startup. Cancelling
    /// the caller that started it aborts the startup for everyone.
    pub async fn load_backend(
        &self,
        model: &str,
        backend: &str,
        parallelism: usize,
        cancel: &CancellationToken,
    ) -> Result<Arc<LoadedModel>> {
        if self.inner.shutdown.is_cancelled() {
            return Err(LocalAiError::BackendUnavailable {
                model: model.to_string(),
            });
        }

        let (job, startup) = {
            let mut slots = self.inner.slots.lock().await;
            let pending = match slots.get(model) {
                Some(Slot::Ready(loaded)) if loaded.process.exited().is_none() => {
                    return Ok(loaded.clone());
                }
                Some(Slot::Loading(job)) => Some(job.clone()),
                Some(Slot::Ready(_)) => {
                    debug!(model = %model, "Backend exited while idle, reloading");
                    None
                }
                None => None,
            };
            match pending {
                Some(job) => (job, None),
                None => {
                    let job = Arc::new(JobResult::new(backend.to_string()));
                    slots.insert(model.to_string(), Slot::Loading(job.clone()));
                    let startup = self.inner.shutdown.child_token();
                    self.spawn_startup(model, backend, parallelism, job.clone(), startup.clone());
                    (job, Some(startup))
                }
            }
        };

        match job.wait(cancel).await {
            Ok(Ok(loaded)) => Ok(loaded),
            Ok(Err(e)) => Err(shared_error(model, &e)),
            Err(_) => {
                if let Some(startup) = startup {
                    startup.cancel();
                }
                Err(LocalAiError::Cancelled)
            }
        }
    }

    fn spawn_startup(
        &self,
        model: &str,
        backend: &str,
        parallelism: usize,
        job: Arc<JobResult<String, LoadOutcome>>,
        cancel: CancellationToken,
    ) {
        let loader = self.clone();
        let model = model.to_string();
        let backend = backend.to_string();
        tokio::spawn(async move {
            let outcome = loader
                .start_backend(&model, &backend, parallelism, &cancel)
                .await
                .map_err(Arc::new);

            {
                let mut slots = loader.inner.slots.lock().await;
                let ours = matches!(slots.get(&model), Some(Slot::Loading(j)) if Arc::ptr_eq(j, &job));
                match &outcome {
                    Ok(loaded) if ours && !loader.inner.shutdown.is_cancelled() => {
                        slots.insert(model.clone(), Slot::Ready(loaded.clone()));
                    }
                    _ if ours => {
                        slots.remove(&model);
                    }
                    _ => {}
                }
            }

            if let Err(e) = &outcome {
                warn!(model = %model, "Failed to load model: {}", e);
            }
            let _ = job.set_result(outcome);
        });
    }

    async fn start_backend(
        &self,
        model: &str,
        backend: &str,
        parallelism: usize,
        cancel: &CancellationToken,
    ) -> Result<Arc<LoadedModel>> {
        let command = self
            .inner
            .registry
            .get(backend)
            .ok_or_else(|| LocalAiError::BackendNotFound {
                name: backend.to_string(),
            })?;

        self.make_room(model).await;

        let options = &self.inner.options;
        let mut spec = LaunchSpec::new(model, command)
            .with_ready_timeout(options.ready_timeout)
            .with_ready_poll_interval(options.ready_poll_interval);
        {
            let env = self.inner.backend_env.read().unwrap_or_else(|e| e.into_inner());
            for (key, value) in env.iter() {
                spec = spec.with_env(key.clone(), value.clone());
            }
        }

        info!(model = %model, backend = %backend, "Loading model");
        self.inner.spawned.fetch_add(1, Ordering::SeqCst);
        let process = BackendProcess::launch(&spec, self.inner.probe.as_ref(), cancel).await?;

        let permits = if options.parallel_requests {
            u32::try_from(parallelism.max(1)).unwrap_or(u32::MAX)
        } else {
            1
        };
        Ok(Arc::new(LoadedModel::new(
            model.to_string(),
            backend.to_string(),
            process,
            permits,
        )))
    }

    /// Load `model` and run `f` against it while holding a request slot.
    ///
    /// Fails with [`LocalAiError::BackendDied`] if the backend exits before
    /// `f` completes.
    pub async fn request<F, Fut, T>(&self, model: &str, cancel: &CancellationToken, f: F) -> Result<T>
    where
        F: FnOnce(Arc<LoadedModel>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let loaded = self.load(model, cancel).await?;
        self.request_loaded(loaded, cancel, f).await
    }

    /// Like [`Self::request`] for an already loaded model.
    pub async fn request_loaded<F, Fut, T>(
        &self,
        loaded: Arc<LoadedModel>,
        cancel: &CancellationToken,
        f: F,
    ) -> Result<T>
    where
        F: FnOnce(Arc<LoadedModel>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let unavailable = || LocalAiError::BackendUnavailable {
            model: loaded.name.clone(),
        };
        let _permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(LocalAiError::Cancelled),
            permit = loaded.permits.clone().acquire_owned() => permit.map_err(|_| unavailable())?,
        };
        if loaded.process.exited().is_some() {
            self.forget(&loaded).await;
            return Err(unavailable());
        }

        loaded.begin_request();
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(LocalAiError::Cancelled),
            info = loaded.process.wait_exit() => Err(LocalAiError::BackendDied {
                model: loaded.name.clone(),
                message: info.message,
            }),
            result = f(loaded.clone()) => result,
        };
        loaded.end_request();

        if loaded.process.exited().is_some() {
            self.forget(&loaded).await;
        }
        outcome
    }

    /// Snapshot of every loading or loaded model, sorted by name.
    pub async fn status(&self) -> Vec<ProcessStatus> {
        let slots = self.inner.slots.lock().await;
        let mut statuses: Vec<ProcessStatus> = slots
            .iter()
            .map(|(name, slot)| match slot {
                Slot::Ready(loaded) => loaded.status(),
                Slot::Loading(job) => ProcessStatus {
                    name: name.clone(),
                    backend: job.request().clone(),
                    pid: None,
                    address: None,
                    state: ProcessState::Loading,
                    last_used: None,
                    last_request_started: None,
                },
            })
            .collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    /// The running backend for `model`, if any.
    pub async fn get(&self, model: &str) -> Option<Arc<LoadedModel>> {
        match self.inner.slots.lock().await.get(model) {
            Some(Slot::Ready(loaded)) => Some(loaded.clone()),
            _ => None,
        }
    }

    /// Stop `model` once its in-flight requests finish.
    ///
    /// Waits at most the watchdog busy timeout before stopping anyway.
    pub async fn shutdown_model(&self, model: &str) -> Result<()> {
        let loaded = self.get(model).await.ok_or_else(|| LocalAiError::ModelNotFound {
            name: model.to_string(),
        })?;

        let busy_timeout = self.inner.options.watchdog.busy_timeout;
        match tokio::time::timeout(busy_timeout, loaded.permits.acquire_many(loaded.parallelism)).await {
            Ok(Ok(permits)) => permits.forget(),
            Ok(Err(_)) => {}
            Err(_) => warn!(model = %model, "Requests still running after {:?}, stopping anyway", busy_timeout),
        }
        self.stop_loaded(&loaded).await;
        Ok(())
    }

    /// Stop `model` immediately. In-flight requests fail.
    ///
    /// Returns `false` if the model was not loaded. Loading models are left alone.
    pub async fn evict(&self, model: &str) -> bool {
        match self.get(model).await {
            Some(loaded) => {
                self.stop_loaded(&loaded).await;
                true
            }
            None => false,
        }
    }

    /// Stop every backend and refuse further loads.
    pub async fn stop_all(&self) {
        self.inner.shutdown.cancel();
        let loaded: Vec<Arc<LoadedModel>> = {
            let mut slots = self.inner.slots.lock().await;
            slots
                .drain()
                .filter_map(|(_, slot)| match slot {
                    Slot::Ready(loaded) => Some(loaded),
                    Slot::Loading(_) => None,
                })
                .collect()
        };
        let grace = self.inner.options.stop_grace_period;
        futures::future::join_all(loaded.iter().map(|m| {
            m.permits.close();
            m.mark_stopped();
            m.process.stop(grace)
        }))
        .await;
        info!("Stopped {} backends", loaded.len());
    }

    /// Run the watchdog until `cancel` fires or the loader is dropped.
    ///
    /// Returns `None` when neither idle nor busy checks are enabled.
    pub fn start_watchdog(&self, cancel: CancellationToken) -> Option<JoinHandle<()>> {
        let options = self.inner.options.watchdog.clone();
        if !options.is_enabled() {
            return None;
        }

        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(options.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await;
            debug!("Watchdog running every {:?}", options.interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                ModelLoader { inner }.watchdog_pass().await;
            }
            debug!("Watchdog stopped");
        }))
    }

    /// Evict every backend the watchdog policy marks as expired.
    pub async fn watchdog_pass(&self) -> Vec<String> {
        let snapshots = self.snapshots(None).await;
        let expired = collect_expired(&self.inner.options.watchdog, &snapshots, Instant::now());
        for name in &expired {
            info!(model = %name, "Watchdog evicting backend");
            self.evict(name).await;
        }
        expired
    }

    async fn snapshots(&self, except: Option<&str>) -> Vec<ActivitySnapshot> {
        let slots = self.inner.slots.lock().await;
        slots
            .iter()
            .filter(|(name, _)| Some(name.as_str()) != except)
            .filter_map(|(_, slot)| match slot {
                Slot::Ready(loaded) => Some(loaded.snapshot()),
                Slot::Loading(_) => None,
            })
            .collect()
    }

    /// Evict least-recently-used backends until `model` fits under the limit.
    async fn make_room(&self, model: &str) {
        let limit = self.inner.options.watchdog.lru_limit;
        if limit == 0 {
            return;
        }
        loop {
            let others = {
                let slots = self.inner.slots.lock().await;
                slots.keys().filter(|name| name.as_str() != model).count()
            };
            if others < limit {
                return;
            }
            let snapshots = self.snapshots(Some(model)).await;
            match lru_victim(&self.inner.options.watchdog, &snapshots) {
                Some(victim) => {
                    info!(model = %victim, "Evicting to stay within {} loaded models", limit);
                    self.evict(&victim).await;
                }
                None => {
                    warn!(model = %model, "Model limit {} reached but nothing can be evicted", limit);
                    return;
                }
            }
        }
    }

    async fn stop_loaded(&self, loaded: &Arc<LoadedModel>) {
        self.forget(loaded).await;
        loaded.permits.close();
        loaded.mark_stopped();
        loaded.process.stop(self.inner.options.stop_grace_period).await;
    }

    /// Drop the registry entry if it still refers to `loaded`.
    async fn forget(&self, loaded: &Arc<LoadedModel>) {
        let mut slots = self.inner.slots.lock().await;
        if matches!(slots.get(&loaded.name), Some(Slot::Ready(m)) if Arc::ptr_eq(m, loaded)) {
            slots.remove(&loaded.name);
        }
    }
}

/// Rebuild an error published to several waiters.
fn shared_error(model: &str, err: &LocalAiError) -> LocalAiError {
    match err {
        LocalAiError::Cancelled => LocalAiError::Cancelled,
        LocalAiError::LaunchFailed { model, message } => LocalAiError::LaunchFailed {
            model: model.clone(),
            message: message.clone(),
        },
        LocalAiError::BackendNotFound { name } => LocalAiError::BackendNotFound { name: name.clone() },
        LocalAiError::BackendUnavailable { model } => LocalAiError::BackendUnavailable {
            model: model.clone(),
        },
        other => LocalAiError::LaunchFailed {
            model: model.to_string(),
            message: other.to_string(),
        },
    }
}
