//! State owned by a running instance.

use crate::cancel::CancellationToken;
use crate::config::ApplicationConfig;
use crate::gallery::Gallery;
use crate::p2p::P2pNetwork;
use crate::runtime::ModelLoader;
use crate::services::GalleryService;
use crate::system::SystemState;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Every subsystem of a [`crate::LocalAiApi`], shared by its clones.
pub(crate) struct ApiState {
    pub(crate) config: ApplicationConfig,
    pub(crate) system: Arc<SystemState>,
    pub(crate) gallery: Gallery,
    pub(crate) loader: ModelLoader,
    pub(crate) service: GalleryService,
    pub(crate) p2p: Option<P2pNetwork>,
    /// Parent of every background task.
    pub(crate) cancel: CancellationToken,
    /// Gallery worker and watchdog, joined on shutdown.
    pub(crate) tasks: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}
