//! Long-running services built on the gallery and runtime.

mod gallery;
mod operation;

pub use gallery::{GalleryService, ServiceOptions};
pub use operation::{GalleryOp, GalleryOpStatus, OpAction, OpCache, TaskType};
