//! API implementation submodules.
//!
//! Each submodule contains `impl LocalAiApi` blocks that extend the public API
//! with domain-specific methods. The struct definition remains in `lib.rs`.

mod backends;
mod builder;
mod models;
mod network;
mod state;
mod system;

pub use builder::LocalAiApiBuilder;
pub use models::GalleryQuery;
pub(crate) use state::ApiState;
pub use system::SystemInfo;
