pub mod config;
pub mod control;
pub mod downloader;
pub mod manager;
pub mod models;
pub mod naming;
pub mod progress;

/// Convenient type alias exposing common structs.
pub mod prelude {
    pub use crate::config::EngineConfig;
    pub use crate::control::TransferControl;
    pub use crate::downloader::{TransferError, Worker};
    pub use crate::manager::{Registry, RegistryError, ShutdownMode};
    pub use crate::models::{format_size, ItemId, TransferSnapshot, TransferStatus};
    pub use crate::naming::{MediaTypes, NameResolver};
    pub use crate::progress::TransferEvent;
}
