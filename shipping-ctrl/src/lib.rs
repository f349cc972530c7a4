//! Shipping Controller Library
//!
//! Controller side of snapshot backup shipping: listing, inspecting and
//! deleting backups on a remote, and the shipping flag state machine of
//! snapshot definitions.

pub mod backup;
pub mod cluster;
pub mod config;
pub mod error;
pub mod model;
pub mod remotes;
pub mod shipping;

pub use backup::BackupService;
pub use config::AppConfig;
pub use error::{CtrlError, Result};
pub use shipping::ShippingController;
