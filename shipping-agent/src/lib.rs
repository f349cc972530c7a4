//! Shipping Agent Library
//!
//! Satellite side of snapshot backup shipping: object key grammars, the
//! backup manifest, object stores with a manifest cache, the per-volume
//! shipment pipeline and the shipping service that drives it.

pub mod config;
pub mod manifest;
pub mod naming;
pub mod pipeline;
pub mod shipping;
pub mod store;
pub mod transfer;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use utils::errors::ShipError;
pub type Result<T> = std::result::Result<T, ShipError>;
