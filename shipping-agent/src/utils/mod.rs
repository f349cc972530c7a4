//! Utility modules for the shipping agent.

pub mod errors;
pub mod logger;

pub use errors::{Result, ShipError};
