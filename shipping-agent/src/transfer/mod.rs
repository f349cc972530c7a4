//! Transfer accounting shared by the send and restore pumps.

pub mod throughput;

pub use throughput::{format_bytes, format_duration, format_speed, Throughput};
