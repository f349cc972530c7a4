//! Byte counting and human-readable throughput for one shipment.

use std::time::{Duration, Instant};

/// Bytes moved through one pump, with the time it took.
#[derive(Debug, Clone)]
pub struct Throughput {
    start_time: Instant,
    bytes: u64,
    parts: u32,
}

impl Throughput {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            bytes: 0,
            parts: 0,
        }
    }

    pub fn add(&mut self, bytes: usize) {
        self.bytes += bytes as u64;
    }

    pub fn add_part(&mut self, bytes: usize) {
        self.add(bytes);
        self.parts += 1;
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn parts(&self) -> u32 {
        self.parts
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Average speed since start in bytes/second
    pub fn average_speed(&self) -> u64 {
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            (self.bytes as f64 / elapsed) as u64
        } else {
            0
        }
    }

    /// One-line summary for the completion log.
    pub fn summary(&self) -> String {
        format!(
            "{} in {} ({})",
            format_bytes(self.bytes),
            format_duration(self.elapsed().as_secs()),
            format_speed(self.average_speed())
        )
    }
}

impl Default for Throughput {
    fn default() -> Self {
        Self::new()
    }
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}

pub fn format_speed(bytes_per_second: u64) -> String {
    format!("{}/s", format_bytes(bytes_per_second))
}

pub fn format_duration(seconds: u64) -> String {
    if seconds < 60 {
        format!("{}s", seconds)
    } else if seconds < 3600 {
        format!("{}m {}s", seconds / 60, seconds % 60)
    } else {
        format!("{}h {}m", seconds / 3600, (seconds % 3600) / 60)
    }
}
