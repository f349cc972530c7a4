use shipping_agent::naming::Backend;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub log_level: String,
    pub cluster_id: String,
    /// Buckets live as directories below this root.
    pub store_root: PathBuf,
    pub listing_timeout: Duration,
    pub peer_timeout: Duration,
    pub remote_name: String,
    pub backend: Backend,
    pub master_key: Option<String>,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any variable source; unset or unparsable values fall back
    /// to their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            log_level: lookup("LOG_LEVEL").unwrap_or_else(|| "info".into()),
            cluster_id: lookup("CLUSTER_ID").unwrap_or_else(|| "local-cluster".into()),
            store_root: PathBuf::from(
                lookup("STORE_ROOT").unwrap_or_else(|| "/var/lib/shipping/store".into()),
            ),
            listing_timeout: Duration::from_secs(
                lookup("LISTING_TIMEOUT_SECS")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(5),
            ),
            peer_timeout: Duration::from_millis(
                lookup("PEER_TIMEOUT_MS")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(30_000),
            ),
            remote_name: lookup("REMOTE_NAME").unwrap_or_else(|| "local".into()),
            backend: lookup("BACKEND")
                .and_then(|v| v.parse().ok())
                .unwrap_or(Backend::S3),
            master_key: lookup("MASTER_KEY").filter(|k| !k.is_empty()),
        }
    }
}
