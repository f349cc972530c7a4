//! Object key grammars for backups.
//!
//! Every backup is described by two kinds of keys in the bucket:
//! - a manifest key `{rsc}_back_{YYYYMMDD}_{HHMMSS}{suffix}[^{snap}].meta`
//! - one data key per volume `{rsc}{layer}_{vlmNr:05}_back_{YYYYMMDD}_{HHMMSS}{suffix}[^{snap}]`
//!
//! The snapshot segment is omitted whenever the snapshot name equals the
//! backup id. `^` is reserved as the snapshot separator and is never escaped.

pub mod data_key;
pub mod manifest_key;

pub use data_key::DataKey;
pub use manifest_key::ManifestKey;

use crate::utils::errors::{Result, ShipError};
use chrono::{DateTime, NaiveDateTime, Timelike, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

pub const BACKUP_PREFIX: &str = "back_";
pub const SNAP_NAME_SEPARATOR: char = '^';
pub const META_SUFFIX: &str = ".meta";
pub const BACKUP_TIME_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Object store flavour a remote talks to. Both flavours share the key
/// layout but each has its own compiled grammar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    S3,
    Obs,
}

impl Backend {
    /// Name of the snapshot-definition property holding the backend suffix.
    pub fn suffix_prop(self) -> &'static str {
        match self {
            Backend::S3 => "s3Suffix",
            Backend::Obs => "obsSuffix",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::S3 => write!(f, "s3"),
            Backend::Obs => write!(f, "obs"),
        }
    }
}

impl FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "s3" => Ok(Backend::S3),
            "obs" => Ok(Backend::Obs),
            other => Err(format!("unknown backend '{other}' (expected s3 or obs)")),
        }
    }
}

pub(crate) struct Grammar {
    pub(crate) manifest: Regex,
    pub(crate) data: Regex,
    pub(crate) suffix_group: &'static str,
}

impl Grammar {
    fn compile(suffix_group: &'static str) -> Self {
        // The suffix is the longest run before the first separator, so a
        // non-empty suffix always wins over an empty one.
        let manifest = format!(
            r"^(?P<rsc>[a-zA-Z0-9_-]{{2,48}})_(?P<id>back_[0-9]{{8}}_[0-9]{{6}})(?P<{g}>[^\^]*)(?:\^(?P<snap>.*))?\.meta$",
            g = suffix_group
        );
        let data = format!(
            r"^(?P<rsc>[a-zA-Z0-9_-]{{2,48}})(?P<layer>\..+)?_(?P<vlm>[0-9]{{5}})_(?P<id>back_[0-9]{{8}}_[0-9]{{6}})(?P<{g}>[^\^]*)(?:\^(?P<snap>.*))?$",
            g = suffix_group
        );
        Self {
            manifest: Regex::new(&manifest).expect("valid static regex"),
            data: Regex::new(&data).expect("valid static regex"),
            suffix_group,
        }
    }
}

pub(crate) fn grammar(backend: Backend) -> &'static Grammar {
    static S3: OnceLock<Grammar> = OnceLock::new();
    static OBS: OnceLock<Grammar> = OnceLock::new();
    match backend {
        Backend::S3 => S3.get_or_init(|| Grammar::compile("s3_suffix")),
        Backend::Obs => OBS.get_or_init(|| Grammar::compile("obs_suffix")),
    }
}

/// Format a backup time as `YYYYMMDD_HHMMSS`.
pub fn format_backup_time(time: &DateTime<Utc>) -> String {
    time.format(BACKUP_TIME_FORMAT).to_string()
}

/// Parse a `YYYYMMDD_HHMMSS` timestamp (interpreted as UTC).
pub fn parse_backup_time(raw: &str) -> Result<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(raw, BACKUP_TIME_FORMAT)
        .map(|naive| naive.and_utc())
        .map_err(|_| ShipError::InvalidTimestamp(raw.to_string()))
}

/// `back_` + formatted time.
pub fn backup_id(time: &DateTime<Utc>) -> String {
    format!("{}{}", BACKUP_PREFIX, format_backup_time(time))
}

/// Keys only carry whole seconds.
pub(crate) fn truncate_to_seconds(time: DateTime<Utc>) -> DateTime<Utc> {
    time.with_nanosecond(0).unwrap_or(time)
}

/// Resolve the implicit snapshot name: empty means "same as backup id".
pub(crate) fn snap_name_or_default(snap_name: &str, backup_id: &str) -> String {
    if snap_name.is_empty() {
        backup_id.to_string()
    } else {
        snap_name.to_string()
    }
}

pub(crate) fn push_snap_segment(out: &mut String, snap_name: &str, backup_id: &str) {
    if !snap_name.is_empty() && snap_name != backup_id {
        out.push(SNAP_NAME_SEPARATOR);
        out.push_str(snap_name);
    }
}
