use super::{
    backup_id, grammar, parse_backup_time, push_snap_segment, snap_name_or_default,
    truncate_to_seconds, Backend, DataKey, BACKUP_PREFIX, META_SUFFIX,
};
use crate::utils::errors::{Result, ShipError};
use chrono::{DateTime, Utc};
use std::fmt;

/// Decoded manifest (`.meta`) key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ManifestKey {
    pub rsc_name: String,
    pub backup_id: String,
    pub backup_time: DateTime<Utc>,
    pub suffix: String,
    pub snap_name: String,
}

impl ManifestKey {
    pub fn new(
        rsc_name: impl Into<String>,
        backup_time: DateTime<Utc>,
        suffix: impl Into<String>,
        snap_name: &str,
    ) -> Self {
        let backup_time = truncate_to_seconds(backup_time);
        let backup_id = backup_id(&backup_time);
        let snap_name = snap_name_or_default(snap_name, &backup_id);
        Self {
            rsc_name: rsc_name.into(),
            backup_id,
            backup_time,
            suffix: suffix.into(),
            snap_name,
        }
    }

    pub fn parse(raw: &str, backend: Backend) -> Result<Self> {
        let grammar = grammar(backend);
        let caps = grammar
            .manifest
            .captures(raw)
            .ok_or_else(|| ShipError::NotABackupKey(raw.to_string()))?;

        let backup_id = caps["id"].to_string();
        let backup_time = parse_backup_time(&backup_id[BACKUP_PREFIX.len()..])
            .map_err(|_| ShipError::NotABackupKey(raw.to_string()))?;
        let suffix = caps
            .name(grammar.suffix_group)
            .map(|m| m.as_str())
            .unwrap_or_default()
            .to_string();
        let snap_name = caps.name("snap").map(|m| m.as_str()).unwrap_or_default();

        Ok(Self {
            rsc_name: caps["rsc"].to_string(),
            snap_name: snap_name_or_default(snap_name, &backup_id),
            backup_id,
            backup_time,
            suffix,
        })
    }

    /// The manifest key without its `.meta` extension. This is the id users
    /// see in listings and pass to restore.
    pub fn full_backup_id(&self) -> String {
        let mut out = format!("{}_{}{}", self.rsc_name, self.backup_id, self.suffix);
        push_snap_segment(&mut out, &self.snap_name, &self.backup_id);
        out
    }

    /// Data key of one volume belonging to this backup.
    pub fn data_key(&self, layer_suffix: &str, vlm_nr: u32) -> DataKey {
        DataKey::new(
            self.rsc_name.clone(),
            layer_suffix,
            vlm_nr,
            self.backup_time,
            self.suffix.clone(),
            &self.snap_name,
        )
    }

    /// Accepts either the full backup id or the `.meta` key.
    pub fn parse_id(id: &str, backend: Backend) -> Result<Self> {
        if id.ends_with(META_SUFFIX) {
            Self::parse(id, backend)
        } else {
            Self::parse(&format!("{}{}", id, META_SUFFIX), backend)
        }
    }
}

impl fmt::Display for ManifestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.full_backup_id(), META_SUFFIX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn jan15() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 15, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_plain_manifest_key() {
        let key = ManifestKey::parse("myrsc_back_20240115_120000.meta", Backend::S3).unwrap();
        assert_eq!(key.rsc_name, "myrsc");
        assert_eq!(key.backup_id, "back_20240115_120000");
        assert_eq!(key.backup_time, jan15());
        assert_eq!(key.suffix, "");
        assert_eq!(key.snap_name, "back_20240115_120000");
        assert_eq!(key.to_string(), "myrsc_back_20240115_120000.meta");
        assert_eq!(key.full_backup_id(), "myrsc_back_20240115_120000");
    }

    #[test]
    fn test_suffix_and_snapshot() {
        let raw = "my_rsc_back_20240115_120000:nightly^snap1.meta";
        let key = ManifestKey::parse(raw, Backend::Obs).unwrap();
        assert_eq!(key.rsc_name, "my_rsc");
        assert_eq!(key.suffix, ":nightly");
        assert_eq!(key.snap_name, "snap1");
        assert_eq!(key.to_string(), raw);
    }

    #[test]
    fn test_snapshot_without_suffix() {
        let key = ManifestKey::parse("rsc_back_20240115_120000^snap.meta", Backend::S3).unwrap();
        assert_eq!(key.suffix, "");
        assert_eq!(key.snap_name, "snap");
    }

    #[test]
    fn test_snapshot_equal_to_backup_id_is_omitted() {
        let key = ManifestKey::new("rsc", jan15(), "", "back_20240115_120000");
        assert_eq!(key.to_string(), "rsc_back_20240115_120000.meta");
        let key = ManifestKey::new("rsc", jan15(), "", "");
        assert_eq!(key.snap_name, "back_20240115_120000");
    }

    #[test]
    fn test_rejects_non_manifest_keys() {
        for raw in [
            "myrsc_00000_back_20240115_120000",
            "myrsc_back_20240115_120000",
            "x_back_20240115_120000.meta",
            "myrsc_back_2024011_120000.meta",
            "myrsc_back_20241315_120000.meta",
            "random/object.txt",
        ] {
            assert!(
                ManifestKey::parse(raw, Backend::S3).is_err(),
                "{raw} should not parse"
            );
        }
    }

    #[test]
    fn test_data_key_derivation() {
        let key = ManifestKey::new("rsc", jan15(), "-x", "snap");
        assert_eq!(
            key.data_key(".drbd", 3).to_string(),
            "rsc.drbd_00003_back_20240115_120000-x^snap"
        );
    }

    #[test]
    fn test_parse_id_accepts_both_forms() {
        let a = ManifestKey::parse_id("rsc_back_20240115_120000", Backend::S3).unwrap();
        let b = ManifestKey::parse_id("rsc_back_20240115_120000.meta", Backend::S3).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_roundtrip_both_backends() {
        let rscs = ["ab", "my-rsc", "rsc_with_underscores", "R0123456789"];
        let suffixes = ["", ":s3", "-nightly", ".v2"];
        let snaps = ["", "snap", "snap.with.dots", "back_20240115_120000"];
        for backend in [Backend::S3, Backend::Obs] {
            for rsc in rscs {
                for suffix in suffixes {
                    for snap in snaps {
                        let key = ManifestKey::new(rsc, jan15(), suffix, snap);
                        let parsed = ManifestKey::parse(&key.to_string(), backend).unwrap();
                        assert_eq!(parsed, key, "backend {backend}, key {key}");
                    }
                }
            }
        }
    }
}
