use super::{
    backup_id, grammar, parse_backup_time, push_snap_segment, snap_name_or_default,
    truncate_to_seconds, Backend, ManifestKey, BACKUP_PREFIX,
};
use crate::utils::errors::{Result, ShipError};
use chrono::{DateTime, Utc};
use std::fmt;

/// Decoded per-volume data key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DataKey {
    pub rsc_name: String,
    pub layer_suffix: String,
    pub vlm_nr: u32,
    pub backup_id: String,
    pub backup_time: DateTime<Utc>,
    pub suffix: String,
    pub snap_name: String,
}

impl DataKey {
    pub fn new(
        rsc_name: impl Into<String>,
        layer_suffix: impl Into<String>,
        vlm_nr: u32,
        backup_time: DateTime<Utc>,
        suffix: impl Into<String>,
        snap_name: &str,
    ) -> Self {
        let backup_time = truncate_to_seconds(backup_time);
        let backup_id = backup_id(&backup_time);
        let snap_name = snap_name_or_default(snap_name, &backup_id);
        Self {
            rsc_name: rsc_name.into(),
            layer_suffix: layer_suffix.into(),
            vlm_nr,
            backup_id,
            backup_time,
            suffix: suffix.into(),
            snap_name,
        }
    }

    pub fn parse(raw: &str, backend: Backend) -> Result<Self> {
        let grammar = grammar(backend);
        let caps = grammar
            .data
            .captures(raw)
            .ok_or_else(|| ShipError::NotABackupKey(raw.to_string()))?;

        let not_a_key = || ShipError::NotABackupKey(raw.to_string());
        let backup_id = caps["id"].to_string();
        let backup_time =
            parse_backup_time(&backup_id[BACKUP_PREFIX.len()..]).map_err(|_| not_a_key())?;
        let vlm_nr = caps["vlm"].parse::<u32>().map_err(|_| not_a_key())?;
        let layer_suffix = caps.name("layer").map(|m| m.as_str()).unwrap_or_default();
        let suffix = caps
            .name(grammar.suffix_group)
            .map(|m| m.as_str())
            .unwrap_or_default();
        let snap_name = caps.name("snap").map(|m| m.as_str()).unwrap_or_default();

        Ok(Self {
            rsc_name: caps["rsc"].to_string(),
            layer_suffix: layer_suffix.to_string(),
            vlm_nr,
            snap_name: snap_name_or_default(snap_name, &backup_id),
            backup_id,
            backup_time,
            suffix: suffix.to_string(),
        })
    }

    /// Manifest key of the backup this volume belongs to.
    pub fn manifest_key(&self) -> ManifestKey {
        ManifestKey::new(
            self.rsc_name.clone(),
            self.backup_time,
            self.suffix.clone(),
            &self.snap_name,
        )
    }

    /// Two data keys belong to the same backup when resource and backup id match.
    pub fn same_backup(&self, other: &DataKey) -> bool {
        self.rsc_name == other.rsc_name && self.backup_id == other.backup_id
    }
}

impl fmt::Display for DataKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = format!(
            "{}{}_{:05}_{}{}",
            self.rsc_name, self.layer_suffix, self.vlm_nr, self.backup_id, self.suffix
        );
        push_snap_segment(&mut out, &self.snap_name, &self.backup_id);
        f.write_str(&out)
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
    fn test_plain_data_key() {
        let key = DataKey::parse("myrsc_00000_back_20240115_120000", Backend::S3).unwrap();
        assert_eq!(key.rsc_name, "myrsc");
        assert_eq!(key.layer_suffix, "");
        assert_eq!(key.vlm_nr, 0);
        assert_eq!(key.backup_id, "back_20240115_120000");
        assert_eq!(key.snap_name, key.backup_id);
        assert_eq!(key.to_string(), "myrsc_00000_back_20240115_120000");
    }

    #[test]
    fn test_layer_suffix_and_snapshot() {
        let raw = "db.drbd_00012_back_20240115_120000:x^snap2";
        let key = DataKey::parse(raw, Backend::Obs).unwrap();
        assert_eq!(key.rsc_name, "db");
        assert_eq!(key.layer_suffix, ".drbd");
        assert_eq!(key.vlm_nr, 12);
        assert_eq!(key.suffix, ":x");
        assert_eq!(key.snap_name, "snap2");
        assert_eq!(key.to_string(), raw);
    }

    #[test]
    fn test_rejects_manifest_and_foreign_keys() {
        for raw in [
            "myrsc_back_20240115_120000.meta",
            "myrsc_0000_back_20240115_120000",
            "myrsc_00000_back_20240115",
            "notes.txt",
        ] {
            assert!(DataKey::parse(raw, Backend::S3).is_err(), "{raw} should not parse");
        }
    }

    #[test]
    fn test_manifest_key_of_volume() {
        let key = DataKey::new("rsc", ".drbd", 1, jan15(), "-s", "snap");
        assert_eq!(
            key.manifest_key().to_string(),
            "rsc_back_20240115_120000-s^snap.meta"
        );
        let other = DataKey::new("rsc", "", 2, jan15(), "", "");
        assert!(key.same_backup(&other));
    }

    #[test]
    fn test_roundtrip_both_backends() {
        let rscs = ["ab", "my-rsc", "rsc_with_underscores"];
        let layers = ["", ".drbd", ".nvme.v1"];
        let vlms = [0, 7, 99999];
        let suffixes = ["", ":s3", "-nightly"];
        let snaps = ["", "snap", "back_20240115_120000"];
        for backend in [Backend::S3, Backend::Obs] {
            for rsc in rscs {
                for layer in layers {
                    for vlm in vlms {
                        for suffix in suffixes {
                            for snap in snaps {
                                let key = DataKey::new(rsc, layer, vlm, jan15(), suffix, snap);
                                let parsed = DataKey::parse(&key.to_string(), backend).unwrap();
                                assert_eq!(parsed, key, "backend {backend}, key {key}");
                            }
                        }
                    }
                }
            }
        }
    }
}
