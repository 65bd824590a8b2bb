use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::core::error::GtmError;
use crate::core::gxid::{self, Gxid};
use crate::core::limits::RESTORE_SAFETY_MARGIN;

const CONTROL_MAGIC: u32 = 0x4754_4D43; // "GTMC"
const CONTROL_VERSION: u32 = 1;
const CONTROL_FILE_NAME: &str = "gtm.control";

/// The single persisted record.
#[derive(Debug, Serialize, Deserialize)]
struct ControlRecord {
    magic: u32,
    version: u32,
    control_gxid: Gxid,
    reserved: [u32; 4],
}

/// Durable store for the control GXID.
///
/// The generator periodically hands out a value to persist; on restart the
/// counter resumes from the stored value plus a safety margin, covering
/// identifiers assigned after the last checkpoint. Writes are atomic: the
/// record goes to a temporary file which is then renamed over the old one,
/// so a torn write leaves the previous record intact.
pub struct ControlFile {
    path: PathBuf,
}

impl ControlFile {
    pub fn new<P: AsRef<Path>>(data_dir: P) -> Result<Self, GtmError> {
        let data_dir = data_dir.as_ref();
        fs::create_dir_all(data_dir)?;
        Ok(Self {
            path: data_dir.join(CONTROL_FILE_NAME),
        })
    }

    /// Read the last checkpointed GXID, or `None` when there is no usable
    /// record (first start, or the previous shutdown was unclean enough to
    /// leave nothing behind).
    pub fn load(&self) -> Result<Option<Gxid>, GtmError> {
        if !self.path.exists() {
            return Ok(None);
        }

        let data = fs::read(&self.path)?;
        let record: ControlRecord = bincode::deserialize(&data)
            .map_err(|e| GtmError::BinarySerialization(e.to_string()))?;

        if record.magic != CONTROL_MAGIC || record.version != CONTROL_VERSION {
            return Err(GtmError::BinarySerialization(format!(
                "control file has bad magic/version ({:#x}/{})",
                record.magic, record.version
            )));
        }

        Ok(Some(record.control_gxid))
    }

    /// Persist a checkpoint value. Callers must not hold any table lock.
    pub fn save(&self, control_gxid: Gxid) -> Result<(), GtmError> {
        let record = ControlRecord {
            magic: CONTROL_MAGIC,
            version: CONTROL_VERSION,
            control_gxid,
            reserved: [0; 4],
        };
        let encoded = bincode::serialize(&record)
            .map_err(|e| GtmError::BinarySerialization(e.to_string()))?;

        let tmp_path = self.path.with_extension("tmp");
        fs::write(&tmp_path, encoded)?;
        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }

    /// The GXID the generator should resume from: the stored checkpoint plus
    /// the safety margin, or the start of the normal range when no record
    /// survived.
    pub fn restore_point(&self) -> Result<Gxid, GtmError> {
        let base = match self.load() {
            Ok(Some(stored)) => stored,
            Ok(None) => gxid::FIRST_NORMAL_GXID,
            Err(e) => {
                eprintln!("✗ Control record unreadable ({e}); assuming unclean shutdown");
                gxid::FIRST_NORMAL_GXID
            }
        };

        let mut restored = base.wrapping_add(RESTORE_SAFETY_MARGIN);
        if restored < gxid::FIRST_NORMAL_GXID {
            restored = gxid::FIRST_NORMAL_GXID;
        }
        Ok(restored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::gxid::FIRST_NORMAL_GXID;

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir failed");
        let control = ControlFile::new(dir.path()).expect("open failed");

        assert_eq!(control.load().expect("load failed"), None);

        control.save(10_000).expect("save failed");
        assert_eq!(control.load().expect("load failed"), Some(10_000));

        control.save(20_000).expect("save failed");
        assert_eq!(control.load().expect("load failed"), Some(20_000));
    }

    #[test]
    fn test_restore_point_applies_safety_margin() {
        let dir = tempfile::tempdir().expect("tempdir failed");
        let control = ControlFile::new(dir.path()).expect("open failed");

        assert_eq!(
            control.restore_point().expect("restore failed"),
            FIRST_NORMAL_GXID + RESTORE_SAFETY_MARGIN
        );

        control.save(10_000).expect("save failed");
        assert_eq!(
            control.restore_point().expect("restore failed"),
            10_000 + RESTORE_SAFETY_MARGIN
        );
    }

    #[test]
    fn test_restore_point_wraps_past_reserved_range() {
        let dir = tempfile::tempdir().expect("tempdir failed");
        let control = ControlFile::new(dir.path()).expect("open failed");

        control.save(u32::MAX - 10).expect("save failed");
        let restored = control.restore_point().expect("restore failed");
        assert!(restored >= FIRST_NORMAL_GXID);
    }

    #[test]
    fn test_corrupt_record_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir failed");
        let control = ControlFile::new(dir.path()).expect("open failed");

        std::fs::write(dir.path().join(CONTROL_FILE_NAME), b"garbage").expect("write failed");
        assert!(control.load().is_err());

        // restore_point treats the corrupt record as an unclean shutdown.
        let restored = control.restore_point().expect("restore failed");
        assert_eq!(restored, FIRST_NORMAL_GXID + RESTORE_SAFETY_MARGIN);
    }
}
