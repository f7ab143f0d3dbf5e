//! `time_saver` file (§6): a single integer holding the last observed wall
//! time, written atomically (write `.tmp`, then rename) so a restart can
//! sanity-check the wall clock against the last known-good reading.

use crate::error::{CoreError, Result};

pub struct TimeSaver {
    path: String,
}

impl TimeSaver {
    pub fn new(path: &str) -> Self {
        Self { path: path.to_string() }
    }

    pub fn read(&self) -> Option<i64> {
        std::fs::read_to_string(&self.path)
            .ok()
            .and_then(|s| s.trim().parse::<i64>().ok())
    }

    pub fn write(&self, wall_time: i64) -> Result<()> {
        let tmp_path = format!("{}.tmp", self.path);
        std::fs::write(&tmp_path, wall_time.to_string())
            .map_err(|e| CoreError::Persistence(format!("write {tmp_path}: {e}")))?;
        std::fs::rename(&tmp_path, &self.path)
            .map_err(|e| CoreError::Persistence(format!("rename {tmp_path}: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_atomic_rename() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("time_saver");
        let saver = TimeSaver::new(path.to_str().unwrap());

        assert_eq!(saver.read(), None);
        saver.write(12_345).unwrap();
        assert_eq!(saver.read(), Some(12_345));
        assert!(!dir.path().join("time_saver.tmp").exists());
    }
}
