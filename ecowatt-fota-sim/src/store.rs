//! File-backed state store. Each record is replaced atomically: written to a
//! temporary file, synced, then renamed over the old one.

use ecowatt_fota_lib::{StateStore, StorageError, UpdateState};
use log::warn;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

const STATE_FILE: &str = "update_state.json";
const PENDING_BOOT_FILE: &str = "pending_boot";

fn backend(e: io::Error) -> StorageError {
    StorageError::Backend(e.to_string())
}

pub struct FileStateStore {
    dir: PathBuf,
}

impl FileStateStore {
    pub fn new(dir: &Path) -> io::Result<Self> {
        fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    fn write_durable(&self, name: &str, contents: &[u8]) -> io::Result<()> {
        let tmp = self.dir.join(format!("{name}.tmp"));
        let mut file = File::create(&tmp)?;
        file.write_all(contents)?;
        file.sync_all()?;
        fs::rename(&tmp, self.dir.join(name))?;
        // Persist the rename itself
        if let Ok(dir) = File::open(&self.dir) {
            let _ = dir.sync_all();
        }
        Ok(())
    }

    fn remove(&self, name: &str) -> io::Result<()> {
        match fs::remove_file(self.dir.join(name)) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }
}

impl StateStore for FileStateStore {
    fn load(&mut self) -> Option<UpdateState> {
        match fs::read(self.dir.join(STATE_FILE)) {
            Ok(bytes) => UpdateState::decode(&bytes),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => {
                warn!("FOTA: failed to read update state: {e}");
                None
            }
        }
    }

    fn save(&mut self, state: &UpdateState) -> Result<(), StorageError> {
        let bytes = state.encode()?;
        self.write_durable(STATE_FILE, &bytes).map_err(backend)
    }

    fn clear(&mut self) -> Result<(), StorageError> {
        self.remove(STATE_FILE).map_err(backend)
    }

    fn mark_pending_boot(&mut self) -> Result<(), StorageError> {
        self.write_durable(PENDING_BOOT_FILE, b"1").map_err(backend)
    }

    fn is_pending_boot(&mut self) -> bool {
        self.dir.join(PENDING_BOOT_FILE).exists()
    }

    fn clear_pending_boot(&mut self) -> Result<(), StorageError> {
        self.remove(PENDING_BOOT_FILE).map_err(backend)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ecowatt_fota_lib::UpdateManifest;

    fn state() -> UpdateState {
        UpdateState::from_manifest(&UpdateManifest {
            version: "2.0.0".to_string(),
            size: 32,
            chunk_size: 16,
            total_chunks: 2,
            content_hash: "ab".repeat(32),
            iv: "00".repeat(16),
        })
    }

    #[test]
    fn state_survives_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let mut store = FileStateStore::new(tmp.path()).unwrap();
        assert_eq!(store.load(), None);
        store.save(&state()).unwrap();

        let mut reopened = FileStateStore::new(tmp.path()).unwrap();
        assert_eq!(reopened.load(), Some(state()));
        reopened.clear().unwrap();
        assert_eq!(reopened.load(), None);
        // Clearing twice is fine
        reopened.clear().unwrap();
        assert!(!tmp.path().join("update_state.json.tmp").exists());
    }

    #[test]
    fn corrupt_record_reads_as_absent() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join(STATE_FILE), b"{\"target\":").unwrap();
        let mut store = FileStateStore::new(tmp.path()).unwrap();
        assert_eq!(store.load(), None);
    }

    #[test]
    fn pending_boot_marker() {
        let tmp = tempfile::tempdir().unwrap();
        let mut store = FileStateStore::new(tmp.path()).unwrap();
        assert!(!store.is_pending_boot());
        store.mark_pending_boot().unwrap();
        assert!(FileStateStore::new(tmp.path()).unwrap().is_pending_boot());
        store.clear_pending_boot().unwrap();
        assert!(!store.is_pending_boot());
    }
}
