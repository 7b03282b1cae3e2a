//! Flash writer staging the image in a file next to the state record.

use ecowatt_fota_lib::{FlashWriter, StorageError};
use log::{info, warn};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

pub const STAGING_FILE: &str = "staging.bin";
pub const ACTIVE_FILE: &str = "active.bin";

fn backend(e: io::Error) -> StorageError {
    StorageError::Backend(e.to_string())
}

pub struct FileFlashWriter {
    dir: PathBuf,
    file: Option<File>,
    image_size: u32,
    offset: u32,
    restarts: u32,
}

impl FileFlashWriter {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            file: None,
            image_size: 0,
            offset: 0,
            restarts: 0,
        }
    }

    /// Number of restarts requested so far.
    pub fn restarts(&self) -> u32 {
        self.restarts
    }

    fn open(&self, resume_offset: u32) -> io::Result<File> {
        let path = self.dir.join(STAGING_FILE);
        if resume_offset == 0 {
            return File::create(path);
        }
        let mut file = OpenOptions::new().write(true).open(path)?;
        let len = file.metadata()?.len();
        if len < u64::from(resume_offset) {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("staging image has {len} bytes, resume needs {resume_offset}"),
            ));
        }
        // Bytes past the offset were never acknowledged
        file.set_len(u64::from(resume_offset))?;
        file.seek(SeekFrom::Start(u64::from(resume_offset)))?;
        Ok(file)
    }
}

impl FlashWriter for FileFlashWriter {
    fn begin(&mut self, image_size: u32, resume_offset: u32) -> Result<(), StorageError> {
        if resume_offset > image_size {
            return Err(StorageError::Backend(format!(
                "resume offset {resume_offset} beyond image size {image_size}"
            )));
        }
        self.file = Some(self.open(resume_offset).map_err(backend)?);
        self.image_size = image_size;
        self.offset = resume_offset;
        info!("Flash: staging {image_size} bytes from offset {resume_offset}");
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, StorageError> {
        let file = self.file.as_mut().ok_or(StorageError::NotStarted)?;
        let end = u32::try_from(data.len())
            .ok()
            .and_then(|len| self.offset.checked_add(len))
            .filter(|&end| end <= self.image_size)
            .ok_or(StorageError::TooLarge {
                requested: self.offset.saturating_add(u32::try_from(data.len()).unwrap_or(u32::MAX)),
                capacity: self.image_size,
            })?;
        file.write_all(data).map_err(backend)?;
        file.sync_data().map_err(backend)?;
        self.offset = end;
        Ok(data.len())
    }

    fn abort(&mut self) {
        if self.file.take().is_some() {
            warn!("Flash: update aborted at offset {}/{}", self.offset, self.image_size);
        }
    }

    fn commit(&mut self, activate: bool) -> Result<(), StorageError> {
        let file = self.file.take().ok_or(StorageError::NotStarted)?;
        file.sync_all().map_err(backend)?;
        if self.offset != self.image_size {
            return Err(StorageError::ShortWrite {
                written: self.offset as usize,
                expected: self.image_size as usize,
            });
        }
        if activate {
            fs::rename(self.dir.join(STAGING_FILE), self.dir.join(ACTIVE_FILE)).map_err(backend)?;
            info!("Flash: {ACTIVE_FILE} replaced");
        }
        Ok(())
    }

    fn restart(&mut self) {
        self.restarts += 1;
        info!("Flash: restart requested");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_and_activates() {
        let tmp = tempfile::tempdir().unwrap();
        let mut flash = FileFlashWriter::new(tmp.path());
        flash.begin(6, 0).unwrap();
        assert_eq!(flash.write(b"abc").unwrap(), 3);
        assert_eq!(flash.write(b"def").unwrap(), 3);
        flash.commit(true).unwrap();

        assert_eq!(fs::read(tmp.path().join(ACTIVE_FILE)).unwrap(), b"abcdef");
        assert!(!tmp.path().join(STAGING_FILE).exists());
    }

    #[test]
    fn resume_drops_unacknowledged_tail() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join(STAGING_FILE), b"abcXY").unwrap();

        let mut flash = FileFlashWriter::new(tmp.path());
        flash.begin(6, 3).unwrap();
        flash.write(b"def").unwrap();
        flash.commit(true).unwrap();
        assert_eq!(fs::read(tmp.path().join(ACTIVE_FILE)).unwrap(), b"abcdef");
    }

    #[test]
    fn resume_without_staged_bytes_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let mut flash = FileFlashWriter::new(tmp.path());
        assert!(flash.begin(6, 3).is_err());

        fs::write(tmp.path().join(STAGING_FILE), b"a").unwrap();
        assert!(flash.begin(6, 3).is_err());
    }

    #[test]
    fn overflow_and_incomplete_images_are_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let mut flash = FileFlashWriter::new(tmp.path());
        assert_eq!(flash.write(b"a"), Err(StorageError::NotStarted));

        flash.begin(4, 0).unwrap();
        assert!(matches!(flash.write(b"abcde"), Err(StorageError::TooLarge { .. })));
        flash.write(b"ab").unwrap();
        assert_eq!(
            flash.commit(true),
            Err(StorageError::ShortWrite { written: 2, expected: 4 })
        );
        assert!(!tmp.path().join(ACTIVE_FILE).exists());
    }

    #[test]
    fn abort_keeps_active_image() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join(ACTIVE_FILE), b"old").unwrap();
        let mut flash = FileFlashWriter::new(tmp.path());
        flash.begin(3, 0).unwrap();
        flash.write(b"new").unwrap();
        flash.abort();
        assert_eq!(flash.commit(true), Err(StorageError::NotStarted));
        assert_eq!(fs::read(tmp.path().join(ACTIVE_FILE)).unwrap(), b"old");
    }
}
