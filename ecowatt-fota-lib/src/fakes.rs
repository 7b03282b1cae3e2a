//! In-memory collaborators with fault injection for orchestrator tests.

use crate::error::{FetchError, StorageError};
use crate::flash::FlashWriter;
use crate::manifest::{Chunk, ReportStatus, UpdateManifest};
use crate::package::FirmwarePackage;
use crate::state::{StateStore, UpdateState};
use crate::transport::FotaTransport;
use crate::FotaKeys;

pub fn keys() -> FotaKeys {
    FotaKeys::new(
        [0x60, 0x3d, 0xeb, 0x10, 0x15, 0xca, 0x71, 0xbe, 0x2b, 0x73, 0xae, 0xf0, 0x85, 0x7d, 0x77, 0x81],
        [0x42; 32],
    )
}

/// Image of `len` bytes with a recognizable pattern.
pub fn image(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 + 7) as u8).collect()
}

pub fn package(version: &str, len: usize, chunk_size: u32) -> FirmwarePackage {
    FirmwarePackage::new(version, image(len), chunk_size, [0xA0; 16], keys()).unwrap()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Call {
    Manifest,
    Chunk(u32),
    Report(ReportStatus, u32),
    BootOk,
}

pub struct FakeTransport {
    pub package: FirmwarePackage,
    pub manifest_override: Option<UpdateManifest>,
    pub calls: Vec<Call>,
    pub fail_manifest: bool,
    pub fail_chunk: Option<u32>,
    pub renumber_chunk: Option<(u32, u32)>,
    pub corrupt_chunk: Option<u32>,
    pub fail_reports: bool,
    pub fail_boot_confirm: bool,
}

impl FakeTransport {
    pub fn new(package: FirmwarePackage) -> Self {
        Self {
            package,
            manifest_override: None,
            calls: Vec::new(),
            fail_manifest: false,
            fail_chunk: None,
            renumber_chunk: None,
            corrupt_chunk: None,
            fail_reports: false,
            fail_boot_confirm: false,
        }
    }

    pub fn chunk_requests(&self) -> Vec<u32> {
        self.calls
            .iter()
            .filter_map(|c| match c {
                Call::Chunk(n) => Some(*n),
                _ => None,
            })
            .collect()
    }

    pub fn reports(&self) -> Vec<(ReportStatus, u32)> {
        self.calls
            .iter()
            .filter_map(|c| match c {
                Call::Report(s, n) => Some((*s, *n)),
                _ => None,
            })
            .collect()
    }
}

impl FotaTransport for FakeTransport {
    fn fetch_manifest(&mut self) -> Result<UpdateManifest, FetchError> {
        self.calls.push(Call::Manifest);
        if self.fail_manifest {
            return Err(FetchError::Network("connection refused".to_string()));
        }
        Ok(self
            .manifest_override
            .clone()
            .unwrap_or_else(|| self.package.manifest()))
    }

    fn fetch_chunk(&mut self, version: &str, index: u32) -> Result<Chunk, FetchError> {
        self.calls.push(Call::Chunk(index));
        assert_eq!(version, self.package.version());
        if self.fail_chunk == Some(index) {
            return Err(FetchError::Network("timed out".to_string()));
        }
        let mut response = self.package.chunk_response(index).ok_or(FetchError::Status(404))?;
        if let Some((requested, sent)) = self.renumber_chunk {
            if requested == index {
                response = self.package.chunk_response(sent).ok_or(FetchError::Status(404))?;
            }
        }
        let mut chunk = response.decode(index)?;
        if self.corrupt_chunk == Some(index) {
            chunk.ciphertext[0] ^= 0x01;
        }
        Ok(chunk)
    }

    fn report(&mut self, status: ReportStatus, chunk: u32, version: &str) -> Result<(), FetchError> {
        assert_eq!(version, self.package.version());
        self.calls.push(Call::Report(status, chunk));
        if self.fail_reports {
            return Err(FetchError::Status(500));
        }
        Ok(())
    }

    fn confirm_boot(&mut self) -> Result<(), FetchError> {
        self.calls.push(Call::BootOk);
        if self.fail_boot_confirm {
            return Err(FetchError::Network("unreachable".to_string()));
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryStateStore {
    pub record: Option<Vec<u8>>,
    pub pending_boot: bool,
    /// Every record saved, in order.
    pub saved: Vec<UpdateState>,
    pub fail_save_at: Option<usize>,
}

impl MemoryStateStore {
    pub fn with_state(state: &UpdateState) -> Self {
        Self {
            record: Some(state.encode().unwrap()),
            ..Self::default()
        }
    }

    pub fn current(&self) -> Option<UpdateState> {
        self.record.as_deref().and_then(UpdateState::decode)
    }
}

impl StateStore for MemoryStateStore {
    fn load(&mut self) -> Option<UpdateState> {
        self.current()
    }

    fn save(&mut self, state: &UpdateState) -> Result<(), StorageError> {
        if self.fail_save_at == Some(self.saved.len()) {
            return Err(StorageError::Backend("nvs full".to_string()));
        }
        self.record = Some(state.encode()?);
        self.saved.push(state.clone());
        Ok(())
    }

    fn clear(&mut self) -> Result<(), StorageError> {
        self.record = None;
        Ok(())
    }

    fn mark_pending_boot(&mut self) -> Result<(), StorageError> {
        self.pending_boot = true;
        Ok(())
    }

    fn is_pending_boot(&mut self) -> bool {
        self.pending_boot
    }

    fn clear_pending_boot(&mut self) -> Result<(), StorageError> {
        self.pending_boot = false;
        Ok(())
    }
}

/// Flash slot whose contents survive across orchestrator instances, like
/// real flash survives a reboot.
#[derive(Default)]
pub struct FakeFlash {
    pub slot: Vec<u8>,
    pub begins: Vec<(u32, u32)>,
    pub writes: Vec<usize>,
    pub open: bool,
    pub aborted: bool,
    pub committed: Option<bool>,
    pub restarted: bool,
    pub fail_begin: bool,
    pub short_write_at: Option<usize>,
    pub fail_commit: bool,
}

impl FlashWriter for FakeFlash {
    fn begin(&mut self, image_size: u32, resume_offset: u32) -> Result<(), StorageError> {
        self.begins.push((image_size, resume_offset));
        if self.fail_begin {
            return Err(StorageError::TooLarge {
                requested: image_size,
                capacity: 0,
            });
        }
        self.slot.truncate(resume_offset as usize);
        self.open = true;
        self.aborted = false;
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, StorageError> {
        if !self.open {
            return Err(StorageError::NotStarted);
        }
        let accepted = if self.short_write_at == Some(self.writes.len()) {
            data.len() / 2
        } else {
            data.len()
        };
        self.slot.extend_from_slice(&data[..accepted]);
        self.writes.push(accepted);
        Ok(accepted)
    }

    fn abort(&mut self) {
        self.open = false;
        self.aborted = true;
    }

    fn commit(&mut self, activate: bool) -> Result<(), StorageError> {
        if !self.open {
            return Err(StorageError::NotStarted);
        }
        self.open = false;
        if self.fail_commit {
            return Err(StorageError::Backend("image validation failed".to_string()));
        }
        self.committed = Some(activate);
        Ok(())
    }

    fn restart(&mut self) {
        self.restarted = true;
    }
}
