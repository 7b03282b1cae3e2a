use crate::error::StorageError;

/// Sequential writer for the inactive program-storage slot.
///
/// Calls arrive as `begin`, then one `write` per chunk in index order, then
/// either `abort` or `commit`.
pub trait FlashWriter {
    /// Open the slot for an image of `image_size` bytes.
    ///
    /// With `resume_offset == 0` the slot is prepared from scratch. A
    /// non-zero offset continues an interrupted update: the first
    /// `resume_offset` bytes are already in place and must be kept. Bytes
    /// past the offset may hold a torn write and must not leak into the
    /// image.
    fn begin(&mut self, image_size: u32, resume_offset: u32) -> Result<(), StorageError>;

    /// Append `data`, returning how many bytes were accepted.
    fn write(&mut self, data: &[u8]) -> Result<usize, StorageError>;

    /// Abandon the open update. The running image stays the boot target.
    fn abort(&mut self);

    /// Finish the update. With `activate` the new image becomes the boot
    /// target.
    fn commit(&mut self, activate: bool) -> Result<(), StorageError>;

    /// Reboot into the activated image. Does not return on real hardware.
    fn restart(&mut self);
}

/// Value of an erased NOR flash byte. Programming can only clear bits.
pub const ERASED_BYTE: u8 = 0xFF;

/// Erase work needed before NOR flash writes can continue at a resume offset.
///
/// A power cut during a write can leave bytes past the persisted offset
/// partly programmed, and writing over them would AND old and new data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResumeErase {
    /// Start of the sector holding the resume offset, when the offset is not
    /// sector aligned. Its bytes before the offset must survive, so the
    /// sector is only erased (and its prefix rewritten) if its tail is dirty.
    pub partial_sector: Option<u32>,
    /// Whole sectors in `erase_from..erase_to` are erased unconditionally.
    pub erase_from: u32,
    pub erase_to: u32,
}

impl ResumeErase {
    #[must_use]
    pub fn plan(resume_offset: u32, image_size: u32, sector_size: u32) -> Self {
        let erase_to = image_size.div_ceil(sector_size).saturating_mul(sector_size);
        let sector_start = resume_offset - resume_offset % sector_size;
        let (partial_sector, erase_from) = if sector_start == resume_offset {
            (None, resume_offset)
        } else {
            (Some(sector_start), sector_start.saturating_add(sector_size))
        };
        Self {
            partial_sector,
            erase_from: erase_from.min(erase_to),
            erase_to,
        }
    }
}

/// Whether flash read back from the device is still in the erased state.
#[must_use]
pub fn is_erased(bytes: &[u8]) -> bool {
    bytes.iter().all(|&b| b == ERASED_BYTE)
}
