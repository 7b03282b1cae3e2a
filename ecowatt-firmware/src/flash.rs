//! Flash writer for the inactive OTA slot.
//!
//! `EspOta::initiate_update` always erases the whole slot, which would throw
//! away the chunks of an interrupted update. This writer drives the partition
//! API directly so an update can continue at the persisted byte offset after a
//! reboot. On resume the area past the offset is erased again: a power cut
//! mid-write leaves it partly programmed. `esp_ota_set_boot_partition` still
//! validates the image before it becomes the boot target.

use crate::watchdog::WatchdogHandle;
use ecowatt_fota_lib::{is_erased, FlashWriter, ResumeErase, StorageError};
use esp_idf_svc::sys::{
    esp, esp_ota_get_next_update_partition, esp_ota_set_boot_partition,
    esp_partition_erase_range, esp_partition_read, esp_partition_t, esp_partition_write,
    esp_restart, EspError,
};
use log::{info, warn};
use std::rc::Rc;

const SECTOR_SIZE: u32 = 4096;
/// Sectors erased between watchdog feeds.
const ERASE_BATCH: u32 = 16 * SECTOR_SIZE;

fn backend(e: EspError) -> StorageError {
    StorageError::Backend(e.to_string())
}

pub struct EspFlashWriter {
    partition: *const esp_partition_t,
    image_size: u32,
    offset: u32,
    open: bool,
    watchdog: Rc<WatchdogHandle>,
}

impl EspFlashWriter {
    pub fn new(watchdog: Rc<WatchdogHandle>) -> Self {
        Self {
            partition: std::ptr::null(),
            image_size: 0,
            offset: 0,
            open: false,
            watchdog,
        }
    }

    /// Erase the sector-aligned range `from..to`, feeding the watchdog
    /// between batches.
    fn erase(&self, partition: *const esp_partition_t, from: u32, to: u32) -> Result<(), StorageError> {
        let mut offset = from;
        while offset < to {
            let batch = ERASE_BATCH.min(to - offset);
            self.watchdog.feed();
            // SAFETY: partition comes from the partition table and the range
            // is sector aligned and within the partition (checked in begin).
            esp!(unsafe { esp_partition_erase_range(partition, offset as usize, batch as usize) })
                .map_err(backend)?;
            offset += batch;
        }
        self.watchdog.feed();
        Ok(())
    }

    /// Make everything from `resume_offset` on writable again without losing
    /// the bytes before it.
    fn prepare_resume(
        &self,
        partition: *const esp_partition_t,
        resume_offset: u32,
        image_size: u32,
    ) -> Result<(), StorageError> {
        let plan = ResumeErase::plan(resume_offset, image_size, SECTOR_SIZE);
        if let Some(start) = plan.partial_sector {
            let mut sector = vec![0u8; SECTOR_SIZE as usize];
            // SAFETY: the sector lies within the erase length checked in begin.
            esp!(unsafe {
                esp_partition_read(partition, start as usize, sector.as_mut_ptr().cast(), sector.len())
            })
            .map_err(backend)?;
            let keep = (resume_offset - start) as usize;
            if !is_erased(&sector[keep..]) {
                warn!("Flash: sector at {start} has a torn write past {resume_offset}, rewriting");
                self.erase(partition, start, start + SECTOR_SIZE)?;
                // SAFETY: rewrites the kept prefix of the sector just erased.
                esp!(unsafe { esp_partition_write(partition, start as usize, sector.as_ptr().cast(), keep) })
                    .map_err(backend)?;
            }
        }
        self.erase(partition, plan.erase_from, plan.erase_to)
    }
}

impl FlashWriter for EspFlashWriter {
    fn begin(&mut self, image_size: u32, resume_offset: u32) -> Result<(), StorageError> {
        // SAFETY: a null start partition means "the running one".
        let partition = unsafe { esp_ota_get_next_update_partition(std::ptr::null()) };
        if partition.is_null() {
            return Err(StorageError::Backend("no OTA update partition".to_string()));
        }
        // SAFETY: non-null partition table entries live for the whole program.
        let capacity = unsafe { (*partition).size };
        let erase_len = image_size.div_ceil(SECTOR_SIZE).saturating_mul(SECTOR_SIZE);
        if erase_len > capacity {
            return Err(StorageError::TooLarge {
                requested: image_size,
                capacity,
            });
        }
        if resume_offset > image_size {
            return Err(StorageError::Backend(format!(
                "resume offset {resume_offset} beyond image size {image_size}"
            )));
        }

        if resume_offset == 0 {
            info!("Flash: erasing {erase_len} bytes of update slot");
            self.erase(partition, 0, erase_len)?;
        } else {
            info!("Flash: resuming update slot at offset {resume_offset}/{image_size}");
            self.prepare_resume(partition, resume_offset, image_size)?;
        }

        self.partition = partition;
        self.image_size = image_size;
        self.offset = resume_offset;
        self.open = true;
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, StorageError> {
        if !self.open {
            return Err(StorageError::NotStarted);
        }
        let end = u32::try_from(data.len())
            .ok()
            .and_then(|len| self.offset.checked_add(len))
            .filter(|&end| end <= self.image_size)
            .ok_or(StorageError::TooLarge {
                requested: self.offset.saturating_add(u32::try_from(data.len()).unwrap_or(u32::MAX)),
                capacity: self.image_size,
            })?;

        self.watchdog.feed();
        // SAFETY: the slot was opened in begin and [offset, end) lies within
        // the image, which fits the partition.
        esp!(unsafe {
            esp_partition_write(
                self.partition,
                self.offset as usize,
                data.as_ptr().cast(),
                data.len(),
            )
        })
        .map_err(backend)?;
        self.offset = end;
        Ok(data.len())
    }

    fn abort(&mut self) {
        if self.open {
            warn!("Flash: update aborted at offset {}/{}", self.offset, self.image_size);
        }
        self.open = false;
    }

    fn commit(&mut self, activate: bool) -> Result<(), StorageError> {
        if !self.open {
            return Err(StorageError::NotStarted);
        }
        self.open = false;
        if self.offset != self.image_size {
            return Err(StorageError::ShortWrite {
                written: self.offset as usize,
                expected: self.image_size as usize,
            });
        }
        if activate {
            self.watchdog.feed();
            // SAFETY: partition is the slot the image was written to.
            esp!(unsafe { esp_ota_set_boot_partition(self.partition) }).map_err(backend)?;
            self.watchdog.feed();
            info!("Flash: new image set as boot partition");
        }
        Ok(())
    }

    fn restart(&mut self) {
        info!("Flash: restarting into new image");
        // SAFETY: plain system call; does not return.
        unsafe { esp_restart() }
    }
}
