use anyhow::Result;
use ecowatt_fota_lib::{StateStore, StorageError, UpdateState};
use esp_idf_svc::nvs::{EspNvs, EspNvsPartition, NvsDefault};
use esp_idf_svc::sys::EspError;
use log::{debug, warn};

/// Kept apart from the configuration namespace.
const NVS_NAMESPACE: &str = "fota";
const STATE_KEY: &str = "update_state";
const PENDING_BOOT_KEY: &str = "pending_boot";

fn backend(e: EspError) -> StorageError {
    StorageError::Backend(e.to_string())
}

/// [`StateStore`] in NVS. Every `set_*`/`remove` commits before returning.
pub struct NvsStateStore {
    nvs: EspNvs<NvsDefault>,
}

impl NvsStateStore {
    pub fn new(partition: EspNvsPartition<NvsDefault>) -> Result<Self> {
        debug!("Initializing NVS namespace: {NVS_NAMESPACE}");
        Ok(Self {
            nvs: EspNvs::new(partition, NVS_NAMESPACE, true)?,
        })
    }
}

impl StateStore for NvsStateStore {
    fn load(&mut self) -> Option<UpdateState> {
        let len = match self.nvs.blob_len(STATE_KEY) {
            Ok(len) => len?,
            Err(e) => {
                warn!("FOTA: failed to read update state length: {e}");
                return None;
            }
        };
        let mut buf = vec![0u8; len];
        match self.nvs.get_blob(STATE_KEY, &mut buf) {
            Ok(bytes) => bytes.and_then(UpdateState::decode),
            Err(e) => {
                warn!("FOTA: failed to read update state: {e}");
                None
            }
        }
    }

    fn save(&mut self, state: &UpdateState) -> Result<(), StorageError> {
        let bytes = state.encode()?;
        self.nvs.set_blob(STATE_KEY, &bytes).map_err(backend)
    }

    fn clear(&mut self) -> Result<(), StorageError> {
        self.nvs.remove(STATE_KEY).map(|_| ()).map_err(backend)
    }

    fn mark_pending_boot(&mut self) -> Result<(), StorageError> {
        self.nvs.set_u8(PENDING_BOOT_KEY, 1).map_err(backend)
    }

    fn is_pending_boot(&mut self) -> bool {
        match self.nvs.get_u8(PENDING_BOOT_KEY) {
            Ok(flag) => flag == Some(1),
            Err(e) => {
                warn!("FOTA: failed to read pending-boot marker: {e}");
                false
            }
        }
    }

    fn clear_pending_boot(&mut self) -> Result<(), StorageError> {
        self.nvs.remove(PENDING_BOOT_KEY).map(|_| ()).map_err(backend)
    }
}
