//! Task watchdog user for the FOTA context.
//!
//! Every blocking step of an update cycle (HTTP request, flash erase batch,
//! flash write) is bracketed by a feed so a healthy cycle never trips the
//! Task Watchdog Timer (TWDT), while a wedged one still does.

use esp_idf_svc::sys::{
    esp, esp_task_wdt_add_user, esp_task_wdt_delete_user, esp_task_wdt_reset_user,
    esp_task_wdt_user_handle_t,
};
use log::{debug, warn};
use std::ffi::CStr;

/// Registered TWDT user, removed again on drop.
pub struct WatchdogHandle {
    handle: esp_task_wdt_user_handle_t,
    name: &'static CStr,
}

impl WatchdogHandle {
    pub fn register(name: &'static CStr) -> anyhow::Result<Self> {
        let mut handle: esp_task_wdt_user_handle_t = std::ptr::null_mut();
        // SAFETY: name is a static C string; handle is written on success.
        esp!(unsafe { esp_task_wdt_add_user(name.as_ptr(), &mut handle) })
            .map_err(|e| anyhow::anyhow!("cannot add TWDT user {name:?}: {e}"))?;
        debug!("TWDT: user {name:?} added");
        Ok(Self { handle, name })
    }

    pub fn feed(&self) {
        // SAFETY: handle stays registered until drop.
        if let Err(e) = esp!(unsafe { esp_task_wdt_reset_user(self.handle) }) {
            warn!("TWDT: feeding {:?} failed: {e}", self.name);
        }
    }
}

impl Drop for WatchdogHandle {
    fn drop(&mut self) {
        // SAFETY: handle was returned by esp_task_wdt_add_user.
        if let Err(e) = esp!(unsafe { esp_task_wdt_delete_user(self.handle) }) {
            warn!("TWDT: removing {:?} failed: {e}", self.name);
        }
    }
}
