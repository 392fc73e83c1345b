//! Exclusive capture-device leases.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use scenemix_common::error::{ScenemixError, ScenemixResult};

/// Registry of capture devices currently held open.
///
/// A device can be leased by one holder at a time; a second concurrent
/// lease is refused with [`ScenemixError::DeviceUnavailable`]. Leases are
/// released when dropped.
#[derive(Debug, Clone, Default)]
pub struct DeviceRegistry {
    held: Arc<Mutex<HashMap<PathBuf, String>>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self, device: impl AsRef<Path>, holder: impl Into<String>) -> ScenemixResult<DeviceLease> {
        let device = device.as_ref().to_path_buf();
        let holder = holder.into();
        let mut held = self.lock();
        if let Some(current) = held.get(&device) {
            return Err(ScenemixError::device_unavailable(
                &holder,
                format!("{} is already held by {current}", device.display()),
            ));
        }
        held.insert(device.clone(), holder.clone());
        tracing::debug!(device = %device.display(), %holder, "Device leased");
        Ok(DeviceLease {
            registry: self.clone(),
            device,
            holder,
        })
    }

    /// Current holder of `device`, if leased.
    pub fn holder(&self, device: impl AsRef<Path>) -> Option<String> {
        self.lock().get(device.as_ref()).cloned()
    }

    pub fn held_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<PathBuf, String>> {
        self.held.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Proof of exclusive access to one device.
#[derive(Debug)]
pub struct DeviceLease {
    registry: DeviceRegistry,
    device: PathBuf,
    holder: String,
}

impl DeviceLease {
    pub fn device(&self) -> &Path {
        &self.device
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }
}

impl Drop for DeviceLease {
    fn drop(&mut self) {
        let mut held = self.registry.lock();
        if held.get(&self.device) == Some(&self.holder) {
            held.remove(&self.device);
            tracing::debug!(device = %self.device.display(), holder = %self.holder, "Device released");
        }
    }
}
