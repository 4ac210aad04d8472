use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use log::debug;

use crate::config::DeviceConfig;
use crate::readings::Reading;

/// Sink for device discovery events. The adapter's event pump holds one of
/// these instead of a raw callback, so the tracker can be exercised in
/// tests without a running Bluetooth stack.
pub trait DeviceEvents: Send + Sync {
    fn device_appeared(&self, address: &str);
    fn device_disappeared(&self, address: &str);
}

/// Set of hardware addresses currently reported visible by the event
/// source. Appear/disappear handlers run on the event pump task while the
/// cycle timer snapshots from another, so the set sits behind a mutex.
#[derive(Clone, Default)]
pub struct PresenceTracker {
    visible: Arc<Mutex<Vec<String>>>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        PresenceTracker::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<String>> {
        self.visible
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Snapshot the visible set for a drain and clear it for the next
    /// discovery window, as one atomic step.
    pub fn take_visible(&self) -> Vec<String> {
        std::mem::take(&mut *self.lock())
    }
}

impl DeviceEvents for PresenceTracker {
    fn device_appeared(&self, address: &str) {
        debug!("device appeared: {address}");
        // Duplicates are fine; only membership matters at drain time.
        self.lock().push(address.to_string());
    }

    fn device_disappeared(&self, address: &str) {
        debug!("device disappeared: {address}");
        let mut visible = self.lock();
        if let Some(pos) = visible.iter().position(|a| a.eq_ignore_ascii_case(address)) {
            visible.remove(pos);
        }
    }
}

struct DeviceIdentity {
    key: String,
    address: String,
    reference: String,
}

/// Maps the fixed set of configured devices to a 0/1 presence value for
/// the current cycle. Presence starts at 0, is raised by `observe` during
/// a drain, and is reset to 0 before the next discovery window.
pub struct PresenceAggregator {
    devices: Vec<DeviceIdentity>,
    presence: HashMap<String, u8>,
}

impl PresenceAggregator {
    pub fn new(devices: &[DeviceConfig]) -> Self {
        let devices: Vec<DeviceIdentity> = devices
            .iter()
            .map(|d| DeviceIdentity {
                key: d.key.clone(),
                address: d.address.to_string(),
                reference: d.reference().to_string(),
            })
            .collect();
        let presence = devices.iter().map(|d| (d.key.clone(), 0)).collect();
        PresenceAggregator { devices, presence }
    }

    /// Mark every configured device whose address is in the visible-set
    /// snapshot as present. Returns the matched addresses so the caller
    /// can optionally ask the adapter to forget them.
    pub fn observe(&mut self, visible: &[String]) -> Vec<String> {
        let mut matched = Vec::new();
        for device in &self.devices {
            if visible
                .iter()
                .any(|a| a.eq_ignore_ascii_case(&device.address))
            {
                self.presence.insert(device.key.clone(), 1);
                matched.push(device.address.clone());
            }
        }
        matched
    }

    /// One reading per configured device for this cycle, present or not.
    pub fn readings(&self, timestamp: u64) -> Vec<(String, Reading)> {
        self.devices
            .iter()
            .map(|device| {
                let value = f64::from(*self.presence.get(&device.key).unwrap_or(&0));
                (
                    device.key.clone(),
                    Reading::new(&device.reference, value, timestamp),
                )
            })
            .collect()
    }

    /// Zero every presence value for the next discovery window.
    pub fn reset(&mut self) {
        for value in self.presence.values_mut() {
            *value = 0;
        }
    }

    #[cfg(test)]
    pub fn presence(&self, key: &str) -> u8 {
        *self.presence.get(key).unwrap_or(&0)
    }
}
