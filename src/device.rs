//! Devices known to the controller.

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use tokio::time::Instant;

use crate::capabilities::LightCapabilities;
use crate::message::StatusResponse;

/// Callback invoked after every state refresh of a device.
pub type UpdateCallback = Arc<dyn Fn(&Device) + Send + Sync>;

/// Last state reported by a device.
///
/// Overwritten wholesale on each decoded `devStatus` response, and set
/// optimistically when a command is issued so callers can read their own
/// writes before the device confirms.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceState {
    /// Whether the device is on.
    pub on: bool,
    /// Brightness percentage (0-100).
    pub brightness: u8,
    /// Current RGB color.
    pub rgb_color: (u8, u8, u8),
    /// Current color temperature in Kelvin (0 when in RGB mode).
    pub temperature_color: u16,
}

/// One Govee device on the local network.
///
/// A device is created when a scan response names a previously unknown
/// fingerprint and is then mutated in place by later scan and status
/// responses. The fingerprint, SKU and capabilities never change after
/// creation; the address may move.
#[derive(Clone)]
pub struct Device {
    fingerprint: String,
    sku: String,
    ip: IpAddr,
    capabilities: Arc<LightCapabilities>,
    last_seen: Instant,
    state: DeviceState,
    is_manual: bool,
    update_callback: Option<UpdateCallback>,
}

impl Device {
    pub(crate) fn new(
        fingerprint: String,
        sku: String,
        ip: IpAddr,
        capabilities: LightCapabilities,
    ) -> Self {
        Device {
            fingerprint,
            sku,
            ip,
            capabilities: Arc::new(capabilities),
            last_seen: Instant::now(),
            state: DeviceState::default(),
            is_manual: false,
            update_callback: None,
        }
    }

    /// Stable hardware identifier; the registry key.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Model identifier from the first scan response.
    pub fn sku(&self) -> &str {
        &self.sku
    }

    /// Address the device is currently reachable at.
    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    pub fn capabilities(&self) -> &LightCapabilities {
        &self.capabilities
    }

    /// When the device last answered a scan or status request.
    pub fn last_seen(&self) -> Instant {
        self.last_seen
    }

    /// Last reported (or optimistically written) state.
    pub fn state(&self) -> DeviceState {
        self.state
    }

    /// True if the device originated from an explicitly queued address
    /// rather than organic multicast discovery.
    pub fn is_manual(&self) -> bool {
        self.is_manual
    }

    pub(crate) fn set_ip(&mut self, ip: IpAddr) {
        self.ip = ip;
    }

    pub(crate) fn set_manual(&mut self, manual: bool) {
        self.is_manual = manual;
    }

    pub(crate) fn update_last_seen(&mut self) {
        self.last_seen = Instant::now();
    }

    /// Overwrite the reported state from a decoded status response and
    /// refresh the last-seen timestamp.
    pub(crate) fn apply_status(&mut self, status: &StatusResponse) {
        self.state = DeviceState {
            on: status.on_off != 0,
            brightness: status.brightness,
            rgb_color: (status.color.r, status.color.g, status.color.b),
            temperature_color: status.color_tem_in_kelvin,
        };
        self.update_last_seen();
    }

    pub(crate) fn state_mut(&mut self) -> &mut DeviceState {
        &mut self.state
    }

    /// Replace the update callback, returning the previous one.
    ///
    /// At most one callback is active per device; pass `None` to clear it.
    pub(crate) fn set_update_callback(
        &mut self,
        callback: Option<UpdateCallback>,
    ) -> Option<UpdateCallback> {
        std::mem::replace(&mut self.update_callback, callback)
    }

    pub(crate) fn update_callback(&self) -> Option<UpdateCallback> {
        self.update_callback.clone()
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("fingerprint", &self.fingerprint)
            .field("sku", &self.sku)
            .field("ip", &self.ip)
            .field("state", &self.state)
            .field("is_manual", &self.is_manual)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<Device ip={}, fingerprint={}, sku={}>",
            self.ip, self.fingerprint, self.sku
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{ColorData, StatusResponse};

    fn test_device() -> Device {
        Device::new(
            "AA:BB:CC".to_string(),
            "H619A".to_string(),
            "10.0.0.5".parse().unwrap(),
            LightCapabilities::on_off_only(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_apply_status_overwrites_state() {
        let mut device = test_device();
        tokio::time::advance(std::time::Duration::from_secs(5)).await;

        let before = device.last_seen();
        device.apply_status(&StatusResponse {
            on_off: 1,
            brightness: 50,
            color: ColorData { r: 10, g: 20, b: 30 },
            color_tem_in_kelvin: 0,
        });

        assert_eq!(
            device.state(),
            DeviceState {
                on: true,
                brightness: 50,
                rgb_color: (10, 20, 30),
                temperature_color: 0,
            }
        );
        assert!(device.last_seen() > before);
    }

    #[test]
    fn test_immutable_identity_accessors() {
        let device = test_device();
        assert_eq!(device.fingerprint(), "AA:BB:CC");
        assert_eq!(device.sku(), "H619A");
        assert!(!device.is_manual());
        assert_eq!(device.state(), DeviceState::default());
    }
}
