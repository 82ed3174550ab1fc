//! Controller configuration.

use std::net::Ipv4Addr;
use std::time::Duration;

use crate::errors::Error;

/// Default multicast group Govee devices listen on for discovery.
pub const DEFAULT_BROADCAST_ADDRESS: Ipv4Addr = Ipv4Addr::new(239, 255, 255, 250);
/// Port devices receive scan requests on.
pub const DEFAULT_BROADCAST_PORT: u16 = 4001;
/// Port devices send their responses to.
pub const DEFAULT_LISTENING_PORT: u16 = 4002;
/// Port devices receive commands and status requests on.
pub const DEFAULT_COMMAND_PORT: u16 = 4003;

const DEFAULT_DISCOVERY_INTERVAL: Duration = Duration::from_secs(10);
const DEFAULT_EVICT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_UPDATE_INTERVAL: Duration = Duration::from_secs(5);

/// Configuration for [`GoveeController`](crate::GoveeController).
///
/// The defaults talk to real devices on the standard Govee ports, with
/// periodic discovery and eviction disabled and periodic status updates
/// enabled.
///
/// # Examples
///
/// ```
/// use govee_lan_rs::ControllerConfig;
/// use std::time::Duration;
///
/// let config = ControllerConfig::new()
///     .with_discovery(true)
///     .with_discovery_interval(Duration::from_secs(30))
///     .with_eviction(true);
/// ```
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub(crate) listening_addresses: Vec<Ipv4Addr>,
    pub(crate) listening_port: u16,
    pub(crate) broadcast_address: Ipv4Addr,
    pub(crate) broadcast_port: u16,
    pub(crate) command_port: u16,
    pub(crate) network_masks: Option<Vec<String>>,
    pub(crate) discovery_enabled: bool,
    pub(crate) discovery_interval: Duration,
    pub(crate) evict_enabled: bool,
    pub(crate) evict_timeout: Duration,
    pub(crate) update_enabled: bool,
    pub(crate) update_interval: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        ControllerConfig {
            listening_addresses: vec![Ipv4Addr::UNSPECIFIED],
            listening_port: DEFAULT_LISTENING_PORT,
            broadcast_address: DEFAULT_BROADCAST_ADDRESS,
            broadcast_port: DEFAULT_BROADCAST_PORT,
            command_port: DEFAULT_COMMAND_PORT,
            network_masks: None,
            discovery_enabled: false,
            discovery_interval: DEFAULT_DISCOVERY_INTERVAL,
            evict_enabled: false,
            evict_timeout: DEFAULT_EVICT_TIMEOUT,
            update_enabled: true,
            update_interval: DEFAULT_UPDATE_INTERVAL,
        }
    }
}

impl ControllerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Local addresses to bind one endpoint each on. The default binds a
    /// single wildcard endpoint.
    pub fn with_listening_addresses(mut self, addresses: Vec<Ipv4Addr>) -> Self {
        self.listening_addresses = addresses;
        self
    }

    pub fn with_listening_port(mut self, port: u16) -> Self {
        self.listening_port = port;
        self
    }

    /// Discovery target. A multicast group is joined on every endpoint; a
    /// unicast or broadcast address is used as-is.
    pub fn with_broadcast_address(mut self, address: Ipv4Addr) -> Self {
        self.broadcast_address = address;
        self
    }

    pub fn with_broadcast_port(mut self, port: u16) -> Self {
        self.broadcast_port = port;
        self
    }

    pub fn with_command_port(mut self, port: u16) -> Self {
        self.command_port = port;
        self
    }

    /// One network mask per listening address, as CIDR (`"/24"`) or dotted
    /// (`"255.255.255.0"`) notation, enabling precise outbound interface
    /// selection. The count must match the listening addresses.
    pub fn with_network_masks(mut self, masks: Vec<String>) -> Self {
        self.network_masks = Some(masks);
        self
    }

    pub fn with_discovery(mut self, enabled: bool) -> Self {
        self.discovery_enabled = enabled;
        self
    }

    pub fn with_discovery_interval(mut self, interval: Duration) -> Self {
        self.discovery_interval = interval;
        self
    }

    pub fn with_eviction(mut self, enabled: bool) -> Self {
        self.evict_enabled = enabled;
        self
    }

    /// How long a device may stay silent before eviction removes it.
    pub fn with_evict_timeout(mut self, timeout: Duration) -> Self {
        self.evict_timeout = timeout;
        self
    }

    pub fn with_updates(mut self, enabled: bool) -> Self {
        self.update_enabled = enabled;
        self
    }

    pub fn with_update_interval(mut self, interval: Duration) -> Self {
        self.update_interval = interval;
        self
    }

    pub(crate) fn validate(&self) -> Result<(), Error> {
        if self.listening_addresses.is_empty() {
            return Err(Error::NoListeningAddress);
        }
        if let Some(masks) = &self.network_masks
            && masks.len() != self.listening_addresses.len()
        {
            return Err(Error::NetworkMaskMismatch {
                addresses: self.listening_addresses.len(),
                masks: masks.len(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ControllerConfig::new();
        assert_eq!(config.listening_addresses, vec![Ipv4Addr::UNSPECIFIED]);
        assert_eq!(config.listening_port, 4002);
        assert_eq!(config.broadcast_address.to_string(), "239.255.255.250");
        assert_eq!(config.broadcast_port, 4001);
        assert_eq!(config.command_port, 4003);
        assert!(!config.discovery_enabled);
        assert!(!config.evict_enabled);
        assert!(config.update_enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_mask_count_must_match_addresses() {
        let config = ControllerConfig::new()
            .with_listening_addresses(vec![
                "192.168.1.100".parse().unwrap(),
                "10.0.0.100".parse().unwrap(),
            ])
            .with_network_masks(vec!["/24".to_string()]);

        assert_eq!(
            config.validate(),
            Err(Error::NetworkMaskMismatch {
                addresses: 2,
                masks: 1,
            })
        );
    }

    #[test]
    fn test_empty_addresses_rejected() {
        let config = ControllerConfig::new().with_listening_addresses(Vec::new());
        assert_eq!(config.validate(), Err(Error::NoListeningAddress));
    }
}
