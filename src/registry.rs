//! Registry of discovered devices and queued manual addresses.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::time::Duration;

use tokio::time::Instant;

use crate::device::Device;

/// The authoritative map of known devices, keyed by fingerprint, plus the
/// queue of manually added addresses awaiting their first scan response.
///
/// A fingerprint appears in the discovered set at most once; an address
/// stays in the queue only until a device at that address is confirmed.
#[derive(Debug, Default)]
pub(crate) struct DeviceRegistry {
    discovered: HashMap<String, Device>,
    queue: HashSet<IpAddr>,
}

impl DeviceRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Insert a newly discovered device. If its address was sitting in the
    /// manual queue, consume the queue entry and mark the device manual.
    pub(crate) fn add_discovered_device(&mut self, mut device: Device) {
        if self.queue.remove(&device.ip()) {
            device.set_manual(true);
        }
        self.discovered.insert(device.fingerprint().to_string(), device);
    }

    pub(crate) fn remove_discovered_device(&mut self, fingerprint: &str) -> Option<Device> {
        self.discovered.remove(fingerprint)
    }

    /// Queue an address for unicast discovery. Returns false if it was
    /// already queued.
    pub(crate) fn add_to_queue(&mut self, ip: IpAddr) -> bool {
        self.queue.insert(ip)
    }

    pub(crate) fn remove_from_queue(&mut self, ip: IpAddr) -> bool {
        self.queue.remove(&ip)
    }

    pub(crate) fn queued_addresses(&self) -> Vec<IpAddr> {
        self.queue.iter().copied().collect()
    }

    pub(crate) fn get_by_fingerprint(&self, fingerprint: &str) -> Option<&Device> {
        self.discovered.get(fingerprint)
    }

    pub(crate) fn get_by_fingerprint_mut(&mut self, fingerprint: &str) -> Option<&mut Device> {
        self.discovered.get_mut(fingerprint)
    }

    // Linear scans: device counts are tens, not thousands.

    pub(crate) fn get_by_ip(&self, ip: IpAddr) -> Option<&Device> {
        self.discovered.values().find(|device| device.ip() == ip)
    }

    pub(crate) fn get_by_ip_mut(&mut self, ip: IpAddr) -> Option<&mut Device> {
        self.discovered.values_mut().find(|device| device.ip() == ip)
    }

    pub(crate) fn get_by_sku(&self, sku: &str) -> Option<&Device> {
        self.discovered.values().find(|device| device.sku() == sku)
    }

    pub(crate) fn devices(&self) -> impl Iterator<Item = &Device> {
        self.discovered.values()
    }

    /// Remove every device whose last-seen age is at least `timeout` and
    /// return them for the eviction callback.
    pub(crate) fn evict(&mut self, now: Instant, timeout: Duration) -> Vec<Device> {
        let expired: Vec<String> = self
            .discovered
            .values()
            .filter(|device| now.duration_since(device.last_seen()) >= timeout)
            .map(|device| device.fingerprint().to_string())
            .collect();

        expired
            .iter()
            .filter_map(|fingerprint| self.discovered.remove(fingerprint))
            .collect()
    }

    pub(crate) fn clear(&mut self) {
        self.discovered.clear();
        self.queue.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::LightCapabilities;

    fn device(fingerprint: &str, ip: &str) -> Device {
        Device::new(
            fingerprint.to_string(),
            "H619A".to_string(),
            ip.parse().unwrap(),
            LightCapabilities::on_off_only(),
        )
    }

    #[test]
    fn test_add_and_lookup() {
        let mut registry = DeviceRegistry::new();
        registry.add_discovered_device(device("AA:BB:CC", "10.0.0.5"));

        assert!(registry.get_by_fingerprint("AA:BB:CC").is_some());
        assert!(registry.get_by_ip("10.0.0.5".parse().unwrap()).is_some());
        assert!(registry.get_by_sku("H619A").is_some());
        assert!(registry.get_by_fingerprint("XX:YY:ZZ").is_none());
    }

    #[test]
    fn test_queued_address_consumed_on_discovery() {
        let mut registry = DeviceRegistry::new();
        let ip: IpAddr = "10.0.0.5".parse().unwrap();

        assert!(registry.add_to_queue(ip));
        assert!(!registry.add_to_queue(ip));

        registry.add_discovered_device(device("AA:BB:CC", "10.0.0.5"));

        assert!(registry.queued_addresses().is_empty());
        let discovered = registry.get_by_fingerprint("AA:BB:CC").unwrap();
        assert!(discovered.is_manual());
    }

    #[test]
    fn test_organic_discovery_is_not_manual() {
        let mut registry = DeviceRegistry::new();
        registry.add_discovered_device(device("AA:BB:CC", "10.0.0.5"));
        assert!(!registry.get_by_fingerprint("AA:BB:CC").unwrap().is_manual());
    }

    #[tokio::test(start_paused = true)]
    async fn test_eviction_threshold() {
        let timeout = Duration::from_secs(30);
        let mut registry = DeviceRegistry::new();
        registry.add_discovered_device(device("OLD", "10.0.0.5"));

        tokio::time::advance(Duration::from_secs(29)).await;
        registry.add_discovered_device(device("FRESH", "10.0.0.6"));
        // OLD is one second short of the timeout: retained.
        assert!(registry.evict(Instant::now(), timeout).is_empty());

        tokio::time::advance(Duration::from_secs(1)).await;
        let evicted = registry.evict(Instant::now(), timeout);
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].fingerprint(), "OLD");
        assert!(registry.get_by_fingerprint("OLD").is_none());
        assert!(registry.get_by_fingerprint("FRESH").is_some());
    }

    #[test]
    fn test_clear() {
        let mut registry = DeviceRegistry::new();
        registry.add_discovered_device(device("AA:BB:CC", "10.0.0.5"));
        registry.add_to_queue("10.0.0.9".parse().unwrap());

        registry.clear();
        assert_eq!(registry.devices().count(), 0);
        assert!(registry.queued_addresses().is_empty());
    }
}
