//! The controller: discovery, registry maintenance, status polling and
//! command dispatch, glued to the transport and the command executor.

use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use log::{debug, warn};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep};

use crate::capabilities::{LightCapabilities, LightFeatures, capabilities_for_sku};
use crate::command::{
    self, BoxFuture, CommandExecutor, CommandSink, StatePredicate,
};
use crate::config::ControllerConfig;
use crate::device::{Device, UpdateCallback};
use crate::errors::Error;
use crate::message::{self, CommandKind, LightColor, ResponseMessage, ScanResponse, StatusResponse};
use crate::registry::DeviceRegistry;
use crate::transport::TransportManager;

type Result<T> = std::result::Result<T, Error>;

/// Callback invoked for every scan response that names a device.
///
/// `is_new` is true when the fingerprint was not in the registry yet; in
/// that case a `false` return rejects the device and it is not added. The
/// return value is ignored for devices that were already known.
pub type DiscoveryCallback = Arc<dyn Fn(&Device, bool) -> bool + Send + Sync>;

/// Callback invoked with each device removed by eviction.
pub type EvictionCallback = Arc<dyn Fn(&Device) + Send + Sync>;

const RECV_BUFFER_SIZE: usize = 4096;

/// Runtime toggles, adjustable while the controller is running.
struct RuntimeFlags {
    discovery_enabled: bool,
    discovery_interval: Duration,
    evict_enabled: bool,
    evict_timeout: Duration,
    update_enabled: bool,
    update_interval: Duration,
}

// See command.rs: recover from poisoning instead of propagating a panic.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Asynchronous controller for Govee devices on the local network.
///
/// Cheap to clone; clones share all state.
///
/// # Examples
///
/// ```no_run
/// use govee_lan_rs::{ControllerConfig, GoveeController};
///
/// #[tokio::main]
/// async fn main() -> Result<(), govee_lan_rs::Error> {
///     let controller = GoveeController::new(
///         ControllerConfig::new().with_discovery(true),
///     )?;
///     controller.start().await?;
///
///     tokio::time::sleep(std::time::Duration::from_secs(5)).await;
///     for device in controller.devices() {
///         println!("found {device}");
///         controller.turn_on(device.fingerprint()).await?;
///     }
///
///     controller.shutdown().await;
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct GoveeController {
    inner: Arc<Inner>,
}

struct Inner {
    config: ControllerConfig,
    // Vacated by shutdown so the endpoints actually close once the
    // receive tasks have dropped their socket handles.
    transport: Mutex<Option<Arc<TransportManager>>>,
    registry: Mutex<DeviceRegistry>,
    executor: Arc<CommandExecutor>,
    flags: Mutex<RuntimeFlags>,
    discovery_callback: Mutex<Option<DiscoveryCallback>>,
    eviction_callback: Mutex<Option<EvictionCallback>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl GoveeController {
    /// Create a controller. Fails if the configuration is inconsistent,
    /// e.g. when the network mask count does not match the listening
    /// addresses.
    pub fn new(config: ControllerConfig) -> Result<Self> {
        config.validate()?;
        let flags = RuntimeFlags {
            discovery_enabled: config.discovery_enabled,
            discovery_interval: config.discovery_interval,
            evict_enabled: config.evict_enabled,
            evict_timeout: config.evict_timeout,
            update_enabled: config.update_enabled,
            update_interval: config.update_interval,
        };
        Ok(GoveeController {
            inner: Arc::new(Inner {
                config,
                transport: Mutex::new(None),
                registry: Mutex::new(DeviceRegistry::new()),
                executor: Arc::new(CommandExecutor::new()),
                flags: Mutex::new(flags),
                discovery_callback: Mutex::new(None),
                eviction_callback: Mutex::new(None),
                tasks: Mutex::new(Vec::new()),
            }),
        })
    }

    /// Bind the UDP endpoints and spawn the receive, discovery and status
    /// update loops.
    pub async fn start(&self) -> Result<()> {
        if lock(&self.inner.transport).is_some() {
            return Err(Error::AlreadyStarted);
        }
        let transport = Arc::new(TransportManager::bind(&self.inner.config).await?);
        {
            let mut slot = lock(&self.inner.transport);
            if slot.is_some() {
                return Err(Error::AlreadyStarted);
            }
            *slot = Some(Arc::clone(&transport));
        }

        let mut tasks = lock(&self.inner.tasks);
        for socket in transport.sockets() {
            tasks.push(tokio::spawn(receive_loop(
                Arc::clone(&self.inner),
                socket,
            )));
        }
        tasks.push(tokio::spawn(discovery_loop(Arc::clone(&self.inner))));
        tasks.push(tokio::spawn(update_loop(Arc::clone(&self.inner))));
        Ok(())
    }

    /// Stop all background tasks, abort in-flight command sequences, leave
    /// multicast groups, close the endpoints and clear the registry.
    pub async fn shutdown(&self) {
        let tasks: Vec<JoinHandle<()>> = lock(&self.inner.tasks).drain(..).collect();
        for task in tasks {
            task.abort();
            let _ = task.await;
        }
        self.inner.executor.shutdown().await;
        // All socket handles held by the aborted tasks are gone now, so
        // dropping the manager here releases the bound ports.
        if let Some(transport) = lock(&self.inner.transport).take() {
            transport.shutdown();
        }
        lock(&self.inner.registry).clear();
    }

    /// Run one discovery round immediately, independent of the periodic
    /// schedule.
    pub async fn trigger_discovery(&self) -> Result<()> {
        self.inner.transport()?;
        self.inner.run_discovery_once().await;
        Ok(())
    }

    /// Queue an address for unicast discovery. A device answering from a
    /// queued address is marked manual and re-scanned every round.
    /// Returns false if the address was already queued.
    ///
    /// Queuing a new address triggers an immediate scan of it rather than
    /// waiting for the next periodic round.
    pub fn add_device_to_queue(&self, ip: IpAddr) -> bool {
        let queued = lock(&self.inner.registry).add_to_queue(ip);
        if queued {
            self.kick_discovery();
        }
        queued
    }

    pub fn remove_device_from_queue(&self, ip: IpAddr) -> bool {
        lock(&self.inner.registry).remove_from_queue(ip)
    }

    /// Addresses queued for unicast discovery that have not answered yet.
    pub fn discovery_queue(&self) -> Vec<IpAddr> {
        lock(&self.inner.registry).queued_addresses()
    }

    /// Remove a device from the registry, e.g. after the user deleted it.
    pub fn remove_device(&self, fingerprint: &str) -> Option<Device> {
        lock(&self.inner.registry).remove_discovered_device(fingerprint)
    }

    /// Snapshot of all known devices.
    pub fn devices(&self) -> Vec<Device> {
        lock(&self.inner.registry).devices().cloned().collect()
    }

    pub fn device_by_fingerprint(&self, fingerprint: &str) -> Option<Device> {
        lock(&self.inner.registry)
            .get_by_fingerprint(fingerprint)
            .cloned()
    }

    pub fn device_by_ip(&self, ip: IpAddr) -> Option<Device> {
        lock(&self.inner.registry).get_by_ip(ip).cloned()
    }

    pub fn device_by_sku(&self, sku: &str) -> Option<Device> {
        lock(&self.inner.registry).get_by_sku(sku).cloned()
    }

    /// Replace the discovery callback, returning the previous one.
    pub fn set_discovery_callback(
        &self,
        callback: Option<DiscoveryCallback>,
    ) -> Option<DiscoveryCallback> {
        std::mem::replace(&mut *lock(&self.inner.discovery_callback), callback)
    }

    /// Replace the eviction callback, returning the previous one.
    pub fn set_eviction_callback(
        &self,
        callback: Option<EvictionCallback>,
    ) -> Option<EvictionCallback> {
        std::mem::replace(&mut *lock(&self.inner.eviction_callback), callback)
    }

    /// Replace the per-device update callback, returning the previous one.
    pub fn set_device_update_callback(
        &self,
        fingerprint: &str,
        callback: Option<UpdateCallback>,
    ) -> Result<Option<UpdateCallback>> {
        lock(&self.inner.registry)
            .get_by_fingerprint_mut(fingerprint)
            .map(|device| device.set_update_callback(callback))
            .ok_or_else(|| Error::DeviceNotFound(fingerprint.to_string()))
    }

    /// Enable or disable periodic discovery broadcasts. Enabling triggers
    /// an immediate round.
    pub fn set_discovery(&self, enabled: bool) {
        lock(&self.inner.flags).discovery_enabled = enabled;
        if enabled {
            self.kick_discovery();
        }
    }

    pub fn set_discovery_interval(&self, interval: Duration) {
        lock(&self.inner.flags).discovery_interval = interval;
    }

    pub fn set_eviction(&self, enabled: bool) {
        lock(&self.inner.flags).evict_enabled = enabled;
    }

    pub fn set_updates(&self, enabled: bool) {
        lock(&self.inner.flags).update_enabled = enabled;
    }

    pub fn set_update_interval(&self, interval: Duration) {
        lock(&self.inner.flags).update_interval = interval;
    }

    /// Turn a device on. Resent until a status response confirms it.
    pub async fn turn_on(&self, fingerprint: &str) -> Result<()> {
        self.set_power(fingerprint, true).await
    }

    /// Turn a device off. Resent until a status response confirms it.
    pub async fn turn_off(&self, fingerprint: &str) -> Result<()> {
        self.set_power(fingerprint, false).await
    }

    pub async fn set_power(&self, fingerprint: &str, on: bool) -> Result<()> {
        let device = self.inner.device_snapshot(fingerprint)?;
        self.inner
            .confirmed_command(
                &device,
                CommandKind::Turn,
                message::turn_request(on),
                command::power_predicate(on),
                |state| state.on = on,
            )
            .await
    }

    /// Set brightness as a percentage; values above 100 are clamped.
    /// Resent until confirmed.
    pub async fn set_brightness(&self, fingerprint: &str, brightness_pct: u8) -> Result<()> {
        let device = self.inner.device_snapshot(fingerprint)?;
        require_feature(&device, LightFeatures::BRIGHTNESS, "brightness")?;
        let target = brightness_pct.min(100);
        self.inner
            .confirmed_command(
                &device,
                CommandKind::Brightness,
                message::brightness_request(target),
                command::brightness_predicate(target),
                move |state| state.brightness = target,
            )
            .await
    }

    /// Set an RGB color or a color temperature. Resent until the reported
    /// state is within tolerance of the request.
    pub async fn set_color(&self, fingerprint: &str, color: LightColor) -> Result<()> {
        let device = self.inner.device_snapshot(fingerprint)?;
        let feature = match color {
            LightColor::Rgb(..) => LightFeatures::COLOR_RGB,
            LightColor::Kelvin(_) => LightFeatures::COLOR_KELVIN,
        };
        require_feature(&device, feature, "color")?;

        let clamped = color.clamped();
        self.inner
            .confirmed_command(
                &device,
                CommandKind::Color,
                message::color_request(clamped),
                command::color_predicate(clamped),
                move |state| match clamped {
                    LightColor::Rgb(r, g, b) => {
                        state.rgb_color = (r, g, b);
                        state.temperature_color = 0;
                    }
                    LightColor::Kelvin(kelvin) => {
                        state.rgb_color = (0, 0, 0);
                        state.temperature_color = kelvin;
                    }
                },
            )
            .await
    }

    /// Set the color of one segment (1-based index) of a segmented strip.
    /// Fire-and-forget: segment state is not reported back, so there is
    /// nothing to confirm against.
    pub async fn set_segment_rgb_color(
        &self,
        fingerprint: &str,
        segment: usize,
        rgb: (u8, u8, u8),
    ) -> Result<()> {
        let device = self.inner.device_snapshot(fingerprint)?;
        require_feature(&device, LightFeatures::SEGMENT_CONTROL, "segment control")?;

        let segments = &device.capabilities().segments;
        let selector = segment
            .checked_sub(1)
            .and_then(|index| segments.get(index))
            .copied()
            .ok_or(Error::SegmentOutOfRange {
                segment,
                available: segments.len(),
            })?;

        let frame = message::segment_color_frame(selector, rgb);
        self.inner
            .send_to_device(&device, &message::pt_real_request(&[frame]))
            .await
    }

    /// Activate a preset scene by name. Fire-and-forget.
    pub async fn set_scene(&self, fingerprint: &str, scene: &str) -> Result<()> {
        let device = self.inner.device_snapshot(fingerprint)?;
        require_feature(&device, LightFeatures::SCENES, "scenes")?;

        let code = device
            .capabilities()
            .scenes
            .get(scene)
            .copied()
            .ok_or_else(|| Error::SceneNotFound(scene.to_string()))?;

        let frame = message::scene_frame(code);
        self.inner
            .send_to_device(&device, &message::pt_real_request(&[frame]))
            .await
    }

    /// Send a raw hex-encoded `ptReal` command as-is, without padding or
    /// checksum. Fire-and-forget; no capability check.
    pub async fn send_raw_command(&self, fingerprint: &str, hex_command: &str) -> Result<()> {
        let device = self.inner.device_snapshot(fingerprint)?;
        let frame = message::raw_hex_frame(hex_command)?;
        self.inner
            .send_to_device(&device, &message::pt_real_request(&[frame]))
            .await
    }

    /// Request a fresh status from one device.
    pub async fn request_status(&self, fingerprint: &str) -> Result<()> {
        let device = self.inner.device_snapshot(fingerprint)?;
        self.inner
            .send_to_device(&device, &message::status_request())
            .await
    }

    /// Fire a one-shot discovery round in the background. A no-op before
    /// `start` or outside a runtime; the periodic loop covers it then.
    fn kick_discovery(&self) {
        if lock(&self.inner.transport).is_none() {
            return;
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let inner = Arc::clone(&self.inner);
            handle.spawn(async move {
                inner.run_discovery_once().await;
            });
        }
    }
}

fn require_feature(device: &Device, feature: LightFeatures, name: &'static str) -> Result<()> {
    if device.capabilities().supports(feature) {
        Ok(())
    } else {
        Err(Error::feature_not_supported(device.sku(), name))
    }
}

impl Inner {
    fn transport(&self) -> Result<Arc<TransportManager>> {
        lock(&self.transport).clone().ok_or(Error::NotStarted)
    }

    fn device_snapshot(&self, fingerprint: &str) -> Result<Device> {
        lock(&self.registry)
            .get_by_fingerprint(fingerprint)
            .cloned()
            .ok_or_else(|| Error::DeviceNotFound(fingerprint.to_string()))
    }

    /// Write the expected state optimistically, then hand the payload to
    /// the executor for retry-until-confirmed delivery.
    async fn confirmed_command(
        self: &Arc<Self>,
        device: &Device,
        kind: CommandKind,
        payload: Vec<u8>,
        predicate: StatePredicate,
        optimistic: impl FnOnce(&mut crate::device::DeviceState),
    ) -> Result<()> {
        let transport = self.transport()?;

        if let Some(known) = lock(&self.registry).get_by_fingerprint_mut(device.fingerprint()) {
            optimistic(known.state_mut());
        }

        let sink: Arc<dyn CommandSink> = Arc::new(TransportSink {
            transport,
            command_port: self.config.command_port,
        });
        self.executor
            .submit(sink, device.fingerprint(), device.ip(), kind, payload, predicate)
            .await;
        Ok(())
    }

    async fn send_to_device(&self, device: &Device, payload: &[u8]) -> Result<()> {
        let transport = self.transport()?;
        transport
            .send_to(payload, device.ip(), self.config.command_port)
            .await;
        Ok(())
    }

    /// One discovery round: multicast scan when enabled, plus unicast
    /// scans to queued addresses and known manual devices.
    async fn run_discovery_once(&self) {
        let Ok(transport) = self.transport() else {
            return;
        };
        let discovery_enabled = lock(&self.flags).discovery_enabled;
        let payload = message::scan_request();

        if discovery_enabled {
            debug!("Broadcasting discovery scan");
            transport.broadcast(&payload).await;
        }

        let unicast_targets: Vec<IpAddr> = {
            let registry = lock(&self.registry);
            registry
                .queued_addresses()
                .into_iter()
                .chain(
                    registry
                        .devices()
                        .filter(|device| device.is_manual())
                        .map(|device| device.ip()),
                )
                .collect()
        };
        for ip in unicast_targets {
            debug!("Sending unicast scan to {ip}");
            transport
                .send_to(&payload, ip, self.config.broadcast_port)
                .await;
        }
    }

    fn handle_datagram(&self, data: &[u8], source: SocketAddr) {
        match message::parse_response(data) {
            Ok(ResponseMessage::Scan(scan)) => self.handle_scan(scan, source),
            Ok(ResponseMessage::Status(status)) => self.handle_status(status, source),
            Err(err) => debug!("Ignoring malformed datagram from {source}: {err}"),
        }
    }

    fn handle_scan(&self, scan: ScanResponse, source: SocketAddr) {
        let Some(fingerprint) = scan.device else {
            warn!("Scan response from {source} is missing the device id; dropped");
            return;
        };
        let Some(ip) = scan.ip.as_deref().and_then(|ip| ip.parse::<IpAddr>().ok()) else {
            warn!("Scan response from {source} has no usable ip; dropped");
            return;
        };

        // Decide under the lock, call back after releasing it.
        enum Outcome {
            Known(Device),
            Candidate(Device),
        }
        let outcome = {
            let mut registry = lock(&self.registry);
            if let Some(known) = registry.get_by_fingerprint_mut(&fingerprint) {
                if known.ip() != ip {
                    debug!("Device {fingerprint} moved from {} to {ip}", known.ip());
                    known.set_ip(ip);
                }
                known.update_last_seen();
                Outcome::Known(known.clone())
            } else {
                let Some(sku) = scan.sku else {
                    warn!("Scan response from {source} is missing the sku; dropped");
                    return;
                };
                let capabilities = match capabilities_for_sku(&sku) {
                    Some(capabilities) => capabilities.clone(),
                    None => {
                        warn!("Unknown model {sku}; falling back to power control only");
                        LightCapabilities::on_off_only()
                    }
                };
                Outcome::Candidate(Device::new(fingerprint.clone(), sku, ip, capabilities))
            }
        };

        let callback = lock(&self.discovery_callback).clone();
        match outcome {
            Outcome::Known(device) => {
                if let Some(callback) = callback {
                    // The return value only matters for new devices.
                    let _ = callback(&device, false);
                }
            }
            Outcome::Candidate(device) => {
                let accepted = callback.is_none_or(|callback| callback(&device, true));
                if accepted {
                    debug!("Discovered {device}");
                    lock(&self.registry).add_discovered_device(device);
                } else {
                    debug!("Device {device} rejected by discovery callback");
                }
            }
        }

        self.evict_stale_devices();
    }

    /// Eviction runs as the tail of scan handling, so it only triggers
    /// while discovery traffic is flowing.
    fn evict_stale_devices(&self) {
        let (enabled, timeout) = {
            let flags = lock(&self.flags);
            (flags.evict_enabled, flags.evict_timeout)
        };
        if !enabled {
            return;
        }
        let evicted = lock(&self.registry).evict(Instant::now(), timeout);
        if evicted.is_empty() {
            return;
        }
        let callback = lock(&self.eviction_callback).clone();
        for device in evicted {
            debug!("Evicted {device} after {:?} of silence", timeout);
            if let Some(callback) = &callback {
                callback(&device);
            }
        }
    }

    fn handle_status(&self, status: StatusResponse, source: SocketAddr) {
        let snapshot = {
            let mut registry = lock(&self.registry);
            match registry.get_by_ip_mut(source.ip()) {
                Some(device) => {
                    device.apply_status(&status);
                    Some(device.clone())
                }
                None => None,
            }
        };
        let Some(device) = snapshot else {
            debug!("Status response from unknown device {source}; dropped");
            return;
        };

        if let Some(callback) = device.update_callback() {
            callback(&device);
        }
        self.executor.on_status(device.fingerprint(), &device.state());
    }
}

/// Sends through the transport to the device command port.
struct TransportSink {
    transport: Arc<TransportManager>,
    command_port: u16,
}

impl CommandSink for TransportSink {
    fn send_command(&self, ip: IpAddr, payload: Vec<u8>) -> BoxFuture {
        let transport = Arc::clone(&self.transport);
        let port = self.command_port;
        Box::pin(async move { transport.send_to(&payload, ip, port).await })
    }

    fn request_status(&self, ip: IpAddr) -> BoxFuture {
        let transport = Arc::clone(&self.transport);
        let port = self.command_port;
        Box::pin(async move {
            transport
                .send_to(&message::status_request(), ip, port)
                .await
        })
    }
}

async fn receive_loop(inner: Arc<Inner>, socket: Arc<UdpSocket>) {
    let mut buffer = vec![0u8; RECV_BUFFER_SIZE];
    loop {
        match socket.recv_from(&mut buffer).await {
            Ok((len, source)) => inner.handle_datagram(&buffer[..len], source),
            Err(err) => {
                warn!("Receive error: {err}");
                sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn discovery_loop(inner: Arc<Inner>) {
    loop {
        inner.run_discovery_once().await;
        let interval = lock(&inner.flags).discovery_interval;
        sleep(interval).await;
    }
}

async fn update_loop(inner: Arc<Inner>) {
    loop {
        let enabled = lock(&inner.flags).update_enabled;
        if enabled && let Ok(transport) = inner.transport() {
            let targets: Vec<IpAddr> = lock(&inner.registry)
                .devices()
                .map(|device| device.ip())
                .collect();
            let payload = message::status_request();
            for ip in targets {
                transport
                    .send_to(&payload, ip, inner.config.command_port)
                    .await;
            }
        }
        let interval = lock(&inner.flags).update_interval;
        sleep(interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::time::timeout;

    fn controller() -> GoveeController {
        GoveeController::new(ControllerConfig::new()).unwrap()
    }

    fn source() -> SocketAddr {
        "10.0.0.5:4002".parse().unwrap()
    }

    fn scan_datagram(device: &str, sku: &str, ip: &str) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "msg": {"cmd": "scan", "data": {"device": device, "sku": sku, "ip": ip}}
        }))
        .unwrap()
    }

    fn status_datagram(on_off: u8, brightness: u8) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "msg": {"cmd": "devStatus", "data": {
                "onOff": on_off,
                "brightness": brightness,
                "color": {"r": 0, "g": 0, "b": 0},
                "colorTemInKelvin": 0,
            }}
        }))
        .unwrap()
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let config = ControllerConfig::new()
            .with_listening_addresses(vec!["192.168.1.100".parse().unwrap()])
            .with_network_masks(vec!["/24".to_string(), "/8".to_string()]);
        assert!(GoveeController::new(config).is_err());
    }

    #[test]
    fn test_scan_response_registers_device() {
        let controller = controller();
        controller
            .inner
            .handle_datagram(&scan_datagram("AA:BB:CC", "H619A", "10.0.0.5"), source());

        let device = controller.device_by_fingerprint("AA:BB:CC").unwrap();
        assert_eq!(device.sku(), "H619A");
        assert_eq!(device.ip(), "10.0.0.5".parse::<IpAddr>().unwrap());
        assert!(!device.is_manual());
    }

    #[test]
    fn test_scan_without_ip_is_dropped() {
        let controller = controller();
        let datagram = serde_json::to_vec(&json!({
            "msg": {"cmd": "scan", "data": {"device": "AA:BB:CC", "sku": "H619A"}}
        }))
        .unwrap();
        controller.inner.handle_datagram(&datagram, source());
        assert!(controller.devices().is_empty());
    }

    #[test]
    fn test_unknown_sku_falls_back_to_power_only() {
        let controller = controller();
        controller
            .inner
            .handle_datagram(&scan_datagram("AA:BB:CC", "H0000", "10.0.0.5"), source());

        let device = controller.device_by_fingerprint("AA:BB:CC").unwrap();
        assert!(device.capabilities().features.is_empty());
    }

    #[test]
    fn test_discovery_callback_can_reject_new_devices() {
        let controller = controller();
        controller.set_discovery_callback(Some(Arc::new(|_, _| false)));
        controller
            .inner
            .handle_datagram(&scan_datagram("AA:BB:CC", "H619A", "10.0.0.5"), source());
        assert!(controller.devices().is_empty());
    }

    #[test]
    fn test_rediscovery_updates_ip_and_ignores_callback_veto() {
        let controller = controller();
        let new_seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&new_seen);
        controller.set_discovery_callback(Some(Arc::new(move |_, is_new| {
            if is_new {
                counter.fetch_add(1, Ordering::SeqCst);
            }
            // Rejecting an already-known device must have no effect.
            is_new
        })));

        controller
            .inner
            .handle_datagram(&scan_datagram("AA:BB:CC", "H619A", "10.0.0.5"), source());
        controller
            .inner
            .handle_datagram(&scan_datagram("AA:BB:CC", "H619A", "10.0.0.9"), source());

        assert_eq!(controller.devices().len(), 1);
        assert_eq!(new_seen.load(Ordering::SeqCst), 1);
        let device = controller.device_by_fingerprint("AA:BB:CC").unwrap();
        assert_eq!(device.ip(), "10.0.0.9".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn test_status_updates_state_and_fires_callback() {
        let controller = controller();
        controller
            .inner
            .handle_datagram(&scan_datagram("AA:BB:CC", "H619A", "10.0.0.5"), source());

        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        controller
            .set_device_update_callback(
                "AA:BB:CC",
                Some(Arc::new(move |device| {
                    assert_eq!(device.state().brightness, 75);
                    flag.store(true, Ordering::SeqCst);
                })),
            )
            .unwrap();

        controller
            .inner
            .handle_datagram(&status_datagram(1, 75), source());

        assert!(fired.load(Ordering::SeqCst));
        let device = controller.device_by_fingerprint("AA:BB:CC").unwrap();
        assert!(device.state().on);
        assert_eq!(device.state().brightness, 75);
    }

    #[test]
    fn test_status_from_unknown_ip_is_dropped() {
        let controller = controller();
        controller
            .inner
            .handle_datagram(&status_datagram(1, 75), source());
        assert!(controller.devices().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_eviction_runs_on_scan_traffic() {
        let controller = controller();
        controller.set_eviction(true);
        let evicted = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&evicted);
        controller.set_eviction_callback(Some(Arc::new(move |device: &Device| {
            lock(&sink).push(device.fingerprint().to_string());
        })));

        controller
            .inner
            .handle_datagram(&scan_datagram("OLD", "H619A", "10.0.0.5"), source());
        tokio::time::advance(Duration::from_secs(31)).await;
        controller.inner.handle_datagram(
            &scan_datagram("FRESH", "H619A", "10.0.0.6"),
            "10.0.0.6:4002".parse().unwrap(),
        );

        assert_eq!(*lock(&evicted), vec!["OLD".to_string()]);
        assert!(controller.device_by_fingerprint("OLD").is_none());
        assert!(controller.device_by_fingerprint("FRESH").is_some());
    }

    #[test]
    fn test_commands_require_known_device() {
        let controller = controller();
        let result = futures_executor(controller.turn_on("AA:BB:CC"));
        assert_eq!(result, Err(Error::DeviceNotFound("AA:BB:CC".to_string())));
    }

    // Minimal block-on for non-async command error paths.
    fn futures_executor<F: std::future::Future>(future: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap()
            .block_on(future)
    }

    #[test]
    fn test_capability_checks() {
        let controller = controller();
        // H7012 is brightness-only: no color, no segments, no scenes.
        controller
            .inner
            .handle_datagram(&scan_datagram("AA:BB:CC", "H7012", "10.0.0.5"), source());

        let color = futures_executor(
            controller.set_color("AA:BB:CC", LightColor::Rgb(255, 0, 0)),
        );
        assert_eq!(
            color,
            Err(Error::feature_not_supported("H7012", "color"))
        );

        let segment =
            futures_executor(controller.set_segment_rgb_color("AA:BB:CC", 1, (255, 0, 0)));
        assert_eq!(
            segment,
            Err(Error::feature_not_supported("H7012", "segment control"))
        );

        let scene = futures_executor(controller.set_scene("AA:BB:CC", "sunset"));
        assert_eq!(
            scene,
            Err(Error::feature_not_supported("H7012", "scenes"))
        );
    }

    #[test]
    fn test_segment_range_and_scene_name_checks() {
        let controller = controller();
        controller
            .inner
            .handle_datagram(&scan_datagram("AA:BB:CC", "H619A", "10.0.0.5"), source());

        let out_of_range =
            futures_executor(controller.set_segment_rgb_color("AA:BB:CC", 16, (255, 0, 0)));
        assert_eq!(
            out_of_range,
            Err(Error::SegmentOutOfRange {
                segment: 16,
                available: 15,
            })
        );
        let zero = futures_executor(controller.set_segment_rgb_color("AA:BB:CC", 0, (255, 0, 0)));
        assert!(zero.is_err());

        let scene = futures_executor(controller.set_scene("AA:BB:CC", "disco"));
        assert_eq!(scene, Err(Error::SceneNotFound("disco".to_string())));
    }

    #[tokio::test]
    async fn test_shutdown_closes_endpoints() {
        // Reserve a free port, then release it for the controller.
        let port = {
            let reserved = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
            reserved.local_addr().unwrap().port()
        };
        let config = ControllerConfig::new()
            .with_listening_addresses(vec!["127.0.0.1".parse().unwrap()])
            .with_listening_port(port)
            .with_broadcast_address("127.0.0.1".parse().unwrap())
            .with_updates(false);
        let controller = GoveeController::new(config).unwrap();
        controller.start().await.unwrap();

        // A second bind without SO_REUSEADDR must fail while running.
        assert!(std::net::UdpSocket::bind(("127.0.0.1", port)).is_err());

        controller.shutdown().await;
        std::net::UdpSocket::bind(("127.0.0.1", port))
            .expect("endpoint still bound after shutdown");
    }

    #[tokio::test]
    async fn test_idle_discovery_sends_nothing() {
        let listener = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let listener_port = listener.local_addr().unwrap().port();

        let config = ControllerConfig::new()
            .with_listening_addresses(vec!["127.0.0.1".parse().unwrap()])
            .with_listening_port(0)
            .with_broadcast_address("127.0.0.1".parse().unwrap())
            .with_broadcast_port(listener_port)
            .with_updates(false);
        let controller = GoveeController::new(config).unwrap();
        controller.start().await.unwrap();
        controller.trigger_discovery().await.unwrap();

        // Discovery disabled and the queue empty: no datagram may leave.
        let mut buffer = [0u8; 64];
        let outcome = timeout(
            Duration::from_millis(200),
            listener.recv_from(&mut buffer),
        )
        .await;
        assert!(outcome.is_err(), "unexpected datagram while discovery is idle");

        // Queuing an address wakes discovery up again.
        controller.add_device_to_queue("127.0.0.1".parse().unwrap());
        let (len, _) = timeout(
            Duration::from_secs(2),
            listener.recv_from(&mut buffer),
        )
        .await
        .expect("queued address was never scanned")
        .unwrap();
        assert!(len > 0);

        controller.shutdown().await;
    }

    /// End-to-end over loopback: a fake device answers scans and statuses,
    /// and applies brightness commands.
    #[tokio::test]
    async fn test_loopback_discovery_and_confirmed_command() {
        let fake = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let fake_port = fake.local_addr().unwrap().port();

        let fake_task = tokio::spawn(async move {
            let mut buffer = vec![0u8; 4096];
            let mut brightness: u8 = 0;
            loop {
                let (len, source) = fake.recv_from(&mut buffer).await.unwrap();
                let value: serde_json::Value = match serde_json::from_slice(&buffer[..len]) {
                    Ok(value) => value,
                    Err(_) => continue,
                };
                let reply = match value["msg"]["cmd"].as_str() {
                    Some("scan") => json!({
                        "msg": {"cmd": "scan", "data": {
                            "device": "FA:KE:01",
                            "sku": "H619A",
                            "ip": "127.0.0.1",
                        }}
                    }),
                    Some("devStatus") => json!({
                        "msg": {"cmd": "devStatus", "data": {
                            "onOff": 1,
                            "brightness": brightness,
                            "color": {"r": 0, "g": 0, "b": 0},
                            "colorTemInKelvin": 0,
                        }}
                    }),
                    Some("brightness") => {
                        brightness = value["msg"]["data"]["value"].as_u64().unwrap() as u8;
                        continue;
                    }
                    _ => continue,
                };
                let payload = serde_json::to_vec(&reply).unwrap();
                fake.send_to(&payload, source).await.unwrap();
            }
        });

        let config = ControllerConfig::new()
            .with_listening_addresses(vec!["127.0.0.1".parse().unwrap()])
            .with_listening_port(0)
            .with_broadcast_address("127.0.0.1".parse().unwrap())
            .with_broadcast_port(fake_port)
            .with_command_port(fake_port)
            .with_discovery(true)
            .with_discovery_interval(Duration::from_millis(50))
            .with_updates(false);
        let controller = GoveeController::new(config).unwrap();
        controller.start().await.unwrap();

        timeout(Duration::from_secs(5), async {
            while controller.device_by_fingerprint("FA:KE:01").is_none() {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("device was never discovered");

        controller.set_brightness("FA:KE:01", 42).await.unwrap();
        timeout(Duration::from_secs(5), async {
            loop {
                let device = controller.device_by_fingerprint("FA:KE:01").unwrap();
                // Wait for the confirmed report, not the optimistic write.
                if device.state().on && device.state().brightness == 42 {
                    break;
                }
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("brightness change was never confirmed");

        controller.shutdown().await;
        assert!(controller.devices().is_empty());
        fake_task.abort();
    }
}
