//! An asynchronous library for discovering and controlling Govee smart
//! lights over their local-network UDP API.
//!
//! Devices with the "LAN Control" option enabled listen on the local
//! network: discovery requests go to a multicast group, commands and
//! status requests to each device's command port, and all responses come
//! back as UDP datagrams. [`GoveeController`] wraps the whole exchange:
//! it maintains a registry of discovered devices, polls their status
//! periodically, and resends stateful commands until the device confirms
//! the requested state, compensating for UDP's lack of delivery
//! guarantees.
//!
//! # Examples
//!
//! ```no_run
//! use govee_lan_rs::{ControllerConfig, GoveeController, LightColor};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), govee_lan_rs::Error> {
//!     let controller = GoveeController::new(
//!         ControllerConfig::new()
//!             .with_discovery(true)
//!             .with_eviction(true),
//!     )?;
//!     controller.start().await?;
//!
//!     // Give discovery a moment to hear back from the network.
//!     tokio::time::sleep(Duration::from_secs(3)).await;
//!
//!     for device in controller.devices() {
//!         println!("{device}");
//!         controller.turn_on(device.fingerprint()).await?;
//!         controller.set_brightness(device.fingerprint(), 80).await?;
//!         controller
//!             .set_color(device.fingerprint(), LightColor::Kelvin(4000))
//!             .await?;
//!     }
//!
//!     controller.shutdown().await;
//!     Ok(())
//! }
//! ```

mod capabilities;
mod command;
mod config;
mod controller;
mod device;
mod errors;
mod message;
mod registry;
mod transport;

pub use capabilities::{LightCapabilities, LightFeatures, capabilities_for_sku};
pub use config::{
    ControllerConfig, DEFAULT_BROADCAST_ADDRESS, DEFAULT_BROADCAST_PORT, DEFAULT_COMMAND_PORT,
    DEFAULT_LISTENING_PORT,
};
pub use controller::{DiscoveryCallback, EvictionCallback, GoveeController};
pub use device::{Device, DeviceState, UpdateCallback};
pub use errors::Error;
pub use message::{
    ColorData, CommandKind, LightColor, ScanResponse, StatusResponse, TEMPERATURE_MAX_KELVIN,
    TEMPERATURE_MIN_KELVIN,
};
