//! Wire codec for the Govee LAN protocol.
//!
//! Every datagram, in both directions, is a compact UTF-8 JSON envelope of
//! the shape `{"msg":{"cmd":<string>,"data":<object>}}`. Outbound requests
//! are built with [`serde_json::json!`]; inbound payloads are decoded into
//! typed responses and routed by the controller.
//!
//! Segment-color and scene commands are carried as `ptReal` messages whose
//! `command` array holds base64-encoded 20-byte binary frames with a
//! trailing XOR checksum.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Deserialize;
use serde_json::json;

use crate::errors::Error;

type Result<T> = std::result::Result<T, Error>;

/// Lowest color temperature accepted by the `colorwc` command.
pub const TEMPERATURE_MIN_KELVIN: u16 = 2000;
/// Highest color temperature accepted by the `colorwc` command.
pub const TEMPERATURE_MAX_KELVIN: u16 = 9000;

/// Length of a binary `ptReal` frame, checksum byte included.
const FRAME_LEN: usize = 20;

/// Kind of a stateful command.
///
/// The command executor allows at most one in-flight retry sequence per
/// `(device, CommandKind)` pair; a new command for the same pair supersedes
/// the previous one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum_macros::Display)]
#[strum(serialize_all = "camelCase")]
pub enum CommandKind {
    Turn,
    Brightness,
    Color,
}

/// Desired light color: either an RGB triplet or a color temperature.
///
/// Exactly one of the two is meaningful per `colorwc` command; the other
/// side is sent as zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LightColor {
    /// Red, green and blue channels (0-255 each).
    Rgb(u8, u8, u8),
    /// Color temperature in Kelvin, clamped to 2000-9000.
    Kelvin(u16),
}

impl LightColor {
    /// Clamp the color to the ranges accepted on the wire.
    pub(crate) fn clamped(self) -> Self {
        match self {
            LightColor::Rgb(..) => self,
            LightColor::Kelvin(k) => {
                LightColor::Kelvin(k.clamp(TEMPERATURE_MIN_KELVIN, TEMPERATURE_MAX_KELVIN))
            }
        }
    }
}

fn encode(cmd: &str, data: serde_json::Value) -> Vec<u8> {
    // The envelope is infallible to serialize; fall back to an empty scan
    // rather than panicking if that ever changes.
    serde_json::to_vec(&json!({"msg": {"cmd": cmd, "data": data}})).unwrap_or_default()
}

/// Build a `scan` discovery request.
pub(crate) fn scan_request() -> Vec<u8> {
    encode("scan", json!({"account_topic": "reserve"}))
}

/// Build a `devStatus` status request.
pub(crate) fn status_request() -> Vec<u8> {
    encode("devStatus", json!({}))
}

/// Build a `turn` power command.
pub(crate) fn turn_request(on: bool) -> Vec<u8> {
    encode("turn", json!({"value": u8::from(on)}))
}

/// Build a `brightness` command. The percentage is clamped to 0-100.
pub(crate) fn brightness_request(brightness_pct: u8) -> Vec<u8> {
    encode("brightness", json!({"value": brightness_pct.min(100)}))
}

/// Build a `colorwc` command from an RGB triplet or a Kelvin temperature.
pub(crate) fn color_request(color: LightColor) -> Vec<u8> {
    let data = match color.clamped() {
        LightColor::Rgb(r, g, b) => json!({
            "color": {"r": r, "g": g, "b": b},
            "colorTemInKelvin": 0,
        }),
        LightColor::Kelvin(kelvin) => json!({
            "color": {"r": 0, "g": 0, "b": 0},
            "colorTemInKelvin": kelvin,
        }),
    };
    encode("colorwc", data)
}

/// Build a `ptReal` command from already-encoded base64 frames.
pub(crate) fn pt_real_request(frames: &[String]) -> Vec<u8> {
    encode("ptReal", json!({"command": frames}))
}

/// Zero-pad `body` to 19 bytes and append the XOR checksum of all
/// preceding bytes, yielding a complete 20-byte frame.
fn checksum_frame(body: &[u8]) -> [u8; FRAME_LEN] {
    let mut frame = [0u8; FRAME_LEN];
    frame[..body.len()].copy_from_slice(body);
    let checksum = frame[..FRAME_LEN - 1].iter().fold(0u8, |acc, b| acc ^ b);
    frame[FRAME_LEN - 1] = checksum;
    frame
}

/// Build the base64 frame selecting one segment and setting its color.
pub(crate) fn segment_color_frame(selector: [u8; 2], rgb: (u8, u8, u8)) -> String {
    let (r, g, b) = rgb;
    let mut body = vec![0x33, 0x05, 0x15, r, g, b];
    body.extend_from_slice(&[0u8; 5]);
    body.extend_from_slice(&selector);
    BASE64.encode(checksum_frame(&body))
}

/// Build the base64 frame selecting a preset scene by its code.
pub(crate) fn scene_frame(code: u8) -> String {
    BASE64.encode(checksum_frame(&[0x33, 0x05, 0x04, code]))
}

/// Encode a raw hex command string as a base64 frame.
///
/// Raw commands are passed through as-is; no padding and no checksum byte
/// is appended.
pub(crate) fn raw_hex_frame(command: &str) -> Result<String> {
    let cleaned: String = command.chars().filter(|c| !c.is_whitespace()).collect();
    if cleaned.is_empty() || cleaned.len() % 2 != 0 {
        return Err(Error::InvalidHexCommand(command.to_string()));
    }
    let bytes = (0..cleaned.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&cleaned[i..i + 2], 16))
        .collect::<std::result::Result<Vec<u8>, _>>()
        .map_err(|_| Error::InvalidHexCommand(command.to_string()))?;
    Ok(BASE64.encode(bytes))
}

/// A decoded `scan` response.
///
/// All fields are optional at decode time; the controller drops responses
/// that are missing the fingerprint or the address.
#[derive(Debug, Clone, Deserialize)]
pub struct ScanResponse {
    /// Device fingerprint (hardware identifier).
    #[serde(default)]
    pub device: Option<String>,
    /// Model identifier.
    #[serde(default)]
    pub sku: Option<String>,
    /// Address the device claims to be reachable at.
    #[serde(default)]
    pub ip: Option<String>,
}

/// RGB channels of a `devStatus` response.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct ColorData {
    #[serde(default)]
    pub r: u8,
    #[serde(default)]
    pub g: u8,
    #[serde(default)]
    pub b: u8,
}

/// A decoded `devStatus` response.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    /// 1 when the device is on.
    #[serde(default)]
    pub on_off: u8,
    /// Brightness percentage (0-100).
    #[serde(default)]
    pub brightness: u8,
    /// Current RGB color.
    #[serde(default)]
    pub color: ColorData,
    /// Current color temperature in Kelvin (0 when in RGB mode).
    #[serde(default)]
    pub color_tem_in_kelvin: u16,
}

/// An inbound message decoded from a datagram.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "cmd", content = "data")]
pub enum ResponseMessage {
    #[serde(rename = "scan")]
    Scan(ScanResponse),
    #[serde(rename = "devStatus")]
    Status(StatusResponse),
}

#[derive(Debug, Deserialize)]
struct Envelope {
    msg: ResponseMessage,
}

/// Decode a datagram payload into a typed response.
///
/// Malformed JSON, a missing envelope or an unrecognized `cmd` all yield
/// an error; callers log and drop such datagrams.
pub(crate) fn parse_response(data: &[u8]) -> Result<ResponseMessage> {
    serde_json::from_slice::<Envelope>(data)
        .map(|envelope| envelope.msg)
        .map_err(Error::JsonLoad)
}
