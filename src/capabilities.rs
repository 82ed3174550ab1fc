//! Static per-model capability table.
//!
//! Capabilities are resolved once, when a device is first discovered, by
//! looking up its SKU here. The table is process-wide and read-only; models
//! missing from it fall back to [`LightCapabilities::on_off_only`].

use std::collections::HashMap;
use std::sync::LazyLock;

use bitflags::bitflags;

bitflags! {
    /// Feature set of a Govee light model.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct LightFeatures: u8 {
        /// RGB color via `colorwc`.
        const COLOR_RGB = 1 << 0;
        /// Color temperature via `colorwc`.
        const COLOR_KELVIN = 1 << 1;
        /// Brightness control.
        const BRIGHTNESS = 1 << 2;
        /// Per-segment color via `ptReal`.
        const SEGMENT_CONTROL = 1 << 3;
        /// Preset scenes via `ptReal`.
        const SCENES = 1 << 4;
    }
}

/// Capabilities of one light model.
#[derive(Debug, Clone, PartialEq)]
pub struct LightCapabilities {
    /// Supported features.
    pub features: LightFeatures,
    /// Ordered per-segment selector codes; empty when the model has no
    /// addressable segments. Segment `n` (1-based) uses `segments[n - 1]`.
    pub segments: Vec<[u8; 2]>,
    /// Scene name to scene code.
    pub scenes: HashMap<&'static str, u8>,
}

impl LightCapabilities {
    /// Fallback for unrecognized models: power control only.
    pub fn on_off_only() -> Self {
        LightCapabilities {
            features: LightFeatures::empty(),
            segments: Vec::new(),
            scenes: HashMap::new(),
        }
    }

    /// Whether the model supports all features in `features`.
    pub fn supports(&self, features: LightFeatures) -> bool {
        self.features.contains(features)
    }

    fn rgb() -> Self {
        LightCapabilities {
            features: LightFeatures::COLOR_RGB
                | LightFeatures::COLOR_KELVIN
                | LightFeatures::BRIGHTNESS,
            segments: Vec::new(),
            scenes: HashMap::new(),
        }
    }

    fn brightness_only() -> Self {
        LightCapabilities {
            features: LightFeatures::BRIGHTNESS,
            segments: Vec::new(),
            scenes: HashMap::new(),
        }
    }

    fn segmented(segment_count: usize) -> Self {
        LightCapabilities {
            features: LightFeatures::COLOR_RGB
                | LightFeatures::COLOR_KELVIN
                | LightFeatures::BRIGHTNESS
                | LightFeatures::SEGMENT_CONTROL
                | LightFeatures::SCENES,
            segments: segment_selectors(segment_count),
            scenes: scene_table(),
        }
    }
}

/// One-hot little-endian selector code per segment.
fn segment_selectors(count: usize) -> Vec<[u8; 2]> {
    (0..count as u16).map(|i| (1u16 << i).to_le_bytes()).collect()
}

fn scene_table() -> HashMap<&'static str, u8> {
    HashMap::from([
        ("sunrise", 0),
        ("sunset", 1),
        ("movie", 4),
        ("dating", 5),
        ("romantic", 7),
        ("blinking", 8),
        ("candlelight", 9),
        ("snowflake", 15),
    ])
}

/// RGBIC strip models with addressable segments and scene support.
const SEGMENTED_SKUS: &[&str] = &[
    "H6172", "H6173", "H618A", "H618C", "H618E", "H618F", "H619A", "H619B", "H619C", "H619D",
    "H619E", "H619Z", "H61A0", "H61A1", "H61A2", "H61A3", "H61A5", "H61A8", "H61B2", "H61E1",
];

/// Bulbs, lamps and non-IC strips: full color but no segments.
const RGB_SKUS: &[&str] = &[
    "H6046", "H6047", "H6051", "H6052", "H6056", "H6059", "H6061", "H6062", "H6065", "H6066",
    "H6067", "H606A", "H6072", "H6073", "H6076", "H6078", "H6087", "H6088", "H608A", "H608B",
    "H610A", "H610B", "H6117", "H6159", "H615A", "H615E", "H6163", "H6168", "H61B5", "H61BE",
    "H61C3", "H61C5", "H61D3", "H7020", "H7021", "H7028", "H7041", "H7042", "H7050", "H7051",
    "H7055", "H705A", "H705B", "H705C", "H7060", "H7061", "H7062", "H7065", "H7066", "H70C1",
];

/// White-only fixtures.
const BRIGHTNESS_ONLY_SKUS: &[&str] = &["H7012", "H7013"];

const STRIP_SEGMENT_COUNT: usize = 15;

static GOVEE_LIGHT_CAPABILITIES: LazyLock<HashMap<&'static str, LightCapabilities>> =
    LazyLock::new(|| {
        let mut table = HashMap::new();
        for sku in SEGMENTED_SKUS {
            table.insert(*sku, LightCapabilities::segmented(STRIP_SEGMENT_COUNT));
        }
        for sku in RGB_SKUS {
            table.insert(*sku, LightCapabilities::rgb());
        }
        for sku in BRIGHTNESS_ONLY_SKUS {
            table.insert(*sku, LightCapabilities::brightness_only());
        }
        table
    });

/// Look up the capabilities of a model, or `None` if the SKU is unknown.
pub fn capabilities_for_sku(sku: &str) -> Option<&'static LightCapabilities> {
    GOVEE_LIGHT_CAPABILITIES.get(sku)
}
