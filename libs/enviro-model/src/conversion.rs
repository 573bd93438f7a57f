//! Custom raw-to-engineering-unit conversion specs
//!
//! Conversions are data, not code: a named record resolved into a pure
//! converter at configuration load time. Unknown kinds are rejected at
//! load, never at runtime.

use serde::{Deserialize, Serialize};

/// A named conversion record attached to a module configuration.
///
/// `{kind: "linear", scale, offset, signed, clamp}` maps a register word to
/// `scale * raw + offset`, with `raw` reinterpreted as signed 16-bit when
/// `signed` is set, and an optional validity range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversionSpec {
    pub kind: String,
    #[serde(default = "default_scale")]
    pub scale: f64,
    #[serde(default)]
    pub offset: f64,
    #[serde(default)]
    pub signed: bool,
    /// `[min, max]` validity range; values outside are decode errors.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clamp: Option<[f64; 2]>,
}

fn default_scale() -> f64 {
    1.0
}

impl ConversionSpec {
    pub fn is_known_kind(&self) -> bool {
        self.kind == "linear"
    }
}
