//! Calibration and scaling transforms.
//!
//! Pure numeric layer, no I/O. Every sample moving through a scan passes
//! through one bound `CalCoef` plus one `CustomScale`:
//!
//! `value = custom.slope * (cal.slope * raw + cal.offset) + custom.offset`
//!
//! The device-side calibration table is loaded once per connection. At arm
//! time the table is combined with the per-channel range and the scan flags
//! into a flat coefficient snapshot indexed by position in the active
//! channel list; the rolling calibration index wraps modulo that list, so
//! one flat array serves an arbitrarily long multi-scan sequence.

use crate::error::DaqError;

/// Per-channel linear calibration, raw code to corrected value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalCoef {
    pub slope: f64,
    pub offset: f64,
}

impl CalCoef {
    pub const IDENTITY: CalCoef = CalCoef {
        slope: 1.0,
        offset: 0.0,
    };

    pub fn new(slope: f64, offset: f64) -> Self {
        Self { slope, offset }
    }

    /// Compose with an outer linear map: `outer(self(x))`.
    pub fn then(self, outer: CalCoef) -> CalCoef {
        CalCoef {
            slope: outer.slope * self.slope,
            offset: outer.slope * self.offset + outer.offset,
        }
    }
}

impl Default for CalCoef {
    fn default() -> Self {
        Self::IDENTITY
    }
}

/// User-supplied secondary linear transform layered on top of calibration.
/// Defaults to identity; mutable any time except mid-scan for the owning
/// channel (the scan binds a snapshot at arm time).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CustomScale {
    pub slope: f64,
    pub offset: f64,
}

impl CustomScale {
    pub const IDENTITY: CustomScale = CustomScale {
        slope: 1.0,
        offset: 0.0,
    };

    pub fn new(slope: f64, offset: f64) -> Self {
        Self { slope, offset }
    }
}

impl Default for CustomScale {
    fn default() -> Self {
        Self::IDENTITY
    }
}

/// An input range in engineering units.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Range {
    pub min: f64,
    pub max: f64,
}

impl Range {
    pub const BIP10V: Range = Range {
        min: -10.0,
        max: 10.0,
    };
    pub const BIP5V: Range = Range {
        min: -5.0,
        max: 5.0,
    };
    pub const UNI10V: Range = Range {
        min: 0.0,
        max: 10.0,
    };

    pub fn span(&self) -> f64 {
        self.max - self.min
    }

    /// Code-to-units map for a converter of the given resolution.
    fn scale_coef(&self, resolution: u8) -> CalCoef {
        let counts = (1u64 << resolution) as f64;
        CalCoef {
            slope: self.span() / counts,
            offset: self.min,
        }
    }
}

/// Device calibration table, one coefficient per hardware channel.
/// Loaded once per connection from the device cal store; immutable during
/// a scan.
#[derive(Debug, Clone, Default)]
pub struct CalTable {
    coefs: Vec<CalCoef>,
}

impl CalTable {
    pub fn new(coefs: Vec<CalCoef>) -> Self {
        Self { coefs }
    }

    pub fn is_loaded(&self) -> bool {
        !self.coefs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.coefs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.coefs.is_empty()
    }

    /// Coefficient for one hardware channel.
    ///
    /// An empty table means the device never delivered calibration data;
    /// calibrated I/O must refuse to run rather than fall back to zeroed
    /// coefficients, which would corrupt every sample silently.
    pub fn coef(&self, channel: u8) -> Result<CalCoef, DaqError> {
        if self.coefs.is_empty() {
            return Err(DaqError::CalTableMissing);
        }
        self.coefs
            .get(channel as usize)
            .copied()
            .ok_or(DaqError::CalTableShort {
                needed: channel as usize + 1,
                actual: self.coefs.len(),
            })
    }
}

/// Coefficients bound for one scan channel: the combined linear map plus
/// the custom scale and the clamp domain.
#[derive(Debug, Clone, Copy)]
pub struct BoundCoef {
    pub cal: CalCoef,
    pub custom: CustomScale,
    /// Clamp ceiling when the result stays in the code domain.
    pub max_code: u64,
    /// Result stays in the raw-code domain.
    pub code_domain: bool,
}

impl BoundCoef {
    /// Forward transform: raw device code to destination-buffer value.
    pub fn apply(&self, raw: u64) -> f64 {
        let calibrated = self.cal.slope * raw as f64 + self.cal.offset;
        let value = self.custom.slope * calibrated + self.custom.offset;
        if self.code_domain {
            value.clamp(0.0, self.max_code as f64)
        } else {
            value
        }
    }

    /// Inverse transform for output: destination-buffer value to device
    /// code, clamped to the converter's range.
    pub fn to_code(&self, value: f64) -> u64 {
        let calibrated = (value - self.custom.offset) / self.custom.slope;
        let raw = (calibrated - self.cal.offset) / self.cal.slope;
        let raw = raw.round();
        if raw <= 0.0 {
            0
        } else if raw >= self.max_code as f64 {
            self.max_code
        } else {
            raw as u64
        }
    }
}

/// Combine the device cal table, per-channel range, and custom scales into
/// the flat snapshot a scan binds at arm time.
///
/// `no_calibrate` skips the device coefficients, `no_scale` keeps results
/// in the code domain (clamped to `[0, 2^resolution - 1]`). With both set
/// the transform is the identity on the raw code.
pub fn bind_scan_coefs(
    table: &CalTable,
    channels: &[(u8, Range)],
    customs: &[CustomScale],
    resolution: u8,
    no_calibrate: bool,
    no_scale: bool,
) -> Result<Vec<BoundCoef>, DaqError> {
    let max_code = (1u64 << resolution) - 1;
    let mut bound = Vec::with_capacity(channels.len());

    for &(channel, range) in channels {
        let cal = if no_calibrate {
            CalCoef::IDENTITY
        } else {
            table.coef(channel)?
        };
        let combined = if no_scale {
            cal
        } else {
            cal.then(range.scale_coef(resolution))
        };
        let custom = customs
            .get(channel as usize)
            .copied()
            .unwrap_or(CustomScale::IDENTITY);
        bound.push(BoundCoef {
            cal: combined,
            custom,
            max_code,
            code_domain: no_scale,
        });
    }

    Ok(bound)
}
