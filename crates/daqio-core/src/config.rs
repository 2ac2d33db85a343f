//! Scan configuration files.
//!
//! A `ScanConfig` captures one scan setup in TOML so measurements are
//! reproducible from a file instead of hard-coded arguments.

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::calibration::Range;
use crate::scan::{ChannelSpec, ScanParams};
use crate::session::{ScanFlags, ScanOptions};

/// One scan setup, serializable to TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanConfig {
    /// Channels to scan, in acquisition order.
    pub channels: Vec<u8>,
    pub rate: f64,
    pub samples_per_channel: usize,
    #[serde(default)]
    pub continuous: bool,
    #[serde(default)]
    pub burst: bool,
    #[serde(default)]
    pub no_calibrate: bool,
    #[serde(default)]
    pub no_scale: bool,
    /// Input range applied to every channel.
    #[serde(default = "default_range_min")]
    pub range_min: f64,
    #[serde(default = "default_range_max")]
    pub range_max: f64,
    /// Device host for Ethernet transports.
    #[serde(default)]
    pub host: Option<String>,
}

fn default_range_min() -> f64 {
    -10.0
}

fn default_range_max() -> f64 {
    10.0
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            channels: vec![0],
            rate: 1000.0,
            samples_per_channel: 1000,
            continuous: false,
            burst: false,
            no_calibrate: false,
            no_scale: false,
            range_min: default_range_min(),
            range_max: default_range_max(),
            host: None,
        }
    }
}

impl ScanConfig {
    /// Load configuration from a TOML file.
    pub fn load_from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: ScanConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file.
    pub fn save_to_file<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Expand into the arm-time parameter set.
    pub fn to_params(&self) -> ScanParams {
        let range = Range {
            min: self.range_min,
            max: self.range_max,
        };
        let mut options = ScanOptions::NONE;
        if self.continuous {
            options = options | ScanOptions::CONTINUOUS;
        }
        if self.burst {
            options = options | ScanOptions::BURST;
        }
        let mut flags = ScanFlags::NONE;
        if self.no_calibrate {
            flags = flags | ScanFlags::NO_CALIBRATE;
        }
        if self.no_scale {
            flags = flags | ScanFlags::NO_SCALE;
        }
        ScanParams {
            channels: self
                .channels
                .iter()
                .map(|&c| ChannelSpec::new(c, range))
                .collect(),
            samples_per_channel: self.samples_per_channel,
            rate: self.rate,
            options,
            flags,
            trigger: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_toml_roundtrip() {
        let config = ScanConfig {
            channels: vec![0, 1, 4],
            rate: 20_000.0,
            samples_per_channel: 4096,
            continuous: true,
            no_scale: true,
            ..Default::default()
        };
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: ScanConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.channels, vec![0, 1, 4]);
        assert_eq!(parsed.rate, 20_000.0);
        assert!(parsed.continuous);
        assert!(parsed.no_scale);
        assert!(!parsed.no_calibrate);
    }

    #[test]
    fn test_to_params_maps_options_and_flags() {
        let config = ScanConfig {
            channels: vec![2, 3],
            continuous: true,
            no_calibrate: true,
            ..Default::default()
        };
        let params = config.to_params();
        assert_eq!(params.channels.len(), 2);
        assert_eq!(params.channels[1].channel, 3);
        assert!(params.options.contains(ScanOptions::CONTINUOUS));
        assert!(params.flags.contains(ScanFlags::NO_CALIBRATE));
        assert!(!params.flags.contains(ScanFlags::NO_SCALE));
    }

    #[test]
    fn test_minimal_toml_uses_defaults() {
        let parsed: ScanConfig =
            toml::from_str("channels = [0]\nrate = 500.0\nsamples_per_channel = 100\n").unwrap();
        assert_eq!(parsed.range_min, -10.0);
        assert_eq!(parsed.range_max, 10.0);
        assert!(!parsed.continuous);
        assert!(parsed.host.is_none());
    }
}
