//! Tunables for the acceleration structure builders.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::util::{Error, Result};

/// Environment variable naming a JSON config file for [`AccelConfig::load`].
pub const CONFIG_ENV_VAR: &str = "RTACCEL_CONFIG";

/// Builder configuration, persisted as JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccelConfig {
    /// Frames the CPU may record ahead of the GPU (staging slot count)
    pub frames_in_flight: u32,
    /// Growth headroom for the TLAS instance buffer
    pub instance_headroom: f32,
    /// Growth headroom for acceleration structure storage and scratch buffers
    pub structure_headroom: f32,
    /// Growth headroom for the geometry metadata buffer
    pub metadata_headroom: f32,
    /// Request trace-optimized structures instead of build-optimized ones
    pub prefer_fast_trace: bool,
    /// Visibility mask assigned to new instances
    pub default_instance_mask: u8,
}

impl Default for AccelConfig {
    fn default() -> Self {
        Self {
            frames_in_flight: 2,
            instance_headroom: 0.25,
            structure_headroom: 0.0,
            metadata_headroom: 0.0,
            prefer_fast_trace: true,
            default_instance_mask: 0xFF,
        }
    }
}

impl AccelConfig {
    /// Load from the file named by `RTACCEL_CONFIG`, or defaults if unset.
    pub fn load() -> Result<Self> {
        match std::env::var_os(CONFIG_ENV_VAR) {
            Some(path) => Self::load_from(PathBuf::from(path)),
            None => Ok(Self::default()),
        }
    }

    /// Load and validate a JSON config file. Missing fields take defaults.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Write as pretty-printed JSON.
    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.frames_in_flight == 0 {
            return Err(Error::Config("frames_in_flight must be at least 1".into()));
        }
        for (name, value) in [
            ("instance_headroom", self.instance_headroom),
            ("structure_headroom", self.structure_headroom),
            ("metadata_headroom", self.metadata_headroom),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(Error::Config(format!("{name} must be finite and non-negative, got {value}")));
            }
        }
        Ok(())
    }
}
