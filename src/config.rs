//! Volume configuration, read from a JSON file and overridable from the
//! command line.

use alloc::string::{String, ToString};

use serde::{Deserialize, Serialize};

use crate::{
    common::{AlphaError, AlphaResult},
    layout::{Geometry, NAME_LENGTH},
    DEFAULT_BLOCK_SIZE,
};

/// Default image size: 16 MiB.
pub const DEFAULT_VOLUME_SIZE: u64 = 16 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlphaConfig {
    pub volume_name: String,
    /// Bytes; rounded down to whole blocks.
    pub volume_size: u64,
    pub block_size: u32,
    /// Host path of the image file.
    pub image: String,
}

impl Default for AlphaConfig {
    fn default() -> Self {
        Self {
            volume_name: "alpha".to_string(),
            volume_size: DEFAULT_VOLUME_SIZE,
            block_size: DEFAULT_BLOCK_SIZE,
            image: "alpha.img".to_string(),
        }
    }
}

impl AlphaConfig {
    /// Parses a JSON document. Missing fields take their defaults.
    pub fn from_json(data: &[u8]) -> AlphaResult<Self> {
        let config: Self =
            serde_json::from_slice(data).map_err(|e| AlphaError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> AlphaResult<String> {
        serde_json::to_string_pretty(self).map_err(|e| AlphaError::Config(e.to_string()))
    }

    pub fn total_blocks(&self) -> u64 {
        if self.block_size == 0 {
            return 0;
        }
        self.volume_size / self.block_size as u64
    }

    /// Rejects settings no volume could be formatted with.
    pub fn validate(&self) -> AlphaResult<()> {
        if self.volume_name.len() >= NAME_LENGTH || self.volume_name.contains('\0') {
            return Err(AlphaError::Config("volume name must be under 256 bytes with no NUL".into()));
        }
        if self.image.is_empty() {
            return Err(AlphaError::Config("image path is empty".into()));
        }
        Geometry::new(self.block_size, self.total_blocks())
            .map(|_| ())
            .map_err(|e| AlphaError::Config(e.to_string()))
    }
}
