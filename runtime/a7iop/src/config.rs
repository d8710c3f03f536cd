//! Construction parameters for an A7IOP instance
//!
//! The SoC glue normally fills these from the coprocessor's device-tree
//! node; host tools load them from TOML:
//!
//! ```toml
//! role = "SMC"
//! generation = "v4"
//! mmio_size = 0x10000
//! protocol_version = 11
//! ```

use serde::{Deserialize, Serialize};

use crate::mailbox::regs::RegisterLayout;
use crate::{A7iopError, Result};

/// Default size of the coprocessor register window
pub const DEFAULT_MMIO_SIZE: u64 = 0x10000;

/// Default RTKit management protocol version
pub const DEFAULT_PROTOCOL_VERSION: u32 = 11;

/// Stride between the blocks of the v4 ("AKF") register window
pub const AKF_STRIDE: u64 = 0x4000;

/// Hardware generation of the mailbox block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Generation {
    /// Legacy layout: 2-word message slots
    V2,
    /// AKF layout: 4-word message slots
    V4,
}

impl Generation {
    /// Register layout of each mailbox window
    pub fn layout(self) -> &'static RegisterLayout {
        match self {
            Generation::V2 => &RegisterLayout::V2,
            Generation::V4 => &RegisterLayout::V4,
        }
    }

    /// Offset of the IOP mailbox window inside the coprocessor window
    pub fn iop_mailbox_base(self) -> u64 {
        match self {
            Generation::V2 => 0xB80,
            Generation::V4 => AKF_STRIDE + 0x100,
        }
    }

    /// Offset of the AP mailbox window inside the coprocessor window
    pub fn ap_mailbox_base(self) -> u64 {
        match self {
            Generation::V2 => AKF_STRIDE,
            Generation::V4 => AKF_STRIDE * 2 + 0x100,
        }
    }

    /// Smallest coprocessor window that holds both mailbox windows
    pub fn required_mmio_size(self) -> u64 {
        let window = self.layout().window_size;
        (self.iop_mailbox_base() + window).max(self.ap_mailbox_base() + window)
    }
}

fn default_mmio_size() -> u64 {
    DEFAULT_MMIO_SIZE
}

fn default_protocol_version() -> u32 {
    DEFAULT_PROTOCOL_VERSION
}

/// A7IOP construction parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct A7iopConfig {
    /// Coprocessor name used in log output (e.g. "SMC", "ANS2")
    pub role: String,

    /// Mailbox hardware generation
    pub generation: Generation,

    /// Size of the coprocessor register window
    #[serde(default = "default_mmio_size")]
    pub mmio_size: u64,

    /// RTKit protocol version announced in `hello`
    #[serde(default = "default_protocol_version")]
    pub protocol_version: u32,
}

impl A7iopConfig {
    /// Configuration with default window size and protocol version
    pub fn new(role: &str, generation: Generation) -> Self {
        Self {
            role: role.to_string(),
            generation,
            mmio_size: DEFAULT_MMIO_SIZE,
            protocol_version: DEFAULT_PROTOCOL_VERSION,
        }
    }

    /// Parse and validate a TOML document
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| A7iopError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check that the parameters describe a buildable device
    pub fn validate(&self) -> Result<()> {
        if self.role.is_empty() {
            return Err(A7iopError::InvalidConfig("role must not be empty".into()));
        }

        let required = self.generation.required_mmio_size();
        if self.mmio_size < required {
            return Err(A7iopError::WindowTooSmall {
                generation: self.generation,
                mmio_size: self.mmio_size,
                required,
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_with_defaults() {
        let config = A7iopConfig::from_toml_str(
            r#"
            role = "SMC"
            generation = "v4"
            "#,
        )
        .unwrap();

        assert_eq!(config.role, "SMC");
        assert_eq!(config.generation, Generation::V4);
        assert_eq!(config.mmio_size, DEFAULT_MMIO_SIZE);
        assert_eq!(config.protocol_version, DEFAULT_PROTOCOL_VERSION);
    }

    #[test]
    fn test_parse_hex_window() {
        let config = A7iopConfig::from_toml_str(
            r#"
            role = "ANS2"
            generation = "v2"
            mmio_size = 0x8000
            protocol_version = 12
            "#,
        )
        .unwrap();

        assert_eq!(config.mmio_size, 0x8000);
        assert_eq!(config.protocol_version, 12);
    }

    #[test]
    fn test_window_too_small() {
        let mut config = A7iopConfig::new("SEP", Generation::V4);
        config.mmio_size = 0x4000;

        assert!(matches!(
            config.validate(),
            Err(A7iopError::WindowTooSmall { required: 0x8840, .. })
        ));
    }

    #[test]
    fn test_unknown_generation_rejected() {
        let result = A7iopConfig::from_toml_str(
            r#"
            role = "SIO"
            generation = "v3"
            "#,
        );
        assert!(matches!(result, Err(A7iopError::InvalidConfig(_))));
    }

    #[test]
    fn test_required_sizes() {
        assert_eq!(Generation::V2.required_mmio_size(), AKF_STRIDE + 0x40);
        assert_eq!(Generation::V4.required_mmio_size(), AKF_STRIDE * 2 + 0x100 + 0x740);
    }
}
