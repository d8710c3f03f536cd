//! Simulator configuration file

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;

use apple_a7iop::A7iopConfig;

/// Built-in configuration used when no file is given
const DEFAULT_CONFIG: &str = include_str!("../templates/smc.toml");

/// One endpoint registered on the simulated coprocessor
#[derive(Debug, Clone, Deserialize)]
pub struct EndpointConfig {
    /// Label for output
    pub name: String,

    /// Local id: user numbering unless `control` is set
    pub id: u32,

    /// Register as a control endpoint (raw id < 32)
    #[serde(default)]
    pub control: bool,
}

/// Whole simulator configuration
#[derive(Debug, Clone, Deserialize)]
pub struct SimConfig {
    #[serde(flatten)]
    pub iop: A7iopConfig,

    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,
}

impl SimConfig {
    /// Load from `path`, or the built-in SMC template if `None`
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (text, origin) = match path {
            Some(path) => (
                fs::read_to_string(path)
                    .with_context(|| format!("Failed to read {}", path.display()))?,
                path.display().to_string(),
            ),
            None => (DEFAULT_CONFIG.to_string(), "built-in smc.toml".to_string()),
        };

        let config: Self =
            toml::from_str(&text).with_context(|| format!("Failed to parse {}", origin))?;
        config
            .iop
            .validate()
            .with_context(|| format!("Invalid coprocessor in {}", origin))?;
        Ok(config)
    }
}
