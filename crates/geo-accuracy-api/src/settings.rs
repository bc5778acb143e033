//! YAML configuration for controller tuning and tenant ceilings.

use std::path::Path;

use geo_accuracy_core::ControllerConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::StaticCeilings;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read settings file: {0}")]
    Io(#[from] std::io::Error),
    #[error("settings YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid settings: {0}")]
    Validation(String),
}

/// Everything a deployment tunes. Missing sections fall back to defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct AccuracySettings {
    pub controller: ControllerConfig,
    pub ceilings: StaticCeilings,
}

impl AccuracySettings {
    /// Load settings from `path`, or defaults when no path is given.
    ///
    /// # Errors
    /// Returns [`SettingsError`] when the file is unreadable, malformed, or out of range.
    pub fn load(path: Option<&Path>) -> Result<Self, SettingsError> {
        match path {
            Some(path) => Self::from_path(path),
            None => Ok(Self::default()),
        }
    }

    /// Parse a settings file from a path.
    ///
    /// # Errors
    /// Returns [`SettingsError`] when the file is unreadable, malformed, or out of range.
    pub fn from_path(path: &Path) -> Result<Self, SettingsError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse settings from a YAML string.
    ///
    /// # Errors
    /// Returns [`SettingsError`] when the YAML is malformed or out of range.
    pub fn parse(yaml: &str) -> Result<Self, SettingsError> {
        let settings: Self = if yaml.trim().is_empty() {
            Self::default()
        } else {
            serde_yaml::from_str(yaml)?
        };
        settings.validate()?;
        Ok(settings)
    }

    /// # Errors
    /// Returns [`SettingsError::Validation`] naming the first offending value.
    pub fn validate(&self) -> Result<(), SettingsError> {
        self.controller.validate().map_err(|err| SettingsError::Validation(err.to_string()))?;
        self.ceilings.validate().map_err(SettingsError::Validation)
    }
}
