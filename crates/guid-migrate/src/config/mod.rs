//! Configuration loading and validation.

mod types;
mod validation;

pub use types::*;

use crate::error::Result;
use std::path::Path;

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        validation::validate(self)
    }

    /// Override the credentials of both connections for one run.
    pub fn with_credentials(mut self, user: Option<String>, password: Option<String>) -> Self {
        if let Some(user) = user {
            self.source.user = user.clone();
            self.target.user = user;
        }
        if let Some(password) = password {
            for db in [&mut self.source, &mut self.target] {
                db.password = password.clone();
                db.password_env = None;
            }
        }
        self
    }
}
