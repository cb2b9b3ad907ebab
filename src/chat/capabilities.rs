//! Model capability lookup.

use std::collections::HashMap;

use regex::Regex;

use crate::chat::core::{CapabilityConfig, ConfigError, ModelCapabilities};

/// Compiled capability table: exact ids first, then ordered rules.
#[derive(Clone, Debug)]
pub struct CapabilityTable {
    exact: HashMap<String, ModelCapabilities>,
    rules: Vec<(Regex, ModelCapabilities)>,
}

impl CapabilityTable {
    /// Compile the configured table.
    ///
    /// # Errors
    /// Returns an error if a rule pattern is not a valid regex.
    pub fn from_config(config: &CapabilityConfig) -> Result<Self, ConfigError> {
        let rules = config
            .rules
            .iter()
            .map(|rule| -> Result<_, ConfigError> {
                Ok((Regex::new(&rule.pattern)?, rule.capabilities))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            exact: config.models.clone(),
            rules,
        })
    }

    /// Capabilities of `model`. Unknown models get none.
    #[must_use]
    pub fn lookup(&self, model: &str) -> ModelCapabilities {
        if let Some(caps) = self.exact.get(model) {
            return *caps;
        }
        self.rules
            .iter()
            .find(|(pattern, _)| pattern.is_match(model))
            .map(|(_, caps)| *caps)
            .unwrap_or_default()
    }

    /// Whether `model` accepts image input.
    #[must_use]
    pub fn supports_vision(&self, model: &str) -> bool {
        self.lookup(model).vision
    }
}
