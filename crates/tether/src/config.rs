//! Engine limits.

use serde::Serialize;

use crate::engine::QuickJs;
use crate::error::Result;

pub const MEMORY_LIMIT_ENV: &str = "TETHER_MEMORY_LIMIT";
pub const GC_THRESHOLD_ENV: &str = "TETHER_GC_THRESHOLD";
pub const MAX_STACK_SIZE_ENV: &str = "TETHER_MAX_STACK_SIZE";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var} must be a byte count, got {value:?}")]
    InvalidNumber { var: &'static str, value: String },
}

/// Limits applied to a new engine. `None` leaves the QuickJS default in place.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EngineConfig {
    pub memory_limit: Option<usize>,
    pub gc_threshold: Option<usize>,
    pub max_stack_size: Option<usize>,
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads `TETHER_MEMORY_LIMIT`, `TETHER_GC_THRESHOLD` and `TETHER_MAX_STACK_SIZE`.
    pub fn from_env() -> std::result::Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    pub(crate) fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
    ) -> std::result::Result<Self, ConfigError> {
        let read = |var: &'static str| -> std::result::Result<Option<usize>, ConfigError> {
            match lookup(var) {
                None => Ok(None),
                Some(value) if value.trim().is_empty() => Ok(None),
                Some(value) => match value.trim().parse::<usize>() {
                    Ok(bytes) => Ok(Some(bytes)),
                    Err(_) => Err(ConfigError::InvalidNumber { var, value }),
                },
            }
        };

        Ok(Self {
            memory_limit: read(MEMORY_LIMIT_ENV)?,
            gc_threshold: read(GC_THRESHOLD_ENV)?,
            max_stack_size: read(MAX_STACK_SIZE_ENV)?,
        })
    }

    pub fn with_memory_limit(mut self, bytes: usize) -> Self {
        self.memory_limit = Some(bytes);
        self
    }

    pub fn with_gc_threshold(mut self, bytes: usize) -> Self {
        self.gc_threshold = Some(bytes);
        self
    }

    pub fn with_max_stack_size(mut self, bytes: usize) -> Self {
        self.max_stack_size = Some(bytes);
        self
    }

    /// Applies every limit that is set.
    pub fn apply(&self, engine: &QuickJs) -> Result<()> {
        if let Some(bytes) = self.memory_limit {
            engine.set_memory_limit(bytes)?;
        }
        if let Some(bytes) = self.gc_threshold {
            engine.set_gc_threshold(bytes)?;
        }
        if let Some(bytes) = self.max_stack_size {
            engine.set_max_stack_size(bytes)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |var| vars.get(var).cloned()
    }

    #[test]
    fn empty_environment_uses_engine_defaults() {
        let config = EngineConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn environment_values_are_parsed() {
        let config = EngineConfig::from_lookup(lookup(&[
            (MEMORY_LIMIT_ENV, "33554432"),
            (MAX_STACK_SIZE_ENV, " 262144 "),
            (GC_THRESHOLD_ENV, ""),
        ]))
        .unwrap();
        insta::assert_json_snapshot!(config, @r#"
        {
          "memory_limit": 33554432,
          "gc_threshold": null,
          "max_stack_size": 262144
        }
        "#);
    }

    #[test]
    fn invalid_number_names_the_variable() {
        let err = EngineConfig::from_lookup(lookup(&[(GC_THRESHOLD_ENV, "lots")])).unwrap_err();
        insta::assert_snapshot!(err, @r#"TETHER_GC_THRESHOLD must be a byte count, got "lots""#);
    }

    #[test]
    fn builder_overrides_and_applies() {
        let config = EngineConfig::new()
            .with_memory_limit(16 * 1024 * 1024)
            .with_gc_threshold(1024 * 1024)
            .with_max_stack_size(512 * 1024);
        assert_eq!(config.memory_limit, Some(16 * 1024 * 1024));

        let engine = QuickJs::with_config(&config).unwrap();
        let usage = engine.memory_usage().unwrap();
        assert_eq!(usage.malloc_limit, 16 * 1024 * 1024);
    }
}
