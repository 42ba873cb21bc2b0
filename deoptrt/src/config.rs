//! Runtime configuration.

use crate::errors::DeoptError;
use deoptmap::translation::DEFAULT_TRANSLATION_LIMIT;
use std::{env, str::FromStr};

/// The default number of entries in each deoptimisation entry table.
pub const DEFAULT_ENTRY_COUNT: usize = 4096;

/// Configure an [Isolate](crate::isolate::Isolate). Settings not given explicitly take their
/// defaults, which can be overridden with `DEOPTD_*` environment variables via [Self::from_env].
#[derive(Clone, Debug)]
pub struct DeoptConfig {
    entry_count: usize,
    translation_limit: usize,
    gc_interval: Option<usize>,
}

impl DeoptConfig {
    pub fn new() -> Self {
        Self {
            entry_count: DEFAULT_ENTRY_COUNT,
            translation_limit: DEFAULT_TRANSLATION_LIMIT,
            gc_interval: None,
        }
    }

    /// Start from the defaults and apply `DEOPTD_ENTRY_COUNT`, `DEOPTD_TRANSLATION_LIMIT` and
    /// `DEOPTD_GC_INTERVAL` if they are set.
    pub fn from_env() -> Result<Self, DeoptError> {
        let mut c = Self::new();
        if let Some(x) = env_usize("DEOPTD_ENTRY_COUNT")? {
            c = c.entry_count(x)?;
        }
        if let Some(x) = env_usize("DEOPTD_TRANSLATION_LIMIT")? {
            c = c.translation_limit(x)?;
        }
        if let Some(x) = env_usize("DEOPTD_GC_INTERVAL")? {
            c = c.gc_interval(x)?;
        }
        Ok(c)
    }

    /// Set the number of entries in each deoptimisation entry table. Bailout ids must be less
    /// than this.
    pub fn entry_count(mut self, n: usize) -> Result<Self, DeoptError> {
        if n == 0 || n > i32::MAX as usize {
            return Err(DeoptError::Config(format!("entry count {n} out of range")));
        }
        self.entry_count = n;
        Ok(self)
    }

    /// Set the maximum size in bytes that a translation buffer may grow to.
    pub fn translation_limit(mut self, n: usize) -> Result<Self, DeoptError> {
        if n == 0 {
            return Err(DeoptError::Config(
                "translation limit must be greater than zero".into(),
            ));
        }
        self.translation_limit = n;
        Ok(self)
    }

    /// Force a heap collection every `n` allocations.
    pub fn gc_interval(mut self, n: usize) -> Result<Self, DeoptError> {
        if n == 0 {
            return Err(DeoptError::Config(
                "GC interval must be greater than zero".into(),
            ));
        }
        self.gc_interval = Some(n);
        Ok(self)
    }

    pub fn get_entry_count(&self) -> usize {
        self.entry_count
    }

    pub fn get_translation_limit(&self) -> usize {
        self.translation_limit
    }

    pub fn get_gc_interval(&self) -> Option<usize> {
        self.gc_interval
    }
}

impl Default for DeoptConfig {
    fn default() -> Self {
        Self::new()
    }
}

fn env_usize(name: &str) -> Result<Option<usize>, DeoptError> {
    match env::var(name) {
        Ok(s) => parse_usize(name, &s).map(Some),
        Err(_) => Ok(None),
    }
}

fn parse_usize(name: &str, s: &str) -> Result<usize, DeoptError> {
    usize::from_str(s.trim())
        .map_err(|e| DeoptError::Config(format!("Invalid {name} value '{s}': {e}")))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn builder() {
        let c = DeoptConfig::new()
            .entry_count(16)
            .unwrap()
            .gc_interval(2)
            .unwrap();
        assert_eq!(c.get_entry_count(), 16);
        assert_eq!(c.get_gc_interval(), Some(2));
        assert_eq!(c.get_translation_limit(), DEFAULT_TRANSLATION_LIMIT);
        assert!(DeoptConfig::new().entry_count(0).is_err());
        assert!(DeoptConfig::new().translation_limit(0).is_err());
        assert!(DeoptConfig::new().gc_interval(0).is_err());
    }

    #[test]
    fn parsing() {
        assert_eq!(parse_usize("X", " 12 ").unwrap(), 12);
        match parse_usize("DEOPTD_ENTRY_COUNT", "-1") {
            Err(DeoptError::Config(s)) => assert!(s.starts_with("Invalid DEOPTD_ENTRY_COUNT")),
            _ => panic!(),
        }
    }
}
