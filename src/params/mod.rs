//! Persistent device parameters
//!
//! Keys look like `section.index:key` (`video.0:width`, `video.source:mode`).
//! The orchestrator treats the store as the single source of truth and reads
//! it afresh on every build.

mod ini;

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::{PoisonError, RwLock};

use crate::error::ConfigError;

pub use ini::{load_ini, save_ini};

/// Key/value parameter storage shared by every component
pub trait ParameterStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;

    fn set(&self, key: &str, value: &str);

    fn remove(&self, key: &str) -> Option<String>;

    /// All keys currently present, sorted
    fn keys(&self) -> Vec<String>;
}

/// Typed accessors on top of [`ParameterStore`]
pub trait ParamsExt {
    /// Parse `key`, falling back to `default` when absent
    fn get_or<T: FromStr>(&self, key: &str, default: T) -> Result<T, ConfigError>;

    /// Parse `key`, failing when absent
    fn require<T: FromStr>(&self, key: &str) -> Result<T, ConfigError>;

    /// Accepts `1/0`, `true/false`, `on/off`
    fn get_bool(&self, key: &str, default: bool) -> Result<bool, ConfigError>;

    fn set_value<T: ToString>(&self, key: &str, value: T);
}

impl<P: ParameterStore + ?Sized> ParamsExt for P {
    fn get_or<T: FromStr>(&self, key: &str, default: T) -> Result<T, ConfigError> {
        match self.get(key) {
            Some(raw) => parse_value(key, &raw),
            None => Ok(default),
        }
    }

    fn require<T: FromStr>(&self, key: &str) -> Result<T, ConfigError> {
        let raw = self
            .get(key)
            .ok_or_else(|| ConfigError::Missing(key.to_string()))?;
        parse_value(key, &raw)
    }

    fn get_bool(&self, key: &str, default: bool) -> Result<bool, ConfigError> {
        let Some(raw) = self.get(key) else {
            return Ok(default);
        };
        match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "on" | "yes" => Ok(true),
            "0" | "false" | "off" | "no" => Ok(false),
            _ => Err(ConfigError::Invalid {
                key: key.to_string(),
                value: raw,
            }),
        }
    }

    fn set_value<T: ToString>(&self, key: &str, value: T) {
        self.set(key, &value.to_string());
    }
}

fn parse_value<T: FromStr>(key: &str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::Invalid {
        key: key.to_string(),
        value: raw.to_string(),
    })
}

/// In-memory parameter store
#[derive(Debug, Default)]
pub struct MemoryParams {
    values: RwLock<BTreeMap<String, String>>,
}

impl MemoryParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        let values = pairs
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        Self {
            values: RwLock::new(values),
        }
    }

    /// Copy of every entry, for saving
    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.values
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl ParameterStore for MemoryParams {
    fn get(&self, key: &str) -> Option<String> {
        self.values
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn set(&self, key: &str, value: &str) {
        self.values
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), value.to_string());
    }

    fn remove(&self, key: &str) -> Option<String> {
        self.values
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
    }

    fn keys(&self) -> Vec<String> {
        self.values
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }
}

/// Split `video.0:width` into (`video.0`, `width`)
pub fn split_key(key: &str) -> Option<(&str, &str)> {
    key.split_once(':')
        .filter(|(section, name)| !section.is_empty() && !name.is_empty())
}
