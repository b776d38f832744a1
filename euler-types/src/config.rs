use std::collections::HashMap;
use std::str::FromStr;

use crate::errors::TypeError;

/// String-keyed configuration, the lingua franca between binaries, options
/// models and components. Typed reads parse on demand.
#[derive(Debug, Clone, Default)]
pub struct GraphConfig {
    entries: HashMap<String, String>,
}

impl GraphConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a semicolon-separated `key=value` list, the form the console
    /// and tests use.
    pub fn from_spec(spec: &str) -> Result<Self, TypeError> {
        let mut config = Self::new();
        for item in spec.split(';') {
            let item = item.trim();
            if item.is_empty() {
                continue;
            }
            let (key, value) = item.split_once('=').ok_or_else(|| {
                TypeError::InvalidConfigValue {
                    key: item.to_string(),
                    value: "expected key=value".to_string(),
                }
            })?;
            config.add(key.trim(), value.trim());
        }
        Ok(config)
    }

    pub fn add(&mut self, key: impl Into<String>, value: impl ToString) {
        self.entries.insert(key.into(), value.to_string());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn get_parsed<T: FromStr>(&self, key: &str) -> Result<Option<T>, TypeError> {
        match self.entries.get(key) {
            None => Ok(None),
            Some(value) => value
                .parse::<T>()
                .map(Some)
                .map_err(|_| TypeError::InvalidConfigValue {
                    key: key.to_string(),
                    value: value.clone(),
                }),
        }
    }

    pub fn get_or<T: FromStr>(&self, key: &str, default: T) -> Result<T, TypeError> {
        Ok(self.get_parsed(key)?.unwrap_or(default))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_parsing_and_typed_reads() {
        let config = GraphConfig::from_spec("mode=remote; shard_num=4;num_retries=3").unwrap();
        assert_eq!(config.get("mode"), Some("remote"));
        assert_eq!(config.get_or("shard_num", 1usize).unwrap(), 4);
        assert_eq!(config.get_or("num_retries", 10u32).unwrap(), 3);
        assert_eq!(config.get_or("missing", 7i32).unwrap(), 7);
    }

    #[test]
    fn bad_value_is_invalid() {
        let config = GraphConfig::from_spec("shard_num=abc").unwrap();
        assert!(config.get_parsed::<usize>("shard_num").is_err());
    }
}
