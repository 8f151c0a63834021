//! Server configuration.
//!
//! Configuration is consumed as an immutable, flattened key→value map with
//! dotted keys (`tcp.port`, `redis.redis_host`, …), loaded once at startup
//! from a JSON document and threaded through the constructors that need it.
//! Every lookup carries its default, so a missing or partial document is not
//! an error — only a document that fails to parse is.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::fs;
use std::str::FromStr;

use serde_json::Value;

use crate::error::{Error, Result};

/// Immutable flattened view of the configuration document.
#[derive(Debug, Default, Clone)]
pub struct Config {
    map: BTreeMap<String, String>,
}

impl Config {
    /// Load and flatten a JSON document.
    ///
    /// Nested objects become dotted keys; scalars are stored in their string
    /// rendition (strings unquoted). Arrays are not part of the schema and
    /// are skipped with a warning.
    pub fn load(path: &str) -> Result<Config> {
        let text = fs::read_to_string(path)
            .map_err(|e| Error::ConfigInvalid(format!("{}: {}", path, e)))?;
        Self::from_json(&text)
    }

    /// Parse a JSON document from memory. See [`Config::load`].
    pub fn from_json(text: &str) -> Result<Config> {
        let root: Value =
            serde_json::from_str(text).map_err(|e| Error::ConfigInvalid(e.to_string()))?;
        let mut map = BTreeMap::new();
        flatten("", &root, &mut map);
        Ok(Config { map })
    }

    /// Build a config from explicit pairs. Intended for tests.
    pub fn from_pairs<I, K, V>(pairs: I) -> Config
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Config {
            map: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Typed lookup with a default. A present but unparsable value falls
    /// back to the default with a warning.
    pub fn lookup<T>(&self, key: &str, default: T) -> T
    where
        T: FromStr + Debug,
    {
        match self.map.get(key) {
            None => default,
            Some(raw) => match raw.parse() {
                Ok(v) => v,
                Err(_) => {
                    log::warn!(
                        "config: value {:?} for key {:?} is invalid, using {:?}",
                        raw,
                        key,
                        default
                    );
                    default
                }
            },
        }
    }

    /// String lookup with a default.
    pub fn lookup_str(&self, key: &str, default: &str) -> String {
        self.map
            .get(key)
            .cloned()
            .unwrap_or_else(|| default.to_owned())
    }

    /// Whether the key is present in the document.
    pub fn contains(&self, key: &str) -> bool {
        self.map.contains_key(key)
    }
}

fn flatten(prefix: &str, node: &Value, out: &mut BTreeMap<String, String>) {
    match node {
        Value::Object(fields) => {
            for (name, child) in fields {
                let key = if prefix.is_empty() {
                    name.clone()
                } else {
                    format!("{}.{}", prefix, name)
                };
                flatten(&key, child, out);
            }
        }
        Value::String(s) => {
            out.insert(prefix.to_owned(), s.clone());
        }
        Value::Bool(b) => {
            out.insert(prefix.to_owned(), b.to_string());
        }
        Value::Number(n) => {
            out.insert(prefix.to_owned(), n.to_string());
        }
        Value::Null => {}
        Value::Array(_) => {
            log::warn!("config: key {:?} holds an array, ignored", prefix);
        }
    }
}
