//! Configuration Store
//!
//! Parses the YAML manifest into a flat, ordered key→value map with typed
//! accessors. Nested mappings flatten to dotted keys (`k3s.role`), sequences
//! of mappings to bracket keys (`users[0].name`), sequences of scalars to a
//! list value.
//!
//! # Defaults
//!
//! Every accessor takes (or implies) a default. A missing key is never an
//! error; it only means the feature it controls is disabled. Only the literal
//! string `true` is truthy.
//!
//! The store is read-only once loaded and is shared by reference with every
//! unit.

use serde::de::{self, DeserializeSeed, Deserializer, IgnoredAny, MapAccess, SeqAccess, Visitor};
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, warn};

use crate::error::ConfigError;

/// Manifest file used when no path is given on the command line.
pub const DEFAULT_MANIFEST: &str = "config.yml";

/// Placeholder printed instead of secret values.
pub const REDACTED: &str = "********";

/// Keys whose values must never be printed (`user_password`, `k3s_token`, ...).
pub fn is_secret_key(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    key.ends_with("password") || key.ends_with("token")
}

/// A single manifest value.
///
/// Scalars hold the text exactly as written in the manifest (`0x1F`, `1.10`,
/// and `True` stay as they are). Typed interpretation happens only in the
/// accessors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ConfigValue {
    Scalar(String),
    List(Vec<String>),
}

impl ConfigValue {
    /// String form used by the string, bool, and list accessors.
    pub fn render(&self) -> String {
        match self {
            Self::Scalar(s) => s.clone(),
            Self::List(items) => items.join(","),
        }
    }
}

impl fmt::Display for ConfigValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.render())
    }
}

/// Split a comma-separated list, trimming each element and dropping blanks.
///
/// ```
/// use piprovision::config::split_list;
/// assert_eq!(split_list("a, b ,c"), vec!["a", "b", "c"]);
/// assert!(split_list("").is_empty());
/// ```
pub fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

/// Immutable, flattened view of the provisioning manifest.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(transparent)]
pub struct Config {
    values: BTreeMap<String, ConfigValue>,
}

impl Config {
    /// Load and parse a manifest file.
    ///
    /// # Errors
    ///
    /// - `NotFound` if the file does not exist
    /// - `Unreadable` if it exists but cannot be read as UTF-8 text
    /// - `InvalidSyntax` if it is not valid YAML; no partial config is returned
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = read_manifest(path)?;
        Self::from_manifest(path, &content)
    }

    /// Parse manifest text read from `path`. The path only labels errors.
    pub fn from_manifest(path: &Path, content: &str) -> Result<Self, ConfigError> {
        let config = Self::parse(content).map_err(|message| ConfigError::InvalidSyntax {
            path: path.to_path_buf(),
            message,
        })?;

        debug!(path = %path.display(), keys = config.len(), "Manifest loaded");
        Ok(config)
    }

    /// Parse a manifest held in memory.
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        Self::parse(content).map_err(|message| ConfigError::InvalidSyntax {
            path: PathBuf::from("<inline>"),
            message,
        })
    }

    fn parse(content: &str) -> Result<Self, String> {
        let blank = content
            .lines()
            .map(str::trim)
            .all(|line| line.is_empty() || line.starts_with('#') || line == "---");
        if blank {
            return Ok(Self::default());
        }

        // First pass resolves structure, second re-reads every scalar as
        // authored text.
        let shape: Value = serde_yaml::from_str(content).map_err(|e| e.to_string())?;
        match &shape {
            Value::Null => return Ok(Self::default()),
            Value::Mapping(_) => {}
            other => {
                return Err(format!(
                    "top-level document must be a mapping, found {}",
                    kind_of(other)
                ));
            }
        }

        let document = Shaped(&shape)
            .deserialize(serde_yaml::Deserializer::from_str(content))
            .map_err(|e| e.to_string())?;

        let mut values = BTreeMap::new();
        flatten("", document, &mut values);
        Ok(Self { values })
    }

    /// Raw value for a key, if present.
    pub fn value(&self, key: &str) -> Option<&ConfigValue> {
        self.values.get(key)
    }

    /// True if the manifest sets `key` (even to an empty string).
    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Copy with every secret value masked, for display.
    pub fn redacted(&self) -> Self {
        let values = self
            .values
            .iter()
            .map(|(key, value)| {
                let value = if is_secret_key(key) {
                    ConfigValue::Scalar(REDACTED.to_string())
                } else {
                    value.clone()
                };
                (key.clone(), value)
            })
            .collect();
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// String value for `key`, or `default` when absent.
    pub fn get(&self, key: &str, default: &str) -> String {
        self.values
            .get(key)
            .map(ConfigValue::render)
            .unwrap_or_else(|| default.to_string())
    }

    /// Trimmed string value for `key`, or `None` when absent or blank.
    pub fn get_nonempty(&self, key: &str) -> Option<String> {
        self.values
            .get(key)
            .map(|v| v.render().trim().to_string())
            .filter(|v| !v.is_empty())
    }

    /// Boolean value for `key`; absent keys are `false`.
    pub fn get_bool(&self, key: &str) -> bool {
        self.get_bool_or(key, false)
    }

    /// Boolean value for `key`, or `default` when absent.
    ///
    /// Only the literal `true` is truthy. `True`, `yes`, and `1` are not.
    pub fn get_bool_or(&self, key: &str, default: bool) -> bool {
        match self.values.get(key) {
            Some(value) => value.render() == "true",
            None => default,
        }
    }

    /// List value for `key`; absent keys yield an empty list.
    pub fn get_list(&self, key: &str) -> Vec<String> {
        match self.values.get(key) {
            Some(ConfigValue::List(items)) => items
                .iter()
                .map(|item| item.trim())
                .filter(|item| !item.is_empty())
                .map(str::to_string)
                .collect(),
            Some(other) => split_list(&other.render()),
            None => Vec::new(),
        }
    }

    /// Parse the value for `key`, falling back to `default` when absent or
    /// unparsable. A parse failure is logged, never raised.
    pub fn get_parsed<T>(&self, key: &str, default: T) -> T
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        let Some(raw) = self.get_nonempty(key) else {
            return default;
        };
        match raw.parse::<T>() {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(key, value = %raw, error = %e, "Unparsable value, using default");
                default
            }
        }
    }

    /// Reject values that can never be applied.
    ///
    /// Run once during loading. Unknown keys and unknown tokens with a
    /// documented fallback (e.g. `container_runtime`) are not errors.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(hostname) = self.get_nonempty("hostname") {
            validate_hostname(&hostname).map_err(|m| ConfigError::invalid("hostname", m))?;
        }

        if let Some(username) = self.get_nonempty("username") {
            validate_username(&username).map_err(|m| ConfigError::invalid("username", m))?;
        }

        if let Some(port) = self.get_nonempty("node_exporter_port") {
            match port.parse::<u16>() {
                Ok(p) if p > 0 => {}
                _ => {
                    return Err(ConfigError::invalid(
                        "node_exporter_port",
                        format!("'{}' is not a valid TCP port", port),
                    ));
                }
            }
        }

        if let Some(interval) = self.get_nonempty("health_check_interval") {
            if interval.parse::<u64>().is_err() {
                return Err(ConfigError::invalid(
                    "health_check_interval",
                    format!("'{}' is not a number of seconds", interval),
                ));
            }
        }

        if let Some(role) = self.get_nonempty("k3s_role") {
            if role != "server" && role != "agent" {
                return Err(ConfigError::invalid(
                    "k3s_role",
                    format!("'{}' must be 'server' or 'agent'", role),
                ));
            }
        }

        Ok(())
    }
}

/// Read the raw manifest text.
pub fn read_manifest(path: &Path) -> Result<String, ConfigError> {
    fs::read_to_string(path).map_err(|source| {
        if source.kind() == std::io::ErrorKind::NotFound {
            ConfigError::NotFound {
                path: path.to_path_buf(),
            }
        } else {
            ConfigError::Unreadable {
                path: path.to_path_buf(),
                source,
            }
        }
    })
}

/// Manifest tree with scalars kept as authored text.
#[derive(Debug)]
enum Node {
    Null,
    Scalar(String),
    Sequence(Vec<Node>),
    Mapping(Vec<(String, Node)>),
}

/// Re-reads a document along the structure of an already parsed `Value`,
/// asking the deserializer for the raw text of every scalar.
struct Shaped<'v>(&'v Value);

impl<'de> DeserializeSeed<'de> for Shaped<'_> {
    type Value = Node;

    fn deserialize<D>(self, deserializer: D) -> Result<Node, D::Error>
    where
        D: Deserializer<'de>,
    {
        match self.0 {
            Value::Null => {
                IgnoredAny::deserialize(deserializer)?;
                Ok(Node::Null)
            }
            Value::Bool(_) | Value::Number(_) | Value::String(_) => {
                String::deserialize(deserializer).map(Node::Scalar)
            }
            Value::Sequence(items) => deserializer.deserialize_seq(SequenceShape(items)),
            Value::Mapping(map) => deserializer.deserialize_map(MappingShape(map)),
            Value::Tagged(tagged) => Shaped(&tagged.value).deserialize(deserializer),
        }
    }
}

struct SequenceShape<'v>(&'v [Value]);

impl<'de> Visitor<'de> for SequenceShape<'_> {
    type Value = Node;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "a sequence of {} items", self.0.len())
    }

    fn visit_seq<A>(self, mut seq: A) -> Result<Node, A::Error>
    where
        A: SeqAccess<'de>,
    {
        let mut items = Vec::with_capacity(self.0.len());
        for (index, shape) in self.0.iter().enumerate() {
            let item = seq
                .next_element_seed(Shaped(shape))?
                .ok_or_else(|| de::Error::invalid_length(index, &self))?;
            items.push(item);
        }
        Ok(Node::Sequence(items))
    }
}

struct MappingShape<'v>(&'v Mapping);

impl<'de> Visitor<'de> for MappingShape<'_> {
    type Value = Node;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "a mapping of {} entries", self.0.len())
    }

    fn visit_map<A>(self, mut map: A) -> Result<Node, A::Error>
    where
        A: MapAccess<'de>,
    {
        let mut entries = Vec::with_capacity(self.0.len());
        for (index, (_, shape)) in self.0.iter().enumerate() {
            let key: String = map
                .next_key()?
                .ok_or_else(|| de::Error::invalid_length(index, &self))?;
            let value = map.next_value_seed(Shaped(shape))?;
            entries.push((key, value));
        }
        Ok(Node::Mapping(entries))
    }
}

fn flatten(prefix: &str, node: Node, out: &mut BTreeMap<String, ConfigValue>) {
    match node {
        Node::Null => {}
        Node::Scalar(text) => {
            out.insert(prefix.to_string(), ConfigValue::Scalar(text));
        }
        Node::Sequence(items) => {
            let scalars = items
                .iter()
                .all(|item| matches!(item, Node::Null | Node::Scalar(_)));
            if scalars {
                let list = items
                    .into_iter()
                    .filter_map(|item| match item {
                        Node::Scalar(text) => Some(text),
                        _ => None,
                    })
                    .collect();
                out.insert(prefix.to_string(), ConfigValue::List(list));
            } else {
                for (index, item) in items.into_iter().enumerate() {
                    flatten(&format!("{}[{}]", prefix, index), item, out);
                }
            }
        }
        Node::Mapping(entries) => {
            for (key, item) in entries {
                let path = if prefix.is_empty() {
                    key
                } else {
                    format!("{}.{}", prefix, key)
                };
                flatten(&path, item, out);
            }
        }
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Sequence(_) => "a sequence",
        Value::Mapping(_) => "a mapping",
        Value::Tagged(_) => "a tagged value",
    }
}

/// RFC 1123 host label: 1-63 chars, alphanumerics and hyphens, no leading or
/// trailing hyphen.
fn validate_hostname(hostname: &str) -> Result<(), String> {
    if hostname.len() > 63 {
        return Err("must be at most 63 characters".to_string());
    }
    if hostname.starts_with('-') || hostname.ends_with('-') {
        return Err("must not start or end with a hyphen".to_string());
    }
    if !hostname.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
        return Err("may only contain letters, digits, and hyphens".to_string());
    }
    Ok(())
}

fn validate_username(username: &str) -> Result<(), String> {
    if username.len() > 32 {
        return Err("must be at most 32 characters".to_string());
    }
    if let Some(first) = username.chars().next() {
        if !(first.is_ascii_lowercase() || first == '_') {
            return Err("must start with a lowercase letter or underscore".to_string());
        }
    }
    if !username
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
    {
        return Err("may only contain lowercase letters, digits, '_' and '-'".to_string());
    }
    Ok(())
}
