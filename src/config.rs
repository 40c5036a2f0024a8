//! Configuration for the multiplexer.
//!
//! A YAML file describes the engine and its interfaces; transport
//! options are free-form `key: value` pairs handed to the transport
//! initializer untouched, so the per-transport tables stay the single
//! source of truth for what is accepted.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use crate::filter::Filter;
use crate::iface::{Direction, IfaceCtx};
use crate::tag::TagFlags;

const DEFAULT_QSIZE: usize = 128;

fn default_qsize() -> usize {
    DEFAULT_QSIZE
}

fn default_kind() -> String {
    "tcp".to_string()
}

fn default_direction() -> String {
    "both".to_string()
}

/// Top-level configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub interfaces: Vec<IfaceConfig>,
}

/// Engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Capacity of the central inbound queue.
    #[serde(default = "default_qsize")]
    pub qsize: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            qsize: DEFAULT_QSIZE,
        }
    }
}

/// One configured interface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IfaceConfig {
    /// Transport type. Only `tcp` is supported.
    #[serde(rename = "type", default = "default_kind")]
    pub kind: String,
    pub name: String,
    /// `in`, `out` or `both`.
    #[serde(default = "default_direction")]
    pub direction: String,
    #[serde(default)]
    pub persist: bool,
    /// Persist that also tolerates the first connect failing.
    #[serde(default)]
    pub ipersist: bool,
    #[serde(default = "default_qsize")]
    pub qsize: usize,
    #[serde(default)]
    pub checksum: bool,
    #[serde(default)]
    pub strict: bool,
    /// Heartbeat period in seconds; 0 disables.
    #[serde(default)]
    pub heartbeat: u64,
    #[serde(default)]
    pub tag_source: bool,
    #[serde(default)]
    pub tag_timestamp: bool,
    #[serde(default)]
    pub ifilter: String,
    #[serde(default)]
    pub ofilter: String,
    /// Transport options, passed to the transport initializer.
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

/// Configuration error type.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config: read file: {0}")]
    Io(#[from] std::io::Error),
    #[error("config: parse yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("config: {0}")]
    Validation(String),
}

/// Load and parse a YAML config file.
pub fn load<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let data = fs::read(path)?;
    load_from_bytes(&data)
}

/// Parse a YAML config from raw bytes.
pub fn load_from_bytes(data: &[u8]) -> Result<Config, ConfigError> {
    let cfg: Config = serde_yaml::from_slice(data)?;
    cfg.validate()?;
    Ok(cfg)
}

pub(crate) fn parse_direction(s: &str) -> Option<Direction> {
    if s.eq_ignore_ascii_case("in") {
        Some(Direction::In)
    } else if s.eq_ignore_ascii_case("out") {
        Some(Direction::Out)
    } else if s.eq_ignore_ascii_case("both") {
        Some(Direction::Both)
    } else {
        None
    }
}

impl Config {
    /// Validate the configuration for correctness.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.engine.qsize == 0 {
            return Err(ConfigError::Validation("engine: qsize must be > 0".into()));
        }
        let mut names = std::collections::HashSet::new();
        for (i, ifc) in self.interfaces.iter().enumerate() {
            ifc.validate()
                .map_err(|e| ConfigError::Validation(format!("interfaces[{i}]: {e}")))?;
            if !names.insert(ifc.name.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "interfaces[{i}]: duplicate name {:?}",
                    ifc.name
                )));
            }
        }
        Ok(())
    }
}

impl IfaceConfig {
    fn validate(&self) -> Result<(), String> {
        if self.kind != "tcp" {
            return Err(format!("unsupported interface type {:?}", self.kind));
        }
        if self.name.is_empty() {
            return Err("name is required".into());
        }
        if parse_direction(&self.direction).is_none() {
            return Err(format!(
                "direction {:?} is not one of in, out, both",
                self.direction
            ));
        }
        if self.qsize == 0 {
            return Err("qsize must be > 0".into());
        }
        if !self.ifilter.is_empty() {
            Filter::parse(&self.ifilter).map_err(|e| format!("ifilter: {e}"))?;
        }
        if !self.ofilter.is_empty() {
            Filter::parse(&self.ofilter).map_err(|e| format!("ofilter: {e}"))?;
        }
        Ok(())
    }

    /// Builds the interface record for this entry. `ipersist` implies
    /// `persist`.
    pub fn to_ctx(&self, id: u32) -> Result<IfaceCtx, ConfigError> {
        let direction = parse_direction(&self.direction).ok_or_else(|| {
            ConfigError::Validation(format!("direction {:?} is not valid", self.direction))
        })?;
        let parse = |spec: &str, which: &str| -> Result<Option<Arc<Filter>>, ConfigError> {
            if spec.is_empty() {
                Ok(None)
            } else {
                Filter::parse(spec)
                    .map(|f| Some(Arc::new(f)))
                    .map_err(|e| ConfigError::Validation(format!("{which}: {e}")))
            }
        };
        Ok(IfaceCtx {
            id,
            name: self.name.clone(),
            direction,
            persist: self.persist || self.ipersist,
            ipersist: self.ipersist,
            qsize: self.qsize,
            tagflags: TagFlags {
                source: self.tag_source,
                timestamp: self.tag_timestamp,
            },
            heartbeat: self.heartbeat,
            checksum: self.checksum,
            strict: self.strict,
            ifilter: parse(&self.ifilter, "ifilter")?,
            ofilter: parse(&self.ofilter, "ofilter")?,
        })
    }

    /// The transport options as ordered `(key, value)` pairs.
    pub fn option_pairs(&self) -> Vec<(String, String)> {
        self.options
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}
