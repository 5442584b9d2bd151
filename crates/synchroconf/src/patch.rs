//! Patch files: which nodes exist and how their ports are wired.
//!
//! ```toml
//! always_render = ["out"]
//!
//! [[node]]
//! name = "osc"
//! type = "sine"
//! params = { frequency = 440.0 }
//!
//! [[node]]
//! name = "out"
//! type = "wav_file"
//! params = { path = "/tmp/out.wav" }
//!
//! [[connection]]
//! from = "osc.out"
//! to = "out.signal"
//! ```

use crate::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

/// A node parameter as written in the patch file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
    List(Vec<ParamValue>),
}

impl ParamValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParamValue::Integer(i) => Some(*i as f64),
            ParamValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParamValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ParamValue::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

/// One `[[node]]` entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub name: String,

    #[serde(rename = "type")]
    pub type_name: String,

    #[serde(default)]
    pub params: BTreeMap<String, ParamValue>,
}

/// One `[[connection]]` entry, endpoints written as `node.port`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub from: String,
    pub to: String,
}

/// A parsed `node.port` reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortRef {
    pub node: String,
    pub port: String,
}

impl PortRef {
    /// Split on the last `.` so node names may contain dots.
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        match s.rsplit_once('.') {
            Some((node, port)) if !node.is_empty() && !port.is_empty() => Ok(Self {
                node: node.to_string(),
                port: port.to_string(),
            }),
            _ => Err(ConfigError::Invalid {
                field: "connection",
                message: format!("expected `node.port`, got `{}`", s),
            }),
        }
    }
}

impl fmt::Display for PortRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.node, self.port)
    }
}

/// A complete graph description.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PatchConfig {
    #[serde(default, rename = "node")]
    pub nodes: Vec<NodeConfig>,

    #[serde(default, rename = "connection")]
    pub connections: Vec<ConnectionConfig>,

    /// Nodes evaluated every tick; everything else runs only when pulled.
    #[serde(default)]
    pub always_render: Vec<String>,
}

impl PatchConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
            path: path.to_path_buf(),
            source: e,
        })?;

        toml::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|e| ConfigError::Parse {
            path: "<inline>".into(),
            message: e.to_string(),
        })
    }

    pub fn node(&self, name: &str) -> Option<&NodeConfig> {
        self.nodes.iter().find(|n| n.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PATCH: &str = r#"
always_render = ["sink"]

[[node]]
name = "osc"
type = "sine"
params = { frequency = 440.0, enabled = true }

[[node]]
name = "chords"
type = "chord"
[node.params]
progression = "C F G"
octave = 4
voicing = [0, 4, 7]

[[node]]
name = "sink"
type = "wav_file"

[[connection]]
from = "osc.out"
to = "sink.signal"
"#;

    #[test]
    fn test_parse_patch() {
        let patch = PatchConfig::from_toml_str(PATCH).unwrap();
        assert_eq!(patch.nodes.len(), 3);
        assert_eq!(patch.connections.len(), 1);
        assert_eq!(patch.always_render, vec!["sink".to_string()]);

        let osc = patch.node("osc").unwrap();
        assert_eq!(osc.type_name, "sine");
        assert_eq!(osc.params["frequency"].as_f64(), Some(440.0));
        assert_eq!(osc.params["enabled"].as_bool(), Some(true));

        let chords = patch.node("chords").unwrap();
        assert_eq!(chords.params["progression"].as_str(), Some("C F G"));
        assert_eq!(chords.params["octave"], ParamValue::Integer(4));
        assert!(matches!(chords.params["voicing"], ParamValue::List(ref v) if v.len() == 3));

        assert!(patch.node("sink").unwrap().params.is_empty());
    }

    #[test]
    fn test_port_ref_parse() {
        let r = PortRef::parse("osc.out").unwrap();
        assert_eq!(r.node, "osc");
        assert_eq!(r.port, "out");
        assert_eq!(r.to_string(), "osc.out");

        let dotted = PortRef::parse("left.osc.out").unwrap();
        assert_eq!(dotted.node, "left.osc");

        assert!(PortRef::parse("nodot").is_err());
        assert!(PortRef::parse(".out").is_err());
        assert!(PortRef::parse("osc.").is_err());
    }

    #[test]
    fn test_missing_type_is_parse_error() {
        let err = PatchConfig::from_toml_str("[[node]]\nname = \"x\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("patch.toml");
        std::fs::write(&path, PATCH).unwrap();

        let patch = PatchConfig::load(&path).unwrap();
        assert_eq!(patch.nodes.len(), 3);
    }
}
