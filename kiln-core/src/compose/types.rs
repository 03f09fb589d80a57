//! Compose file format types.
//!
//! A deliberate subset of the Compose specification: per-service `image`,
//! `build`, `command`, `entrypoint`, `environment`, `ports`, `volumes`,
//! `depends_on`, `restart`. Everything else is ignored on input.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Root structure of a compose file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ComposeProject {
    /// Compose file format version (e.g., "3.8"). Informational.
    #[serde(default)]
    pub version: String,

    /// Services to be built and/or run.
    #[serde(default)]
    pub services: HashMap<String, ComposeService>,
}

/// A service in a compose file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ComposeService {
    /// Container image to use (or to tag the built image with).
    #[serde(default)]
    pub image: String,

    /// Build configuration. Accepts both the scalar and the map form.
    #[serde(default)]
    pub build: Option<ComposeBuild>,

    /// Override the default command.
    #[serde(default)]
    pub command: Option<Vec<String>>,

    /// Override the default entrypoint.
    #[serde(default)]
    pub entrypoint: Option<Vec<String>>,

    /// Environment variables; values may be null ("KEY:") meaning empty.
    #[serde(default)]
    pub environment: Environment,

    /// Port mappings ("host:container").
    #[serde(default)]
    pub ports: Vec<String>,

    /// Volume mounts ("host:container" or "named:container").
    #[serde(default)]
    pub volumes: Vec<String>,

    /// Services this service depends on.
    #[serde(default)]
    pub depends_on: Vec<String>,

    /// Restart policy (e.g. "always", "on-failure").
    #[serde(default)]
    pub restart: String,
}

/// The `build` field of a compose service: either a bare context path or a
/// structured form.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ComposeBuild {
    /// `build: ./context`
    Context(String),
    /// `build: {context: ..., dockerfile: ..., args: ..., target: ...}`
    Detailed {
        #[serde(default)]
        context: Option<String>,
        #[serde(default)]
        dockerfile: Option<String>,
        #[serde(default)]
        args: HashMap<String, Option<String>>,
        #[serde(default)]
        target: Option<String>,
    },
}

impl ComposeBuild {
    /// Build context path, defaulting to ".".
    pub fn context(&self) -> &str {
        match self {
            ComposeBuild::Context(path) if !path.is_empty() => path,
            ComposeBuild::Detailed { context: Some(path), .. } if !path.is_empty() => path,
            _ => ".",
        }
    }

    /// Dockerfile path relative to the context, defaulting to "Dockerfile".
    pub fn dockerfile(&self) -> &str {
        match self {
            ComposeBuild::Detailed { dockerfile: Some(path), .. } if !path.is_empty() => path,
            _ => "Dockerfile",
        }
    }

    /// Build args; args declared without a value resolve to "".
    pub fn args(&self) -> HashMap<String, String> {
        match self {
            ComposeBuild::Context(_) => HashMap::new(),
            ComposeBuild::Detailed { args, .. } => args
                .iter()
                .map(|(k, v)| (k.clone(), v.clone().unwrap_or_default()))
                .collect(),
        }
    }

    /// Target stage, if any.
    pub fn target(&self) -> Option<&str> {
        match self {
            ComposeBuild::Context(_) => None,
            ComposeBuild::Detailed { target, .. } => {
                target.as_deref().filter(|t| !t.is_empty())
            }
        }
    }
}

/// Environment variables: a map whose values may be null, or a list of
/// `KEY=value` strings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Environment {
    Map(HashMap<String, Option<String>>),
    List(Vec<String>),
}

impl Default for Environment {
    fn default() -> Self {
        Environment::Map(HashMap::new())
    }
}

impl Environment {
    /// Flatten to a plain map. Null values become empty strings; list
    /// entries without '=' are dropped. Values are literal: no shell-style
    /// interpolation is performed.
    pub fn to_map(&self) -> HashMap<String, String> {
        match self {
            Environment::Map(map) => map
                .iter()
                .map(|(k, v)| (k.clone(), v.clone().unwrap_or_default()))
                .collect(),
            Environment::List(list) => list
                .iter()
                .filter_map(|entry| {
                    entry.split_once('=').map(|(k, v)| (k.to_string(), v.to_string()))
                })
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Environment::Map(map) => map.is_empty(),
            Environment::List(list) => list.is_empty(),
        }
    }
}
