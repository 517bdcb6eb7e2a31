//! Declared secret references
//!
//! A job declares secrets as a map of variable key to a provider-specific
//! reference. Resolution happens in the runner before any user step runs.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Field name a provider uses when a secret has a single unnamed value.
pub const DEFAULT_SECRET_FIELD: &str = "__DEFAULT__";

/// A reference to a secret held by an external provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Secret {
    /// Provider name, matched against registered resolvers.
    pub provider: String,
    /// Whether the resolved value is materialized as a file variable.
    /// Defaults to true: secrets land on disk, not in the environment.
    #[serde(default)]
    pub file: Option<bool>,
    /// Provider-specific reference fields (path, field, engine, ...).
    #[serde(default)]
    pub params: BTreeMap<String, serde_json::Value>,
}

impl Secret {
    pub fn is_file(&self) -> bool {
        self.file.unwrap_or(true)
    }

    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(|v| v.as_str())
    }
}

/// Declared secrets, keyed by the variable name they resolve into
pub type Secrets = BTreeMap<String, Secret>;
