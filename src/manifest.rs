//! Agent manifest: identity and the schema resources to register at startup.

use serde::{Deserialize, Serialize};

use crate::error::StartupError;

/// A schema resource and the registry name it is registered under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaEntry {
    /// Registry name, e.g. `crucibuild/agent-pong#header`.
    pub name: String,
    /// Resource path of the Avro definition.
    pub path: String,
}

/// Describes an agent and the schemas it needs.
///
/// Schemas are registered in list order, so a schema referenced by others
/// (typically a shared header) must come first.
///
/// # Examples
///
/// ```
/// use schema_agent::Manifest;
///
/// let manifest = Manifest::from_json(br#"{
///     "name": "crucibuild/agent-pong",
///     "version": "1.0.0",
///     "schemas": [
///         {"name": "crucibuild/agent-pong#header", "path": "/schema/header.avsc"}
///     ]
/// }"#).unwrap();
/// assert_eq!(manifest.name, "crucibuild/agent-pong");
/// assert_eq!(manifest.schemas[0].path, "/schema/header.avsc");
/// assert!(manifest.description.is_none());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Agent name, e.g. `crucibuild/agent-pong`.
    pub name: String,
    /// Agent version.
    pub version: String,
    /// Free-form description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Schemas, in registration order.
    #[serde(default)]
    pub schemas: Vec<SchemaEntry>,
}

impl Manifest {
    /// A manifest with no schemas.
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            description: None,
            schemas: Vec::new(),
        }
    }

    /// Append a schema registered as `name` from the resource at `path`.
    pub fn with_schema(mut self, name: impl Into<String>, path: impl Into<String>) -> Self {
        self.schemas.push(SchemaEntry {
            name: name.into(),
            path: path.into(),
        });
        self
    }

    /// Parse a manifest from JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns [`StartupError::Manifest`] if the JSON is malformed or the
    /// manifest is invalid.
    pub fn from_json(bytes: &[u8]) -> Result<Self, StartupError> {
        let manifest: Manifest =
            serde_json::from_slice(bytes).map_err(|e| StartupError::Manifest(e.to_string()))?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Check the manifest's own fields.
    ///
    /// # Errors
    ///
    /// Returns [`StartupError::Manifest`] if the agent name is empty, or a
    /// schema entry has a blank name or path.
    pub fn validate(&self) -> Result<(), StartupError> {
        if self.name.trim().is_empty() {
            return Err(StartupError::Manifest("agent name is empty".into()));
        }
        for entry in &self.schemas {
            if entry.name.trim().is_empty() {
                return Err(StartupError::Manifest(format!(
                    "agent '{}' lists a schema with an empty name",
                    self.name
                )));
            }
            if entry.path.trim().is_empty() {
                return Err(StartupError::Manifest(format!(
                    "agent '{}' lists an empty path for schema '{}'",
                    self.name, entry.name
                )));
            }
        }
        Ok(())
    }
}
