//! `tool.toml` manifests for plugin tools.
//!
//! ```toml
//! name = "lookup"
//! description = "Resolve a domain"
//! output = "result"
//! command = "./lookup.sh"
//! timeout_secs = 10
//!
//! [[inputs]]
//! name = "domain"
//! required = true
//! ```

use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::{Map, Value, json};

use crate::catalog::ToolDescriptor;
use crate::error::RelayError;

pub const MANIFEST_FILE: &str = "tool.toml";

fn default_input_type() -> String {
    "string".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct InputSpec {
    pub name: String,
    #[serde(rename = "type", default = "default_input_type")]
    pub kind: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub required: bool,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ToolManifest {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Flat input list; mutually exclusive with `input_schema`.
    #[serde(default)]
    pub inputs: Vec<InputSpec>,
    /// Full JSON schema for the input object.
    #[serde(default)]
    pub input_schema: Option<Value>,
    /// Key of the stdout object that holds the result.
    pub output: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl ToolManifest {
    pub fn parse(source: &str, origin: &str) -> crate::Result<Self> {
        let manifest: ToolManifest = toml::from_str(source)
            .map_err(|e| RelayError::Validation(origin.to_string(), e.to_string()))?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn validate(&self) -> crate::Result<()> {
        let invalid = |msg: String| Err(RelayError::Validation(self.name.clone(), msg));
        let name_ok = !self.name.is_empty()
            && self
                .name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !name_ok {
            return Err(RelayError::Validation(
                self.name.clone(),
                "tool name must be non-empty and use only [A-Za-z0-9_-]".to_string(),
            ));
        }
        if self.output.trim().is_empty() {
            return invalid("'output' must name the result key".to_string());
        }
        if self.command.trim().is_empty() {
            return invalid("'command' must not be empty".to_string());
        }
        if self.timeout_secs == 0 {
            return invalid("'timeout_secs' must be > 0".to_string());
        }
        if !self.inputs.is_empty() && self.input_schema.is_some() {
            return invalid("declare either 'inputs' or 'input_schema', not both".to_string());
        }
        if self.input_schema.as_ref().is_some_and(|s| !s.is_object()) {
            return invalid("'input_schema' must be a table".to_string());
        }
        Ok(())
    }

    /// JSON schema for the input object.
    pub fn input_schema(&self) -> Value {
        if let Some(schema) = &self.input_schema {
            return schema.clone();
        }
        let mut properties = Map::new();
        for input in &self.inputs {
            let mut prop = Map::new();
            prop.insert("type".to_string(), Value::from(input.kind.clone()));
            if let Some(desc) = &input.description {
                prop.insert("description".to_string(), Value::from(desc.clone()));
            }
            properties.insert(input.name.clone(), Value::Object(prop));
        }
        let required: Vec<&str> = self
            .inputs
            .iter()
            .filter(|i| i.required)
            .map(|i| i.name.as_str())
            .collect();
        json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }

    pub fn required_inputs(&self) -> Vec<String> {
        self.input_schema()
            .get("required")
            .and_then(Value::as_array)
            .map(|names| {
                names
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: self.name.clone(),
            description: (!self.description.is_empty()).then(|| self.description.clone()),
            input_schema: self.input_schema(),
        }
    }
}

/// A manifest together with where it was found.
#[derive(Debug, Clone)]
pub struct PluginTool {
    pub manifest: ToolManifest,
    pub dir: PathBuf,
    pub program: PathBuf,
}

impl PluginTool {
    /// Load `<dir>/tool.toml`. Relative commands with a path component resolve
    /// against `dir`; bare names are looked up on `PATH`.
    pub async fn load(dir: &Path) -> crate::Result<Self> {
        let path = dir.join(MANIFEST_FILE);
        let origin = path.display().to_string();
        let source = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| RelayError::Validation(origin.clone(), e.to_string()))?;
        let manifest = ToolManifest::parse(&source, &origin)?;

        let command = Path::new(&manifest.command);
        let program = if command.is_relative() && command.components().count() > 1 {
            dir.join(command)
        } else {
            command.to_path_buf()
        };
        Ok(Self {
            manifest,
            dir: dir.to_path_buf(),
            program,
        })
    }

    pub fn name(&self) -> &str {
        &self.manifest.name
    }
}
