//! Catalog parser for loading resource declarations.
//!
//! This module loads the catalog YAML file, substitutes `${var.*}` bindings,
//! and converts raw declarations into typed [`ResourceSpec`]s. Variable
//! bindings come from the file's `variables` section with caller-supplied
//! overrides taking precedence.

use crate::error::{ConfigError, Result, StackforgeError};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info};

use super::spec::{
    AttrValue, Catalog, PlacementConfig, ProjectConfig, ResourceKind, ResourceSpec, StateConfig,
};

/// Raw catalog file structure, before variable substitution and typing.
#[derive(Debug, Deserialize)]
struct RawCatalog {
    project: ProjectConfig,
    #[serde(default)]
    state: Option<StateConfig>,
    #[serde(default)]
    placement: PlacementConfig,
    #[serde(default)]
    variables: BTreeMap<String, String>,
    #[serde(default)]
    resources: Vec<RawResource>,
}

/// Raw resource declaration.
#[derive(Debug, Deserialize)]
struct RawResource {
    id: String,
    kind: String,
    #[serde(default)]
    attributes: BTreeMap<String, serde_yaml::Value>,
    #[serde(default)]
    depends_on: Vec<String>,
}

/// Catalog parser for loading resource declarations.
#[derive(Debug, Default)]
pub struct CatalogParser {
    /// Base path for resolving relative paths.
    base_path: Option<std::path::PathBuf>,
    /// Variable bindings overriding the file's `variables` section.
    overrides: BTreeMap<String, String>,
}

impl CatalogParser {
    /// Creates a new catalog parser.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            base_path: None,
            overrides: BTreeMap::new(),
        }
    }

    /// Sets the base path for resolving relative paths.
    #[must_use]
    pub fn with_base_path(mut self, path: impl Into<std::path::PathBuf>) -> Self {
        self.base_path = Some(path.into());
        self
    }

    /// Adds variable bindings that take precedence over the file's
    /// `variables` section.
    #[must_use]
    pub fn with_variables(mut self, vars: BTreeMap<String, String>) -> Self {
        self.overrides.extend(vars);
        self
    }

    /// Loads a catalog from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<Catalog> {
        let path = path.as_ref();
        info!("Loading catalog from: {}", path.display());

        if !path.exists() {
            return Err(StackforgeError::Config(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            }));
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            StackforgeError::Config(ConfigError::ParseError {
                message: format!("Failed to read file: {e}"),
                location: Some(path.display().to_string()),
            })
        })?;

        self.parse_yaml(&content, Some(path))
    }

    /// Parses a catalog from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is invalid, a kind is unrecognized, an
    /// attribute expression is malformed, or a variable is unbound.
    pub fn parse_yaml(&self, content: &str, source: Option<&Path>) -> Result<Catalog> {
        debug!("Parsing YAML catalog");

        let raw: RawCatalog = serde_yaml::from_str(content).map_err(|e| {
            let location = source.map(|p| p.display().to_string());
            StackforgeError::Config(ConfigError::ParseError {
                message: format!("YAML parse error: {e}"),
                location,
            })
        })?;

        let mut variables = raw.variables;
        variables.extend(self.overrides.clone());

        let mut resources = Vec::with_capacity(raw.resources.len());
        for resource in raw.resources {
            resources.push(Self::convert_resource(resource, &variables)?);
        }

        debug!(
            "Parsed catalog for project {} with {} resources",
            raw.project.name,
            resources.len()
        );

        Ok(Catalog {
            project: raw.project,
            state: raw.state.unwrap_or_default(),
            placement: raw.placement,
            resources,
        })
    }

    /// Converts a raw resource declaration into a typed spec.
    fn convert_resource(
        raw: RawResource,
        variables: &BTreeMap<String, String>,
    ) -> Result<ResourceSpec> {
        let kind = ResourceKind::parse(&raw.kind).ok_or_else(|| {
            StackforgeError::Config(ConfigError::UnknownKind {
                id: raw.id.clone(),
                kind: raw.kind.clone(),
            })
        })?;

        let mut attributes = BTreeMap::new();
        for (name, value) in raw.attributes {
            let attr = Self::convert_attribute(&raw.id, &name, value, variables)?;
            attributes.insert(name, attr);
        }

        Ok(ResourceSpec {
            id: raw.id,
            kind,
            attributes,
            explicit_dependencies: raw.depends_on,
        })
    }

    /// Converts one raw attribute value, substituting variables in strings.
    fn convert_attribute(
        resource_id: &str,
        name: &str,
        value: serde_yaml::Value,
        variables: &BTreeMap<String, String>,
    ) -> Result<AttrValue> {
        if let serde_yaml::Value::String(s) = value {
            let substituted = substitute_variables(&s, variables)?;
            return AttrValue::parse(&substituted).map_err(|message| {
                StackforgeError::Config(ConfigError::schema(
                    resource_id,
                    format!("attribute '{name}': {message}"),
                ))
            });
        }

        let json = serde_json::to_value(value).map_err(|e| {
            StackforgeError::Config(ConfigError::schema(
                resource_id,
                format!("attribute '{name}' is not representable: {e}"),
            ))
        })?;
        Ok(AttrValue::Literal(json))
    }

    /// Loads the .env file if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the .env file exists but cannot be loaded.
    pub fn load_dotenv(&self) -> Result<()> {
        let env_path = self
            .base_path
            .as_ref()
            .map_or_else(|| std::path::PathBuf::from(".env"), |p| p.join(".env"));

        if env_path.exists() {
            info!("Loading environment from: {}", env_path.display());
            dotenvy::from_path(&env_path).map_err(|e| {
                StackforgeError::Config(ConfigError::ParseError {
                    message: format!("Failed to load .env file: {e}"),
                    location: Some(env_path.display().to_string()),
                })
            })?;
        } else {
            debug!(".env file not found at: {}", env_path.display());
        }

        Ok(())
    }

    /// Gets the provider API token from the environment.
    ///
    /// # Errors
    ///
    /// Returns an error if the token is not set.
    pub fn provider_api_token() -> Result<String> {
        std::env::var("STACKFORGE_API_TOKEN").map_err(|_| {
            StackforgeError::Config(ConfigError::MissingVariable {
                name: String::from("STACKFORGE_API_TOKEN"),
            })
        })
    }
}

/// Substitutes `${var.name}` occurrences in a string value.
///
/// Only `var.`-prefixed interpolations are replaced here; resource references
/// and discovery expressions pass through for [`AttrValue::parse`].
fn substitute_variables(
    input: &str,
    variables: &BTreeMap<String, String>,
) -> Result<String> {
    let mut output = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${var.") {
        output.push_str(&rest[..start]);
        let tail = &rest[start + "${var.".len()..];
        let Some(end) = tail.find('}') else {
            return Err(StackforgeError::Config(ConfigError::parse(format!(
                "Unterminated variable interpolation in '{input}'"
            ))));
        };
        let name = &tail[..end];
        let value = variables.get(name).ok_or_else(|| {
            StackforgeError::Config(ConfigError::MissingVariable {
                name: name.to_string(),
            })
        })?;
        output.push_str(value);
        rest = &tail[end + 1..];
    }

    output.push_str(rest);
    Ok(output)
}

/// Default catalog file names to search for.
pub const DEFAULT_CATALOG_FILES: &[&str] = &["stackforge.yaml", "stackforge.yml"];

/// Finds the catalog file in the given directory or its parents.
///
/// # Errors
///
/// Returns an error if no catalog file is found.
pub fn find_catalog_file(start_dir: impl AsRef<Path>) -> Result<std::path::PathBuf> {
    let start = start_dir.as_ref();
    let mut current = start.to_path_buf();

    loop {
        for filename in DEFAULT_CATALOG_FILES {
            let catalog_path = current.join(filename);
            if catalog_path.exists() {
                info!("Found catalog file: {}", catalog_path.display());
                return Ok(catalog_path);
            }
        }

        if !current.pop() {
            break;
        }
    }

    Err(StackforgeError::Config(ConfigError::FileNotFound {
        path: start.join(DEFAULT_CATALOG_FILES[0]),
    }))
}
