//! Catalog validation.
//!
//! This module checks a parsed catalog before any graph is built: resource
//! ids are unique, literal attributes type-check against each kind's schema,
//! scaling bounds hold, and backend/placement configuration is coherent.
//! Validation is pure; nothing here touches the provider.

use crate::error::{ConfigError, Result, StackforgeError};
use std::collections::HashSet;
use tracing::debug;

use super::spec::{
    AttrValue, Catalog, PlacementPolicyKind, ResourceKind, ResourceSpec, StateBackend,
};

/// Validator for resource catalogs.
#[derive(Debug, Default)]
pub struct CatalogValidator;

/// Validation result containing all problems found.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// Fatal validation errors.
    pub errors: Vec<ConfigError>,
    /// Non-fatal warnings.
    pub warnings: Vec<String>,
}

impl CatalogValidator {
    /// Creates a new validator.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Validates a catalog.
    ///
    /// # Errors
    ///
    /// Returns the first fatal error if validation fails; the full list is
    /// available through the returned [`ValidationResult`] when it passes.
    pub fn validate(&self, catalog: &Catalog) -> Result<ValidationResult> {
        let mut result = ValidationResult::default();

        Self::validate_project(catalog, &mut result);
        Self::validate_state(catalog, &mut result);
        Self::validate_placement(catalog, &mut result);
        Self::validate_resources(&catalog.resources, &mut result);

        if !result.errors.is_empty() {
            return Err(StackforgeError::Config(result.errors.remove(0)));
        }

        debug!("Catalog validation passed");
        Ok(result)
    }

    /// Validates project configuration.
    fn validate_project(catalog: &Catalog, result: &mut ValidationResult) {
        if catalog.project.name.is_empty() {
            result.errors.push(ConfigError::parse(
                "Project name cannot be empty",
            ));
        } else if !is_valid_name(&catalog.project.name) {
            result.errors.push(ConfigError::parse(format!(
                "Project name '{}' is invalid. Must be lowercase alphanumeric with hyphens.",
                catalog.project.name
            )));
        }

        if catalog.project.region.is_none() {
            result
                .warnings
                .push(String::from("No region configured; provider default applies"));
        }
    }

    /// Validates state backend configuration.
    fn validate_state(catalog: &Catalog, result: &mut ValidationResult) {
        if catalog.state.backend == StateBackend::S3 && catalog.state.bucket.is_none() {
            result.errors.push(ConfigError::parse(
                "State backend 's3' requires a bucket",
            ));
        }
    }

    /// Validates placement configuration.
    fn validate_placement(catalog: &Catalog, result: &mut ValidationResult) {
        match catalog.placement.policy {
            PlacementPolicyKind::AllowZones => {
                if catalog.placement.zones.is_empty() {
                    result.errors.push(ConfigError::parse(
                        "Placement policy 'allow_zones' requires a non-empty zones list",
                    ));
                }
            }
            PlacementPolicyKind::ExcludeUnsupported => {
                if !catalog.placement.zones.is_empty() {
                    result.warnings.push(String::from(
                        "placement.zones is ignored under the 'exclude_unsupported' policy",
                    ));
                }
            }
        }
    }

    /// Validates the resource list: unique ids and per-kind schemas.
    fn validate_resources(resources: &[ResourceSpec], result: &mut ValidationResult) {
        let mut seen_ids = HashSet::new();

        for resource in resources {
            if !seen_ids.insert(resource.id.as_str()) {
                result.errors.push(ConfigError::DuplicateId {
                    id: resource.id.clone(),
                });
                continue;
            }

            if !is_valid_name(&resource.id.replace('_', "-")) {
                result.errors.push(ConfigError::schema(
                    &resource.id,
                    "Resource ids must be lowercase alphanumeric with hyphens or underscores",
                ));
            }

            Self::validate_kind_schema(resource, result);
        }
    }

    /// Validates the literal attributes of one resource against its kind's
    /// schema.
    fn validate_kind_schema(resource: &ResourceSpec, result: &mut ValidationResult) {
        let required: &[&str] = match resource.kind {
            ResourceKind::Role => &["assume_policy"],
            ResourceKind::PolicyAttachment => &["role", "policy_arn"],
            ResourceKind::Cluster => &["role_arn", "subnet_ids"],
            ResourceKind::NodeGroup => &["cluster", "role_arn", "subnet_ids", "scaling"],
        };

        for name in required {
            if !resource.attributes.contains_key(*name) {
                result.errors.push(ConfigError::schema(
                    &resource.id,
                    format!("missing required attribute '{name}'"),
                ));
            }
        }

        for (name, value) in &resource.attributes {
            Self::validate_attribute(resource, name, value, result);
        }
    }

    /// Type-checks one literal attribute. References and discovery queries
    /// are resolved later and are not literal-checked here.
    fn validate_attribute(
        resource: &ResourceSpec,
        name: &str,
        value: &AttrValue,
        result: &mut ValidationResult,
    ) {
        let AttrValue::Literal(literal) = value else {
            return;
        };

        if name == "scaling" {
            if resource.kind != ResourceKind::NodeGroup {
                result.warnings.push(format!(
                    "Resource '{}' declares 'scaling' but kind '{}' ignores it",
                    resource.id, resource.kind
                ));
                return;
            }
            match super::spec::ScalingConfig::from_literal(literal) {
                Ok(scaling) if !scaling.bounds_valid() => {
                    result.errors.push(ConfigError::InvalidScalingBounds {
                        id: resource.id.clone(),
                        min: scaling.min,
                        desired: scaling.desired,
                        max: scaling.max,
                    });
                }
                Ok(_) => {}
                Err(message) => {
                    result
                        .errors
                        .push(ConfigError::schema(&resource.id, message));
                }
            }
            return;
        }

        // Everything outside 'scaling' is a string-valued attribute across
        // the supported kinds, except subnet lists which may be literal
        // string arrays.
        let valid = match literal {
            serde_json::Value::String(_) => true,
            serde_json::Value::Array(items) if name == "subnet_ids" => {
                items.iter().all(serde_json::Value::is_string)
            }
            _ => false,
        };

        if !valid {
            result.errors.push(ConfigError::schema(
                &resource.id,
                format!("attribute '{name}' has an invalid literal type"),
            ));
        }
    }
}

/// Checks whether a name is lowercase alphanumeric with single hyphens.
fn is_valid_name(name: &str) -> bool {
    if name.is_empty() {
        return false;
    }

    let mut chars = name.chars();

    if let Some(first) = chars.next()
        && !first.is_ascii_lowercase()
    {
        return false;
    }

    for c in chars {
        if !c.is_ascii_lowercase() && !c.is_ascii_digit() && c != '-' {
            return false;
        }
    }

    if name.ends_with('-') {
        return false;
    }

    if name.contains("--") {
        return false;
    }

    true
}

impl ValidationResult {
    /// Returns true if validation passed (no errors).
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Returns the number of warnings.
    #[must_use]
    pub const fn warning_count(&self) -> usize {
        self.warnings.len()
    }
}
