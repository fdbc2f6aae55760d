//! Declaration types for the resource catalog.
//!
//! This module defines the structs that map to the `stackforge.yaml` file.
//! These types are declarative and fully describe the desired infrastructure;
//! once loaded, a [`ResourceSpec`] is immutable.

use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;

/// The loaded resource catalog for one engine invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct Catalog {
    /// Project-level configuration.
    pub project: ProjectConfig,
    /// State backend configuration.
    pub state: StateConfig,
    /// Placement eligibility configuration.
    pub placement: PlacementConfig,
    /// Declared resources, in declaration order.
    pub resources: Vec<ResourceSpec>,
}

/// Project-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectConfig {
    /// Unique name for the project.
    pub name: String,
    /// Environment (e.g., "dev", "staging", "prod").
    #[serde(default = "default_environment")]
    pub environment: String,
    /// Provider region for all resources in this catalog.
    #[serde(default)]
    pub region: Option<String>,
}

/// State backend configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateConfig {
    /// Backend type (local or s3).
    #[serde(default)]
    pub backend: StateBackend,
    /// S3 bucket name (required for s3 backend).
    #[serde(default)]
    pub bucket: Option<String>,
    /// S3 key prefix (optional).
    #[serde(default)]
    pub prefix: Option<String>,
    /// S3 region (optional, uses AWS default if not specified).
    #[serde(default)]
    pub region: Option<String>,
    /// Local state file path (for local backend).
    #[serde(default)]
    pub path: Option<String>,
}

/// State backend types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    /// Local file-based state storage.
    #[default]
    Local,
    /// AWS S3-based state storage.
    S3,
}

/// Placement eligibility configuration.
///
/// Selects which [`crate::provider::ZoneFilter`] variant the engine applies
/// to discovered placement targets.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlacementConfig {
    /// Policy variant.
    #[serde(default)]
    pub policy: PlacementPolicyKind,
    /// Allowed zones (required for the `allow_zones` policy).
    #[serde(default)]
    pub zones: Vec<String>,
}

/// Placement policy variants.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PlacementPolicyKind {
    /// Keep targets whose zone is in a caller-supplied allow-list.
    AllowZones,
    /// Keep targets whose zone the provider does not report as unsupported
    /// for the placed resource kind. The unsupported set is queried per run.
    #[default]
    ExcludeUnsupported,
}

/// A declared unit of infrastructure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceSpec {
    /// Catalog-unique identifier.
    pub id: String,
    /// Resource kind.
    pub kind: ResourceKind,
    /// Declared attributes: literals, references, and discovery queries.
    pub attributes: BTreeMap<String, AttrValue>,
    /// Explicit dependency edges (resource ids), for real-world ordering
    /// requirements with no attribute-level reference.
    #[serde(default)]
    pub explicit_dependencies: Vec<String>,
}

/// Recognized resource kinds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// An identity role assumable by other resources.
    Role,
    /// An attachment binding a managed policy to a role.
    PolicyAttachment,
    /// A managed control-plane cluster.
    Cluster,
    /// A group of worker nodes joined to a cluster.
    NodeGroup,
}

impl ResourceKind {
    /// Parses a kind from its declaration string.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "role" => Some(Self::Role),
            "policy_attachment" => Some(Self::PolicyAttachment),
            "cluster" => Some(Self::Cluster),
            "node_group" => Some(Self::NodeGroup),
            _ => None,
        }
    }

    /// Returns the declaration string for this kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Role => "role",
            Self::PolicyAttachment => "policy_attachment",
            Self::Cluster => "cluster",
            Self::NodeGroup => "node_group",
        }
    }

    /// Returns true if creation of this kind must be polled until the
    /// provider reports it active.
    #[must_use]
    pub const fn polls_until_active(self) -> bool {
        matches!(self, Self::Cluster | Self::NodeGroup)
    }

    /// Attribute names whose change cannot be applied in place.
    ///
    /// A stored resource whose desired value changed for one of these is
    /// planned as destroy+create rather than update.
    #[must_use]
    pub const fn replacement_attributes(self) -> &'static [&'static str] {
        match self {
            Self::Role => &["assume_policy"],
            Self::PolicyAttachment => &["role", "policy_arn"],
            Self::Cluster => &["role_arn", "subnet_ids"],
            Self::NodeGroup => &["cluster", "role_arn", "subnet_ids", "instance_type"],
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A declared attribute value.
///
/// Either a literal value, a reference to another resource's output
/// attribute, or a discovery query whose (filtered) result is substituted at
/// execution time.
#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    /// A literal value taken verbatim from the declaration.
    Literal(serde_json::Value),
    /// A reference to another resource's output attribute, declared as
    /// `${resource.attribute}`.
    Reference {
        /// Referenced resource id.
        resource: String,
        /// Output attribute name on the referenced resource.
        attribute: String,
    },
    /// A discovery query, declared as `${subnets:<vpc-id>}`.
    Discovery(DiscoveryQuery),
}

/// A read-only query against the provider inventory.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DiscoveryQuery {
    /// Enumerate the subnets of a VPC, in provider order.
    SubnetsByVpc {
        /// The VPC to enumerate.
        vpc_id: String,
    },
    /// Ask the provider which availability zones it does not support for
    /// placement of the given resource kind.
    UnsupportedZones {
        /// The resource kind being placed.
        kind: ResourceKind,
    },
}

impl DiscoveryQuery {
    /// Returns the cache signature for this query.
    ///
    /// Two queries with equal signatures share one cached result within a
    /// run.
    #[must_use]
    pub fn signature(&self) -> String {
        match self {
            Self::SubnetsByVpc { vpc_id } => format!("subnets:{vpc_id}"),
            Self::UnsupportedZones { kind } => format!("unsupported_zones:{kind}"),
        }
    }
}

impl std::fmt::Display for DiscoveryQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.signature())
    }
}

impl AttrValue {
    /// Parses an attribute string into a reference, a discovery query, or a
    /// literal.
    ///
    /// Strings of the form `${resource.attribute}` become references and
    /// `${subnets:<vpc-id>}` become discovery queries; anything without an
    /// interpolation marker is a literal.
    ///
    /// # Errors
    ///
    /// Returns an error for malformed `${...}` expressions.
    pub fn parse(s: &str) -> Result<Self, String> {
        if !s.starts_with("${") {
            if s.contains("${") {
                return Err(format!("Embedded interpolation is not supported: {s}"));
            }
            return Ok(Self::Literal(serde_json::Value::String(s.to_string())));
        }

        let Some(inner) = s.strip_prefix("${").and_then(|r| r.strip_suffix('}')) else {
            return Err(format!("Unterminated interpolation: {s}"));
        };

        if let Some(vpc_id) = inner.strip_prefix("subnets:") {
            if vpc_id.is_empty() {
                return Err(String::from("Subnet discovery requires a VPC id"));
            }
            return Ok(Self::Discovery(DiscoveryQuery::SubnetsByVpc {
                vpc_id: vpc_id.to_string(),
            }));
        }

        let Some((resource, attribute)) = inner.split_once('.') else {
            return Err(format!(
                "Invalid reference '{s}'. Expected format: ${{resource.attribute}}"
            ));
        };

        if resource.is_empty() || attribute.is_empty() || attribute.contains('.') {
            return Err(format!(
                "Invalid reference '{s}'. Expected format: ${{resource.attribute}}"
            ));
        }

        Ok(Self::Reference {
            resource: resource.to_string(),
            attribute: attribute.to_string(),
        })
    }

    /// Returns the declaration string form of this value.
    #[must_use]
    pub fn to_declaration(&self) -> serde_json::Value {
        match self {
            Self::Literal(value) => value.clone(),
            Self::Reference {
                resource,
                attribute,
            } => serde_json::Value::String(format!("${{{resource}.{attribute}}}")),
            Self::Discovery(query) => serde_json::Value::String(format!("${{{query}}}")),
        }
    }

    /// Returns the referenced resource id, if this value is a reference.
    #[must_use]
    pub fn referenced_resource(&self) -> Option<&str> {
        match self {
            Self::Reference { resource, .. } => Some(resource),
            _ => None,
        }
    }

    /// Returns the discovery query, if this value is one.
    #[must_use]
    pub const fn discovery_query(&self) -> Option<&DiscoveryQuery> {
        match self {
            Self::Discovery(query) => Some(query),
            _ => None,
        }
    }
}

impl Serialize for AttrValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_declaration().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for AttrValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        match value {
            serde_json::Value::String(s) => Self::parse(&s).map_err(D::Error::custom),
            other => Ok(Self::Literal(other)),
        }
    }
}

/// Scaling configuration for a node group.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScalingConfig {
    /// Minimum number of nodes.
    pub min: u32,
    /// Desired number of nodes.
    pub desired: u32,
    /// Maximum number of nodes.
    pub max: u32,
}

impl ScalingConfig {
    /// Checks the `min <= desired <= max` invariant.
    #[must_use]
    pub const fn bounds_valid(&self) -> bool {
        self.min <= self.desired && self.desired <= self.max
    }

    /// Extracts a scaling configuration from a literal attribute value.
    ///
    /// # Errors
    ///
    /// Returns a description of the problem if the value is not a map of
    /// three non-negative integers.
    pub fn from_literal(value: &serde_json::Value) -> Result<Self, String> {
        let obj = value
            .as_object()
            .ok_or_else(|| String::from("scaling must be a map with min, desired, and max"))?;

        let field = |name: &str| -> Result<u32, String> {
            let raw = obj
                .get(name)
                .ok_or_else(|| format!("scaling is missing '{name}'"))?;
            raw.as_u64()
                .and_then(|v| u32::try_from(v).ok())
                .ok_or_else(|| format!("scaling '{name}' must be a non-negative integer"))
        };

        Ok(Self {
            min: field("min")?,
            desired: field("desired")?,
            max: field("max")?,
        })
    }
}

impl ResourceSpec {
    /// Returns the resource ids referenced by this spec's attributes.
    #[must_use]
    pub fn referenced_resources(&self) -> Vec<&str> {
        self.attributes
            .values()
            .filter_map(AttrValue::referenced_resource)
            .collect()
    }

    /// Returns the discovery queries implied by this spec's attributes.
    #[must_use]
    pub fn discovery_queries(&self) -> Vec<&DiscoveryQuery> {
        self.attributes
            .values()
            .filter_map(AttrValue::discovery_query)
            .collect()
    }
}

impl Catalog {
    /// Looks up a resource by id.
    #[must_use]
    pub fn resource(&self, id: &str) -> Option<&ResourceSpec> {
        self.resources.iter().find(|r| r.id == id)
    }

    /// Returns the fully qualified project name including environment.
    #[must_use]
    pub fn qualified_name(&self) -> String {
        format!("{}-{}", self.project.name, self.project.environment)
    }

    /// Returns every distinct discovery query implied by the catalog, in
    /// first-reference order.
    #[must_use]
    pub fn discovery_queries(&self) -> Vec<&DiscoveryQuery> {
        let mut seen = std::collections::HashSet::new();
        let mut queries = Vec::new();
        for resource in &self.resources {
            for query in resource.discovery_queries() {
                if seen.insert(query.signature()) {
                    queries.push(query);
                }
            }
        }
        queries
    }
}

// Default value functions

fn default_environment() -> String {
    String::from("dev")
}
