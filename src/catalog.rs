//! Operation Catalog
//!
//! Declarative operation specifications: the menu of privileged actions and
//! who may invoke them.
//!
//! # Record Format
//!
//! One JSON object per operation, either one per file or as an array of rows
//! in a single file:
//! ```json
//! {
//!   "id": "disk.wipe",
//!   "displayName": "Wipe disk",
//!   "category": "storage",
//!   "riskLevel": "destructive",
//!   "requiresConfirmation": true,
//!   "allowedRoles": ["owner", "admin"],
//!   "requiredCapabilities": ["storage.write"],
//!   "rateLimitPerMinute": 2,
//!   "parameterSchema": {
//!     "required": ["method"],
//!     "properties": { "method": { "type": "string", "enum": ["quick", "secure"] } }
//!   },
//!   "scriptSha256": "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08"
//! }
//! ```
//!
//! # Fail Closed
//!
//! A record missing `id` or `allowedRoles`, naming an unknown role or risk
//! level, or carrying a malformed schema is rejected. Rejected records are
//! invisible to lookups; they are never defaulted to something permissive.
//! A `scriptSha256` that is not 64 hex digits is rejected the same way.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::types::{RiskLevel, Role};

/// Errors that can occur during catalog operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CatalogError {
    /// No visible spec with this id
    #[error("Operation not found: {id}")]
    NotFound { id: String },

    /// Record failed structural validation
    #[error("Invalid operation record: {reason}")]
    InvalidRecord { reason: String },

    /// Two specs claim the same id
    #[error("Duplicate operation id: {id}")]
    DuplicateId { id: String },

    /// Request arguments violate the operation's parameter schema
    #[error("Invalid arguments for '{operation}': {reason}")]
    InvalidArguments { operation: String, reason: String },

    /// IO error reading the catalog
    #[error("Failed to read catalog: {reason}")]
    Io { reason: String },
}

impl From<std::io::Error> for CatalogError {
    fn from(err: std::io::Error) -> Self {
        CatalogError::Io {
            reason: err.to_string(),
        }
    }
}

/// JSON type accepted for one parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParameterType {
    String,
    Integer,
    Number,
    Boolean,
    Object,
    Array,
}

impl ParameterType {
    fn accepts(self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Number => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::Object => value.is_object(),
            Self::Array => value.is_array(),
        }
    }
}

/// Rule for a single named parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ParameterRule {
    #[serde(rename = "type")]
    pub kind: ParameterType,

    /// Anchored match for string values (`^prefix`, `suffix$`, `^exact$`, or contains)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,

    /// Closed set of accepted values
    #[serde(default, rename = "enum", skip_serializing_if = "Option::is_none")]
    pub allowed: Option<Vec<Value>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Parameter schema attached to an operation spec
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ParameterSchema {
    #[serde(default)]
    pub required: Vec<String>,

    #[serde(default)]
    pub properties: BTreeMap<String, ParameterRule>,

    #[serde(default = "default_additional_properties")]
    pub additional_properties: bool,
}

fn default_additional_properties() -> bool {
    true
}

impl Default for ParameterSchema {
    fn default() -> Self {
        Self {
            required: Vec::new(),
            properties: BTreeMap::new(),
            additional_properties: true,
        }
    }
}

/// Anchor-style matching: `^x` prefix, `x$` suffix, `^x$` exact, otherwise contains
fn matches_pattern(pattern: &str, value: &str) -> bool {
    if pattern.len() >= 2 && pattern.starts_with('^') && pattern.ends_with('$') {
        value == &pattern[1..pattern.len() - 1]
    } else if let Some(prefix) = pattern.strip_prefix('^') {
        value.starts_with(prefix)
    } else if let Some(suffix) = pattern.strip_suffix('$') {
        value.ends_with(suffix)
    } else {
        value.contains(pattern)
    }
}

impl ParameterSchema {
    /// Validate request arguments against this schema
    ///
    /// `Null` is treated as an empty argument object.
    pub fn validate(&self, operation: &str, arguments: &Value) -> Result<(), CatalogError> {
        let invalid = |reason: String| CatalogError::InvalidArguments {
            operation: operation.to_string(),
            reason,
        };

        let empty = serde_json::Map::new();
        let args = match arguments {
            Value::Null => &empty,
            Value::Object(map) => map,
            _ => return Err(invalid("arguments must be a JSON object".to_string())),
        };

        for name in &self.required {
            match args.get(name) {
                None | Some(Value::Null) => {
                    return Err(invalid(format!("missing required argument '{}'", name)));
                }
                Some(_) => {}
            }
        }

        for (name, value) in args {
            let Some(rule) = self.properties.get(name) else {
                if self.additional_properties {
                    continue;
                }
                return Err(invalid(format!("unexpected argument '{}'", name)));
            };

            if !rule.kind.accepts(value) {
                return Err(invalid(format!(
                    "argument '{}' must be of type {:?}",
                    name, rule.kind
                )));
            }

            if let (Some(pattern), Some(text)) = (&rule.pattern, value.as_str()) {
                if !matches_pattern(pattern, text) {
                    return Err(invalid(format!(
                        "argument '{}' must match pattern: {}",
                        name, pattern
                    )));
                }
            }

            if let Some(allowed) = &rule.allowed {
                if !allowed.contains(value) {
                    return Err(invalid(format!(
                        "argument '{}' must be one of {}",
                        name,
                        Value::Array(allowed.clone())
                    )));
                }
            }
        }

        Ok(())
    }
}

/// Immutable description of one privileged operation
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationSpec {
    pub id: String,
    pub display_name: String,
    pub category: String,
    pub risk_level: RiskLevel,
    pub requires_confirmation: bool,
    pub allowed_roles: BTreeSet<Role>,
    pub required_capabilities: BTreeSet<String>,
    /// Zero disables the rate-limit gate for this operation
    pub rate_limit_per_minute: u32,
    pub parameter_schema: ParameterSchema,
    /// Overrides the engine-wide provider timeout
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Lowercase hex SHA-256 the provider script must match
    #[serde(skip_serializing_if = "Option::is_none")]
    pub script_sha256: Option<String>,
}

impl OperationSpec {
    /// Create a new spec builder
    pub fn builder(id: impl Into<String>) -> OperationSpecBuilder {
        OperationSpecBuilder::new(id)
    }

    /// Whether the confirmation gate applies
    ///
    /// Destructive operations always need confirmation.
    pub fn needs_confirmation(&self) -> bool {
        self.requires_confirmation || self.risk_level.forces_confirmation()
    }

    pub fn allows(&self, role: Role) -> bool {
        self.allowed_roles.contains(&role)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    /// Validate arguments against the parameter schema
    pub fn validate_arguments(&self, arguments: &Value) -> Result<(), CatalogError> {
        self.parameter_schema.validate(&self.id, arguments)
    }

    fn validate_structure(&self) -> Result<(), CatalogError> {
        if self.id.trim().is_empty() {
            return Err(CatalogError::InvalidRecord {
                reason: "id must not be empty".to_string(),
            });
        }
        if self.allowed_roles.is_empty() {
            return Err(CatalogError::InvalidRecord {
                reason: format!("operation '{}' has no allowed roles", self.id),
            });
        }
        if self.required_capabilities.iter().any(|c| c.trim().is_empty()) {
            return Err(CatalogError::InvalidRecord {
                reason: format!("operation '{}' names an empty capability", self.id),
            });
        }
        if let Some(digest) = &self.script_sha256 {
            let well_formed = digest.len() == 64
                && digest.chars().all(|c| matches!(c, '0'..='9' | 'a'..='f'));
            if !well_formed {
                return Err(CatalogError::InvalidRecord {
                    reason: format!(
                        "operation '{}' has a scriptSha256 that is not 64 hex digits",
                        self.id
                    ),
                });
            }
        }
        Ok(())
    }
}

/// Raw catalog record; every field optional so rejection can name what is missing
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CatalogRecord {
    id: Option<String>,
    display_name: Option<String>,
    category: Option<String>,
    risk_level: Option<String>,
    requires_confirmation: Option<bool>,
    allowed_roles: Option<Vec<String>>,
    required_capabilities: Option<Vec<String>>,
    rate_limit_per_minute: Option<u32>,
    parameter_schema: Option<Value>,
    timeout_ms: Option<u64>,
    script_sha256: Option<String>,
}

impl CatalogRecord {
    fn into_spec(self) -> Result<OperationSpec, CatalogError> {
        let invalid = |reason: String| CatalogError::InvalidRecord { reason };

        let id = self
            .id
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| invalid("missing id".to_string()))?;

        let raw_roles = self
            .allowed_roles
            .ok_or_else(|| invalid(format!("operation '{}' is missing allowedRoles", id)))?;
        let mut allowed_roles = BTreeSet::new();
        for raw in raw_roles {
            let role = raw
                .parse::<Role>()
                .map_err(|_| invalid(format!("operation '{}' names unknown role '{}'", id, raw)))?;
            allowed_roles.insert(role);
        }

        let risk_level = match self.risk_level {
            None => RiskLevel::default(),
            Some(raw) => raw.parse::<RiskLevel>().map_err(|_| {
                invalid(format!("operation '{}' has unknown riskLevel '{}'", id, raw))
            })?,
        };

        let parameter_schema = match self.parameter_schema {
            None | Some(Value::Null) => ParameterSchema::default(),
            Some(raw) => serde_json::from_value(raw).map_err(|e| {
                invalid(format!("operation '{}' has malformed parameterSchema: {}", id, e))
            })?,
        };

        let spec = OperationSpec {
            display_name: self.display_name.unwrap_or_else(|| id.clone()),
            category: self.category.unwrap_or_else(|| "general".to_string()),
            risk_level,
            requires_confirmation: self.requires_confirmation.unwrap_or(false),
            allowed_roles,
            required_capabilities: self
                .required_capabilities
                .unwrap_or_default()
                .into_iter()
                .collect(),
            rate_limit_per_minute: self.rate_limit_per_minute.unwrap_or(0),
            parameter_schema,
            timeout_ms: self.timeout_ms,
            script_sha256: self.script_sha256.map(|d| d.trim().to_ascii_lowercase()),
            id,
        };
        spec.validate_structure()?;
        Ok(spec)
    }
}

/// A record that did not make it into the catalog
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RejectedRecord {
    pub source: PathBuf,
    /// Position inside an array file
    pub index: Option<usize>,
    pub id: Option<String>,
    pub reason: String,
}

/// Outcome of loading a catalog directory
#[derive(Debug)]
pub struct CatalogLoad {
    pub catalog: OperationCatalog,
    pub rejected: Vec<RejectedRecord>,
}

/// Parse one file into records; a file holds an object or an array of objects
fn parse_file(path: &Path) -> Result<Vec<(Option<usize>, Value)>, CatalogError> {
    let content = std::fs::read_to_string(path)?;
    let value: Value = serde_json::from_str(&content).map_err(|e| CatalogError::InvalidRecord {
        reason: format!("{}: {}", path.display(), e),
    })?;
    Ok(match value {
        Value::Array(rows) => rows
            .into_iter()
            .enumerate()
            .map(|(i, row)| (Some(i), row))
            .collect(),
        other => vec![(None, other)],
    })
}

/// Read-only registry of validated operation specs
#[derive(Debug, Default, Clone)]
pub struct OperationCatalog {
    specs: BTreeMap<String, OperationSpec>,
}

impl OperationCatalog {
    /// Create a new empty catalog
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a catalog from specs, rejecting duplicate ids
    pub fn from_specs(specs: impl IntoIterator<Item = OperationSpec>) -> Result<Self, CatalogError> {
        let mut catalog = Self::new();
        for spec in specs {
            catalog.register(spec)?;
        }
        Ok(catalog)
    }

    /// Register a spec; ids are unique
    pub fn register(&mut self, spec: OperationSpec) -> Result<(), CatalogError> {
        spec.validate_structure()?;
        if self.specs.contains_key(&spec.id) {
            return Err(CatalogError::DuplicateId { id: spec.id });
        }
        self.specs.insert(spec.id.clone(), spec);
        Ok(())
    }

    /// Load every `*.json` record under `dir`
    ///
    /// Individual bad records are reported in `rejected`; only an unreadable
    /// directory is an error. Ids that appear in more than one valid record
    /// are rejected entirely.
    pub fn load_from_directory(dir: impl AsRef<Path>) -> Result<CatalogLoad, CatalogError> {
        let dir = dir.as_ref();
        let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.extension().map(|e| e == "json").unwrap_or(false))
            .collect();
        paths.sort();

        let mut rejected = Vec::new();
        let mut candidates: HashMap<String, Vec<(PathBuf, Option<usize>, OperationSpec)>> =
            HashMap::new();

        for path in paths {
            let rows = match parse_file(&path) {
                Ok(rows) => rows,
                Err(e) => {
                    warn!("Rejecting catalog file {}: {}", path.display(), e);
                    rejected.push(RejectedRecord {
                        source: path.clone(),
                        index: None,
                        id: None,
                        reason: e.to_string(),
                    });
                    continue;
                }
            };

            for (index, row) in rows {
                let claimed_id = row.get("id").and_then(Value::as_str).map(str::to_string);
                let parsed = serde_json::from_value::<CatalogRecord>(row)
                    .map_err(|e| CatalogError::InvalidRecord {
                        reason: e.to_string(),
                    })
                    .and_then(CatalogRecord::into_spec);

                match parsed {
                    Ok(spec) => candidates
                        .entry(spec.id.clone())
                        .or_default()
                        .push((path.clone(), index, spec)),
                    Err(e) => {
                        warn!("Rejecting catalog record in {}: {}", path.display(), e);
                        rejected.push(RejectedRecord {
                            source: path.clone(),
                            index,
                            id: claimed_id,
                            reason: e.to_string(),
                        });
                    }
                }
            }
        }

        let mut catalog = Self::new();
        for (id, mut found) in candidates {
            if found.len() == 1 {
                let (_, _, spec) = found.remove(0);
                catalog.specs.insert(id, spec);
                continue;
            }
            warn!("Rejecting {} records sharing operation id '{}'", found.len(), id);
            for (source, index, _) in found {
                rejected.push(RejectedRecord {
                    source,
                    index,
                    id: Some(id.clone()),
                    reason: CatalogError::DuplicateId { id: id.clone() }.to_string(),
                });
            }
        }

        info!(
            "Loaded {} operation spec(s) from {} ({} rejected)",
            catalog.len(),
            dir.display(),
            rejected.len()
        );
        Ok(CatalogLoad { catalog, rejected })
    }

    /// Look up a spec by id
    pub fn get_by_id(&self, id: &str) -> Result<&OperationSpec, CatalogError> {
        self.specs.get(id).ok_or_else(|| {
            debug!("Catalog miss for operation '{}'", id);
            CatalogError::NotFound { id: id.to_string() }
        })
    }

    /// Specs the role may invoke, ordered by id
    pub fn list_for_role(&self, role: Role) -> Vec<&OperationSpec> {
        self.specs.values().filter(|spec| spec.allows(role)).collect()
    }

    pub fn all(&self) -> impl Iterator<Item = &OperationSpec> {
        self.specs.values()
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}

/// Builder for creating OperationSpec instances
#[derive(Debug, Clone)]
pub struct OperationSpecBuilder {
    spec: OperationSpec,
}

impl OperationSpecBuilder {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            spec: OperationSpec {
                display_name: id.clone(),
                category: "general".to_string(),
                risk_level: RiskLevel::Low,
                requires_confirmation: false,
                allowed_roles: BTreeSet::new(),
                required_capabilities: BTreeSet::new(),
                rate_limit_per_minute: 0,
                parameter_schema: ParameterSchema::default(),
                timeout_ms: None,
                script_sha256: None,
                id,
            },
        }
    }

    pub fn display_name(mut self, name: impl Into<String>) -> Self {
        self.spec.display_name = name.into();
        self
    }

    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.spec.category = category.into();
        self
    }

    pub fn risk(mut self, level: RiskLevel) -> Self {
        self.spec.risk_level = level;
        self
    }

    pub fn requires_confirmation(mut self) -> Self {
        self.spec.requires_confirmation = true;
        self
    }

    pub fn allow(mut self, role: Role) -> Self {
        self.spec.allowed_roles.insert(role);
        self
    }

    pub fn require_capability(mut self, capability: impl Into<String>) -> Self {
        self.spec.required_capabilities.insert(capability.into());
        self
    }

    pub fn rate_limit(mut self, per_minute: u32) -> Self {
        self.spec.rate_limit_per_minute = per_minute;
        self
    }

    pub fn schema(mut self, schema: ParameterSchema) -> Self {
        self.spec.parameter_schema = schema;
        self
    }

    pub fn timeout_ms(mut self, ms: u64) -> Self {
        self.spec.timeout_ms = Some(ms);
        self
    }

    /// Pin the provider script to a SHA-256 digest (hex)
    pub fn script_sha256(mut self, digest: impl Into<String>) -> Self {
        self.spec.script_sha256 = Some(digest.into().to_ascii_lowercase());
        self
    }

    /// Validate and build the operation spec
    pub fn build(self) -> Result<OperationSpec, CatalogError> {
        self.spec.validate_structure()?;
        Ok(self.spec)
    }
}
