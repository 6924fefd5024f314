use crate::error::{LinkError, Result};
use crate::protocol::{FieldValue, TelemetryPoint, TelemetryValue, ValueKind};
use ahash::AHashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, RwLock};

pub type SchemaId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SchemaVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl SchemaVersion {
    pub const INITIAL: SchemaVersion = SchemaVersion::new(1, 0, 0);

    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self { major, minor, patch }
    }

    pub fn parse(text: &str) -> Result<Self> {
        let parts: Vec<&str> = text.trim_start_matches('v').split('.').collect();
        if parts.len() != 3 {
            return Err(LinkError::Validation(format!("Invalid schema version: {}", text)));
        }

        let parse = |part: &str| {
            part.parse::<u32>()
                .map_err(|_| LinkError::Validation(format!("Invalid schema version: {}", text)))
        };

        Ok(Self::new(parse(parts[0])?, parse(parts[1])?, parse(parts[2])?))
    }
}

impl fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Structural rules a value must satisfy beyond its variant matching the kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShapeRules {
    pub require_finite: bool,
    pub min_len: Option<usize>,
    pub max_len: Option<usize>,
    pub max_depth: usize,
}

impl Default for ShapeRules {
    fn default() -> Self {
        Self {
            require_finite: true,
            min_len: None,
            max_len: None,
            max_depth: 16,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySchema {
    pub id: SchemaId,
    pub kind: ValueKind,
    pub version: SchemaVersion,
    pub rules: ShapeRules,
    pub description: Option<String>,
}

impl TelemetrySchema {
    pub fn new(kind: ValueKind, version: SchemaVersion) -> Self {
        Self {
            id: Self::id_for(kind, version),
            kind,
            version,
            rules: ShapeRules::default(),
            description: None,
        }
    }

    /// `telemetry.<kind>.v<major>.<minor>.<patch>`
    pub fn id_for(kind: ValueKind, version: SchemaVersion) -> SchemaId {
        format!("telemetry.{}.v{}", kind, version)
    }

    pub fn with_rules(mut self, rules: ShapeRules) -> Self {
        self.rules = rules;
        self
    }

    pub fn with_description(mut self, description: String) -> Self {
        self.description = Some(description);
        self
    }

    /// Checks the point against this schema, returning the first violation found.
    pub fn check(&self, point: &TelemetryPoint) -> std::result::Result<(), String> {
        if !(0.0..=1.0).contains(&point.quality) {
            return Err(format!("quality {} outside [0, 1]", point.quality));
        }
        if point.timestamp < 0 {
            return Err(format!("negative timestamp {}", point.timestamp));
        }

        let actual = point.value.kind();
        if actual != self.kind {
            return Err(format!("value is {} but schema {} expects {}", actual, self.id, self.kind));
        }

        let rules = &self.rules;
        match &point.value {
            TelemetryValue::Numeric(v) => check_finite(rules, *v),
            TelemetryValue::Vector(values) => {
                check_len(rules, values.len())?;
                values.iter().try_for_each(|v| check_finite(rules, *v))
            }
            TelemetryValue::Matrix(rows) => {
                check_len(rules, rows.len())?;
                let width = rows.first().map(Vec::len).unwrap_or(0);
                for (index, row) in rows.iter().enumerate() {
                    if row.len() != width {
                        return Err(format!(
                            "matrix row {} has {} columns, expected {}",
                            index,
                            row.len(),
                            width
                        ));
                    }
                    row.iter().try_for_each(|v| check_finite(rules, *v))?;
                }
                Ok(())
            }
            TelemetryValue::String(text) => check_len(rules, text.len()),
            TelemetryValue::Boolean(_) => Ok(()),
            TelemetryValue::Object(fields) => {
                check_len(rules, fields.len())?;
                fields
                    .values()
                    .try_for_each(|field| check_field(rules, field, 1))
            }
        }
    }
}

fn check_finite(rules: &ShapeRules, value: f64) -> std::result::Result<(), String> {
    if rules.require_finite && !value.is_finite() {
        Err(format!("non-finite number {}", value))
    } else {
        Ok(())
    }
}

fn check_len(rules: &ShapeRules, len: usize) -> std::result::Result<(), String> {
    if let Some(min) = rules.min_len {
        if len < min {
            return Err(format!("length {} below minimum {}", len, min));
        }
    }
    if let Some(max) = rules.max_len {
        if len > max {
            return Err(format!("length {} above maximum {}", len, max));
        }
    }
    Ok(())
}

fn check_field(rules: &ShapeRules, field: &FieldValue, depth: usize) -> std::result::Result<(), String> {
    if depth > rules.max_depth {
        return Err(format!("object nesting deeper than {}", rules.max_depth));
    }
    match field {
        FieldValue::Number(v) => check_finite(rules, *v),
        FieldValue::Array(items) => items
            .iter()
            .try_for_each(|item| check_field(rules, item, depth + 1)),
        FieldValue::Map(map) => map
            .values()
            .try_for_each(|item| check_field(rules, item, depth + 1)),
        _ => Ok(()),
    }
}

/// Versioned schemas per value kind.
///
/// Clones share the same underlying tables, so one registry can be handed to
/// several owners and stay consistent.
pub struct SchemaRegistry {
    schemas: Arc<RwLock<AHashMap<SchemaId, TelemetrySchema>>>,
    current: Arc<RwLock<AHashMap<ValueKind, SchemaId>>>,
    version_history: Arc<RwLock<AHashMap<ValueKind, Vec<SchemaVersion>>>>,
}

impl SchemaRegistry {
    /// Empty registry with no schemas.
    pub fn empty() -> Self {
        Self {
            schemas: Arc::new(RwLock::new(AHashMap::new())),
            current: Arc::new(RwLock::new(AHashMap::new())),
            version_history: Arc::new(RwLock::new(AHashMap::new())),
        }
    }

    /// Registry with one `1.0.0` schema per value kind.
    pub fn new() -> Self {
        let registry = Self::empty();
        for kind in ValueKind::ALL {
            let schema = TelemetrySchema::new(kind, SchemaVersion::INITIAL)
                .with_description(format!("Telemetry {} value", kind));
            // A fresh registry cannot conflict.
            let _ = registry.register(schema);
        }
        registry
    }

    pub fn register(&self, schema: TelemetrySchema) -> Result<()> {
        let mut schemas = self.schemas.write().map_err(LinkError::lock_poisoned)?;
        let mut current = self.current.write().map_err(LinkError::lock_poisoned)?;
        let mut version_history = self.version_history.write().map_err(LinkError::lock_poisoned)?;

        let history = version_history.entry(schema.kind).or_default();
        if history.contains(&schema.version) || schemas.contains_key(&schema.id) {
            return Err(LinkError::SchemaConflict(schema.id));
        }

        let is_newest = history.iter().all(|v| *v < schema.version);
        history.push(schema.version);
        history.sort();

        if is_newest {
            current.insert(schema.kind, schema.id.clone());
        }

        tracing::debug!(schema_id = %schema.id, current = is_newest, "registered schema");
        schemas.insert(schema.id.clone(), schema);

        Ok(())
    }

    pub fn get(&self, schema_id: &str) -> Result<TelemetrySchema> {
        let schemas = self.schemas.read().map_err(LinkError::lock_poisoned)?;

        schemas
            .get(schema_id)
            .cloned()
            .ok_or_else(|| LinkError::SchemaNotFound(schema_id.to_string()))
    }

    pub fn has(&self, schema_id: &str) -> bool {
        self.schemas
            .read()
            .map(|schemas| schemas.contains_key(schema_id))
            .unwrap_or(false)
    }

    pub fn resolve_id(&self, kind: ValueKind) -> Result<SchemaId> {
        let current = self.current.read().map_err(LinkError::lock_poisoned)?;

        current
            .get(&kind)
            .cloned()
            .ok_or_else(|| LinkError::SchemaNotFound(format!("no schema for kind {}", kind)))
    }

    pub fn current(&self, kind: ValueKind) -> Result<TelemetrySchema> {
        let id = self.resolve_id(kind)?;
        self.get(&id)
    }

    pub fn get_version_history(&self, kind: ValueKind) -> Result<Vec<SchemaVersion>> {
        let history = self.version_history.read().map_err(LinkError::lock_poisoned)?;

        Ok(history.get(&kind).cloned().unwrap_or_default())
    }

    pub fn get_all(&self) -> Result<Vec<TelemetrySchema>> {
        let schemas = self.schemas.read().map_err(LinkError::lock_poisoned)?;

        Ok(schemas.values().cloned().collect())
    }

    pub fn validate(&self, point: &TelemetryPoint, schema: &TelemetrySchema) -> bool {
        schema.check(point).is_ok()
    }

    /// Validates against the current schema of `kind`.
    pub fn validate_point(&self, point: &TelemetryPoint, kind: ValueKind) -> Result<SchemaId> {
        let schema = self.current(kind)?;
        schema
            .check(point)
            .map(|_| schema.id.clone())
            .map_err(LinkError::Validation)
    }
}

impl Default for SchemaRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for SchemaRegistry {
    fn clone(&self) -> Self {
        Self {
            schemas: Arc::clone(&self.schemas),
            current: Arc::clone(&self.current),
            version_history: Arc::clone(&self.version_history),
        }
    }
}
