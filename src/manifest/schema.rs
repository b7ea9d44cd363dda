//! Schema Registry - compiled JSON Schema validators
//!
//! Node and tool IO schemas are declared once in the manifest and compiled
//! once at load. Validation errors carry the instance path so the failing
//! field is obvious from the record.

use rustc_hash::FxHashMap;
use serde_json::Value;

use crate::error::{ArborError, Result};

/// Compiled validators keyed by schema id
pub struct SchemaRegistry {
    validators: FxHashMap<String, jsonschema::Validator>,
}

impl SchemaRegistry {
    /// Compile every declared schema. Compile failures are fatal at load.
    pub fn compile(schemas: &FxHashMap<String, Value>) -> Result<Self> {
        let mut validators = FxHashMap::default();
        for (id, schema) in schemas {
            let validator =
                jsonschema::Validator::new(schema).map_err(|e| ArborError::SchemaCompile {
                    schema_id: id.clone(),
                    details: e.to_string(),
                })?;
            validators.insert(id.clone(), validator);
        }
        Ok(Self { validators })
    }

    pub fn contains(&self, schema_id: &str) -> bool {
        self.validators.contains_key(schema_id)
    }

    /// Validate a value, collecting every violation into one message
    pub fn validate(&self, schema_id: &str, value: &Value) -> std::result::Result<(), String> {
        let Some(validator) = self.validators.get(schema_id) else {
            return Err(format!("schema '{schema_id}' not declared"));
        };

        let errors: Vec<String> = validator
            .iter_errors(value)
            .map(|e| format!("[{}] {}", e.instance_path, e))
            .collect();

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors.join("; "))
        }
    }
}

impl std::fmt::Debug for SchemaRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaRegistry")
            .field("schemas", &self.validators.len())
            .finish()
    }
}
