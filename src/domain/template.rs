use std::fs;
use std::path::Path;

use log::{debug, info};
use serde_json::Value;

use crate::error::{ConfigError, ExporterError, Result};

/// A sender to watch plus the rules the parser applies to its messages.
///
/// `index` is the declaration order in the mapping document; templates have no other key.
#[derive(Debug, Clone, PartialEq)]
pub struct EmailTemplate {
    pub index: usize,
    pub sender: String,
    pub rules: Value,
}

/// Reads the mapping and schema files, validates, and materializes the templates.
///
/// Nothing is returned unless the whole document is valid.
pub fn load(mappings_file: &Path, schema_file: &Path) -> Result<Vec<EmailTemplate>> {
    debug!("Getting mappings from {}", mappings_file.display());
    let mappings = read_json(mappings_file)?;

    debug!("Getting schema from {}", schema_file.display());
    let schema = read_json(schema_file)?;

    let templates = from_documents(&mappings, &schema, schema_file)?;
    info!(
        "Mappings are valid: {} template(s) from {}",
        templates.len(),
        mappings_file.display()
    );
    Ok(templates)
}

fn read_json(path: &Path) -> Result<Value> {
    let s = fs::read_to_string(path).map_err(|e| ExporterError::io(path, e))?;
    let v = serde_json::from_str(&s).map_err(|source| ConfigError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(v)
}

pub fn from_documents(
    mappings: &Value,
    schema: &Value,
    schema_file: &Path,
) -> Result<Vec<EmailTemplate>, ConfigError> {
    let validator = jsonschema::validator_for(schema).map_err(|e| ConfigError::Schema {
        path: schema_file.to_path_buf(),
        message: e.to_string(),
    })?;

    let violations: Vec<String> = validator
        .iter_errors(mappings)
        .map(|e| format!("{}: {}", e.instance_path, e))
        .collect();
    if !violations.is_empty() {
        return Err(ConfigError::Mapping(violations));
    }

    // The schema may be looser than what the poller needs.
    let entries = mappings
        .get("templates")
        .and_then(Value::as_array)
        .ok_or_else(|| ConfigError::Mapping(vec!["'templates' must be an array".into()]))?;
    if entries.is_empty() {
        return Err(ConfigError::Mapping(vec!["'templates' is empty".into()]));
    }

    entries
        .iter()
        .enumerate()
        .map(|(index, entry)| {
            let sender = entry
                .get("sender")
                .and_then(Value::as_str)
                .filter(|s| !s.trim().is_empty())
                .ok_or_else(|| {
                    ConfigError::Mapping(vec![format!("/templates/{index}: missing 'sender'")])
                })?;
            Ok(EmailTemplate {
                index,
                sender: sender.trim().to_string(),
                rules: entry.clone(),
            })
        })
        .collect()
}
