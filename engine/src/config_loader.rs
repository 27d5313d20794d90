//! Configuration loading: read a YAML document, resolve `!VAR`/`!ENV`
//! tags, stamp unique wire client ids, deserialize into [`FlowConfig`], and
//! validate cross-references before anything is built from it.
//!
//! Follows `agent/src/config.rs`'s load/validate/log shape, with client-id
//! uniqueness stamping modeled on `make_client_id_unique`.

use shared::config::FlowConfig;
use shared::error::FlowError;
use shared::utils::random_token;
use std::collections::HashMap;
use std::path::Path;

/// Load and fully validate a configuration file. `vars` supplies the
/// substitution map for `!VAR` tags (typically from repeated `--var KEY=VALUE`
/// CLI flags); `!ENV` tags read the process environment directly.
pub fn load(path: impl AsRef<Path>, vars: &HashMap<String, String>) -> Result<FlowConfig, FlowError> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path)
        .map_err(|e| FlowError::Config(format!("failed to read config file '{}': {e}", path.display())))?;
    load_str(&raw, vars)
}

/// As [`load`], but from an in-memory YAML document (used by tests and by
/// callers that already have the document, e.g. fetched from a remote store).
pub fn load_str(raw: &str, vars: &HashMap<String, String>) -> Result<FlowConfig, FlowError> {
    let document: serde_yaml::Value = serde_yaml::from_str(raw)
        .map_err(|e| FlowError::Config(format!("invalid YAML: {e}")))?;
    let resolved = shared::yaml_tags::resolve_tags(document, vars)?;

    let mut config: FlowConfig = serde_yaml::from_value(resolved)
        .map_err(|e| FlowError::Config(format!("config does not match the expected schema: {e}")))?;

    stamp_unique_client_ids(&mut config);
    config.validate()?;
    Ok(config)
}

/// A client with `client_id_unique` (default true) gets an 8 hex-char suffix
/// appended to its wire id, so repeated restarts of the same engine never
/// collide with a still-connected previous session on the broker.
fn stamp_unique_client_ids(config: &mut FlowConfig) {
    for client in &mut config.mqtt_clients {
        if client.client_id_unique {
            let base = client.client_id.clone().unwrap_or_else(|| client.client_name.clone());
            client.client_id = Some(format!("{base}-{}", random_token()));
        }
    }
}
