use anyhow::{Context, Result};
use envoy_operator_controller::{bootstrap, deployment, Envoy};
use std::path::Path;

/// Reads an `Envoy` manifest (JSON) from `path`.
pub fn read_envoy(path: &Path) -> Result<Envoy> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    serde_json::from_reader(std::io::BufReader::new(file))
        .with_context(|| format!("failed to parse an Envoy from {}", path.display()))
}

/// Builds the objects the operator creates for `envoy`, as a `v1/List`.
pub fn render(envoy: &Envoy, init_image: &str) -> Result<serde_json::Value> {
    let config_map = bootstrap::config_map(envoy)?;
    let deployment = deployment::deployment(envoy, init_image)?;
    Ok(serde_json::json!({
        "apiVersion": "v1",
        "kind": "List",
        "items": [config_map, deployment],
    }))
}
