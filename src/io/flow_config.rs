//! Loading and validating a Flow's on-disk representation.
//!
//! A Flow directory holds one `flow.meta.json` and one `<NN>-<laneName>.json`
//! per lane (§6). Validation combines JSON Schema conformance with semantic
//! graph invariants not expressible in schema form (§4.5).

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use jsonschema::Draft;
use serde_json::Value;

use crate::core::graph::{GraphError, validate_graph};
use crate::core::types::{FlowMeta, LaneConfig};

const FLOW_META_SCHEMA: &str = include_str!("../../schemas/flow_meta.schema.json");
const LANE_CONFIG_SCHEMA: &str = include_str!("../../schemas/lane_config.schema.json");

/// A fully loaded and validated Flow.
#[derive(Debug, Clone)]
pub struct Flow {
    pub meta: FlowMeta,
    pub lanes: Vec<LaneConfig>,
}

/// Load and validate a Flow directory: schema conformance for every file,
/// then graph-level invariants over the full lane set.
pub fn load_flow(flow_dir: &Path) -> Result<Flow> {
    let meta_path = flow_dir.join("flow.meta.json");
    let meta_raw = fs::read_to_string(&meta_path)
        .with_context(|| format!("read {}", meta_path.display()))?;
    let meta = validate_and_parse::<FlowMeta>(&meta_raw, FLOW_META_SCHEMA)
        .with_context(|| format!("validate {}", meta_path.display()))?;

    let mut lane_files: Vec<_> = fs::read_dir(flow_dir)
        .with_context(|| format!("read {}", flow_dir.display()))?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(".json") && n != "flow.meta.json")
        })
        .collect();
    lane_files.sort();

    let mut lanes = Vec::new();
    for path in &lane_files {
        let raw = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        let lane = validate_and_parse::<LaneConfig>(&raw, LANE_CONFIG_SCHEMA)
            .with_context(|| format!("validate {}", path.display()))?;
        lanes.push(lane);
    }

    let graph_errors = validate_graph(&lanes);
    if !graph_errors.is_empty() {
        return Err(anyhow!(
            "flow graph invalid:\n- {}",
            graph_errors
                .iter()
                .map(GraphError::to_string)
                .collect::<Vec<_>>()
                .join("\n- ")
        ));
    }

    Ok(Flow { meta, lanes })
}

fn validate_and_parse<T: serde::de::DeserializeOwned>(raw: &str, schema_raw: &str) -> Result<T> {
    let instance: Value = serde_json::from_str(raw).context("parse json")?;
    let schema: Value = serde_json::from_str(schema_raw).context("parse schema")?;
    let compiled = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .context("compile json schema")?;
    let messages: Vec<String> = compiled.iter_errors(&instance).map(|e| e.to_string()).collect();
    if !messages.is_empty() {
        return Err(anyhow!("schema validation failed:\n- {}", messages.join("\n- ")));
    }
    serde_json::from_str(raw).context("parse as typed struct")
}
