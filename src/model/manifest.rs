use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// The runtime class a callable executes under — a tagged variant per
/// runtime class rather than an inheritance hierarchy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeClass {
    Docker,
    Native,
    Wasm,
}

/// Describes one agent callable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentManifest {
    pub name: String,
    pub version: String,
    pub input_schema: serde_json::Value,
    pub output_schema: serde_json::Value,
    pub runtime: RuntimeClass,
    pub timeout_ms: u64,
    pub resource_limits: HashMap<String, f64>,
    pub egress_policy: String,
    pub tags: Vec<String>,
    /// Capability tag SEM's micro-planner matches against `requiredArtifact`.
    pub produces: Vec<String>,
}

/// Describes one tool callable; identical shape to `AgentManifest` but kept
/// as a distinct type so registries can distinguish "agent" from "tool" at
/// the type level.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolManifest {
    pub name: String,
    pub version: String,
    pub input_schema: serde_json::Value,
    pub output_schema: serde_json::Value,
    pub runtime: RuntimeClass,
    pub timeout_ms: u64,
    pub resource_limits: HashMap<String, f64>,
    pub egress_policy: String,
    pub tags: Vec<String>,
    pub produces: Vec<String>,
}

impl ToolManifest {
    /// First tool with a matching `produces` tag wins — SEM's deterministic
    /// producer-selection heuristic.
    pub fn produces_artifact(&self, artifact_type: &str) -> bool {
        self.produces.iter().any(|p| p == artifact_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool(name: &str, produces: &[&str]) -> ToolManifest {
        ToolManifest {
            name: name.to_string(),
            version: "1.0.0".into(),
            input_schema: serde_json::json!({}),
            output_schema: serde_json::json!({}),
            runtime: RuntimeClass::Native,
            timeout_ms: 60_000,
            resource_limits: HashMap::new(),
            egress_policy: "none".into(),
            tags: vec![],
            produces: produces.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn produces_artifact_matches_tag() {
        let t = tool("tool.code.staticPack", &["sast-report"]);
        assert!(t.produces_artifact("sast-report"));
        assert!(!t.produces_artifact("sbom"));
    }
}
