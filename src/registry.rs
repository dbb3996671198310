//! Open registry of agents and tools (Design Notes, "Dynamic agent
//! dispatch"). Represents each callable as a tagged record with capability
//! metadata; invocation is polymorphic over a small capability set
//! (`execute`, `cancel`, `health_check`) rather than an inheritance
//! hierarchy — one enum variant per runtime class is sufficient.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::dispatcher::{DispatchRequest, DispatchResponse, Doer};
use crate::errors::DispatchError;
use crate::model::{AgentManifest, ToolManifest};

/// A registered callable: its manifest plus the `Doer` that executes it.
#[derive(Clone)]
pub struct RegisteredDoer {
    pub manifest: CallableManifest,
    pub doer: Arc<dyn Doer>,
}

/// Either shape of manifest a registry entry may carry.
#[derive(Debug, Clone)]
pub enum CallableManifest {
    Agent(AgentManifest),
    Tool(ToolManifest),
}

impl CallableManifest {
    pub fn name(&self) -> &str {
        match self {
            CallableManifest::Agent(m) => &m.name,
            CallableManifest::Tool(m) => &m.name,
        }
    }

    pub fn produces(&self) -> &[String] {
        match self {
            CallableManifest::Agent(m) => &m.produces,
            CallableManifest::Tool(m) => &m.produces,
        }
    }

    pub fn tags(&self) -> &[String] {
        match self {
            CallableManifest::Agent(m) => &m.tags,
            CallableManifest::Tool(m) => &m.tags,
        }
    }

    pub fn version(&self) -> &str {
        match self {
            CallableManifest::Agent(m) => &m.version,
            CallableManifest::Tool(m) => &m.version,
        }
    }
}

/// Capability-tagged dispatch surface: a callable exposes `execute`,
/// `cancel` and `health_check` regardless of whether it's an agent or a
/// tool, docker-backed or native (Design Notes).
#[async_trait]
pub trait Capability: Send + Sync {
    async fn execute(&self, request: DispatchRequest) -> Result<DispatchResponse, DispatchError>;
    async fn cancel(&self, task_id: &str);
    async fn health_check(&self) -> bool;
}

/// Registry of every agent/tool the embedder has wired in.
#[derive(Default, Clone)]
pub struct Registry {
    entries: HashMap<String, RegisteredDoer>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, manifest: CallableManifest, doer: Arc<dyn Doer>) {
        let name = manifest.name().to_string();
        self.entries.insert(name, RegisteredDoer { manifest, doer });
    }

    pub fn get(&self, name: &str) -> Option<&RegisteredDoer> {
        self.entries.get(name)
    }

    /// SEM's deterministic heuristic: first registered callable whose
    /// `produces` tag matches, and that is on the given allow-list
    /// (Design Notes, "SEM agent acting as orchestrator").
    pub fn find_producer(&self, artifact_type: &str, allow_list: &[String]) -> Option<&str> {
        self.entries
            .values()
            .find(|entry| {
                allow_list.contains(&entry.manifest.name().to_string())
                    && entry.manifest.produces().iter().any(|p| p == artifact_type)
            })
            .map(|entry| entry.manifest.name())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::{DispatchRequest, DispatchResponse};
    use crate::model::RuntimeClass;
    use std::collections::HashMap as StdHashMap;

    struct StubDoer;

    #[async_trait]
    impl Doer for StubDoer {
        async fn invoke(
            &self,
            _request: DispatchRequest,
        ) -> Result<DispatchResponse, DispatchError> {
            Ok(DispatchResponse {
                ok: true,
                output: Some(serde_json::json!({})),
                artifacts: vec![],
                duration_ms: 10,
                tokens: 0,
                tool_minutes: 0.0,
                cost_usd: 0.0,
                retry_count: 0,
                error: None,
                execution_id: "exec-1".into(),
            })
        }
    }

    fn tool_manifest(name: &str, produces: &[&str]) -> ToolManifest {
        ToolManifest {
            name: name.into(),
            version: "1.0.0".into(),
            input_schema: serde_json::json!({}),
            output_schema: serde_json::json!({}),
            runtime: RuntimeClass::Native,
            timeout_ms: 1_000,
            resource_limits: StdHashMap::new(),
            egress_policy: "none".into(),
            tags: vec![],
            produces: produces.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn find_producer_requires_allow_list_membership() {
        let mut registry = Registry::new();
        registry.register(
            CallableManifest::Tool(tool_manifest("tool.code.staticPack", &["sast-report"])),
            Arc::new(StubDoer),
        );
        assert_eq!(registry.find_producer("sast-report", &[]), None);
        assert_eq!(
            registry.find_producer("sast-report", &["tool.code.staticPack".to_string()]),
            Some("tool.code.staticPack")
        );
    }

    #[test]
    fn find_producer_returns_none_for_unmatched_artifact() {
        let mut registry = Registry::new();
        registry.register(
            CallableManifest::Tool(tool_manifest("tool.code.staticPack", &["sast-report"])),
            Arc::new(StubDoer),
        );
        assert_eq!(
            registry.find_producer("sbom", &["tool.code.staticPack".to_string()]),
            None
        );
    }
}
