use serde::{Deserialize, Serialize};

/// Provenance of an artifact: who produced it, when, and from what.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactProvenance {
    pub producer: String,
    pub when: chrono::DateTime<chrono::Utc>,
    pub input_artifact_ids: Vec<String>,
    pub tool_version: Option<String>,
}

/// Any typed output of a task: spec, report, code, SBOM, signature.
/// Immutable once recorded in the ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub artifact_id: String,
    pub content_hash: String,
    pub artifact_type: String,
    pub size_bytes: u64,
    pub storage_uri: Option<String>,
    pub provenance: ArtifactProvenance,
}

impl Artifact {
    pub fn new(
        artifact_id: String,
        content_hash: String,
        artifact_type: impl Into<String>,
        size_bytes: u64,
        provenance: ArtifactProvenance,
    ) -> Self {
        Self {
            artifact_id,
            content_hash,
            artifact_type: artifact_type.into(),
            size_bytes,
            storage_uri: None,
            provenance,
        }
    }
}
