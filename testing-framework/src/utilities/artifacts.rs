// File: testing-framework/src/utilities/artifacts.rs
//
// Scenario Artifact Collection
//
// Every scenario run can be written to disk as one JSON document holding the
// topology it ran against and its full result (states, snapshots, cause), so a
// failed case can be inspected after the nodes are gone.

use crate::provisioning::TestTopology;
use crate::scenarios::ScenarioResult;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Artifact metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactMetadata {
    /// Case name
    pub case_name: String,
    /// Framework version that wrote the artifact
    pub framework_version: String,
    /// Time the artifact was written (RFC 3339)
    pub written_at: String,
}

/// One scenario run on disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScenarioArtifact {
    /// Metadata
    pub metadata: ArtifactMetadata,
    /// Environment the case ran against
    pub topology: TestTopology,
    /// Outcome of the run
    pub result: ScenarioResult,
}

impl ScenarioArtifact {
    /// Artifact for `result` run against `topology`
    pub fn new(topology: &TestTopology, result: &ScenarioResult) -> Self {
        Self {
            metadata: ArtifactMetadata {
                case_name: result.case_name.clone(),
                framework_version: crate::VERSION.to_string(),
                written_at: chrono::Utc::now().to_rfc3339(),
            },
            topology: topology.clone(),
            result: result.clone(),
        }
    }

    /// Write as `<output_dir>/<case>_<timestamp>.json`
    ///
    /// # Examples
    ///
    /// ```rust,ignore
    /// let result = runner.run(&spec).await;
    /// let path = ScenarioArtifact::new(runner.topology(), &result)
    ///     .save("./artifacts/")
    ///     .await?;
    /// println!("Artifact saved to: {}", path.display());
    /// ```
    pub async fn save(&self, output_dir: impl AsRef<Path>) -> Result<PathBuf> {
        let output_dir = output_dir.as_ref();
        fs::create_dir_all(output_dir)
            .await
            .context("Failed to create artifact directory")?;

        let timestamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
        let filename = format!("{}_{}.json", self.metadata.case_name, timestamp);
        let filepath = output_dir.join(filename);

        let json = serde_json::to_string_pretty(self).context("Failed to serialize artifact")?;

        let mut file = fs::File::create(&filepath)
            .await
            .context("Failed to create artifact file")?;
        file.write_all(json.as_bytes())
            .await
            .context("Failed to write artifact data")?;
        file.flush()
            .await
            .context("Failed to flush artifact file")?;

        Ok(filepath)
    }

    /// Load an artifact written by [`Self::save`]
    pub async fn load(filepath: impl AsRef<Path>) -> Result<Self> {
        let filepath = filepath.as_ref();
        let content = fs::read_to_string(filepath)
            .await
            .with_context(|| format!("Failed to read artifact file {}", filepath.display()))?;
        serde_json::from_str(&content).context("Failed to parse artifact JSON")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scenarios::{FailureCause, ScenarioState, StateVisit, Verdict};
    use crate::types::Address;

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let topology = TestTopology {
            case_name: "CrashCaseSend06".into(),
            settlement: Address::new([1; 20]),
            nodes: Vec::new(),
            tokens: Vec::new(),
            channels: Vec::new(),
        };
        let result = ScenarioResult {
            case_name: "CrashCaseSend06".into(),
            verdict: Verdict::Fail,
            cause: Some(FailureCause::NodeDidNotCrash {
                node: "N3".into(),
                grace_ms: 3000,
            }),
            matched_outcome: None,
            before_restart: Vec::new(),
            after_restart: Vec::new(),
            after_second_restart: None,
            states: vec![StateVisit {
                state: ScenarioState::Evaluated(Verdict::Fail),
                at_ms: 3000,
            }],
            started_at: chrono::Utc::now(),
            duration_ms: 3000,
        };

        let artifact = ScenarioArtifact::new(&topology, &result);
        let path = artifact.save(dir.path()).await.unwrap();
        assert!(path
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("CrashCaseSend06_"));

        let loaded = ScenarioArtifact::load(&path).await.unwrap();
        assert_eq!(loaded, artifact);
    }
}
