use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Maximum config file size (1 MB).
const MAX_CONFIG_BYTES: u64 = 1024 * 1024;

/// Issuer of GitHub Actions OIDC tokens; the only issuer trusted by default.
pub const GITHUB_ACTIONS_ISSUER: &str = "https://token.actions.githubusercontent.com";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifyConfig {
    /// OIDC issuer the signing certificate must carry, compared exactly.
    pub oidc_issuer: String,
    /// Regex fragment for the workflow file path inside the repository.
    pub workflow_path: String,
    pub tools: ToolPaths,
    pub attestation_types: AttestationTypes,
    /// Alternate Rekor instance, passed to `rekor-cli --rekor_server`.
    pub rekor_server: Option<String>,
    pub display: DisplayLimits,
}

/// Program names (or absolute paths) of the delegated tools.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolPaths {
    pub cosign: String,
    pub rekor_cli: String,
    pub docker: String,
}

/// `cosign verify-attestation --type` values for the two attestation stages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttestationTypes {
    pub provenance: String,
    pub sbom: String,
}

/// How many list entries the human-readable report shows before it
/// collapses the rest into a count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayLimits {
    pub materials: usize,
    pub packages: usize,
    pub rekor_matches: usize,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            oidc_issuer: GITHUB_ACTIONS_ISSUER.to_string(),
            workflow_path: r"\.github/workflows/[^@]+".to_string(),
            tools: ToolPaths::default(),
            attestation_types: AttestationTypes::default(),
            rekor_server: None,
            display: DisplayLimits::default(),
        }
    }
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            cosign: "cosign".to_string(),
            rekor_cli: "rekor-cli".to_string(),
            docker: "docker".to_string(),
        }
    }
}

impl Default for AttestationTypes {
    fn default() -> Self {
        Self {
            provenance: "slsaprovenance".to_string(),
            sbom: "spdxjson".to_string(),
        }
    }
}

impl Default for DisplayLimits {
    fn default() -> Self {
        Self {
            materials: 5,
            packages: 10,
            rekor_matches: 3,
        }
    }
}

impl VerifyConfig {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => {
                let bytes = crate::fs_guard::read_validated(p, MAX_CONFIG_BYTES)?;
                serde_json::from_slice(&bytes)
                    .with_context(|| format!("invalid config {}", p.display()))
            }
            None => Ok(Self::default()),
        }
    }
}
