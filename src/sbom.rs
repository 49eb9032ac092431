//! SPDX SBOM attestation verification.
//!
//! An SBOM is optional build output, so the orchestrator treats a failure
//! here as a warning. The predicate reaches us either as an SPDX object or
//! as that object JSON-encoded into a string (sometimes inside cosign's
//! generic `{"Data": ..., "Timestamp": ...}` wrapper); all forms are
//! normalised before extraction.

use anyhow::Result;
use serde::Serialize;
use serde_json::Value;
use std::{collections::BTreeSet, path::Path};
use tracing::{info, warn};

use crate::error::PipelineError;
use crate::identity::VerificationTarget;
use crate::payload::{first_statement, normalize_predicate, str_at};
use crate::runner::StageContext;

pub const STAGE: &str = "sbom";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SbomPackage {
    pub name: String,
    pub version_info: Option<String>,
}

/// How the predicate was delivered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PredicateEncoding {
    #[default]
    Object,
    EncodedString,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SbomResult {
    pub spdx_version: Option<String>,
    pub name: Option<String>,
    pub created: Option<String>,
    pub creators: BTreeSet<String>,
    pub packages: Vec<SbomPackage>,
    pub file_count: usize,
    pub ecosystems: BTreeSet<String>,
    pub predicate_encoding: PredicateEncoding,
    pub evidence_sha256: Option<String>,
}

impl SbomResult {
    pub fn package_count(&self) -> usize {
        self.packages.len()
    }
}

/// Extracts SBOM fields from a decoded in-toto Statement.
pub fn extract_sbom(statement: &Value) -> Result<SbomResult, PipelineError> {
    let raw = statement.get("predicate").unwrap_or(&Value::Null);
    let encoding = if raw.is_string() {
        PredicateEncoding::EncodedString
    } else {
        PredicateEncoding::Object
    };
    let mut doc = normalize_predicate(raw).map_err(extraction_failed)?;
    if doc.get("spdxVersion").is_none() {
        if let Some(data) = doc.get("Data") {
            doc = normalize_predicate(data).map_err(extraction_failed)?;
        }
    }
    if doc.get("spdxVersion").is_none() && doc.get("packages").is_none() {
        return Err(extraction_failed("predicate is not an SPDX document".to_string()));
    }

    let packages: Vec<&Value> = doc
        .get("packages")
        .and_then(Value::as_array)
        .map(|p| p.iter().collect())
        .unwrap_or_default();

    Ok(SbomResult {
        spdx_version: str_at(&doc, "/spdxVersion"),
        name: str_at(&doc, "/name"),
        created: str_at(&doc, "/creationInfo/created"),
        creators: doc
            .pointer("/creationInfo/creators")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(|c| c.as_str().map(ToString::to_string))
            .collect(),
        packages: packages
            .iter()
            .map(|p| SbomPackage {
                name: str_at(p, "/name").unwrap_or_else(|| "N/A".to_string()),
                version_info: str_at(p, "/versionInfo"),
            })
            .collect(),
        file_count: doc
            .get("files")
            .and_then(Value::as_array)
            .map_or(0, Vec::len),
        ecosystems: packages.iter().flat_map(|p| ecosystems_of(p)).collect(),
        predicate_encoding: encoding,
        evidence_sha256: None,
    })
}

/// Ecosystems named by a package's external refs: the purl type for purl
/// refs (`pkg:npm/left-pad@1.3.0` is `npm`), the reference type otherwise.
fn ecosystems_of(package: &Value) -> Vec<String> {
    package
        .get("externalRefs")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|r| {
            let kind = r.get("referenceType").and_then(Value::as_str)?;
            if kind == "purl" {
                let locator = r.get("referenceLocator").and_then(Value::as_str)?;
                locator
                    .strip_prefix("pkg:")
                    .and_then(|rest| rest.split('/').next())
                    .filter(|t| !t.is_empty())
                    .map(str::to_ascii_lowercase)
            } else {
                Some(kind.to_string())
            }
        })
        .collect()
}

fn extraction_failed(reason: String) -> PipelineError {
    PipelineError::ExtractionFailed {
        stage: STAGE,
        reason,
    }
}

pub fn verify_sbom(
    ctx: &StageContext<'_>,
    target: &VerificationTarget,
    outfile: Option<&Path>,
) -> Result<SbomResult> {
    let mut args = vec![
        "verify-attestation".to_string(),
        target.image_reference.clone(),
        "--type".to_string(),
        ctx.config.attestation_types.sbom.clone(),
    ];
    args.extend(target.cosign_identity_args());

    let out = ctx.cosign(&args)?;
    if !out.success {
        return Err(PipelineError::VerificationFailed {
            stage: STAGE,
            reason: if out.stderr.is_empty() {
                "no verified SBOM attestation".to_string()
            } else {
                out.stderr
            },
        }
        .into());
    }

    let evidence = ctx.workspace.capture("sbom.json", outfile, &out.stdout)?;
    let raw = ctx.workspace.read(&evidence)?;

    let mut result = first_statement(&raw)
        .map_err(extraction_failed)
        .and_then(|st| extract_sbom(&st))
        .unwrap_or_else(|e| {
            warn!(error = %e, "SBOM verified but document unreadable");
            SbomResult::default()
        });
    result.evidence_sha256 = Some(evidence.sha256);
    info!(
        packages = result.package_count(),
        files = result.file_count,
        "SBOM verified"
    );
    Ok(result)
}
