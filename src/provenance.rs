//! SLSA provenance attestation verification and field extraction.
//!
//! The predicate layout differs between SLSA provenance v0.2 and v1, so the
//! Statement is first classified by its `predicateType` into a
//! [`ProvenancePredicate`] and then read by the parser for that variant.
//! Nothing here guesses paths across versions.

use anyhow::Result;
use serde::Serialize;
use serde_json::Value;
use std::path::Path;
use tracing::{info, warn};

use crate::error::PipelineError;
use crate::identity::VerificationTarget;
use crate::payload::{first_statement, first_str, normalize_predicate, str_at};
use crate::runner::StageContext;

pub const STAGE: &str = "provenance";

/// Provenance schema versions with distinct predicate layouts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum ProvenanceSchema {
    #[serde(rename = "v0.2")]
    V0_2,
    #[default]
    #[serde(rename = "v1")]
    V1,
}

impl ProvenanceSchema {
    /// `v0.2` when the predicate type carries that token, v1 otherwise.
    pub fn detect(predicate_type: &str) -> Self {
        if predicate_type.contains("v0.2") {
            Self::V0_2
        } else {
            Self::V1
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::V0_2 => "v0.2",
            Self::V1 => "v1",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Material {
    pub uri: Option<String>,
    /// `algorithm:value`, e.g. `sha1:5e0c...`.
    pub digest: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProvenanceResult {
    pub schema_version: ProvenanceSchema,
    pub predicate_type: Option<String>,
    pub builder_id: Option<String>,
    pub build_type: Option<String>,
    pub source_repo_uri: Option<String>,
    pub source_commit_sha: Option<String>,
    pub build_trigger: Option<String>,
    pub build_ref: Option<String>,
    /// Every material in predicate order; display truncates, this does not.
    pub materials: Vec<Material>,
    pub evidence_sha256: Option<String>,
}

/// A provenance predicate tagged with the layout it must be read with.
#[derive(Debug, Clone, Copy)]
pub enum ProvenancePredicate<'a> {
    V0_2(&'a Value),
    V1(&'a Value),
}

impl<'a> ProvenancePredicate<'a> {
    pub fn classify(predicate_type: &str, predicate: &'a Value) -> Self {
        match ProvenanceSchema::detect(predicate_type) {
            ProvenanceSchema::V0_2 => Self::V0_2(predicate),
            ProvenanceSchema::V1 => Self::V1(predicate),
        }
    }

    pub fn extract(self) -> ProvenanceResult {
        match self {
            Self::V0_2(p) => parse_v0_2(p),
            Self::V1(p) => parse_v1(p),
        }
    }
}

fn parse_v0_2(p: &Value) -> ProvenanceResult {
    ProvenanceResult {
        schema_version: ProvenanceSchema::V0_2,
        builder_id: str_at(p, "/builder/id"),
        build_type: str_at(p, "/buildType"),
        source_repo_uri: str_at(p, "/invocation/configSource/uri"),
        source_commit_sha: first_str(
            p,
            &[
                "/invocation/configSource/digest/sha1",
                "/invocation/environment/github_sha1",
            ],
        ),
        build_trigger: str_at(p, "/invocation/environment/github_event_name"),
        build_ref: str_at(p, "/invocation/environment/github_ref"),
        materials: materials(p.get("materials")),
        ..ProvenanceResult::default()
    }
}

fn parse_v1(p: &Value) -> ProvenanceResult {
    let deps = p.pointer("/buildDefinition/resolvedDependencies");
    let first_dep = deps.and_then(|d| d.get(0));
    let materials = match deps {
        Some(d) => materials(Some(d)),
        None => materials(p.get("materials")),
    };
    ProvenanceResult {
        schema_version: ProvenanceSchema::V1,
        builder_id: first_str(p, &["/runDetails/builder/id", "/builder/id"]),
        build_type: first_str(p, &["/buildDefinition/buildType", "/buildType"]),
        source_repo_uri: first_str(
            p,
            &[
                "/buildConfig/repository",
                "/buildDefinition/externalParameters/workflow/repository",
            ],
        )
        .or_else(|| first_dep.and_then(|d| str_at(d, "/uri"))),
        source_commit_sha: str_at(p, "/buildConfig/sha")
            .or_else(|| first_dep.and_then(|d| first_str(d, &["/digest/gitCommit", "/digest/sha1"]))),
        build_trigger: first_str(
            p,
            &[
                "/buildConfig/eventName",
                "/buildDefinition/internalParameters/github/event_name",
            ],
        ),
        build_ref: first_str(
            p,
            &["/buildConfig/ref", "/buildDefinition/externalParameters/workflow/ref"],
        ),
        materials,
        ..ProvenanceResult::default()
    }
}

/// Reads `[{uri, digest: {alg: value}}]`, preferring sha1 then sha256 then
/// gitCommit, then whatever algorithm comes first.
fn materials(list: Option<&Value>) -> Vec<Material> {
    let Some(items) = list.and_then(Value::as_array) else {
        return Vec::new();
    };
    items
        .iter()
        .map(|m| Material {
            uri: str_at(m, "/uri"),
            digest: m.get("digest").and_then(Value::as_object).and_then(|d| {
                ["sha1", "sha256", "gitCommit"]
                    .iter()
                    .find_map(|alg| d.get(*alg).and_then(Value::as_str).map(|v| (*alg, v)))
                    .or_else(|| {
                        d.iter()
                            .find_map(|(alg, v)| v.as_str().map(|v| (alg.as_str(), v)))
                    })
                    .map(|(alg, v)| format!("{alg}:{v}"))
            }),
        })
        .collect()
}

/// Classifies and extracts a decoded in-toto Statement.
pub fn extract_provenance(statement: &Value) -> Result<ProvenanceResult, PipelineError> {
    let predicate_type = str_at(statement, "/predicateType").ok_or_else(|| {
        PipelineError::ExtractionFailed {
            stage: STAGE,
            reason: "statement has no predicateType".to_string(),
        }
    })?;
    let predicate = statement
        .get("predicate")
        .map(normalize_predicate)
        .transpose()
        .map_err(|reason| PipelineError::ExtractionFailed { stage: STAGE, reason })?
        .unwrap_or(Value::Null);

    let mut result = ProvenancePredicate::classify(&predicate_type, &predicate).extract();
    result.predicate_type = Some(predicate_type);
    Ok(result)
}

pub fn verify_provenance(
    ctx: &StageContext<'_>,
    target: &VerificationTarget,
    outfile: Option<&Path>,
) -> Result<ProvenanceResult> {
    let mut args = vec![
        "verify-attestation".to_string(),
        target.image_reference.clone(),
        "--type".to_string(),
        ctx.config.attestation_types.provenance.clone(),
    ];
    args.extend(target.cosign_identity_args());

    let out = ctx.cosign(&args)?;
    if !out.success {
        return Err(PipelineError::VerificationFailed {
            stage: STAGE,
            reason: if out.stderr.is_empty() {
                "no verified provenance attestation".to_string()
            } else {
                out.stderr
            },
        }
        .into());
    }

    let evidence = ctx.workspace.capture("provenance.json", outfile, &out.stdout)?;
    let raw = ctx.workspace.read(&evidence)?;

    let mut result = first_statement(&raw)
        .map_err(|reason| PipelineError::ExtractionFailed { stage: STAGE, reason })
        .and_then(|st| extract_provenance(&st))
        .unwrap_or_else(|e| {
            warn!(error = %e, "provenance verified but predicate unreadable");
            ProvenanceResult::default()
        });
    result.evidence_sha256 = Some(evidence.sha256);
    info!(
        schema = result.schema_version.as_str(),
        builder = ?result.builder_id,
        materials = result.materials.len(),
        "provenance verified"
    );
    Ok(result)
}
