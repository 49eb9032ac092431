//! Keyless signature verification.
//!
//! Runs `cosign verify` pinned to the target's identity regex and OIDC
//! issuer. A rejection is not an `Err`: it comes back as a result with
//! `verified == false` so the caller decides how fatal it is. The Rekor log
//! index found in the signature bundle is kept for the transparency-log
//! stage, which must not have to ask cosign again.

use anyhow::Result;
use serde::Serialize;
use serde_json::Value;
use std::path::Path;
use tracing::{info, warn};

use crate::error::PipelineError;
use crate::identity::VerificationTarget;
use crate::payload::{first_str, i64_at, str_at};
use crate::runner::StageContext;

pub const STAGE: &str = "signature";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SignatureResult {
    pub verified: bool,
    pub certificate_identity: Option<String>,
    pub certificate_issuer: Option<String>,
    pub signed_at_unix_time: Option<i64>,
    pub rekor_log_index: Option<u64>,
    /// Manifest digest cosign reports for the verified image.
    pub image_digest: Option<String>,
    /// Number of signatures cosign accepted.
    pub signature_count: usize,
    /// Why verification was rejected, when it was.
    pub failure: Option<String>,
    pub evidence_sha256: Option<String>,
}

impl SignatureResult {
    fn rejected(reason: String) -> Self {
        Self {
            verified: false,
            failure: Some(reason),
            ..Self::default()
        }
    }
}

pub fn verify_signature(
    ctx: &StageContext<'_>,
    target: &VerificationTarget,
    outfile: Option<&Path>,
) -> Result<SignatureResult> {
    let mut args = vec!["verify".to_string(), target.image_reference.clone()];
    args.extend(target.cosign_identity_args());
    args.extend(["--output".to_string(), "json".to_string()]);

    let out = ctx.cosign(&args)?;
    if !out.success {
        let reason = if out.stderr.is_empty() {
            "cosign verify exited non-zero".to_string()
        } else {
            out.stderr
        };
        warn!(image = %target.image_reference, "signature rejected");
        return Ok(SignatureResult::rejected(reason));
    }

    let evidence = ctx.workspace.capture("signature.json", outfile, &out.stdout)?;
    let raw = ctx.workspace.read(&evidence)?;

    let mut result = match extract_signature(&raw) {
        Ok(r) => r,
        Err(e) => {
            warn!(error = %e, "signature verified but bundle metadata unreadable");
            SignatureResult::default()
        }
    };
    result.verified = true;
    result.evidence_sha256 = Some(evidence.sha256);
    info!(
        image = %target.image_reference,
        log_index = ?result.rekor_log_index,
        "signature verified"
    );
    Ok(result)
}

/// Reads signer metadata from `cosign verify --output json` output.
///
/// cosign prints a JSON array of verified signatures; older releases print
/// one object per line. Metadata comes from the first signature.
pub fn extract_signature(raw: &[u8]) -> Result<SignatureResult, PipelineError> {
    let mut sigs = Vec::new();
    for item in serde_json::Deserializer::from_slice(raw).into_iter::<Value>() {
        match item.map_err(|e| extraction_failed(format!("malformed JSON: {e}")))? {
            Value::Array(items) => sigs.extend(items),
            obj @ Value::Object(_) => sigs.push(obj),
            _ => return Err(extraction_failed("unexpected JSON value".to_string())),
        }
    }
    let first = sigs
        .first()
        .ok_or_else(|| extraction_failed("no signatures in output".to_string()))?;

    Ok(SignatureResult {
        verified: false,
        certificate_identity: first_str(
            first,
            &["/optional/Subject", "/optional/subject", "/critical/identity/subject"],
        ),
        certificate_issuer: first_str(first, &["/optional/Issuer", "/optional/issuer"]),
        signed_at_unix_time: i64_at(first, "/optional/Bundle/Payload/integratedTime"),
        rekor_log_index: log_index(first),
        image_digest: str_at(first, "/critical/image/docker-manifest-digest"),
        signature_count: sigs.len(),
        failure: None,
        evidence_sha256: None,
    })
}

fn log_index(sig: &Value) -> Option<u64> {
    [
        "/optional/Bundle/Payload/logIndex",
        "/optional/bundle/verificationMaterial/tlogEntries/0/logIndex",
    ]
    .iter()
    .find_map(|p| i64_at(sig, p))
    .and_then(|i| u64::try_from(i).ok())
}

fn extraction_failed(reason: String) -> PipelineError {
    PipelineError::ExtractionFailed {
        stage: STAGE,
        reason,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::config::VerifyConfig;
    use crate::runner::fake::ScriptedRunner;
    use crate::workspace::Workspace;
    use serde_json::json;

    fn cosign_output() -> Value {
        json!([{
            "critical": {
                "identity": {"docker-reference": "ghcr.io/acme/widget"},
                "image": {"docker-manifest-digest": "sha256:aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa"},
                "type": "cosign container image signature"
            },
            "optional": {
                "Bundle": {
                    "SignedEntryTimestamp": "MEUCIQ",
                    "Payload": {
                        "body": "eyJ9",
                        "integratedTime": 1_700_000_000,
                        "logIndex": 48_213_907,
                        "logID": "c0d23d6ad406973f9559f3ba2d1ca01f84147d8ffc5b8445c224f98b9591801d"
                    }
                },
                "Issuer": "https://token.actions.githubusercontent.com",
                "Subject": "https://github.com/acme/widget/.github/workflows/release.yml@refs/tags/v1.0.0"
            }
        }])
    }

    fn target() -> VerificationTarget {
        VerificationTarget::for_repo("ghcr.io/acme/widget:1.0", "acme/widget", &VerifyConfig::default())
            .unwrap()
    }

    #[test]
    fn extracts_signer_metadata() {
        let r = extract_signature(cosign_output().to_string().as_bytes()).unwrap();
        assert_eq!(r.rekor_log_index, Some(48_213_907));
        assert_eq!(r.signed_at_unix_time, Some(1_700_000_000));
        assert_eq!(
            r.certificate_issuer.as_deref(),
            Some("https://token.actions.githubusercontent.com")
        );
        assert!(r
            .certificate_identity
            .as_deref()
            .unwrap()
            .ends_with("@refs/tags/v1.0.0"));
        assert_eq!(r.signature_count, 1);
        assert!(r.image_digest.unwrap().starts_with("sha256:"));
    }

    #[test]
    fn extracts_from_line_delimited_objects() {
        let sig = cosign_output()[0].clone();
        let raw = format!("{sig}\n{sig}\n");
        let r = extract_signature(raw.as_bytes()).unwrap();
        assert_eq!(r.signature_count, 2);
        assert_eq!(r.rekor_log_index, Some(48_213_907));
    }

    #[test]
    fn missing_log_index_is_none() {
        let raw = json!([{"optional": {"Subject": "x", "Issuer": "y"}}]).to_string();
        let r = extract_signature(raw.as_bytes()).unwrap();
        assert_eq!(r.rekor_log_index, None);
        assert_eq!(r.signed_at_unix_time, None);
    }

    #[test]
    fn empty_output_is_extraction_failure() {
        assert!(matches!(
            extract_signature(b"[]"),
            Err(PipelineError::ExtractionFailed { .. })
        ));
        assert!(extract_signature(b"garbage").is_err());
    }

    #[test]
    fn verify_passes_identity_flags_and_threads_log_index() {
        let runner = ScriptedRunner::new().on("cosign", "verify ", true, &cosign_output().to_string());
        let cfg = VerifyConfig::default();
        let ws = Workspace::new().unwrap();
        let ctx = StageContext::new(&runner, &cfg, &ws);
        let t = target();

        let r = verify_signature(&ctx, &t, None).unwrap();
        assert!(r.verified);
        assert_eq!(r.rekor_log_index, Some(48_213_907));
        assert_eq!(r.evidence_sha256.as_ref().map(String::len), Some(64));

        let calls = runner.calls();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].contains("--certificate-identity-regexp"));
        assert!(calls[0].contains(&t.workflow_identity_pattern));
        assert!(calls[0].contains("--certificate-oidc-issuer https://token.actions.githubusercontent.com"));
    }

    #[test]
    fn rejection_yields_unverified_result() {
        let runner = ScriptedRunner::new().fail("cosign", "verify ", "Error: no matching signatures");
        let cfg = VerifyConfig::default();
        let ws = Workspace::new().unwrap();
        let ctx = StageContext::new(&runner, &cfg, &ws);

        let r = verify_signature(&ctx, &target(), None).unwrap();
        assert!(!r.verified);
        assert_eq!(r.failure.as_deref(), Some("Error: no matching signatures"));
    }

    #[test]
    fn unreadable_metadata_degrades_instead_of_failing() {
        let runner = ScriptedRunner::new().on("cosign", "verify ", true, "not json at all");
        let cfg = VerifyConfig::default();
        let ws = Workspace::new().unwrap();
        let ctx = StageContext::new(&runner, &cfg, &ws);

        let r = verify_signature(&ctx, &target(), None).unwrap();
        assert!(r.verified);
        assert_eq!(r.certificate_identity, None);
        assert_eq!(r.rekor_log_index, None);
    }

    #[test]
    fn repeated_runs_yield_identical_results() {
        let runner = ScriptedRunner::new().on("cosign", "verify ", true, &cosign_output().to_string());
        let cfg = VerifyConfig::default();
        let ws = Workspace::new().unwrap();
        let ctx = StageContext::new(&runner, &cfg, &ws);

        let a = verify_signature(&ctx, &target(), None).unwrap();
        let b = verify_signature(&ctx, &target(), None).unwrap();
        assert_eq!(a, b);
    }
}
