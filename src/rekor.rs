//! Transparency-log confirmation.
//!
//! With a log index from the signature stage the entry is fetched directly.
//! Without one (older signatures carry no bundle) the image is resolved to
//! its manifest digest and the log is searched by that hash. Neither path
//! treats "not found" as an error; [`RekorOutcome::is_found`] tells the
//! caller how much was confirmed.

use anyhow::Result;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::PipelineError;
use crate::payload::{i64_at, str_at};
use crate::runner::StageContext;

pub const STAGE: &str = "rekor";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RekorEntry {
    pub log_index: u64,
    pub uuid: Option<String>,
    pub integrated_time_unix: Option<i64>,
}

/// Where the confirmation of an indexed entry came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum EntrySource {
    /// The entry was fetched from the log.
    Log,
    /// Only the signature bundle vouches for the index; the lookup failed.
    SignatureClaim { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "path", rename_all = "snake_case")]
pub enum RekorOutcome {
    Index {
        entry: RekorEntry,
        source: EntrySource,
        /// SHA-256 of the captured `rekor-cli get` output; `None` when the
        /// lookup failed.
        evidence_sha256: Option<String>,
    },
    DigestSearch {
        digest: String,
        /// Matching entry UUIDs, in log order.
        uuids: Vec<String>,
        /// SHA-256 of the captured `rekor-cli search` output.
        evidence_sha256: Option<String>,
    },
}

impl RekorOutcome {
    pub fn is_found(&self) -> bool {
        match self {
            Self::Index { source, .. } => *source == EntrySource::Log,
            Self::DigestSearch { uuids, .. } => !uuids.is_empty(),
        }
    }
}

/// Confirms a log entry by index, or by image digest when no index is known.
pub fn verify_rekor(
    ctx: &StageContext<'_>,
    log_index: Option<u64>,
    image: Option<&str>,
) -> Result<RekorOutcome> {
    match (log_index, image) {
        (Some(index), _) => lookup_index(ctx, index),
        (None, Some(image)) => {
            let digest = resolve_digest(ctx, image)?;
            search_digest(ctx, &digest)
        }
        (None, None) => Err(PipelineError::LookupNotFound(
            "no log index and no image to search by".to_string(),
        )
        .into()),
    }
}

fn lookup_index(ctx: &StageContext<'_>, index: u64) -> Result<RekorOutcome> {
    let out = ctx.rekor_cli(&[
        "get".to_string(),
        "--log-index".to_string(),
        index.to_string(),
        "--format".to_string(),
        "json".to_string(),
    ])?;

    let mut evidence_sha256 = None;
    let parsed = if out.success {
        let evidence = ctx.workspace.capture("rekor_entry.json", None, &out.stdout)?;
        let raw = ctx.workspace.read(&evidence)?;
        evidence_sha256 = Some(evidence.sha256);
        parse_entry(&raw, index)
    } else {
        Err(if out.stderr.is_empty() {
            format!("rekor-cli get failed for log index {index}")
        } else {
            out.stderr
        })
    };

    Ok(match parsed {
        Ok(entry) => {
            info!(log_index = index, uuid = ?entry.uuid, "transparency log entry found");
            RekorOutcome::Index {
                entry,
                source: EntrySource::Log,
                evidence_sha256,
            }
        }
        Err(reason) => {
            warn!(log_index = index, %reason, "log lookup failed; keeping signature's claim");
            RekorOutcome::Index {
                entry: RekorEntry {
                    log_index: index,
                    uuid: None,
                    integrated_time_unix: None,
                },
                source: EntrySource::SignatureClaim { reason },
                evidence_sha256,
            }
        }
    })
}

/// Parses `rekor-cli get --format json` output.
pub fn parse_entry(stdout: &[u8], requested: u64) -> Result<RekorEntry, String> {
    let v: Value =
        serde_json::from_slice(stdout).map_err(|e| format!("unreadable rekor-cli output: {e}"))?;
    let log_index = i64_at(&v, "/LogIndex")
        .and_then(|i| u64::try_from(i).ok())
        .unwrap_or(requested);
    if log_index != requested {
        return Err(format!(
            "rekor returned log index {log_index}, expected {requested}"
        ));
    }
    Ok(RekorEntry {
        log_index,
        uuid: str_at(&v, "/UUID"),
        integrated_time_unix: i64_at(&v, "/IntegratedTime"),
    })
}

fn search_digest(ctx: &StageContext<'_>, digest: &str) -> Result<RekorOutcome> {
    let out = ctx.rekor_cli(&["search".to_string(), "--sha".to_string(), digest.to_string()])?;
    let (uuids, evidence_sha256) = if out.success {
        let evidence = ctx.workspace.capture("rekor_search.txt", None, &out.stdout)?;
        let raw = ctx.workspace.read(&evidence)?;
        (parse_search(&String::from_utf8_lossy(&raw)), Some(evidence.sha256))
    } else {
        debug!(stderr = %out.stderr, "rekor-cli search failed");
        (Vec::new(), None)
    };
    if uuids.is_empty() {
        warn!(%digest, "no transparency log entries for digest");
    } else {
        info!(%digest, matches = uuids.len(), "transparency log entries found");
    }
    Ok(RekorOutcome::DigestSearch {
        digest: digest.to_string(),
        uuids,
        evidence_sha256,
    })
}

/// Collects entry UUIDs (64 hex, or 80 with a tree-id prefix) from
/// `rekor-cli search` output, ignoring the banner line.
pub fn parse_search(stdout: &str) -> Vec<String> {
    let Ok(re) = Regex::new(r"^(?:[0-9a-f]{16})?[0-9a-f]{64}$") else {
        return Vec::new();
    };
    let mut uuids: Vec<String> = Vec::new();
    for line in stdout.lines().map(str::trim) {
        if re.is_match(line) && !uuids.iter().any(|u| u == line) {
            uuids.push(line.to_string());
        }
    }
    uuids
}

/// Resolves `image` to `sha256:<hex>`: from the reference itself, then the
/// local image store, then the registry manifest.
pub fn resolve_digest(ctx: &StageContext<'_>, image: &str) -> Result<String> {
    if let Some(d) = find_digest(image) {
        return Ok(d);
    }

    let local = ctx.docker(&[
        "image".to_string(),
        "inspect".to_string(),
        "--format".to_string(),
        "{{index .RepoDigests 0}}".to_string(),
        image.to_string(),
    ])?;
    if local.success {
        if let Some(d) = find_digest(&local.stdout_lossy()) {
            debug!(%d, "digest from local image store");
            return Ok(d);
        }
    }

    let remote = ctx.docker(&[
        "buildx".to_string(),
        "imagetools".to_string(),
        "inspect".to_string(),
        image.to_string(),
        "--format".to_string(),
        "{{json .Manifest}}".to_string(),
    ])?;
    if remote.success {
        let text = remote.stdout_lossy();
        let from_json = serde_json::from_str::<Value>(&text)
            .ok()
            .and_then(|v| str_at(&v, "/digest"))
            .and_then(|d| find_digest(&d));
        if let Some(d) = from_json.or_else(|| find_digest(&text)) {
            debug!(%d, "digest from registry manifest");
            return Ok(d);
        }
    }

    Err(PipelineError::LookupNotFound(format!("digest for image {image}")).into())
}

/// First `sha256:<64 hex>` in `s`.
pub fn find_digest(s: &str) -> Option<String> {
    let re = Regex::new(r"sha256:[0-9a-f]{64}").ok()?;
    re.find(s).map(|m| m.as_str().to_string())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing, clippy::panic)]
mod tests {
    use super::*;
    use crate::config::VerifyConfig;
    use crate::runner::fake::ScriptedRunner;
    use crate::workspace::Workspace;
    use serde_json::json;

    const DIGEST: &str = "sha256:3f1a9c0b2d4e6f8a1c3e5a7b9d0f2e4c6a8b0d2f4e6a8c0e2a4c6e8a0b2d4f6a";
    const UUID: &str = "24296fb24b8ad77a5c3d2e0d1c9b7e6f4a3b2c1d0e9f8a7b6c5d4e3f2a1b0c9d8e7f6a5b4c3d2e1f";

    fn with_ctx<T>(runner: &ScriptedRunner, cfg: &VerifyConfig, f: impl FnOnce(&StageContext<'_>) -> T) -> T {
        let ws = Workspace::new().unwrap();
        let ctx = StageContext::new(runner, cfg, &ws);
        f(&ctx)
    }

    #[test]
    fn index_lookup_reports_uuid_and_time() {
        let body = json!({"LogIndex": 42, "UUID": UUID, "IntegratedTime": 1_700_000_000}).to_string();
        let runner = ScriptedRunner::new().on("rekor-cli", "get --log-index 42", true, &body);
        let out = with_ctx(&runner, &VerifyConfig::default(), |c| verify_rekor(c, Some(42), None)).unwrap();
        assert!(out.is_found());
        match out {
            RekorOutcome::Index {
                entry,
                source,
                evidence_sha256,
            } => {
                assert_eq!(source, EntrySource::Log);
                assert_eq!(evidence_sha256.map(|h| h.len()), Some(64));
                assert_eq!(entry.uuid.as_deref(), Some(UUID));
                assert_eq!(entry.integrated_time_unix, Some(1_700_000_000));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn failed_index_lookup_keeps_signature_claim() {
        let runner = ScriptedRunner::new().fail("rekor-cli", "get", "entry not found");
        let out = with_ctx(&runner, &VerifyConfig::default(), |c| verify_rekor(c, Some(7), None)).unwrap();
        assert!(!out.is_found());
        assert!(matches!(
            out,
            RekorOutcome::Index {
                entry: RekorEntry { log_index: 7, .. },
                source: EntrySource::SignatureClaim { .. },
                evidence_sha256: None,
            }
        ));
    }

    #[test]
    fn mismatched_index_is_not_confirmation() {
        let body = json!({"LogIndex": 8, "UUID": UUID}).to_string();
        assert!(parse_entry(body.as_bytes(), 7).is_err());
    }

    #[test]
    fn rekor_server_is_forwarded() {
        let cfg = VerifyConfig {
            rekor_server: Some("https://rekor.example.dev".into()),
            ..VerifyConfig::default()
        };
        let runner = ScriptedRunner::new().on("rekor-cli", "get", true, "{}");
        with_ctx(&runner, &cfg, |c| verify_rekor(c, Some(1), None)).unwrap();
        assert!(runner.calls()[0].ends_with("--rekor_server https://rekor.example.dev"));
    }

    #[test]
    fn digest_in_reference_skips_docker() {
        let image = format!("ghcr.io/acme/widget@{DIGEST}");
        let runner = ScriptedRunner::new().on(
            "rekor-cli",
            &format!("search --sha {DIGEST}"),
            true,
            &format!("Found matching entries (listed by UUID):\n{UUID}\n"),
        );
        let out = with_ctx(&runner, &VerifyConfig::default(), |c| verify_rekor(c, None, Some(&image))).unwrap();
        assert!(out.is_found());
        assert_eq!(runner.calls_matching("docker"), 0);
    }

    #[test]
    fn digest_falls_back_to_registry_query() {
        let runner = ScriptedRunner::new()
            .fail("docker", "image inspect", "No such image")
            .on(
                "docker",
                "imagetools inspect",
                true,
                &json!({"mediaType": "application/vnd.oci.image.index.v1+json", "digest": DIGEST}).to_string(),
            )
            .on("rekor-cli", "search", true, "");
        let out = with_ctx(&runner, &VerifyConfig::default(), |c| {
            verify_rekor(c, None, Some("ghcr.io/acme/widget:1.0"))
        })
        .unwrap();
        match &out {
            RekorOutcome::DigestSearch { digest, uuids, .. } => {
                assert_eq!(digest, DIGEST);
                assert!(uuids.is_empty());
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(!out.is_found());
        assert_eq!(runner.calls_matching("docker"), 2);
    }

    #[test]
    fn captured_output_is_hashed() {
        let body = format!("Found matching entries (listed by UUID):\n{UUID}\n");
        let image = format!("ghcr.io/acme/widget@{DIGEST}");
        let runner = ScriptedRunner::new().on("rekor-cli", "search", true, &body);
        let first = with_ctx(&runner, &VerifyConfig::default(), |c| verify_rekor(c, None, Some(&image))).unwrap();
        let second = with_ctx(&runner, &VerifyConfig::default(), |c| verify_rekor(c, None, Some(&image))).unwrap();
        match &first {
            RekorOutcome::DigestSearch { evidence_sha256, .. } => {
                let expected = hex::encode(<sha2::Sha256 as sha2::Digest>::digest(body.as_bytes()));
                assert_eq!(evidence_sha256.as_deref(), Some(expected.as_str()));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(first, second);

        let serialized = serde_json::to_value(&first).unwrap();
        assert_eq!(serialized["evidence_sha256"].as_str().map(str::len), Some(64));
    }

    #[test]
    fn failed_search_has_no_evidence() {
        let image = format!("ghcr.io/acme/widget@{DIGEST}");
        let runner = ScriptedRunner::new().fail("rekor-cli", "search", "connection refused");
        let out = with_ctx(&runner, &VerifyConfig::default(), |c| verify_rekor(c, None, Some(&image))).unwrap();
        assert!(matches!(
            out,
            RekorOutcome::DigestSearch { evidence_sha256: None, .. }
        ));
    }

    #[test]
    fn local_repo_digest_is_preferred() {
        let runner = ScriptedRunner::new()
            .on("docker", "image inspect", true, &format!("ghcr.io/acme/widget@{DIGEST}\n"))
            .on("rekor-cli", "search", true, UUID);
        let out = with_ctx(&runner, &VerifyConfig::default(), |c| {
            verify_rekor(c, None, Some("ghcr.io/acme/widget:1.0"))
        })
        .unwrap();
        assert!(out.is_found());
        assert_eq!(runner.calls_matching("imagetools"), 0);
    }

    #[test]
    fn unresolvable_digest_is_lookup_not_found() {
        let runner = ScriptedRunner::new();
        let err = with_ctx(&runner, &VerifyConfig::default(), |c| {
            verify_rekor(c, None, Some("ghcr.io/acme/widget:1.0"))
        })
        .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::LookupNotFound(_))
        ));
    }

    #[test]
    fn parse_search_ignores_banner_and_duplicates() {
        let short = &UUID[16..];
        let out = format!("Found matching entries (listed by UUID):\n{UUID}\n{short}\n{UUID}\n\n");
        assert_eq!(parse_search(&out), vec![UUID.to_string(), short.to_string()]);
        assert!(parse_search("No matching entries found").is_empty());
    }

    #[test]
    fn find_digest_extracts_hash() {
        assert_eq!(find_digest(&format!("repo@{DIGEST}")).as_deref(), Some(DIGEST));
        assert_eq!(find_digest("ghcr.io/acme/widget:latest"), None);
    }
}
