//! Human-readable rendering of stage results.
//!
//! Every function takes a result value and returns text; nothing here writes
//! to the terminal or reads global colour state. Colour is decided once, by
//! the caller, when the [`Printer`] is built.

use console::Style;

use crate::config::DisplayLimits;
use crate::payload::format_unix;
use crate::pipeline::{Confidence, Summary};
use crate::provenance::ProvenanceResult;
use crate::rekor::{EntrySource, RekorOutcome};
use crate::sbom::SbomResult;
use crate::signature::SignatureResult;

const NA: &str = "N/A";

#[derive(Debug, Clone, Copy)]
pub struct Printer {
    pub color: bool,
    /// Show full lists instead of truncating to the display limits.
    pub verbose: bool,
    pub limits: DisplayLimits,
}

fn na(v: &Option<String>) -> &str {
    v.as_deref().unwrap_or(NA)
}

fn time_or_na(ts: Option<i64>) -> String {
    ts.and_then(format_unix).unwrap_or_else(|| NA.to_string())
}

impl Printer {
    pub fn new(color: bool, verbose: bool, limits: DisplayLimits) -> Self {
        Self {
            color,
            verbose,
            limits,
        }
    }

    /// No colour, default limits.
    pub fn plain() -> Self {
        Self::new(false, false, DisplayLimits::default())
    }

    fn style(&self, s: Style) -> Style {
        s.force_styling(self.color)
    }

    pub fn heading(&self, title: &str) -> String {
        let s = self.style(Style::new().cyan().bold());
        format!("{}", s.apply_to(format!("==> {title}")))
    }

    pub fn ok(&self, msg: &str) -> String {
        let s = self.style(Style::new().green().bold());
        format!("    {} {msg}", s.apply_to("[OK]"))
    }

    pub fn warn(&self, msg: &str) -> String {
        let s = self.style(Style::new().yellow().bold());
        format!("    {} {msg}", s.apply_to("[WARN]"))
    }

    pub fn fail(&self, msg: &str) -> String {
        let s = self.style(Style::new().red().bold());
        format!("    {} {msg}", s.apply_to("[FAIL]"))
    }

    fn field(&self, name: &str, value: &str) -> String {
        let dim = self.style(Style::new().dim());
        format!("      {} {value}", dim.apply_to(format!("{name:<16}")))
    }

    /// `items` up to `limit` (unless verbose), then a remainder line.
    fn truncated(&self, items: &[String], limit: usize) -> Vec<String> {
        let shown = if self.verbose { items.len() } else { limit.min(items.len()) };
        let mut lines: Vec<String> = items
            .iter()
            .take(shown)
            .map(|i| format!("        - {i}"))
            .collect();
        if items.len() > shown {
            lines.push(format!("        ... and {} more", items.len() - shown));
        }
        lines
    }

    pub fn signature(&self, r: &SignatureResult) -> String {
        let mut lines = vec![self.heading("Signature")];
        if !r.verified {
            lines.push(self.fail("Signature verification failed"));
            if let Some(reason) = &r.failure {
                lines.push(self.field("Reason:", reason));
            }
            return lines.join("\n");
        }
        lines.push(self.ok("Signature verified"));
        lines.push(self.field("Identity:", na(&r.certificate_identity)));
        lines.push(self.field("Issuer:", na(&r.certificate_issuer)));
        lines.push(self.field("Signed at:", &time_or_na(r.signed_at_unix_time)));
        lines.push(self.field(
            "Rekor index:",
            &r.rekor_log_index
                .map_or_else(|| NA.to_string(), |i| i.to_string()),
        ));
        lines.push(self.field("Image digest:", na(&r.image_digest)));
        lines.join("\n")
    }

    pub fn provenance(&self, r: &ProvenanceResult) -> String {
        let mut lines = vec![
            self.heading("SLSA provenance"),
            self.ok(&format!("Provenance verified (schema {})", r.schema_version.as_str())),
            self.field("Predicate type:", na(&r.predicate_type)),
            self.field("Builder:", na(&r.builder_id)),
            self.field("Build type:", na(&r.build_type)),
            self.field("Source repo:", na(&r.source_repo_uri)),
            self.field("Commit:", na(&r.source_commit_sha)),
            self.field("Trigger:", na(&r.build_trigger)),
            self.field("Ref:", na(&r.build_ref)),
            self.field("Materials:", &r.materials.len().to_string()),
        ];
        let materials: Vec<String> = r
            .materials
            .iter()
            .map(|m| match &m.digest {
                Some(d) => format!("{} ({d})", na(&m.uri)),
                None => na(&m.uri).to_string(),
            })
            .collect();
        lines.extend(self.truncated(&materials, self.limits.materials));
        lines.join("\n")
    }

    pub fn sbom(&self, r: &SbomResult) -> String {
        let creators: Vec<&str> = r.creators.iter().map(String::as_str).collect();
        let ecosystems: Vec<&str> = r.ecosystems.iter().map(String::as_str).collect();
        let mut lines = vec![
            self.heading("SBOM"),
            self.ok("SBOM attestation verified"),
            self.field("SPDX version:", na(&r.spdx_version)),
            self.field("Name:", na(&r.name)),
            self.field("Created:", na(&r.created)),
            self.field(
                "Creators:",
                if creators.is_empty() { NA.to_string() } else { creators.join(", ") }.as_str(),
            ),
            self.field("Packages:", &r.package_count().to_string()),
            self.field("Files:", &r.file_count.to_string()),
            self.field(
                "Ecosystems:",
                if ecosystems.is_empty() { NA.to_string() } else { ecosystems.join(", ") }.as_str(),
            ),
        ];
        let packages: Vec<String> = r
            .packages
            .iter()
            .map(|p| match &p.version_info {
                Some(v) => format!("{}@{v}", p.name),
                None => p.name.clone(),
            })
            .collect();
        lines.extend(self.truncated(&packages, self.limits.packages));
        lines.join("\n")
    }

    pub fn sbom_skipped(&self, reason: &str) -> String {
        [
            self.heading("SBOM"),
            self.warn("No verified SBOM attestation; continuing without it"),
            self.field("Reason:", reason),
        ]
        .join("\n")
    }

    pub fn rekor(&self, outcome: &RekorOutcome) -> String {
        let mut lines = vec![self.heading("Transparency log")];
        match outcome {
            RekorOutcome::Index { entry, source, .. } => {
                match source {
                    EntrySource::Log => lines.push(self.ok("Entry found in Rekor")),
                    EntrySource::SignatureClaim { reason } => {
                        lines.push(self.warn(
                            "Entry lookup failed; index confirmed by signature bundle only",
                        ));
                        lines.push(self.field("Reason:", reason));
                    }
                }
                lines.push(self.field("Log index:", &entry.log_index.to_string()));
                lines.push(self.field("UUID:", na(&entry.uuid)));
                lines.push(self.field("Integrated at:", &time_or_na(entry.integrated_time_unix)));
            }
            RekorOutcome::DigestSearch { digest, uuids, .. } => {
                if uuids.is_empty() {
                    lines.push(self.warn("No Rekor entries found for image digest"));
                } else {
                    lines.push(self.ok(&format!("Found {} Rekor entries by digest", uuids.len())));
                }
                lines.push(self.field("Digest:", digest));
                lines.extend(self.truncated(uuids, self.limits.rekor_matches));
            }
        }
        lines.join("\n")
    }

    pub fn rekor_skipped(&self, reason: &str) -> String {
        [
            self.heading("Transparency log"),
            self.warn("Transparency log not confirmed"),
            self.field("Reason:", reason),
        ]
        .join("\n")
    }

    pub fn summary(&self, s: &Summary) -> String {
        let banner = self.style(Style::new().green().bold());
        let mut lines = vec![
            self.heading("Summary"),
            format!("    {}", banner.apply_to(s.verdict)),
        ];
        match &s.confidence {
            Confidence::Full => {
                lines.push(self.field("Confidence:", "full (signature, provenance, SBOM, Rekor)"));
            }
            Confidence::Degraded { stages } => {
                lines.push(self.field(
                    "Confidence:",
                    &format!("degraded ({} not confirmed)", stages.join(", ")),
                ));
            }
        }
        lines.join("\n")
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::provenance::{Material, ProvenanceSchema};
    use crate::rekor::RekorEntry;
    use crate::sbom::SbomPackage;

    #[test]
    fn plain_output_has_no_escape_codes() {
        let p = Printer::plain();
        assert!(!p.ok("done").contains('\u{1b}'));
        assert_eq!(p.ok("done"), "    [OK] done");
    }

    #[test]
    fn colored_output_is_styled() {
        let p = Printer::new(true, false, DisplayLimits::default());
        assert!(p.fail("bad").contains('\u{1b}'));
    }

    #[test]
    fn missing_fields_render_as_na() {
        let r = SignatureResult {
            verified: true,
            ..SignatureResult::default()
        };
        let text = Printer::plain().signature(&r);
        assert!(text.contains("Identity:"));
        assert_eq!(text.matches(NA).count(), 5, "{text}");
    }

    #[test]
    fn rejected_signature_shows_reason() {
        let r = SignatureResult {
            failure: Some("no matching signatures".into()),
            ..SignatureResult::default()
        };
        let text = Printer::plain().signature(&r);
        assert!(text.contains("[FAIL]"));
        assert!(text.contains("no matching signatures"));
    }

    #[test]
    fn materials_truncate_after_limit() {
        let r = ProvenanceResult {
            schema_version: ProvenanceSchema::V0_2,
            materials: (0..8)
                .map(|i| Material {
                    uri: Some(format!("git+https://github.com/acme/dep{i}")),
                    digest: None,
                })
                .collect(),
            ..ProvenanceResult::default()
        };
        let text = Printer::plain().provenance(&r);
        assert!(text.contains("dep4"));
        assert!(!text.contains("dep5"));
        assert!(text.contains("... and 3 more"));

        let verbose = Printer::new(false, true, DisplayLimits::default()).provenance(&r);
        assert!(verbose.contains("dep7"));
        assert!(!verbose.contains("more"));
    }

    #[test]
    fn sbom_lists_sample_packages() {
        let r = SbomResult {
            packages: vec![
                SbomPackage {
                    name: "openssl".into(),
                    version_info: Some("3.1.4".into()),
                },
                SbomPackage {
                    name: "bare".into(),
                    version_info: None,
                },
            ],
            ..SbomResult::default()
        };
        let text = Printer::plain().sbom(&r);
        assert!(text.contains("openssl@3.1.4"));
        assert!(text.contains("- bare"));
        assert!(text.contains("Packages:        2"));
    }

    #[test]
    fn rekor_digest_search_shows_at_most_three() {
        let outcome = RekorOutcome::DigestSearch {
            digest: "sha256:ab".into(),
            uuids: (0..5).map(|i| format!("uuid{i}")).collect(),
            evidence_sha256: None,
        };
        let text = Printer::plain().rekor(&outcome);
        assert!(text.contains("uuid2"));
        assert!(!text.contains("uuid3"));
        assert!(text.contains("... and 2 more"));
    }

    #[test]
    fn rekor_claim_only_is_a_warning() {
        let outcome = RekorOutcome::Index {
            entry: RekorEntry {
                log_index: 9,
                uuid: None,
                integrated_time_unix: None,
            },
            source: EntrySource::SignatureClaim {
                reason: "timeout".into(),
            },
            evidence_sha256: None,
        };
        let text = Printer::plain().rekor(&outcome);
        assert!(text.contains("[WARN]"));
        assert!(text.contains("Log index:       9"));
    }
}
