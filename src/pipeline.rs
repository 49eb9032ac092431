//! The verification pipeline: signature, provenance, SBOM, transparency log,
//! then a summary.
//!
//! ```text
//! SignaturePending -> SignatureOk -> ProvenanceOk -> SbomOk | SbomSkipped
//!                                                 -> RekorOk | RekorWarn -> Summary
//! SignaturePending | SignatureOk -> Failed
//! ```
//!
//! Only signature and provenance failures are terminal. SBOM and Rekor
//! problems are recorded as degraded confidence on the summary. Each stage
//! section is rendered as soon as the stage finishes, so a run that aborts
//! still shows what had been verified.

use anyhow::{anyhow, Result};
use serde::Serialize;
use std::io::Write;
use tracing::{info, warn};

use crate::config::VerifyConfig;
use crate::display::Printer;
use crate::error::PipelineError;
use crate::identity::VerificationTarget;
use crate::provenance::{self, ProvenanceResult};
use crate::rekor::{self, RekorOutcome};
use crate::runner::{StageContext, ToolRunner};
use crate::sbom::{self, SbomResult};
use crate::signature::{self, SignatureResult};
use crate::toolcheck::{self, Tool};
use crate::workspace::Workspace;

/// Verdict printed for every run that reaches the summary.
pub const VERDICT: &str = "Image is SLSA Level 3 compliant";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineState {
    SignaturePending,
    SignatureOk,
    ProvenanceOk,
    SbomOk,
    SbomSkipped,
    RekorOk,
    RekorWarn,
    Summary,
    Failed,
}

impl PipelineState {
    pub fn can_transition_to(self, next: Self) -> bool {
        use PipelineState::*;
        matches!(
            (self, next),
            (SignaturePending, SignatureOk | Failed)
                | (SignatureOk, ProvenanceOk | Failed)
                | (ProvenanceOk, SbomOk | SbomSkipped)
                | (SbomOk | SbomSkipped, RekorOk | RekorWarn)
                | (RekorOk | RekorWarn, Summary)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Summary | Self::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SbomOutcome {
    Verified(SbomResult),
    Skipped { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RekorStatus {
    Confirmed { outcome: RekorOutcome },
    Warning {
        outcome: Option<RekorOutcome>,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "level", rename_all = "snake_case")]
pub enum Confidence {
    Full,
    Degraded { stages: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Summary {
    pub verdict: &'static str,
    pub confidence: Confidence,
}

/// Everything a run produced, whether or not it reached the summary.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub target: VerificationTarget,
    pub state: PipelineState,
    pub trail: Vec<PipelineState>,
    pub signature: Option<SignatureResult>,
    pub provenance: Option<ProvenanceResult>,
    pub sbom: Option<SbomOutcome>,
    pub rekor: Option<RekorStatus>,
    pub summary: Option<Summary>,
    pub failure: Option<String>,
}

impl PipelineReport {
    fn new(target: VerificationTarget) -> Self {
        Self {
            target,
            state: PipelineState::SignaturePending,
            trail: vec![PipelineState::SignaturePending],
            signature: None,
            provenance: None,
            sbom: None,
            rekor: None,
            summary: None,
            failure: None,
        }
    }

    fn advance(&mut self, next: PipelineState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(anyhow!(
                "illegal pipeline transition {:?} -> {next:?}",
                self.state
            ));
        }
        self.state = next;
        self.trail.push(next);
        Ok(())
    }

    fn fail(&mut self, reason: String) -> Result<()> {
        self.advance(PipelineState::Failed)?;
        self.failure = Some(reason);
        Ok(())
    }

    /// True when every required stage passed.
    pub fn passed(&self) -> bool {
        self.state == PipelineState::Summary
    }
}

pub struct Pipeline<'a> {
    runner: &'a dyn ToolRunner,
    config: &'a VerifyConfig,
    printer: Printer,
    /// Suppress per-stage text; the caller prints the report as JSON.
    quiet: bool,
}

impl<'a> Pipeline<'a> {
    pub fn new(runner: &'a dyn ToolRunner, config: &'a VerifyConfig, printer: Printer) -> Self {
        Self {
            runner,
            config,
            printer,
            quiet: false,
        }
    }

    pub fn quiet(mut self, quiet: bool) -> Self {
        self.quiet = quiet;
        self
    }

    fn emit(&self, out: &mut dyn Write, text: &str) -> Result<()> {
        if !self.quiet {
            writeln!(out, "{text}\n")?;
        }
        Ok(())
    }

    /// Runs every stage against `target`, writing stage sections to `out`.
    ///
    /// Returns `Err` only when the run could not be attempted (missing tool,
    /// I/O failure). A rejected image is an `Ok` report with
    /// `passed() == false`.
    pub fn run(&self, target: &VerificationTarget, out: &mut dyn Write) -> Result<PipelineReport> {
        toolcheck::require(self.runner, &self.config.tools, &Tool::ALL)?;

        let workspace = Workspace::new()?;
        let ctx = StageContext::new(self.runner, self.config, &workspace);
        let mut report = PipelineReport::new(target.clone());
        info!(image = %target.image_reference, "starting verification");

        // Signature: required.
        let sig = signature::verify_signature(&ctx, target, None)?;
        self.emit(out, &self.printer.signature(&sig))?;
        let log_index = sig.rekor_log_index;
        let verified = sig.verified;
        let sig_failure = sig.failure.clone();
        report.signature = Some(sig);
        if !verified {
            let reason = PipelineError::VerificationFailed {
                stage: signature::STAGE,
                reason: sig_failure.unwrap_or_else(|| "signature rejected".to_string()),
            }
            .to_string();
            report.fail(reason)?;
            return Ok(report);
        }
        report.advance(PipelineState::SignatureOk)?;

        // Provenance: required.
        match provenance::verify_provenance(&ctx, target, None) {
            Ok(prov) => {
                self.emit(out, &self.printer.provenance(&prov))?;
                report.provenance = Some(prov);
                report.advance(PipelineState::ProvenanceOk)?;
            }
            Err(e) if is_tool_missing(&e) => return Err(e),
            Err(e) => {
                let section = [
                    self.printer.heading("SLSA provenance"),
                    self.printer.fail(&e.to_string()),
                ];
                self.emit(out, &section.join("\n"))?;
                report.fail(e.to_string())?;
                return Ok(report);
            }
        }

        // SBOM: best effort.
        match sbom::verify_sbom(&ctx, target, None) {
            Ok(s) => {
                self.emit(out, &self.printer.sbom(&s))?;
                report.sbom = Some(SbomOutcome::Verified(s));
                report.advance(PipelineState::SbomOk)?;
            }
            Err(e) if is_tool_missing(&e) => return Err(e),
            Err(e) => {
                warn!(error = %e, "continuing without SBOM");
                let reason = e.to_string();
                self.emit(out, &self.printer.sbom_skipped(&reason))?;
                report.sbom = Some(SbomOutcome::Skipped { reason });
                report.advance(PipelineState::SbomSkipped)?;
            }
        }

        // Rekor: best effort; uses the signature's index when it has one.
        match rekor::verify_rekor(&ctx, log_index, Some(&target.image_reference)) {
            Ok(outcome) => {
                self.emit(out, &self.printer.rekor(&outcome))?;
                if outcome.is_found() {
                    report.rekor = Some(RekorStatus::Confirmed { outcome });
                    report.advance(PipelineState::RekorOk)?;
                } else {
                    let reason = match &outcome {
                        RekorOutcome::Index { .. } => "log entry lookup failed".to_string(),
                        RekorOutcome::DigestSearch { .. } => {
                            "no log entries match the image digest".to_string()
                        }
                    };
                    report.rekor = Some(RekorStatus::Warning {
                        outcome: Some(outcome),
                        reason,
                    });
                    report.advance(PipelineState::RekorWarn)?;
                }
            }
            Err(e) if is_tool_missing(&e) => return Err(e),
            Err(e) => {
                warn!(error = %e, "transparency log not confirmed");
                let reason = e.to_string();
                self.emit(out, &self.printer.rekor_skipped(&reason))?;
                report.rekor = Some(RekorStatus::Warning {
                    outcome: None,
                    reason,
                });
                report.advance(PipelineState::RekorWarn)?;
            }
        }

        let summary = summarize(&report);
        self.emit(out, &self.printer.summary(&summary))?;
        report.summary = Some(summary);
        report.advance(PipelineState::Summary)?;
        info!(state = ?report.state, "verification finished");
        Ok(report)
    }
}

fn is_tool_missing(e: &anyhow::Error) -> bool {
    e.downcast_ref::<PipelineError>()
        .is_some_and(PipelineError::is_tool_missing)
}

/// Builds the summary for a run whose required stages passed.
pub fn summarize(report: &PipelineReport) -> Summary {
    let mut degraded = Vec::new();
    if !matches!(report.sbom, Some(SbomOutcome::Verified(_))) {
        degraded.push(sbom::STAGE.to_string());
    }
    if !matches!(report.rekor, Some(RekorStatus::Confirmed { .. })) {
        degraded.push(rekor::STAGE.to_string());
    }
    Summary {
        verdict: VERDICT,
        confidence: if degraded.is_empty() {
            Confidence::Full
        } else {
            Confidence::Degraded { stages: degraded }
        },
    }
}
