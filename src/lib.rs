//! # provcheck
//!
//! Supply-chain attestation verification for container images.
//!
//! provcheck is an orchestration layer: signature checks, attestation
//! verification and transparency-log lookups are delegated to `cosign` and
//! `rekor-cli`. What lives here is the ordering of those calls, the decision
//! of which failures are fatal, and the extraction of a readable trust
//! summary from the JSON the tools print.
//!
//! ## Pipeline
//!
//! signature (required) -> SLSA provenance (required) -> SPDX SBOM
//! (best effort) -> Rekor entry (best effort) -> summary.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`error`] | Failure taxonomy shared by every stage |
//! | [`config`] | Config loading and defaults |
//! | [`fs_guard`] | Symlink-safe, size-bounded file reads |
//! | [`toolcheck`] | External tool detection and install hints |
//! | [`runner`] | Process invocation seam and stderr sanitising |
//! | [`workspace`] | Per-run temp directory and evidence hashing |
//! | [`payload`] | DSSE payload decoding and predicate normalisation |
//! | [`identity`] | Verification target and signer identity regex |
//! | [`signature`] | `cosign verify` stage |
//! | [`provenance`] | SLSA provenance stage (v0.2 / v1) |
//! | [`sbom`] | SPDX SBOM stage |
//! | [`rekor`] | Transparency-log stage |
//! | [`display`] | Text rendering of stage results |
//! | [`pipeline`] | Stage ordering, state machine and summary |

/// [`PipelineError`](error::PipelineError): tool missing, verification
/// failed, extraction failed, lookup not found.
pub mod error;

/// Optional JSON config: OIDC issuer, workflow path, tool paths, Rekor
/// server and display limits.
pub mod config;

/// Symlink-safe, size-bounded file reads for config and captured tool
/// output.
pub mod fs_guard;

pub mod toolcheck;

/// The [`ToolRunner`](runner::ToolRunner) trait every stage calls through.
pub mod runner;

pub mod workspace;

/// Base64 DSSE payloads, string-encoded predicates and small JSON lookups.
pub mod payload;

pub mod identity;

pub mod signature;

/// SLSA provenance, parsed per schema version.
pub mod provenance;

pub mod sbom;

pub mod rekor;

/// Stateless text rendering; colour is a [`Printer`](display::Printer) field.
pub mod display;

/// The orchestrator.
pub mod pipeline;
