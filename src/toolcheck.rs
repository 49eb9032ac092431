//! External tool availability detection.
//!
//! provcheck delegates signature, attestation and transparency-log checks to
//! `cosign` and `rekor-cli`, and resolves image digests with `docker`. This
//! module probes whether each is reachable before a stage tries to invoke
//! it, so a missing binary produces an install hint instead of an opaque
//! "No such file or directory".
//!
//! A tool counts as available if it can be spawned; a non-zero exit from its
//! version command is fine.

use std::process::{Command, Stdio};

use crate::config::ToolPaths;
use crate::error::PipelineError;
use crate::runner::ToolRunner;

/// The delegated tools, in the order the pipeline first needs them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tool {
    Cosign,
    RekorCli,
    Docker,
}

impl Tool {
    pub const ALL: [Tool; 3] = [Tool::Cosign, Tool::RekorCli, Tool::Docker];

    /// Configured program name for this tool.
    pub fn program(self, paths: &ToolPaths) -> &str {
        match self {
            Tool::Cosign => &paths.cosign,
            Tool::RekorCli => &paths.rekor_cli,
            Tool::Docker => &paths.docker,
        }
    }

    pub fn hint(self) -> &'static str {
        match self {
            Tool::Cosign => {
                "Install: https://docs.sigstore.dev/cosign/system_config/installation/"
            }
            Tool::RekorCli => "Install: go install github.com/sigstore/rekor/cmd/rekor-cli@latest",
            Tool::Docker => "Install: https://docs.docker.com/get-docker/",
        }
    }
}

/// Summary of which external tools are available.
#[derive(Debug, Clone)]
pub struct ToolAvailability {
    pub cosign: bool,
    pub rekor_cli: bool,
    pub docker: bool,
}

impl ToolAvailability {
    pub fn is_available(&self, tool: Tool) -> bool {
        match tool {
            Tool::Cosign => self.cosign,
            Tool::RekorCli => self.rekor_cli,
            Tool::Docker => self.docker,
        }
    }

    /// Returns a human-readable line per missing tool with an install hint.
    pub fn missing_tools_report(&self, paths: &ToolPaths) -> Vec<String> {
        Tool::ALL
            .iter()
            .filter(|t| !self.is_available(**t))
            .map(|t| format!("{}: not found. {}", t.program(paths), t.hint()))
            .collect()
    }
}

/// Probes every tool through `runner`. Never fails; a missing tool is `false`.
pub fn detect_tools(runner: &dyn ToolRunner, paths: &ToolPaths) -> ToolAvailability {
    ToolAvailability {
        cosign: runner.is_available(&paths.cosign),
        rekor_cli: runner.is_available(&paths.rekor_cli),
        docker: runner.is_available(&paths.docker),
    }
}

/// Fails with [`PipelineError::ToolMissing`] on the first of `tools` that
/// cannot be launched.
pub fn require(
    runner: &dyn ToolRunner,
    paths: &ToolPaths,
    tools: &[Tool],
) -> Result<(), PipelineError> {
    for tool in tools {
        let program = tool.program(paths);
        if !runner.is_available(program) {
            return Err(PipelineError::ToolMissing {
                tool: program.to_string(),
                hint: tool.hint().to_string(),
            });
        }
    }
    Ok(())
}

/// Install hint for a program name, used when a spawn fails outside of an
/// explicit preflight. Unknown programs (custom paths) get a generic hint.
pub fn install_hint(program: &str) -> &'static str {
    let base = program.rsplit('/').next().unwrap_or(program);
    match base {
        "cosign" => Tool::Cosign.hint(),
        "rekor-cli" => Tool::RekorCli.hint(),
        "docker" => Tool::Docker.hint(),
        _ => "check the tools section of the provcheck config",
    }
}

/// Attempts to spawn `cmd args...` and returns `true` if the process
/// launched (regardless of exit code).
pub fn probe(cmd: &str, args: &[&str]) -> bool {
    Command::new(cmd)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .is_ok()
}
