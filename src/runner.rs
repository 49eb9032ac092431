//! External-process invocation.
//!
//! Every stage reaches the outside world through [`ToolRunner`], so the
//! pipeline can be driven by canned outputs in tests. [`SystemRunner`] is
//! the real implementation: it spawns the program directly (no shell),
//! captures both streams and never retries.

use anyhow::{Context, Result};
use regex::Regex;
use std::{
    io::ErrorKind,
    process::{Command, Stdio},
};
use tracing::debug;

use crate::config::VerifyConfig;
use crate::error::PipelineError;
use crate::workspace::Workspace;

const MAX_TOOL_ERR_BYTES: usize = 8 * 1024; // 8KB

/// Captured result of one external invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolOutput {
    pub success: bool,
    pub stdout: Vec<u8>,
    /// Already passed through [`sanitize_tool_stderr`].
    pub stderr: String,
}

impl ToolOutput {
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }
}

pub trait ToolRunner {
    /// Runs `program args...` to completion.
    ///
    /// A program that cannot be launched is reported as
    /// [`PipelineError::ToolMissing`]; a non-zero exit is not an error here.
    fn run(&self, program: &str, args: &[String]) -> Result<ToolOutput>;

    /// Returns true if `program` can be spawned at all.
    fn is_available(&self, program: &str) -> bool;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

impl ToolRunner for SystemRunner {
    fn run(&self, program: &str, args: &[String]) -> Result<ToolOutput> {
        debug!(program, ?args, "invoking external tool");
        let out = match Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output()
        {
            Ok(out) => out,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(PipelineError::ToolMissing {
                    tool: program.to_string(),
                    hint: crate::toolcheck::install_hint(program).to_string(),
                }
                .into())
            }
            Err(e) => return Err(e).with_context(|| format!("running {program}")),
        };
        debug!(
            program,
            status = ?out.status.code(),
            stdout_bytes = out.stdout.len(),
            "external tool finished"
        );
        Ok(ToolOutput {
            success: out.status.success(),
            stdout: out.stdout,
            stderr: sanitize_tool_stderr(&out.stderr),
        })
    }

    fn is_available(&self, program: &str) -> bool {
        crate::toolcheck::probe(program, &["version"])
    }
}

/// Everything a stage needs besides its own inputs.
#[derive(Clone, Copy)]
pub struct StageContext<'a> {
    pub runner: &'a dyn ToolRunner,
    pub config: &'a VerifyConfig,
    pub workspace: &'a Workspace,
}

impl<'a> StageContext<'a> {
    pub fn new(
        runner: &'a dyn ToolRunner,
        config: &'a VerifyConfig,
        workspace: &'a Workspace,
    ) -> Self {
        Self {
            runner,
            config,
            workspace,
        }
    }

    pub fn cosign(&self, args: &[String]) -> Result<ToolOutput> {
        self.runner.run(&self.config.tools.cosign, args)
    }

    /// Runs `rekor-cli`, appending `--rekor_server` when one is configured.
    pub fn rekor_cli(&self, args: &[String]) -> Result<ToolOutput> {
        let mut args = args.to_vec();
        if let Some(server) = &self.config.rekor_server {
            args.push("--rekor_server".to_string());
            args.push(server.clone());
        }
        self.runner.run(&self.config.tools.rekor_cli, &args)
    }

    pub fn docker(&self, args: &[String]) -> Result<ToolOutput> {
        self.runner.run(&self.config.tools.docker, args)
    }
}

/// Truncates tool stderr and scrubs credential-shaped strings before it is
/// shown to the operator or embedded in a report.
pub fn sanitize_tool_stderr(stderr: &[u8]) -> String {
    let mut s = String::from_utf8_lossy(stderr).trim_end().to_string();
    if s.len() > MAX_TOOL_ERR_BYTES {
        let mut cut = MAX_TOOL_ERR_BYTES;
        while !s.is_char_boundary(cut) {
            cut -= 1;
        }
        s.truncate(cut);
        s.push_str("\n[TRUNCATED]");
    }

    let patterns = [
        (r"(?i)ghp_[A-Za-z0-9]{30,60}", "ghp_****************"),
        (r"(?i)ghs_[A-Za-z0-9]{30,60}", "ghs_****************"),
        (r"eyJ[A-Za-z0-9_\-]{10,}\.[A-Za-z0-9_\-]{10,}\.[A-Za-z0-9_\-]*", "[REDACTED_JWT]"),
        (
            r"(?i)(password|token)\s*[:=]\s*[^\s]+",
            "[REDACTED]=[REDACTED]",
        ),
        (r"(?i)bearer\s+[a-z0-9\-_\.=]{1,500}", "bearer [REDACTED]"),
    ];
    for (pat, repl) in patterns {
        if let Ok(re) = Regex::new(pat) {
            s = re.replace_all(&s, repl).to_string();
        }
    }
    s
}
