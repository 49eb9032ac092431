use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use console::style;
use serde::Serialize;
use std::{
    io::{self, Write},
    path::PathBuf,
    process::ExitCode,
};
use tracing::debug;

use provcheck::config::VerifyConfig;
use provcheck::display::Printer;
use provcheck::identity::VerificationTarget;
use provcheck::pipeline::Pipeline;
use provcheck::rekor;
use provcheck::runner::{StageContext, SystemRunner};
use provcheck::toolcheck::{self, Tool};
use provcheck::workspace::Workspace;
use provcheck::{provenance, sbom, signature};

#[derive(Parser)]
#[command(
    name = "provcheck",
    about = "Verify signatures, SLSA provenance, SBOM and transparency-log entries of container images",
    version
)]
struct Cli {
    /// provcheck config JSON (tool paths, OIDC issuer, display limits)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Print machine-readable JSON instead of text
    #[arg(long, global = true)]
    json: bool,

    /// Disable coloured output
    #[arg(long, global = true)]
    no_color: bool,

    /// Debug logging and untruncated lists
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    cmd: Cmd,
}

/// Who must have signed: a GitHub repository or an explicit identity regex.
#[derive(Args)]
struct IdentityArgs {
    /// GitHub repository (`org/name`) whose release workflow signed the image
    #[arg(long, env = "GITHUB_REPOSITORY")]
    repo: Option<String>,

    /// Certificate identity regex; takes precedence over --repo
    #[arg(long)]
    identity_regexp: Option<String>,
}

#[derive(Subcommand)]
enum Cmd {
    /// Verify the keyless signature; prints the Rekor log index (or N/A) on stdout
    Signature {
        image: String,
        /// Keep the raw `cosign verify` output here
        outfile: Option<PathBuf>,
        #[command(flatten)]
        identity: IdentityArgs,
    },

    /// Verify the SLSA provenance attestation
    Provenance {
        image: String,
        outfile: Option<PathBuf>,
        #[command(flatten)]
        identity: IdentityArgs,
    },

    /// Verify the SPDX SBOM attestation
    Sbom {
        image: String,
        outfile: Option<PathBuf>,
        #[command(flatten)]
        identity: IdentityArgs,
    },

    /// Confirm a transparency-log entry by index, or by image digest when the index is N/A
    Rekor {
        log_index: String,
        image: Option<String>,
    },

    /// Run every stage and print a compliance summary
    Verify {
        image: String,
        /// GitHub repository (`org/name`) used to build the identity regex
        repo: String,
    },

    /// Report which external tools are available
    Tools,
}

#[derive(Serialize)]
struct ErrorJson<'a> {
    status: &'a str,
    error: String,
    causes: Vec<String>,
}

#[derive(Serialize)]
struct ToolJson<'a> {
    tool: &'a str,
    available: bool,
    hint: Option<&'a str>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_writer(io::stderr)
        .init();

    let json = cli.json;
    match run(cli) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            report_error(&e, json);
            ExitCode::FAILURE
        }
    }
}

fn report_error(e: &anyhow::Error, json: bool) {
    if json {
        let payload = ErrorJson {
            status: "error",
            error: e.to_string(),
            causes: e.chain().skip(1).map(ToString::to_string).collect(),
        };
        match serde_json::to_string(&payload) {
            Ok(s) => println!("{s}"),
            Err(_) => eprintln!("error: {e}"),
        }
        return;
    }

    eprintln!("\n{} {}", style("[ERROR]").red().bold(), style(e).red());
    for (i, cause) in e.chain().skip(1).enumerate() {
        if i == 0 {
            eprintln!("\n    Caused by:");
        }
        eprintln!("      - {}", style(cause).red());
    }
    eprintln!();
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Returns whether the command passed. `Err` is reserved for runs that could
/// not be attempted or whose required stage rejected the image.
fn run(cli: Cli) -> Result<bool> {
    let config = VerifyConfig::load(cli.config.as_deref())?;
    let runner = SystemRunner;
    let printer = |stderr: bool| {
        let enabled = if stderr {
            console::colors_enabled_stderr()
        } else {
            console::colors_enabled()
        };
        Printer::new(!cli.no_color && enabled, cli.verbose, config.display)
    };
    debug!(config = ?cli.config, "configuration loaded");

    match cli.cmd {
        Cmd::Signature {
            image,
            outfile,
            identity,
        } => {
            let target = resolve_target(&image, &identity, &config)?;
            toolcheck::require(&runner, &config.tools, &[Tool::Cosign])?;
            let workspace = Workspace::new()?;
            let ctx = StageContext::new(&runner, &config, &workspace);
            let result = signature::verify_signature(&ctx, &target, outfile.as_deref())?;

            if cli.json {
                print_json(&result)?;
            } else {
                // stdout carries only the log index so scripts can capture it.
                eprintln!("{}\n", printer(true).signature(&result));
                if result.verified {
                    println!(
                        "{}",
                        result
                            .rekor_log_index
                            .map_or_else(|| "N/A".to_string(), |i| i.to_string())
                    );
                }
            }
            Ok(result.verified)
        }

        Cmd::Provenance {
            image,
            outfile,
            identity,
        } => {
            let target = resolve_target(&image, &identity, &config)?;
            toolcheck::require(&runner, &config.tools, &[Tool::Cosign])?;
            let workspace = Workspace::new()?;
            let ctx = StageContext::new(&runner, &config, &workspace);
            let result = provenance::verify_provenance(&ctx, &target, outfile.as_deref())?;
            if cli.json {
                print_json(&result)?;
            } else {
                println!("{}", printer(false).provenance(&result));
            }
            Ok(true)
        }

        Cmd::Sbom {
            image,
            outfile,
            identity,
        } => {
            let target = resolve_target(&image, &identity, &config)?;
            toolcheck::require(&runner, &config.tools, &[Tool::Cosign])?;
            let workspace = Workspace::new()?;
            let ctx = StageContext::new(&runner, &config, &workspace);
            let result = sbom::verify_sbom(&ctx, &target, outfile.as_deref())?;
            if cli.json {
                print_json(&result)?;
            } else {
                println!("{}", printer(false).sbom(&result));
            }
            Ok(true)
        }

        Cmd::Rekor { log_index, image } => {
            let index = parse_log_index(&log_index)?;
            toolcheck::require(&runner, &config.tools, &[Tool::RekorCli])?;
            let workspace = Workspace::new()?;
            let ctx = StageContext::new(&runner, &config, &workspace);
            let outcome = rekor::verify_rekor(&ctx, index, image.as_deref())?;
            if cli.json {
                print_json(&outcome)?;
            } else {
                println!("{}", printer(false).rekor(&outcome));
            }
            Ok(outcome.is_found())
        }

        Cmd::Verify { image, repo } => {
            let target = VerificationTarget::for_repo(&image, &repo, &config)?;
            let stdout = io::stdout();
            let mut out = stdout.lock();
            let report = Pipeline::new(&runner, &config, printer(false))
                .quiet(cli.json)
                .run(&target, &mut out)?;
            if cli.json {
                writeln!(out, "{}", serde_json::to_string_pretty(&report)?)?;
            } else if let Some(reason) = &report.failure {
                eprintln!(
                    "{} verification aborted: {reason}",
                    style("[FAIL]").red().bold()
                );
            }
            Ok(report.passed())
        }

        Cmd::Tools => {
            let tools = toolcheck::detect_tools(&runner, &config.tools);
            if cli.json {
                let rows: Vec<ToolJson<'_>> = Tool::ALL
                    .iter()
                    .map(|t| ToolJson {
                        tool: t.program(&config.tools),
                        available: tools.is_available(*t),
                        hint: (!tools.is_available(*t)).then(|| t.hint()),
                    })
                    .collect();
                print_json(&rows)?;
            } else {
                let p = printer(false);
                println!("{}", p.heading("External tools"));
                for t in Tool::ALL {
                    if tools.is_available(t) {
                        println!("{}", p.ok(t.program(&config.tools)));
                    }
                }
                for line in tools.missing_tools_report(&config.tools) {
                    println!("{}", p.fail(&line));
                }
            }
            Ok(Tool::ALL.iter().all(|t| tools.is_available(*t)))
        }
    }
}

fn resolve_target(
    image: &str,
    identity: &IdentityArgs,
    config: &VerifyConfig,
) -> Result<VerificationTarget> {
    match (&identity.identity_regexp, &identity.repo) {
        (Some(pattern), _) => VerificationTarget::with_pattern(image, pattern, config),
        (None, Some(repo)) => VerificationTarget::for_repo(image, repo, config),
        (None, None) => Err(anyhow!(
            "no signer identity: pass --repo <org/name> (or set GITHUB_REPOSITORY) or --identity-regexp"
        )),
    }
}

/// `N/A` (what the signature command prints without an index) or empty means
/// "search by digest".
fn parse_log_index(raw: &str) -> Result<Option<u64>> {
    let raw = raw.trim();
    if raw.is_empty() || raw.eq_ignore_ascii_case("n/a") {
        return Ok(None);
    }
    raw.parse::<u64>()
        .map(Some)
        .with_context(|| format!("invalid log index {raw:?}; expected a number or N/A"))
}
