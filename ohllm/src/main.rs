//! `oh-llm`: check an LLM provider profile against the agent SDK and autofix failures.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use ohllm::cli::{
    AutofixCommand, Context, ProfileCommand, RunArgs, RunsCommand, SdkCommand, cmd_autofix,
    cmd_profile, cmd_run, cmd_runs, cmd_sdk, report_error,
};
use ohllm::core::redaction::Redactor;
use ohllm::env::SystemEnv;
use ohllm::logging;

#[derive(Parser)]
#[command(
    name = "oh-llm",
    version,
    about = "LLM provider compatibility checks for the agent SDK"
)]
struct Cli {
    /// Print machine-readable JSON on stdout.
    #[arg(long, global = true)]
    json: bool,
    /// Config file (default: ~/.oh-llm/config.toml or $OH_LLM_CONFIG).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the compatibility stages for one profile.
    Run(RunArgs),
    /// Manage provider profiles.
    #[command(subcommand)]
    Profile(ProfileCommand),
    /// Inspect and export recorded runs.
    #[command(subcommand)]
    Runs(RunsCommand),
    /// Let a coding agent fix a failed run and open an upstream PR.
    Autofix(AutofixCommand),
    /// Inspect the agent SDK checkout.
    #[command(subcommand)]
    Sdk(SdkCommand),
}

fn main() {
    logging::init();
    let cli = Cli::parse();
    let env = SystemEnv;
    let json = cli.json;
    let ctx = match Context::load(&env, cli.config.as_deref(), json) {
        Ok(ctx) => ctx,
        Err(err) => std::process::exit(report_error(&err, json, &Redactor::default())),
    };
    let code = match dispatch(&ctx, cli.command) {
        Ok(code) => code,
        Err(err) => report_error(&err, json, &ctx.error_redactor()),
    };
    std::process::exit(code);
}

fn dispatch(ctx: &Context<'_>, command: Command) -> Result<i32> {
    match command {
        Command::Run(args) => cmd_run(ctx, args),
        Command::Profile(command) => cmd_profile(ctx, command),
        Command::Runs(command) => cmd_runs(ctx, command),
        Command::Autofix(command) => cmd_autofix(ctx, command),
        Command::Sdk(command) => cmd_sdk(ctx, command),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ohllm::cli::AutofixStep;

    #[test]
    fn parse_run_with_global_json() {
        let cli = Cli::parse_from(["oh-llm", "run", "--profile", "acme", "--mock", "--json"]);
        assert!(cli.json);
        match cli.command {
            Command::Run(args) => {
                assert_eq!(args.profile, "acme");
                assert!(args.mock);
                assert!(!args.stage_b);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn parse_autofix_without_reference() {
        let cli = Cli::parse_from(["oh-llm", "autofix", "--dry-run", "--fork-owner", "octo"]);
        match cli.command {
            Command::Autofix(AutofixCommand { step: None, args }) => {
                assert!(args.reference.is_none());
                assert!(args.dry_run);
                assert_eq!(args.fork_owner.as_deref(), Some("octo"));
            }
            _ => panic!("expected autofix"),
        }
    }

    #[test]
    fn parse_autofix_reference_and_run_flag() {
        let cli = Cli::parse_from(["oh-llm", "autofix", "abc123"]);
        match cli.command {
            Command::Autofix(AutofixCommand { step: None, args }) => {
                assert_eq!(args.reference.as_deref(), Some("abc123"));
            }
            _ => panic!("expected autofix"),
        }
        let cli = Cli::parse_from(["oh-llm", "autofix", "--run", "abc123", "--keep-worktree"]);
        match cli.command {
            Command::Autofix(AutofixCommand { step: None, args }) => {
                assert_eq!(args.run.as_deref(), Some("abc123"));
                assert!(args.keep_worktree);
            }
            _ => panic!("expected autofix"),
        }
    }

    #[test]
    fn parse_autofix_steps() {
        let cli = Cli::parse_from([
            "oh-llm", "autofix", "pr", "--run", "abc", "--dry-run", "--fork-owner", "octo",
        ]);
        match cli.command {
            Command::Autofix(AutofixCommand {
                step: Some(AutofixStep::Pr { run, dry_run, publish }),
                ..
            }) => {
                assert_eq!(run.reference.as_deref(), Some("abc"));
                assert!(dry_run);
                assert_eq!(publish.fork_owner.as_deref(), Some("octo"));
            }
            _ => panic!("expected autofix pr"),
        }
        let cli = Cli::parse_from(["oh-llm", "autofix", "worktree", "--keep-worktree"]);
        assert!(matches!(
            cli.command,
            Command::Autofix(AutofixCommand {
                step: Some(AutofixStep::Worktree {
                    keep_worktree: true,
                    ..
                }),
                ..
            })
        ));
        assert!(Cli::try_parse_from(["oh-llm", "autofix", "abc", "--run", "def"]).is_err());
    }

    #[test]
    fn parse_sdk_check_import() {
        let cli = Cli::parse_from(["oh-llm", "sdk", "check-import", "--sdk-path", "/sdk"]);
        match cli.command {
            Command::Sdk(SdkCommand::CheckImport { sdk_path }) => {
                assert_eq!(sdk_path, Some(PathBuf::from("/sdk")));
            }
            _ => panic!("expected sdk check-import"),
        }
    }

    #[test]
    fn edit_rejects_base_url_with_clear() {
        let parsed = Cli::try_parse_from([
            "oh-llm",
            "profile",
            "edit",
            "acme",
            "--base-url",
            "http://x",
            "--clear-base-url",
        ]);
        assert!(parsed.is_err());
    }

    #[test]
    fn parse_runs_export_output() {
        let cli = Cli::parse_from(["oh-llm", "runs", "export", "abc", "--output", "/tmp/r.tar.gz"]);
        match cli.command {
            Command::Runs(RunsCommand::Export {
                reference, output, ..
            }) => {
                assert_eq!(reference, "abc");
                assert_eq!(output, Some(PathBuf::from("/tmp/r.tar.gz")));
            }
            _ => panic!("expected runs export"),
        }
    }
}
