//! # zerolayer command line interface
//!
//! Command line tool to manage boot environments built from a local
//! Containerfile.

use std::ffi::OsString;
use std::io::IsTerminal;

use anyhow::Context;
use camino::Utf8PathBuf;
use clap::Parser;

use crate::build::PodmanBuilder;
use crate::config::Config;
use crate::deploy::{create_and_rebase, deploy, Mode, Outcome};
use crate::environments::EnvironmentRegistry;
use crate::error::Result;
use crate::init::init_recipe;
use crate::progress::Progress;
use crate::rebase::RpmOstree;
use crate::registry::PodmanRegistry;
use crate::status::{limit_shown, print_environments, print_status, system_status};

/// Options for `create`
#[derive(Debug, Parser, PartialEq, Eq)]
pub struct CreateOpts {
    /// Name of the new boot environment
    pub name: String,

    /// Directory containing the Containerfile; defaults to the configured recipe
    #[clap(long)]
    pub source: Option<Utf8PathBuf>,

    /// Extra build argument (KEY=VALUE), may be repeated
    #[clap(long, action = clap::ArgAction::Append)]
    pub build_arg: Vec<String>,
}

/// Options for commands that only take an environment name
#[derive(Debug, Parser, PartialEq, Eq)]
pub struct NameOpts {
    /// Name of the boot environment
    pub name: String,
}

/// Options for `delete`
#[derive(Debug, Parser, PartialEq, Eq)]
pub struct DeleteOpts {
    /// Name of the boot environment
    #[clap(required_unless_present = "all")]
    pub name: Option<String>,

    /// Delete every environment except the active one
    #[clap(long, conflicts_with = "name")]
    pub all: bool,

    /// Do not ask before deleting with --all
    #[clap(long, requires = "all")]
    pub no_confirm: bool,
}

/// Options for `list`
#[derive(Debug, Parser, PartialEq, Eq)]
pub struct ListOpts {
    /// Output JSON
    #[clap(long)]
    pub json: bool,

    /// Show only the N most recently created environments
    #[clap(long, value_name = "N")]
    pub max: Option<usize>,
}

/// Options for commands with an optional JSON output
#[derive(Debug, Parser, PartialEq, Eq)]
pub struct OutputOpts {
    /// Output JSON
    #[clap(long)]
    pub json: bool,
}

/// Options for `init`
#[derive(Debug, Parser, PartialEq, Eq)]
pub struct InitOpts {
    /// Git repository to clone; defaults to the configured `recipe-url`
    #[clap(long)]
    pub url: Option<String>,

    /// Replace an existing recipe directory
    #[clap(long)]
    pub force: bool,
}

/// Subcommands
#[derive(Debug, clap::Subcommand, PartialEq, Eq)]
pub enum Opt {
    /// Build a new boot environment
    Create(CreateOpts),
    /// List boot environments
    List(ListOpts),
    /// Delete a boot environment and its image
    ///
    /// The active environment cannot be deleted; `--all` skips it.
    Delete(DeleteOpts),
    /// Rebase the system onto a boot environment
    ///
    /// Depending on the configured `target`, the image is either used
    /// directly from its OCI archive or pushed to the local registry first.
    Rebase(NameOpts),
    /// Switch to a previously built boot environment without pushing
    Switch(NameOpts),
    /// Build a new environment from the configured recipe and rebase to it
    ///
    /// This is intended to be run periodically from a timer.
    All,
    /// Show the booted and staged images and the active environment
    Status(OutputOpts),
    /// Clone the recipe repository into the recipe directory
    Init(InitOpts),
}

/// Manage boot environments built from a local Containerfile
#[derive(Debug, Parser, PartialEq, Eq)]
#[clap(name = "zerolayer", version)]
pub struct Cli {
    /// Validate and print what would be done without changing anything
    #[clap(long, global = true)]
    pub dry_run: bool,

    /// Only print errors
    #[clap(long, short, global = true)]
    pub quiet: bool,

    /// Configuration file
    #[clap(long, global = true, value_name = "PATH")]
    pub config: Option<Utf8PathBuf>,

    /// The command to run
    #[clap(subcommand)]
    pub opt: Opt,
}

/// Parse the provided arguments and execute.
/// Calls [`clap::Error::exit`] on failure, printing the error message and
/// aborting the program.
pub async fn run_from_iter<I>(args: I) -> Result<()>
where
    I: IntoIterator,
    I::Item: Into<OsString> + Clone,
{
    let cli = Cli::parse_from(args);
    zerolayer_utils::initialize_tracing(cli.quiet);
    tracing::trace!("starting {}", env!("CARGO_PKG_NAME"));
    run(cli).await
}

/// Execute a parsed command line.
pub async fn run(cli: Cli) -> Result<()> {
    let config = Config::load(cli.config.as_deref())?;
    let progress = Progress::new(cli.quiet);
    let dry_run = cli.dry_run;
    let quiet = cli.quiet;

    if let Opt::Init(opts) = &cli.opt {
        let url = opts.url.as_deref().unwrap_or(&config.recipe_url);
        return init_recipe(url, &config.recipe_dir, opts.force, dry_run, &progress).await;
    }

    // Queries and dry runs neither create the store nor keep writers waiting
    let readonly = dry_run || matches!(cli.opt, Opt::List(_) | Opt::Status(_));
    let mut envs = if readonly {
        EnvironmentRegistry::open_readonly(config, progress)?
    } else {
        EnvironmentRegistry::open(config, progress)?
    };
    match cli.opt {
        Opt::Create(opts) => {
            let source = opts
                .source
                .unwrap_or_else(|| envs.config().recipe_dir.clone());
            let builder = PodmanBuilder::new(quiet);
            envs.create(&builder, &opts.name, &source, &opts.build_arg, dry_run)
                .await?;
        }
        Opt::List(opts) => {
            let mut list = envs.list()?;
            let hidden = limit_shown(&mut list, opts.max);
            let mut out = anstream::stdout().lock();
            print_environments(&mut out, &list, opts.json)?;
            if hidden > 0 {
                tracing::info!("{hidden} older environments not shown");
            }
        }
        Opt::Delete(opts) => match opts.name.as_deref() {
            Some(name) => envs.delete(name, dry_run)?,
            None => {
                if dry_run || opts.no_confirm || confirm_delete_all(&envs)? {
                    envs.delete_all(dry_run)?;
                }
            }
        },
        Opt::Rebase(opts) => {
            let outcome = deploy(
                &mut envs,
                &PodmanRegistry::new(quiet),
                &RpmOstree::new(quiet),
                &opts.name,
                Mode::Rebase,
                dry_run,
            )
            .await?;
            log_outcome(&outcome);
        }
        Opt::Switch(opts) => {
            let outcome = deploy(
                &mut envs,
                &PodmanRegistry::new(quiet),
                &RpmOstree::new(quiet),
                &opts.name,
                Mode::Switch,
                dry_run,
            )
            .await?;
            log_outcome(&outcome);
        }
        Opt::All => {
            let outcome = create_and_rebase(
                &mut envs,
                &PodmanBuilder::new(quiet),
                &PodmanRegistry::new(quiet),
                &RpmOstree::new(quiet),
                dry_run,
            )
            .await?;
            log_outcome(&outcome);
        }
        Opt::Status(opts) => {
            let status = system_status(&envs, &RpmOstree::new(quiet)).await?;
            let mut out = anstream::stdout().lock();
            print_status(&mut out, &status, opts.json)?;
        }
        // Handled above, without taking the store lock
        Opt::Init(_) => {}
    }
    Ok(())
}

/// Ask before `delete --all`; an empty selection needs no answer.
fn confirm_delete_all(envs: &EnvironmentRegistry) -> Result<bool> {
    let names: Vec<String> = envs.deletable()?.into_iter().map(|e| e.name).collect();
    if names.is_empty() {
        return Ok(true);
    }
    if !std::io::stdin().is_terminal() {
        let e = anyhow::anyhow!("Refusing to delete without a terminal; use --no-confirm");
        return Err(e.into());
    }
    let prompt = format!("Delete {}?", names.join(", "));
    let confirmed = dialoguer::Confirm::new()
        .with_prompt(prompt)
        .default(false)
        .interact()
        .context("Prompting for confirmation")?;
    if !confirmed {
        tracing::info!("Nothing deleted");
    }
    Ok(confirmed)
}

fn log_outcome(outcome: &Outcome) {
    match outcome {
        Outcome::AlreadyActive(name) => tracing::debug!("{name}: already active"),
        Outcome::Planned(plan) => tracing::debug!("Planned: {plan:?}"),
        Outcome::Activated(env) => tracing::debug!("Activated: {}", env.name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("zerolayer").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_parse_create() {
        let cli = parse(&[
            "create",
            "base",
            "--source",
            "/recipes/base",
            "--build-arg",
            "A=1",
            "--build-arg=B=2",
        ]);
        similar_asserts::assert_eq!(
            cli,
            Cli {
                dry_run: false,
                quiet: false,
                config: None,
                opt: Opt::Create(CreateOpts {
                    name: "base".into(),
                    source: Some("/recipes/base".into()),
                    build_arg: vec!["A=1".into(), "B=2".into()],
                }),
            }
        );
    }

    #[test]
    fn test_global_flags_anywhere() {
        let a = parse(&["--dry-run", "-q", "rebase", "base"]);
        let b = parse(&["rebase", "base", "--quiet", "--dry-run"]);
        assert_eq!(a, b);
        assert!(a.dry_run && a.quiet);
        assert_eq!(
            a.opt,
            Opt::Rebase(NameOpts {
                name: "base".into()
            })
        );

        let c = parse(&["all", "--config", "/tmp/zl.toml"]);
        assert_eq!(c.opt, Opt::All);
        assert_eq!(c.config.as_deref(), Some(camino::Utf8Path::new("/tmp/zl.toml")));
    }

    #[test]
    fn test_parse_misc() {
        assert_eq!(
            parse(&["list", "--json"]).opt,
            Opt::List(ListOpts {
                json: true,
                max: None
            })
        );
        assert_eq!(
            parse(&["list", "--max", "3"]).opt,
            Opt::List(ListOpts {
                json: false,
                max: Some(3)
            })
        );
        assert_eq!(
            parse(&["init", "--force"]).opt,
            Opt::Init(InitOpts {
                url: None,
                force: true
            })
        );
        assert!(matches!(parse(&["switch", "x"]).opt, Opt::Switch(_)));
        assert_eq!(
            parse(&["delete", "x"]).opt,
            Opt::Delete(DeleteOpts {
                name: Some("x".into()),
                all: false,
                no_confirm: false,
            })
        );
        assert_eq!(
            parse(&["delete", "--all", "--no-confirm"]).opt,
            Opt::Delete(DeleteOpts {
                name: None,
                all: true,
                no_confirm: true,
            })
        );
        assert!(matches!(parse(&["status"]).opt, Opt::Status(_)));
    }

    #[test]
    fn test_usage_errors() {
        for args in [
            &["rebase"][..],
            &["create"],
            &["frobnicate"],
            &[],
            &["delete"],
            &["delete", "x", "--all"],
            &["delete", "x", "--no-confirm"],
            &["list", "--max", "-1"],
        ] {
            let r = Cli::try_parse_from(std::iter::once("zerolayer").chain(args.iter().copied()));
            let e = r.unwrap_err();
            assert_eq!(e.exit_code(), 2, "{args:?}");
        }
    }

    #[test]
    fn test_verify_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
