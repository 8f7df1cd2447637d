use std::{net::SocketAddr, path::PathBuf};

use anyhow::bail;
use clap::{Parser, Subcommand, ValueEnum};
use mockreplay::{
    config::Config,
    har, logging, postman,
    reconcile::{self, CaptureBatch, ReconcileError, ReconcileOptions, ReconcileReport},
    store::{ScenarioManager, ScenarioPointer, StoreError},
    trace,
};

#[derive(Debug, Parser)]
#[command(name = "mockreplay")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the mock server.
    Serve {
        /// Optional path to config TOML. If omitted, default discovery is used.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Serve this scenario instead of the one named in `mockServer.config.json`.
        #[arg(long)]
        scenario: Option<String>,
        /// Override log level (trace, debug, info, warn, error, off).
        #[arg(long)]
        log_level: Option<String>,
    },
    /// Manage scenarios.
    Scenario {
        /// Optional path to config TOML. If omitted, default discovery is used.
        #[arg(long)]
        config: Option<PathBuf>,
        #[command(subcommand)]
        action: ScenarioCommand,
    },
    /// Import captured traffic into a scenario or the default fixtures.
    Import {
        /// Optional path to config TOML. If omitted, default discovery is used.
        #[arg(long)]
        config: Option<PathBuf>,
        #[command(flatten)]
        args: ImportArgs,
    },
}

#[derive(Debug, Subcommand, Clone, PartialEq, Eq)]
enum ScenarioCommand {
    /// List available scenarios.
    List,
    /// Create a new, empty scenario.
    Create { name: String },
    /// Delete a scenario with its fixtures and assets.
    Delete { name: String },
    /// Clear every served flag so the scenario replays from the start.
    Reset { name: String },
    /// Point the running server at a scenario via `mockServer.config.json`.
    Activate { name: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum CaptureFormat {
    Har,
    Postman,
    Trace,
}

#[derive(Debug, Clone, PartialEq, Eq, clap::Args)]
struct ImportArgs {
    format: CaptureFormat,
    /// HAR file, Postman collection file, or trace `.zip` (archive or extracted directory).
    source: PathBuf,
    /// Target scenario; created when missing.
    #[arg(long, required_unless_present = "default", conflicts_with = "default")]
    scenario: Option<String>,
    /// Import into the default fixtures instead of a scenario.
    #[arg(long)]
    default: bool,
    /// Skip exchanges already answered by the default fixtures.
    #[arg(long)]
    avoid_default_duplicates: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ScenarioCommandOutcome {
    Listed {
        scenarios: Vec<String>,
        active_scenario: Option<String>,
    },
    Created {
        name: String,
    },
    Deleted {
        name: String,
    },
    Reset {
        name: String,
        fixtures_reset: usize,
    },
    Activated {
        name: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ImportOutcome {
    target: String,
    report: ReconcileReport,
}

async fn active_scenario(config: &Config, manager: &ScenarioManager) -> anyhow::Result<Option<String>> {
    if let Some(scenario) = &config.storage.active_scenario {
        return Ok(Some(scenario.clone()));
    }
    let pointer = manager.read_pointer().await.map_err(|err| anyhow::anyhow!("{err}"))?;
    Ok(pointer.and_then(|pointer| pointer.test_name))
}

async fn run_scenario_command(
    config: &Config,
    command: ScenarioCommand,
) -> anyhow::Result<ScenarioCommandOutcome> {
    let manager = ScenarioManager::from_config(config)?;

    match command {
        ScenarioCommand::List => {
            let scenarios = manager
                .list_scenarios()
                .await
                .map_err(|err| anyhow::anyhow!("{err}"))?;
            Ok(ScenarioCommandOutcome::Listed {
                scenarios,
                active_scenario: active_scenario(config, &manager).await?,
            })
        }
        ScenarioCommand::Create { name } => {
            manager
                .create_scenario(&name)
                .await
                .map_err(|err| anyhow::anyhow!("{err}"))?;
            Ok(ScenarioCommandOutcome::Created { name })
        }
        ScenarioCommand::Delete { name } => {
            if active_scenario(config, &manager).await?.as_deref() == Some(name.as_str()) {
                bail!("cannot delete active scenario `{name}`");
            }
            manager
                .delete_scenario(&name)
                .await
                .map_err(|err| anyhow::anyhow!("{err}"))?;
            Ok(ScenarioCommandOutcome::Deleted { name })
        }
        ScenarioCommand::Reset { name } => {
            let fixtures_reset = manager
                .reset_served(&name)
                .await
                .map_err(|err| anyhow::anyhow!("{err}"))?;
            Ok(ScenarioCommandOutcome::Reset {
                name,
                fixtures_reset,
            })
        }
        ScenarioCommand::Activate { name } => {
            manager
                .open_scenario(&name)
                .await
                .map_err(|err| anyhow::anyhow!("{err}"))?;
            let pointer = manager
                .read_pointer()
                .await
                .map_err(|err| anyhow::anyhow!("{err}"))?
                .unwrap_or_default();
            manager
                .write_pointer(ScenarioPointer {
                    test_name: Some(name.clone()),
                    ..pointer
                })
                .await
                .map_err(|err| anyhow::anyhow!("{err}"))?;
            Ok(ScenarioCommandOutcome::Activated { name })
        }
    }
}

async fn load_capture(
    format: CaptureFormat,
    source: &std::path::Path,
    excluded_headers: &[String],
) -> Result<CaptureBatch, ReconcileError> {
    match format {
        CaptureFormat::Har => har::load_har(source, excluded_headers).await,
        CaptureFormat::Postman => postman::load_collection(source, excluded_headers).await,
        CaptureFormat::Trace => trace::load_trace(source, excluded_headers).await,
    }
}

async fn run_import_command(config: &Config, args: ImportArgs) -> anyhow::Result<ImportOutcome> {
    let manager = ScenarioManager::from_config(config)?;
    let batch = load_capture(args.format, &args.source, &config.matching.excluded_headers)
        .await
        .map_err(|err| anyhow::anyhow!("{err}"))?;

    let (target, defaults) = match args.scenario.as_deref() {
        Some(name) => {
            let store = match manager.open_scenario(name).await {
                Ok(store) => store,
                Err(StoreError::NotFound(_)) => manager
                    .create_scenario(name)
                    .await
                    .map_err(|err| anyhow::anyhow!("{err}"))?,
                Err(err) => bail!("{err}"),
            };
            (store, Some(manager.default_store()))
        }
        None => (manager.default_store(), None),
    };

    let report = reconcile::reconcile(
        &target,
        defaults.as_ref(),
        batch,
        ReconcileOptions {
            avoid_default_duplicates: args.avoid_default_duplicates,
        },
    )
    .await
    .map_err(|err| anyhow::anyhow!("import {}: {err}", args.source.display()))?;

    Ok(ImportOutcome {
        target: target.label().to_owned(),
        report,
    })
}

fn print_scenario_command_outcome(outcome: ScenarioCommandOutcome) {
    match outcome {
        ScenarioCommandOutcome::Listed {
            scenarios,
            active_scenario,
        } => {
            for scenario in scenarios {
                if active_scenario.as_deref() == Some(scenario.as_str()) {
                    println!("{scenario} (active)");
                } else {
                    println!("{scenario}");
                }
            }
        }
        ScenarioCommandOutcome::Created { name } => {
            println!("created scenario `{name}`");
        }
        ScenarioCommandOutcome::Deleted { name } => {
            println!("deleted scenario `{name}`");
        }
        ScenarioCommandOutcome::Reset {
            name,
            fixtures_reset,
        } => {
            println!("reset {fixtures_reset} served fixture(s) in scenario `{name}`");
        }
        ScenarioCommandOutcome::Activated { name } => {
            println!("activated scenario `{name}`");
        }
    }
}

fn import_summary(outcome: &ImportOutcome) -> String {
    let report = &outcome.report;
    format!(
        "imported into `{}`: created={}, refreshed={}, skipped_defaults={}, total={}",
        outcome.target,
        report.created,
        report.refreshed,
        report.skipped_defaults,
        report.total_fixtures
    )
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            config,
            scenario,
            log_level,
        } => {
            let mut config = Config::load(config.as_deref())?;
            config.apply_active_scenario_override(scenario.as_deref())?;
            logging::init(&config, log_level.as_deref())?;
            let server = mockreplay::server::serve(&config).await?;
            eprintln!("{}", startup_summary(&config, server.listen_addr));
            tokio::signal::ctrl_c().await?;
            server.shutdown().await;
        }
        Command::Scenario { config, action } => {
            let config = Config::load(config.as_deref())?;
            let outcome = run_scenario_command(&config, action).await?;
            print_scenario_command_outcome(outcome);
        }
        Command::Import { config, args } => {
            let config = Config::load(config.as_deref())?;
            logging::init(&config, None)?;
            let outcome = run_import_command(&config, args).await?;
            println!("{}", import_summary(&outcome));
        }
    }

    Ok(())
}

fn startup_summary(config: &Config, listen_addr: SocketAddr) -> String {
    let active_scenario = config
        .storage
        .active_scenario
        .as_deref()
        .unwrap_or("from mockServer.config.json");
    let config_source = config
        .source_path()
        .map(|path| path.display().to_string())
        .unwrap_or_else(|| "defaults".to_owned());

    format!(
        "startup config: listen={}, storage_path={}, active_scenario={}, config={}",
        listen_addr,
        config.storage.path.display(),
        active_scenario,
        config_source
    )
}
