//! pagewatch - a declarative web page monitor

use std::sync::mpsc;
use std::sync::Arc;

use clap::Parser;
use colored::Colorize;

use pagewatch::cli::{Cli, Commands};
use pagewatch::error::Result;
use pagewatch::runner::Runner;
use pagewatch::scheduler::{Engine, Scheduler};
use pagewatch::server;
use pagewatch::settings::Settings;
use pagewatch::static_browser::StaticBrowser;
use pagewatch::watch::{self, WatchConfig};
use pagewatch::WatchError;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(e) = run() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::from_env();

    match cli.command.unwrap_or(Commands::Daemon) {
        Commands::Daemon => cmd_daemon(settings),
        Commands::Run => cmd_run(settings),
        Commands::Test { watch, json } => cmd_test(settings, &watch, json),
        Commands::Validate => cmd_validate(settings),
        Commands::List => cmd_list(settings),
    }
}

fn build_runner(settings: Settings) -> Arc<Runner> {
    let browser = Arc::new(StaticBrowser::launch(settings.proxy.clone()));
    Arc::new(Runner::new(settings, browser))
}

/// Launch the scheduler, the status server, and wait for shutdown.
fn cmd_daemon(settings: Settings) -> Result<()> {
    let health_port = settings.health_port;
    let engine = Engine::new(build_runner(settings));
    let (tx, rx) = mpsc::channel();

    server::spawn(engine.clone(), tx, health_port)?;

    let handler_engine = engine.clone();
    ctrlc::set_handler(move || {
        log::info!("shutting down");
        handler_engine.shutdown();
    })
    .map_err(|e| WatchError::ConfigError(format!("Failed to set Ctrl+C handler: {}", e)))?;

    log::info!("pagewatch daemon starting");
    Scheduler::new(engine, rx).run();
    Ok(())
}

/// Check every enabled watch once (for cron-style deployments).
fn cmd_run(settings: Settings) -> Result<()> {
    let config_dir = settings.config_dir.clone();
    let runner = build_runner(settings);
    let (configs, rejected) = watch::load_config_dir(&config_dir);
    report_rejected(&rejected);

    let enabled: Vec<_> = configs.into_iter().filter(|w| w.enabled).collect();
    if enabled.is_empty() {
        println!("No active watches in {}.", config_dir.display());
        return Ok(());
    }

    println!("Checking {} watch(es)...\n", enabled.len());
    for config in &enabled {
        let outcome = runner.run(config);
        let status = if outcome.success {
            match outcome.changes.as_ref().map(|c| c.len()).unwrap_or(0) {
                0 => "no change".dimmed().to_string(),
                n => format!("{} change(s)", n).green().bold().to_string(),
            }
        } else {
            format!("failed: {}", outcome.error.as_deref().unwrap_or("?"))
                .red()
                .to_string()
        };
        println!("  {} - {}", config.name, status);
    }
    Ok(())
}

/// Dry-run one watch: no notifications, verbose outcome.
fn cmd_test(settings: Settings, id_or_name: &str, json: bool) -> Result<()> {
    let config_dir = settings.config_dir.clone();
    let runner = build_runner(settings);
    let (configs, rejected) = watch::load_config_dir(&config_dir);
    report_rejected(&rejected);

    let config = find_watch(&configs, id_or_name)?;
    if !json {
        println!("\nTesting watch: {}\n", config.name);
        println!("  Fetching {}...", config.url);
    }

    let outcome = runner.run_with_options(config, false);

    if json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
        return Ok(());
    }

    if let Some(data) = &outcome.data {
        println!("  Extracted {} field(s):", data.len());
        for (name, value) in data {
            println!("    {} = {}", name, value);
        }
    }
    match (&outcome.changes, outcome.success) {
        (Some(changes), _) if !changes.is_empty() => {
            println!("\n  {}", "CHANGE DETECTED".green().bold());
            for change in changes {
                println!(
                    "    {} ({}): {} → {}",
                    change.name, change.comparator, change.previous, change.current
                );
            }
        }
        (Some(_), _) => println!("\n  No change detected."),
        (None, true) => {
            println!("\n  This is the first run (no previous snapshot to compare).")
        }
        (None, false) => println!(
            "\n  {} {}",
            "Run failed:".red(),
            outcome.error.as_deref().unwrap_or("unknown error")
        ),
    }
    Ok(())
}

fn cmd_validate(settings: Settings) -> Result<()> {
    let (configs, rejected) = watch::load_config_dir(&settings.config_dir);

    for config in &configs {
        println!(
            "  {} {} ({})",
            "ok".green(),
            config.name,
            config
                .source_file
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default()
        );
    }
    for (path, error) in &rejected {
        println!("  {} {}: {}", "rejected".red().bold(), path.display(), error);
    }
    println!(
        "\n{} valid, {} rejected.",
        configs.len(),
        rejected.len()
    );
    if rejected.is_empty() {
        Ok(())
    } else {
        Err(WatchError::ConfigError(format!(
            "{} invalid watch document(s)",
            rejected.len()
        )))
    }
}

fn cmd_list(settings: Settings) -> Result<()> {
    let (configs, rejected) = watch::load_config_dir(&settings.config_dir);
    report_rejected(&rejected);

    if configs.is_empty() {
        println!("No watches in {}.", settings.config_dir.display());
        return Ok(());
    }

    println!();
    for config in &configs {
        let schedule = match (&config.schedule, config.interval) {
            (Some(cron), _) => format!("cron \"{}\"", cron),
            (None, Some(ms)) => format!("every {}ms", ms),
            (None, None) => format!("every {}ms", settings.check_interval_ms),
        };
        let state = if config.enabled {
            "enabled".green().to_string()
        } else {
            "paused".yellow().to_string()
        };
        println!(
            "  {} [{}] {} - {} ({})",
            config.name,
            config.watch_id(),
            state,
            config.url,
            schedule
        );
    }
    Ok(())
}

fn find_watch<'a>(configs: &'a [WatchConfig], id_or_name: &str) -> Result<&'a WatchConfig> {
    configs
        .iter()
        .find(|c| c.watch_id() == id_or_name || c.name == id_or_name)
        .ok_or_else(|| WatchError::WatchNotFound(id_or_name.to_string()))
}

fn report_rejected(rejected: &[(std::path::PathBuf, WatchError)]) {
    for (path, error) in rejected {
        eprintln!("  [WARN] rejected config {}: {}", path.display(), error);
    }
}
