use clap::{Parser, Subcommand};
use netlab::config;
use netlab::telemetry::init_logging;
use netlab::Engine;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

#[derive(Parser)]
#[command(name = "netlab")]
#[command(about = "Deterministic namespace forwarding emulator")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check a scenario file without building it
    Validate {
        /// Path to the scenario file
        #[arg(short, long, default_value = "scenario.toml")]
        config: PathBuf,
    },
    /// Build a scenario and print its state as TOML
    Export {
        /// Path to the scenario file
        #[arg(short, long, default_value = "scenario.toml")]
        config: PathBuf,

        /// Advance the logical clock before exporting
        #[arg(long, default_value_t = 0)]
        advance_ms: u64,

        /// Write to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Validate { config } => {
            init_logging(None);
            cmd_validate(&config)
        }
        Commands::Export {
            config,
            advance_ms,
            output,
        } => cmd_export(&config, advance_ms, output.as_deref()),
    };

    if let Err(e) = result {
        eprintln!("[ERROR] {}", e);
        std::process::exit(1);
    }
}

fn cmd_validate(config_path: &Path) -> Result<(), String> {
    info!("Validating {}...", config_path.display());

    let config = config::load(config_path).map_err(|e| e.to_string())?;
    let validation = config::validate(&config);
    validation.print_diagnostics();

    if validation.has_errors() {
        return Err(format!(
            "Validation failed with {} error(s)",
            validation.errors.len()
        ));
    }

    println!(
        "{}: OK ({} namespaces, {} interfaces, {} links, {} bridges, {} routes)",
        config_path.display(),
        config.namespaces.len(),
        config.interfaces.len(),
        config.links.len(),
        config.bridges.len(),
        config.routes.len()
    );
    Ok(())
}

fn cmd_export(config_path: &Path, advance_ms: u64, output: Option<&Path>) -> Result<(), String> {
    let config = config::load(config_path).map_err(|e| e.to_string())?;
    init_logging(Some(&config.log));
    info!("Loaded {}", config_path.display());

    let (engine, _names) = Engine::from_config(&config).map_err(|e| e.to_string())?;
    if advance_ms > 0 {
        let report = engine.advance(Duration::from_millis(advance_ms));
        info!(
            "Advanced {}ms: {} transmitted, {} dropped",
            advance_ms,
            report.transmitted,
            report.drops.len()
        );
    }

    let text = engine.export().to_toml().map_err(|e| e.to_string())?;
    match output {
        Some(path) => {
            std::fs::write(path, text)
                .map_err(|e| format!("Failed to write {}: {}", path.display(), e))?;
            info!("Snapshot written to {}", path.display());
        }
        None => print!("{}", text),
    }
    Ok(())
}
