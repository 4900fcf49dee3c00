//! `carscout-cli` – CarScout command line interface
//!
//! This binary runs the scanner in-process over a loopback message bus.  It:
//!
//! 1. Loads `~/.carscout/config.toml`, writing the defaults on first run.
//! 2. Opens the attempt ledger (SQLite file, or in-memory when unset).
//! 3. Starts the scanner task subscribed to the vehicle feed channels.
//! 4. Drops the user into an **interactive console** for registering agents,
//!    publishing feed payloads and answering booking requests.
//! 5. Intercepts **Ctrl-C** and stops the scanner before exiting.

mod config;
mod repl;

use colored::Colorize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::warn;

use carscout_memory::AttemptLedger;
use carscout_middleware::{LoopbackClient, MessageBus};
use carscout_runtime::Scanner;

fn main() {
    // ── Structured logging ────────────────────────────────────────────────
    // RUST_LOG filters (default "info"); CARSCOUT_LOG_FORMAT=json switches to
    // JSON lines; OTEL_EXPORTER_OTLP_ENDPOINT enables span export.
    let _telemetry = carscout_runtime::init_tracing("carscout");

    print_banner();

    // ── Shared shutdown flag ──────────────────────────────────────────────
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();

    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C received – stopping scanner …".yellow().bold());
        shutdown_clone.store(true, Ordering::SeqCst);
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler");
    }

    // ── Configuration ─────────────────────────────────────────────────────
    let (cfg, source) = config::load_or_init();
    let path = config::config_path().display().to_string();
    match source {
        config::ConfigSource::File => println!("  Config loaded from {}", path.bold()),
        config::ConfigSource::Created { save_error: None } => println!(
            "  {} Default config written to {}",
            "✓".green().bold(),
            path.bold()
        ),
        config::ConfigSource::Created {
            save_error: Some(e),
        } => println!("{}: {}", "Error saving config".red(), e),
        config::ConfigSource::Fallback(e) => {
            println!("{}: {}", "Config error".red(), e);
            println!("  Using default configuration.");
        }
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("{}: {}", "Cannot start async runtime".red(), e);
            std::process::exit(1);
        }
    };

    // ── Attempt ledger ────────────────────────────────────────────────────
    let ledger = match cfg.ledger_path.as_deref() {
        Some(path) => AttemptLedger::open(path),
        None => AttemptLedger::open_in_memory(),
    };
    let ledger = match ledger {
        Ok(ledger) => Some(ledger),
        Err(e) => {
            println!("{}: {}", "Ledger unavailable".yellow(), e);
            None
        }
    };

    // ── Scanner ───────────────────────────────────────────────────────────
    let bus = MessageBus::default();
    let client = Arc::new(LoopbackClient::connected(bus.clone()));
    let channels = cfg.channels();
    let handle = match runtime.block_on(Scanner::start(cfg.scanner_config(), client, ledger)) {
        Ok(handle) => handle,
        Err(e) => {
            eprintln!("{}: {}", "Scanner failed to start".red(), e);
            std::process::exit(1);
        }
    };

    println!(
        "  Listening on {} and {} ({} dispatch, {} location(s))",
        channels.vehicle_list().bold(),
        channels.vehicle_delta().bold(),
        cfg.dispatch_mode.to_string().yellow(),
        cfg.locations.len()
    );
    println!();
    println!("  Type {} for a list of commands.\n", "/help".bold().cyan());

    // ── Interactive console ───────────────────────────────────────────────
    let console = repl::Console::new(&runtime, &handle, bus, channels);
    repl::run(console, shutdown);

    if let Err(e) = runtime.block_on(handle.shutdown()) {
        warn!(error = %e, "Scanner did not stop cleanly");
    }
    println!("{}", "  ✓ Scanner stopped.".green());
}

fn print_banner() {
    println!();
    println!("{}", r#"   ______              _____                  __ "#.bold().cyan());
    println!("{}", r#"  / ____/___ ______   / ___/_________  __  __/ /_"#.bold().cyan());
    println!("{}", r#" / /   / __ `/ ___/   \__ \/ ___/ __ \/ / / / __/"#.bold().cyan());
    println!("{}", r#"/ /___/ /_/ / /      ___/ / /__/ /_/ / /_/ / /_  "#.bold().cyan());
    println!("{}", r#"\____/\__,_/_/      /____/\___/\____/\__,_/\__/  "#.bold().cyan());
    println!();
    println!(
        "  {} {}",
        "CarScout".bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  Vehicle feed scanner and reservation dispatcher");
    println!();
}
