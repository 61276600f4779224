//! tarfetch - bulk HTTP fetcher that packs responses into tar shards
//!
//! Reads a list of URLs, downloads them with a pool of fetch workers and
//! streams the payloads into size-bounded `<prefix><n>.tar` shards.

use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use clap::{Parser, Subcommand};
use comfy_table::{Cell, Color, Table, modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL};
use tarfetch_core::{ProgressContext, fmt_bytes, init_logging, shutdown_flag};

mod cmd;
mod config;

use config::Config;

#[derive(Parser)]
#[command(name = "tarfetch")]
#[command(about = "Fetch URLs in bulk into size-bounded tar shards")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    /// Config file path (default: ./tarfetch.toml or ~/.config/tarfetch/config.toml)
    #[arg(short, long, global = true)]
    config: Option<std::path::PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Fetch every URL of an input list into tar shards
    Run(cmd::run::RunArgs),
    /// List the entries of a stored shard
    Inspect(cmd::inspect::InspectArgs),
    /// Show current configuration
    Config,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let progress = Arc::new(ProgressContext::new());

    // Logging:
    //   TTY:     quiet (warn) unless --debug, the status line shows activity
    //   non-TTY: info unless --debug, logs are the only progress indicator
    let is_tty = progress.is_tty();
    let multi = if is_tty { Some(progress.multi()) } else { None };
    init_logging(is_tty && !cli.debug, cli.debug, multi);

    let config = match cli.config {
        Some(path) => Config::from_file(&path),
        None => Config::load(),
    };
    let config = match config {
        Ok(c) => c,
        Err(e) => {
            log::error!("Configuration error: {e:#}");
            return ExitCode::from(2);
        }
    };

    let result = match cli.command {
        Command::Run(args) => {
            setup_signal_handler();
            cmd::run::run(args, &config, &progress)
        }
        Command::Inspect(args) => cmd::inspect::run(args, &config).map(|()| ExitCode::SUCCESS),
        Command::Config => {
            show_config(&config);
            Ok(ExitCode::SUCCESS)
        }
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            log::error!("Fatal error: {e:#}");
            ExitCode::from(2)
        }
    }
}

fn show_config(config: &Config) {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(vec![
            Cell::new("Setting").fg(Color::Cyan),
            Cell::new("Value").fg(Color::Cyan),
        ]);

    let p = &config.pipeline;
    let h = &config.http;
    let defaults = tarfetch_core::Config::default();
    table.add_row(vec![
        "Store",
        &match &config.store.write_cmd {
            Some(cmd) => format!("command: {cmd}"),
            None => format!("directory: {}", config.store.dir.display()),
        },
    ]);
    table.add_row(vec![
        "Default max shard size",
        &fmt_bytes(defaults.max_shard_size),
    ]);
    table.add_row(vec!["Queue capacity", &p.queue.to_string()]);
    table.add_row(vec![
        "Fetch attempts",
        &format!("{} ({}s apart)", p.fetch_attempts, p.retry_delay),
    ]);
    table.add_row(vec!["Archiver idle", &format!("{}s", p.idle_timeout)]);
    table.add_row(vec![
        "Quiescence",
        &format!("{} idle polls, {}s apart", p.idle_rounds, p.poll_interval),
    ]);
    table.add_row(vec!["PAX namespace", &p.pax_namespace]);
    table.add_row(vec!["Connect timeout", &format!("{}s", h.connect_timeout)]);
    table.add_row(vec!["Read timeout", &format!("{}s", h.read_timeout)]);
    table.add_row(vec![
        "Request timeout",
        &h.request_timeout
            .map_or_else(|| "none".to_string(), |s| format!("{s}s")),
    ]);
    table.add_row(vec!["User agent", &h.user_agent]);

    eprintln!("\n{table}");
}

fn setup_signal_handler() {
    // First signal: set graceful shutdown flag
    // Second signal: force exit
    // SAFETY: AtomicBool::swap and process::exit are async-signal-safe
    let result = unsafe {
        signal_hook::low_level::register(signal_hook::consts::SIGTERM, || {
            if shutdown_flag().swap(true, Ordering::Relaxed) {
                std::process::exit(130);
            }
        })
        .and_then(|_| {
            signal_hook::low_level::register(signal_hook::consts::SIGINT, || {
                if shutdown_flag().swap(true, Ordering::Relaxed) {
                    std::process::exit(130);
                }
            })
        })
    };
    if let Err(e) = result {
        log::warn!("Cannot install signal handlers, Ctrl-C will abort immediately: {e}");
    }
}
