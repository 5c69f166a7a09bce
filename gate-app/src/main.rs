//! gatekeep main binary.
//!
//! Admission gate for invite-only chat spaces: users ask through the bot, a pool of
//! delegate accounts verifies and invites them, operators review what needs a human.

mod commands;
mod config;
mod gateway;
mod http_auth;
mod init;
mod notifier;
mod routes;
mod server;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;

#[derive(Debug, Parser)]
#[command(name = "gatekeep", version, about = "Admission gate for invite-only chat spaces")]
struct Cli {
    /// Config file (defaults to ~/.gatekeep/config.toml).
    #[arg(long, global = true, env = "GATEKEEP_CONFIG")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the bot and control API (default).
    Serve,
    /// Initialize ~/.gatekeep with a config template (idempotent).
    Init,
    /// Validate config and check the bot, bridge and delegate pool.
    Doctor,
    /// Show delegate pool, outstanding request and block counts.
    Status,
    /// Seal and register a delegate account credential.
    AddDelegate {
        /// Identity of the account on the platform (phone number or username).
        external_ref: String,
        /// Read the credential from this file instead of stdin.
        #[arg(long)]
        credential_file: Option<PathBuf>,
    },
    /// Take a delegate account out of rotation.
    DeactivateDelegate { id: i64 },
    /// Put a delegate account back into rotation.
    ReactivateDelegate { id: i64 },
    /// List requests waiting on the pipeline or an operator.
    Pending,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing()?;
    install_panic_hook();

    let cli = Cli::parse();
    let config_path = cli.config;

    let command = if let Some(command) = cli.command {
        command
    } else {
        Command::Serve
    };

    match command {
        Command::Serve => server::serve(config_path).await,
        Command::Init => {
            let report = init::initialize_default().await?;
            if report.created.is_empty() {
                println!(
                    "gatekeep init: already initialized at {}",
                    report.root.display()
                );
            } else {
                println!("gatekeep init: initialized {}", report.root.display());
                for path in &report.created {
                    println!("created {}", path.display());
                }
                if !report.skipped.is_empty() {
                    println!("kept {} existing file(s) unchanged", report.skipped.len());
                }
            }
            println!(
                "next: set bot.token, bot.operator_ids and vault.encryption_key in {}",
                report.root.join("config.toml").display()
            );
            Ok(())
        }
        Command::Doctor => server::doctor(config_path).await,
        Command::Status => server::status(config_path).await,
        Command::AddDelegate {
            external_ref,
            credential_file,
        } => server::add_delegate(config_path, &external_ref, credential_file).await,
        Command::DeactivateDelegate { id } => {
            server::set_delegate_active(config_path, id, false).await
        }
        Command::ReactivateDelegate { id } => {
            server::set_delegate_active(config_path, id, true).await
        }
        Command::Pending => server::list_pending(config_path).await,
    }
}

fn init_tracing() -> anyhow::Result<()> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(v) => v,
        Err(_) => EnvFilter::new(
            "info,gatekeep=debug,gate_app=debug,gate_core=debug,gate_platform=debug,tower_http=info",
        ),
    };
    let log_format = std::env::var("GATEKEEP_LOG_FORMAT")
        .unwrap_or_else(|_| "json".to_string())
        .to_ascii_lowercase();

    match log_format.as_str() {
        "json" => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
                .with_target(true)
                .with_thread_ids(true)
                .with_thread_names(true)
                .with_file(true)
                .with_line_number(true)
                .json()
                .flatten_event(true)
                .with_current_span(true)
                .with_span_list(true)
                .init();
        }
        "pretty" => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
                .with_target(true)
                .with_thread_ids(true)
                .with_thread_names(true)
                .with_file(true)
                .with_line_number(true)
                .pretty()
                .init();
        }
        "compact" => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
                .with_target(true)
                .with_thread_ids(true)
                .with_thread_names(true)
                .with_file(true)
                .with_line_number(true)
                .compact()
                .init();
        }
        other => {
            return Err(anyhow::anyhow!(
                "unsupported GATEKEEP_LOG_FORMAT={other:?}; expected one of: json, pretty, compact"
            ));
        }
    }

    tracing::info!(
        log_format = %log_format,
        env_filter = ?std::env::var("RUST_LOG").ok(),
        "tracing initialized"
    );
    Ok(())
}

fn install_panic_hook() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        let location = panic_info
            .location()
            .map(|loc| format!("{}:{}", loc.file(), loc.line()))
            .unwrap_or_else(|| "unknown".to_string());
        let payload = panic_payload_to_string(panic_info.payload());
        tracing::error!(
            panic_location = %location,
            panic_payload = %payload,
            "panic captured"
        );
        default_hook(panic_info);
    }));
}

fn panic_payload_to_string(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        return msg.to_string();
    }
    if let Some(msg) = payload.downcast_ref::<String>() {
        return msg.clone();
    }
    "non-string panic payload".to_string()
}
