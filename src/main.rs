//! `keybridged` — workstation daemon that delegates SSH/PKCS#11 private-key
//! operations to a paired phone.
//!
//! This is the binary entry point; the core logic lives in the library
//! crate (`enclave`, `agent`, `hostauth`, `pairing`, ...).

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;

use keybridge::config::Config;
use keybridge::device::Device;
use keybridge::enclave::EnclaveClient;
use keybridge::hostauth::HostAuthIntake;
use keybridge::notifier::Notifier;
use keybridge::pairing::{FilePersister, Persister};
use keybridge::transport::cloud::CloudTransport;
use keybridge::transport::Transport;

/// Global allocator configured per M-MIMALLOC-APPS guideline.
/// mimalloc provides better multi-threaded performance than the system allocator.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Global flag for signal-triggered shutdown (as Arc for signal-hook compatibility)
static SHUTDOWN_FLAG: std::sync::LazyLock<Arc<AtomicBool>> =
    std::sync::LazyLock::new(|| Arc::new(AtomicBool::new(false)));

#[derive(Parser)]
#[command(name = "keybridged")]
#[command(version)]
#[command(about = "Workstation daemon that delegates SSH key operations to a paired phone")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon in the foreground (the default).
    Run,
    /// Generate a fresh pairing and print the identifier to share with the phone.
    Pair,
    /// Tear down the current pairing.
    Unpair,
    /// Print whether a pairing is installed and the cached profile, if any.
    Status,
    /// Print the cached public identity as JSON.
    Me,
}

fn init_logging(config: &Config) {
    use keybridge::config::LogTarget;

    match config.log_target {
        LogTarget::Stderr => {
            env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
                .format_timestamp_secs()
                .init();
        }
        LogTarget::Syslog => {
            env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
                .format_timestamp_secs()
                .init();
            log::warn!("KEYBRIDGE_LOG_TARGET=syslog requested but no syslog backend is linked in; falling back to stderr");
        }
    }
}

fn register_signal_handlers() -> Result<()> {
    use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
    use signal_hook::flag;
    flag::register(SIGINT, Arc::clone(&SHUTDOWN_FLAG))?;
    flag::register(SIGTERM, Arc::clone(&SHUTDOWN_FLAG))?;
    flag::register(SIGHUP, Arc::clone(&SHUTDOWN_FLAG))?;
    Ok(())
}

/// Build the transport set for a freshly (re)installed pairing: a cloud
/// queue bound to that pairing's deterministic queue names. No real
/// `QueueClient` is wired in here (see [`keybridge::transport::cloud`]);
/// the transport reports itself unreachable until one is, so sends fall
/// back to the bounded outbox rather than failing outright.
fn transport_factory(secret: &keybridge::pairing::PairingSecret) -> Vec<Arc<dyn Transport>> {
    vec![Arc::new(CloudTransport::unconfigured(
        secret.send_queue_name(),
        secret.receive_queue_name(),
    ))]
}

fn build_enclave_client(config: &Config) -> Result<Arc<EnclaveClient>> {
    let device = Arc::new(Device::load_or_create().context("failed to load device identity")?);
    let persister: Arc<dyn Persister> =
        Arc::new(FilePersister::new(config.state_dir.join("pairing.json")));

    EnclaveClient::new(
        device,
        persister,
        Box::new(transport_factory),
        config.timeouts.clone(),
        config.caps.clone(),
    )
    .context("failed to construct enclave client")
}

async fn run_daemon(config: Config) -> Result<()> {
    register_signal_handlers()?;

    let enclave = build_enclave_client(&config)?;
    let hostauth = Arc::new(HostAuthIntake::new(&config.caps));
    let notifier = Arc::new(Notifier::new(config.suppress_color));

    let adapter = Arc::new(keybridge::agent::AgentAdapter::new(
        Arc::clone(&enclave),
        Arc::clone(&hostauth),
        notifier,
        config.fallback_agent_socket_path.clone(),
    ));

    let agent_socket_path = config.agent_socket_path.clone();
    let agent_task = tokio::spawn(async move { adapter.serve(agent_socket_path).await });

    let hostauth_socket_path = config.hostauth_socket_path.clone();
    let hostauth_task =
        tokio::spawn(async move { keybridge::hostauth::serve(hostauth_socket_path, hostauth).await });

    log::info!(
        "keybridged listening: agent={} hostauth={}",
        config.agent_socket_path.display(),
        config.hostauth_socket_path.display()
    );

    while !SHUTDOWN_FLAG.load(std::sync::atomic::Ordering::Relaxed) {
        if agent_task.is_finished() || hostauth_task.is_finished() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }

    log::info!("shutting down");
    std::fs::remove_file(&config.agent_socket_path).ok();
    std::fs::remove_file(&config.hostauth_socket_path).ok();
    agent_task.abort();
    hostauth_task.abort();

    Ok(())
}

fn cmd_pair(config: &Config) -> Result<()> {
    let enclave = build_enclave_client(config)?;
    let pairing_id = enclave.pair()?;
    println!("New pairing generated: {pairing_id}");
    println!("Share this identifier with the phone to complete pairing.");
    Ok(())
}

fn cmd_unpair(config: &Config) -> Result<()> {
    let enclave = build_enclave_client(config)?;
    enclave.unpair()?;
    println!("Pairing removed.");
    Ok(())
}

fn cmd_status(config: &Config) -> Result<()> {
    let enclave = build_enclave_client(config)?;
    println!("paired: {}", enclave.is_paired());
    match enclave.get_cached_me() {
        Some(me) => println!("cached profile: {}", serde_json::to_string_pretty(&me)?),
        None => println!("no cached profile yet"),
    }
    Ok(())
}

fn cmd_me(config: &Config) -> Result<()> {
    let enclave = build_enclave_client(config)?;
    match enclave.get_cached_me() {
        Some(me) => println!("{}", serde_json::to_string_pretty(&me)?),
        None => anyhow::bail!("no cached profile; pair and perform at least one request first"),
    }
    Ok(())
}

fn main() -> Result<()> {
    let config = Config::load()?;
    init_logging(&config);

    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let runtime = tokio::runtime::Runtime::new().context("failed to start async runtime")?;
            runtime.block_on(run_daemon(config))?;
        }
        Commands::Pair => cmd_pair(&config)?,
        Commands::Unpair => cmd_unpair(&config)?,
        Commands::Status => cmd_status(&config)?,
        Commands::Me => cmd_me(&config)?,
    }

    Ok(())
}
