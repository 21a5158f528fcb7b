use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use credgate::config::{load_config, GateConfig};
use credgate::credentials::{ActorType, Codec, Identity};
use credgate::Gate;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Parser)]
#[command(name = "credgate")]
#[command(about = "Credential lifecycle and execution gating")]
struct Args {
    /// TOML config file; without one, defaults plus CREDGATE_* overrides apply
    #[arg(short, long)]
    config: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run maintenance until interrupted (default)
    Serve {
        /// Seconds between maintenance passes
        #[arg(long, default_value_t = 60)]
        maintenance_secs: u64,
    },
    /// Open every backend once and report their state
    Check,
    /// List stored credentials and their expiry
    List,
    /// Delete one stored credential
    Revoke {
        provider: String,
        workspace_id: String,
        actor_id: String,
        #[arg(long, default_value = "user")]
        actor_type: ActorType,
    },
    /// Print a fresh base64 encryption key
    GenerateKey,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "credgate=info".into()),
        )
        .init();

    let args = Args::parse();
    let command = args.command.unwrap_or(Command::Serve { maintenance_secs: 60 });

    if let Command::GenerateKey = command {
        println!("{}", Codec::generate_key_base64());
        return Ok(());
    }

    let config = match &args.config {
        Some(path) => load_config(path)?,
        None => GateConfig::default().apply_env(),
    };

    // Operator commands never execute actions, so no adapters are registered
    let gate = Gate::connect(config, vec![])
        .await
        .context("Failed to start credential gate")?;

    match command {
        Command::Serve { maintenance_secs } => serve(Arc::new(gate), maintenance_secs).await,
        Command::Check => {
            let credentials = gate.store.list_all()?;
            println!("database:     ok ({} credentials)", credentials.len());
            println!(
                "cache:        {}",
                match gate.store.cache() {
                    None => "disabled",
                    Some(_) if gate.store.cache_degraded() => "degraded",
                    Some(_) => "ok",
                }
            );
            println!("rate limit:   {}", gate.limiter.strategy());
            println!("actions:      {}", gate.gateway.registry().ids().join(", "));
            Ok(())
        }
        Command::List => {
            let now = Utc::now();
            for (identity, expires_at) in gate.store.list_all()? {
                let remaining = expires_at - now;
                let status = if remaining <= chrono::Duration::zero() {
                    "expired".to_string()
                } else {
                    format!("{}m left", remaining.num_minutes())
                };
                println!("{}\t{}\t{}", identity, expires_at.to_rfc3339(), status);
            }
            Ok(())
        }
        Command::Revoke {
            provider,
            workspace_id,
            actor_id,
            actor_type,
        } => {
            let identity = Identity::new(provider, workspace_id, actor_type, actor_id);
            if gate.store.delete(&identity).await? {
                println!("revoked {}", identity);
            } else {
                println!("no credential stored for {}", identity);
            }
            Ok(())
        }
        Command::GenerateKey => Ok(()),
    }
}

async fn serve(gate: Arc<Gate>, maintenance_secs: u64) -> Result<()> {
    let maintenance = gate.spawn_maintenance(Duration::from_secs(maintenance_secs.max(1)));
    info!(maintenance_secs, "credgate running");

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl_c signal")?;
    info!("Shutdown signal received");

    maintenance.abort();
    info!("credgate stopped");
    Ok(())
}
