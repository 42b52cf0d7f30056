use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};
use wager_core::{Caller, Role, StorageConfig, WagerEngineConfig};
use wager_service::scheduler::{spawn_backup_loop, spawn_regulatory_loop};
use wager_service::{build_router, BackupSettings, ServiceConfig, ServiceState};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StorageMode {
    Auto,
    Memory,
    Postgres,
}

#[derive(Debug, Parser)]
#[command(name = "wagerd", version, about = "Wager platform REST service")]
struct Cli {
    /// REST socket address to bind, e.g. 127.0.0.1:8095
    #[arg(long, default_value = "127.0.0.1:8095")]
    listen: SocketAddr,
    /// Persistence backend. `auto` picks postgres when a database url is configured.
    #[arg(long, value_enum, default_value_t = StorageMode::Auto, env = "WAGER_STORAGE")]
    storage: StorageMode,
    #[arg(long, env = "WAGER_DATABASE_URL")]
    database_url: Option<String>,
    #[arg(long, default_value_t = 10, env = "WAGER_PG_MAX_CONNECTIONS")]
    pg_max_connections: u32,
    /// Seconds between regulatory escrow checks.
    #[arg(long, default_value_t = 300)]
    regulatory_interval_secs: u64,
    /// Platform float seeded into an empty store, in minor units.
    #[arg(long, default_value_t = 0, env = "WAGER_PLATFORM_FLOAT")]
    platform_float: i64,
    /// Directory for encrypted backups; scheduled backups are off without it.
    #[arg(long, env = "WAGER_BACKUP_DIR")]
    backup_dir: Option<PathBuf>,
    #[arg(long, default_value_t = 3_600)]
    backup_interval_secs: u64,
    #[arg(long, env = "WAGER_BACKUP_PASSPHRASE")]
    backup_passphrase: Option<String>,
    /// Restore this backup file into the store before serving.
    #[arg(long)]
    restore_from: Option<PathBuf>,
    #[arg(long, env = "WAGER_SMS_GATEWAY_URL")]
    sms_gateway_url: Option<String>,
    #[arg(long, env = "WAGER_TICKET_DESK_URL")]
    ticket_desk_url: Option<String>,
    /// Grant superadmin to this user id at startup.
    #[arg(long, env = "WAGER_BOOTSTRAP_SUPERADMIN")]
    bootstrap_superadmin: Option<String>,
}

fn resolve_storage(cli: &Cli) -> anyhow::Result<StorageConfig> {
    let resolved_url = cli
        .database_url
        .clone()
        .or_else(|| std::env::var("DATABASE_URL").ok());

    let storage = match cli.storage {
        StorageMode::Memory => StorageConfig::Memory,
        StorageMode::Postgres => {
            let database_url = resolved_url.ok_or_else(|| {
                anyhow::anyhow!("storage=postgres requires --database-url or DATABASE_URL")
            })?;
            StorageConfig::postgres(database_url, cli.pg_max_connections)
        }
        StorageMode::Auto => match resolved_url {
            Some(database_url) => StorageConfig::postgres(database_url, cli.pg_max_connections),
            None => StorageConfig::Memory,
        },
    };
    Ok(storage)
}

fn resolve_backup(cli: &Cli) -> anyhow::Result<Option<BackupSettings>> {
    match (&cli.backup_dir, &cli.backup_passphrase) {
        (Some(directory), Some(passphrase)) => Ok(Some(BackupSettings {
            directory: directory.clone(),
            passphrase: passphrase.clone(),
        })),
        (Some(_), None) => Err(anyhow::anyhow!(
            "--backup-dir requires --backup-passphrase or WAGER_BACKUP_PASSPHRASE"
        )),
        (None, _) => Ok(None),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| {
            "wager_service=info,wager_core=info,wager_adapters=info,info".to_string()
        }))
        .init();

    let cli = Cli::parse();
    let mut engine = WagerEngineConfig {
        storage: resolve_storage(&cli)?,
        ..WagerEngineConfig::default()
    };
    engine.regulatory.initial_platform_float = cli.platform_float;

    let config = ServiceConfig {
        engine,
        sms_gateway_url: cli.sms_gateway_url.clone(),
        ticket_desk_url: cli.ticket_desk_url.clone(),
        backup: resolve_backup(&cli)?,
        odds_book: None,
    };
    let state = ServiceState::bootstrap(config).await?;

    if let Some(path) = &cli.restore_from {
        let manager = state
            .backups
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("--restore-from requires backup settings"))?;
        let report = manager.restore(path).await?;
        if !report.is_clean() {
            warn!(failed = ?report.failed_tables(), "restore finished with failed tables");
        }
    }

    if let Some(user_id) = &cli.bootstrap_superadmin {
        state
            .engine
            .admin()
            .elevate_role(&Caller::system(), user_id, Role::Superadmin)
            .await?;
    }

    spawn_regulatory_loop(
        state.engine.regulatory().clone(),
        Duration::from_secs(cli.regulatory_interval_secs.max(1)),
    );
    if let Some(backups) = state.backups.clone() {
        spawn_backup_loop(backups, Duration::from_secs(cli.backup_interval_secs.max(60)));
    }

    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(cli.listen).await?;
    info!("wager-service REST listening on {}", listener.local_addr()?);
    axum::serve(listener, app).await?;
    Ok(())
}
