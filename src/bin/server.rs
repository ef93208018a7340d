use anyhow::Context;
use clap::Parser;
use drivesplit::api::create_api_server;
use drivesplit::config::VaultConfig;
use drivesplit::metadata::MetadataStore;
use drivesplit::metrics::install_recorder;
use drivesplit::storage::LocalDirStorage;
use drivesplit::vault::Vault;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Split files across linked storage accounts and reassemble them on demand
#[derive(Parser, Debug)]
#[command(name = "drivesplit-server", version, about)]
struct Args {
    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to listen on, overrides the configuration
    #[arg(short, long)]
    listen: Option<String>,

    /// SQLite database URL, overrides the configuration
    #[arg(long)]
    database_url: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "drivesplit=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let mut config = VaultConfig::load(args.config.as_deref()).context("loading configuration")?;
    if let Some(listen) = args.listen {
        config.listen_addr = listen;
    }
    if let Some(url) = args.database_url {
        config.database_url = url;
    }
    config.validate().context("validating configuration")?;

    install_recorder().context("installing metrics recorder")?;

    let storage = Arc::new(LocalDirStorage::new(&config.storage_root));
    for account in &config.storage_accounts {
        storage
            .add_account(&account.account_id, account.quota_bytes)
            .await
            .with_context(|| format!("preparing storage account {}", account.account_id))?;
    }
    tracing::info!(
        root = %config.storage_root.display(),
        accounts = config.storage_accounts.len(),
        "Storage accounts ready"
    );

    let store = MetadataStore::new(&config.database_url)
        .await
        .with_context(|| format!("opening metadata store {}", config.database_url))?;

    let listen_addr = config.listen_addr.clone();
    let vault = Vault::new(config, Arc::new(store), storage).context("starting vault")?;
    let app = create_api_server(Arc::new(vault));

    let listener = tokio::net::TcpListener::bind(&listen_addr)
        .await
        .with_context(|| format!("binding {listen_addr}"))?;
    tracing::info!(address = %listen_addr, "drivesplit server listening");

    axum::serve(listener, app).await.context("serving HTTP")?;
    Ok(())
}
