use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::{Keypair, Signer};
use sqlx::{postgres::PgPoolOptions, PgPool};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::approvals::{ApprovalStore, PgApprovalStore};
use crate::config::{Config, NetworkSettings};
use crate::error::{AppError, AppResult};
use crate::gateway::solana::{SolanaGateway, SolanaGatewayConfig};
use crate::gateway::{NetworkProfile, NetworkRegistry};
use crate::settlement::{ApprovalVerifier, SchedulerConfig, SettlementScheduler, TransferExecutor};

/// Connect, migrate and wire the reconciliation stages
pub async fn initialize(config: &Config) -> AppResult<SettlementScheduler> {
    info!("Initializing sweeper components ...");

    let pool = initialize_database(&config.database_url).await?;
    let store: Arc<dyn ApprovalStore> = Arc::new(PgApprovalStore::new(pool));

    info!("⚙️  Initializing ledger gateways...");
    let networks = Arc::new(build_registry(config));
    if networks.registered_networks().is_empty() {
        warn!("⚠️  No networks configured - every record will be skipped");
    }

    let settings = &config.scheduler;
    let verifier = ApprovalVerifier::new(store.clone(), networks.clone())
        .with_batch_size(settings.batch_size)
        .with_max_concurrent_owners(settings.max_concurrent_owners);
    let executor = TransferExecutor::new(store, networks)
        .with_batch_size(settings.batch_size)
        .with_max_concurrent_owners(settings.max_concurrent_owners);

    info!(
        "✅ Stages ready (batch size {}, up to {} owners in parallel)",
        settings.batch_size, settings.max_concurrent_owners
    );

    Ok(SettlementScheduler::new(
        SchedulerConfig::from(settings),
        Arc::new(verifier),
        Arc::new(executor),
    ))
}

/// One gateway per configured network. Networks missing transfer settings
/// are still registered so their claims can be verified.
pub fn build_registry(config: &Config) -> NetworkRegistry {
    let mut registry = NetworkRegistry::new();

    let mut names: Vec<&String> = config.networks.keys().collect();
    names.sort();

    for name in names {
        let settings = &config.networks[name];
        registry.register(network_profile(name, settings));
    }

    registry
}

fn network_profile(name: &str, settings: &NetworkSettings) -> NetworkProfile {
    let mut gateway = SolanaGateway::new(SolanaGatewayConfig {
        rpc_url: settings.rpc_url.clone(),
        ..SolanaGatewayConfig::default()
    });

    match settings.delegate_keypair.as_deref().map(load_keypair) {
        Some(Ok(keypair)) => {
            info!("✅ {} delegate loaded: {}", name, keypair.pubkey());
            gateway = gateway.with_delegate(keypair);
        }
        Some(Err(e)) => {
            error!("❌ {} delegate keypair unusable - transfers disabled: {}", name, e);
        }
        None => {
            warn!("⚠️  {} has no delegate keypair - transfers disabled", name);
        }
    }

    let mut profile = NetworkProfile::new(name, Arc::new(gateway))
        .with_confirmation_timeout(Duration::from_secs(settings.confirmation_timeout_secs))
        .with_pending_expiry(Duration::from_secs(settings.pending_expiry_secs));

    match settings.destination.as_deref().map(str::trim) {
        Some(destination) => match Pubkey::from_str(destination) {
            Ok(_) => profile = profile.with_destination(destination),
            Err(e) => error!(
                "❌ {} destination {} is not a valid address - transfers disabled: {}",
                name, destination, e
            ),
        },
        None => warn!("⚠️  {} has no destination - transfers disabled", name),
    }

    profile
}

/// Parse a keypair given inline as a JSON byte array or as a path to a
/// keypair file in the same format
pub fn load_keypair(source: &str) -> AppResult<Keypair> {
    let trimmed = source.trim();
    let json = if trimmed.starts_with('[') {
        trimmed.to_string()
    } else {
        std::fs::read_to_string(trimmed).map_err(|e| {
            AppError::Config(format!("cannot read keypair file {}: {}", trimmed, e))
        })?
    };

    let bytes: Vec<u8> = serde_json::from_str(&json)
        .map_err(|e| AppError::Config(format!("keypair is not a JSON byte array: {}", e)))?;

    Keypair::try_from(bytes.as_slice())
        .map_err(|e| AppError::Config(format!("invalid keypair bytes: {}", e)))
}

async fn initialize_database(database_url: &str) -> AppResult<PgPool> {
    info!("📊 Connecting to database...");

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .min_connections(1)
        .acquire_timeout(Duration::from_secs(30))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(database_url)
        .await?;

    info!("🔄 Running database migrations...");
    sqlx::migrate!("./migrations").run(&pool).await?;

    info!("✓ Database initialized");
    Ok(pool)
}
