//! Command-line entrypoint: `serve` runs the gateway; `keys` manages the
//! encryption ring; `weights` manages ranking weights.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{info, warn};

use crate::auth::{AuthService, HmacTokenService, SqliteAccountStore};
use crate::chat::{ChatService, ChatStore, SqliteChatStore};
use crate::config::{Config, load_config};
use crate::consent::InMemoryConsentOracle;
use crate::crypto::{FieldCipher, KeyRing, is_encrypted};
use crate::errors::TetherError;
use crate::gateway::{AppState, RateLimits};
use crate::health::{
    CacheChecker, DatabaseChecker, HttpChecker, InMemoryKeyValueStore, Supervisor,
    SupervisorConfig,
};
use crate::providers::HttpSummarizer;
use crate::ranking::{RankingEngine, SqliteWeightStore, WeightManager};
use crate::realtime::{RealtimeServer, SocketRegistry};
use crate::retry::{Retrier, RetryConfig};

#[derive(Parser)]
#[command(name = "tether", version, about = "Realtime chat and discovery backend")]
struct Cli {
    /// Path to a JSON config file. Environment variables win over it.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the gateway (default).
    Serve,
    /// Encryption key ring operations.
    Keys {
        #[command(subcommand)]
        action: KeysAction,
    },
    /// Ranking weight operations.
    Weights {
        #[command(subcommand)]
        action: WeightsAction,
    },
}

#[derive(Subcommand)]
enum KeysAction {
    /// Round-trip a probe plaintext through every key in the ring.
    Validate,
    /// Re-encrypt stored sensitive fields under the current key version.
    Migrate,
}

#[derive(Subcommand)]
enum WeightsAction {
    /// Restore the default ranking weights.
    Reset,
}

/// Returns the process exit code: 0 clean, 2 unrecoverable shutdown
/// error. Startup failures bubble as `Err` and exit 1.
pub async fn run() -> anyhow::Result<u8> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
        Command::Keys { action } => keys(config, action).await.map(|()| 0),
        Command::Weights { action } => weights(config, action).await.map(|()| 0),
    }
}

fn build_cipher(config: &Config) -> anyhow::Result<Arc<FieldCipher>> {
    let ring = KeyRing::new(config.encryption.version, config.encryption.key.clone())?;
    let cipher = FieldCipher::new(ring, config.legacy_fallback());
    for (version, key) in &config.encryption.legacy_keys {
        cipher.add_legacy(*version, key.clone())?;
    }
    Ok(Arc::new(cipher))
}

async fn serve(config: Config) -> anyhow::Result<u8> {
    let cipher = build_cipher(&config)?;
    cipher.validate_all()?;

    let chat_store = Arc::new(SqliteChatStore::open(&config.chat.db_path)?);
    let account_store = Arc::new(SqliteAccountStore::open(&config.chat.db_path)?);
    let weight_store = Arc::new(SqliteWeightStore::open(&config.chat.db_path)?);

    let tokens = Arc::new(HmacTokenService::new(
        config.auth.jwt_secret.clone(),
        chrono::Duration::minutes(config.auth.access_ttl_minutes),
    )?);
    let auth = Arc::new(AuthService::new(
        account_store,
        tokens.clone(),
        chrono::Duration::days(config.auth.refresh_ttl_days),
    ));
    let chat = Arc::new(ChatService::new(
        chat_store.clone(),
        cipher.clone(),
        config.chat.max_message_len,
    ));

    let registry = Arc::new(SocketRegistry::new());
    let http_client = reqwest::Client::new();

    let mut supervisor_builder = Supervisor::new(SupervisorConfig {
        probe_interval: Duration::from_secs(config.health.probe_interval_secs),
        checker_deadline: Duration::from_secs(config.health.checker_deadline_secs),
        shutdown_timeout: Duration::from_secs(config.health.shutdown_timeout_secs),
        // The serve loop below owns signal handling so it can report
        // the shutdown outcome in the exit code.
        install_signal_handlers: false,
    })
    .with_checker(Arc::new(DatabaseChecker::new(chat_store.clone())))
    .with_checker(Arc::new(CacheChecker::new(Arc::new(
        InMemoryKeyValueStore::default(),
    ))));
    for url in &config.health.dependency_urls {
        supervisor_builder = supervisor_builder.with_checker(Arc::new(HttpChecker::new(
            url.clone(),
            http_client.clone(),
            url.clone(),
            2,
        )));
    }
    let registry_for_shutdown = registry.clone();
    let supervisor = supervisor_builder
        .on_shutdown(move || {
            let registry = registry_for_shutdown.clone();
            Box::pin(async move {
                registry.drain();
                Ok(())
            })
        })
        .build();

    let realtime = Arc::new(RealtimeServer::new(
        chat.clone(),
        registry,
        tokens.clone(),
        supervisor.cancellation_token(),
    ));
    let weights = Arc::new(WeightManager::new(weight_store));
    let ranking = Arc::new(RankingEngine::new(weights.clone()));
    let limits = Arc::new(RateLimits::new(&config.rate_limit)?);

    let summarizer = config.summarizer.url.as_ref().map(|url| {
        Arc::new(HttpSummarizer::new(
            http_client.clone(),
            url.clone(),
            Arc::new(Retrier::new(RetryConfig::aggressive())),
            supervisor.cancellation_token(),
            Duration::from_secs(config.summarizer.timeout_secs),
        )) as Arc<dyn crate::providers::Summarizer>
    });

    let state = AppState {
        environment: config.environment,
        auth,
        tokens,
        chat,
        realtime,
        supervisor: supervisor.clone(),
        summarizer,
        consent: Arc::new(InMemoryConsentOracle::default()),
        weights,
        ranking,
        limits,
        summary_last_n: config.summarizer.last_n_messages,
    };

    supervisor.start();
    let (server_task, addr) = crate::gateway::start(state, &config.gateway.host, config.gateway.port).await?;
    println!("tether gateway listening on {}", addr);

    shutdown_signal().await;
    info!("termination signal received, shutting down");

    let shutdown_result = supervisor.shutdown().await;
    let _ = server_task.await;

    match shutdown_result {
        Ok(()) => {
            info!("shutdown complete");
            Ok(0)
        }
        Err(e) => {
            warn!("shutdown did not complete cleanly: {}", e);
            Ok(2)
        }
    }
}

async fn keys(config: Config, action: KeysAction) -> anyhow::Result<()> {
    let cipher = build_cipher(&config)?;
    match action {
        KeysAction::Validate => {
            cipher.validate_all()?;
            println!(
                "key ring ok: current version {}, {} legacy key(s)",
                cipher.current_version(),
                config.encryption.legacy_keys.len()
            );
        }
        KeysAction::Migrate => {
            let store = SqliteChatStore::open(&config.chat.db_path)?;
            let contents = store.message_contents().await?;
            let mut migrated = 0u64;
            let mut skipped = 0u64;
            let mut failed = 0u64;
            for (id, content) in contents {
                if !is_encrypted(&content) {
                    skipped += 1;
                    continue;
                }
                match cipher.migrate(&content) {
                    Ok(resealed) => {
                        store.update_message_content(id, &resealed).await?;
                        migrated += 1;
                    }
                    Err(e) => {
                        // Per-record failures are counted, not fatal; the
                        // batch keeps going.
                        warn!("message {}: {}", id, e);
                        failed += 1;
                    }
                }
            }
            println!(
                "migration done: {} re-encrypted, {} skipped, {} failed",
                migrated, skipped, failed
            );
            if failed > 0 {
                return Err(TetherError::transient(
                    format!("{} record(s) failed to migrate", failed),
                    None,
                )
                .into());
            }
        }
    }
    Ok(())
}

async fn weights(config: Config, action: WeightsAction) -> anyhow::Result<()> {
    let store = Arc::new(SqliteWeightStore::open(&config.chat.db_path)?);
    let manager = WeightManager::new(store);
    match action {
        WeightsAction::Reset => {
            let weights = manager.reset().await?;
            println!(
                "weights reset: semantic={} interest={} geo={} recency={}",
                weights.semantic, weights.interest, weights.geo, weights.recency
            );
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut term =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(term) => term,
                Err(e) => {
                    warn!("cannot install SIGTERM handler: {}", e);
                    let _ = tokio::signal::ctrl_c().await;
                    return;
                }
            };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
