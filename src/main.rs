use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use zeroize::Zeroizing;

use gitauth::cache::{spawn_invalidation_listener, LookupCache};
use gitauth::manager::CredentialManager;
use gitauth::pubsub::{InvalidationBus, LocalBus, RedisBus};
use gitauth::ssh_keys::CreateSshKeyRequest;
use gitauth::store::memory::MemoryStore;
use gitauth::store::postgres::PgStore;
use gitauth::store::CredentialStore;
use gitauth::tokens::CreateTokenRequest;
use gitauth::{api, cli, config, jobs, startup, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use opentelemetry::KeyValue;
    use opentelemetry_sdk::{trace as sdktrace, Resource};

    let telemetry_layer = if std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").is_ok() {
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(opentelemetry_otlp::new_exporter().tonic())
            .with_trace_config(sdktrace::config().with_resource(Resource::new(vec![
                KeyValue::new("service.name", "gitauth"),
            ])))
            .install_batch(opentelemetry_sdk::runtime::Tokio)
            .context("failed to install OpenTelemetry tracer")?;
        Some(tracing_opentelemetry::layer().with_tracer(tracer))
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "gitauth=info,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .with(telemetry_layer)
        .init();

    let args = cli::Cli::parse();
    let cfg = config::load()?;
    startup::validate_config(&cfg)?;

    let result = match args.command {
        Some(cli::Commands::Serve { port }) => {
            let port = port.unwrap_or(cfg.port);
            run_server(cfg, port).await
        }
        Some(cli::Commands::CheckConfig) => check_config(&cfg),
        Some(cli::Commands::Token { command }) => {
            let (manager, _) = build_manager(&cfg).await?;
            handle_token_command(command, &manager).await
        }
        Some(cli::Commands::SshKey { command }) => {
            let (manager, _) = build_manager(&cfg).await?;
            handle_ssh_key_command(command, &manager).await
        }
        None => {
            let port = cfg.port;
            run_server(cfg, port).await
        }
    };

    if let Err(ref e) = result {
        eprintln!("Error: {:?}", e);
    }
    result
}

/// Connects the store and the invalidation bus and builds the manager.
/// Unset URLs fall back to in-process implementations.
async fn build_manager(
    cfg: &config::Config,
) -> anyhow::Result<(Arc<CredentialManager>, Arc<dyn InvalidationBus>)> {
    let algorithm = startup::assert_hash_availability(cfg)?;

    let store: Arc<dyn CredentialStore> = match cfg.database_url.as_deref() {
        Some(url) => {
            tracing::info!("Connecting to database...");
            let db = PgStore::connect(url).await?;
            tracing::info!("Running migrations...");
            db.migrate().await?;
            Arc::new(db)
        }
        None => {
            tracing::warn!("DATABASE_URL not set, credentials are kept in memory only");
            Arc::new(MemoryStore::new())
        }
    };

    let bus: Arc<dyn InvalidationBus> = match cfg.redis_url.as_deref() {
        Some(url) => {
            tracing::info!("Connecting to Redis...");
            Arc::new(RedisBus::connect(url).await?)
        }
        None => {
            tracing::info!("REDIS_URL not set, cache invalidation stays in-process");
            Arc::new(LocalBus::new())
        }
    };

    let manager = CredentialManager::new(cfg, algorithm, store, bus.clone(), LookupCache::new())?;
    Ok((Arc::new(manager), bus))
}

async fn run_server(cfg: config::Config, port: u16) -> anyhow::Result<()> {
    let (manager, bus) = build_manager(&cfg).await?;

    spawn_invalidation_listener(
        manager.cache().clone(),
        bus,
        cfg.cache.invalidation_channel.clone(),
    );
    jobs::cache_sweep::spawn(manager.cache().clone());
    tracing::info!("Background cache sweep started (every 60s)");

    if cfg.api_key.is_none() {
        tracing::warn!("GITAUTH_API_KEY not set, the internal API is unauthenticated");
    }

    let state = Arc::new(AppState {
        manager,
        config: cfg,
    });
    let app = api::build_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("gitauth listening on {}", addr);
    axum::serve(listener, app).await?;

    Ok(())
}

fn check_config(cfg: &config::Config) -> anyhow::Result<()> {
    let algorithm = startup::assert_hash_availability(cfg)?;
    println!("Configuration OK:");
    println!("  Port:          {}", cfg.port);
    println!("  Hash:          {}", algorithm);
    println!(
        "  Store:         {}",
        if cfg.database_url.is_some() { "postgres" } else { "memory" }
    );
    println!(
        "  Invalidation:  {} ({})",
        if cfg.redis_url.is_some() { "redis" } else { "in-process" },
        cfg.cache.invalidation_channel
    );
    println!(
        "  Delegation:    tokens={} ssh_keys={}",
        cfg.delegation.tokens, cfg.delegation.ssh_keys
    );
    Ok(())
}

async fn handle_token_command(
    cmd: cli::TokenCommands,
    manager: &CredentialManager,
) -> anyhow::Result<()> {
    match cmd {
        cli::TokenCommands::Create {
            user,
            label,
            scopes,
            expires_at,
            replace,
        } => {
            let expires_at = expires_at
                .map(|s| {
                    chrono::DateTime::parse_from_rfc3339(&s)
                        .map(|d| d.with_timezone(&Utc))
                        .with_context(|| format!("invalid expires_at: {}", s))
                })
                .transpose()?;
            let created = manager
                .create_token(
                    &user,
                    CreateTokenRequest {
                        label,
                        scopes: scopes.unwrap_or_default(),
                        expires_at,
                        replace,
                    },
                )
                .await?;
            println!(
                "Token created:\n  ID:      {}\n  Prefix:  {}\n  Secret:  {}\n(the secret is not shown again)",
                created.id, created.hash_prefix, created.token
            );
        }
        cli::TokenCommands::List { user } => {
            let tokens = manager.list_tokens(&user).await?;
            if tokens.is_empty() {
                println!("No tokens found.");
            } else {
                println!(
                    "{:<38} {:<20} {:<10} {:<8} EXPIRES",
                    "ID", "LABEL", "PREFIX", "ACTIVE"
                );
                for t in tokens {
                    println!(
                        "{:<38} {:<20} {:<10} {:<8} {}",
                        t.id,
                        t.label,
                        t.hash_prefix,
                        t.active,
                        t.expires_at
                            .map(|e| e.format("%Y-%m-%d").to_string())
                            .unwrap_or_else(|| "never".into())
                    );
                }
            }
        }
        cli::TokenCommands::Revoke { user, token_id } => {
            manager.revoke_token(&user, &token_id).await?;
            println!("Token revoked.");
        }
        cli::TokenCommands::Introspect => {
            let mut line = Zeroizing::new(String::new());
            std::io::stdin()
                .read_line(&mut line)
                .context("failed to read secret from stdin")?;
            let result = manager.introspect(line.trim()).await;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
    }
    Ok(())
}

async fn handle_ssh_key_command(
    cmd: cli::SshKeyCommands,
    manager: &CredentialManager,
) -> anyhow::Result<()> {
    match cmd {
        cli::SshKeyCommands::Add { user, name, key } => {
            let public_key = match key.strip_prefix('@') {
                Some(path) => tokio::fs::read_to_string(path)
                    .await
                    .with_context(|| format!("failed to read {}", path))?,
                None => key,
            };
            let outcome = manager
                .add_ssh_key(
                    &user,
                    CreateSshKeyRequest {
                        key_name: name,
                        public_key,
                    },
                )
                .await?;
            println!(
                "SSH key {}:\n  ID:          {}\n  Name:        {}\n  Fingerprint: {}",
                if outcome.created { "added" } else { "already registered" },
                outcome.key.id,
                outcome.key.key_name,
                outcome.key.fingerprint
            );
        }
        cli::SshKeyCommands::List { user } => {
            let keys = manager.list_ssh_keys(&user).await?;
            if keys.is_empty() {
                println!("No SSH keys found.");
            } else {
                println!("{:<38} {:<20} FINGERPRINT", "ID", "NAME");
                for k in keys {
                    println!("{:<38} {:<20} {}", k.id, k.key_name, k.fingerprint);
                }
            }
        }
        cli::SshKeyCommands::Remove { user, key_id } => {
            manager.remove_ssh_key(&user, &key_id).await?;
            println!("SSH key removed.");
        }
        cli::SshKeyCommands::Lookup { fingerprint } => {
            match manager.lookup_ssh_key(&fingerprint).await? {
                Some(owner) => println!("{}", owner),
                None => anyhow::bail!("no key registered for {}", fingerprint),
            }
        }
    }
    Ok(())
}
