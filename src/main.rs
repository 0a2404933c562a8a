use anyhow::{Context, Result};
use once_cell::sync::OnceCell;
use std::sync::Arc;

use toolkit_credentials::auth::{
    HeadlessPrompt, LoginPrompt, SsoOidcBackend, TerminalPrompt, TokenBackend,
};
use toolkit_credentials::config::{Command, Config};
use toolkit_credentials::notifier::{Event, ThreadDispatcher, Topic};
use toolkit_credentials::storage::SqliteStore;
use toolkit_credentials::{AuthContext, Connection, ConnectionId, FeatureId};

/// Process-wide default context for this binary
static CONTEXT: OnceCell<Arc<AuthContext>> = OnceCell::new();

#[tokio::main]
async fn main() -> Result<()> {
    let (config, command) = Config::load()?;
    config.validate()?;

    // Initialize logging with a configured level; stdout is reserved for command output
    let log_level = config.log_level.to_lowercase();
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .init();

    tracing::debug!("Using credential database: {}", config.db_file.display());
    let storage = Arc::new(SqliteStore::open(&config.db_file)?);

    let mut backend = SsoOidcBackend::new(config.http_client()?);
    if let Some(endpoint) = &config.oidc_endpoint {
        backend = backend.with_endpoint(endpoint.clone());
    }
    let backend: Arc<dyn TokenBackend> = Arc::new(backend);

    let prompt: Arc<dyn LoginPrompt> = if config.interactive {
        Arc::new(TerminalPrompt)
    } else {
        Arc::new(HeadlessPrompt)
    };

    let dispatcher = Arc::new(
        ThreadDispatcher::new("toolkit-events").context("Failed to start event dispatch thread")?,
    );

    let context = CONTEXT.get_or_init(|| {
        Arc::new(AuthContext::new(
            config.auth_settings(),
            backend,
            storage.clone(),
            prompt,
            dispatcher.clone(),
        ))
    });

    let subscription = context.subscribe(Topic::ConnectionStateChanged, |event| {
        if let Event::StateChanged(change) = event {
            tracing::info!("{}: {} -> {}", change.connection_id, change.old, change.new);
        }
    });

    context.load_from(&storage).await?;
    let result = run(context, command).await;

    context.persist_to(&storage)?;
    context.unsubscribe(&subscription);
    dispatcher.shutdown();
    result
}

async fn run(context: &Arc<AuthContext>, command: Command) -> Result<()> {
    match command {
        Command::List => {
            let connections = context.list_connections();
            if connections.is_empty() {
                println!("No connections configured");
            }
            for connection in &connections {
                println!(
                    "{:<20} {:<8} {:<24} {}",
                    connection.id,
                    connection.kind.name(),
                    context.store().get(&connection.id),
                    connection.label
                );
            }
            for (feature, connection) in context.registry().bindings() {
                println!("{} -> {}", feature, connection);
            }
        }

        Command::Status { feature } => {
            let manager = context.feature(FeatureId::new(feature));
            match manager.active_connection() {
                Some(connection) => {
                    println!("Feature:    {}", manager.feature());
                    println!("Connection: {} ({})", connection.id, connection.label);
                    println!("State:      {}", manager.connection_state());
                    println!("Connected:  {}", manager.is_connected());
                }
                None => println!("Feature {} has no active connection", manager.feature()),
            }
        }

        Command::AddSso {
            id,
            label,
            start_url,
            region,
            scopes,
        } => {
            let connection = Connection::bearer(id, label, start_url, region, scopes);
            let state = context.add_connection(connection.clone()).await;
            println!("Added {} ({})", connection.id, state);
        }

        Command::AddStatic {
            id,
            label,
            profile,
            region,
        } => {
            let connection = Connection::static_credentials(id, label, profile, region);
            let state = context.add_connection(connection.clone()).await;
            println!("Added {} ({})", connection.id, state);
        }

        Command::Bind { feature, connection } => {
            context.set_active_connection(FeatureId::new(feature), Some(ConnectionId::new(connection)))?;
        }

        Command::Login { connection } => {
            let provider = context.prompt_auth(&ConnectionId::new(connection)).await?;
            println!("{}: {}", provider.id(), provider.state());
        }

        Command::Refresh { connection } => {
            let id = ConnectionId::new(connection);
            let provider = context
                .registry()
                .provider(&id)
                .with_context(|| format!("No bearer-token connection named {}", id))?;
            let state = provider.refresh_with_retry(provider.retry_policy()).await?;
            println!("{}: {}", id, state);
        }

        Command::Logout { connection } => {
            context.close_connection(&ConnectionId::new(connection)).await?;
        }

        Command::Remove { connection } => {
            let id = ConnectionId::new(connection);
            match context.remove_connection(&id).await? {
                Some(removed) => println!("Removed {} ({})", removed.id, removed.label),
                None => println!("No connection named {}", id),
            }
        }
    }
    Ok(())
}
