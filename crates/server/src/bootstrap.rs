use std::sync::Arc;

use axum::Router;
use thiserror::Error;
use tracing::info;

use concierge_agent::{
    builtin_registry, AgentOrchestrator, Answerer, LlmError, OllamaClient, OrchestratorParts,
    OrchestratorSettings, Planner,
};
use concierge_core::config::{AppConfig, ConfigError, LoadOptions};
use concierge_core::confirm::ConfirmationManager;
use concierge_core::dedupe::DedupeStore;
use concierge_core::tools::RegistryError;
use concierge_core::webhook::WebhookVerifier;
use concierge_db::{
    connect_with_settings, migrations, DbPool, SqlAuditLog, SqlConfirmationStore, SqlDedupeStore,
    SqlSessionStore,
};

use crate::admin::{self, AdminState};
use crate::channels::{self, ChannelState};
use crate::health;

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub router: Router,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
    #[error("tool registry construction failed: {0}")]
    Registry(#[from] RegistryError),
    #[error("llm client construction failed: {0}")]
    Llm(#[from] LlmError),
}

pub async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config).await
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        "starting application bootstrap"
    );

    let db_pool = connect_with_settings(
        &config.database.url,
        config.database.max_connections,
        config.database.timeout_secs,
    )
    .await
    .map_err(BootstrapError::DatabaseConnect)?;
    info!(
        event_name = "system.bootstrap.database_connected",
        correlation_id = "bootstrap",
        "database connection established"
    );

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(
        event_name = "system.bootstrap.migrations_applied",
        correlation_id = "bootstrap",
        "database migrations applied"
    );

    let registry = Arc::new(builtin_registry()?);
    info!(
        event_name = "system.bootstrap.registry_built",
        correlation_id = "bootstrap",
        tools = registry.len(),
        "tool registry built"
    );

    let llm_client = Arc::new(OllamaClient::from_config(&config.llm)?);
    let planner = Planner::new(llm_client.clone());
    let answerer = config.agent.enable_answerer.then(|| Answerer::new(llm_client));

    let confirmations = ConfirmationManager::new(
        Arc::new(SqlConfirmationStore::new(db_pool.clone())),
        config.agent.confirmation_ttl_secs,
    );
    let dedupe: Arc<dyn DedupeStore> = Arc::new(SqlDedupeStore::new(db_pool.clone()));

    let orchestrator = Arc::new(AgentOrchestrator::new(
        OrchestratorSettings::from_config(&config.agent, &config.llm),
        OrchestratorParts {
            registry,
            planner,
            answerer,
            confirmations: confirmations.clone(),
            sessions: Arc::new(SqlSessionStore::new(db_pool.clone())),
            dedupe: dedupe.clone(),
            audit: Arc::new(SqlAuditLog::new(db_pool.clone())),
        },
    ));

    let verifier = WebhookVerifier::new(
        config.webhook.secret.clone(),
        config.webhook.verify_signature,
        config.webhook.replay_window_secs,
        config.webhook.max_future_skew_secs,
        config.webhook.max_payload_bytes,
    );

    let router = channels::router(ChannelState {
        orchestrator,
        verifier,
        internal_api_key: config.security.internal_api_key.clone(),
    })
    .merge(admin::router(AdminState {
        confirmations,
        dedupe,
        internal_api_key: config.security.internal_api_key.clone(),
    }))
    .merge(health::router(db_pool.clone()));

    Ok(Application { config, db_pool, router })
}

#[cfg(test)]
mod tests {
    use concierge_core::config::{ConfigOverrides, LoadOptions};

    use crate::bootstrap::bootstrap;

    fn valid_overrides(database_url: &str) -> LoadOptions {
        LoadOptions {
            overrides: ConfigOverrides {
                database_url: Some(database_url.to_string()),
                ..ConfigOverrides::default()
            },
            ..LoadOptions::default()
        }
    }

    #[tokio::test]
    async fn bootstrap_fails_fast_when_signature_checking_lacks_a_secret() {
        let result = bootstrap(LoadOptions {
            overrides: ConfigOverrides {
                database_url: Some("sqlite::memory:".to_string()),
                webhook_verify_signature: Some(true),
                ..ConfigOverrides::default()
            },
            ..LoadOptions::default()
        })
        .await;

        let message = result.err().expect("bootstrap should fail").to_string();
        assert!(message.contains("webhook.secret"));
    }

    #[tokio::test]
    async fn bootstrap_applies_migrations_and_builds_the_router() {
        let app = bootstrap(valid_overrides("sqlite::memory:?cache=shared"))
            .await
            .expect("bootstrap should succeed with valid overrides");

        let (table_count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sqlite_master \
             WHERE type = 'table' AND name IN \
             ('sessions', 'pending_confirmations', 'dedupe_messages', 'audit_events')",
        )
        .fetch_one(&app.db_pool)
        .await
        .expect("expected foundation tables to be available after bootstrap");
        assert_eq!(table_count, 4, "bootstrap should expose the trust-layer tables");

        app.db_pool.close().await;
    }
}
