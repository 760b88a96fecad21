use std::sync::Arc;

use huddle_agent::{GuardedGateway, LlmError, OpenAiGateway};
use huddle_core::config::{AppConfig, ConfigError, LoadOptions};
use huddle_core::gate1::{Gate1Validator, RegistryError, SchemaRegistry};
use huddle_core::retry::RetryPolicy;
use huddle_db::{connect_from_config, migrations, DbPool, Records, RetryingStore, SqlRecordStore};
use thiserror::Error;
use tracing::info;

use crate::orchestrator::RunOrchestrator;
use crate::prompts::{PromptError, PromptSet};
use crate::runner::JobRunner;

pub type WorkerStore = RetryingStore<SqlRecordStore>;
pub type WorkerGateway = GuardedGateway<OpenAiGateway>;

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub records: Arc<Records<WorkerStore>>,
    pub runner: Arc<JobRunner<WorkerStore, WorkerGateway>>,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("llm gateway setup failed: {0}")]
    Llm(#[source] LlmError),
    #[error("schema registry failed to load: {0}")]
    Registry(#[source] RegistryError),
    #[error(transparent)]
    Prompt(#[from] PromptError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
}

pub async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    bootstrap_with_config(AppConfig::load(options)?).await
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(event_name = "system.bootstrap.start", "starting worker bootstrap");

    // Cheap local checks first so a misconfigured worker fails before it
    // touches the database.
    let http = OpenAiGateway::from_config(&config.llm).map_err(BootstrapError::Llm)?;
    let gateway = GuardedGateway::new(
        http,
        config.llm.max_concurrency,
        RetryPolicy::from_config(&config.retry),
    );

    let registry =
        SchemaRegistry::load(&config.analysis.contract_path).map_err(BootstrapError::Registry)?;
    info!(
        event_name = "system.bootstrap.registry_loaded",
        schema_version = registry.schema_version(),
        taxonomy_version = registry.taxonomy_version(),
        "schema registry loaded"
    );
    let prompts = PromptSet::load(&config.analysis, &config.llm)?;

    let db_pool = connect_from_config(&config.database)
        .await
        .map_err(BootstrapError::DatabaseConnect)?;
    info!(event_name = "system.bootstrap.database_connected", "database connection established");

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(event_name = "system.bootstrap.migrations_applied", "database migrations applied");

    let store = RetryingStore::new(
        SqlRecordStore::new(db_pool.clone()),
        RetryPolicy::from_config(&config.retry),
    );
    let records = Arc::new(Records::new(store));
    let orchestrator = Arc::new(RunOrchestrator::new(
        Arc::clone(&records),
        gateway,
        Gate1Validator::new(Arc::new(registry)),
        prompts,
    ));
    let runner = Arc::new(JobRunner::from_config(orchestrator, &config.worker));

    Ok(Application { config, db_pool, records, runner })
}
