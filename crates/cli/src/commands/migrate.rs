use huddle_core::config::{AppConfig, LoadOptions};
use huddle_db::{connect_from_config, migrations};
use serde_json::json;

use crate::commands::{block_on, CommandResult};

pub fn run() -> CommandResult {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => {
            return CommandResult::failure(
                "migrate",
                "config_validation",
                format!("configuration issue: {error}"),
                2,
            );
        }
    };

    let outcome = block_on(async {
        let pool = connect_from_config(&config.database)
            .await
            .map_err(|error| ("db_connectivity", error.to_string(), 4u8))?;
        let applied = migrations::run_pending(&pool)
            .await
            .map_err(|error| ("migration", error.to_string(), 5u8));
        pool.close().await;
        applied
    });

    let known: Vec<_> = migrations::MIGRATOR
        .iter()
        .map(|migration| json!({ "version": migration.version, "description": migration.description }))
        .collect();

    match outcome {
        Err(error) => CommandResult::failure(
            "migrate",
            "runtime_init",
            format!("failed to initialize async runtime: {error}"),
            3,
        ),
        Ok(Err((error_class, message, exit_code))) => {
            CommandResult::failure("migrate", error_class, message, exit_code)
        }
        Ok(Ok(())) => CommandResult::success_with(
            "migrate",
            format!("record store schema is current at {} migration(s)", known.len()),
            json!({ "database_url": config.database.url, "migrations": known }),
        ),
    }
}
