use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use huddle_core::config::{AppConfig, LoadOptions};
use huddle_core::gate1::{Gate1Validator, SchemaRegistry};

use crate::commands::CommandResult;

/// Runs Gate1 on a saved model output. Exit code 1 means the output was
/// read and judged, and failed.
pub fn run(file: &Path, contract: Option<&Path>) -> CommandResult {
    let contract_path = match contract {
        Some(path) => path.to_path_buf(),
        None => match configured_contract() {
            Ok(path) => path,
            Err(result) => return result,
        },
    };

    let raw = match fs::read_to_string(file) {
        Ok(raw) => raw,
        Err(error) => {
            return CommandResult::failure(
                "validate",
                "input_read",
                format!("could not read `{}`: {error}", file.display()),
                3,
            );
        }
    };

    let registry = match SchemaRegistry::load(&contract_path) {
        Ok(registry) => registry,
        Err(error) => {
            return CommandResult::failure("validate", "schema_registry", error.to_string(), 4);
        }
    };

    let result = Gate1Validator::new(Arc::new(registry)).validate(&raw);
    let errors = result.errors().count();
    let warnings = result.warnings().count();
    let data = serde_json::to_value(&result).unwrap_or_default();

    if result.passed {
        CommandResult::success_with(
            "validate",
            format!("gate1 passed with {warnings} warning(s)"),
            data,
        )
    } else {
        CommandResult::failure_with(
            "validate",
            "gate1",
            format!("gate1 failed with {errors} error(s) and {warnings} warning(s)"),
            1,
            data,
        )
    }
}

fn configured_contract() -> Result<PathBuf, CommandResult> {
    AppConfig::load(LoadOptions::default())
        .map(|config| config.analysis.contract_path)
        .map_err(|error| {
            CommandResult::failure(
                "validate",
                "config_validation",
                format!("configuration issue: {error}"),
                2,
            )
        })
}
