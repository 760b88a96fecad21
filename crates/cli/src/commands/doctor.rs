use std::fs;

use huddle_core::config::{AppConfig, LoadOptions};
use huddle_core::gate1::SchemaRegistry;
use huddle_db::connect_from_config;
use serde::Serialize;

use crate::commands::{block_on, escape_json, CommandResult};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum CheckStatus {
    Pass,
    Fail,
    Skipped,
}

#[derive(Debug, Serialize)]
struct DoctorCheck {
    name: &'static str,
    status: CheckStatus,
    details: String,
}

impl DoctorCheck {
    fn pass(name: &'static str, details: impl Into<String>) -> Self {
        Self { name, status: CheckStatus::Pass, details: details.into() }
    }

    fn fail(name: &'static str, details: impl Into<String>) -> Self {
        Self { name, status: CheckStatus::Fail, details: details.into() }
    }
}

#[derive(Debug, Serialize)]
struct DoctorReport {
    overall_status: CheckStatus,
    summary: String,
    checks: Vec<DoctorCheck>,
}

const DEPENDENT_CHECKS: [&str; 4] =
    ["llm_api_key", "schema_registry", "system_prompt", "database_connectivity"];

/// Exits 1 when any readiness check fails.
pub fn run(json_output: bool) -> CommandResult {
    let report = build_report();
    let exit_code = u8::from(report.overall_status != CheckStatus::Pass);

    let output = if json_output {
        serde_json::to_string_pretty(&report).unwrap_or_else(|error| {
            format!(
                "{{\"overall_status\":\"fail\",\"summary\":\"doctor serialization failed\",\"error\":\"{}\"}}",
                escape_json(&error.to_string())
            )
        })
    } else {
        render_human(&report)
    };

    CommandResult { exit_code, output }
}

fn build_report() -> DoctorReport {
    let mut checks = Vec::new();

    match AppConfig::load(LoadOptions::default()) {
        Ok(config) => {
            checks.push(DoctorCheck::pass("config_validation", "configuration loaded and validated"));
            checks.push(check_api_key(&config));
            checks.push(check_schema_registry(&config));
            checks.push(check_system_prompt(&config));
            checks.push(check_database_connectivity(&config));
        }
        Err(error) => {
            checks.push(DoctorCheck::fail("config_validation", error.to_string()));
            checks.extend(DEPENDENT_CHECKS.iter().map(|&name| DoctorCheck {
                name,
                status: CheckStatus::Skipped,
                details: "skipped because configuration did not load".to_string(),
            }));
        }
    }

    let all_pass = checks.iter().all(|check| check.status == CheckStatus::Pass);
    let overall_status = if all_pass { CheckStatus::Pass } else { CheckStatus::Fail };
    let summary = if all_pass {
        "doctor: all readiness checks passed".to_string()
    } else {
        "doctor: one or more readiness checks failed".to_string()
    };

    DoctorReport { overall_status, summary, checks }
}

fn check_api_key(config: &AppConfig) -> DoctorCheck {
    if config.has_llm_api_key() {
        DoctorCheck::pass("llm_api_key", format!("api key present for `{}`", config.llm.base_url))
    } else {
        DoctorCheck::fail("llm_api_key", "set HUDDLE_LLM_API_KEY or llm.api_key")
    }
}

fn check_schema_registry(config: &AppConfig) -> DoctorCheck {
    match SchemaRegistry::load(&config.analysis.contract_path) {
        Ok(registry) => DoctorCheck::pass(
            "schema_registry",
            format!(
                "schema {} / taxonomy {} from `{}`",
                registry.schema_version(),
                registry.taxonomy_version(),
                config.analysis.contract_path.display()
            ),
        ),
        Err(error) => DoctorCheck::fail("schema_registry", error.to_string()),
    }
}

fn check_system_prompt(config: &AppConfig) -> DoctorCheck {
    let path = &config.analysis.system_prompt_path;
    match fs::read_to_string(path) {
        Ok(text) if !text.trim().is_empty() => {
            DoctorCheck::pass("system_prompt", format!("{} bytes from `{}`", text.len(), path.display()))
        }
        Ok(_) => DoctorCheck::fail("system_prompt", format!("`{}` is empty", path.display())),
        Err(error) => DoctorCheck::fail("system_prompt", format!("`{}`: {error}", path.display())),
    }
}

fn check_database_connectivity(config: &AppConfig) -> DoctorCheck {
    let probe = block_on(async {
        let pool = connect_from_config(&config.database).await.map_err(|error| error.to_string())?;
        pool.close().await;
        Ok::<(), String>(())
    });

    match probe {
        Ok(Ok(())) => DoctorCheck::pass(
            "database_connectivity",
            format!("connected using `{}`", config.database.url),
        ),
        Ok(Err(error)) => {
            DoctorCheck::fail("database_connectivity", format!("failed to connect to database: {error}"))
        }
        Err(error) => DoctorCheck::fail(
            "database_connectivity",
            format!("failed to initialize async runtime: {error}"),
        ),
    }
}

fn render_human(report: &DoctorReport) -> String {
    let mut lines = vec![report.summary.clone()];
    for check in &report.checks {
        let marker = match check.status {
            CheckStatus::Pass => "ok",
            CheckStatus::Fail => "fail",
            CheckStatus::Skipped => "skip",
        };
        lines.push(format!("- [{marker}] {}: {}", check.name, check.details));
    }
    lines.join("\n")
}
