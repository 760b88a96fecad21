pub mod commands;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "huddle",
    about = "Huddle operator CLI",
    long_about = "Validate analysis output, derive idempotency keys, apply migrations, and check runtime readiness.",
    after_help = "Examples:\n  huddle validate output.json\n  huddle key pack --baseline-pack-id rec_bp01\n  huddle doctor --json"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Run Gate1 validation on a model output file")]
    Validate {
        #[arg(help = "Path to the raw model output")]
        file: PathBuf,
        #[arg(long, help = "Contract manifest to validate against (defaults to analysis.contract_path)")]
        contract: Option<PathBuf>,
    },
    #[command(subcommand, about = "Print the idempotency key a worker would derive")]
    Key(KeyCommand),
    #[command(about = "Apply pending database migrations and return structured status output")]
    Migrate,
    #[command(about = "Inspect effective configuration values with source attribution and redaction")]
    Config,
    #[command(about = "Check configuration, API key, schema registry, prompt and database readiness")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
}

#[derive(Debug, Subcommand)]
enum KeyCommand {
    #[command(about = "Key for an analysis run")]
    Run {
        #[arg(long)]
        transcript_id: String,
        #[arg(long, default_value = "single_meeting")]
        analysis_type: String,
        #[arg(long)]
        coachee_id: String,
        #[arg(long)]
        speaker_label: String,
        #[arg(long)]
        role: String,
        #[arg(long, help = "Prompt config version (defaults to analysis.config_version)")]
        config_version: Option<String>,
    },
    #[command(about = "Key for an experiment attempt event")]
    Event {
        #[arg(long)]
        run_id: String,
        #[arg(long)]
        experiment_id: String,
    },
    #[command(about = "Key for a baseline pack build")]
    Pack {
        #[arg(long)]
        baseline_pack_id: String,
    },
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Validate { file, contract } => {
            commands::validate::run(&file, contract.as_deref())
        }
        Command::Key(KeyCommand::Run {
            transcript_id,
            analysis_type,
            coachee_id,
            speaker_label,
            role,
            config_version,
        }) => commands::key::run(commands::key::RunKeyArgs {
            transcript_id: &transcript_id,
            analysis_type: &analysis_type,
            coachee_id: &coachee_id,
            speaker_label: &speaker_label,
            role: &role,
            config_version: config_version.as_deref(),
        }),
        Command::Key(KeyCommand::Event { run_id, experiment_id }) => {
            commands::key::event(&run_id, &experiment_id)
        }
        Command::Key(KeyCommand::Pack { baseline_pack_id }) => {
            commands::key::pack(&baseline_pack_id)
        }
        Command::Migrate => commands::migrate::run(),
        Command::Config => {
            commands::CommandResult { exit_code: 0, output: commands::config::run() }
        }
        Command::Doctor { json } => commands::doctor::run(json),
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
