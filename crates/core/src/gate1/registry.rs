//! Versioned analysis contract: the JSON schema, the canonical pattern order
//! and the identifier formats, loaded once and shared read-only.

use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use jsonschema::{Draft, JSONSchema};
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("could not read contract file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse contract manifest `{path}`: {source}")]
    ParseManifest { path: PathBuf, source: toml::de::Error },
    #[error("could not parse schema document `{path}`: {source}")]
    ParseSchema { path: PathBuf, source: serde_json::Error },
    #[error("schema document failed to compile: {0}")]
    CompileSchema(String),
    #[error("invalid `{kind}` pattern: {source}")]
    InvalidIdPattern { kind: &'static str, source: regex::Error },
    #[error("manifest pins schema_version `{manifest}` but the schema document pins {schema:?}")]
    VersionMismatch { manifest: String, schema: Option<String> },
    #[error("invalid contract: {0}")]
    InvalidContract(String),
}

/// The manifest half of the contract, as written in `contract.toml`.
#[derive(Clone, Debug, Deserialize)]
pub struct Contract {
    pub schema_version: String,
    pub taxonomy_version: String,
    pub output_mode: String,
    pub schema_file: PathBuf,
    pub pattern_order: Vec<String>,
    #[serde(default)]
    pub balance_patterns: Vec<String>,
    pub id_formats: IdFormatPatterns,
}

#[derive(Clone, Debug, Deserialize)]
pub struct IdFormatPatterns {
    pub analysis_id: String,
    pub meeting_id: String,
    pub baseline_pack_id: String,
    pub experiment_id: String,
    pub evidence_span_id: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IdKind {
    Analysis,
    Meeting,
    BaselinePack,
    Experiment,
    EvidenceSpan,
}

impl IdKind {
    pub fn field_name(&self) -> &'static str {
        match self {
            Self::Analysis => "analysis_id",
            Self::Meeting => "meeting_id",
            Self::BaselinePack => "baseline_pack_id",
            Self::Experiment => "experiment_id",
            Self::EvidenceSpan => "evidence_span_id",
        }
    }
}

#[derive(Clone, Debug)]
struct IdFormats {
    analysis: Regex,
    meeting: Regex,
    baseline_pack: Regex,
    experiment: Regex,
    evidence_span: Regex,
}

impl IdFormats {
    fn compile(patterns: &IdFormatPatterns) -> Result<Self, RegistryError> {
        let compile = |kind: IdKind, pattern: &str| {
            Regex::new(pattern)
                .map_err(|source| RegistryError::InvalidIdPattern { kind: kind.field_name(), source })
        };

        Ok(Self {
            analysis: compile(IdKind::Analysis, &patterns.analysis_id)?,
            meeting: compile(IdKind::Meeting, &patterns.meeting_id)?,
            baseline_pack: compile(IdKind::BaselinePack, &patterns.baseline_pack_id)?,
            experiment: compile(IdKind::Experiment, &patterns.experiment_id)?,
            evidence_span: compile(IdKind::EvidenceSpan, &patterns.evidence_span_id)?,
        })
    }

    fn get(&self, kind: IdKind) -> &Regex {
        match kind {
            IdKind::Analysis => &self.analysis,
            IdKind::Meeting => &self.meeting,
            IdKind::BaselinePack => &self.baseline_pack,
            IdKind::Experiment => &self.experiment,
            IdKind::EvidenceSpan => &self.evidence_span,
        }
    }
}

/// A schema violation reported by the compiled JSON schema.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SchemaViolation {
    /// Dot-joined instance path, `$` for the document root.
    pub path: String,
    pub message: String,
}

pub struct SchemaRegistry {
    contract: Contract,
    balance_patterns: BTreeSet<String>,
    id_formats: IdFormats,
    schema: JSONSchema,
    schema_hash: String,
}

impl fmt::Debug for SchemaRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchemaRegistry")
            .field("schema_version", &self.contract.schema_version)
            .field("taxonomy_version", &self.contract.taxonomy_version)
            .field("pattern_order", &self.contract.pattern_order)
            .field("schema_hash", &self.schema_hash)
            .finish_non_exhaustive()
    }
}

impl SchemaRegistry {
    /// Load `contract.toml` and the schema document it names, resolved
    /// relative to the manifest's directory.
    pub fn load(manifest_path: impl AsRef<Path>) -> Result<Self, RegistryError> {
        let manifest_path = manifest_path.as_ref();
        let raw = read(manifest_path)?;
        let contract = toml::from_str::<Contract>(&raw).map_err(|source| {
            RegistryError::ParseManifest { path: manifest_path.to_path_buf(), source }
        })?;

        let schema_path = match manifest_path.parent() {
            Some(dir) => dir.join(&contract.schema_file),
            None => contract.schema_file.clone(),
        };
        let schema_raw = read(&schema_path)?;
        let schema = serde_json::from_str::<Value>(&schema_raw)
            .map_err(|source| RegistryError::ParseSchema { path: schema_path.clone(), source })?;

        let registry = Self::from_parts(contract, schema)?;
        tracing::debug!(
            event_name = "gate1.registry.loaded",
            schema_version = %registry.schema_version(),
            schema_hash = %registry.schema_hash(),
            path = %manifest_path.display(),
            "analysis contract loaded"
        );
        Ok(registry)
    }

    pub fn from_parts(contract: Contract, schema: Value) -> Result<Self, RegistryError> {
        check_contract(&contract)?;

        let pinned = schema
            .pointer("/properties/schema_version/const")
            .and_then(Value::as_str)
            .map(String::from);
        if pinned.as_deref() != Some(contract.schema_version.as_str()) {
            return Err(RegistryError::VersionMismatch {
                manifest: contract.schema_version.clone(),
                schema: pinned,
            });
        }

        let compiled = JSONSchema::options()
            .with_draft(Draft::Draft202012)
            .compile(&schema)
            .map_err(|error| RegistryError::CompileSchema(error.to_string()))?;

        let canonical = serde_json::to_vec(&schema)
            .map_err(|error| RegistryError::CompileSchema(error.to_string()))?;
        let mut hasher = Sha256::new();
        hasher.update(&canonical);
        let schema_hash = format!("{:x}", hasher.finalize());

        Ok(Self {
            balance_patterns: contract.balance_patterns.iter().cloned().collect(),
            id_formats: IdFormats::compile(&contract.id_formats)?,
            contract,
            schema: compiled,
            schema_hash,
        })
    }

    pub fn schema_version(&self) -> &str {
        &self.contract.schema_version
    }

    pub fn taxonomy_version(&self) -> &str {
        &self.contract.taxonomy_version
    }

    pub fn output_mode(&self) -> &str {
        &self.contract.output_mode
    }

    /// SHA-256 of the compact schema document.
    pub fn schema_hash(&self) -> &str {
        &self.schema_hash
    }

    pub fn pattern_order(&self) -> &[String] {
        &self.contract.pattern_order
    }

    pub fn is_known_pattern(&self, pattern_id: &str) -> bool {
        self.contract.pattern_order.iter().any(|known| known == pattern_id)
    }

    pub fn is_balance_pattern(&self, pattern_id: &str) -> bool {
        self.balance_patterns.contains(pattern_id)
    }

    pub fn id_matches(&self, kind: IdKind, value: &str) -> bool {
        self.id_formats.get(kind).is_match(value)
    }

    pub fn schema_violations(&self, instance: &Value) -> Vec<SchemaViolation> {
        match self.schema.validate(instance) {
            Ok(()) => Vec::new(),
            Err(errors) => errors
                .map(|error| SchemaViolation {
                    path: dotted_path(&error.instance_path.to_string()),
                    message: error.to_string(),
                })
                .collect(),
        }
    }
}

fn read(path: &Path) -> Result<String, RegistryError> {
    fs::read_to_string(path)
        .map_err(|source| RegistryError::ReadFile { path: path.to_path_buf(), source })
}

fn check_contract(contract: &Contract) -> Result<(), RegistryError> {
    if contract.pattern_order.is_empty() {
        return Err(RegistryError::InvalidContract("pattern_order must not be empty".to_string()));
    }

    let unique: BTreeSet<&str> = contract.pattern_order.iter().map(String::as_str).collect();
    if unique.len() != contract.pattern_order.len() {
        return Err(RegistryError::InvalidContract(
            "pattern_order must not contain duplicates".to_string(),
        ));
    }

    if let Some(unknown) =
        contract.balance_patterns.iter().find(|pattern| !unique.contains(pattern.as_str()))
    {
        return Err(RegistryError::InvalidContract(format!(
            "balance pattern `{unknown}` is not in pattern_order"
        )));
    }

    Ok(())
}

/// `/pattern_snapshot/0/ratio` becomes `pattern_snapshot.0.ratio`.
fn dotted_path(pointer: &str) -> String {
    let segments: Vec<String> = pointer
        .split('/')
        .skip(1)
        .map(|segment| segment.replace("~1", "/").replace("~0", "~"))
        .collect();
    if segments.is_empty() {
        "$".to_string()
    } else {
        segments.join(".")
    }
}
