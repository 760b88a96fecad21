//! Content-addressed keys that let retried jobs find the records an earlier
//! attempt already wrote.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::domain::run::AnalysisType;

const SHORT_LEN: usize = 16;

/// A lowercase SHA-256 hex digest. Never mutated once derived.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    fn digest(input: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(input.as_bytes());
        Self(format!("{:x}", hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Prefix used in log lines.
    pub fn short(&self) -> &str {
        &self.0[..SHORT_LEN]
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for IdempotencyKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Identity of a single analysis job.
#[derive(Clone, Copy, Debug)]
pub struct RunKeyInput<'a> {
    pub transcript_id: &'a str,
    pub analysis_type: AnalysisType,
    pub coachee_id: &'a str,
    pub target_speaker_label: &'a str,
    pub target_role: &'a str,
    pub config_version: &'a str,
}

/// Speaker label casing and surrounding whitespace do not affect the key.
pub fn make_run_key(input: RunKeyInput<'_>) -> IdempotencyKey {
    let label = input.target_speaker_label.trim().to_lowercase();
    let raw = [
        input.transcript_id,
        input.analysis_type.as_str(),
        input.coachee_id,
        label.as_str(),
        input.target_role,
        input.config_version,
    ]
    .join("|");
    IdempotencyKey::digest(&raw)
}

pub fn make_experiment_event_key(run_id: &str, experiment_id: &str) -> IdempotencyKey {
    IdempotencyKey::digest(&format!("{run_id}|{experiment_id}"))
}

/// One build per pack.
pub fn make_baseline_pack_key(baseline_pack_id: &str) -> IdempotencyKey {
    IdempotencyKey::digest(baseline_pack_id)
}

#[cfg(test)]
mod tests {
    use super::{
        make_baseline_pack_key, make_experiment_event_key, make_run_key, IdempotencyKey,
        RunKeyInput,
    };
    use crate::domain::run::AnalysisType;

    fn base() -> RunKeyInput<'static> {
        RunKeyInput {
            transcript_id: "rec_transcript_001",
            analysis_type: AnalysisType::SingleMeeting,
            coachee_id: "rec_user_001",
            target_speaker_label: "Alice",
            target_role: "chair",
            config_version: "1",
        }
    }

    fn is_lower_hex(key: &IdempotencyKey) -> bool {
        key.as_str().chars().all(|ch| ch.is_ascii_digit() || ('a'..='f').contains(&ch))
    }

    #[test]
    fn run_key_is_deterministic_sha256_hex() {
        let first = make_run_key(base());
        let second = make_run_key(base());

        assert_eq!(first, second);
        assert_eq!(first.as_str().len(), 64);
        assert!(is_lower_hex(&first));
    }

    #[test]
    fn speaker_label_casing_and_padding_are_ignored() {
        let shouted = RunKeyInput { target_speaker_label: "  ALICE ", ..base() };
        assert_eq!(make_run_key(base()), make_run_key(shouted));
    }

    #[test]
    fn every_other_component_changes_the_key() {
        let original = make_run_key(base());
        let variants = [
            RunKeyInput { transcript_id: "rec_transcript_002", ..base() },
            RunKeyInput { analysis_type: AnalysisType::BaselinePack, ..base() },
            RunKeyInput { coachee_id: "rec_user_002", ..base() },
            RunKeyInput { target_speaker_label: "Bob", ..base() },
            RunKeyInput { target_role: "participant", ..base() },
            RunKeyInput { config_version: "2", ..base() },
        ];

        for variant in variants {
            assert_ne!(make_run_key(variant), original, "variant {variant:?} kept the key");
        }
    }

    #[test]
    fn casing_does_not_mask_a_real_change() {
        let changed = RunKeyInput { target_speaker_label: "ALICE", target_role: "participant", ..base() };
        assert_ne!(make_run_key(base()), make_run_key(changed));
    }

    #[test]
    fn event_key_covers_run_and_experiment() {
        let key = make_experiment_event_key("rec_run_001", "EXP-000001");

        assert_eq!(key, make_experiment_event_key("rec_run_001", "EXP-000001"));
        assert_ne!(key, make_experiment_event_key("rec_run_002", "EXP-000001"));
        assert_ne!(key, make_experiment_event_key("rec_run_001", "EXP-000002"));
        assert!(is_lower_hex(&key));
    }

    #[test]
    fn pack_key_depends_only_on_pack_id() {
        assert_eq!(make_baseline_pack_key("BP-000001"), make_baseline_pack_key("BP-000001"));
        assert_ne!(make_baseline_pack_key("BP-000001"), make_baseline_pack_key("BP-000002"));
        assert_eq!(make_baseline_pack_key("BP-000001").short().len(), 16);
    }
}
