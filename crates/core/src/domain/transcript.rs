use serde::{Deserialize, Serialize};

/// A speaker-labeled turn produced by transcript normalization.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub turn_id: u32,
    pub speaker_label: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speaker_role_hint: Option<String>,
}

/// A normalized transcript. Text extraction happens upstream; only turns arrive here.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transcript {
    pub meeting_id: String,
    pub meeting_type: String,
    #[serde(default)]
    pub meeting_date: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    pub turns: Vec<Turn>,
    #[serde(default)]
    pub speaker_labels: Vec<String>,
}

impl Transcript {
    /// Labels in first-appearance order, falling back to the turns when none were stored.
    pub fn speakers(&self) -> Vec<String> {
        if !self.speaker_labels.is_empty() {
            return self.speaker_labels.clone();
        }

        let mut labels: Vec<String> = Vec::new();
        for turn in &self.turns {
            if !labels.iter().any(|label| label == &turn.speaker_label) {
                labels.push(turn.speaker_label.clone());
            }
        }
        labels
    }
}

#[cfg(test)]
mod tests {
    use super::{Transcript, Turn};

    #[test]
    fn speakers_fall_back_to_turn_order() {
        let turn = |id: u32, label: &str| Turn {
            turn_id: id,
            speaker_label: label.to_string(),
            text: "...".to_string(),
            speaker_role_hint: None,
        };
        let transcript = Transcript {
            meeting_id: "M-000001".to_string(),
            meeting_type: "exec_staff".to_string(),
            meeting_date: None,
            title: None,
            turns: vec![turn(1, "Alice"), turn(2, "Bob"), turn(3, "Alice")],
            speaker_labels: Vec::new(),
        };

        assert_eq!(transcript.speakers(), vec!["Alice".to_string(), "Bob".to_string()]);
    }
}
