use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// Mirrored view of one on-chain poll. JSON field names match what the
// frontend already consumes (pollId, votes, createdAt).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Poll {
    #[serde(rename = "pollId")]
    pub id: u64,
    pub question: String,
    pub options: Vec<String>,
    pub votes: Vec<u64>,
    pub created_at: DateTime<Utc>,
}

impl Poll {
    // A poll as first observed through its creation event: one zeroed count
    // per option, created_at stamped locally (display ordering only, never
    // authoritative).
    pub fn new(id: u64, question: String, options: Vec<String>) -> Self {
        let votes = vec![0; options.len()];
        Self {
            id,
            question,
            options,
            votes,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_poll_starts_with_zeroed_counts() {
        let poll = Poll::new(
            3,
            "Tea or Coffee?".to_string(),
            vec!["Tea".into(), "Coffee".into()],
        );
        assert_eq!(poll.votes, vec![0, 0]);
        assert_eq!(poll.options.len(), poll.votes.len());
    }

    #[test]
    fn poll_serializes_with_frontend_field_names() {
        let poll = Poll::new(1, "Q".to_string(), vec!["a".into(), "b".into()]);
        let json = serde_json::to_value(&poll).unwrap();
        assert!(json.get("pollId").is_some());
        assert!(json.get("createdAt").is_some());
        assert!(json.get("votes").is_some());
    }
}
