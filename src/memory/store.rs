//! Per-subject memory records
//!
//! Bounded history of completed meetings: the most recent rounds plus a
//! compact rolling summary regenerated periodically.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Maximum rounds retained per subject
pub const MAX_ROUNDS: usize = 10;

/// One completed meeting distilled into memory
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryRound {
    pub question: String,
    pub summary: String,
    pub key_points: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

/// Long-lived memory for one subject
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectMemory {
    pub symbol: String,
    pub name: String,
    rounds: VecDeque<MemoryRound>,
    #[serde(default)]
    pub rolling_summary: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SubjectMemory {
    pub fn new(symbol: &str, name: &str) -> Self {
        let now = Utc::now();
        Self {
            symbol: symbol.to_string(),
            name: name.to_string(),
            rounds: VecDeque::new(),
            rolling_summary: String::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Append a round, evicting the oldest past the cap
    pub fn push_round(&mut self, round: MemoryRound) {
        self.rounds.push_back(round);
        while self.rounds.len() > MAX_ROUNDS {
            self.rounds.pop_front();
        }
        self.updated_at = Utc::now();
    }

    pub fn round_count(&self) -> usize {
        self.rounds.len()
    }

    /// The N most recent rounds, oldest first
    pub fn recent_rounds(&self, count: usize) -> impl Iterator<Item = &MemoryRound> {
        let skip = self.rounds.len().saturating_sub(count);
        self.rounds.iter().skip(skip)
    }

    pub fn rounds(&self) -> impl Iterator<Item = &MemoryRound> {
        self.rounds.iter()
    }
}
