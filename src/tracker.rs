//! Attempt tracking: the latest attempt per challenge and the affordances it implies.
//!
//! The server owns the history. The tracker is rebuilt wholesale from it (mount,
//! refetch) and never patched entry by entry.

use std::collections::HashMap;

use crate::domain::AttemptRecord;

/// Hard cap on scored attempts per challenge.
pub const MAX_ATTEMPTS: u32 = 3;

/// Derived view of one challenge's attempts.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AttemptStatus {
  pub count: u32,
  pub finalized: bool,
  pub score: Option<f32>,
  pub feedback: Option<String>,
  pub ideal_answer: Option<String>,
}

impl AttemptStatus {
  /// Editable and submittable.
  pub fn is_open(&self) -> bool {
    !self.finalized
  }

  pub fn remaining(&self) -> u32 {
    if self.finalized { 0 } else { MAX_ATTEMPTS - self.count }
  }
}

#[derive(Clone, Debug, Default)]
pub struct AttemptTracker {
  latest: HashMap<String, AttemptRecord>,
}

impl AttemptTracker {
  /// Keep the highest attempt per challenge. A finalized flag on any record sticks.
  pub fn from_history<I>(records: I) -> Self
  where
    I: IntoIterator<Item = AttemptRecord>,
  {
    let mut latest: HashMap<String, AttemptRecord> = HashMap::new();
    for rec in records {
      match latest.get_mut(&rec.challenge_id) {
        Some(existing) if existing.attempt >= rec.attempt => {
          existing.finalized |= rec.finalized;
        }
        Some(existing) => {
          let sticky = existing.finalized;
          *existing = rec;
          existing.finalized |= sticky;
        }
        None => {
          latest.insert(rec.challenge_id.clone(), rec);
        }
      }
    }
    Self { latest }
  }

  pub fn status(&self, challenge_id: &str) -> AttemptStatus {
    match self.latest.get(challenge_id) {
      None => AttemptStatus::default(),
      Some(rec) => {
        let count = rec.attempt.min(MAX_ATTEMPTS);
        AttemptStatus {
          count,
          finalized: rec.finalized || count >= MAX_ATTEMPTS,
          score: rec.score,
          feedback: rec.feedback.clone(),
          ideal_answer: rec.ideal_answer.clone(),
        }
      }
    }
  }

  pub fn latest(&self, challenge_id: &str) -> Option<&AttemptRecord> {
    self.latest.get(challenge_id)
  }

  pub fn records(&self) -> impl Iterator<Item = &AttemptRecord> {
    self.latest.values()
  }

  /// Copy with one record folded in, for the optimistic merge after a submission.
  pub fn with_record(&self, rec: AttemptRecord) -> Self {
    let mut records: Vec<AttemptRecord> = self.latest.values().cloned().collect();
    records.push(rec);
    Self::from_history(records)
  }

  /// Copy with the latest attempt of `challenge_id` marked final.
  pub fn with_finalized(&self, challenge_id: &str) -> Self {
    let mut next = self.clone();
    if let Some(rec) = next.latest.get_mut(challenge_id) {
      rec.finalized = true;
    }
    next
  }

  pub fn len(&self) -> usize {
    self.latest.len()
  }

  pub fn is_empty(&self) -> bool {
    self.latest.is_empty()
  }
}
