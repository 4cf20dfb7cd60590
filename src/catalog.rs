//! Pure derivations over the challenge list: release flags, module/lesson
//! placement, grouping, lesson badges and the feedback block.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::domain::{Challenge, ChallengeKind, ContentUnit, Module, Release};
use crate::tracker::AttemptStatus;

/// Module name for challenges whose content unit is unknown.
pub const UNKNOWN_MODULE: &str = "Desconhecido";

/// Join challenges with content metadata and the cohort's releases.
pub fn annotate(challenges: Vec<Challenge>, releases: &[Release], contents: &[ContentUnit]) -> Vec<Challenge> {
  let released: HashSet<&str> = releases.iter().map(|r| r.content_id.as_str()).collect();
  let units: HashMap<&str, &ContentUnit> = contents.iter().map(|c| (c.id.as_str(), c)).collect();

  challenges
    .into_iter()
    .map(|mut ch| {
      let unit = units.get(ch.content_id.as_str());
      ch.module = unit
        .map(|u| u.module.as_str())
        .filter(|m| !m.is_empty())
        .unwrap_or(UNKNOWN_MODULE)
        .to_string();
      ch.lesson = unit.map(|u| u.lesson.clone()).unwrap_or_default();
      ch.released = released.contains(ch.content_id.as_str());
      ch
    })
    .collect()
}

/// Group into modules sorted by name; micros sorted by lesson. A later macro for
/// the same module replaces an earlier one.
pub fn group_modules(challenges: &[Challenge]) -> Vec<Module> {
  let mut by_name: BTreeMap<&str, Module> = BTreeMap::new();
  for ch in challenges {
    let module = by_name
      .entry(ch.module.as_str())
      .or_insert_with(|| Module { name: ch.module.clone(), ..Module::default() });
    match ch.kind {
      ChallengeKind::Macro => module.macro_challenge = Some(ch.clone()),
      ChallengeKind::Micro => module.micros.push(ch.clone()),
    }
  }
  let mut modules: Vec<Module> = by_name.into_values().collect();
  for m in &mut modules {
    m.micros.sort_by(|a, b| a.lesson.cmp(&b.lesson));
  }
  modules
}

/// Take a fresh listing but keep the text already shown for known ids.
pub fn merge_preserving_text(known: &[Challenge], fresh: Vec<Challenge>) -> Vec<Challenge> {
  let texts: HashMap<&str, &str> = known.iter().map(|c| (c.id.as_str(), c.text.as_str())).collect();
  fresh
    .into_iter()
    .map(|mut ch| {
      if let Some(text) = texts.get(ch.id.as_str()) {
        ch.text = text.to_string();
      }
      ch
    })
    .collect()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LessonBadge {
  Finalized,
  AwaitingRelease,
  Released,
}

impl LessonBadge {
  pub fn label(&self) -> &'static str {
    match self {
      LessonBadge::Finalized => "Finalizado",
      LessonBadge::AwaitingRelease => "Aguardando liberação",
      LessonBadge::Released => "Liberado",
    }
  }
}

pub fn lesson_badge(challenge: &Challenge, status: &AttemptStatus) -> LessonBadge {
  if status.finalized {
    LessonBadge::Finalized
  } else if !challenge.released {
    LessonBadge::AwaitingRelease
  } else {
    LessonBadge::Released
  }
}

/// The evaluation block shown under a challenge; `None` before any scored attempt.
pub fn feedback_text(status: &AttemptStatus) -> Option<String> {
  let score = status.score?;
  let mut out = format!("Nota: {:.1}\n\n{}", score, status.feedback.as_deref().unwrap_or_default());
  if status.finalized {
    if let Some(ideal) = status.ideal_answer.as_deref().filter(|s| !s.trim().is_empty()) {
      out.push_str("\nResposta ideal:\n");
      out.push_str(ideal);
    }
  }
  Some(out)
}
