//! Wall-clock localization with explicit DST handling

use chrono::{DateTime, Duration, LocalResult, NaiveDateTime, TimeZone, Timelike};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::error::{IngestError, Result};

/// Longest span scanned for the end of a DST gap
const MAX_GAP_MINUTES: i64 = 24 * 60;

/// How to resolve a wall-clock value that occurs twice (DST fall-back)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AmbiguousPolicy {
    /// First occurrence (the pre-transition offset)
    Earlier,
    /// Second occurrence (the post-transition offset)
    Later,
    /// Infer from neighbouring rows of the same zone, in batch order.
    ///
    /// Inside a run of repeated wall-clock values, rows before the point where
    /// the clock steps backwards get the first occurrence and rows after it the
    /// second. This is a heuristic: it expects rows in chronological order and
    /// fails with `TimezoneAmbiguous` when the run has no backwards step, for
    /// example a lone ambiguous row.
    #[default]
    Infer,
}

/// Outcome of localizing one wall-clock value
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Localized {
    /// Exactly one instant matches
    Unique(DateTime<Tz>),
    /// The value fell in a DST gap and was moved to the next valid instant
    Shifted(DateTime<Tz>),
    /// The value occurs twice
    Ambiguous {
        earlier: DateTime<Tz>,
        later: DateTime<Tz>,
    },
}

impl Localized {
    /// Resolve under a fixed choice; `None` for `Infer` on an ambiguous value
    pub fn resolve(&self, policy: AmbiguousPolicy) -> Option<DateTime<Tz>> {
        match (self, policy) {
            (Localized::Unique(dt) | Localized::Shifted(dt), _) => Some(*dt),
            (Localized::Ambiguous { earlier, .. }, AmbiguousPolicy::Earlier) => Some(*earlier),
            (Localized::Ambiguous { later, .. }, AmbiguousPolicy::Later) => Some(*later),
            (Localized::Ambiguous { .. }, AmbiguousPolicy::Infer) => None,
        }
    }

    pub fn is_ambiguous(&self) -> bool {
        matches!(self, Localized::Ambiguous { .. })
    }
}

/// Localize a wall-clock value in `tz`
pub fn localize(tz: Tz, local: NaiveDateTime) -> Result<Localized> {
    match tz.from_local_datetime(&local) {
        LocalResult::Single(dt) => Ok(Localized::Unique(dt)),
        LocalResult::Ambiguous(a, b) => {
            let (earlier, later) = if a <= b { (a, b) } else { (b, a) };
            Ok(Localized::Ambiguous { earlier, later })
        }
        LocalResult::None => next_valid_instant(tz, local).map(Localized::Shifted),
    }
}

/// First valid local minute after a value that falls in a DST gap, which is
/// the transition instant itself.
fn next_valid_instant(tz: Tz, local: NaiveDateTime) -> Result<DateTime<Tz>> {
    let mut candidate = local
        .with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(local);

    for _ in 0..MAX_GAP_MINUTES {
        candidate = candidate + Duration::minutes(1);
        match tz.from_local_datetime(&candidate) {
            LocalResult::Single(dt) => return Ok(dt),
            LocalResult::Ambiguous(a, b) => return Ok(a.min(b)),
            LocalResult::None => continue,
        }
    }

    Err(IngestError::InvalidTimestamp(format!(
        "{} has no valid instant in {} within a day",
        local,
        tz.name()
    )))
}

/// Resolve `Infer` rows from context.
///
/// `sequence` holds the localized values of one zone in batch order. A run of
/// ambiguous values never spans two local dates, so folds of different years
/// are settled separately. Returns
/// one entry per input: the chosen instant, or `None` when the value is
/// ambiguous and the surrounding rows do not settle it.
pub fn infer_sequence(sequence: &[(NaiveDateTime, Localized)]) -> Vec<Option<DateTime<Tz>>> {
    let mut resolved: Vec<Option<DateTime<Tz>>> = sequence
        .iter()
        .map(|(_, l)| l.resolve(AmbiguousPolicy::Infer))
        .collect();

    let mut start = 0;
    while start < sequence.len() {
        if !sequence[start].1.is_ambiguous() {
            start += 1;
            continue;
        }

        let fold_date = sequence[start].0.date();
        let mut end = start;
        while end < sequence.len()
            && sequence[end].1.is_ambiguous()
            && sequence[end].0.date() == fold_date
        {
            end += 1;
        }

        let run = &sequence[start..end];
        let fold = (1..run.len()).find(|&i| run[i].0 < run[i - 1].0);

        if let Some(fold) = fold {
            for (offset, (_, localized)) in run.iter().enumerate() {
                let policy = if offset < fold {
                    AmbiguousPolicy::Earlier
                } else {
                    AmbiguousPolicy::Later
                };
                resolved[start + offset] = localized.resolve(policy);
            }
        }

        start = end;
    }

    resolved
}
