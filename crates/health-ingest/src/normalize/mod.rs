//! Timestamp normalization
//!
//! Turns the raw timestamp of every record into a [`NormalizedTimestamp`]
//! carrying the UTC instant, the local wall clock and the zone it refers to.
//!
//! Two strategies exist, selected per table:
//!
//! - **Assumed** (Strategy A): the source gives a bare wall clock which is
//!   localized in the configured home zone. Records captured while travelling
//!   get a consistent error equal to the offset difference between the visited
//!   zone and the home zone.
//! - **Actual** (Strategy B): the source reports the zone, which is used as-is.
//!
//! Both apply the same DST rules: values in a spring-forward gap move to the
//! next valid instant, values in a fall-back fold follow [`AmbiguousPolicy`].

mod localize;
mod parse;

pub use localize::{localize, AmbiguousPolicy, Localized};
pub use parse::{parse_instant, parse_naive};

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Duration, NaiveDateTime, Timelike, Utc};
use chrono_tz::Tz;

use crate::db::models::{NormalizedTimestamp, RawTimestamp, TzSource};
use crate::db::schema::TimestampStrategy;
use crate::error::{IngestError, Result};

/// Settings shared by every normalization in a run
#[derive(Debug, Clone)]
pub struct NormalizerSettings {
    pub home_tz: Tz,
    pub ambiguous: AmbiguousPolicy,
    /// Earliest accepted instant
    pub min_utc: DateTime<Utc>,
    /// How far past "now" a timestamp may lie
    pub future_grace: Duration,
}

/// Parse an IANA zone name
pub fn parse_tz(name: &str) -> Result<Tz> {
    name.parse::<Tz>()
        .map_err(|_| IngestError::UnknownTimezone(name.to_string()))
}

/// Intermediate state of one timestamp between localization and guards
enum Pending {
    Done(DateTime<Utc>, Tz, TzSource),
    Local {
        tz: Tz,
        tz_source: TzSource,
        local: NaiveDateTime,
        localized: Localized,
    },
    Failed(IngestError),
}

pub struct TimestampNormalizer {
    settings: NormalizerSettings,
    now: DateTime<Utc>,
}

impl TimestampNormalizer {
    pub fn new(settings: NormalizerSettings) -> Self {
        Self {
            settings,
            now: Utc::now(),
        }
    }

    /// Pin "now" for the future-timestamp guard
    pub fn with_now(mut self, now: DateTime<Utc>) -> Self {
        self.now = now;
        self
    }

    /// Normalize a single timestamp. With [`AmbiguousPolicy::Infer`] a value in
    /// a DST fold has no context to infer from and is rejected.
    pub fn normalize(
        &self,
        raw: &RawTimestamp,
        strategy: TimestampStrategy,
    ) -> Result<NormalizedTimestamp> {
        self.normalize_all([raw], strategy)
            .pop()
            .unwrap_or_else(|| Err(IngestError::InvalidTimestamp("empty input".to_string())))
    }

    /// Normalize a batch in order. Each entry succeeds or fails on its own;
    /// `Infer` uses neighbouring rows of the same zone to settle DST folds.
    pub fn normalize_all<'a, I>(
        &self,
        raws: I,
        strategy: TimestampStrategy,
    ) -> Vec<Result<NormalizedTimestamp>>
    where
        I: IntoIterator<Item = &'a RawTimestamp>,
    {
        let mut pending: Vec<Pending> = raws
            .into_iter()
            .map(|raw| self.prepare(raw, strategy))
            .collect();

        self.resolve_folds(&mut pending);

        pending
            .into_iter()
            .map(|p| match p {
                Pending::Done(utc, tz, tz_source) => self.finish(utc, tz, tz_source),
                Pending::Failed(err) => Err(err),
                Pending::Local { local, tz, .. } => Err(IngestError::TimezoneAmbiguous {
                    local: local.to_string(),
                    tz: tz.name().to_string(),
                    reason: "no surrounding rows to infer the DST offset from".to_string(),
                }),
            })
            .collect()
    }

    fn prepare(&self, raw: &RawTimestamp, strategy: TimestampStrategy) -> Pending {
        let home = self.settings.home_tz;

        let located = match (strategy, raw) {
            (TimestampStrategy::Assumed, RawTimestamp::Instant { utc, .. }) => {
                return Pending::Done(*utc, home, TzSource::Assumed);
            }
            (TimestampStrategy::Actual, RawTimestamp::Instant { utc, tz }) => {
                return match parse_tz(tz) {
                    Ok(tz) => Pending::Done(*utc, tz, TzSource::Actual),
                    Err(err) => Pending::Failed(err),
                };
            }
            (TimestampStrategy::Assumed, RawTimestamp::InstantText { text, .. }) => {
                return match parse_instant(text) {
                    Ok(utc) => Pending::Done(utc, home, TzSource::Assumed),
                    Err(err) => Pending::Failed(err),
                };
            }
            (TimestampStrategy::Actual, RawTimestamp::InstantText { text, tz }) => {
                return match parse_instant(text).and_then(|utc| Ok((utc, parse_tz(tz)?))) {
                    Ok((utc, tz)) => Pending::Done(utc, tz, TzSource::Actual),
                    Err(err) => Pending::Failed(err),
                };
            }
            (TimestampStrategy::Assumed, RawTimestamp::Naive(local))
            | (TimestampStrategy::Assumed, RawTimestamp::Zoned { local, .. }) => {
                Ok((*local, home, TzSource::Assumed))
            }
            (TimestampStrategy::Assumed, RawTimestamp::Text(text))
            | (TimestampStrategy::Assumed, RawTimestamp::ZonedText { text, .. }) => {
                parse_naive(text).map(|local| (local, home, TzSource::Assumed))
            }
            (TimestampStrategy::Actual, RawTimestamp::Zoned { local, tz }) => {
                parse_tz(tz).map(|tz| (*local, tz, TzSource::Actual))
            }
            (TimestampStrategy::Actual, RawTimestamp::ZonedText { text, tz }) => {
                parse_naive(text).and_then(|local| Ok((local, parse_tz(tz)?, TzSource::Actual)))
            }
            (TimestampStrategy::Actual, RawTimestamp::Naive(_) | RawTimestamp::Text(_)) => {
                Err(IngestError::invalid_record(
                    "timestamp has no timezone but the table expects actual zones",
                ))
            }
        };

        let (local, tz, tz_source) = match located {
            Ok(v) => v,
            Err(err) => return Pending::Failed(err),
        };

        match localize(tz, local) {
            Ok(localized) => match localized.resolve(self.settings.ambiguous) {
                Some(dt) => Pending::Done(dt.with_timezone(&Utc), tz, tz_source),
                None => Pending::Local {
                    tz,
                    tz_source,
                    local,
                    localized,
                },
            },
            Err(err) => Pending::Failed(err),
        }
    }

    /// Settle `Infer` values, one zone at a time
    fn resolve_folds(&self, pending: &mut [Pending]) {
        let open_zones: BTreeSet<&'static str> = pending
            .iter()
            .filter_map(|p| match p {
                Pending::Local { tz, .. } => Some(tz.name()),
                _ => None,
            })
            .collect();
        if open_zones.is_empty() {
            return;
        }

        // Resolved values of the same zone give the ambiguous runs their boundaries
        let mut sequences: BTreeMap<&'static str, Vec<(usize, NaiveDateTime, Localized)>> =
            BTreeMap::new();
        for (index, p) in pending.iter().enumerate() {
            let (zone, local, localized) = match p {
                Pending::Local {
                    tz,
                    local,
                    localized,
                    ..
                } => (tz.name(), *local, *localized),
                Pending::Done(utc, tz, _) if open_zones.contains(tz.name()) => {
                    let dt = utc.with_timezone(tz);
                    (tz.name(), dt.naive_local(), Localized::Unique(dt))
                }
                _ => continue,
            };
            sequences.entry(zone).or_default().push((index, local, localized));
        }

        for entries in sequences.values() {
            let sequence: Vec<(NaiveDateTime, Localized)> =
                entries.iter().map(|&(_, local, l)| (local, l)).collect();
            let resolved = localize::infer_sequence(&sequence);

            for (&(index, _, _), dt) in entries.iter().zip(resolved) {
                let replacement = match (&pending[index], dt) {
                    (Pending::Local { tz, tz_source, .. }, Some(dt)) => {
                        Some(Pending::Done(dt.with_timezone(&Utc), *tz, *tz_source))
                    }
                    _ => None,
                };
                if let Some(done) = replacement {
                    pending[index] = done;
                }
            }
        }
    }

    /// Apply range guards and derive the local wall clock
    fn finish(&self, utc: DateTime<Utc>, tz: Tz, tz_source: TzSource) -> Result<NormalizedTimestamp> {
        // Storage keeps microseconds; truncate so stored and in-memory rows agree
        let utc = utc
            .with_nanosecond(utc.nanosecond() / 1_000 * 1_000)
            .unwrap_or(utc);

        let max = self.now + self.settings.future_grace;
        if utc < self.settings.min_utc || utc > max {
            return Err(IngestError::TimestampOutOfRange {
                value: utc.to_rfc3339(),
                min: self.settings.min_utc.to_rfc3339(),
                max: max.to_rfc3339(),
            });
        }

        Ok(NormalizedTimestamp {
            utc,
            local: utc.with_timezone(&tz).naive_local(),
            tz_name: tz.name().to_string(),
            tz_source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn wall(y: i32, m: u32, d: u32, h: u32, min: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, min, 0)
            .unwrap()
    }

    fn normalizer(policy: AmbiguousPolicy) -> TimestampNormalizer {
        TimestampNormalizer::new(NormalizerSettings {
            home_tz: chrono_tz::America::New_York,
            ambiguous: policy,
            min_utc: wall(2000, 1, 1, 0, 0).and_utc(),
            future_grace: Duration::hours(24),
        })
        .with_now(wall(2025, 1, 1, 0, 0).and_utc())
    }

    #[test]
    fn test_assumed_uses_home_zone() {
        let n = normalizer(AmbiguousPolicy::Infer);
        let ts = n
            .normalize(
                &RawTimestamp::Naive(wall(2024, 6, 1, 8, 0)),
                TimestampStrategy::Assumed,
            )
            .unwrap();
        assert_eq!(ts.utc, wall(2024, 6, 1, 12, 0).and_utc());
        assert_eq!(ts.local, wall(2024, 6, 1, 8, 0));
        assert_eq!(ts.tz_name, "America/New_York");
        assert_eq!(ts.tz_source, TzSource::Assumed);
    }

    #[test]
    fn test_assumed_ignores_reported_zone() {
        let n = normalizer(AmbiguousPolicy::Infer);
        let raw = RawTimestamp::Zoned {
            local: wall(2024, 6, 1, 8, 0),
            tz: "Europe/Paris".to_string(),
        };
        let ts = n.normalize(&raw, TimestampStrategy::Assumed).unwrap();
        assert_eq!(ts.tz_name, "America/New_York");
    }

    #[test]
    fn test_actual_uses_reported_zone() {
        let n = normalizer(AmbiguousPolicy::Infer);
        let raw = RawTimestamp::Zoned {
            local: wall(2024, 6, 1, 8, 0),
            tz: "Europe/Paris".to_string(),
        };
        let ts = n.normalize(&raw, TimestampStrategy::Actual).unwrap();
        assert_eq!(ts.utc, wall(2024, 6, 1, 6, 0).and_utc());
        assert_eq!(ts.local, wall(2024, 6, 1, 8, 0));
        assert_eq!(ts.tz_source, TzSource::Actual);
    }

    #[test]
    fn test_actual_instant_keeps_instant() {
        let n = normalizer(AmbiguousPolicy::Infer);
        let raw = RawTimestamp::Instant {
            utc: wall(2024, 6, 1, 6, 0).and_utc(),
            tz: "Asia/Tokyo".to_string(),
        };
        let ts = n.normalize(&raw, TimestampStrategy::Actual).unwrap();
        assert_eq!(ts.local, wall(2024, 6, 1, 15, 0));
    }

    #[test]
    fn test_actual_requires_zone() {
        let n = normalizer(AmbiguousPolicy::Infer);
        let result = n.normalize(
            &RawTimestamp::Text("2024-06-01 08:00:00".into()),
            TimestampStrategy::Actual,
        );
        assert!(matches!(result, Err(IngestError::InvalidRecord(_))));
    }

    #[test]
    fn test_text_variants_parse_per_strategy() {
        let n = normalizer(AmbiguousPolicy::Infer);
        let zoned = RawTimestamp::ZonedText {
            text: "2024-06-01 08:00:00".into(),
            tz: "Europe/Paris".into(),
        };
        let instant = RawTimestamp::InstantText {
            text: "2024-06-01T06:00:00Z".into(),
            tz: "Asia/Tokyo".into(),
        };

        let actual = n.normalize(&zoned, TimestampStrategy::Actual).unwrap();
        assert_eq!(actual.utc, wall(2024, 6, 1, 6, 0).and_utc());
        let assumed = n.normalize(&zoned, TimestampStrategy::Assumed).unwrap();
        assert_eq!(assumed.utc, wall(2024, 6, 1, 12, 0).and_utc());

        let actual = n.normalize(&instant, TimestampStrategy::Actual).unwrap();
        assert_eq!(actual.local, wall(2024, 6, 1, 15, 0));
        let assumed = n.normalize(&instant, TimestampStrategy::Assumed).unwrap();
        assert_eq!(assumed.local, wall(2024, 6, 1, 2, 0));
    }

    #[test]
    fn test_malformed_text_fails_only_its_own_entry() {
        let n = normalizer(AmbiguousPolicy::Infer);
        let raws = vec![
            RawTimestamp::ZonedText {
                text: "not a time".into(),
                tz: "Europe/Paris".into(),
            },
            RawTimestamp::InstantText {
                text: "2024-06-01 06:00".into(),
                tz: "Europe/Paris".into(),
            },
            RawTimestamp::ZonedText {
                text: "2024-06-01 08:00:00".into(),
                tz: "Europe/Paris".into(),
            },
        ];

        let results = n.normalize_all(&raws, TimestampStrategy::Actual);
        assert!(matches!(results[0], Err(IngestError::InvalidTimestamp(_))));
        assert!(matches!(results[1], Err(IngestError::InvalidTimestamp(_))));
        assert!(results[2].is_ok());
    }

    #[test]
    fn test_unknown_zone() {
        let n = normalizer(AmbiguousPolicy::Infer);
        let raw = RawTimestamp::Zoned {
            local: wall(2024, 6, 1, 8, 0),
            tz: "Mars/Olympus_Mons".to_string(),
        };
        assert!(matches!(
            n.normalize(&raw, TimestampStrategy::Actual),
            Err(IngestError::UnknownTimezone(_))
        ));
    }

    #[test]
    fn test_range_guards() {
        let n = normalizer(AmbiguousPolicy::Infer);
        let too_old = RawTimestamp::Naive(wall(1999, 12, 31, 12, 0));
        let too_new = RawTimestamp::Naive(wall(2025, 1, 3, 0, 0));
        let within_grace = RawTimestamp::Naive(wall(2025, 1, 1, 6, 0));

        assert!(matches!(
            n.normalize(&too_old, TimestampStrategy::Assumed),
            Err(IngestError::TimestampOutOfRange { .. })
        ));
        assert!(matches!(
            n.normalize(&too_new, TimestampStrategy::Assumed),
            Err(IngestError::TimestampOutOfRange { .. })
        ));
        assert!(n.normalize(&within_grace, TimestampStrategy::Assumed).is_ok());
    }

    #[test]
    fn test_lone_fold_value_is_ambiguous_under_infer() {
        let n = normalizer(AmbiguousPolicy::Infer);
        let raw = RawTimestamp::Naive(wall(2024, 11, 3, 1, 30));
        assert!(matches!(
            n.normalize(&raw, TimestampStrategy::Assumed),
            Err(IngestError::TimezoneAmbiguous { .. })
        ));
    }

    #[test]
    fn test_fixed_policy_resolves_lone_fold_value() {
        let raw = RawTimestamp::Naive(wall(2024, 11, 3, 1, 30));
        let earlier = normalizer(AmbiguousPolicy::Earlier)
            .normalize(&raw, TimestampStrategy::Assumed)
            .unwrap();
        let later = normalizer(AmbiguousPolicy::Later)
            .normalize(&raw, TimestampStrategy::Assumed)
            .unwrap();
        assert_eq!(later.utc - earlier.utc, Duration::hours(1));
        assert_eq!(earlier.local, later.local);
    }

    #[test]
    fn test_batch_infer_uses_neighbours() {
        let n = normalizer(AmbiguousPolicy::Infer);
        let raws: Vec<RawTimestamp> = [(0, 45), (1, 15), (1, 45), (1, 15), (1, 45), (2, 15)]
            .iter()
            .map(|&(h, m)| RawTimestamp::Naive(wall(2024, 11, 3, h, m)))
            .collect();

        let results = n.normalize_all(&raws, TimestampStrategy::Assumed);
        let utcs: Vec<_> = results.into_iter().map(|r| r.unwrap().utc).collect();

        assert!(utcs.windows(2).all(|w| w[0] < w[1]), "instants must increase: {:?}", utcs);
        assert_eq!(utcs[3] - utcs[1], Duration::hours(1));
    }

    #[test]
    fn test_spring_forward_gap_moves_forward() {
        let n = normalizer(AmbiguousPolicy::Infer);
        let ts = n
            .normalize(
                &RawTimestamp::Text("2024-03-10 02:30:00".into()),
                TimestampStrategy::Assumed,
            )
            .unwrap();
        assert_eq!(ts.utc, wall(2024, 3, 10, 7, 0).and_utc());
        assert_eq!(ts.local, wall(2024, 3, 10, 3, 0));
    }

    #[test]
    fn test_travel_day_offset_is_constant() {
        // Recorded in Paris at 08:00 local, stored as if New York wall clock
        let n = normalizer(AmbiguousPolicy::Infer);
        for (m, d) in [(1, 15), (4, 15), (7, 15), (10, 15)] {
            let local = wall(2024, m, d, 8, 0);
            let true_utc = local
                .and_local_timezone(chrono_tz::Europe::Paris)
                .single()
                .unwrap()
                .with_timezone(&Utc);
            let stored = n
                .normalize(&RawTimestamp::Naive(local), TimestampStrategy::Assumed)
                .unwrap()
                .utc;
            let home_offset = local
                .and_local_timezone(chrono_tz::America::New_York)
                .single()
                .unwrap()
                .with_timezone(&Utc)
                - local.and_utc();
            let visited_offset = true_utc - local.and_utc();
            assert_eq!(stored - true_utc, home_offset - visited_offset);
        }
    }

    #[test]
    fn test_sub_microsecond_precision_is_truncated() {
        let n = normalizer(AmbiguousPolicy::Infer);
        let raw = RawTimestamp::Instant {
            utc: wall(2024, 6, 1, 6, 0).and_utc() + Duration::nanoseconds(1_234_567),
            tz: "UTC".to_string(),
        };
        let ts = n.normalize(&raw, TimestampStrategy::Actual).unwrap();
        assert_eq!(ts.utc.nanosecond(), 1_234_000);
    }
}
