use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use meisai_core::{MatchType, MeisaiError, RecordId, Result, StatementFields, StatementRecord};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use crate::util::{normalize_point, point_similarity};

/// A record in an external accounting system that a statement row might
/// correspond to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchCandidate {
    pub id: String,
    pub entity_type: String,
    pub date: NaiveDate,
    /// Candidates without a time of day are compared on date alone.
    #[serde(default)]
    pub time: Option<NaiveTime>,
    pub entry_point: String,
    pub exit_point: String,
    pub amount: i64,
}

impl MatchCandidate {
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() || self.entity_type.trim().is_empty() {
            return Err(MeisaiError::validation("candidate id and entity_type are required"));
        }
        if self.amount < 0 {
            return Err(MeisaiError::validation(format!(
                "candidate {} has a negative amount: {}",
                self.id, self.amount
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredMatch {
    pub candidate_id: String,
    pub entity_type: String,
    pub confidence: f64,
    pub match_type: MatchType,
}

/// Proposals for one stored record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchProposal {
    pub record_id: RecordId,
    pub matches: Vec<ScoredMatch>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchConfig {
    pub time_window_minutes: i64,
    pub time_max_confidence: f64,
    pub time_min_confidence: f64,
    /// Absolute tolerance in yen.
    pub amount_tolerance: i64,
    /// Tolerance as a percentage of the statement amount; the wider of the
    /// two tolerances applies.
    pub amount_tolerance_pct: Option<f64>,
    pub amount_max_confidence: f64,
    pub amount_min_confidence: f64,
    pub fuzzy_threshold: f64,
    pub fuzzy_weight: f64,
    pub acceptance_threshold: f64,
}

impl Default for MatchConfig {
    fn default() -> Self {
        MatchConfig {
            time_window_minutes: 10,
            time_max_confidence: 0.98,
            time_min_confidence: 0.90,
            amount_tolerance: 100,
            amount_tolerance_pct: None,
            amount_max_confidence: 0.95,
            amount_min_confidence: 0.80,
            fuzzy_threshold: 0.7,
            fuzzy_weight: 0.9,
            acceptance_threshold: 0.5,
        }
    }
}

impl MatchConfig {
    pub fn validate(&self) -> Result<()> {
        let unit = |name: &str, v: f64| {
            if (0.0..=1.0).contains(&v) {
                Ok(())
            } else {
                Err(MeisaiError::validation(format!("{name} must be within [0, 1], got {v}")))
            }
        };
        unit("time_max_confidence", self.time_max_confidence)?;
        unit("time_min_confidence", self.time_min_confidence)?;
        unit("amount_max_confidence", self.amount_max_confidence)?;
        unit("amount_min_confidence", self.amount_min_confidence)?;
        unit("fuzzy_threshold", self.fuzzy_threshold)?;
        unit("fuzzy_weight", self.fuzzy_weight)?;
        unit("acceptance_threshold", self.acceptance_threshold)?;
        if self.time_min_confidence > self.time_max_confidence
            || self.amount_min_confidence > self.amount_max_confidence
        {
            return Err(MeisaiError::validation(
                "minimum confidences must not exceed their maximums",
            ));
        }
        if self.time_window_minutes < 0 || self.amount_tolerance < 0 {
            return Err(MeisaiError::validation(
                "time_window_minutes and amount_tolerance must not be negative",
            ));
        }
        if self.amount_tolerance_pct.is_some_and(|p| !(0.0..=100.0).contains(&p)) {
            return Err(MeisaiError::validation("amount_tolerance_pct must be within [0, 100]"));
        }
        Ok(())
    }
}

/// Strategy rank used to break confidence ties.
fn rank(match_type: MatchType) -> u8 {
    match match_type {
        MatchType::Exact => 4,
        MatchType::Time => 3,
        MatchType::Amount => 2,
        MatchType::Fuzzy => 1,
        MatchType::Manual => 0,
    }
}

/// Scores external candidates against statement records.
///
/// Four strategies run independently per candidate and the strongest one
/// wins: exact, time window, amount tolerance and fuzzy station names.
#[derive(Debug, Clone, Default)]
pub struct MatchEngine {
    config: MatchConfig,
}

impl MatchEngine {
    pub fn new(config: MatchConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &MatchConfig {
        &self.config
    }

    /// Every candidate scoring at least `acceptance_threshold`, best first.
    pub fn propose(&self, record: &StatementFields, candidates: &[MatchCandidate]) -> Vec<ScoredMatch> {
        let mut scored: Vec<ScoredMatch> = candidates
            .iter()
            .filter_map(|c| {
                let (match_type, confidence) = self.score(record, c)?;
                (confidence >= self.config.acceptance_threshold).then(|| ScoredMatch {
                    candidate_id: c.id.clone(),
                    entity_type: c.entity_type.clone(),
                    confidence,
                    match_type,
                })
            })
            .collect();
        scored.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(Ordering::Equal)
                .then_with(|| rank(b.match_type).cmp(&rank(a.match_type)))
                .then_with(|| a.candidate_id.cmp(&b.candidate_id))
        });
        scored
    }

    /// Runs [`MatchEngine::propose`] for each stored record. Records without
    /// an id are skipped.
    pub fn propose_batch(&self, records: &[StatementRecord], candidates: &[MatchCandidate]) -> Vec<BatchProposal> {
        records
            .iter()
            .filter_map(|r| {
                Some(BatchProposal {
                    record_id: r.id?,
                    matches: self.propose(&r.fields, candidates),
                })
            })
            .collect()
    }

    /// The best strategy for one pair, if any applies.
    fn score(&self, record: &StatementFields, c: &MatchCandidate) -> Option<(MatchType, f64)> {
        if c.amount < 0 {
            return None;
        }
        let cfg = &self.config;
        let minutes = self.minutes_apart(record, c)?;
        let same_points = normalize_point(&record.entry_point) == normalize_point(&c.entry_point)
            && normalize_point(&record.exit_point) == normalize_point(&c.exit_point);
        let amount_delta = record.toll_amount.abs_diff(c.amount);

        let mut options: Vec<(MatchType, f64)> = Vec::with_capacity(4);

        if minutes == 0.0 && same_points && amount_delta == 0 {
            options.push((MatchType::Exact, 1.0));
        }

        let window = cfg.time_window_minutes as f64;
        if minutes > 0.0 && minutes <= window && same_points && amount_delta == 0 {
            options.push((
                MatchType::Time,
                scale(cfg.time_max_confidence, cfg.time_min_confidence, minutes / window),
            ));
        }

        let tolerance = self.amount_tolerance(record.toll_amount);
        if minutes == 0.0 && same_points && amount_delta > 0 && (amount_delta as f64) <= tolerance {
            options.push((
                MatchType::Amount,
                scale(
                    cfg.amount_max_confidence,
                    cfg.amount_min_confidence,
                    amount_delta as f64 / tolerance,
                ),
            ));
        }

        let same_day = c.date == record.date;
        if same_day && amount_delta == 0 && minutes <= window {
            let similarity = (point_similarity(&record.entry_point, &c.entry_point)
                + point_similarity(&record.exit_point, &c.exit_point))
                / 2.0;
            if similarity >= cfg.fuzzy_threshold {
                options.push((MatchType::Fuzzy, similarity * cfg.fuzzy_weight));
            }
        }

        options.into_iter().max_by(|a, b| {
            a.1.partial_cmp(&b.1)
                .unwrap_or(Ordering::Equal)
                .then_with(|| rank(a.0).cmp(&rank(b.0)))
        })
    }

    /// Minutes between the two timestamps, or 0 for a date-only candidate
    /// on the same day. `None` when a date-only candidate is on another day.
    fn minutes_apart(&self, record: &StatementFields, c: &MatchCandidate) -> Option<f64> {
        match c.time {
            Some(t) => {
                let a = NaiveDateTime::new(record.date, record.time);
                let b = NaiveDateTime::new(c.date, t);
                Some((a - b).num_seconds().unsigned_abs() as f64 / 60.0)
            }
            None if c.date == record.date => Some(0.0),
            None => None,
        }
    }

    fn amount_tolerance(&self, amount: i64) -> f64 {
        let absolute = self.config.amount_tolerance as f64;
        let relative = self
            .config
            .amount_tolerance_pct
            .map_or(0.0, |pct| amount as f64 * pct / 100.0);
        absolute.max(relative)
    }
}

/// Linear interpolation from `max` at `ratio == 0` down to `min` at 1.
fn scale(max: f64, min: f64, ratio: f64) -> f64 {
    max - (max - min) * ratio.clamp(0.0, 1.0)
}
