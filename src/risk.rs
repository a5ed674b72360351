use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::error::{EngineError, EngineResult};
use crate::models::{RiskLevel, RiskScoreRecord, RunType};
use crate::rolling::{self, SignalSnapshot, WARM_UP};
use crate::series::QuarterlySeries;

pub const MIN_LIVE_HISTORY: usize = WARM_UP + 1;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Condition {
    GrowthAbove(f64),
    AccelAbove(f64),
    AbsZAbove(f64),
    MomentumPositive,
    AbsCorrAbove(f64),
    GrowthAndDeviation { growth: f64, abs_z: f64 },
}

impl Condition {
    /// Undefined signals never satisfy a condition.
    pub fn holds(&self, s: &SignalSnapshot) -> bool {
        match *self {
            Condition::GrowthAbove(t) => s.growth.is_some_and(|g| g > t),
            Condition::AccelAbove(t) => s.growth_accel.is_some_and(|a| a > t),
            Condition::AbsZAbove(t) => s.z.is_some_and(|z| z.abs() > t),
            Condition::MomentumPositive => s.momentum == Some(true),
            Condition::AbsCorrAbove(t) => s.corr.is_some_and(|c| c.abs() > t),
            Condition::GrowthAndDeviation { growth, abs_z } => {
                s.growth.is_some_and(|g| g > growth) && s.z.is_some_and(|z| z.abs() > abs_z)
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Rule {
    pub condition: Condition,
    pub points: u32,
    pub label: &'static str,
}

const fn rule(condition: Condition, points: u32, label: &'static str) -> Rule {
    Rule {
        condition,
        points,
        label,
    }
}

/// Each group contributes at most one rule: the first whose condition holds.
pub const RULE_GROUPS: &[&[Rule]] = &[
    &[
        rule(Condition::GrowthAbove(0.25), 30, "Growth > 25%"),
        rule(Condition::GrowthAbove(0.20), 25, "Growth > 20%"),
        rule(Condition::GrowthAbove(0.15), 20, "Growth > 15%"),
        rule(Condition::GrowthAbove(0.10), 10, "Growth > 10%"),
        rule(Condition::GrowthAbove(0.05), 5, "Growth > 5%"),
    ],
    &[rule(Condition::AccelAbove(0.03), 5, "Acceleration > 3%")],
    &[
        rule(Condition::AbsZAbove(3.0), 25, "Z > 3"),
        rule(Condition::AbsZAbove(2.0), 15, "Z > 2"),
        rule(Condition::AbsZAbove(1.0), 5, "Z > 1"),
    ],
    &[rule(Condition::MomentumPositive, 15, "Momentum Positive")],
    &[
        rule(Condition::AbsCorrAbove(0.8), 20, "Corr > 0.8"),
        rule(Condition::AbsCorrAbove(0.6), 10, "Corr > 0.6"),
    ],
    &[rule(
        Condition::GrowthAndDeviation {
            growth: 0.15,
            abs_z: 2.0,
        },
        10,
        "Compound Growth+Deviation",
    )],
];

pub fn evaluate(signals: &SignalSnapshot) -> (u32, Vec<String>) {
    let mut score = 0;
    let mut notes = Vec::new();

    for group in RULE_GROUPS {
        if let Some(hit) = group.iter().find(|r| r.condition.holds(signals)) {
            score += hit.points;
            notes.push(hit.label.to_string());
        }
    }

    (score, notes)
}

pub fn risk_level(score: u32) -> RiskLevel {
    match score {
        0..=40 => RiskLevel::Low,
        41..=60 => RiskLevel::Medium,
        _ => RiskLevel::High,
    }
}

pub fn score_series(
    series: &QuarterlySeries,
    run_type: RunType,
    now: DateTime<Utc>,
) -> Vec<RiskScoreRecord> {
    let signals = rolling::compute_signals(&series.prices(), &series.mortgage_rates());
    let dates = series.dates();

    (WARM_UP..series.len())
        .map(|i| {
            let (risk_score, notes) = evaluate(&signals.at(i));
            RiskScoreRecord {
                date_key: dates[i],
                risk_score,
                risk_level: risk_level(risk_score),
                notes,
                run_type,
                calculation_timestamp: now,
            }
        })
        .collect()
}

pub fn bulk_score(series: &QuarterlySeries, now: DateTime<Utc>) -> Vec<RiskScoreRecord> {
    let records = score_series(series, RunType::Bulk, now);
    info!(
        quarters = series.len(),
        scored = records.len(),
        "bulk risk scoring complete"
    );
    records
}

pub fn live_score(
    series: &QuarterlySeries,
    lookback: usize,
    now: DateTime<Utc>,
) -> EngineResult<RiskScoreRecord> {
    if series.len() < MIN_LIVE_HISTORY {
        return Err(EngineError::InsufficientHistory {
            required: MIN_LIVE_HISTORY,
            available: series.len(),
        });
    }

    let recent = series.tail(lookback.max(MIN_LIVE_HISTORY));
    let record = score_series(&recent, RunType::Live, now)
        .pop()
        .ok_or(EngineError::InsufficientHistory {
            required: MIN_LIVE_HISTORY,
            available: recent.len(),
        })?;

    debug!(date = %record.date_key, score = record.risk_score, "live score computed");
    Ok(record)
}

/// Keeps one record per quarter: the one with the latest calculation
/// timestamp. Later records win ties.
pub fn latest_per_quarter(records: &[RiskScoreRecord]) -> Vec<RiskScoreRecord> {
    let mut latest: BTreeMap<_, &RiskScoreRecord> = BTreeMap::new();

    for record in records {
        latest
            .entry(record.date_key)
            .and_modify(|kept| {
                if record.calculation_timestamp >= kept.calculation_timestamp {
                    *kept = record;
                }
            })
            .or_insert(record);
    }

    latest.into_values().cloned().collect()
}
