use std::collections::BTreeMap;
use std::fmt::Write;

use crate::models::{ModelKind, ModelMetrics, RiskLevel, RiskLevelSummary, RiskScoreRecord};

const RECENT_QUARTERS: usize = 20;

pub fn summarize_by_level(scores: &[RiskScoreRecord]) -> Vec<RiskLevelSummary> {
    let mut map: BTreeMap<&'static str, (RiskLevel, usize, u32)> = BTreeMap::new();

    for score in scores {
        let entry = map
            .entry(score.risk_level.as_str())
            .or_insert((score.risk_level, 0, 0));
        entry.1 += 1;
        entry.2 += score.risk_score;
    }

    let mut summaries: Vec<RiskLevelSummary> = map
        .into_values()
        .map(|(risk_level, count, total)| RiskLevelSummary {
            risk_level,
            count,
            avg_score: if count == 0 {
                0.0
            } else {
                total as f64 / count as f64
            },
        })
        .collect();

    summaries.sort_by(|a, b| b.count.cmp(&a.count));
    summaries
}

pub fn rmse_comment(rmse: f64) -> &'static str {
    if rmse < 5.0 {
        "very close to actual price movements (excellent fit)"
    } else if rmse < 10.0 {
        "reasonably close to actual values (good fit)"
    } else {
        "deviates significantly from actual values (needs improvement)"
    }
}

pub fn adjusted_r2_comment(adjusted_r2: f64) -> String {
    let pct = adjusted_r2 * 100.0;
    if adjusted_r2 > 0.95 {
        format!("explains {pct:.1}% of market variation (excellent explanatory power)")
    } else if adjusted_r2 > 0.85 {
        format!("explains {pct:.1}% of variation (good, but could be better)")
    } else {
        format!("explains only {pct:.1}% of variation (model may be underfitting)")
    }
}

pub fn smape_comment(smape: f64) -> &'static str {
    if smape < 5.0 {
        "low percentage error (highly accurate)"
    } else if smape < 15.0 {
        "moderate percentage error (acceptable accuracy)"
    } else {
        "high percentage error (struggling to capture trends)"
    }
}

pub fn build_report(
    source: &str,
    scores: &[RiskScoreRecord],
    metrics: Option<&BTreeMap<ModelKind, ModelMetrics>>,
) -> String {
    let summaries = summarize_by_level(scores);
    let mut output = String::new();

    let _ = writeln!(output, "# Housing Bubble Risk Report");
    let _ = writeln!(
        output,
        "Generated from {} ({} quarters scored)",
        source,
        scores.len()
    );
    let _ = writeln!(output);
    let _ = writeln!(output, "## Latest Score");

    match scores.last() {
        Some(latest) => {
            let _ = writeln!(
                output,
                "- {}: score {} ({})",
                latest.date_key, latest.risk_score, latest.risk_level
            );
            if latest.notes.is_empty() {
                let _ = writeln!(output, "- No risk rules triggered.");
            } else {
                let _ = writeln!(output, "- Triggered: {}", latest.notes_display());
            }
        }
        None => {
            let _ = writeln!(output, "Not enough history to score any quarter.");
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Risk Mix");

    if summaries.is_empty() {
        let _ = writeln!(output, "No scored quarters.");
    } else {
        for summary in summaries.iter() {
            let _ = writeln!(
                output,
                "- {}: {} quarters (avg score {:.1})",
                summary.risk_level, summary.count, summary.avg_score
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Recent Quarters");

    let recent_start = scores.len().saturating_sub(RECENT_QUARTERS);
    if scores.is_empty() {
        let _ = writeln!(output, "No scored quarters.");
    } else {
        let _ = writeln!(output, "| Quarter | Score | Level | Notes |");
        let _ = writeln!(output, "|---|---|---|---|");
        for score in scores[recent_start..].iter().rev() {
            let _ = writeln!(
                output,
                "| {} | {} | {} | {} |",
                score.date_key,
                score.risk_score,
                score.risk_level,
                score.notes_display()
            );
        }
    }

    if let Some(metrics) = metrics {
        let _ = writeln!(output);
        let _ = writeln!(output, "## Model Performance (walk-forward)");

        for (model, m) in metrics {
            let adjusted = m
                .adjusted_r2
                .map_or_else(|| "n/a".to_string(), |v| format!("{v:.3}"));
            let _ = writeln!(
                output,
                "- {}: RMSE {:.2}, Adjusted R² {}, SMAPE {:.2}% over {} quarters",
                model, m.rmse, adjusted, m.smape, m.held_out
            );
            let _ = writeln!(output, "  - RMSE ~{:.2}: {}", m.rmse, rmse_comment(m.rmse));
            if let Some(value) = m.adjusted_r2 {
                let _ = writeln!(
                    output,
                    "  - Adjusted R² ~{:.3}: {}",
                    value,
                    adjusted_r2_comment(value)
                );
            }
            let _ = writeln!(output, "  - SMAPE ~{:.2}%: {}", m.smape, smape_comment(m.smape));
        }
    }

    output
}
