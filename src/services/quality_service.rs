//! Quality Service
//!
//! Scores a run of stored bars. Starts at 100 and deducts for missing
//! prices, gaps in the sampling grid and impossible prices.

use crate::db::models::Bar;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Gaps only count on series longer than this
const MIN_ROWS_FOR_GAPS: usize = 10;

/// Spacing above this multiple of the usual spacing is a gap
const GAP_FACTOR: i64 = 5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityReport {
    pub score: f64,
    pub issues: Vec<String>,
    pub total_rows: usize,
    pub start: Option<String>,
    pub end: Option<String>,
}

pub struct QualityService;

impl QualityService {
    /// Assess bars sorted by ts ascending
    pub fn assess(bars: &[Bar]) -> QualityReport {
        if bars.is_empty() {
            return QualityReport {
                score: 0.0,
                issues: vec!["No data".to_string()],
                total_rows: 0,
                start: None,
                end: None,
            };
        }

        let rows = bars.len();
        let mut score = 100.0_f64;
        let mut issues = Vec::new();

        let missing: usize = bars
            .iter()
            .map(|b| {
                [b.open, b.high, b.low, b.close]
                    .iter()
                    .filter(|v| v.is_none())
                    .count()
            })
            .sum();
        if missing > 0 {
            score -= (missing as f64 / rows as f64 * 100.0).min(20.0);
            issues.push(format!("Found {} missing values", missing));
        }

        if rows > MIN_ROWS_FOR_GAPS {
            let gaps = count_gaps(bars);
            if gaps > 0 {
                score -= (gaps as f64).min(10.0);
                issues.push(format!("Found {} potential data gaps", gaps));
            }
        }

        let inverted = bars
            .iter()
            .filter(|b| matches!((b.high, b.low), (Some(h), Some(l)) if h < l))
            .count();
        if inverted > 0 {
            score -= 20.0;
            issues.push(format!("Found {} rows where High < Low", inverted));
        }

        let zero_close = bars.iter().filter(|b| b.close == Some(0.0)).count();
        if zero_close > 0 {
            score -= 30.0;
            issues.push(format!("Found {} rows with 0 price", zero_close));
        }

        QualityReport {
            score: (score.max(0.0) * 10.0).round() / 10.0,
            issues,
            total_rows: rows,
            start: bars.first().map(|b| b.ts.format("%Y-%m-%d").to_string()),
            end: bars.last().map(|b| b.ts.format("%Y-%m-%d").to_string()),
        }
    }
}

/// Spacings larger than `GAP_FACTOR` times the most common spacing
fn count_gaps(bars: &[Bar]) -> usize {
    let diffs: Vec<i64> = bars
        .windows(2)
        .map(|w| (w[1].ts - w[0].ts).num_seconds())
        .collect();

    let mut freq: HashMap<i64, usize> = HashMap::new();
    for d in &diffs {
        *freq.entry(*d).or_default() += 1;
    }

    // Most common spacing, smallest on ties
    let Some(modal) = freq
        .into_iter()
        .max_by(|a, b| a.1.cmp(&b.1).then(b.0.cmp(&a.0)))
        .map(|(d, _)| d)
    else {
        return 0;
    };

    diffs.iter().filter(|d| **d > modal * GAP_FACTOR).count()
}
