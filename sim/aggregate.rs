//! # Condition-Level Aggregation
//!
//! Folds the replicate estimates of one condition into a single summary row.
//! Three coverage statistics are computed and kept strictly separate:
//!
//! 1. **Quantile coverage** — does the true effect fall inside the empirical
//!    [2.5%, 97.5%] interval of the replicate coefficients? One verdict per
//!    condition, using the sampling distribution itself.
//! 2. **Normal-approximation coverage** — one interval per condition from the
//!    mean coefficient ± 1.96 × the mean standard error.
//! 3. **Empirical coverage** — per replicate, coefficient ± 1.96 × its own SE;
//!    reported as the fraction of converged replicates whose interval
//!    contains the truth.
//!
//! Failed fits never enter coefficient or SE means and are never coerced to
//! zero; they surface only through the failure rate. A method whose fits all
//! failed reports `None` across the board — an all-NA column in the output is
//! the designed signal for total estimation failure, not a bug.

use crate::estimate::{Method, ReplicateResult};
use crate::grid::Condition;
use serde::Serialize;
use std::collections::HashSet;
use std::io::Write;
use std::path::Path;

/// Critical value for all 95% intervals.
pub const Z_95: f64 = 1.96;

/// Aggregate of one method over one condition's replicates.
#[derive(Clone, Debug, Serialize)]
pub struct MethodSummary {
    pub method: Method,
    pub mean_coefficient: Option<f64>,
    pub mean_std_error: Option<f64>,
    pub sd_coefficient: Option<f64>,
    pub quantile_coverage: Option<bool>,
    pub normal_coverage: Option<bool>,
    pub empirical_coverage: Option<f64>,
    pub failure_rate: f64,
    pub replicates_used: usize,
}

/// One row of the study's result table.
#[derive(Clone, Debug, Serialize)]
pub struct ConditionSummary {
    pub condition: Condition,
    pub replicates_total: usize,
    pub mean_reliability: Option<f64>,
    /// Per-method aggregates in `Method::ALL` order.
    pub methods: Vec<MethodSummary>,
}

impl ConditionSummary {
    pub fn method(&self, method: Method) -> &MethodSummary {
        &self.methods[method.index()]
    }
}

/// Type-7 percentile (linear interpolation) over a sorted slice.
fn percentile(sorted: &[f64], q: f64) -> f64 {
    let n = sorted.len();
    if n == 1 {
        return sorted[0];
    }
    let h = (n - 1) as f64 * q;
    let lo = h.floor() as usize;
    let hi = h.ceil() as usize;
    let frac = h - lo as f64;
    sorted[lo] + frac * (sorted[hi] - sorted[lo])
}

/// Empirical [2.5%, 97.5%] interval of the replicate coefficients.
fn quantile_interval(coefficients: &[f64]) -> (f64, f64) {
    let mut sorted = coefficients.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    (percentile(&sorted, 0.025), percentile(&sorted, 0.975))
}

fn summarize_method(
    method: Method,
    results: &[ReplicateResult],
    true_effect: f64,
) -> MethodSummary {
    let total = results.len();
    let pairs: Vec<(f64, f64)> = results
        .iter()
        .map(|r| r.estimate(method))
        .filter(|e| e.converged)
        .filter_map(|e| match (e.coefficient, e.std_error) {
            (Some(c), Some(s)) if c.is_finite() && s.is_finite() => Some((c, s)),
            _ => None,
        })
        .collect();
    let used = pairs.len();
    let failure_rate = if total > 0 {
        (total - used) as f64 / total as f64
    } else {
        0.0
    };

    if used == 0 {
        return MethodSummary {
            method,
            mean_coefficient: None,
            mean_std_error: None,
            sd_coefficient: None,
            quantile_coverage: None,
            normal_coverage: None,
            empirical_coverage: None,
            failure_rate,
            replicates_used: 0,
        };
    }

    let coefficients: Vec<f64> = pairs.iter().map(|&(c, _)| c).collect();
    let mean_coefficient = coefficients.iter().sum::<f64>() / used as f64;
    let mean_std_error = pairs.iter().map(|&(_, s)| s).sum::<f64>() / used as f64;
    let sd_coefficient = if used >= 2 {
        Some(
            (coefficients
                .iter()
                .map(|c| (c - mean_coefficient).powi(2))
                .sum::<f64>()
                / (used as f64 - 1.0))
                .sqrt(),
        )
    } else {
        None
    };

    let (lo, hi) = quantile_interval(&coefficients);
    let quantile_coverage = lo <= true_effect && true_effect <= hi;

    let half_width = Z_95 * mean_std_error;
    let normal_coverage = (mean_coefficient - half_width) <= true_effect
        && true_effect <= (mean_coefficient + half_width);

    let covered = pairs
        .iter()
        .filter(|&&(c, s)| (c - true_effect).abs() <= Z_95 * s)
        .count();
    let empirical_coverage = covered as f64 / used as f64;

    MethodSummary {
        method,
        mean_coefficient: Some(mean_coefficient),
        mean_std_error: Some(mean_std_error),
        sd_coefficient,
        quantile_coverage: Some(quantile_coverage),
        normal_coverage: Some(normal_coverage),
        empirical_coverage: Some(empirical_coverage),
        failure_rate,
        replicates_used: used,
    }
}

/// Folds all replicates of a condition into its summary row.
pub fn summarize(condition: &Condition, results: &[ReplicateResult]) -> ConditionSummary {
    let reliabilities: Vec<f64> = results.iter().filter_map(|r| r.reliability).collect();
    let mean_reliability = if reliabilities.is_empty() {
        None
    } else {
        Some(reliabilities.iter().sum::<f64>() / reliabilities.len() as f64)
    };

    ConditionSummary {
        condition: *condition,
        replicates_total: results.len(),
        mean_reliability,
        methods: Method::ALL
            .iter()
            .map(|&m| summarize_method(m, results, condition.effect_size))
            .collect(),
    }
}

fn na_float(value: Option<f64>) -> String {
    value.map_or_else(|| "NA".to_string(), |v| format!("{v}"))
}

fn na_bool(value: Option<bool>) -> String {
    value.map_or_else(|| "NA".to_string(), |v| v.to_string())
}

/// Column header for the checkpoint/output table: the four design fields,
/// the condition-level statistics, then eight columns per method.
pub fn csv_header() -> Vec<String> {
    let mut header = vec![
        "mean_loading".to_string(),
        "num_items".to_string(),
        "effect_size".to_string(),
        "sample_size".to_string(),
        "replicates_total".to_string(),
        "mean_reliability".to_string(),
    ];
    for method in Method::ALL {
        let m = method.as_str();
        header.push(format!("{m}_mean_coefficient"));
        header.push(format!("{m}_mean_std_error"));
        header.push(format!("{m}_sd_coefficient"));
        header.push(format!("{m}_quantile_coverage"));
        header.push(format!("{m}_normal_coverage"));
        header.push(format!("{m}_empirical_coverage"));
        header.push(format!("{m}_failure_rate"));
        header.push(format!("{m}_replicates_used"));
    }
    header
}

/// Flattens one summary into a CSV record matching `csv_header`.
pub fn csv_record(summary: &ConditionSummary) -> Vec<String> {
    let c = &summary.condition;
    let mut record = vec![
        format!("{}", c.mean_loading),
        format!("{}", c.num_items),
        format!("{}", c.effect_size),
        format!("{}", c.sample_size),
        format!("{}", summary.replicates_total),
        na_float(summary.mean_reliability),
    ];
    for method in &summary.methods {
        record.push(na_float(method.mean_coefficient));
        record.push(na_float(method.mean_std_error));
        record.push(na_float(method.sd_coefficient));
        record.push(na_bool(method.quantile_coverage));
        record.push(na_bool(method.normal_coverage));
        record.push(na_float(method.empirical_coverage));
        record.push(format!("{}", method.failure_rate));
        record.push(format!("{}", method.replicates_used));
    }
    record
}

/// Writes a complete summary table (header plus one row per condition).
pub fn write_summaries<W: Write>(
    writer: W,
    summaries: &[ConditionSummary],
) -> Result<(), csv::Error> {
    let mut csv_writer = csv::Writer::from_writer(writer);
    csv_writer.write_record(csv_header())?;
    for summary in summaries {
        csv_writer.write_record(csv_record(summary))?;
    }
    csv_writer.flush()?;
    Ok(())
}

/// Reads the condition keys already present in a checkpoint file. Rows whose
/// design fields fail to parse are skipped (and logged) rather than trusted.
pub fn read_completed_keys(path: &Path) -> Result<HashSet<String>, csv::Error> {
    let mut keys = HashSet::new();
    let mut reader = csv::Reader::from_path(path)?;
    for record in reader.records() {
        let record = record?;
        let parsed = (
            record.get(0).and_then(|v| v.parse::<f64>().ok()),
            record.get(1).and_then(|v| v.parse::<usize>().ok()),
            record.get(2).and_then(|v| v.parse::<f64>().ok()),
            record.get(3).and_then(|v| v.parse::<usize>().ok()),
        );
        match parsed {
            (Some(loading), Some(items), Some(effect), Some(n)) => {
                keys.insert(Condition::new(loading, items, effect, n).key());
            }
            _ => log::warn!("skipping unparseable checkpoint row: {record:?}"),
        }
    }
    Ok(keys)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::estimate::Estimate;
    use approx::assert_abs_diff_eq;

    fn synthetic_result(coefficient: f64, std_error: f64) -> ReplicateResult {
        ReplicateResult {
            estimates: [
                Estimate::converged(Method::SingleItem, coefficient, std_error),
                Estimate::converged(Method::SumScore, coefficient, std_error),
                Estimate::converged(Method::FactorScore, coefficient, std_error),
                Estimate::converged(Method::Sem, coefficient, std_error),
            ],
            reliability: Some(0.8),
        }
    }

    fn failed_result() -> ReplicateResult {
        ReplicateResult {
            estimates: [
                Estimate::failed(Method::SingleItem),
                Estimate::failed(Method::SumScore),
                Estimate::failed(Method::FactorScore),
                Estimate::failed(Method::Sem),
            ],
            reliability: None,
        }
    }

    #[test]
    fn percentile_interpolates_linearly() {
        let sorted = [1.0, 2.0, 3.0, 4.0, 5.0];
        assert_abs_diff_eq!(percentile(&sorted, 0.0), 1.0);
        assert_abs_diff_eq!(percentile(&sorted, 1.0), 5.0);
        assert_abs_diff_eq!(percentile(&sorted, 0.5), 3.0);
        assert_abs_diff_eq!(percentile(&sorted, 0.25), 2.0);
    }

    #[test]
    fn exact_estimates_give_full_coverage_on_all_three_metrics() {
        let condition = Condition::new(0.5, 3, 0.3, 100);
        let results: Vec<ReplicateResult> =
            (0..50).map(|_| synthetic_result(0.3, 0.05)).collect();
        let summary = summarize(&condition, &results);
        for method in &summary.methods {
            assert_eq!(method.quantile_coverage, Some(true));
            assert_eq!(method.normal_coverage, Some(true));
            assert_eq!(method.empirical_coverage, Some(1.0));
            assert_eq!(method.failure_rate, 0.0);
            assert_abs_diff_eq!(method.mean_coefficient.unwrap(), 0.3);
        }
    }

    #[test]
    fn offset_estimates_with_zero_se_give_zero_coverage() {
        let condition = Condition::new(0.5, 3, 0.3, 100);
        let results: Vec<ReplicateResult> =
            (0..50).map(|_| synthetic_result(0.55, 0.0)).collect();
        let summary = summarize(&condition, &results);
        for method in &summary.methods {
            assert_eq!(method.quantile_coverage, Some(false));
            assert_eq!(method.normal_coverage, Some(false));
            assert_eq!(method.empirical_coverage, Some(0.0));
        }
    }

    #[test]
    fn failures_are_excluded_from_means_but_counted_in_failure_rate() {
        let condition = Condition::new(0.5, 3, 0.3, 100);
        let mut results: Vec<ReplicateResult> =
            (0..8).map(|_| synthetic_result(0.3, 0.05)).collect();
        results.push(failed_result());
        results.push(failed_result());
        let summary = summarize(&condition, &results);
        assert_eq!(summary.replicates_total, 10);
        for method in &summary.methods {
            assert_eq!(method.replicates_used, 8);
            assert_abs_diff_eq!(method.failure_rate, 0.2);
            // Means reflect only the converged fits; failures are not zeros.
            assert_abs_diff_eq!(method.mean_coefficient.unwrap(), 0.3);
        }
    }

    #[test]
    fn total_failure_yields_all_none() {
        let condition = Condition::new(0.25, 3, 0.15, 100);
        let results: Vec<ReplicateResult> = (0..5).map(|_| failed_result()).collect();
        let summary = summarize(&condition, &results);
        for method in &summary.methods {
            assert!(method.mean_coefficient.is_none());
            assert!(method.quantile_coverage.is_none());
            assert_eq!(method.failure_rate, 1.0);
        }
        assert!(summary.mean_reliability.is_none());
    }

    #[test]
    fn csv_round_trip_recovers_condition_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("summaries.csv");
        let conditions = [
            Condition::new(0.25, 3, 0.15, 100),
            Condition::new(0.8, 6, 0.5, 1000),
        ];
        let summaries: Vec<ConditionSummary> = conditions
            .iter()
            .map(|c| summarize(c, &[synthetic_result(c.effect_size, 0.05)]))
            .collect();
        let file = std::fs::File::create(&path).unwrap();
        write_summaries(file, &summaries).unwrap();

        let keys = read_completed_keys(&path).unwrap();
        assert_eq!(keys.len(), 2);
        for condition in &conditions {
            assert!(keys.contains(&condition.key()));
        }
    }

    #[test]
    fn header_and_record_have_matching_lengths() {
        let condition = Condition::new(0.5, 3, 0.3, 100);
        let summary = summarize(&condition, &[synthetic_result(0.3, 0.05)]);
        assert_eq!(csv_header().len(), csv_record(&summary).len());
    }
}
