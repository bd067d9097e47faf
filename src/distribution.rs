//! LTV distribution aggregation and depth-chart projections.

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::debug;

use crate::bucket::{
    BucketPolicy, BucketPolicyError, PolicyKind, PolicyRequest, DEFAULT_BINS_PER_DECADE,
    DEFAULT_FIXED_WIDTH, DEFAULT_SYMLOG_LINEAR_WIDTH, DEFAULT_SYMLOG_STEP,
};
use crate::loan::Loan;
use crate::ltv::loan_ltv;

/// Spans wider than this are filled sparsely. Empty buckets never reach the
/// output, so the result is the same either way.
const MAX_SPAN_BUCKETS: u64 = 10_000;

/// Segment boundaries used by the segmented view.
pub const STANDARD_SEGMENTS: [(f64, f64); 3] =
    [(0.0, 100.0), (100.0, 500.0), (500.0, f64::INFINITY)];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DistributionBucket {
    pub index: i64,
    pub ltv_key: f64,
    pub ltv_upper: f64,
    pub loan_count: u64,
    pub total_value_usd: f64,
    pub cumulative_loan_count: u64,
    pub cumulative_value_usd: f64,
}

/// Buckets ordered by ascending key. Cumulative fields accumulate from the
/// highest bucket down: value at or above each LTV level.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DistributionSeries {
    policy: BucketPolicy,
    floor_price_usd: f64,
    valid_loans: u64,
    skipped_loans: u64,
    buckets: Vec<DistributionBucket>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DepthPoint {
    pub ltv: f64,
    pub value: f64,
    pub cumulative_value: f64,
    pub loan_count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct HistogramPoint {
    pub ltv: f64,
    pub ltv_upper: f64,
    pub loan_count: u64,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SeriesSegment {
    pub lower: f64,
    pub upper: f64,
    pub buckets: Vec<DistributionBucket>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LtvRange {
    pub min: f64,
    pub max: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LoanStats {
    pub count: u64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub median: f64,
    pub std_dev: f64,
}

impl DistributionSeries {
    fn empty(policy: &BucketPolicy, floor_price_usd: f64, skipped_loans: u64) -> Self {
        Self {
            policy: policy.clone(),
            floor_price_usd,
            valid_loans: 0,
            skipped_loans,
            buckets: Vec::new(),
        }
    }

    pub fn policy(&self) -> &BucketPolicy {
        &self.policy
    }

    pub fn floor_price_usd(&self) -> f64 {
        self.floor_price_usd
    }

    pub fn valid_loans(&self) -> u64 {
        self.valid_loans
    }

    pub fn skipped_loans(&self) -> u64 {
        self.skipped_loans
    }

    pub fn buckets(&self) -> &[DistributionBucket] {
        &self.buckets
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Bucket that `ltv` falls into under this series' own policy.
    pub fn bucket_containing(&self, ltv: f64) -> Option<&DistributionBucket> {
        let index = self.policy.bucket_index(ltv);
        self.buckets
            .binary_search_by_key(&index, |bucket| bucket.index)
            .ok()
            .map(|pos| &self.buckets[pos])
    }

    pub fn depth_points(&self) -> Vec<DepthPoint> {
        self.buckets
            .iter()
            .map(|bucket| DepthPoint {
                ltv: bucket.ltv_key,
                value: bucket.total_value_usd,
                cumulative_value: bucket.cumulative_value_usd,
                loan_count: bucket.loan_count,
            })
            .collect()
    }

    pub fn histogram_points(&self) -> Vec<HistogramPoint> {
        self.buckets
            .iter()
            .map(|bucket| HistogramPoint {
                ltv: bucket.ltv_key,
                ltv_upper: bucket.ltv_upper,
                loan_count: bucket.loan_count,
                value: bucket.total_value_usd,
            })
            .collect()
    }

    /// Buckets with `lower <= key < upper`, cumulative fields untouched.
    pub fn segment(&self, lower: f64, upper: f64) -> SeriesSegment {
        SeriesSegment {
            lower,
            upper,
            buckets: self
                .buckets
                .iter()
                .filter(|bucket| bucket.ltv_key >= lower && bucket.ltv_key < upper)
                .cloned()
                .collect(),
        }
    }

    pub fn standard_segments(&self) -> Vec<SeriesSegment> {
        STANDARD_SEGMENTS
            .iter()
            .map(|(lower, upper)| self.segment(*lower, *upper))
            .collect()
    }
}

/// Folds `loans` into a depth-chart series.
///
/// Loans without a computable LTV are skipped and counted. The output does
/// not depend on input order: per-bucket values are summed in sorted order.
pub fn aggregate(
    loans: &[Loan],
    floor_price_usd: f64,
    policy: &BucketPolicy,
) -> DistributionSeries {
    let mut skipped = 0u64;
    let mut valid = Vec::with_capacity(loans.len());
    for loan in loans {
        match valid_point(loan, floor_price_usd) {
            Some(point) => valid.push(point),
            None => {
                skipped += 1;
                debug!(
                    component = "distribution",
                    event = "distribution.loan.skipped",
                    loan_id = %loan.loan_id,
                    principal_usd = ?loan.principal_amount_usd,
                    floor_price_usd
                );
            }
        }
    }

    let Some(range) = range_of(valid.iter().map(|(ltv, _)| *ltv)) else {
        debug!(
            component = "distribution",
            event = "distribution.aggregate.empty",
            input_loans = loans.len(),
            skipped_loans = skipped,
            floor_price_usd
        );
        return DistributionSeries::empty(policy, floor_price_usd, skipped);
    };

    let mut slots: BTreeMap<i64, Vec<f64>> = BTreeMap::new();
    let span = policy.span(range.min, range.max);
    let span_len = span.end().abs_diff(*span.start()).saturating_add(1);
    if span_len <= MAX_SPAN_BUCKETS {
        for index in span {
            slots.insert(index, Vec::new());
        }
    }
    for (ltv, value) in &valid {
        slots
            .entry(policy.bucket_index(*ltv))
            .or_default()
            .push(*value);
    }

    let mut buckets: Vec<DistributionBucket> = slots
        .into_iter()
        .filter(|(_, values)| !values.is_empty())
        .map(|(index, mut values)| {
            values.sort_by(f64::total_cmp);
            DistributionBucket {
                index,
                ltv_key: policy.lower_edge(index),
                ltv_upper: policy.upper_edge(index),
                loan_count: values.len() as u64,
                total_value_usd: values.iter().sum(),
                cumulative_loan_count: 0,
                cumulative_value_usd: 0.0,
            }
        })
        .collect();

    let mut running_count = 0u64;
    let mut running_value = 0.0;
    for bucket in buckets.iter_mut().rev() {
        running_count += bucket.loan_count;
        running_value += bucket.total_value_usd;
        bucket.cumulative_loan_count = running_count;
        bucket.cumulative_value_usd = running_value;
    }

    debug!(
        component = "distribution",
        event = "distribution.aggregate.finish",
        policy = policy.kind().as_str(),
        valid_loans = valid.len(),
        skipped_loans = skipped,
        buckets = buckets.len(),
        span_len,
        min_ltv = range.min,
        max_ltv = range.max
    );

    DistributionSeries {
        policy: policy.clone(),
        floor_price_usd,
        valid_loans: valid.len() as u64,
        skipped_loans: skipped,
        buckets,
    }
}

pub fn ltv_range(loans: &[Loan], floor_price_usd: f64) -> Option<LtvRange> {
    range_of(loans.iter().filter_map(|loan| loan_ltv(loan, floor_price_usd)))
}

pub fn ltv_stats(loans: &[Loan], floor_price_usd: f64) -> Option<LoanStats> {
    let mut ltvs: Vec<f64> = loans
        .iter()
        .filter_map(|loan| loan_ltv(loan, floor_price_usd))
        .collect();
    if ltvs.is_empty() {
        return None;
    }
    ltvs.sort_by(f64::total_cmp);

    let count = ltvs.len();
    let n = count as f64;
    let mean = ltvs.iter().sum::<f64>() / n;
    let median = if count % 2 == 0 {
        (ltvs[count / 2 - 1] + ltvs[count / 2]) / 2.0
    } else {
        ltvs[count / 2]
    };
    let variance = ltvs.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;

    Some(LoanStats {
        count: count as u64,
        min: ltvs[0],
        max: ltvs[count - 1],
        mean,
        median,
        std_dev: variance.sqrt(),
    })
}

/// Midpoint of the most populated `width`-wide bucket; ties go to the lower key.
pub fn modal_center(loans: &[Loan], floor_price_usd: f64, width: f64) -> Option<f64> {
    let policy = BucketPolicy::fixed(width).ok()?;
    let mut counts: BTreeMap<i64, u64> = BTreeMap::new();
    for ltv in loans.iter().filter_map(|loan| loan_ltv(loan, floor_price_usd)) {
        *counts.entry(policy.bucket_index(ltv)).or_insert(0) += 1;
    }

    let mut best: Option<(i64, u64)> = None;
    for (index, count) in counts {
        if best.map_or(true, |(_, top)| count > top) {
            best = Some((index, count));
        }
    }
    best.map(|(index, _)| (policy.lower_edge(index) + policy.upper_edge(index)) / 2.0)
}

/// Turns a caller's policy choice into a concrete policy for this dataset.
pub fn resolve_policy(
    request: &PolicyRequest,
    loans: &[Loan],
    floor_price_usd: f64,
) -> Result<BucketPolicy, BucketPolicyError> {
    let width = request.width.unwrap_or(DEFAULT_FIXED_WIDTH);
    match request.kind {
        PolicyKind::Fixed => BucketPolicy::fixed(width),
        PolicyKind::VariableWidth => {
            let range = ltv_range(loans, floor_price_usd).unwrap_or(LtvRange {
                min: 0.0,
                max: 100.0,
            });
            BucketPolicy::variable_for_range(range.min, range.max)
        }
        PolicyKind::Logarithmic => {
            let range = ltv_range(loans, floor_price_usd).unwrap_or(LtvRange {
                min: 1.0,
                max: 100.0,
            });
            BucketPolicy::logarithmic_for_range(range.min, range.max, DEFAULT_BINS_PER_DECADE)
        }
        PolicyKind::SymmetricLog => {
            let center = modal_center(loans, floor_price_usd, width).unwrap_or(0.0);
            BucketPolicy::symmetric_log(center, DEFAULT_SYMLOG_LINEAR_WIDTH, DEFAULT_SYMLOG_STEP)
        }
    }
}

fn valid_point(loan: &Loan, floor_price_usd: f64) -> Option<(f64, f64)> {
    loan_ltv(loan, floor_price_usd).zip(loan.principal_amount_usd)
}

fn range_of(values: impl Iterator<Item = f64>) -> Option<LtvRange> {
    values.fold(None, |acc, v| match acc {
        None => Some(LtvRange { min: v, max: v }),
        Some(range) => Some(LtvRange {
            min: range.min.min(v),
            max: range.max.max(v),
        }),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loans(principals: &[Option<f64>]) -> Vec<Loan> {
        principals
            .iter()
            .enumerate()
            .map(|(idx, p)| Loan::with_principal(format!("loan-{idx}"), *p))
            .collect()
    }

    #[test]
    fn three_loan_example_builds_expected_depth() {
        let input = loans(&[Some(50.0), Some(75.0), Some(100.0)]);
        let policy = BucketPolicy::fixed(25.0).unwrap();
        let series = aggregate(&input, 100.0, &policy);

        let keys: Vec<f64> = series.buckets().iter().map(|b| b.ltv_key).collect();
        let counts: Vec<u64> = series.buckets().iter().map(|b| b.loan_count).collect();
        let cumulative: Vec<u64> = series
            .buckets()
            .iter()
            .map(|b| b.cumulative_loan_count)
            .collect();

        assert_eq!(keys, vec![50.0, 75.0, 100.0]);
        assert_eq!(counts, vec![1, 1, 1]);
        assert_eq!(cumulative, vec![3, 2, 1]);
        assert_eq!(series.buckets()[0].cumulative_value_usd, 225.0);
        assert_eq!(series.buckets()[2].cumulative_value_usd, 100.0);
    }

    #[test]
    fn empty_and_all_invalid_inputs_yield_empty_series() {
        let policy = BucketPolicy::default();
        assert!(aggregate(&[], 100.0, &policy).is_empty());

        let input = loans(&[Some(50.0), Some(75.0)]);
        let series = aggregate(&input, 0.0, &policy);
        assert!(series.is_empty());
        assert_eq!(series.skipped_loans(), 2);

        let missing = loans(&[None, Some(0.0), Some(-3.0)]);
        let series = aggregate(&missing, 100.0, &policy);
        assert!(series.is_empty());
        assert_eq!(series.valid_loans(), 0);
        assert_eq!(series.skipped_loans(), 3);
    }

    #[test]
    fn invalid_loans_are_skipped_not_fatal() {
        let input = loans(&[Some(40.0), None, Some(41.0)]);
        let series = aggregate(&input, 100.0, &BucketPolicy::fixed(5.0).unwrap());
        assert_eq!(series.valid_loans(), 2);
        assert_eq!(series.skipped_loans(), 1);
        assert_eq!(series.buckets().len(), 1);
        assert_eq!(series.buckets()[0].loan_count, 2);
    }

    #[test]
    fn zero_count_buckets_are_dropped() {
        let input = loans(&[Some(10.0), Some(90.0)]);
        let series = aggregate(&input, 100.0, &BucketPolicy::fixed(5.0).unwrap());
        assert_eq!(series.buckets().len(), 2);
        assert!(series.buckets().iter().all(|b| b.loan_count > 0));
    }

    #[test]
    fn astronomically_underwater_loans_do_not_overflow() {
        let input = loans(&[Some(1e22), Some(50.0)]);
        for width in [1.0, 5.0] {
            let policy = BucketPolicy::fixed(width).unwrap();
            let series = aggregate(&input, 1.0, &policy);
            assert_eq!(series.valid_loans(), 2);
            assert_eq!(series.buckets().len(), 2);
            assert_eq!(series.buckets()[0].cumulative_loan_count, 2);

            let top = series.buckets().last().unwrap();
            let hits = crate::matcher::match_loans(
                &input,
                top.ltv_key,
                1.0,
                &crate::matcher::MatchMode::exact(policy),
            );
            assert_eq!(hits.len() as u64, top.loan_count);
        }

        // principal / floor overflows to infinity: skipped, not bucketed
        let overflow = loans(&[Some(1e307), Some(1.0)]);
        let series = aggregate(&overflow, 1e-10, &BucketPolicy::fixed(5.0).unwrap());
        assert_eq!(series.valid_loans(), 1);
        assert_eq!(series.skipped_loans(), 1);
    }

    #[test]
    fn huge_span_is_filled_sparsely_with_same_result() {
        let input = loans(&[Some(1.0), Some(5_000_000.0)]);
        let series = aggregate(&input, 100.0, &BucketPolicy::fixed(1.0).unwrap());
        let keys: Vec<f64> = series.buckets().iter().map(|b| b.ltv_key).collect();
        assert_eq!(keys, vec![1.0, 5_000_000.0]);
        assert_eq!(series.buckets()[0].cumulative_loan_count, 2);
    }

    #[test]
    fn input_order_does_not_change_output() {
        let forward = loans(&[Some(0.1), Some(0.2), Some(0.3), Some(1e6), Some(12.5)]);
        let mut backward = forward.clone();
        backward.reverse();

        let policy = BucketPolicy::fixed(1_000_000.0).unwrap();
        let a = aggregate(&forward, 100.0, &policy);
        let b = aggregate(&backward, 100.0, &policy);

        let a_json = serde_json::to_string(&a).unwrap();
        let b_json = serde_json::to_string(&b).unwrap();
        assert_eq!(a_json, b_json);
    }

    #[test]
    fn bucket_containing_uses_series_policy() {
        let input = loans(&[Some(52.0), Some(54.0), Some(61.0)]);
        let series = aggregate(&input, 100.0, &BucketPolicy::fixed(5.0).unwrap());
        assert_eq!(series.bucket_containing(50.0).unwrap().loan_count, 2);
        assert_eq!(series.bucket_containing(53.3).unwrap().loan_count, 2);
        assert_eq!(series.bucket_containing(60.0).unwrap().loan_count, 1);
        assert!(series.bucket_containing(75.0).is_none());
    }

    #[test]
    fn projections_and_segments_keep_cumulative_values() {
        let input = loans(&[Some(50.0), Some(150.0), Some(700.0)]);
        let series = aggregate(&input, 100.0, &BucketPolicy::fixed(10.0).unwrap());

        let depth = series.depth_points();
        assert_eq!(depth.len(), 3);
        assert_eq!(depth[0].cumulative_value, 900.0);
        assert_eq!(depth[2].cumulative_value, 700.0);

        let histogram = series.histogram_points();
        assert_eq!(histogram[1].ltv, 150.0);
        assert_eq!(histogram[1].ltv_upper, 160.0);

        let segments = series.standard_segments();
        assert_eq!(segments.len(), 3);
        assert_eq!(segments[0].buckets.len(), 1);
        assert_eq!(segments[1].buckets[0].cumulative_value_usd, 850.0);
        assert_eq!(segments[2].buckets[0].ltv_key, 700.0);
    }

    #[test]
    fn stats_and_range_ignore_invalid_loans() {
        let input = loans(&[Some(10.0), None, Some(20.0), Some(30.0), Some(40.0)]);
        let range = ltv_range(&input, 100.0).unwrap();
        assert_eq!(range, LtvRange { min: 10.0, max: 40.0 });

        let stats = ltv_stats(&input, 100.0).unwrap();
        assert_eq!(stats.count, 4);
        assert_eq!(stats.mean, 25.0);
        assert_eq!(stats.median, 25.0);
        assert!((stats.std_dev - 125f64.sqrt()).abs() < 1e-12);

        assert!(ltv_stats(&input, 0.0).is_none());
        assert!(ltv_range(&[], 100.0).is_none());
    }

    #[test]
    fn modal_center_picks_densest_bucket() {
        let input = loans(&[Some(12.0), Some(61.0), Some(62.0), Some(64.0), Some(300.0)]);
        assert_eq!(modal_center(&input, 100.0, 5.0), Some(62.5));
        assert_eq!(modal_center(&[], 100.0, 5.0), None);
    }

    #[test]
    fn resolve_policy_covers_every_kind() {
        let input = loans(&[Some(3.0), Some(60.0), Some(2_400.0)]);
        for kind in [
            PolicyKind::Fixed,
            PolicyKind::VariableWidth,
            PolicyKind::Logarithmic,
            PolicyKind::SymmetricLog,
        ] {
            let request = PolicyRequest { kind, width: None };
            let policy = resolve_policy(&request, &input, 100.0).unwrap();
            assert_eq!(policy.kind(), kind);
        }

        let empty = resolve_policy(
            &PolicyRequest {
                kind: PolicyKind::Logarithmic,
                width: None,
            },
            &[],
            100.0,
        );
        assert!(empty.is_ok());
    }
}
