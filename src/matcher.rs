//! Click-to-filter: map a chart bucket back onto the loans behind it.

use serde::Serialize;
use tracing::debug;

use crate::bucket::BucketPolicy;
use crate::distribution::DistributionSeries;
use crate::loan::Loan;
use crate::ltv::loan_ltv;

pub const DEFAULT_TOLERANCE_PERCENT: f64 = 5.0;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum MatchMode {
    /// `|ltv - target| <= target * percent / 100`.
    Tolerance { percent: f64 },
    /// Same bucket as `target` under `policy`. Must be the policy of the
    /// series the user clicked on.
    ExactBucket { policy: BucketPolicy },
}

impl Default for MatchMode {
    fn default() -> Self {
        Self::Tolerance {
            percent: DEFAULT_TOLERANCE_PERCENT,
        }
    }
}

impl MatchMode {
    pub fn exact(policy: BucketPolicy) -> Self {
        Self::ExactBucket { policy }
    }
}

pub fn is_loan_matching_ltv(
    loan: &Loan,
    target_ltv: f64,
    floor_price_usd: f64,
    mode: &MatchMode,
) -> bool {
    let Some(ltv) = loan_ltv(loan, floor_price_usd) else {
        return false;
    };
    match mode {
        MatchMode::Tolerance { percent } => {
            (ltv - target_ltv).abs() <= target_ltv * percent / 100.0
        }
        MatchMode::ExactBucket { policy } => {
            policy.bucket_index(ltv) == policy.bucket_index(target_ltv)
        }
    }
}

/// Every loan in `loans` matching `target_ltv`, in input order.
pub fn match_loans<'a>(
    loans: &'a [Loan],
    target_ltv: f64,
    floor_price_usd: f64,
    mode: &MatchMode,
) -> Vec<&'a Loan> {
    loans
        .iter()
        .filter(|loan| is_loan_matching_ltv(loan, target_ltv, floor_price_usd, mode))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum FilterState {
    Unfiltered,
    Filtered { target_ltv: f64 },
}

/// Loan-table filter driven by chart clicks.
///
/// Owns the complete dataset; every selection filters from it, so the result
/// of a click never depends on earlier clicks.
#[derive(Debug, Clone)]
pub struct LoanFilter {
    loans: Vec<Loan>,
    floor_price_usd: f64,
    mode: MatchMode,
    state: FilterState,
}

impl LoanFilter {
    pub fn new(loans: Vec<Loan>, floor_price_usd: f64, mode: MatchMode) -> Self {
        Self {
            loans,
            floor_price_usd,
            mode,
            state: FilterState::Unfiltered,
        }
    }

    /// Exact-bucket filter sharing the policy and floor price of `series`.
    pub fn for_series(loans: Vec<Loan>, series: &DistributionSeries) -> Self {
        Self::new(
            loans,
            series.floor_price_usd(),
            MatchMode::exact(series.policy().clone()),
        )
    }

    pub fn state(&self) -> FilterState {
        self.state
    }

    pub fn mode(&self) -> &MatchMode {
        &self.mode
    }

    pub fn floor_price_usd(&self) -> f64 {
        self.floor_price_usd
    }

    pub fn all_loans(&self) -> &[Loan] {
        &self.loans
    }

    /// True when a click on `series` selects exactly the loans it counted.
    pub fn matches_series(&self, series: &DistributionSeries) -> bool {
        match &self.mode {
            MatchMode::ExactBucket { policy } => {
                policy == series.policy() && self.floor_price_usd == series.floor_price_usd()
            }
            MatchMode::Tolerance { .. } => false,
        }
    }

    pub fn select(&mut self, target_ltv: f64) -> Vec<&Loan> {
        self.state = FilterState::Filtered { target_ltv };
        let visible = self.visible();
        debug!(
            component = "matcher",
            event = "filter.select",
            target_ltv,
            matched = visible.len(),
            total = self.loans.len()
        );
        visible
    }

    pub fn reset(&mut self) -> &[Loan] {
        self.state = FilterState::Unfiltered;
        debug!(
            component = "matcher",
            event = "filter.reset",
            total = self.loans.len()
        );
        &self.loans
    }

    pub fn visible(&self) -> Vec<&Loan> {
        match self.state {
            FilterState::Unfiltered => self.loans.iter().collect(),
            FilterState::Filtered { target_ltv } => {
                match_loans(&self.loans, target_ltv, self.floor_price_usd, &self.mode)
            }
        }
    }
}
