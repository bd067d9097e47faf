//! Per-dashboard state: selected collection, fetch generations and the
//! chart/filter pair derived from the applied loans.
//!
//! A fetch result is tagged with the [`FetchToken`] handed out when it was
//! started. Selecting another collection bumps the generation, so a slow
//! response for an abandoned selection is reported as
//! [`FetchOutcome::Stale`] and dropped.

use serde::Serialize;
use tracing::{info, warn};

use crate::bucket::{BucketPolicy, BucketPolicyError, PolicyRequest};
use crate::distribution::{aggregate, resolve_policy, DistributionSeries};
use crate::loan::Loan;
use crate::matcher::{FilterState, LoanFilter};

/// Issued by [`FetchGenerations::select`]; a fetch result is only applied when
/// it carries the current token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchToken {
    generation: u64,
    collection: String,
}

impl FetchToken {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    Applied,
    Stale,
}

/// Selected collection plus the generation counter behind [`FetchToken`]s.
#[derive(Debug, Clone, Default)]
pub struct FetchGenerations {
    collection: Option<String>,
    generation: u64,
}

impl FetchGenerations {
    pub fn collection(&self) -> Option<&str> {
        self.collection.as_deref()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Starts a new selection. Every token issued before becomes stale.
    pub fn select(&mut self, name: impl Into<String>) -> FetchToken {
        self.generation += 1;
        let collection = name.into();
        self.collection = Some(collection.clone());
        info!(
            component = "session",
            event = "session.collection.selected",
            collection = %collection,
            generation = self.generation
        );
        FetchToken {
            generation: self.generation,
            collection,
        }
    }

    /// Token for refetching the current selection without starting a new one.
    pub fn current(&self) -> Option<FetchToken> {
        self.collection.as_ref().map(|collection| FetchToken {
            generation: self.generation,
            collection: collection.clone(),
        })
    }

    pub fn is_current(&self, token: &FetchToken) -> bool {
        token.generation == self.generation
    }

    /// `Applied` for the current token; otherwise logs and returns `Stale`.
    pub fn admit(&self, token: &FetchToken, action: &'static str) -> FetchOutcome {
        if self.is_current(token) {
            return FetchOutcome::Applied;
        }
        info!(
            component = "session",
            event = "session.fetch.stale",
            action,
            collection = %token.collection,
            token_generation = token.generation,
            current_generation = self.generation
        );
        FetchOutcome::Stale
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SessionStatus {
    Idle,
    Loading,
    Ready,
    Failed { message: String },
}

#[derive(Debug, Clone)]
struct LoadedCollection {
    series: DistributionSeries,
    filter: LoanFilter,
}

#[derive(Debug, Clone)]
pub struct DashboardSession {
    generations: FetchGenerations,
    status: SessionStatus,
    policy_request: PolicyRequest,
    loaded: Option<LoadedCollection>,
}

impl Default for DashboardSession {
    fn default() -> Self {
        Self::new(PolicyRequest::default())
    }
}

impl DashboardSession {
    pub fn new(policy_request: PolicyRequest) -> Self {
        Self {
            generations: FetchGenerations::default(),
            status: SessionStatus::Idle,
            policy_request,
            loaded: None,
        }
    }

    pub fn collection(&self) -> Option<&str> {
        self.generations.collection()
    }

    pub fn status(&self) -> &SessionStatus {
        &self.status
    }

    pub fn policy_request(&self) -> PolicyRequest {
        self.policy_request
    }

    /// Starts a new selection. Any fetch issued for an earlier selection
    /// becomes stale and the previous data and filter are dropped.
    pub fn select_collection(&mut self, name: impl Into<String>) -> FetchToken {
        self.status = SessionStatus::Loading;
        self.loaded = None;
        self.generations.select(name)
    }

    pub fn complete_fetch(
        &mut self,
        token: &FetchToken,
        loans: Vec<Loan>,
        floor_price_usd: f64,
    ) -> FetchOutcome {
        if self.generations.admit(token, "complete") == FetchOutcome::Stale {
            return FetchOutcome::Stale;
        }

        let policy = self.resolve(&loans, floor_price_usd);
        self.loaded = Some(build_loaded(loans, floor_price_usd, &policy));
        self.status = SessionStatus::Ready;
        info!(
            component = "session",
            event = "session.fetch.applied",
            collection = %token.collection,
            generation = token.generation,
            loans = self.loans().len(),
            floor_price_usd
        );
        FetchOutcome::Applied
    }

    pub fn fail_fetch(&mut self, token: &FetchToken, message: impl Into<String>) -> FetchOutcome {
        if self.generations.admit(token, "fail") == FetchOutcome::Stale {
            return FetchOutcome::Stale;
        }
        let message = message.into();
        warn!(
            component = "session",
            event = "session.fetch.failed",
            collection = %token.collection,
            generation = token.generation,
            error = %message
        );
        self.status = SessionStatus::Failed { message };
        FetchOutcome::Applied
    }

    /// Switches the bucketing policy and rebuilds the chart. The filter is
    /// rebuilt from the new series and starts unfiltered.
    pub fn set_policy(&mut self, request: PolicyRequest) -> Result<(), BucketPolicyError> {
        if let Some(loaded) = self.loaded.take() {
            let floor = loaded.series.floor_price_usd();
            let loans = loaded.filter.all_loans().to_vec();
            match resolve_policy(&request, &loans, floor) {
                Ok(policy) => self.loaded = Some(build_loaded(loans, floor, &policy)),
                Err(err) => {
                    self.loaded = Some(loaded);
                    return Err(err);
                }
            }
        }
        self.policy_request = request;
        Ok(())
    }

    pub fn series(&self) -> Option<&DistributionSeries> {
        self.loaded.as_ref().map(|loaded| &loaded.series)
    }

    pub fn loans(&self) -> &[Loan] {
        match &self.loaded {
            Some(loaded) => loaded.filter.all_loans(),
            None => &[],
        }
    }

    pub fn floor_price_usd(&self) -> Option<f64> {
        self.series().map(DistributionSeries::floor_price_usd)
    }

    pub fn filter_state(&self) -> FilterState {
        self.loaded
            .as_ref()
            .map_or(FilterState::Unfiltered, |loaded| loaded.filter.state())
    }

    /// Exact-bucket selection under the series' own policy.
    pub fn click_bucket(&mut self, ltv: f64) -> Vec<&Loan> {
        match self.loaded.as_mut() {
            Some(loaded) => loaded.filter.select(ltv),
            None => Vec::new(),
        }
    }

    pub fn reset_filters(&mut self) -> &[Loan] {
        match self.loaded.as_mut() {
            Some(loaded) => loaded.filter.reset(),
            None => &[],
        }
    }

    pub fn visible_loans(&self) -> Vec<&Loan> {
        self.loaded
            .as_ref()
            .map(|loaded| loaded.filter.visible())
            .unwrap_or_default()
    }

    fn resolve(&self, loans: &[Loan], floor_price_usd: f64) -> BucketPolicy {
        resolve_policy(&self.policy_request, loans, floor_price_usd).unwrap_or_else(|err| {
            warn!(
                component = "session",
                event = "session.policy.fallback",
                error = %err
            );
            BucketPolicy::default()
        })
    }
}

fn build_loaded(loans: Vec<Loan>, floor_price_usd: f64, policy: &BucketPolicy) -> LoadedCollection {
    let series = aggregate(&loans, floor_price_usd, policy);
    let filter = LoanFilter::for_series(loans, &series);
    LoadedCollection { series, filter }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket::PolicyKind;

    fn loans(principals: &[f64]) -> Vec<Loan> {
        principals
            .iter()
            .enumerate()
            .map(|(i, p)| Loan::with_principal(format!("loan-{i}"), Some(*p)))
            .collect()
    }

    #[test]
    fn stale_fetch_never_overwrites_newer_selection() {
        let mut session = DashboardSession::default();
        let first = session.select_collection("Wrapped Cryptopunks");
        let second = session.select_collection("Autoglyphs");

        assert_eq!(
            session.complete_fetch(&second, loans(&[10.0, 20.0]), 100.0),
            FetchOutcome::Applied
        );
        // the slow response for the abandoned selection arrives last
        assert_eq!(
            session.complete_fetch(&first, loans(&[1.0, 2.0, 3.0]), 50.0),
            FetchOutcome::Stale
        );

        assert_eq!(session.collection(), Some("Autoglyphs"));
        assert_eq!(session.loans().len(), 2);
        assert_eq!(session.floor_price_usd(), Some(100.0));
        assert_eq!(session.status(), &SessionStatus::Ready);
    }

    #[test]
    fn refresh_token_goes_stale_once_another_collection_is_selected() {
        let mut generations = FetchGenerations::default();
        assert!(generations.current().is_none());

        let selected = generations.select("Wrapped Cryptopunks");
        let refresh = generations.current().unwrap();
        assert_eq!(refresh, selected);
        assert_eq!(generations.admit(&refresh, "complete"), FetchOutcome::Applied);

        generations.select("Autoglyphs");
        assert_eq!(generations.admit(&refresh, "complete"), FetchOutcome::Stale);
        assert_eq!(generations.current().unwrap().collection(), "Autoglyphs");
        assert_eq!(generations.generation(), 2);
    }

    #[test]
    fn stale_failure_is_ignored() {
        let mut session = DashboardSession::default();
        let first = session.select_collection("a");
        let second = session.select_collection("b");

        assert_eq!(session.fail_fetch(&first, "timeout"), FetchOutcome::Stale);
        assert_eq!(session.status(), &SessionStatus::Loading);

        assert_eq!(session.fail_fetch(&second, "timeout"), FetchOutcome::Applied);
        assert_eq!(
            session.status(),
            &SessionStatus::Failed {
                message: "timeout".to_string()
            }
        );
    }

    #[test]
    fn selecting_a_collection_clears_previous_data_and_filter() {
        let mut session = DashboardSession::default();
        let token = session.select_collection("a");
        session.complete_fetch(&token, loans(&[10.0, 12.0, 80.0]), 100.0);
        assert_eq!(session.click_bucket(10.0).len(), 2);

        let next = session.select_collection("b");
        assert_eq!(next.generation(), token.generation() + 1);
        assert!(session.series().is_none());
        assert!(session.visible_loans().is_empty());
        assert_eq!(session.filter_state(), FilterState::Unfiltered);
    }

    #[test]
    fn click_counts_match_rendered_buckets() {
        let mut session = DashboardSession::new(PolicyRequest {
            kind: PolicyKind::Fixed,
            width: Some(25.0),
        });
        let token = session.select_collection("a");
        session.complete_fetch(&token, loans(&[50.0, 75.0, 100.0]), 100.0);

        let expected = session
            .series()
            .and_then(|series| series.bucket_containing(75.0))
            .map(|bucket| bucket.loan_count);
        let hits = session.click_bucket(75.0);
        assert_eq!(Some(hits.len() as u64), expected);
        assert_eq!(hits[0].loan_id, "loan-1");

        assert_eq!(session.reset_filters().len(), 3);
        assert_eq!(session.visible_loans().len(), 3);
    }

    #[test]
    fn policy_change_rebuilds_series_and_filter_together() {
        let mut session = DashboardSession::default();
        let token = session.select_collection("a");
        session.complete_fetch(&token, loans(&[10.0, 12.0, 80.0, 150.0]), 100.0);
        session.click_bucket(10.0);

        session
            .set_policy(PolicyRequest {
                kind: PolicyKind::Logarithmic,
                width: None,
            })
            .unwrap();

        let series = session.series().unwrap();
        assert_eq!(series.policy().kind(), PolicyKind::Logarithmic);
        assert_eq!(session.filter_state(), FilterState::Unfiltered);

        let expected = series.bucket_containing(80.0).unwrap().loan_count;
        assert_eq!(session.click_bucket(80.0).len() as u64, expected);
    }

    #[test]
    fn empty_session_is_inert() {
        let mut session = DashboardSession::default();
        assert_eq!(session.status(), &SessionStatus::Idle);
        assert!(session.click_bucket(50.0).is_empty());
        assert!(session.reset_filters().is_empty());
        assert!(session.series().is_none());
    }
}
