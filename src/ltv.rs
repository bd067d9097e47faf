//! Loan-to-value arithmetic.

use tracing::debug;

use crate::loan::Loan;

/// LTV percentage of `principal_usd` against `floor_price_usd`.
///
/// Returns `0.0` when either input is non-positive or not finite, or when the
/// ratio overflows. Callers that need to tell "zero LTV" apart from "not
/// computable" go through [`loan_ltv`].
pub fn calculate_ltv(principal_usd: f64, floor_price_usd: f64) -> f64 {
    match ltv_ratio(principal_usd, floor_price_usd) {
        Some(ltv) => ltv,
        None => {
            debug!(
                component = "ltv",
                event = "ltv.invalid_input",
                principal_usd,
                floor_price_usd
            );
            0.0
        }
    }
}

/// Floor price at which `principal_usd` sits at `ltv_pct` percent LTV.
pub fn calculate_floor_price(principal_usd: f64, ltv_pct: f64) -> f64 {
    if !is_positive(principal_usd) || !is_positive(ltv_pct) {
        debug!(
            component = "ltv",
            event = "floor_price.invalid_input",
            principal_usd,
            ltv_pct
        );
        return 0.0;
    }
    principal_usd * 100.0 / ltv_pct
}

/// LTV of a loan, or `None` when the loan cannot take part in a distribution.
///
/// This is the only validity gate: aggregation and matching both call it, so a
/// loan is either counted in a bucket and matchable, or neither.
pub fn loan_ltv(loan: &Loan, floor_price_usd: f64) -> Option<f64> {
    ltv_ratio(loan.principal_amount_usd?, floor_price_usd)
}

// `None` for non-positive inputs and for ratios that overflow to infinity.
fn ltv_ratio(principal_usd: f64, floor_price_usd: f64) -> Option<f64> {
    if !is_positive(principal_usd) || !is_positive(floor_price_usd) {
        return None;
    }
    Some(principal_usd * 100.0 / floor_price_usd).filter(|ltv| ltv.is_finite())
}

fn is_positive(value: f64) -> bool {
    value.is_finite() && value > 0.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ltv_is_principal_over_floor_in_percent() {
        assert_eq!(calculate_ltv(50.0, 100.0), 50.0);
        assert_eq!(calculate_ltv(75.0, 50.0), 150.0);
        assert_eq!(calculate_ltv(100.0, 100.0), 100.0);
    }

    #[test]
    fn ltv_zero_guard() {
        for x in [0.0, 1.0, 42.5, 1e9] {
            assert_eq!(calculate_ltv(x, 0.0), 0.0);
            assert_eq!(calculate_ltv(0.0, x), 0.0);
        }
        assert_eq!(calculate_ltv(-5.0, 100.0), 0.0);
        assert_eq!(calculate_ltv(5.0, -100.0), 0.0);
        assert_eq!(calculate_ltv(f64::NAN, 100.0), 0.0);
        assert_eq!(calculate_ltv(5.0, f64::INFINITY), 0.0);
    }

    #[test]
    fn floor_price_inverts_ltv() {
        assert_eq!(calculate_floor_price(50.0, 50.0), 100.0);
        assert_eq!(calculate_floor_price(75.0, 150.0), 50.0);
        assert_eq!(calculate_floor_price(100.0, 100.0), 100.0);
        assert_eq!(calculate_floor_price(0.0, 50.0), 0.0);
        assert_eq!(calculate_floor_price(50.0, 0.0), 0.0);

        let ltv = calculate_ltv(1234.5, 8000.0);
        assert!((calculate_floor_price(1234.5, ltv) - 8000.0).abs() < 1e-9);
    }

    #[test]
    fn loan_ltv_rejects_missing_or_non_positive_principal() {
        let mut loan = Loan::with_principal("a", Some(50.0));
        assert_eq!(loan_ltv(&loan, 100.0), Some(50.0));
        assert_eq!(loan_ltv(&loan, 0.0), None);

        loan.principal_amount_usd = None;
        assert_eq!(loan_ltv(&loan, 100.0), None);

        loan.principal_amount_usd = Some(0.0);
        assert_eq!(loan_ltv(&loan, 100.0), None);
    }

    #[test]
    fn overflowing_ratio_is_not_an_ltv() {
        let loan = Loan::with_principal("whale", Some(1e307));
        assert_eq!(loan_ltv(&loan, 1e-10), None);
        assert_eq!(calculate_ltv(1e307, 1e-10), 0.0);

        // huge but finite LTVs are still valid
        let big = Loan::with_principal("big", Some(1e22));
        assert_eq!(loan_ltv(&big, 1.0), Some(1e24));
    }
}
