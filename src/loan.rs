//! Strict loan model consumed by the distribution engine, plus loan-table sorting.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::ltv::loan_ltv;

/// A single loan as seen by the core. Only `principal_amount_usd` takes part in
/// LTV math; every other field is passthrough metadata for the loan table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Loan {
    pub loan_id: String,
    pub protocol_name: String,
    pub nft_id: String,
    pub nft_image_small_uri: Option<String>,
    #[serde(rename = "principalAmountUSD")]
    pub principal_amount_usd: Option<f64>,
    #[serde(rename = "maximumRepaymentAmountUSD")]
    pub maximum_repayment_amount_usd: Option<f64>,
    pub apr: Option<f64>,
    pub duration_days: Option<f64>,
    pub hours_until_due: Option<f64>,
    pub borrower_address: Option<String>,
    pub lender_address: Option<String>,
    pub due_time: Option<String>,
}

impl Loan {
    pub fn with_principal(loan_id: impl Into<String>, principal_amount_usd: Option<f64>) -> Self {
        Self {
            loan_id: loan_id.into(),
            protocol_name: String::new(),
            nft_id: String::new(),
            nft_image_small_uri: None,
            principal_amount_usd,
            maximum_repayment_amount_usd: None,
            apr: None,
            duration_days: None,
            hours_until_due: None,
            borrower_address: None,
            lender_address: None,
            due_time: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortField {
    LoanId,
    Ltv,
    Principal,
    Apr,
    DueIn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    Asc,
    Desc,
}

impl SortField {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LoanId => "loan_id",
            Self::Ltv => "ltv",
            Self::Principal => "principal",
            Self::Apr => "apr",
            Self::DueIn => "due_in",
        }
    }
}

impl SortDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Asc => "asc",
            Self::Desc => "desc",
        }
    }

    fn flipped(self) -> Self {
        match self {
            Self::Asc => Self::Desc,
            Self::Desc => Self::Asc,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoanSort {
    pub field: SortField,
    pub direction: SortDirection,
}

impl Default for LoanSort {
    fn default() -> Self {
        Self {
            field: SortField::Ltv,
            direction: SortDirection::Desc,
        }
    }
}

impl LoanSort {
    /// Header click: the active column flips direction, a new column starts ascending.
    pub fn toggle(self, field: SortField) -> Self {
        if field == self.field {
            Self {
                field,
                direction: self.direction.flipped(),
            }
        } else {
            Self {
                field,
                direction: SortDirection::Asc,
            }
        }
    }

    pub fn parse(field: Option<&str>, direction: Option<&str>) -> Option<Self> {
        let mut sort = Self::default();
        if let Some(raw) = field {
            sort.field = match raw.trim().to_ascii_lowercase().as_str() {
                "loan_id" | "id" => SortField::LoanId,
                "ltv" => SortField::Ltv,
                "principal" => SortField::Principal,
                "apr" => SortField::Apr,
                "due_in" | "due" => SortField::DueIn,
                _ => return None,
            };
        }
        if let Some(raw) = direction {
            sort.direction = match raw.trim().to_ascii_lowercase().as_str() {
                "asc" => SortDirection::Asc,
                "desc" => SortDirection::Desc,
                _ => return None,
            };
        }
        Some(sort)
    }

    /// Sorts in place. Loans without a value for the sort key go last in
    /// either direction; ties keep their input order.
    pub fn sort_loans(&self, loans: &mut [&Loan], floor_price_usd: f64) {
        loans.sort_by(|a, b| {
            if self.field == SortField::LoanId {
                return self.apply(a.loan_id.cmp(&b.loan_id));
            }
            let left = self.key(a, floor_price_usd);
            let right = self.key(b, floor_price_usd);
            match (left, right) {
                (Some(l), Some(r)) => self.apply(l.total_cmp(&r)),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            }
        });
    }

    fn key(&self, loan: &Loan, floor_price_usd: f64) -> Option<f64> {
        match self.field {
            SortField::LoanId => None,
            SortField::Ltv => loan_ltv(loan, floor_price_usd),
            SortField::Principal => loan.principal_amount_usd.filter(|v| v.is_finite()),
            SortField::Apr => loan.apr.filter(|v| v.is_finite()),
            SortField::DueIn => loan.hours_until_due.filter(|v| v.is_finite()),
        }
    }

    fn apply(&self, ordering: Ordering) -> Ordering {
        match self.direction {
            SortDirection::Asc => ordering,
            SortDirection::Desc => ordering.reverse(),
        }
    }
}
