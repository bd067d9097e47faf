//! Bucket assignment for LTV values.
//!
//! A [`BucketPolicy`] maps a continuous LTV onto an integer bucket index and
//! each index back onto its `[lower_edge, upper_edge)` interval. The bucket
//! key exposed to charts is the lower edge. Aggregation and exact-bucket
//! matching compare indices produced by the same policy value, never keys
//! recomputed by two different formulas.
//!
//! Schemes:
//! - fixed width: `floor(ltv / width)`, optionally clamped to a domain
//! - variable width: contiguous `(start, end, step)` breakpoint table
//! - logarithmic: geometric edges `min * 10^(k / bins_per_decade)`
//! - symmetric log: fixed steps in `sign(v-c) * log10(1 + |v-c| / w)` space
//!
//! Values outside a policy's domain clamp into the nearest edge bucket.

use std::ops::RangeInclusive;

use serde::Serialize;
use thiserror::Error;

pub const DEFAULT_FIXED_WIDTH: f64 = 5.0;
pub const DEFAULT_BINS_PER_DECADE: u32 = 10;
pub const DEFAULT_SYMLOG_LINEAR_WIDTH: f64 = 10.0;
pub const DEFAULT_SYMLOG_STEP: f64 = 0.1;

/// Lowest LTV a generated breakpoint table has to cover.
pub const MIN_TABLE_LTV: f64 = 0.1;

// Relative slack for treating a quotient as an exact integer. Keeps
// `bucket_of(bucket_of(x)) == bucket_of(x)` under float round-off.
const SNAP_EPSILON: f64 = 1e-9;

// Bucket indices stay inside +-MAX_INDEX so `index + 1` and index sums in the
// breakpoint tables never overflow, however large the LTV.
const MAX_INDEX: i64 = i64::MAX / 4;

/// `(start, end, step)` tiers used by [`BucketPolicy::variable_for_range`].
pub const DEFAULT_TIERS: [BreakpointRange; 6] = [
    BreakpointRange::new(0.0, 100.0, 5.0),
    BreakpointRange::new(100.0, 200.0, 10.0),
    BreakpointRange::new(200.0, 500.0, 25.0),
    BreakpointRange::new(500.0, 1_000.0, 50.0),
    BreakpointRange::new(1_000.0, 2_000.0, 100.0),
    BreakpointRange::new(2_000.0, f64::INFINITY, 500.0),
];

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BreakpointRange {
    pub start: f64,
    pub end: f64,
    pub step: f64,
}

impl BreakpointRange {
    pub const fn new(start: f64, end: f64, step: f64) -> Self {
        Self { start, end, step }
    }

    fn bucket_count(&self) -> i64 {
        snapped_ceil((self.end - self.start) / self.step).max(1.0) as i64
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BucketScheme {
    Fixed {
        width: f64,
        lower: Option<f64>,
        upper: Option<f64>,
    },
    VariableWidth {
        ranges: Vec<BreakpointRange>,
    },
    Logarithmic {
        min: f64,
        max: f64,
        bins_per_decade: u32,
    },
    SymmetricLog {
        center: f64,
        linear_width: f64,
        step: f64,
    },
}

/// Validated bucketing policy. Construct through the associated functions;
/// every value of this type has a well-defined, total `bucket_index`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct BucketPolicy {
    scheme: BucketScheme,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    Fixed,
    VariableWidth,
    Logarithmic,
    SymmetricLog,
}

impl PolicyKind {
    pub fn parse(raw: &str) -> Result<Self, BucketPolicyError> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "fixed" | "standard" => Ok(Self::Fixed),
            "variable" | "variable_width" | "segmented" => Ok(Self::VariableWidth),
            "log" | "logarithmic" => Ok(Self::Logarithmic),
            "symlog" | "symmetric_log" => Ok(Self::SymmetricLog),
            other => Err(BucketPolicyError::UnknownPolicy(other.to_string())),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fixed => "fixed",
            Self::VariableWidth => "variable",
            Self::Logarithmic => "log",
            Self::SymmetricLog => "symlog",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum BucketPolicyError {
    #[error("bucket width must be positive and finite, got {0}")]
    InvalidWidth(f64),
    #[error("invalid bucket domain: lower={lower}, upper={upper}")]
    InvalidDomain { lower: f64, upper: f64 },
    #[error("breakpoint table is empty")]
    EmptyTable,
    #[error("breakpoint range {index} is invalid: start={start}, end={end}, step={step}")]
    InvalidRange {
        index: usize,
        start: f64,
        end: f64,
        step: f64,
    },
    #[error("breakpoint ranges {index} and {} leave a gap between {end} and {next_start}", .index + 1)]
    Gap {
        index: usize,
        end: f64,
        next_start: f64,
    },
    #[error("breakpoint ranges {index} and {} overlap between {next_start} and {end}", .index + 1)]
    Overlap {
        index: usize,
        end: f64,
        next_start: f64,
    },
    #[error("logarithmic bounds must satisfy 0 < min < max, got min={min}, max={max}")]
    InvalidLogBounds { min: f64, max: f64 },
    #[error("bins per decade must be >= 1")]
    InvalidBinsPerDecade,
    #[error(
        "invalid symmetric-log parameters: center={center}, linear_width={linear_width}, step={step}"
    )]
    InvalidSymmetricLog {
        center: f64,
        linear_width: f64,
        step: f64,
    },
    #[error("unknown bucket policy: {0}")]
    UnknownPolicy(String),
}

impl Default for BucketPolicy {
    fn default() -> Self {
        Self {
            scheme: BucketScheme::Fixed {
                width: DEFAULT_FIXED_WIDTH,
                lower: None,
                upper: None,
            },
        }
    }
}

impl BucketPolicy {
    pub fn fixed(width: f64) -> Result<Self, BucketPolicyError> {
        if !is_positive(width) {
            return Err(BucketPolicyError::InvalidWidth(width));
        }
        Ok(Self {
            scheme: BucketScheme::Fixed {
                width,
                lower: None,
                upper: None,
            },
        })
    }

    /// Fixed width with a clamp domain; out-of-domain values land in the
    /// first or last bucket instead of opening new ones.
    pub fn fixed_clamped(width: f64, lower: f64, upper: f64) -> Result<Self, BucketPolicyError> {
        if !is_positive(width) {
            return Err(BucketPolicyError::InvalidWidth(width));
        }
        if !lower.is_finite() || !upper.is_finite() || lower > upper {
            return Err(BucketPolicyError::InvalidDomain { lower, upper });
        }
        Ok(Self {
            scheme: BucketScheme::Fixed {
                width,
                lower: Some(lower),
                upper: Some(upper),
            },
        })
    }

    pub fn variable_width(ranges: Vec<BreakpointRange>) -> Result<Self, BucketPolicyError> {
        validate_table(&ranges)?;
        Ok(Self {
            scheme: BucketScheme::VariableWidth { ranges },
        })
    }

    /// Breakpoint table cut from [`DEFAULT_TIERS`] that covers
    /// `max(0.1, min_ltv)` through `max_ltv`, each end aligned to its tier step.
    pub fn variable_for_range(min_ltv: f64, max_ltv: f64) -> Result<Self, BucketPolicyError> {
        if !min_ltv.is_finite() || !max_ltv.is_finite() {
            return Err(BucketPolicyError::InvalidDomain {
                lower: min_ltv,
                upper: max_ltv,
            });
        }
        let lo = min_ltv.max(MIN_TABLE_LTV);
        let hi = max_ltv.max(lo);

        let mut ranges = Vec::new();
        for tier in DEFAULT_TIERS {
            if tier.end <= lo || tier.start > hi {
                continue;
            }
            let start = if lo > tier.start {
                tier.start + snapped_floor((lo - tier.start) / tier.step) * tier.step
            } else {
                tier.start
            };
            let end = if hi < tier.end {
                let next_edge =
                    tier.start + (snapped_floor((hi - tier.start) / tier.step) + 1.0) * tier.step;
                next_edge.min(tier.end)
            } else {
                tier.end
            };
            ranges.push(BreakpointRange::new(start, end, tier.step));
        }

        Self::variable_width(ranges)
    }

    pub fn logarithmic(min: f64, max: f64, bins_per_decade: u32) -> Result<Self, BucketPolicyError> {
        if !is_positive(min) || !max.is_finite() || max <= min {
            return Err(BucketPolicyError::InvalidLogBounds { min, max });
        }
        if bins_per_decade == 0 {
            return Err(BucketPolicyError::InvalidBinsPerDecade);
        }
        Ok(Self {
            scheme: BucketScheme::Logarithmic {
                min,
                max,
                bins_per_decade,
            },
        })
    }

    /// Logarithmic policy spanning an observed LTV range. Degenerate ranges
    /// are widened to one bin so a single-loan collection still charts.
    pub fn logarithmic_for_range(
        min_ltv: f64,
        max_ltv: f64,
        bins_per_decade: u32,
    ) -> Result<Self, BucketPolicyError> {
        if bins_per_decade == 0 {
            return Err(BucketPolicyError::InvalidBinsPerDecade);
        }
        let min = min_ltv.max(MIN_TABLE_LTV);
        let one_bin = 10f64.powf(1.0 / f64::from(bins_per_decade));
        let max = max_ltv.max(min * one_bin);
        Self::logarithmic(min, max, bins_per_decade)
    }

    pub fn symmetric_log(
        center: f64,
        linear_width: f64,
        step: f64,
    ) -> Result<Self, BucketPolicyError> {
        if !center.is_finite() || center < 0.0 || !is_positive(linear_width) || !is_positive(step)
        {
            return Err(BucketPolicyError::InvalidSymmetricLog {
                center,
                linear_width,
                step,
            });
        }
        Ok(Self {
            scheme: BucketScheme::SymmetricLog {
                center,
                linear_width,
                step,
            },
        })
    }

    pub fn scheme(&self) -> &BucketScheme {
        &self.scheme
    }

    pub fn kind(&self) -> PolicyKind {
        match self.scheme {
            BucketScheme::Fixed { .. } => PolicyKind::Fixed,
            BucketScheme::VariableWidth { .. } => PolicyKind::VariableWidth,
            BucketScheme::Logarithmic { .. } => PolicyKind::Logarithmic,
            BucketScheme::SymmetricLog { .. } => PolicyKind::SymmetricLog,
        }
    }

    pub fn bucket_index(&self, ltv: f64) -> i64 {
        match &self.scheme {
            BucketScheme::Fixed {
                width,
                lower,
                upper,
            } => {
                let raw = floor_index(ltv / width);
                let low = lower.map(|v| floor_index(v / width));
                let high = upper.map(|v| floor_index(v / width));
                match (low, high) {
                    (Some(low), Some(high)) => raw.clamp(low, high),
                    (Some(low), None) => raw.max(low),
                    (None, Some(high)) => raw.min(high),
                    (None, None) => raw,
                }
            }
            BucketScheme::VariableWidth { ranges } => variable_index(ranges, ltv),
            BucketScheme::Logarithmic {
                min,
                max,
                bins_per_decade,
            } => {
                let count = log_bucket_count(*min, *max, *bins_per_decade);
                if ltv <= *min {
                    return 0;
                }
                let q = (ltv / min).log10() * f64::from(*bins_per_decade);
                floor_index(q).clamp(0, count - 1)
            }
            BucketScheme::SymmetricLog {
                center,
                linear_width,
                step,
            } => {
                let s = symlog(ltv.max(0.0), *center, *linear_width);
                floor_index(s / step)
            }
        }
    }

    pub fn lower_edge(&self, index: i64) -> f64 {
        self.bounds(index).0
    }

    pub fn upper_edge(&self, index: i64) -> f64 {
        self.bounds(index).1
    }

    /// Bucket key (lower edge) for an LTV value.
    pub fn bucket_of(&self, ltv: f64) -> f64 {
        self.lower_edge(self.bucket_index(ltv))
    }

    /// Inclusive index range covering `[min_ltv, max_ltv]`.
    pub fn span(&self, min_ltv: f64, max_ltv: f64) -> RangeInclusive<i64> {
        let a = self.bucket_index(min_ltv);
        let b = self.bucket_index(max_ltv);
        a.min(b)..=a.max(b)
    }

    fn bounds(&self, index: i64) -> (f64, f64) {
        match &self.scheme {
            BucketScheme::Fixed { width, .. } => {
                (index as f64 * width, index.saturating_add(1) as f64 * width)
            }
            BucketScheme::VariableWidth { ranges } => variable_bounds(ranges, index),
            BucketScheme::Logarithmic {
                min,
                max,
                bins_per_decade,
            } => {
                let count = log_bucket_count(*min, *max, *bins_per_decade);
                let index = index.clamp(0, count - 1);
                let bpd = f64::from(*bins_per_decade);
                let lower = min * 10f64.powf(index as f64 / bpd);
                let upper = (min * 10f64.powf(index.saturating_add(1) as f64 / bpd)).min(*max);
                (lower, upper.max(lower))
            }
            BucketScheme::SymmetricLog {
                center,
                linear_width,
                step,
            } => {
                let lower = inverse_symlog(index as f64 * step, *center, *linear_width).max(0.0);
                let upper = inverse_symlog(
                    index.saturating_add(1) as f64 * step,
                    *center,
                    *linear_width,
                );
                (lower, upper)
            }
        }
    }
}

/// Caller-facing policy choice, resolved against observed data by
/// `distribution::resolve_policy`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PolicyRequest {
    pub kind: PolicyKind,
    pub width: Option<f64>,
}

impl Default for PolicyRequest {
    fn default() -> Self {
        Self {
            kind: PolicyKind::Fixed,
            width: None,
        }
    }
}

impl PolicyRequest {
    pub fn parse(kind: Option<&str>, width: Option<f64>) -> Result<Self, BucketPolicyError> {
        let kind = match kind {
            Some(raw) => PolicyKind::parse(raw)?,
            None => PolicyKind::Fixed,
        };
        if let Some(w) = width {
            if !is_positive(w) {
                return Err(BucketPolicyError::InvalidWidth(w));
            }
        }
        Ok(Self { kind, width })
    }
}

fn validate_table(ranges: &[BreakpointRange]) -> Result<(), BucketPolicyError> {
    if ranges.is_empty() {
        return Err(BucketPolicyError::EmptyTable);
    }
    for (index, range) in ranges.iter().enumerate() {
        let finite_end = range.end.is_finite() || index + 1 == ranges.len();
        if !range.start.is_finite()
            || !finite_end
            || range.end <= range.start
            || !is_positive(range.step)
        {
            return Err(BucketPolicyError::InvalidRange {
                index,
                start: range.start,
                end: range.end,
                step: range.step,
            });
        }
    }
    for (index, pair) in ranges.windows(2).enumerate() {
        let (end, next_start) = (pair[0].end, pair[1].start);
        let slack = SNAP_EPSILON * end.abs().max(1.0);
        if next_start > end + slack {
            return Err(BucketPolicyError::Gap {
                index,
                end,
                next_start,
            });
        }
        if next_start < end - slack {
            return Err(BucketPolicyError::Overlap {
                index,
                end,
                next_start,
            });
        }
    }
    Ok(())
}

fn variable_index(ranges: &[BreakpointRange], ltv: f64) -> i64 {
    let first = &ranges[0];
    if ltv < first.start {
        return 0;
    }
    let mut offset = 0i64;
    for range in ranges {
        let count = range_count(range);
        if ltv < range.end {
            let local = floor_index((ltv - range.start) / range.step);
            return offset + local.clamp(0, count - 1);
        }
        offset += count;
    }
    offset - 1
}

fn variable_bounds(ranges: &[BreakpointRange], index: i64) -> (f64, f64) {
    let total: i64 = ranges.iter().map(range_count).sum();
    let mut local = index.clamp(0, total - 1);
    for range in ranges {
        let count = range_count(range);
        if local < count {
            let lower = range.start + local as f64 * range.step;
            let upper = (range.start + local.saturating_add(1) as f64 * range.step).min(range.end);
            return (lower, upper);
        }
        local -= count;
    }
    let last = &ranges[ranges.len() - 1];
    (last.start, last.end)
}

// An open-ended last range counts as one unbounded run of steps.
fn range_count(range: &BreakpointRange) -> i64 {
    if range.end.is_finite() {
        range.bucket_count()
    } else {
        MAX_INDEX
    }
}

fn log_bucket_count(min: f64, max: f64, bins_per_decade: u32) -> i64 {
    let q = (max / min).log10() * f64::from(bins_per_decade);
    snapped_ceil(q).max(1.0) as i64
}

fn symlog(value: f64, center: f64, linear_width: f64) -> f64 {
    let delta = value - center;
    delta.signum() * (1.0 + delta.abs() / linear_width).log10()
}

fn inverse_symlog(s: f64, center: f64, linear_width: f64) -> f64 {
    center + s.signum() * linear_width * (10f64.powf(s.abs()) - 1.0)
}

fn snapped_floor(q: f64) -> f64 {
    let nearest = q.round();
    if (q - nearest).abs() <= SNAP_EPSILON * nearest.abs().max(1.0) {
        nearest
    } else {
        q.floor()
    }
}

fn floor_index(q: f64) -> i64 {
    (snapped_floor(q) as i64).clamp(-MAX_INDEX, MAX_INDEX)
}

fn snapped_ceil(q: f64) -> f64 {
    let nearest = q.round();
    if (q - nearest).abs() <= SNAP_EPSILON * nearest.abs().max(1.0) {
        nearest
    } else {
        q.ceil()
    }
}

fn is_positive(value: f64) -> bool {
    value.is_finite() && value > 0.0
}
