//! Policy data structures: raw uploaded rows and the canonical record

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Guard added to ratio denominators so a zero premium yields a large
/// finite ratio instead of infinity
pub const RATIO_EPSILON: f64 = 1e-6;

/// Year policy vintage is measured against
pub const DEFAULT_REFERENCE_YEAR: i32 = 2024;

/// A single cell as handed over by the ingestion side
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RawValue {
    Number(f64),
    Text(String),
    Empty,
}

impl RawValue {
    /// Parse-or-NaN numeric coercion
    pub fn to_f64(&self) -> f64 {
        match self {
            RawValue::Number(v) => *v,
            RawValue::Text(s) => s.trim().parse::<f64>().unwrap_or(f64::NAN),
            RawValue::Empty => f64::NAN,
        }
    }

    /// Whole-number coercion; fractional or unparsable values give None
    pub fn to_i64(&self) -> Option<i64> {
        let v = self.to_f64();
        if v.is_finite() && v.fract() == 0.0 && v.abs() < i64::MAX as f64 {
            Some(v as i64)
        } else {
            None
        }
    }

    /// Categorical rendering; blank text counts as missing
    pub fn to_label(&self) -> Option<String> {
        match self {
            RawValue::Number(v) if v.is_nan() => None,
            RawValue::Number(v) => Some(format_number(*v)),
            RawValue::Text(s) => {
                let trimmed = s.trim();
                if trimmed.is_empty() {
                    None
                } else {
                    Some(trimmed.to_string())
                }
            }
            RawValue::Empty => None,
        }
    }
}

impl From<f64> for RawValue {
    fn from(v: f64) -> Self {
        RawValue::Number(v)
    }
}

impl From<&str> for RawValue {
    fn from(s: &str) -> Self {
        if s.is_empty() {
            RawValue::Empty
        } else {
            RawValue::Text(s.to_string())
        }
    }
}

/// Integral floats render without a trailing ".0" so ids like 1001.0 stay "1001"
fn format_number(v: f64) -> String {
    if v.fract() == 0.0 && v.abs() < 1e15 {
        format!("{}", v as i64)
    } else {
        format!("{}", v)
    }
}

/// Parsed upload: a header row plus rows sharing that column set
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawTable {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<RawValue>>,
}

impl RawTable {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    /// Append a row; short rows are padded with `Empty`, long rows truncated
    pub fn push_row(&mut self, mut row: Vec<RawValue>) {
        row.resize(self.columns.len(), RawValue::Empty);
        self.rows.push(row);
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Calendar bucket of the entry month.
///
/// December shares the first bucket with January through March; October and
/// November alone make up the fourth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Season {
    Q1,
    Q2,
    Q3,
    Q4,
}

impl Season {
    pub fn from_month(month: u32) -> Option<Self> {
        match month {
            12 | 1 | 2 | 3 => Some(Season::Q1),
            4..=6 => Some(Season::Q2),
            7..=9 => Some(Season::Q3),
            10 | 11 => Some(Season::Q4),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Season::Q1 => "Q1",
            Season::Q2 => "Q2",
            Season::Q3 => "Q3",
            Season::Q4 => "Q4",
        }
    }
}

/// Every column of the canonical table, in canonical schema order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Column {
    PolicyNumber,
    AnnualPremium,
    ReserveAmount,
    PremiumAmount,
    ExpectedClaims,
    ActualClaims,
    NzReserve,
    EntryYear,
    EntryMonth,
    Band,
    Frequency,
    Term,
    Status,
    LossRatio,
    PremiumAdequacy,
    ExpectedVsActual,
    RiskScore,
    PolicyVintage,
    EntrySeason,
}

impl Column {
    pub const ALL: [Column; 19] = [
        Column::PolicyNumber,
        Column::AnnualPremium,
        Column::ReserveAmount,
        Column::PremiumAmount,
        Column::ExpectedClaims,
        Column::ActualClaims,
        Column::NzReserve,
        Column::EntryYear,
        Column::EntryMonth,
        Column::Band,
        Column::Frequency,
        Column::Term,
        Column::Status,
        Column::LossRatio,
        Column::PremiumAdequacy,
        Column::ExpectedVsActual,
        Column::RiskScore,
        Column::PolicyVintage,
        Column::EntrySeason,
    ];

    /// Columns read straight from the upload
    pub const SOURCE: [Column; 13] = [
        Column::PolicyNumber,
        Column::AnnualPremium,
        Column::ReserveAmount,
        Column::PremiumAmount,
        Column::ExpectedClaims,
        Column::ActualClaims,
        Column::NzReserve,
        Column::EntryYear,
        Column::EntryMonth,
        Column::Band,
        Column::Frequency,
        Column::Term,
        Column::Status,
    ];

    /// Rating-factor dimensions considered by the variance ranking
    pub const RATING_FACTORS: [Column; 7] = [
        Column::Band,
        Column::Frequency,
        Column::Term,
        Column::Status,
        Column::AnnualPremium,
        Column::EntryMonth,
        Column::EntryYear,
    ];

    /// Upper-case header name as it appears in uploads and exports
    pub fn name(&self) -> &'static str {
        match self {
            Column::PolicyNumber => "POL_NUMBER",
            Column::AnnualPremium => "ANNUAL_PREM",
            Column::ReserveAmount => "RES_GP_PUPS",
            Column::PremiumAmount => "PREM_GP_PUPS",
            Column::ExpectedClaims => "EXP_GP_PUP",
            Column::ActualClaims => "ACT_GP_PUP",
            Column::NzReserve => "NZ_RES_IF_94",
            Column::EntryYear => "ENTRY_YEAR",
            Column::EntryMonth => "ENTRY_MONTH",
            Column::Band => "CL_PBAND",
            Column::Frequency => "CL_PFREQ",
            Column::Term => "CL_PPT",
            Column::Status => "CL_STATUS",
            Column::LossRatio => "LOSS_RATIO",
            Column::PremiumAdequacy => "PREMIUM_ADEQUACY",
            Column::ExpectedVsActual => "EXPECTED_VS_ACTUAL",
            Column::RiskScore => "RISK_SCORE",
            Column::PolicyVintage => "POLICY_VINTAGE",
            Column::EntrySeason => "ENTRY_SEASON",
        }
    }

    /// Semantic field name used in the API
    pub fn field_name(&self) -> &'static str {
        match self {
            Column::PolicyNumber => "policy_number",
            Column::AnnualPremium => "annual_premium",
            Column::ReserveAmount => "reserve_amount",
            Column::PremiumAmount => "premium_amount",
            Column::ExpectedClaims => "expected_claims",
            Column::ActualClaims => "actual_claims",
            Column::NzReserve => "nz_reserve",
            Column::EntryYear => "entry_year",
            Column::EntryMonth => "entry_month",
            Column::Band => "band",
            Column::Frequency => "frequency",
            Column::Term => "term",
            Column::Status => "status",
            Column::LossRatio => "loss_ratio",
            Column::PremiumAdequacy => "premium_adequacy",
            Column::ExpectedVsActual => "expected_vs_actual",
            Column::RiskScore => "risk_score",
            Column::PolicyVintage => "policy_vintage",
            Column::EntrySeason => "entry_season",
        }
    }

    pub fn is_numeric(&self) -> bool {
        !matches!(
            self,
            Column::PolicyNumber
                | Column::Band
                | Column::Frequency
                | Column::Term
                | Column::Status
                | Column::EntrySeason
        )
    }

    pub fn is_derived(&self) -> bool {
        !Column::SOURCE.contains(self)
    }

    /// Source columns a derived column is computed from
    pub fn inputs(&self) -> &'static [Column] {
        match self {
            Column::LossRatio | Column::PremiumAdequacy => {
                &[Column::ReserveAmount, Column::PremiumAmount]
            }
            Column::ExpectedVsActual => &[Column::ExpectedClaims, Column::ActualClaims],
            Column::RiskScore => &[Column::ReserveAmount, Column::AnnualPremium],
            Column::PolicyVintage => &[Column::EntryYear],
            Column::EntrySeason => &[Column::EntryMonth],
            _ => &[],
        }
    }

    /// Match a normalized (trimmed, upper-cased) upload header
    pub fn from_header(header: &str) -> Option<Self> {
        Column::SOURCE.iter().copied().find(|c| c.name() == header)
    }
}

impl fmt::Display for Column {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Column {
    type Err = String;

    /// Accepts either the header name or the field name, any case
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_uppercase().replace('-', "_");
        Column::ALL
            .iter()
            .copied()
            .find(|c| c.name() == wanted || c.field_name().to_ascii_uppercase() == wanted)
            .ok_or_else(|| format!("Unknown column: {}", s))
    }
}

/// A cell of the canonical table viewed generically
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue<'a> {
    Number(f64),
    Text(&'a str),
    Missing,
}

/// One row of the canonical table
#[derive(Debug, Clone, Serialize)]
pub struct PolicyRecord {
    pub policy_number: String,
    pub annual_premium: f64,
    pub reserve_amount: f64,
    pub premium_amount: f64,
    pub expected_claims: f64,
    pub actual_claims: f64,
    pub nz_reserve: f64,
    pub entry_year: Option<i32>,
    pub entry_month: Option<u32>,
    pub band: Option<String>,
    pub frequency: Option<String>,
    pub term: Option<String>,
    pub status: Option<String>,
    pub loss_ratio: f64,
    pub premium_adequacy: f64,
    pub expected_vs_actual: f64,
    pub risk_score: f64,
    pub policy_vintage: Option<i32>,
    pub entry_season: Option<Season>,
}

impl PolicyRecord {
    /// Build a record from coerced source fields, computing the derived ones.
    ///
    /// Ratios come first, then vintage and season. NaN inputs flow through the
    /// arithmetic untouched.
    #[allow(clippy::too_many_arguments)]
    pub fn derive(
        policy_number: String,
        annual_premium: f64,
        reserve_amount: f64,
        premium_amount: f64,
        expected_claims: f64,
        actual_claims: f64,
        nz_reserve: f64,
        entry_year: Option<i32>,
        entry_month: Option<u32>,
        band: Option<String>,
        frequency: Option<String>,
        term: Option<String>,
        status: Option<String>,
        reference_year: i32,
    ) -> Self {
        let loss_ratio = reserve_amount / (premium_amount + RATIO_EPSILON);
        let premium_adequacy = premium_amount - reserve_amount;
        let expected_vs_actual = actual_claims / (expected_claims + RATIO_EPSILON);
        let risk_score = (reserve_amount / (annual_premium + RATIO_EPSILON)) * 100.0;
        // Out-of-range years leave the vintage missing instead of overflowing
        let policy_vintage = entry_year.and_then(|y| reference_year.checked_sub(y));
        let entry_season = entry_month.and_then(Season::from_month);

        Self {
            policy_number,
            annual_premium,
            reserve_amount,
            premium_amount,
            expected_claims,
            actual_claims,
            nz_reserve,
            entry_year,
            entry_month,
            band,
            frequency,
            term,
            status,
            loss_ratio,
            premium_adequacy,
            expected_vs_actual,
            risk_score,
            policy_vintage,
            entry_season,
        }
    }

    /// Numeric view of a column; categorical or missing values give NaN
    pub fn number(&self, column: Column) -> f64 {
        match self.value(column) {
            CellValue::Number(v) => v,
            _ => f64::NAN,
        }
    }

    pub fn value(&self, column: Column) -> CellValue<'_> {
        fn text(v: &Option<String>) -> CellValue<'_> {
            v.as_deref().map_or(CellValue::Missing, CellValue::Text)
        }
        match column {
            Column::PolicyNumber => CellValue::Text(&self.policy_number),
            Column::AnnualPremium => CellValue::Number(self.annual_premium),
            Column::ReserveAmount => CellValue::Number(self.reserve_amount),
            Column::PremiumAmount => CellValue::Number(self.premium_amount),
            Column::ExpectedClaims => CellValue::Number(self.expected_claims),
            Column::ActualClaims => CellValue::Number(self.actual_claims),
            Column::NzReserve => CellValue::Number(self.nz_reserve),
            Column::EntryYear => self
                .entry_year
                .map_or(CellValue::Missing, |y| CellValue::Number(y as f64)),
            Column::EntryMonth => self
                .entry_month
                .map_or(CellValue::Missing, |m| CellValue::Number(m as f64)),
            Column::Band => text(&self.band),
            Column::Frequency => text(&self.frequency),
            Column::Term => text(&self.term),
            Column::Status => text(&self.status),
            Column::LossRatio => CellValue::Number(self.loss_ratio),
            Column::PremiumAdequacy => CellValue::Number(self.premium_adequacy),
            Column::ExpectedVsActual => CellValue::Number(self.expected_vs_actual),
            Column::RiskScore => CellValue::Number(self.risk_score),
            Column::PolicyVintage => self
                .policy_vintage
                .map_or(CellValue::Missing, |v| CellValue::Number(v as f64)),
            Column::EntrySeason => self
                .entry_season
                .map_or(CellValue::Missing, |s| CellValue::Text(s.as_str())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_season_mapping() {
        assert_eq!(Season::from_month(12), Some(Season::Q1));
        assert_eq!(Season::from_month(1), Some(Season::Q1));
        assert_eq!(Season::from_month(3), Some(Season::Q1));
        assert_eq!(Season::from_month(4), Some(Season::Q2));
        assert_eq!(Season::from_month(9), Some(Season::Q3));
        assert_eq!(Season::from_month(10), Some(Season::Q4));
        assert_eq!(Season::from_month(11), Some(Season::Q4));
        assert_eq!(Season::from_month(0), None);
        assert_eq!(Season::from_month(13), None);
    }

    #[test]
    fn test_raw_value_coercion() {
        assert_eq!(RawValue::from(" 12.5 ").to_f64(), 12.5);
        assert!(RawValue::from("n/a").to_f64().is_nan());
        assert!(RawValue::Empty.to_f64().is_nan());
        assert_eq!(RawValue::Number(2019.0).to_i64(), Some(2019));
        assert_eq!(RawValue::Number(2019.5).to_i64(), None);
        assert_eq!(RawValue::Number(1001.0).to_label().as_deref(), Some("1001"));
        assert_eq!(RawValue::from("   ").to_label(), None);
    }

    #[test]
    fn test_column_parsing() {
        assert_eq!("loss_ratio".parse::<Column>().unwrap(), Column::LossRatio);
        assert_eq!("ANNUAL_PREM".parse::<Column>().unwrap(), Column::AnnualPremium);
        assert_eq!("res_gp_pups".parse::<Column>().unwrap(), Column::ReserveAmount);
        assert!("premium".parse::<Column>().is_err());
        assert_eq!(Column::from_header("CL_PBAND"), Some(Column::Band));
        assert_eq!(Column::from_header("LOSS_RATIO"), None);
    }

    #[test]
    fn test_zero_premium_ratio_is_large_not_infinite() {
        let record = PolicyRecord::derive(
            "3".to_string(),
            0.0,
            100.0,
            0.0,
            f64::NAN,
            f64::NAN,
            f64::NAN,
            Some(2020),
            Some(12),
            None,
            None,
            None,
            None,
            DEFAULT_REFERENCE_YEAR,
        );
        assert!(record.loss_ratio.is_finite());
        assert!((record.loss_ratio - 1e8).abs() < 1.0);
        assert_eq!(record.premium_adequacy, -100.0);
        assert!(record.expected_vs_actual.is_nan());
        assert_eq!(record.policy_vintage, Some(4));
        assert_eq!(record.entry_season, Some(Season::Q1));
    }
}
