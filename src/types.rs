//! Record shapes mirrored from the CRM sync tables, plus the metrics output.
//!
//! Field names follow the synced column names (`whalesync_postgres_id`,
//! `Companies_fk_Companies`, ...) so rows deserialize straight from either
//! store backend. Link arrays tolerate `null`, null entries and empty strings.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Months, NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Meeting type that qualifies a meeting for the pipeline.
pub const P3_MEETING_TYPE: &str = "P3 - Proposal";

/// Employee key used for meetings without an assignee.
pub const UNASSIGNED: &str = "Unassigned";

pub const STAGE_CLOSED_WON: &str = "Closed Won";
pub const STAGE_CLOSED_LOST: &str = "Closed Lost";

fn null_as_empty<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Vec<Option<String>>>::deserialize(deserializer)?;
    Ok(raw
        .unwrap_or_default()
        .into_iter()
        .flatten()
        .filter(|id| !id.trim().is_empty())
        .collect())
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|s| !s.trim().is_empty())
}

// =============================================================================
// Records
// =============================================================================

/// A row from the `Meetings` collection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Meeting {
    pub id: String,
    #[serde(default)]
    pub meeting_outcome: Option<String>,
    #[serde(default)]
    pub call_and_meeting_type: Option<String>,
    #[serde(
        rename = "Contacts_fk_Contacts",
        default,
        deserialize_with = "null_as_empty"
    )]
    pub contact_ids: Vec<String>,
    #[serde(
        rename = "Companies_fk_Companies",
        default,
        deserialize_with = "null_as_empty"
    )]
    pub company_ids: Vec<String>,
    #[serde(rename = "Deals_fk_Deals", default, deserialize_with = "null_as_empty")]
    pub deal_ids: Vec<String>,
    #[serde(default)]
    pub activity_assigned_to: Option<String>,
    #[serde(default)]
    pub create_date: Option<String>,
}

impl Meeting {
    /// Raw assignee key. No normalization: "Rob Smith" and "Rob Smith (old)"
    /// are distinct employees.
    pub fn assignee(&self) -> &str {
        non_empty(&self.activity_assigned_to).unwrap_or(UNASSIGNED)
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.create_date.as_deref().and_then(parse_timestamp)
    }
}

/// A row from the `Contacts` collection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Contact {
    #[serde(rename = "whalesync_postgres_id")]
    pub id: String,
    #[serde(default)]
    pub companies: Option<String>,
    #[serde(
        rename = "Companies_fk_Companies",
        default,
        deserialize_with = "null_as_empty"
    )]
    pub company_ids: Vec<String>,
}

impl Contact {
    /// Scalar company first, then the array entries.
    pub fn linked_company_ids(&self) -> impl Iterator<Item = &str> {
        non_empty(&self.companies)
            .into_iter()
            .chain(self.company_ids.iter().map(String::as_str))
    }
}

/// A row from the `Companies` collection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Company {
    #[serde(rename = "whalesync_postgres_id")]
    pub id: String,
    #[serde(default)]
    pub company_name: Option<String>,
    /// Related companies in the same collection. May contain cycles.
    #[serde(
        rename = "Companies_fk_Companies",
        default,
        deserialize_with = "null_as_empty"
    )]
    pub related_company_ids: Vec<String>,
}

/// A row from the `Deals` collection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Deal {
    #[serde(rename = "whalesync_postgres_id")]
    pub id: String,
    /// Scalar company association.
    #[serde(default)]
    pub companies: Option<String>,
    /// Array company association, populated independently of `companies`.
    #[serde(
        rename = "Companies_fk_Companies",
        default,
        deserialize_with = "null_as_empty"
    )]
    pub company_ids: Vec<String>,
    #[serde(
        rename = "Contacts_fk_Contacts",
        default,
        deserialize_with = "null_as_empty"
    )]
    pub contact_ids: Vec<String>,
    #[serde(default)]
    pub deal_type: Option<String>,
    #[serde(default)]
    pub deal_stage: Option<String>,
    #[serde(default)]
    pub amount: Option<f64>,
    #[serde(default)]
    pub create_date: Option<String>,
    #[serde(default)]
    pub deal_name: Option<String>,
    #[serde(default)]
    pub deal_owner: Option<String>,
}

impl Deal {
    /// Every company this deal is associated with, merging the scalar and
    /// array fields. Duplicates are removed.
    pub fn associated_company_ids(&self) -> HashSet<&str> {
        non_empty(&self.companies)
            .into_iter()
            .chain(self.company_ids.iter().map(String::as_str))
            .collect()
    }

    /// True if any associated company is in `companies`.
    pub fn is_associated_with_any(&self, companies: &HashSet<String>) -> bool {
        self.associated_company_ids()
            .into_iter()
            .any(|id| companies.contains(id))
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.create_date.as_deref().and_then(parse_timestamp)
    }

    pub fn stage(&self) -> &str {
        self.deal_stage.as_deref().unwrap_or("")
    }

    pub fn amount_or_zero(&self) -> f64 {
        self.amount.unwrap_or(0.0)
    }
}

/// Parse a store timestamp. Accepts RFC 3339, naive `YYYY-MM-DD HH:MM:SS`
/// (treated as UTC) and bare dates (midnight UTC).
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

// =============================================================================
// Period selection
// =============================================================================

/// Reporting window selector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimePeriod {
    #[default]
    AllTime,
    YearToDate,
    MonthToDate,
}

impl TimePeriod {
    /// All-time and year-to-date figures are projected to a yearly value.
    pub fn is_annualized(self) -> bool {
        matches!(self, TimePeriod::AllTime | TimePeriod::YearToDate)
    }

    pub fn annualize(self, amount: f64) -> f64 {
        if self.is_annualized() {
            amount * 12.0
        } else {
            amount
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TimePeriod::AllTime => "all_time",
            TimePeriod::YearToDate => "year_to_date",
            TimePeriod::MonthToDate => "month_to_date",
        }
    }
}

impl fmt::Display for TimePeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TimePeriod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "all_time" | "all" => Ok(TimePeriod::AllTime),
            "year_to_date" | "ytd" => Ok(TimePeriod::YearToDate),
            "month_to_date" | "mtd" | "month" => Ok(TimePeriod::MonthToDate),
            other => Err(format!("unknown time period '{other}'")),
        }
    }
}

/// A calendar month, written `YYYY-MM`.
///
/// Only months whose first day and the first day of the following month are
/// both representable can be constructed, so window bounds never fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct YearMonth {
    first_day: NaiveDate,
    next_first_day: NaiveDate,
}

impl YearMonth {
    pub fn new(year: i32, month: u32) -> Option<Self> {
        let first_day = NaiveDate::from_ymd_opt(year, month, 1)?;
        let next_first_day = first_day.checked_add_months(Months::new(1))?;
        Some(Self {
            first_day,
            next_first_day,
        })
    }

    pub fn of<D: Datelike>(date: &D) -> Option<Self> {
        Self::new(date.year(), date.month())
    }

    pub fn year(self) -> i32 {
        self.first_day.year()
    }

    pub fn month(self) -> u32 {
        self.first_day.month()
    }

    pub fn first_day(self) -> NaiveDate {
        self.first_day
    }

    /// First day of the following month; the exclusive end of this one.
    pub fn next_first_day(self) -> NaiveDate {
        self.next_first_day
    }
}

impl fmt::Display for YearMonth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year(), self.month())
    }
}

impl FromStr for YearMonth {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (year, month) = s
            .trim()
            .split_once('-')
            .ok_or_else(|| format!("expected YYYY-MM, got '{s}'"))?;
        let year: i32 = year
            .parse()
            .map_err(|_| format!("invalid year in '{s}'"))?;
        let month: u32 = month
            .parse()
            .map_err(|_| format!("invalid month in '{s}'"))?;
        YearMonth::new(year, month).ok_or_else(|| format!("month out of range in '{s}'"))
    }
}

impl Serialize for YearMonth {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for YearMonth {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// The period plus the explicit month for `month_to_date`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeriodSelector {
    pub period: TimePeriod,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub month: Option<YearMonth>,
}

impl PeriodSelector {
    pub fn new(period: TimePeriod) -> Self {
        Self {
            period,
            month: None,
        }
    }

    pub fn month(month: YearMonth) -> Self {
        Self {
            period: TimePeriod::MonthToDate,
            month: Some(month),
        }
    }
}

// =============================================================================
// Metrics output
// =============================================================================

/// Bucket a claimed deal lands in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DealBucket {
    Won,
    Lost,
    InPlay,
    Overdue,
}

/// Tooltip detail for open deals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DealDetail {
    pub name: String,
    pub stage: String,
    /// The deal's recorded type, e.g. "Monthly Service".
    pub classification: String,
}

/// A deal owned by an employee whose companies had no P3 meeting in the window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DealWithoutP3 {
    pub id: String,
    pub name: Option<String>,
    pub stage: Option<String>,
    pub deal_type: Option<String>,
    pub amount: Option<f64>,
    pub create_date: Option<String>,
    /// Bucket the deal would fall in; `None` for open deals without a date.
    pub bucket: Option<DealBucket>,
}

/// Per-employee metrics. One entry per distinct raw assignee.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EmployeeMetrics {
    pub employee_name: String,
    pub meeting_count: u32,
    pub deals_won_count: u32,
    pub deals_won_amount: f64,
    pub deals_lost_count: u32,
    pub deals_lost_amount: f64,
    pub deals_in_play_under_150_count: u32,
    pub deals_in_play_under_150_amount: f64,
    pub deals_overdue_150_plus_count: u32,
    pub deals_overdue_150_plus_amount: f64,
    pub deals_won_names: Vec<String>,
    pub deals_lost_names: Vec<String>,
    pub deals_in_play_under_150_names: Vec<String>,
    pub deals_overdue_150_plus_names: Vec<String>,
    pub deals_in_play_under_150_details: Vec<DealDetail>,
    pub deals_overdue_150_plus_details: Vec<DealDetail>,
    pub deals_without_p3_count: u32,
    pub deals_without_p3: Vec<DealWithoutP3>,
}

impl EmployeeMetrics {
    pub fn new(employee_name: &str) -> Self {
        Self {
            employee_name: employee_name.to_string(),
            ..Self::default()
        }
    }

    /// Total deals across the four buckets.
    pub fn bucketed_deal_count(&self) -> u32 {
        self.deals_won_count
            + self.deals_lost_count
            + self.deals_in_play_under_150_count
            + self.deals_overdue_150_plus_count
    }
}
