//! Team-level reduction over per-employee metrics, plus presentation helpers.
//!
//! Nothing here feeds back into attribution. Employees stay keyed by their
//! raw assignee string; `clean_employee_name` is for display only.

use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;

use crate::types::{EmployeeMetrics, TimePeriod};

/// `value / total` as a percentage, or 0 when `total` is 0.
pub fn percentage(value: f64, total: f64) -> f64 {
    if total == 0.0 {
        0.0
    } else {
        value / total * 100.0
    }
}

fn average(total: f64, count: usize) -> f64 {
    if count == 0 {
        0.0
    } else {
        total / count as f64
    }
}

fn trailing_parenthetical_regex() -> &'static Regex {
    static TRAILING_PAREN_RE: OnceLock<Regex> = OnceLock::new();
    TRAILING_PAREN_RE.get_or_init(|| {
        Regex::new(r"\s*\([^)]*\)$").expect("trailing parenthetical regex should compile")
    })
}

/// Strip one trailing parenthetical: "Rob Smith (old)" becomes "Rob Smith".
pub fn clean_employee_name(name: &str) -> String {
    trailing_parenthetical_regex().replace(name, "").trim().to_string()
}

/// Column header label for a period.
pub fn period_label(period: TimePeriod) -> &'static str {
    match period {
        TimePeriod::AllTime => "All Time (Annualized)",
        TimePeriod::YearToDate => "Year to Date (Annualized)",
        TimePeriod::MonthToDate => "Month to Date",
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TopPerformer {
    /// Display name (trailing parenthetical removed).
    pub name: String,
    pub employee_name: String,
    pub meeting_count: u32,
}

/// Per-employee averages.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TeamAverages {
    pub meetings: f64,
    pub deals_won_count: f64,
    pub deals_won_amount: f64,
    pub deals_lost_count: f64,
    pub deals_lost_amount: f64,
    pub deals_in_play_count: f64,
    pub deals_in_play_amount: f64,
    pub deals_overdue_count: f64,
    pub deals_overdue_amount: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TeamSummary {
    pub employee_count: usize,
    pub total_meetings: u32,
    pub deals_won_count: u32,
    pub deals_won_amount: f64,
    pub deals_lost_count: u32,
    pub deals_lost_amount: f64,
    pub deals_in_play_count: u32,
    pub deals_in_play_amount: f64,
    pub deals_overdue_count: u32,
    pub deals_overdue_amount: f64,
    pub deals_without_p3_count: u32,
    /// Meetings per employee, rounded to a whole number.
    pub average_meetings_per_employee: u32,
    pub averages: TeamAverages,
    /// Won share of closed deals.
    pub won_percentage: f64,
    /// Lost share of closed deals.
    pub lost_percentage: f64,
    pub top_performer: Option<TopPerformer>,
}

impl TeamSummary {
    pub fn from_metrics(metrics: &[EmployeeMetrics]) -> Self {
        let mut s = TeamSummary {
            employee_count: metrics.len(),
            ..Default::default()
        };

        for m in metrics {
            s.total_meetings += m.meeting_count;
            s.deals_won_count += m.deals_won_count;
            s.deals_won_amount += m.deals_won_amount;
            s.deals_lost_count += m.deals_lost_count;
            s.deals_lost_amount += m.deals_lost_amount;
            s.deals_in_play_count += m.deals_in_play_under_150_count;
            s.deals_in_play_amount += m.deals_in_play_under_150_amount;
            s.deals_overdue_count += m.deals_overdue_150_plus_count;
            s.deals_overdue_amount += m.deals_overdue_150_plus_amount;
            s.deals_without_p3_count += m.deals_without_p3_count;
        }

        let n = metrics.len();
        s.averages = TeamAverages {
            meetings: average(s.total_meetings as f64, n),
            deals_won_count: average(s.deals_won_count as f64, n),
            deals_won_amount: average(s.deals_won_amount, n),
            deals_lost_count: average(s.deals_lost_count as f64, n),
            deals_lost_amount: average(s.deals_lost_amount, n),
            deals_in_play_count: average(s.deals_in_play_count as f64, n),
            deals_in_play_amount: average(s.deals_in_play_amount, n),
            deals_overdue_count: average(s.deals_overdue_count as f64, n),
            deals_overdue_amount: average(s.deals_overdue_amount, n),
        };
        s.average_meetings_per_employee = s.averages.meetings.round() as u32;

        let closed = (s.deals_won_count + s.deals_lost_count) as f64;
        s.won_percentage = percentage(s.deals_won_count as f64, closed);
        s.lost_percentage = percentage(s.deals_lost_count as f64, closed);

        // Strictly greater, so the earliest employee wins ties.
        s.top_performer = metrics
            .iter()
            .fold(None::<&EmployeeMetrics>, |top, m| match top {
                Some(t) if m.meeting_count <= t.meeting_count => Some(t),
                _ => Some(m),
            })
            .map(|m| TopPerformer {
                name: clean_employee_name(&m.employee_name),
                employee_name: m.employee_name.clone(),
                meeting_count: m.meeting_count,
            });

        s
    }
}
