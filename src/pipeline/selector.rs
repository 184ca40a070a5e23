//! P3 meeting selection for a reporting window.

use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;

use crate::error::MetricsError;
use crate::retry::{retry_with_backoff, RetryExhausted, RetryPolicy};
use crate::store::{Filter, Gateway};
use crate::types::{Meeting, PeriodSelector, TimePeriod, YearMonth, P3_MEETING_TYPE};

const MEETING_TYPE_FIELD: &str = "call_and_meeting_type";
const MEETING_OUTCOME_FIELD: &str = "meeting_outcome";
const CREATE_DATE_FIELD: &str = "create_date";

/// Half-open `[start, end)` window in UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl ReportWindow {
    /// `field >= start AND field < end`.
    pub fn filters(&self, field: &str) -> Vec<Filter> {
        vec![Filter::since(field, self.start), Filter::before(field, self.end)]
    }
}

/// Midnight of `date` in `tz`, as UTC. Falls back to UTC midnight when the
/// local midnight does not exist.
fn local_midnight(tz: Tz, date: NaiveDate) -> DateTime<Utc> {
    let naive = date.and_time(chrono::NaiveTime::MIN);
    tz.from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|| naive.and_utc())
}

/// Window for `selector` as of `now`, or `None` for all time.
///
/// Year-to-date runs from January 1 to `now`; month-to-date covers the whole
/// target month (default: the current month). Boundaries are local to `tz`.
pub fn report_window(
    selector: PeriodSelector,
    now: DateTime<Utc>,
    tz: Tz,
) -> Result<Option<ReportWindow>, MetricsError> {
    let today = now.with_timezone(&tz).date_naive();
    match selector.period {
        TimePeriod::AllTime | TimePeriod::YearToDate if selector.month.is_some() => {
            Err(MetricsError::InvalidPeriod(format!(
                "a month can only be combined with month_to_date, not {}",
                selector.period
            )))
        }
        TimePeriod::AllTime => Ok(None),
        TimePeriod::YearToDate => {
            let jan1 = NaiveDate::from_ymd_opt(today.year(), 1, 1).ok_or_else(|| {
                MetricsError::InvalidPeriod(format!("year {} out of range", today.year()))
            })?;
            Ok(Some(ReportWindow {
                start: local_midnight(tz, jan1),
                end: now,
            }))
        }
        TimePeriod::MonthToDate => {
            let month = match selector.month {
                Some(month) => month,
                None => YearMonth::of(&today).ok_or_else(|| {
                    MetricsError::InvalidPeriod(format!("month of {today} out of range"))
                })?,
            };
            Ok(Some(ReportWindow {
                start: local_midnight(tz, month.first_day()),
                end: local_midnight(tz, month.next_first_day()),
            }))
        }
    }
}

/// Sort by creation time ascending (undated last), then by ID.
pub fn sort_meetings(meetings: &mut [Meeting]) {
    meetings.sort_by_cached_key(|m| (m.created_at().is_none(), m.created_at(), m.id.clone()));
}

/// Fetch P3 meetings in the selected window, retrying transient failures.
pub async fn select_p3_meetings(
    gateway: &Gateway<'_>,
    selector: PeriodSelector,
    now: DateTime<Utc>,
    tz: Tz,
    retry: &RetryPolicy,
) -> Result<Vec<Meeting>, MetricsError> {
    let window = report_window(selector, now, tz)?;

    let mut parts = vec![Filter::eq(MEETING_TYPE_FIELD, P3_MEETING_TYPE)];
    if let Some(window) = &window {
        parts.extend(window.filters(CREATE_DATE_FIELD));
    }
    let filter = Filter::And(parts);

    let mut meetings = retry_with_backoff(retry, "P3 meeting selection", || {
        gateway.fetch_by_filter::<Meeting>(&filter)
    })
    .await
    .map_err(|RetryExhausted { attempts, error }| MetricsError::MeetingSelection {
        attempts,
        source: error,
    })?;

    log::info!(
        "Fetched {} P3 meetings for {}{}",
        meetings.len(),
        selector.period,
        selector
            .month
            .map(|m| format!(" ({m})"))
            .unwrap_or_default()
    );

    if meetings.is_empty() {
        log_broader_search(gateway, window.as_ref()).await;
    }

    sort_meetings(&mut meetings);
    Ok(meetings)
}

/// When nothing matched, count meetings that mention P3 anywhere. Logged
/// only; it never changes the result.
async fn log_broader_search(gateway: &Gateway<'_>, window: Option<&ReportWindow>) {
    let mut parts = vec![Filter::Or(vec![
        Filter::contains(MEETING_OUTCOME_FIELD, "P3"),
        Filter::contains(MEETING_TYPE_FIELD, "P3"),
    ])];
    if let Some(window) = window {
        parts.extend(window.filters(CREATE_DATE_FIELD));
    }
    match gateway
        .fetch_by_filter::<Meeting>(&Filter::And(parts))
        .await
    {
        Ok(found) => {
            let types: std::collections::BTreeSet<&str> = found
                .iter()
                .filter_map(|m| m.call_and_meeting_type.as_deref())
                .collect();
            log::info!(
                "No exact P3 matches; broader search found {} meeting(s) with types {:?}",
                found.len(),
                types
            );
        }
        Err(e) => log::debug!("Broader P3 search failed: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::test_support::{meeting_row, FlakyStore};
    use crate::store::sqlite::test_utils::seeded_store;
    use crate::store::Collection;
    use serde_json::json;

    fn at(raw: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(raw).unwrap().with_timezone(&Utc)
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            base_delay_ms: 1,
            max_delay_ms: 2,
        }
    }

    #[test]
    fn test_all_time_has_no_window() {
        let window = report_window(
            PeriodSelector::new(TimePeriod::AllTime),
            at("2026-06-15T12:00:00Z"),
            chrono_tz::UTC,
        )
        .unwrap();
        assert!(window.is_none());
    }

    #[test]
    fn test_year_to_date_window() {
        let now = at("2026-06-15T12:00:00Z");
        let window = report_window(PeriodSelector::new(TimePeriod::YearToDate), now, chrono_tz::UTC)
            .unwrap()
            .unwrap();
        assert_eq!(window.start, at("2026-01-01T00:00:00Z"));
        assert_eq!(window.end, now);
    }

    #[test]
    fn test_month_window_in_local_timezone() {
        let now = at("2026-03-01T03:00:00Z"); // still February in New York
        let window = report_window(
            PeriodSelector::new(TimePeriod::MonthToDate),
            now,
            chrono_tz::America::New_York,
        )
        .unwrap()
        .unwrap();
        assert_eq!(window.start, at("2026-02-01T05:00:00Z"));
        assert_eq!(window.end, at("2026-03-01T05:00:00Z"));
        assert!(window.start <= now && now < window.end);
    }

    #[test]
    fn test_current_month_out_of_range_is_rejected() {
        let err = report_window(
            PeriodSelector::new(TimePeriod::MonthToDate),
            DateTime::<Utc>::MAX_UTC,
            chrono_tz::UTC,
        )
        .unwrap_err();
        assert!(matches!(err, MetricsError::InvalidPeriod(_)));
    }

    #[test]
    fn test_explicit_december_rolls_over() {
        let month: YearMonth = "2025-12".parse().unwrap();
        let window = report_window(
            PeriodSelector::month(month),
            at("2026-06-15T12:00:00Z"),
            chrono_tz::UTC,
        )
        .unwrap()
        .unwrap();
        assert_eq!(window.start, at("2025-12-01T00:00:00Z"));
        assert_eq!(window.end, at("2026-01-01T00:00:00Z"));
    }

    #[test]
    fn test_month_with_all_time_rejected() {
        let selector = PeriodSelector {
            period: TimePeriod::AllTime,
            month: YearMonth::new(2026, 1),
        };
        let err = report_window(selector, at("2026-06-15T12:00:00Z"), chrono_tz::UTC).unwrap_err();
        assert!(matches!(err, MetricsError::InvalidPeriod(_)));
    }

    #[test]
    fn test_sort_meetings_dated_first_then_id() {
        let mut meetings: Vec<Meeting> = vec![
            serde_json::from_value(json!({"id": "b", "create_date": null})).unwrap(),
            serde_json::from_value(json!({"id": "z", "create_date": "2026-01-02"})).unwrap(),
            serde_json::from_value(json!({"id": "a", "create_date": null})).unwrap(),
            serde_json::from_value(json!({"id": "y", "create_date": "2026-01-02"})).unwrap(),
            serde_json::from_value(json!({"id": "x", "create_date": "2026-01-01"})).unwrap(),
        ];
        sort_meetings(&mut meetings);
        let ids: Vec<_> = meetings.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["x", "y", "z", "a", "b"]);
    }

    fn p3_store() -> crate::store::SqliteStore {
        let mut other_type = meeting_row("m3", "Alice", &[], &[], &[]);
        other_type["call_and_meeting_type"] = json!("P3 - Proposal Review");
        let mut lower = meeting_row("m4", "Alice", &[], &[], &[]);
        lower["call_and_meeting_type"] = json!("p3 - proposal");
        let mut january = meeting_row("m5", "Bob", &[], &[], &[]);
        january["create_date"] = json!("2026-01-20T10:00:00Z");

        seeded_store(&[
            (Collection::Meetings, meeting_row("m2", "Alice", &[], &[], &[])),
            (Collection::Meetings, meeting_row("m1", "Bob", &[], &[], &[])),
            (Collection::Meetings, other_type),
            (Collection::Meetings, lower),
            (Collection::Meetings, january),
        ])
    }

    #[tokio::test]
    async fn test_selects_exact_type_within_window() {
        let store = p3_store();
        let gateway = Gateway::new(&store, 100);
        let now = at("2026-03-20T12:00:00Z");

        let all = select_p3_meetings(
            &gateway,
            PeriodSelector::new(TimePeriod::AllTime),
            now,
            chrono_tz::UTC,
            &fast_retry(),
        )
        .await
        .unwrap();
        let ids: Vec<_> = all.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["m5", "m1", "m2"]);

        let march = select_p3_meetings(
            &gateway,
            PeriodSelector::new(TimePeriod::MonthToDate),
            now,
            chrono_tz::UTC,
            &fast_retry(),
        )
        .await
        .unwrap();
        let ids: Vec<_> = march.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["m1", "m2"]);
    }

    #[tokio::test]
    async fn test_empty_selection_is_ok() {
        let store = p3_store();
        let gateway = Gateway::new(&store, 100);
        let meetings = select_p3_meetings(
            &gateway,
            PeriodSelector::month(YearMonth::new(2024, 5).unwrap()),
            at("2026-03-20T12:00:00Z"),
            chrono_tz::UTC,
            &fast_retry(),
        )
        .await
        .unwrap();
        assert!(meetings.is_empty());
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let store = FlakyStore::new(p3_store()).with_transient_meeting_failures(2);
        let gateway = Gateway::new(&store, 100);
        let meetings = select_p3_meetings(
            &gateway,
            PeriodSelector::new(TimePeriod::AllTime),
            at("2026-03-20T12:00:00Z"),
            chrono_tz::UTC,
            &fast_retry(),
        )
        .await
        .unwrap();
        assert_eq!(meetings.len(), 3);
    }

    #[tokio::test]
    async fn test_exhausted_retries_abort() {
        let store = FlakyStore::new(p3_store()).with_broken(Collection::Meetings);
        let gateway = Gateway::new(&store, 100);
        let err = select_p3_meetings(
            &gateway,
            PeriodSelector::new(TimePeriod::AllTime),
            at("2026-03-20T12:00:00Z"),
            chrono_tz::UTC,
            &fast_retry(),
        )
        .await
        .unwrap_err();
        match err {
            MetricsError::MeetingSelection { attempts, .. } => assert_eq!(attempts, 4),
            other => panic!("unexpected error: {other}"),
        }
    }
}
