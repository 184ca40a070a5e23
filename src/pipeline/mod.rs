//! P3 attribution pipeline.
//!
//! One run is: select P3 meetings, resolve the records they link to,
//! attribute deals to employees, scan for deals without a P3 meeting, then
//! summarize. Every run starts from empty state and is wrapped in a single
//! request timeout; nothing partial survives a timeout.
//!
//! - selector: meetings in the reporting window, with retry
//! - resolver: contacts, companies, deals and lookup indexes
//! - attribution: claim/classify/accumulate
//! - orphans: owned deals whose companies had no P3 meeting
//! - removed: legacy-policy audit

pub mod attribution;
pub mod orphans;
pub mod removed;
pub mod resolver;
pub mod selector;

use std::future::Future;

use chrono::{DateTime, Utc};
use regex::RegexBuilder;
use serde::Serialize;

use crate::aggregate::{period_label, TeamSummary};
use crate::config::Config;
use crate::error::MetricsError;
use crate::store::{Gateway, RecordStore};
use crate::types::{EmployeeMetrics, PeriodSelector, TimePeriod, YearMonth};

use attribution::{AttributionEngine, MeetingWithoutDeal};
use removed::RemovedDealsEntry;

/// Everything the dashboard shows for one period.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardReport {
    pub period: TimePeriod,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub month: Option<YearMonth>,
    pub period_label: &'static str,
    pub generated_at: DateTime<Utc>,
    pub employees: Vec<EmployeeMetrics>,
    pub summary: TeamSummary,
    pub meetings_without_deals: Vec<MeetingWithoutDeal>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemovedDealsReport {
    pub employee_query: String,
    pub period: TimePeriod,
    pub month: Option<YearMonth>,
    pub results: Vec<RemovedDealsEntry>,
}

async fn with_timeout<T>(
    config: &Config,
    run: impl Future<Output = Result<T, MetricsError>>,
) -> Result<T, MetricsError> {
    match tokio::time::timeout(config.request_timeout(), run).await {
        Ok(result) => result,
        Err(_) => {
            log::error!(
                "Metrics run timed out after {}s",
                config.request_timeout_secs
            );
            Err(MetricsError::Timeout(config.request_timeout_secs))
        }
    }
}

/// Compute per-employee metrics and the team summary for `selector`.
pub async fn compute_dashboard(
    store: &dyn RecordStore,
    selector: PeriodSelector,
    config: &Config,
    now: DateTime<Utc>,
) -> Result<DashboardReport, MetricsError> {
    with_timeout(config, run_dashboard(store, selector, config, now)).await
}

async fn run_dashboard(
    store: &dyn RecordStore,
    selector: PeriodSelector,
    config: &Config,
    now: DateTime<Utc>,
) -> Result<DashboardReport, MetricsError> {
    let tz = config.tz()?;
    let gateway = Gateway::new(store, config.batch_size);
    let window = selector::report_window(selector, now, tz)?;

    let meetings =
        selector::select_p3_meetings(&gateway, selector, now, tz, &config.retry).await?;
    let graph = resolver::resolve_link_graph(&gateway, &meetings, &config.attribution).await;
    let outcome =
        AttributionEngine::new(&config.attribution, selector.period, now).run(&meetings, &graph);

    let mut employees = outcome.employees;
    let names: Vec<String> = employees.iter().map(|e| e.employee_name.clone()).collect();
    let orphans = orphans::find_deals_without_p3(
        &gateway,
        &names,
        &graph.touched_company_ids(),
        window.as_ref(),
        &config.attribution,
        now,
    )
    .await;
    orphans::attach(&mut employees, orphans);

    let summary = TeamSummary::from_metrics(&employees);
    log::info!(
        "Dashboard for {}: {} employees, {} meetings",
        selector.period,
        summary.employee_count,
        summary.total_meetings
    );

    Ok(DashboardReport {
        period: selector.period,
        month: selector.month,
        period_label: period_label(selector.period),
        generated_at: now,
        employees,
        summary,
        meetings_without_deals: outcome.meetings_without_deals,
    })
}

/// Audit which legacy candidates the current policy drops, for employees
/// matching `employee_query` (case-insensitive regex).
pub async fn compute_removed_deals(
    store: &dyn RecordStore,
    selector: PeriodSelector,
    employee_query: &str,
    config: &Config,
    now: DateTime<Utc>,
) -> Result<RemovedDealsReport, MetricsError> {
    let pattern = RegexBuilder::new(employee_query)
        .case_insensitive(true)
        .build()?;

    with_timeout(config, async {
        let tz = config.tz()?;
        let gateway = Gateway::new(store, config.batch_size);
        let meetings =
            selector::select_p3_meetings(&gateway, selector, now, tz, &config.retry).await?;
        let graph = resolver::resolve_link_graph(&gateway, &meetings, &config.attribution).await;
        let outcome = AttributionEngine::new(&config.attribution, selector.period, now)
            .run(&meetings, &graph);
        let results = removed::removed_deals_report(
            &gateway,
            &meetings,
            &graph,
            &outcome.claimed,
            &pattern,
            &config.attribution,
        )
        .await;

        Ok(RemovedDealsReport {
            employee_query: employee_query.to_string(),
            period: selector.period,
            month: selector.month,
            results,
        })
    })
    .await
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Row fixtures and a store wrapper that injects failures.

    use std::collections::HashSet;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use serde_json::{json, Value};

    use crate::store::{Collection, Filter, RecordStore, SqliteStore, StoreError};

    pub fn meeting_row(
        id: &str,
        assignee: &str,
        companies: &[&str],
        deals: &[&str],
        contacts: &[&str],
    ) -> Value {
        json!({
            "id": id,
            "call_and_meeting_type": "P3 - Proposal",
            "meeting_outcome": "Completed",
            "activity_assigned_to": assignee,
            "Companies_fk_Companies": companies,
            "Deals_fk_Deals": deals,
            "Contacts_fk_Contacts": contacts,
            "create_date": "2026-03-10T09:00:00.000Z",
        })
    }

    pub fn contact(id: &str, company: Option<&str>, companies: &[&str]) -> Value {
        json!({
            "whalesync_postgres_id": id,
            "companies": company,
            "Companies_fk_Companies": companies,
        })
    }

    pub fn company(id: &str, related: &[&str]) -> Value {
        json!({
            "whalesync_postgres_id": id,
            "company_name": format!("Company {id}"),
            "Companies_fk_Companies": related,
        })
    }

    /// Deal row with amount 1000 created 2026-03-01.
    pub fn deal_row(id: &str, deal_type: &str, stage: &str, company_ids: Value, company: Value) -> Value {
        json!({
            "whalesync_postgres_id": id,
            "deal_name": format!("Deal {id}"),
            "deal_type": deal_type,
            "deal_stage": stage,
            "amount": 1000.0,
            "Companies_fk_Companies": company_ids,
            "companies": company,
            "create_date": "2026-03-01T00:00:00.000Z",
        })
    }

    /// Wraps a real store and fails selected calls with HTTP 503.
    pub struct FlakyStore {
        inner: SqliteStore,
        broken: HashSet<Collection>,
        meeting_failures: AtomicU32,
        delay: Option<std::time::Duration>,
    }

    impl FlakyStore {
        pub fn new(inner: SqliteStore) -> Self {
            Self {
                inner,
                broken: HashSet::new(),
                meeting_failures: AtomicU32::new(0),
                delay: None,
            }
        }

        /// Every call against `collection` fails.
        pub fn with_broken(mut self, collection: Collection) -> Self {
            self.broken.insert(collection);
            self
        }

        /// The next `n` meeting calls fail, then calls succeed.
        pub fn with_transient_meeting_failures(self, n: u32) -> Self {
            self.meeting_failures.store(n, Ordering::SeqCst);
            self
        }

        /// Sleep before every call.
        pub fn with_delay(mut self, delay: std::time::Duration) -> Self {
            self.delay = Some(delay);
            self
        }

        async fn check(&self, collection: Collection) -> Result<(), StoreError> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let unavailable = || StoreError::Api {
                status: 503,
                message: format!("{} unavailable", collection.table()),
            };
            if self.broken.contains(&collection) {
                return Err(unavailable());
            }
            if collection == Collection::Meetings {
                let left = self.meeting_failures.load(Ordering::SeqCst);
                if left > 0 {
                    self.meeting_failures.store(left - 1, Ordering::SeqCst);
                    return Err(unavailable());
                }
            }
            Ok(())
        }
    }

    #[async_trait]
    impl RecordStore for FlakyStore {
        async fn fetch_by_ids(&self, collection: Collection, ids: &[String]) -> Result<Vec<Value>, StoreError> {
            self.check(collection).await?;
            self.inner.fetch_by_ids(collection, ids).await
        }

        async fn fetch_by_filter(&self, collection: Collection, filter: &Filter) -> Result<Vec<Value>, StoreError> {
            self.check(collection).await?;
            self.inner.fetch_by_filter(collection, filter).await
        }

        async fn fetch_by_overlap(
            &self,
            collection: Collection,
            array_field: &str,
            ids: &[String],
        ) -> Result<Vec<Value>, StoreError> {
            self.check(collection).await?;
            self.inner.fetch_by_overlap(collection, array_field, ids).await
        }
    }
}
