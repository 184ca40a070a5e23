//! Deals an employee owns whose companies never had a P3 meeting in the
//! window. Diagnostic only: these deals stay out of the bucket totals.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};

use super::attribution::{classify, AttributionPolicy};
use super::selector::ReportWindow;
use crate::store::{Filter, Gateway};
use crate::types::{Deal, DealWithoutP3, EmployeeMetrics, UNASSIGNED};

const DEAL_OWNER_FIELD: &str = "deal_owner";
const CREATE_DATE_FIELD: &str = "create_date";

/// Per-employee deals without a P3 meeting. Employees whose query failed are
/// absent from the map.
pub async fn find_deals_without_p3(
    gateway: &Gateway<'_>,
    employees: &[String],
    touched_companies: &HashSet<String>,
    window: Option<&ReportWindow>,
    policy: &AttributionPolicy,
    now: DateTime<Utc>,
) -> HashMap<String, Vec<DealWithoutP3>> {
    let mut found = HashMap::new();

    for employee in employees {
        if employee == UNASSIGNED {
            continue;
        }
        let mut parts = vec![Filter::eq(DEAL_OWNER_FIELD, employee)];
        if let Some(window) = window {
            parts.extend(window.filters(CREATE_DATE_FIELD));
        }

        let deals = match gateway.fetch_by_filter::<Deal>(&Filter::And(parts)).await {
            Ok(deals) => deals,
            Err(e) => {
                log::warn!("Skipping deals-without-P3 scan for {}: {}", employee, e);
                continue;
            }
        };

        let orphans: Vec<DealWithoutP3> = deals
            .iter()
            .filter(|deal| policy.is_eligible_deal(deal))
            .filter(|deal| !deal.is_associated_with_any(touched_companies))
            .map(|deal| DealWithoutP3 {
                id: deal.id.clone(),
                name: deal.deal_name.clone(),
                stage: deal.deal_stage.clone(),
                deal_type: deal.deal_type.clone(),
                amount: deal.amount,
                create_date: deal.create_date.clone(),
                bucket: classify(deal, now, policy.overdue_after_days),
            })
            .collect();

        log::debug!(
            "{}: {} owned deal(s), {} without a P3 meeting",
            employee,
            deals.len(),
            orphans.len()
        );
        found.insert(employee.clone(), orphans);
    }
    found
}

/// Copy scan results onto the matching employees.
pub fn attach(employees: &mut [EmployeeMetrics], mut found: HashMap<String, Vec<DealWithoutP3>>) {
    for metrics in employees.iter_mut() {
        if let Some(deals) = found.remove(&metrics.employee_name) {
            metrics.deals_without_p3_count = deals.len() as u32;
            metrics.deals_without_p3 = deals;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::test_support::{deal_row, FlakyStore};
    use crate::store::sqlite::test_utils::seeded_store;
    use crate::store::{Collection, SqliteStore};
    use crate::types::DealBucket;
    use chrono::TimeZone;
    use serde_json::{json, Value};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 15, 12, 0, 0).unwrap()
    }

    fn owned(id: &str, owner: &str, deal_type: &str, companies: Value, created: &str) -> Value {
        let mut row = deal_row(id, deal_type, "Proposal Sent", companies, json!(null));
        row["deal_owner"] = json!(owner);
        row["create_date"] = json!(created);
        row
    }

    fn store() -> SqliteStore {
        seeded_store(&[
            (
                Collection::Deals,
                owned("D1", "Alice", "Monthly Service", json!(["C1"]), "2026-06-01T00:00:00Z"),
            ),
            (
                Collection::Deals,
                owned("D2", "Alice", "Monthly Service", json!(["C9"]), "2026-06-02T00:00:00Z"),
            ),
            (
                Collection::Deals,
                owned("D3", "Alice", "Consulting", json!(["C9"]), "2026-06-03T00:00:00Z"),
            ),
            (
                Collection::Deals,
                owned("D4", "Alice", "Monthly Service", json!(["C8"]), "2025-01-03T00:00:00Z"),
            ),
            (
                Collection::Deals,
                owned("D5", "Unassigned", "Monthly Service", json!([]), "2026-06-03T00:00:00Z"),
            ),
        ])
    }

    #[tokio::test]
    async fn test_reports_untouched_eligible_deals() {
        let store = store();
        let gateway = Gateway::new(&store, 100);
        let touched = HashSet::from(["C1".to_string()]);
        let employees = vec!["Alice".to_string(), UNASSIGNED.to_string()];
        let window = ReportWindow {
            start: Utc.with_ymd_and_hms(2026, 6, 1, 0, 0, 0).unwrap(),
            end: Utc.with_ymd_and_hms(2026, 7, 1, 0, 0, 0).unwrap(),
        };

        let found = find_deals_without_p3(
            &gateway,
            &employees,
            &touched,
            Some(&window),
            &AttributionPolicy::default(),
            now(),
        )
        .await;

        assert!(!found.contains_key(UNASSIGNED));
        let alice = &found["Alice"];
        assert_eq!(alice.len(), 1);
        assert_eq!(alice[0].id, "D2");
        assert_eq!(alice[0].bucket, Some(DealBucket::InPlay));

        let all_time = find_deals_without_p3(
            &gateway,
            &employees,
            &touched,
            None,
            &AttributionPolicy::default(),
            now(),
        )
        .await;
        let ids: Vec<_> = all_time["Alice"].iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["D2", "D4"]);
        assert_eq!(all_time["Alice"][1].bucket, Some(DealBucket::Overdue));
    }

    #[tokio::test]
    async fn test_failed_scan_is_skipped() {
        let store = FlakyStore::new(store()).with_broken(Collection::Deals);
        let gateway = Gateway::new(&store, 100);
        let found = find_deals_without_p3(
            &gateway,
            &["Alice".to_string()],
            &HashSet::new(),
            None,
            &AttributionPolicy::default(),
            now(),
        )
        .await;
        assert!(found.is_empty());
    }

    #[test]
    fn test_attach_fills_only_orphan_fields() {
        let mut employees = vec![EmployeeMetrics::new("Alice"), EmployeeMetrics::new("Bob")];
        employees[0].deals_won_count = 2;
        let mut found = HashMap::new();
        found.insert(
            "Alice".to_string(),
            vec![DealWithoutP3 {
                id: "D2".into(),
                name: None,
                stage: None,
                deal_type: None,
                amount: None,
                create_date: None,
                bucket: None,
            }],
        );
        attach(&mut employees, found);
        assert_eq!(employees[0].deals_without_p3_count, 1);
        assert_eq!(employees[0].deals_won_count, 2);
        assert_eq!(employees[1].deals_without_p3_count, 0);
    }
}
