//! Removed-deals audit.
//!
//! Rebuilds the candidate set of the previous attribution policy (direct
//! deals, deals of one-hop related companies, deals sharing a contact) and
//! reports which of those candidates the current engine did not claim.

use std::collections::{HashMap, HashSet};

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::attribution::{AttributionPolicy, ClaimedDealRegistry};
use super::resolver::{LinkGraph, COMPANY_LINK_FIELD, COMPANY_SCALAR_FIELD, CONTACT_LINK_FIELD};
use crate::store::Gateway;
use crate::types::{Deal, Meeting};

/// A legacy candidate the current policy no longer credits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemovedDeal {
    pub id: String,
    pub name: Option<String>,
    pub companies: Option<String>,
    #[serde(rename = "type")]
    pub deal_type: Option<String>,
    pub stage: Option<String>,
    pub create_date: Option<String>,
    pub amount: Option<f64>,
}

impl RemovedDeal {
    fn from_deal(id: &str, deal: Option<&Deal>) -> Self {
        Self {
            id: id.to_string(),
            name: deal.and_then(|d| d.deal_name.clone()),
            companies: deal.and_then(|d| d.companies.clone()),
            deal_type: deal.and_then(|d| d.deal_type.clone()),
            stage: deal.and_then(|d| d.deal_stage.clone()),
            create_date: deal.and_then(|d| d.create_date.clone()),
            amount: deal.and_then(|d| d.amount),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemovedDealsEntry {
    pub employee: String,
    pub count: usize,
    pub deals: Vec<RemovedDeal>,
}

/// Ordered, de-duplicated ID list.
#[derive(Default)]
struct OrderedIds {
    ids: Vec<String>,
    seen: HashSet<String>,
}

impl OrderedIds {
    fn push(&mut self, id: &str) {
        if self.seen.insert(id.to_string()) {
            self.ids.push(id.to_string());
        }
    }
}

/// Employees (raw names, first-encounter order) matching `pattern`.
fn matching_employees<'m>(meetings: &'m [Meeting], pattern: &Regex) -> Vec<&'m str> {
    let mut seen = HashSet::new();
    meetings
        .iter()
        .map(Meeting::assignee)
        .filter(|name| seen.insert(*name))
        .filter(|name| pattern.is_match(name))
        .collect()
}

/// Diff the legacy candidate set against the deals the current engine
/// claimed, for every employee matching `pattern`.
pub async fn removed_deals_report(
    gateway: &Gateway<'_>,
    meetings: &[Meeting],
    graph: &LinkGraph,
    claimed: &ClaimedDealRegistry,
    pattern: &Regex,
    policy: &AttributionPolicy,
) -> Vec<RemovedDealsEntry> {
    let mut results = Vec::new();

    for employee in matching_employees(meetings, pattern) {
        let own: Vec<&Meeting> = meetings.iter().filter(|m| m.assignee() == employee).collect();

        let mut candidates = OrderedIds::default();
        let mut related = OrderedIds::default();
        let mut contacts = OrderedIds::default();
        for meeting in &own {
            for id in &meeting.deal_ids {
                if graph.deal(id).is_some_and(|d| policy.is_eligible_deal(d)) {
                    candidates.push(id);
                }
            }
            for company_id in &meeting.company_ids {
                for related_id in graph.related_companies(company_id) {
                    related.push(related_id);
                }
            }
            for contact_id in &meeting.contact_ids {
                contacts.push(contact_id);
            }
        }

        let mut fetched: HashMap<String, Deal> = HashMap::new();
        let mut legacy_deals = Vec::new();
        legacy_deals.extend(
            gateway
                .fetch_by_overlap::<Deal>(COMPANY_LINK_FIELD, &related.ids)
                .await
                .records,
        );
        legacy_deals.extend(
            gateway
                .fetch_where_in::<Deal>(COMPANY_SCALAR_FIELD, &related.ids)
                .await
                .records,
        );
        legacy_deals.extend(
            gateway
                .fetch_by_overlap::<Deal>(CONTACT_LINK_FIELD, &contacts.ids)
                .await
                .records,
        );
        for deal in legacy_deals {
            if policy.is_eligible_deal(&deal) {
                candidates.push(&deal.id);
                fetched.entry(deal.id.clone()).or_insert(deal);
            }
        }

        let deals: Vec<RemovedDeal> = candidates
            .ids
            .iter()
            .filter(|id| !claimed.is_claimed(id))
            .map(|id| RemovedDeal::from_deal(id, graph.deal(id).or_else(|| fetched.get(id))))
            .collect();

        log::info!(
            "{}: {} legacy candidate(s), {} removed",
            employee,
            candidates.ids.len(),
            deals.len()
        );
        results.push(RemovedDealsEntry {
            employee: employee.to_string(),
            count: deals.len(),
            deals,
        });
    }
    results
}
