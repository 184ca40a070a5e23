//! Deal attribution: turns P3 meetings plus the resolved link graph into
//! per-employee metrics.
//!
//! Each meeting is credited to its raw assignee. Deals are reached through
//! three paths, evaluated in order for every meeting:
//!
//! 1. Direct deal links (narrowed by company when a meeting points at
//!    several deals and also has companies).
//! 2. Deals of the meeting's own companies. No related-company expansion.
//! 3. Deals of the meeting's contacts' companies. Opt-in, and only for
//!    meetings with neither deal nor company links.
//!
//! A deal is claimed by the first meeting that reaches it. Claimed deals are
//! never counted again in the same run, whichever path reaches them.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::resolver::LinkGraph;
use crate::types::{
    Deal, DealBucket, DealDetail, EmployeeMetrics, Meeting, TimePeriod, STAGE_CLOSED_LOST,
    STAGE_CLOSED_WON,
};

// =============================================================================
// Policy
// =============================================================================

/// Tunables for attribution and classification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttributionPolicy {
    /// Deal types that count. Compared trimmed and case-insensitively.
    #[serde(default = "default_eligible_deal_types")]
    pub eligible_deal_types: Vec<String>,
    /// Open deals at least this many days old are overdue.
    #[serde(default = "default_overdue_after_days")]
    pub overdue_after_days: i64,
    /// Walk contacts when a meeting has no deal or company links.
    #[serde(default)]
    pub contact_fallback: bool,
}

fn default_eligible_deal_types() -> Vec<String> {
    vec![
        "Monthly Service".to_string(),
        "Recurring Special Service".to_string(),
    ]
}

fn default_overdue_after_days() -> i64 {
    150
}

impl Default for AttributionPolicy {
    fn default() -> Self {
        Self {
            eligible_deal_types: default_eligible_deal_types(),
            overdue_after_days: default_overdue_after_days(),
            contact_fallback: false,
        }
    }
}

impl AttributionPolicy {
    pub fn is_eligible(&self, deal_type: Option<&str>) -> bool {
        let Some(deal_type) = deal_type else {
            return false;
        };
        let wanted = deal_type.trim().to_lowercase();
        if wanted.is_empty() {
            return false;
        }
        self.eligible_deal_types
            .iter()
            .any(|t| t.trim().to_lowercase() == wanted)
    }

    pub fn is_eligible_deal(&self, deal: &Deal) -> bool {
        self.is_eligible(deal.deal_type.as_deref())
    }
}

// =============================================================================
// Claimed deal registry
// =============================================================================

/// Deals already credited in this run.
#[derive(Debug, Default, Clone)]
pub struct ClaimedDealRegistry {
    claimed: HashSet<String>,
}

impl ClaimedDealRegistry {
    /// Claim `deal_id`. Returns false if someone already holds it.
    pub fn try_claim(&mut self, deal_id: &str) -> bool {
        if self.claimed.contains(deal_id) {
            return false;
        }
        self.claimed.insert(deal_id.to_string())
    }

    pub fn is_claimed(&self, deal_id: &str) -> bool {
        self.claimed.contains(deal_id)
    }

    pub fn len(&self) -> usize {
        self.claimed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.claimed.is_empty()
    }
}

// =============================================================================
// Classification
// =============================================================================

/// Bucket for a deal as of `now`. Open deals without a parseable creation
/// date land in no bucket.
pub fn classify(deal: &Deal, now: DateTime<Utc>, overdue_after_days: i64) -> Option<DealBucket> {
    match deal.stage() {
        STAGE_CLOSED_WON => Some(DealBucket::Won),
        STAGE_CLOSED_LOST => Some(DealBucket::Lost),
        _ => {
            let created = deal.created_at()?;
            let age_days = (now - created).num_days();
            if age_days < overdue_after_days {
                Some(DealBucket::InPlay)
            } else {
                Some(DealBucket::Overdue)
            }
        }
    }
}

/// Add a classified deal to an employee's totals.
pub fn accumulate(metrics: &mut EmployeeMetrics, deal: &Deal, bucket: DealBucket, period: TimePeriod) {
    let amount = period.annualize(deal.amount_or_zero());
    let name = deal
        .deal_name
        .as_deref()
        .filter(|n| !n.trim().is_empty());

    let detail = || DealDetail {
        name: name.unwrap_or(&deal.id).to_string(),
        stage: deal.stage().to_string(),
        classification: deal.deal_type.clone().unwrap_or_default(),
    };

    match bucket {
        DealBucket::Won => {
            metrics.deals_won_count += 1;
            metrics.deals_won_amount += amount;
            if let Some(name) = name {
                metrics.deals_won_names.push(name.to_string());
            }
        }
        DealBucket::Lost => {
            metrics.deals_lost_count += 1;
            metrics.deals_lost_amount += amount;
            if let Some(name) = name {
                metrics.deals_lost_names.push(name.to_string());
            }
        }
        DealBucket::InPlay => {
            metrics.deals_in_play_under_150_count += 1;
            metrics.deals_in_play_under_150_amount += amount;
            if let Some(name) = name {
                metrics.deals_in_play_under_150_names.push(name.to_string());
            }
            metrics.deals_in_play_under_150_details.push(detail());
        }
        DealBucket::Overdue => {
            metrics.deals_overdue_150_plus_count += 1;
            metrics.deals_overdue_150_plus_amount += amount;
            if let Some(name) = name {
                metrics.deals_overdue_150_plus_names.push(name.to_string());
            }
            metrics.deals_overdue_150_plus_details.push(detail());
        }
    }
}

// =============================================================================
// Diagnostics
// =============================================================================

/// Why a meeting produced no deal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoDealReason {
    /// No deal, company (or, with fallback, contact) links at all.
    NoLinks,
    /// Links existed but no deal record was found through them.
    DealsNotFound,
    /// Every deal found had a type outside the whitelist.
    IneligibleType,
    /// Every eligible deal was already claimed by an earlier meeting.
    AlreadyClaimed,
    /// Direct deals were all dropped by company narrowing.
    FilteredByCompany,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeetingWithoutDeal {
    pub meeting_id: String,
    pub employee: String,
    pub reason: NoDealReason,
}

#[derive(Debug, Default)]
struct MeetingTally {
    filtered: usize,
    found: usize,
    eligible: usize,
    accepted: usize,
}

impl MeetingTally {
    fn reason(&self, has_links: bool) -> Option<NoDealReason> {
        if self.accepted > 0 {
            None
        } else if self.eligible > 0 {
            Some(NoDealReason::AlreadyClaimed)
        } else if self.found > 0 {
            Some(NoDealReason::IneligibleType)
        } else if self.filtered > 0 {
            Some(NoDealReason::FilteredByCompany)
        } else if has_links {
            Some(NoDealReason::DealsNotFound)
        } else {
            Some(NoDealReason::NoLinks)
        }
    }
}

// =============================================================================
// Engine
// =============================================================================

/// Result of one attribution run.
#[derive(Debug)]
pub struct AttributionOutcome {
    /// One entry per distinct raw assignee, in first-encounter order.
    pub employees: Vec<EmployeeMetrics>,
    pub claimed: ClaimedDealRegistry,
    pub meetings_without_deals: Vec<MeetingWithoutDeal>,
}

pub struct AttributionEngine<'a> {
    policy: &'a AttributionPolicy,
    period: TimePeriod,
    now: DateTime<Utc>,
}

/// Per-run mutable state.
#[derive(Default)]
struct RunState {
    employees: Vec<EmployeeMetrics>,
    index: HashMap<String, usize>,
    claimed: ClaimedDealRegistry,
    meetings_without_deals: Vec<MeetingWithoutDeal>,
}

impl RunState {
    fn employee(&mut self, name: &str) -> usize {
        if let Some(&i) = self.index.get(name) {
            return i;
        }
        let i = self.employees.len();
        self.employees.push(EmployeeMetrics::new(name));
        self.index.insert(name.to_string(), i);
        i
    }
}

impl<'a> AttributionEngine<'a> {
    pub fn new(policy: &'a AttributionPolicy, period: TimePeriod, now: DateTime<Utc>) -> Self {
        Self {
            policy,
            period,
            now,
        }
    }

    /// Attribute every meeting, in the order given.
    pub fn run(&self, meetings: &[Meeting], graph: &LinkGraph) -> AttributionOutcome {
        let mut state = RunState::default();

        for meeting in meetings {
            let employee = meeting.assignee();
            let slot = state.employee(employee);
            state.employees[slot].meeting_count += 1;

            let mut tally = MeetingTally::default();
            self.direct_deals(meeting, graph, slot, &mut state, &mut tally);
            self.company_deals(meeting, graph, slot, &mut state, &mut tally);

            let fallback = self.policy.contact_fallback
                && meeting.deal_ids.is_empty()
                && meeting.company_ids.is_empty();
            if fallback {
                self.contact_deals(meeting, graph, slot, &mut state, &mut tally);
            }

            let has_links = !meeting.deal_ids.is_empty()
                || !meeting.company_ids.is_empty()
                || (fallback && !meeting.contact_ids.is_empty());
            if let Some(reason) = tally.reason(has_links) {
                log::debug!("Meeting {}: no deal ({:?})", meeting.id, reason);
                state.meetings_without_deals.push(MeetingWithoutDeal {
                    meeting_id: meeting.id.clone(),
                    employee: employee.to_string(),
                    reason,
                });
            }
        }

        log::info!(
            "Attributed {} deals across {} employees ({} meetings without a deal)",
            state.claimed.len(),
            state.employees.len(),
            state.meetings_without_deals.len()
        );

        AttributionOutcome {
            employees: state.employees,
            claimed: state.claimed,
            meetings_without_deals: state.meetings_without_deals,
        }
    }

    fn direct_deals(
        &self,
        meeting: &Meeting,
        graph: &LinkGraph,
        slot: usize,
        state: &mut RunState,
        tally: &mut MeetingTally,
    ) {
        if meeting.deal_ids.is_empty() {
            return;
        }
        let mut seen = HashSet::new();
        let mut ids: Vec<&str> = meeting
            .deal_ids
            .iter()
            .map(String::as_str)
            .filter(|id| seen.insert(*id))
            .collect();

        if ids.len() > 1 && !meeting.company_ids.is_empty() {
            let meeting_companies: HashSet<String> = meeting.company_ids.iter().cloned().collect();
            let before = ids.len();
            ids.retain(|id| {
                graph
                    .deal(id)
                    .is_some_and(|deal| deal.is_associated_with_any(&meeting_companies))
            });
            tally.filtered += before - ids.len();
        }

        log::debug!(
            "Meeting {}: priority 1, {} direct deal(s)",
            meeting.id,
            ids.len()
        );
        for id in ids {
            self.consider(id, graph, slot, state, tally);
        }
    }

    fn company_deals(
        &self,
        meeting: &Meeting,
        graph: &LinkGraph,
        slot: usize,
        state: &mut RunState,
        tally: &mut MeetingTally,
    ) {
        if meeting.company_ids.is_empty() {
            return;
        }
        log::debug!(
            "Meeting {}: priority 2, {} compan(ies)",
            meeting.id,
            meeting.company_ids.len()
        );
        for company_id in &meeting.company_ids {
            for deal_id in graph.deals_for_company(company_id) {
                self.consider(deal_id, graph, slot, state, tally);
            }
        }
    }

    fn contact_deals(
        &self,
        meeting: &Meeting,
        graph: &LinkGraph,
        slot: usize,
        state: &mut RunState,
        tally: &mut MeetingTally,
    ) {
        log::debug!(
            "Meeting {}: priority 3, {} contact(s)",
            meeting.id,
            meeting.contact_ids.len()
        );
        for contact_id in &meeting.contact_ids {
            let Some(contact) = graph.contacts.get(contact_id) else {
                continue;
            };
            for company_id in contact.linked_company_ids() {
                for deal_id in graph.deals_for_company(company_id) {
                    self.consider(deal_id, graph, slot, state, tally);
                }
            }
        }
    }

    /// Skip missing, ineligible or claimed deals; otherwise claim, classify
    /// and accumulate.
    fn consider(
        &self,
        deal_id: &str,
        graph: &LinkGraph,
        slot: usize,
        state: &mut RunState,
        tally: &mut MeetingTally,
    ) {
        let Some(deal) = graph.deal(deal_id) else {
            return;
        };
        tally.found += 1;
        if !self.policy.is_eligible_deal(deal) {
            return;
        }
        tally.eligible += 1;
        if !state.claimed.try_claim(deal_id) {
            return;
        }
        tally.accepted += 1;

        if let Some(bucket) = classify(deal, self.now, self.policy.overdue_after_days) {
            accumulate(&mut state.employees[slot], deal, bucket, self.period);
        }
    }
}
