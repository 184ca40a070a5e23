//! Hydrates the records reachable from a set of meetings.
//!
//! Fetch order: contacts, then companies, then deals (by company overlap, by
//! scalar company, and by direct ID). Contact-derived companies are only
//! followed when the contact fallback is enabled. Every
//! fetch is batched and skip-on-failure, so a flaky backend yields a smaller
//! graph rather than an error.

use std::collections::{BTreeSet, HashMap, HashSet};

use super::attribution::AttributionPolicy;
use crate::store::Gateway;
use crate::types::{Company, Contact, Deal, Meeting};

/// Array field linking deals and companies to companies.
pub const COMPANY_LINK_FIELD: &str = "Companies_fk_Companies";
/// Scalar company field on deals and contacts.
pub const COMPANY_SCALAR_FIELD: &str = "companies";
/// Array field linking deals and meetings to contacts.
pub const CONTACT_LINK_FIELD: &str = "Contacts_fk_Contacts";

/// Records reachable from the selected meetings, with lookup indexes.
#[derive(Debug, Default)]
pub struct LinkGraph {
    pub meeting_company_ids: BTreeSet<String>,
    pub meeting_deal_ids: BTreeSet<String>,
    pub meeting_contact_ids: BTreeSet<String>,
    /// Companies reached through contacts rather than directly.
    pub contact_company_ids: BTreeSet<String>,
    pub contacts: HashMap<String, Contact>,
    pub companies: HashMap<String, Company>,
    pub deals: HashMap<String, Deal>,
    /// Company ID to deal IDs, from each deal's company array. Sorted.
    pub deals_by_company: HashMap<String, Vec<String>>,
    /// Company ID to related company IDs. One hop; cycles are harmless.
    pub related: HashMap<String, Vec<String>>,
    /// Batches that failed and were skipped.
    pub failed_batches: usize,
}

impl LinkGraph {
    /// Build a graph from already-fetched records.
    pub fn from_records(
        meetings: &[Meeting],
        contacts: Vec<Contact>,
        companies: Vec<Company>,
        deals: Vec<Deal>,
    ) -> Self {
        let mut graph = LinkGraph::default();
        graph.collect_meeting_links(meetings);
        graph.insert_contacts(contacts);
        graph.insert_companies(companies);
        graph.insert_deals(deals);
        graph.index_deals();
        graph
    }

    fn collect_meeting_links(&mut self, meetings: &[Meeting]) {
        for meeting in meetings {
            self.meeting_company_ids
                .extend(meeting.company_ids.iter().cloned());
            self.meeting_deal_ids.extend(meeting.deal_ids.iter().cloned());
            self.meeting_contact_ids
                .extend(meeting.contact_ids.iter().cloned());
        }
    }

    fn insert_contacts(&mut self, contacts: Vec<Contact>) {
        for contact in contacts {
            for company_id in contact.linked_company_ids() {
                if !self.meeting_company_ids.contains(company_id) {
                    self.contact_company_ids.insert(company_id.to_string());
                }
            }
            self.contacts.insert(contact.id.clone(), contact);
        }
    }

    fn insert_companies(&mut self, companies: Vec<Company>) {
        for company in companies {
            self.related
                .insert(company.id.clone(), company.related_company_ids.clone());
            self.companies.insert(company.id.clone(), company);
        }
    }

    fn insert_deals(&mut self, deals: Vec<Deal>) {
        for deal in deals {
            self.deals.entry(deal.id.clone()).or_insert(deal);
        }
    }

    fn index_deals(&mut self) {
        let mut index: HashMap<String, Vec<String>> = HashMap::new();
        for deal in self.deals.values() {
            for company_id in &deal.company_ids {
                index
                    .entry(company_id.clone())
                    .or_default()
                    .push(deal.id.clone());
            }
        }
        for ids in index.values_mut() {
            ids.sort();
            ids.dedup();
        }
        self.deals_by_company = index;
    }

    pub fn deal(&self, id: &str) -> Option<&Deal> {
        self.deals.get(id)
    }

    pub fn deals_for_company(&self, company_id: &str) -> &[String] {
        self.deals_by_company
            .get(company_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn related_companies(&self, company_id: &str) -> &[String] {
        self.related
            .get(company_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Companies touched by any meeting in the run.
    pub fn touched_company_ids(&self) -> HashSet<String> {
        self.meeting_company_ids.iter().cloned().collect()
    }
}

/// Fetch every contact, company and deal reachable from `meetings` under
/// `policy`.
pub async fn resolve_link_graph(
    gateway: &Gateway<'_>,
    meetings: &[Meeting],
    policy: &AttributionPolicy,
) -> LinkGraph {
    let mut graph = LinkGraph::default();
    graph.collect_meeting_links(meetings);

    let contact_ids: Vec<String> = graph.meeting_contact_ids.iter().cloned().collect();
    let contacts = gateway.fetch_by_ids::<Contact>(&contact_ids).await;
    graph.failed_batches += contacts.failed_batches;
    graph.insert_contacts(contacts.records);

    let mut company_ids: Vec<String> = graph.meeting_company_ids.iter().cloned().collect();
    if policy.contact_fallback {
        company_ids.extend(
            graph
                .contact_company_ids
                .difference(&graph.meeting_company_ids)
                .cloned(),
        );
    }
    let companies = gateway.fetch_by_ids::<Company>(&company_ids).await;
    graph.failed_batches += companies.failed_batches;
    graph.insert_companies(companies.records);

    let by_overlap = gateway
        .fetch_by_overlap::<Deal>(COMPANY_LINK_FIELD, &company_ids)
        .await;
    let by_scalar = gateway
        .fetch_where_in::<Deal>(COMPANY_SCALAR_FIELD, &company_ids)
        .await;
    let deal_ids: Vec<String> = graph.meeting_deal_ids.iter().cloned().collect();
    let direct = gateway.fetch_by_ids::<Deal>(&deal_ids).await;

    graph.failed_batches +=
        by_overlap.failed_batches + by_scalar.failed_batches + direct.failed_batches;
    graph.insert_deals(by_overlap.records);
    graph.insert_deals(by_scalar.records);
    graph.insert_deals(direct.records);
    graph.index_deals();

    log::info!(
        "Resolved {} contacts, {} companies, {} deals from {} meetings ({} failed batches)",
        graph.contacts.len(),
        graph.companies.len(),
        graph.deals.len(),
        meetings.len(),
        graph.failed_batches
    );
    graph
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::test_support::{company, contact, deal_row, meeting_row, FlakyStore};
    use crate::store::sqlite::test_utils::seeded_store;
    use crate::store::Collection;
    use serde_json::json;

    fn meetings() -> Vec<Meeting> {
        vec![
            serde_json::from_value(meeting_row("m1", "Alice", &["C1"], &["D9"], &["P1"])).unwrap(),
            serde_json::from_value(meeting_row("m2", "Bob", &["C2"], &[], &[])).unwrap(),
        ]
    }

    fn seed() -> Vec<(Collection, serde_json::Value)> {
        vec![
            (Collection::Contacts, contact("P1", Some("C3"), &[])),
            (Collection::Companies, company("C1", &["C2"])),
            (Collection::Companies, company("C2", &["C1"])),
            (Collection::Companies, company("C3", &[])),
            (
                Collection::Deals,
                deal_row("D1", "Monthly Service", "Closed Won", json!(["C1"]), json!(null)),
            ),
            (
                Collection::Deals,
                deal_row("D2", "Monthly Service", "Closed Won", json!(null), json!("C2")),
            ),
            (
                Collection::Deals,
                deal_row("D3", "Monthly Service", "Closed Won", json!(["C3"]), json!(null)),
            ),
            (
                Collection::Deals,
                deal_row("D9", "Monthly Service", "Closed Won", json!(null), json!(null)),
            ),
            (
                Collection::Deals,
                deal_row("D7", "Monthly Service", "Closed Won", json!(["C7"]), json!(null)),
            ),
        ]
    }

    fn with_fallback() -> AttributionPolicy {
        AttributionPolicy {
            contact_fallback: true,
            ..AttributionPolicy::default()
        }
    }

    #[tokio::test]
    async fn test_resolves_all_link_paths() {
        let store = seeded_store(&seed());
        let gateway = Gateway::new(&store, 1);
        let meetings = meetings();
        let graph = resolve_link_graph(&gateway, &meetings, &with_fallback()).await;

        assert_eq!(graph.failed_batches, 0);
        assert_eq!(graph.contacts.len(), 1);
        assert!(graph.contact_company_ids.contains("C3"));
        assert_eq!(graph.companies.len(), 3);
        assert_eq!(graph.related_companies("C1"), &["C2".to_string()]);

        let mut ids: Vec<_> = graph.deals.keys().cloned().collect();
        ids.sort();
        assert_eq!(ids, vec!["D1", "D2", "D3", "D9"]);

        // Scalar-only deals are fetched but not indexed by company.
        assert_eq!(graph.deals_for_company("C1"), &["D1".to_string()]);
        assert!(graph.deals_for_company("C2").is_empty());
        assert_eq!(graph.deals_for_company("C3"), &["D3".to_string()]);
        assert_eq!(
            graph.touched_company_ids(),
            HashSet::from(["C1".to_string(), "C2".to_string()])
        );
    }

    #[tokio::test]
    async fn test_contact_companies_skipped_without_fallback() {
        let store = seeded_store(&seed());
        let gateway = Gateway::new(&store, 1);
        let meetings = meetings();
        let graph = resolve_link_graph(&gateway, &meetings, &AttributionPolicy::default()).await;

        assert!(graph.contact_company_ids.contains("C3"));
        assert!(!graph.companies.contains_key("C3"));
        assert!(graph.deal("D3").is_none());
        assert!(graph.deals_for_company("C3").is_empty());

        let mut ids: Vec<_> = graph.deals.keys().cloned().collect();
        ids.sort();
        assert_eq!(ids, vec!["D1", "D2", "D9"]);
    }

    #[tokio::test]
    async fn test_failed_batches_are_skipped() {
        let store = FlakyStore::new(seeded_store(&seed())).with_broken(Collection::Companies);
        let gateway = Gateway::new(&store, 100);
        let meetings = meetings();
        let graph = resolve_link_graph(&gateway, &meetings, &with_fallback()).await;

        assert_eq!(graph.failed_batches, 1);
        assert!(graph.companies.is_empty());
        assert!(graph.deal("D1").is_some());
    }

    #[test]
    fn test_deal_index_sorted_and_deduplicated() {
        let deals = vec![
            Deal {
                id: "b".into(),
                company_ids: vec!["C1".into(), "C1".into()],
                ..Deal::default()
            },
            Deal {
                id: "a".into(),
                company_ids: vec!["C1".into()],
                ..Deal::default()
            },
        ];
        let graph = LinkGraph::from_records(&[], Vec::new(), Vec::new(), deals);
        assert_eq!(graph.deals_for_company("C1"), &["a".to_string(), "b".to_string()]);
    }
}
