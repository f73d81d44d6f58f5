//! Subscription index.
//!
//! A multi-key index over the live subscription set.  Each subscription is
//! indexed under its most specific specified filter field (precedence
//! cage > site > farm > kind > tenant); subscriptions that specify none of
//! those land in a wildcard bucket.  Matching probes every index the event
//! has an attribute for, deduplicates, then evaluates the full filter
//! predicate on each candidate.
//!
//! The index itself is not synchronized; the router owns it behind a
//! single lock.

use crate::event::CanonicalEvent;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

/// Client-specified interest.  Unspecified fields are wildcards; specified
/// fields must match the event exactly.  `farm` is a legacy grouping alias
/// matched against the event's site.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionFilter {
    pub tenant: Option<String>,
    pub kind: Option<String>,
    pub farm: Option<String>,
    pub site: Option<String>,
    pub cage: Option<String>,
    /// Informational only; not consulted during matching.
    pub capabilities: Option<Vec<String>>,
}

impl SubscriptionFilter {
    /// Full predicate: every specified field must match exactly;
    /// unspecified fields are wildcards.
    pub fn matches(&self, attrs: &EventAttrs<'_>) -> bool {
        filter_matches(self, attrs)
    }
}

/// A long-lived per-client interest registration.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub id: Uuid,
    pub client_id: String,
    pub filter: SubscriptionFilter,
    pub include_status: bool,
    pub throttle_ms: u64,
    pub created_at: DateTime<Utc>,
    pub last_event_ts: Option<DateTime<Utc>>,
    pub event_count: u64,
}

impl Subscription {
    pub fn new(
        client_id: impl Into<String>,
        filter: SubscriptionFilter,
        include_status: bool,
        throttle_ms: u64,
    ) -> Self {
        Subscription {
            id: Uuid::new_v4(),
            client_id: client_id.into(),
            filter,
            include_status,
            throttle_ms,
            created_at: Utc::now(),
            last_event_ts: None,
            event_count: 0,
        }
    }
}

/// The attributes of an event the index can probe.
#[derive(Debug, Clone)]
pub struct EventAttrs<'a> {
    pub tenant: &'a str,
    pub kind: &'a str,
    pub site: &'a str,
    pub cage: Option<&'a str>,
}

impl<'a> EventAttrs<'a> {
    /// Attributes for matching.  `kind` comes from the stream's metric so
    /// a STATUS heartbeat matches the same filters as the stream's DATA.
    pub fn from_event(event: &'a CanonicalEvent) -> Self {
        Self::from_key(&event.envelope.key)
    }

    pub fn from_key(key: &'a crate::stream::StreamKey) -> Self {
        EventAttrs {
            tenant: &key.tenant,
            kind: key.metric.as_str(),
            site: &key.site,
            cage: key.cage.as_deref(),
        }
    }
}

/// Which secondary map a subscription lives in.
#[derive(Debug, Clone, PartialEq, Eq)]
enum IndexSlot {
    Cage(String),
    Site(String),
    Farm(String),
    Kind(String),
    Tenant(String),
    Wildcard,
}

fn slot_for(filter: &SubscriptionFilter) -> IndexSlot {
    if let Some(cage) = &filter.cage {
        IndexSlot::Cage(cage.clone())
    } else if let Some(site) = &filter.site {
        IndexSlot::Site(site.clone())
    } else if let Some(farm) = &filter.farm {
        IndexSlot::Farm(farm.clone())
    } else if let Some(kind) = &filter.kind {
        IndexSlot::Kind(kind.clone())
    } else if let Some(tenant) = &filter.tenant {
        IndexSlot::Tenant(tenant.clone())
    } else {
        IndexSlot::Wildcard
    }
}

/// Multi-key index of the live subscription set.
#[derive(Debug, Default)]
pub struct SubscriptionIndex {
    subs: HashMap<Uuid, Subscription>,
    by_client: HashMap<String, HashSet<Uuid>>,
    by_tenant: HashMap<String, HashSet<Uuid>>,
    by_kind: HashMap<String, HashSet<Uuid>>,
    by_farm: HashMap<String, HashSet<Uuid>>,
    by_site: HashMap<String, HashSet<Uuid>>,
    by_cage: HashMap<String, HashSet<Uuid>>,
    wildcard: HashSet<Uuid>,
}

impl SubscriptionIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.subs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subs.is_empty()
    }

    pub fn get(&self, id: &Uuid) -> Option<&Subscription> {
        self.subs.get(id)
    }

    pub fn count_for_client(&self, client_id: &str) -> usize {
        self.by_client.get(client_id).map_or(0, HashSet::len)
    }

    /// Insert a subscription, maintaining every secondary map.
    pub fn add(&mut self, sub: Subscription) -> Uuid {
        let id = sub.id;
        self.by_client
            .entry(sub.client_id.clone())
            .or_default()
            .insert(id);
        match slot_for(&sub.filter) {
            IndexSlot::Cage(v) => {
                self.by_cage.entry(v).or_default().insert(id);
            }
            IndexSlot::Site(v) => {
                self.by_site.entry(v).or_default().insert(id);
            }
            IndexSlot::Farm(v) => {
                self.by_farm.entry(v).or_default().insert(id);
            }
            IndexSlot::Kind(v) => {
                self.by_kind.entry(v).or_default().insert(id);
            }
            IndexSlot::Tenant(v) => {
                self.by_tenant.entry(v).or_default().insert(id);
            }
            IndexSlot::Wildcard => {
                self.wildcard.insert(id);
            }
        }
        self.subs.insert(id, sub);
        id
    }

    /// Remove one subscription, maintaining every secondary map.
    pub fn remove(&mut self, id: &Uuid) -> Option<Subscription> {
        let sub = self.subs.remove(id)?;
        if let Some(set) = self.by_client.get_mut(&sub.client_id) {
            set.remove(id);
            if set.is_empty() {
                self.by_client.remove(&sub.client_id);
            }
        }
        let remove_from = |map: &mut HashMap<String, HashSet<Uuid>>, value: &str| {
            if let Some(set) = map.get_mut(value) {
                set.remove(id);
                if set.is_empty() {
                    map.remove(value);
                }
            }
        };
        match slot_for(&sub.filter) {
            IndexSlot::Cage(v) => remove_from(&mut self.by_cage, &v),
            IndexSlot::Site(v) => remove_from(&mut self.by_site, &v),
            IndexSlot::Farm(v) => remove_from(&mut self.by_farm, &v),
            IndexSlot::Kind(v) => remove_from(&mut self.by_kind, &v),
            IndexSlot::Tenant(v) => remove_from(&mut self.by_tenant, &v),
            IndexSlot::Wildcard => {
                self.wildcard.remove(id);
            }
        }
        Some(sub)
    }

    /// Remove every subscription held by a client, returning their ids.
    pub fn remove_by_client(&mut self, client_id: &str) -> Vec<Uuid> {
        let ids: Vec<Uuid> = self
            .by_client
            .get(client_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        for id in &ids {
            self.remove(id);
        }
        ids
    }

    /// Update delivery stats for a subscription after a routed event.
    pub fn record_delivery(&mut self, id: &Uuid, at: DateTime<Utc>) {
        if let Some(sub) = self.subs.get_mut(id) {
            sub.last_event_ts = Some(at);
            sub.event_count += 1;
        }
    }

    /// All subscriptions matching a DATA event, unordered.
    pub fn match_event(&self, attrs: &EventAttrs<'_>) -> Vec<&Subscription> {
        self.candidates(attrs)
            .into_iter()
            .filter_map(|id| self.subs.get(&id))
            .filter(|sub| filter_matches(&sub.filter, attrs))
            .collect()
    }

    /// Like [`Self::match_event`] but for STATUS events: skips
    /// subscriptions whose `include_status` is false.
    pub fn match_status(&self, attrs: &EventAttrs<'_>) -> Vec<&Subscription> {
        self.match_event(attrs)
            .into_iter()
            .filter(|sub| sub.include_status)
            .collect()
    }

    fn candidates(&self, attrs: &EventAttrs<'_>) -> HashSet<Uuid> {
        let mut out = HashSet::new();
        if let Some(cage) = attrs.cage {
            if let Some(set) = self.by_cage.get(cage) {
                out.extend(set.iter().copied());
            }
        }
        if let Some(set) = self.by_site.get(attrs.site) {
            out.extend(set.iter().copied());
        }
        // farm is a site alias: probe with the event's site.
        if let Some(set) = self.by_farm.get(attrs.site) {
            out.extend(set.iter().copied());
        }
        if let Some(set) = self.by_kind.get(attrs.kind) {
            out.extend(set.iter().copied());
        }
        if let Some(set) = self.by_tenant.get(attrs.tenant) {
            out.extend(set.iter().copied());
        }
        out.extend(self.wildcard.iter().copied());
        out
    }
}

/// Full filter predicate: every specified field must match exactly.
fn filter_matches(filter: &SubscriptionFilter, attrs: &EventAttrs<'_>) -> bool {
    if let Some(tenant) = &filter.tenant {
        if tenant != attrs.tenant {
            return false;
        }
    }
    if let Some(kind) = &filter.kind {
        if kind != attrs.kind {
            return false;
        }
    }
    if let Some(farm) = &filter.farm {
        if farm != attrs.site {
            return false;
        }
    }
    if let Some(site) = &filter.site {
        if site != attrs.site {
            return false;
        }
    }
    if let Some(cage) = &filter.cage {
        match attrs.cage {
            Some(event_cage) if event_cage == cage => {}
            _ => return false,
        }
    }
    true
}
