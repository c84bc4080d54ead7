//! Iterative node and value lookup
//!
//! The shortlist starts from the local routing table and is kept sorted by
//! distance to the target and truncated to `k`. Each policy queries the
//! closest contacts not yet asked and stops when a reply brings a value,
//! when nothing closer turned up and every shortlist contact has been
//! asked, or after `max_rounds`. A contact that fails leaves the shortlist,
//! and the best known distance falls back to whoever is closest now.

use futures::stream::{FuturesUnordered, StreamExt};
use kadbus_protocol::{Contact, DhtEntry, Distance, FindValueResult, NodeId};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tracing::{debug, trace};

use crate::config::Parallelism;
use crate::error::TransportError;
use crate::transport::{PeerTransport, RpcResult};

/// What a queried peer sent back
enum Reply {
    Contacts(Vec<Contact>),
    Entries(Vec<DhtEntry>),
}

/// Effect of one reply on the lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Progress {
    Found,
    Closer,
    Stalled,
}

/// Result of a finished lookup
#[derive(Debug, Clone, Default)]
pub struct LookupOutcome {
    /// Up to `k` contacts closest to the target that did not fail
    pub closest: Vec<Contact>,

    /// Entries returned by value lookups, newest per publisher
    pub entries: Vec<DhtEntry>,

    /// Contacts that answered
    pub responded: Vec<Contact>,

    pub rounds: usize,
    pub requests: usize,
}

/// Tunables for one lookup
#[derive(Debug, Clone, Copy)]
pub struct LookupParams {
    pub k: usize,
    pub alpha: usize,
    pub max_rounds: usize,
    pub request_timeout: Duration,
    pub parallelism: Parallelism,
}

pub(crate) struct Lookup<'a> {
    transport: &'a dyn PeerTransport,
    local: NodeId,
    target: NodeId,
    key: Option<&'a str>,
    params: LookupParams,

    shortlist: Vec<Contact>,
    queried: HashSet<NodeId>,
    failed: HashSet<NodeId>,
    best: Option<Distance>,

    responded: Vec<Contact>,
    found: HashMap<NodeId, DhtEntry>,
    rounds: usize,
    requests: usize,
}

impl<'a> Lookup<'a> {
    /// Lookup for the contacts closest to `target`
    pub(crate) fn for_node(
        transport: &'a dyn PeerTransport,
        local: NodeId,
        target: NodeId,
        seeds: Vec<Contact>,
        params: LookupParams,
    ) -> Self {
        Self::new(transport, local, target, None, seeds, params)
    }

    /// Lookup for the entries stored under `key`
    pub(crate) fn for_value(
        transport: &'a dyn PeerTransport,
        local: NodeId,
        key: &'a str,
        seeds: Vec<Contact>,
        params: LookupParams,
    ) -> Self {
        Self::new(transport, local, NodeId::for_key(key), Some(key), seeds, params)
    }

    fn new(
        transport: &'a dyn PeerTransport,
        local: NodeId,
        target: NodeId,
        key: Option<&'a str>,
        seeds: Vec<Contact>,
        params: LookupParams,
    ) -> Self {
        let mut lookup = Lookup {
            transport,
            local,
            target,
            key,
            params,
            shortlist: Vec::new(),
            queried: HashSet::new(),
            failed: HashSet::new(),
            best: None,
            responded: Vec::new(),
            found: HashMap::new(),
            rounds: 0,
            requests: 0,
        };
        lookup.merge(seeds);
        lookup.best = lookup.closest_distance();
        lookup
    }

    pub(crate) async fn run(mut self) -> LookupOutcome {
        match self.params.parallelism {
            Parallelism::Strict => self.run_rounds(self.params.alpha).await,
            Parallelism::Loose => self.run_rounds(usize::MAX).await,
            Parallelism::Bounded => self.run_bounded().await,
        }

        debug!(
            target_id = %self.target,
            rounds = self.rounds,
            requests = self.requests,
            responded = self.responded.len(),
            found = self.found.len(),
            "lookup completed"
        );

        LookupOutcome {
            closest: self.shortlist,
            entries: self.found.into_values().collect(),
            responded: self.responded,
            rounds: self.rounds,
            requests: self.requests,
        }
    }

    /// Round-based policies: `width` requests per round, all awaited
    /// before the next round starts
    async fn run_rounds(&mut self, width: usize) {
        while self.rounds < self.params.max_rounds {
            let batch = self.next_batch(width);
            if batch.is_empty() {
                break;
            }
            self.rounds += 1;
            self.requests += batch.len();
            trace!(target_id = %self.target, round = self.rounds, width = batch.len(), "lookup round");

            let replies = futures::future::join_all(
                batch.into_iter().map(|contact| self.query(contact)),
            )
            .await;

            let mut found = false;
            let mut closer = false;
            for (contact, reply) in replies {
                match self.absorb(contact, reply) {
                    Progress::Found => found = true,
                    Progress::Closer => closer = true,
                    Progress::Stalled => {}
                }
            }

            if found || (!closer && !self.has_unqueried()) {
                break;
            }
        }
    }

    /// At most `alpha` requests in flight, refilled as replies arrive
    async fn run_bounded(&mut self) {
        let alpha = self.params.alpha;
        let budget = self.params.max_rounds.saturating_mul(alpha);
        let mut in_flight = FuturesUnordered::new();
        let mut stalled = 0;

        loop {
            while in_flight.len() < alpha && self.requests < budget {
                let Some(contact) = self.next_batch(1).pop() else {
                    break;
                };
                self.requests += 1;
                in_flight.push(query(
                    self.transport,
                    contact,
                    self.target,
                    self.key,
                    self.params.request_timeout,
                ));
            }

            let Some((contact, reply)) = in_flight.next().await else {
                break;
            };

            match self.absorb(contact, reply) {
                Progress::Found => break,
                Progress::Closer => stalled = 0,
                Progress::Stalled => stalled += 1,
            }
            if stalled >= alpha && !self.has_unqueried() {
                break;
            }
        }

        self.rounds = self.requests.div_ceil(alpha.max(1));
    }

    fn query(
        &self,
        contact: Contact,
    ) -> impl std::future::Future<Output = (Contact, RpcResult<Reply>)> + 'a {
        query(
            self.transport,
            contact,
            self.target,
            self.key,
            self.params.request_timeout,
        )
    }

    /// Closest `width` contacts not yet queried, marked as queried
    fn next_batch(&mut self, width: usize) -> Vec<Contact> {
        let batch: Vec<Contact> = self
            .shortlist
            .iter()
            .filter(|c| !self.queried.contains(&c.node_id))
            .take(width)
            .cloned()
            .collect();
        for contact in &batch {
            self.queried.insert(contact.node_id);
        }
        batch
    }

    fn has_unqueried(&self) -> bool {
        self.shortlist
            .iter()
            .any(|c| !self.queried.contains(&c.node_id))
    }

    fn absorb(&mut self, contact: Contact, reply: RpcResult<Reply>) -> Progress {
        match reply {
            Ok(Reply::Contacts(contacts)) => {
                self.responded.push(contact);
                self.merge(contacts);
            }
            Ok(Reply::Entries(entries)) => {
                self.responded.push(contact);
                for entry in entries.into_iter().filter(|e| !e.is_expired()) {
                    match self.found.get(&entry.publisher) {
                        Some(held) if held.version >= entry.version => {}
                        _ => {
                            self.found.insert(entry.publisher, entry);
                        }
                    }
                }
                if !self.found.is_empty() {
                    return Progress::Found;
                }
            }
            Err(e) => {
                // Dropped from this lookup only; the routing table keeps it
                self.failed.insert(contact.node_id);
                self.shortlist.retain(|c| c.node_id != contact.node_id);
                if e.is_transient() {
                    debug!(peer = %contact, error = %e, "lookup peer unavailable");
                } else {
                    debug!(peer = %contact, error = %e, "lookup request failed");
                }
                if self.best == Some(self.target.distance(&contact.node_id)) {
                    self.best = self.closest_distance();
                }
                return Progress::Stalled;
            }
        }

        match self.closest_distance() {
            Some(distance) if self.best.map_or(true, |best| distance < best) => {
                self.best = Some(distance);
                Progress::Closer
            }
            _ => Progress::Stalled,
        }
    }

    fn merge(&mut self, contacts: Vec<Contact>) {
        for contact in contacts {
            let known = self.shortlist.iter().any(|c| c.node_id == contact.node_id);
            if !known && contact.node_id != self.local && !self.failed.contains(&contact.node_id) {
                self.shortlist.push(contact);
            }
        }
        let target = self.target;
        self.shortlist
            .sort_by(|a, b| target.cmp_distance(&a.node_id, &b.node_id));
        self.shortlist.truncate(self.params.k);
    }

    fn closest_distance(&self) -> Option<Distance> {
        self.shortlist
            .first()
            .map(|c| self.target.distance(&c.node_id))
    }
}

async fn query(
    transport: &dyn PeerTransport,
    contact: Contact,
    target: NodeId,
    key: Option<&str>,
    limit: Duration,
) -> (Contact, RpcResult<Reply>) {
    let reply = match key {
        Some(key) => tokio::time::timeout(limit, transport.find_value(&contact, key))
            .await
            .map(|r| {
                r.map(|result| match result {
                    FindValueResult::Found(entries) => Reply::Entries(entries),
                    FindValueResult::Closer(contacts) => Reply::Contacts(contacts),
                })
            }),
        None => tokio::time::timeout(limit, transport.find_node(&contact, &target))
            .await
            .map(|r| r.map(Reply::Contacts)),
    };

    (contact, reply.unwrap_or(Err(TransportError::Timeout)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use kadbus_protocol::{CallbackMessage, DataRequest, DataResponse};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Every peer knows the whole population; `holder` has the value
    struct Population {
        contacts: Vec<Contact>,
        holder: Option<NodeId>,
        dead: HashSet<NodeId>,
        requests: AtomicUsize,
    }

    impl Population {
        fn new(size: usize) -> Self {
            let contacts = (0..size)
                .map(|i| Contact::new(NodeId::random(), format!("mem://{}", i)))
                .collect();
            Population {
                contacts,
                holder: None,
                dead: HashSet::new(),
                requests: AtomicUsize::new(0),
            }
        }

        fn check(&self, to: &Contact) -> RpcResult<()> {
            self.requests.fetch_add(1, Ordering::SeqCst);
            if self.dead.contains(&to.node_id) {
                return Err(TransportError::Unreachable(to.address.clone()));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl PeerTransport for Population {
        async fn ping(&self, to: &Contact) -> RpcResult<()> {
            self.check(to)
        }
        async fn find_node(&self, to: &Contact, _: &NodeId) -> RpcResult<Vec<Contact>> {
            self.check(to)?;
            Ok(self.contacts.clone())
        }
        async fn find_value(&self, to: &Contact, key: &str) -> RpcResult<FindValueResult> {
            self.check(to)?;
            if self.holder == Some(to.node_id) {
                let entry = DhtEntry::new(key, b"value".to_vec(), to.node_id, Duration::from_secs(60));
                return Ok(FindValueResult::Found(vec![entry]));
            }
            Ok(FindValueResult::Closer(self.contacts.clone()))
        }
        async fn store(&self, _: &Contact, _: DhtEntry) -> RpcResult<()> {
            Err(TransportError::Unsupported)
        }
        async fn callback(&self, _: &Contact, _: CallbackMessage) -> RpcResult<()> {
            Err(TransportError::Unsupported)
        }
        async fn execute_data_request(&self, _: &Contact, _: DataRequest) -> RpcResult<DataResponse> {
            Err(TransportError::Unsupported)
        }
    }

    fn params(parallelism: Parallelism) -> LookupParams {
        LookupParams {
            k: 5,
            alpha: 2,
            max_rounds: 8,
            request_timeout: Duration::from_millis(200),
            parallelism,
        }
    }

    fn brute_force(contacts: &[Contact], target: &NodeId, k: usize) -> Vec<Contact> {
        let mut sorted = contacts.to_vec();
        sorted.sort_by(|a, b| target.cmp_distance(&a.node_id, &b.node_id));
        sorted.truncate(k);
        sorted
    }

    #[tokio::test]
    async fn test_node_lookup_finds_closest_under_every_policy() {
        let population = Population::new(12);
        let target = NodeId::random();
        let expected = brute_force(&population.contacts, &target, 5);

        for policy in [Parallelism::Strict, Parallelism::Bounded, Parallelism::Loose] {
            let seeds = population.contacts[..3].to_vec();
            let outcome =
                Lookup::for_node(&population, NodeId::random(), target, seeds, params(policy))
                    .run()
                    .await;
            assert_eq!(outcome.closest, expected, "policy {:?}", policy);
            assert!(outcome.rounds <= 8);
        }
    }

    #[tokio::test]
    async fn test_value_lookup_stops_at_holder() {
        let mut population = Population::new(5);
        let holder = population.contacts[0].node_id;
        population.holder = Some(holder);
        let seeds = population.contacts.clone();

        let outcome = Lookup::for_value(
            &population,
            NodeId::random(),
            "topic",
            seeds,
            params(Parallelism::Loose),
        )
        .run()
        .await;

        assert_eq!(outcome.entries.len(), 1);
        assert_eq!(outcome.entries[0].publisher, holder);
        assert_eq!(outcome.rounds, 1);
    }

    #[tokio::test]
    async fn test_value_lookup_moves_past_dead_closest_contacts() {
        let mut population = Population::new(5);
        let target = NodeId::for_key("topic");
        population.contacts = brute_force(&population.contacts, &target, 5);
        population.dead.insert(population.contacts[0].node_id);
        population.dead.insert(population.contacts[1].node_id);
        let holder = population.contacts[2].node_id;
        population.holder = Some(holder);
        let seeds = population.contacts.clone();

        let outcome = Lookup::for_value(
            &population,
            NodeId::random(),
            "topic",
            seeds,
            params(Parallelism::Strict),
        )
        .run()
        .await;

        assert_eq!(outcome.entries.len(), 1);
        assert_eq!(outcome.entries[0].publisher, holder);
        assert_eq!(outcome.rounds, 2);
        assert_eq!(outcome.requests, 4);
    }

    #[tokio::test]
    async fn test_node_lookup_asks_every_live_contact_after_failures() {
        let mut population = Population::new(5);
        let target = NodeId::random();
        population.contacts = brute_force(&population.contacts, &target, 5);
        population.dead.insert(population.contacts[0].node_id);
        population.dead.insert(population.contacts[1].node_id);
        let seeds = population.contacts.clone();

        for policy in [Parallelism::Strict, Parallelism::Bounded] {
            let outcome =
                Lookup::for_node(&population, NodeId::random(), target, seeds.clone(), params(policy))
                    .run()
                    .await;
            assert_eq!(outcome.closest, population.contacts[2..].to_vec(), "policy {:?}", policy);
            assert_eq!(outcome.responded.len(), 3, "policy {:?}", policy);
        }
    }

    #[tokio::test]
    async fn test_failed_peers_are_dropped_from_result() {
        let mut population = Population::new(8);
        let dead = population.contacts[1].node_id;
        population.dead.insert(dead);
        let seeds = population.contacts.clone();

        let outcome = Lookup::for_node(
            &population,
            NodeId::random(),
            NodeId::random(),
            seeds,
            params(Parallelism::Loose),
        )
        .run()
        .await;

        assert!(outcome.closest.iter().all(|c| c.node_id != dead));
        assert!(outcome.responded.iter().all(|c| c.node_id != dead));
    }

    #[tokio::test]
    async fn test_bounded_respects_request_budget() {
        let population = Population::new(40);
        let mut p = params(Parallelism::Bounded);
        p.k = 40;
        p.max_rounds = 2;

        let outcome = Lookup::for_node(
            &population,
            NodeId::random(),
            NodeId::random(),
            population.contacts.clone(),
            p,
        )
        .run()
        .await;

        assert!(outcome.requests <= 4);
        assert_eq!(population.requests.load(Ordering::SeqCst), outcome.requests);
    }

    #[tokio::test]
    async fn test_empty_shortlist_sends_nothing() {
        let population = Population::new(0);
        let outcome = Lookup::for_node(
            &population,
            NodeId::random(),
            NodeId::random(),
            Vec::new(),
            params(Parallelism::Strict),
        )
        .run()
        .await;

        assert!(outcome.closest.is_empty());
        assert_eq!(outcome.requests, 0);
    }
}
