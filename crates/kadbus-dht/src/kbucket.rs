//! K-bucket implementation for Kademlia DHT
//!
//! A full bucket does not decide on its own whether a newcomer gets in:
//! `offer` hands back a [`PendingProbe`] for the least-recently-seen contact,
//! the caller pings it, and `resolve` applies the outcome. Each candidate
//! moves through `Unknown -> Probed -> {Evicted, Retained}`.

use kadbus_protocol::{Contact, NodeId};
use std::collections::VecDeque;
use tokio::time::Instant;

/// Where a bucket candidate is in the liveness-probe cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeState {
    /// Candidate seen, head not yet pinged
    Unknown,
    /// Ping to the head is in flight
    Probed,
    /// Head was unresponsive and the candidate took its slot
    Evicted,
    /// Head answered; the candidate was not admitted
    Retained,
}

/// A newcomer waiting on the liveness check of the bucket head
#[derive(Debug, Clone)]
pub struct PendingProbe {
    head: Contact,
    candidate: Contact,
    state: ProbeState,
}

impl PendingProbe {
    fn new(head: Contact, candidate: Contact) -> Self {
        PendingProbe {
            head,
            candidate,
            state: ProbeState::Unknown,
        }
    }

    /// Least-recently-seen contact that must be pinged
    pub fn head(&self) -> &Contact {
        &self.head
    }

    pub fn candidate(&self) -> &Contact {
        &self.candidate
    }

    pub fn state(&self) -> ProbeState {
        self.state
    }

    /// Record that the ping has been sent
    pub fn mark_probed(&mut self) {
        if self.state == ProbeState::Unknown {
            self.state = ProbeState::Probed;
        }
    }
}

/// Result of offering a contact to a bucket
#[derive(Debug, Clone)]
pub enum Admission {
    /// Already present; moved to most-recently-seen
    Updated,
    /// Appended to a bucket with free space
    Inserted,
    /// Bucket full; the head must be probed before deciding
    NeedsProbe(PendingProbe),
}

/// A k-bucket for storing contacts at a specific distance
#[derive(Debug, Clone)]
pub struct KBucket {
    /// Bucket index (common prefix length with the local id)
    pub index: usize,

    /// Maximum number of contacts
    capacity: usize,

    /// Contacts, least-recently-seen first
    contacts: VecDeque<Contact>,

    /// Candidates turned away while the bucket was full
    replacement_cache: VecDeque<Contact>,

    /// Last time this bucket was updated
    pub last_updated: Instant,
}

impl KBucket {
    /// Create a new k-bucket
    pub fn new(index: usize, capacity: usize) -> Self {
        KBucket {
            index,
            capacity,
            contacts: VecDeque::with_capacity(capacity),
            replacement_cache: VecDeque::new(),
            last_updated: Instant::now(),
        }
    }

    pub fn len(&self) -> usize {
        self.contacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.contacts.len() >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Contacts, least-recently-seen first
    pub fn contacts(&self) -> &VecDeque<Contact> {
        &self.contacts
    }

    pub fn replacement_cache(&self) -> &VecDeque<Contact> {
        &self.replacement_cache
    }

    pub fn contains(&self, node_id: &NodeId) -> bool {
        self.position(node_id).is_some()
    }

    fn position(&self, node_id: &NodeId) -> Option<usize> {
        self.contacts.iter().position(|c| &c.node_id == node_id)
    }

    fn touch(&mut self) {
        self.last_updated = Instant::now();
    }

    fn check_bound(&self) {
        debug_assert!(
            self.contacts.len() <= self.capacity,
            "bucket {} holds {} contacts, capacity {}",
            self.index,
            self.contacts.len(),
            self.capacity
        );
    }

    /// Offer a contact that was just heard from
    pub fn offer(&mut self, contact: Contact) -> Admission {
        // Known contact: move to back (most recently seen)
        if let Some(pos) = self.position(&contact.node_id) {
            self.contacts.remove(pos);
            self.contacts.push_back(contact);
            self.touch();
            return Admission::Updated;
        }

        if !self.is_full() {
            self.contacts.push_back(contact);
            self.touch();
            self.check_bound();
            return Admission::Inserted;
        }

        match self.contacts.front() {
            Some(head) => Admission::NeedsProbe(PendingProbe::new(head.clone(), contact)),
            // Zero-capacity buckets never admit anything
            None => Admission::NeedsProbe(PendingProbe::new(contact.clone(), contact)),
        }
    }

    /// Apply the outcome of a liveness probe
    pub fn resolve(&mut self, mut probe: PendingProbe, head_alive: bool) -> ProbeState {
        probe.mark_probed();

        if head_alive {
            if let Some(pos) = self.position(&probe.head.node_id) {
                if let Some(head) = self.contacts.remove(pos) {
                    self.contacts.push_back(head);
                }
            }
            self.add_to_replacement_cache(probe.candidate);
            self.touch();
            return ProbeState::Retained;
        }

        if self.contains(&probe.candidate.node_id) {
            // Candidate got in through another path while we were probing
            self.remove(&probe.head.node_id);
            return ProbeState::Evicted;
        }

        let state = match self.position(&probe.head.node_id) {
            Some(pos) => {
                self.contacts.remove(pos);
                self.contacts.push_back(probe.candidate);
                ProbeState::Evicted
            }
            None if !self.is_full() => {
                self.contacts.push_back(probe.candidate);
                ProbeState::Evicted
            }
            None => {
                self.add_to_replacement_cache(probe.candidate);
                ProbeState::Retained
            }
        };

        self.touch();
        self.check_bound();
        state
    }

    /// Add node to replacement cache
    fn add_to_replacement_cache(&mut self, contact: Contact) {
        if self.contains(&contact.node_id) {
            return;
        }

        if let Some(pos) = self
            .replacement_cache
            .iter()
            .position(|c| c.node_id == contact.node_id)
        {
            self.replacement_cache.remove(pos);
        }

        self.replacement_cache.push_back(contact);

        if self.replacement_cache.len() > self.capacity {
            self.replacement_cache.pop_front();
        }
    }

    /// Remove a contact, refilling from the replacement cache
    pub fn remove(&mut self, node_id: &NodeId) -> Option<Contact> {
        let pos = self.position(node_id)?;
        let removed = self.contacts.remove(pos);

        if let Some(replacement) = self.replacement_cache.pop_back() {
            self.contacts.push_back(replacement);
        }

        self.check_bound();
        removed
    }
}
