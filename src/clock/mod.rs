//! Dependency-clock state for causal delivery
//!
//! Each process owns one `DependencyClock`: its logical time vector plus a
//! record of the last timestamp it sent to each peer. Receivers use the
//! piggybacked copy of that record to decide whether a message's causal
//! history has already been observed locally.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Identifier of a process within the fixed peer set, in `[0, N)`.
pub type ProcessId = usize;

/// A fixed-length vector of event counters, one component per process.
///
/// Components are monotonically non-decreasing over the owning process's
/// lifetime.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TimeVector(Vec<u64>);

impl TimeVector {
    /// An all-zero vector for a system of `len` processes.
    pub fn zeroed(len: usize) -> Self {
        Self(vec![0; len])
    }

    pub fn from_components(components: Vec<u64>) -> Self {
        Self(components)
    }

    /// Component for process `index` (0 if out of range).
    pub fn get(&self, index: ProcessId) -> u64 {
        self.0.get(index).copied().unwrap_or(0)
    }

    pub fn increment(&mut self, index: ProcessId) {
        if let Some(component) = self.0.get_mut(index) {
            *component += 1;
        }
    }

    /// Componentwise maximum of `self` and `other`, stored in `self`.
    pub fn merge_max(&mut self, other: &TimeVector) {
        for (ours, theirs) in self.0.iter_mut().zip(other.0.iter()) {
            if *theirs > *ours {
                *ours = *theirs;
            }
        }
    }

    /// True when every component of `self` is `<=` the matching component of
    /// `other`.
    pub fn dominated_by(&self, other: &TimeVector) -> bool {
        self.first_exceeding(other).is_none()
    }

    /// First component where `self` is strictly ahead of `other`, as
    /// `(index, ours, theirs)`.
    pub fn first_exceeding(&self, other: &TimeVector) -> Option<(ProcessId, u64, u64)> {
        self.0
            .iter()
            .zip(other.0.iter())
            .enumerate()
            .find(|(_, (ours, theirs))| ours > theirs)
            .map(|(index, (ours, theirs))| (index, *ours, *theirs))
    }

    pub fn as_slice(&self) -> &[u64] {
        &self.0
    }
}

impl fmt::Display for TimeVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, component) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{component}")?;
        }
        write!(f, "]")
    }
}

/// The last-sent stamps a process keeps about its peers: at most one record
/// per target, overwritten on re-send.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DependencySet {
    records: BTreeMap<ProcessId, TimeVector>,
}

impl DependencySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, target: ProcessId) -> Option<&TimeVector> {
        self.records.get(&target)
    }

    /// Insert-or-overwrite the record for `target`.
    pub fn upsert(&mut self, target: ProcessId, stamp: TimeVector) {
        self.records.insert(target, stamp);
    }

    /// Merge one record: componentwise max if `target` is already present,
    /// insert unchanged otherwise.
    pub fn merge_record(&mut self, target: ProcessId, stamp: &TimeVector) {
        match self.records.get_mut(&target) {
            Some(existing) => existing.merge_max(stamp),
            None => {
                self.records.insert(target, stamp.clone());
            }
        }
    }

    /// Merge every record of `other` into `self`.
    pub fn merge(&mut self, other: &DependencySet) {
        for (target, stamp) in &other.records {
            self.merge_record(*target, stamp);
        }
    }

    /// Copy of the set with the record for `target` removed.
    pub fn without(&self, target: ProcessId) -> DependencySet {
        let mut copy = self.clone();
        copy.records.remove(&target);
        copy
    }

    /// Keep only records for which `keep` returns true.
    pub fn retain(&mut self, mut keep: impl FnMut(ProcessId, &TimeVector) -> bool) {
        self.records.retain(|target, stamp| keep(*target, stamp));
    }

    pub fn iter(&self) -> impl Iterator<Item = (ProcessId, &TimeVector)> {
        self.records.iter().map(|(target, stamp)| (*target, stamp))
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl fmt::Display for DependencySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, (target, stamp)) in self.records.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "(P{target}, {stamp})")?;
        }
        write!(f, "]")
    }
}

/// Outcome of the delivery test for one inbound message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Deliverability {
    /// The piggybacked set carries no record targeting this process.
    NoDependency,
    /// A record for this process exists and every component is satisfied.
    Satisfied,
    /// Component `component` of the receiver-targeted record is ahead of the
    /// local clock: the message depends on history not yet observed.
    Missing {
        component: ProcessId,
        needed: u64,
        have: u64,
    },
}

impl Deliverability {
    pub fn is_deliverable(&self) -> bool {
        !matches!(self, Deliverability::Missing { .. })
    }
}

impl fmt::Display for Deliverability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Deliverability::NoDependency => write!(f, "no record for receiver"),
            Deliverability::Satisfied => write!(f, "all dependencies satisfied"),
            Deliverability::Missing {
                component,
                needed,
                have,
            } => write!(
                f,
                "missing dependency from P{component}: need {needed}, have {have}"
            ),
        }
    }
}

/// The causal state of one process: its time vector plus the last-sent
/// record per peer.
///
/// Holds no lock of its own. The owner must serialize every call through a
/// single exclusion domain together with whatever other state (buffers,
/// counters) the same operations touch.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DependencyClock {
    process_id: ProcessId,
    local_time: TimeVector,
    entries: DependencySet,
}

impl DependencyClock {
    pub fn new(process_id: ProcessId, num_processes: usize) -> Self {
        Self {
            process_id,
            local_time: TimeVector::zeroed(num_processes),
            entries: DependencySet::new(),
        }
    }

    pub fn process_id(&self) -> ProcessId {
        self.process_id
    }

    pub fn local_time(&self) -> &TimeVector {
        &self.local_time
    }

    pub fn entries(&self) -> &DependencySet {
        &self.entries
    }

    /// Stamp an outgoing message to `target`.
    ///
    /// Returns the timestamp to carry on the message and the dependency
    /// subset to piggyback (the local set minus the record for `target`).
    /// Also records `(target, tm)` locally and counts the send as a local
    /// event.
    pub fn prepare_to_send(&mut self, target: ProcessId) -> (TimeVector, DependencySet) {
        let tm = self.local_time.clone();
        let outgoing = self.entries.without(target);
        self.entries.upsert(target, tm.clone());
        self.local_time.increment(self.process_id);
        (tm, outgoing)
    }

    /// Test whether a message from `sender` can be delivered now.
    ///
    /// Read-only. The decision depends solely on the piggybacked record
    /// targeting this process: absent means nothing to wait for; present
    /// means every component of that stamp must already be covered by the
    /// local clock.
    pub fn can_deliver(
        &self,
        sender: ProcessId,
        tm: &TimeVector,
        piggybacked: &DependencySet,
    ) -> Deliverability {
        let Some(stamp) = piggybacked.get(self.process_id) else {
            log::trace!(
                "P{}: message from P{sender} (tm={tm}) carries no record for us",
                self.process_id
            );
            return Deliverability::NoDependency;
        };
        match stamp.first_exceeding(&self.local_time) {
            Some((component, needed, have)) => Deliverability::Missing {
                component,
                needed,
                have,
            },
            None => Deliverability::Satisfied,
        }
    }

    /// Fold a delivered message into the clock.
    ///
    /// Must only be called after `can_deliver` returned a deliverable
    /// verdict for the same message. Advances the local time to cover `tm`,
    /// counts the receipt on the sender's component, and merges the
    /// piggybacked records so transitively-known history keeps propagating.
    pub fn deliver(&mut self, sender: ProcessId, tm: &TimeVector, piggybacked: &DependencySet) {
        self.local_time.merge_max(tm);
        self.local_time.increment(sender);
        self.entries.merge(piggybacked);
    }

    /// Drop records the local clock has fully caught up with; they can no
    /// longer fail a delivery test.
    pub fn prune_entries(&mut self) {
        let local_time = self.local_time.clone();
        self.entries
            .retain(|_, stamp| !stamp.dominated_by(&local_time));
    }
}

impl fmt::Display for DependencyClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tP={}, V_P={}", self.local_time, self.entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tv(components: &[u64]) -> TimeVector {
        TimeVector::from_components(components.to_vec())
    }

    #[test]
    fn test_prepare_to_send_stamps_and_increments() {
        let mut clock = DependencyClock::new(0, 3);

        let (tm, outgoing) = clock.prepare_to_send(1);
        assert_eq!(tm, tv(&[0, 0, 0]));
        assert!(outgoing.is_empty());
        assert_eq!(clock.local_time(), &tv(&[1, 0, 0]));
        assert_eq!(clock.entries().get(1), Some(&tv(&[0, 0, 0])));

        // Re-sending to the same target overwrites the record.
        let (tm, _) = clock.prepare_to_send(1);
        assert_eq!(tm, tv(&[1, 0, 0]));
        assert_eq!(clock.entries().get(1), Some(&tv(&[1, 0, 0])));
        assert_eq!(clock.entries().len(), 1);
    }

    #[test]
    fn test_outgoing_subset_never_contains_target() {
        let mut clock = DependencyClock::new(0, 3);
        clock.prepare_to_send(1);
        clock.prepare_to_send(2);
        clock.prepare_to_send(1);

        let (_, outgoing) = clock.prepare_to_send(1);
        assert!(outgoing.get(1).is_none());
        assert!(outgoing.get(2).is_some());

        let (_, outgoing) = clock.prepare_to_send(2);
        assert!(outgoing.get(2).is_none());
        assert!(outgoing.get(1).is_some());
    }

    #[test]
    fn test_no_dependency_means_deliverable() {
        let clock = DependencyClock::new(1, 3);
        // Arbitrary tm and a record for a third process; nothing targets us.
        let mut piggybacked = DependencySet::new();
        piggybacked.upsert(2, tv(&[9, 9, 9]));

        let verdict = clock.can_deliver(0, &tv(&[7, 7, 7]), &piggybacked);
        assert_eq!(verdict, Deliverability::NoDependency);
        assert!(verdict.is_deliverable());
    }

    #[test]
    fn test_exact_threshold() {
        let mut clock = DependencyClock::new(1, 3);
        clock.local_time.merge_max(&tv(&[2, 0, 0]));

        // Equal on every component: deliverable.
        let mut piggybacked = DependencySet::new();
        piggybacked.upsert(1, tv(&[2, 0, 0]));
        assert_eq!(
            clock.can_deliver(0, &tv(&[2, 0, 0]), &piggybacked),
            Deliverability::Satisfied
        );

        // One component ahead: held, citing that component and both values.
        let mut piggybacked = DependencySet::new();
        piggybacked.upsert(1, tv(&[3, 0, 0]));
        let verdict = clock.can_deliver(0, &tv(&[3, 0, 0]), &piggybacked);
        assert_eq!(
            verdict,
            Deliverability::Missing {
                component: 0,
                needed: 3,
                have: 2
            }
        );
        assert!(!verdict.is_deliverable());
    }

    #[test]
    fn test_deliver_merges_and_counts_receipt() {
        let mut clock = DependencyClock::new(1, 3);
        clock.deliver(0, &tv(&[0, 0, 0]), &DependencySet::new());
        // max([0,0,0], tm) then +1 on the sender's component.
        assert_eq!(clock.local_time(), &tv(&[1, 0, 0]));

        clock.deliver(2, &tv(&[1, 0, 3]), &DependencySet::new());
        assert_eq!(clock.local_time(), &tv(&[1, 0, 4]));
    }

    #[test]
    fn test_merge_is_componentwise_max() {
        let mut clock = DependencyClock::new(1, 3);

        let mut first = DependencySet::new();
        first.upsert(2, tv(&[5, 0, 1]));
        clock.deliver(0, &tv(&[0, 0, 0]), &first);

        let mut second = DependencySet::new();
        second.upsert(2, tv(&[3, 4, 0]));
        clock.deliver(0, &tv(&[0, 0, 0]), &second);

        assert_eq!(clock.entries().get(2), Some(&tv(&[5, 4, 1])));
    }

    #[test]
    fn test_monotonicity_across_operations() {
        let mut clock = DependencyClock::new(0, 3);
        let mut previous = clock.local_time().clone();

        let mut step = |clock: &mut DependencyClock, previous: &mut TimeVector| {
            let current = clock.local_time().clone();
            assert!(previous.dominated_by(&current));
            *previous = current;
        };

        clock.prepare_to_send(1);
        step(&mut clock, &mut previous);
        clock.deliver(2, &tv(&[0, 0, 5]), &DependencySet::new());
        step(&mut clock, &mut previous);
        clock.prepare_to_send(2);
        step(&mut clock, &mut previous);
        clock.deliver(1, &tv(&[0, 2, 1]), &DependencySet::new());
        step(&mut clock, &mut previous);
    }

    #[test]
    fn test_prune_drops_only_dominated_records() {
        let mut clock = DependencyClock::new(0, 3);
        clock.local_time.merge_max(&tv(&[2, 2, 2]));

        clock.entries.upsert(1, tv(&[1, 2, 0]));
        clock.entries.upsert(2, tv(&[0, 3, 0]));

        clock.prune_entries();
        assert!(clock.entries().get(1).is_none());
        assert_eq!(clock.entries().get(2), Some(&tv(&[0, 3, 0])));
    }

    #[test]
    fn test_first_message_scenario() {
        // Process 0 sends its first message to process 1: empty piggyback,
        // tm = [0,0,0]; the receiver ends at exactly [1,0,0].
        let mut sender = DependencyClock::new(0, 3);
        let mut receiver = DependencyClock::new(1, 3);

        let (tm, piggybacked) = sender.prepare_to_send(1);
        assert_eq!(tm, tv(&[0, 0, 0]));
        assert!(piggybacked.is_empty());

        let verdict = receiver.can_deliver(0, &tm, &piggybacked);
        assert!(verdict.is_deliverable());
        receiver.deliver(0, &tm, &piggybacked);
        assert_eq!(receiver.local_time(), &tv(&[1, 0, 0]));
    }
}
