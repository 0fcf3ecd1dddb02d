//! Bookkeeping for in-flight async transfers: which layers owe a completion signal to which
//! downstream consumer, and which parked runs are waiting on one of those signals.
//!
//! Everything here is plain data guarded by a single lock (`Engine`'s `async_state_lock`,
//! reentrant so a completion callback invoked while another async-state operation is in progress
//! on the same thread does not deadlock). The original keeps four separate dependency lists and
//! two separate waiter lists (split by upload vs. download); this merges each pair into one,
//! since resolution only ever keys off the producer's layer number, sequence number and
//! [`DependencyKind`], which already disambiguate everything the split lists did. Noted in
//! DESIGN.md.

use std::collections::{HashMap, HashSet};

use crate::dependency::{Dependency, DependencyKind, ExecutionState, WaitingState};

#[derive(Debug, Default)]
pub struct AsyncState {
    dependencies: Vec<Dependency>,
    /// Layer numbers with at least one outstanding early dependency, i.e. a consumer that must
    /// not run yet.
    blocked_layers: HashSet<i32>,
    /// Runs parked on a dependency that hasn't cleared yet.
    waiters: Vec<WaitingState>,
    /// producer layer number -> sequence it is currently mid-transfer for, if any. A producer
    /// with an entry here refuses a new dispatch until the caller explicitly frees it via
    /// [`AsyncState::free_producer`] — which happens once its late dependency clears for a
    /// producer that needs no further handshake, or only after a slower out-of-band step (the
    /// fence/swap protocol, for an upload producer) has also completed.
    active_producer: HashMap<i32, u64>,
    /// Runs that tried to dispatch a producer which was either still busy or had no free
    /// transfer slot, queued to retry once that producer frees up.
    retry: HashMap<i32, Vec<ExecutionState>>,
}

impl AsyncState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn producer_busy(&self, producer: i32) -> bool {
        self.active_producer.contains_key(&producer)
    }

    /// Record that `producer` has begun a transfer for `sequence_no`: it owes an early signal to
    /// unblock `first_consumer` once the data lands, and a late signal before it may be
    /// redispatched, released once `last_consumer` has actually run.
    pub fn register_dispatch(
        &mut self,
        producer: i32,
        sequence_no: u64,
        first_consumer: Option<i32>,
        last_consumer: Option<i32>,
    ) {
        self.active_producer.insert(producer, sequence_no);
        if let Some(first) = first_consumer {
            self.dependencies
                .push(Dependency::new(first, sequence_no, producer, DependencyKind::Early));
            self.blocked_layers.insert(first);
        }
        if let Some(last) = last_consumer {
            self.dependencies
                .push(Dependency::new(last, sequence_no, producer, DependencyKind::Late));
        }
    }

    /// Whether `layer_number` currently has an unresolved early dependency blocking it for
    /// `sequence_no`. Checked by the scheduler immediately before it would run that layer.
    pub fn is_blocked(&self, layer_number: i32, sequence_no: u64) -> bool {
        if !self.blocked_layers.contains(&layer_number) {
            return false;
        }
        self.dependencies
            .iter()
            .any(|d| d.kind == DependencyKind::Early && d.dependency == layer_number && d.sequence_no == sequence_no)
    }

    /// Park `state` (currently positioned at `layer_number`) until the early dependency blocking
    /// it clears.
    pub fn park(&mut self, layer_number: i32, state: ExecutionState) {
        let dependency = *self
            .dependencies
            .iter()
            .find(|d| d.kind == DependencyKind::Early && d.dependency == layer_number && d.sequence_no == state.sequence_no)
            .expect("park called without a matching registered dependency");
        self.waiters.push(WaitingState { dependency, state });
    }

    /// The producer's transfer for `sequence_no` has landed: clear its early dependency and
    /// release any runs parked on it. The late dependency (and `active_producer` entry) is left
    /// standing until [`AsyncState::notify_consumer_ran`] fires — unless the producer was
    /// dispatched with no last consumer at all (a terminal download with no downstream GPU
    /// reader), in which case landing is itself the only signal there ever is, and the producer
    /// is freed right here.
    pub fn resolve_transfer(&mut self, producer: i32, sequence_no: u64) -> Vec<ExecutionState> {
        let released = self.clear(producer, sequence_no, DependencyKind::Early);
        let has_late = self
            .dependencies
            .iter()
            .any(|d| d.provider == producer && d.sequence_no == sequence_no && d.kind == DependencyKind::Late);
        if !has_late && self.active_producer.get(&producer) == Some(&sequence_no) {
            self.active_producer.remove(&producer);
        }
        released
    }

    /// `consumer_number` just finished running for `sequence_no`: clear the late dependency it
    /// was gating. Returns the producer layer numbers thereby released from their late
    /// dependency, so the caller can run whatever unlock handshake each one needs. The producer
    /// stays busy (see [`AsyncState::active_producer`]) until the caller calls
    /// [`AsyncState::free_producer`] — this method does not free it itself, since for some
    /// producers (an upload going through the fence/swap protocol) that handshake is not yet
    /// complete just because the last consumer ran.
    pub fn notify_consumer_ran(&mut self, consumer_number: i32, sequence_no: u64) -> Vec<i32> {
        let mut freed = Vec::new();
        self.dependencies.retain_mut(|dep| {
            if dep.kind == DependencyKind::Late && dep.dependency == consumer_number && dep.sequence_no == sequence_no {
                freed.push(dep.provider);
                return false;
            }
            true
        });
        freed
    }

    /// Release `producer`'s busy slot for `sequence_no`, letting it be dispatched again. A
    /// no-op if `producer` is busy for a different sequence (stale call) or not busy at all.
    pub fn free_producer(&mut self, producer: i32, sequence_no: u64) {
        if self.active_producer.get(&producer) == Some(&sequence_no) {
            self.active_producer.remove(&producer);
        }
    }

    fn clear(&mut self, producer: i32, sequence_no: u64, kind: DependencyKind) -> Vec<ExecutionState> {
        let mut cleared = Vec::new();
        self.dependencies.retain_mut(|dep| {
            if dep.provider == producer && dep.sequence_no == sequence_no && dep.kind == kind {
                cleared.push((dep.dependency, dep.sequence_no));
                return false;
            }
            true
        });
        if kind == DependencyKind::Early {
            for (layer, seq) in &cleared {
                let still_blocked = self
                    .dependencies
                    .iter()
                    .any(|d| d.kind == DependencyKind::Early && d.dependency == *layer && d.sequence_no == *seq);
                if !still_blocked {
                    self.blocked_layers.remove(layer);
                }
            }
        }
        let mut released = Vec::new();
        self.waiters.retain(|w| {
            let hit = cleared
                .iter()
                .any(|(layer, seq)| w.dependency.dependency == *layer && w.dependency.sequence_no == *seq);
            if hit {
                released.push(w.state.clone());
            }
            !hit
        });
        released
    }

    /// Queue `state` to retry dispatching `producer` once it is no longer busy.
    pub fn push_retry(&mut self, producer: i32, state: ExecutionState) {
        self.retry.entry(producer).or_default().push(state);
    }

    /// Pop the oldest run waiting to retry `producer`, but only if it is currently free.
    pub fn take_retry_if_free(&mut self, producer: i32) -> Option<ExecutionState> {
        if self.active_producer.contains_key(&producer) {
            return None;
        }
        match self.retry.get_mut(&producer) {
            Some(queue) if !queue.is_empty() => Some(queue.remove(0)),
            _ => None,
        }
    }

    /// Number of dependencies, waiters and queued retries still outstanding; used by `finish()`
    /// to decide whether the engine has fully drained.
    pub fn outstanding(&self) -> usize {
        self.dependencies.len()
            + self.waiters.len()
            + self.active_producer.len()
            + self.retry.values().map(Vec::len).sum::<usize>()
    }
}
