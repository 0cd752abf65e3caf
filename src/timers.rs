//! Timer Registry (C6): tracks `setTimeout`/`setInterval` handles for a
//! single cell run so the execution loop can wait for quiescence and
//! guarantee no timer outlives the cell. Pure bookkeeping; independent of
//! v8 so it can be exercised directly in tests. `sandbox.rs` wires the
//! actual `setTimeout`/`clearTimeout`/`setInterval`/`clearInterval` v8
//! bindings against an instance of this registry.

use std::collections::HashSet;
use std::time::{Duration, Instant};

struct TimerEntry<C> {
    id: u32,
    fire_at: Instant,
    delay: Duration,
    repeat: bool,
    callback: C,
}

/// One fired timer, handed back to the caller so it can invoke the actual
/// v8 callback (which this module knows nothing about).
pub struct Fired<C> {
    pub id: u32,
    pub callback: C,
}

/// Per-cell-run bookkeeping for outstanding timers. `C` is whatever payload
/// the embedder wants to associate with a handle (in `sandbox.rs`, a v8
/// global function plus its bound arguments).
pub struct TimerRegistry<C> {
    entries: Vec<TimerEntry<C>>,
    pending_timeouts: HashSet<u32>,
    pending_intervals: HashSet<u32>,
    pending_interval_first_tick: HashSet<u32>,
    timeout_waiters: Vec<Box<dyn FnOnce() + 'static>>,
    interval_waiters: Vec<Box<dyn FnOnce() + 'static>>,
    interval_done_waiters: Vec<Box<dyn FnOnce() + 'static>>,
    next_id: u32,
}

impl<C> Default for TimerRegistry<C> {
    fn default() -> Self {
        TimerRegistry {
            entries: Vec::new(),
            pending_timeouts: HashSet::new(),
            pending_intervals: HashSet::new(),
            pending_interval_first_tick: HashSet::new(),
            timeout_waiters: Vec::new(),
            interval_waiters: Vec::new(),
            interval_done_waiters: Vec::new(),
            next_id: 1,
        }
    }
}

impl<C> TimerRegistry<C> {
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// `setTimeout`: schedules a one-shot handle, returning its id.
    pub fn set_timeout(&mut self, delay: Duration, callback: C) -> u32 {
        let id = self.allocate_id();
        self.entries.push(TimerEntry {
            id,
            fire_at: Instant::now() + delay,
            delay,
            repeat: false,
            callback,
        });
        self.pending_timeouts.insert(id);
        id
    }

    /// `setInterval`: schedules a repeating handle, registered in both
    /// `pendingIntervals` and `pendingIntervalFirstTick` until it fires once.
    pub fn set_interval(&mut self, delay: Duration, callback: C) -> u32 {
        let id = self.allocate_id();
        self.entries.push(TimerEntry {
            id,
            fire_at: Instant::now() + delay,
            delay,
            repeat: true,
            callback,
        });
        self.pending_intervals.insert(id);
        self.pending_interval_first_tick.insert(id);
        id
    }

    /// `clearTimeout`: removes a one-shot (or already-fired interval) handle.
    pub fn clear_timeout(&mut self, id: u32) {
        self.entries.retain(|e| e.id != id);
        self.pending_timeouts.remove(&id);
        self.maybe_drain_timeout_waiters();
    }

    /// `clearInterval`: removes a recurring handle and resolves
    /// "intervals done" waiters if that was the last one outstanding.
    pub fn clear_interval(&mut self, id: u32) {
        self.entries.retain(|e| e.id != id);
        self.pending_intervals.remove(&id);
        self.pending_interval_first_tick.remove(&id);
        self.maybe_drain_interval_waiters();
        self.maybe_drain_interval_done_waiters();
    }

    /// Registers a one-shot callback fired the moment `pendingTimeouts`
    /// next becomes empty (immediately, if already empty).
    pub fn on_timeouts_drained(&mut self, waiter: impl FnOnce() + 'static) {
        if self.pending_timeouts.is_empty() {
            waiter();
        } else {
            self.timeout_waiters.push(Box::new(waiter));
        }
    }

    /// Registers a one-shot callback fired once every interval has ticked
    /// at least once.
    pub fn on_intervals_ticked(&mut self, waiter: impl FnOnce() + 'static) {
        if self.pending_interval_first_tick.is_empty() {
            waiter();
        } else {
            self.interval_waiters.push(Box::new(waiter));
        }
    }

    /// Registers a one-shot callback fired once every interval has been
    /// cleared.
    pub fn on_intervals_cleared(&mut self, waiter: impl FnOnce() + 'static) {
        if self.pending_intervals.is_empty() {
            waiter();
        } else {
            self.interval_done_waiters.push(Box::new(waiter));
        }
    }

    fn maybe_drain_timeout_waiters(&mut self) {
        if self.pending_timeouts.is_empty() {
            for waiter in self.timeout_waiters.drain(..) {
                waiter();
            }
        }
    }

    fn maybe_drain_interval_waiters(&mut self) {
        if self.pending_interval_first_tick.is_empty() {
            for waiter in self.interval_waiters.drain(..) {
                waiter();
            }
        }
    }

    fn maybe_drain_interval_done_waiters(&mut self) {
        if self.pending_intervals.is_empty() {
            for waiter in self.interval_done_waiters.drain(..) {
                waiter();
            }
        }
    }

    /// The earliest upcoming fire time, used by the execution loop to avoid
    /// busy-polling.
    pub fn next_fire_time(&self) -> Option<Instant> {
        self.entries.iter().map(|e| e.fire_at).min()
    }

    pub fn pending_timeouts_empty(&self) -> bool {
        self.pending_timeouts.is_empty()
    }

    pub fn intervals_ticked(&self) -> bool {
        self.pending_interval_first_tick.is_empty()
    }

    pub fn intervals_cleared(&self) -> bool {
        self.pending_intervals.is_empty()
    }

    /// Pops every entry due at or before `now`. One-shot timeouts are
    /// removed outright; intervals are rescheduled and (on their first
    /// fire) migrated out of `pendingIntervalFirstTick`. `C` must be
    /// `Clone` because an interval's callback is retained for its next
    /// tick while also being handed to the caller to invoke now.
    pub fn poll_ready(&mut self, now: Instant) -> Vec<Fired<C>>
    where
        C: Clone,
    {
        let mut fired = Vec::new();
        let mut idx = 0;
        while idx < self.entries.len() {
            if self.entries[idx].fire_at > now {
                idx += 1;
                continue;
            }
            let entry = self.entries.remove(idx);
            fired.push(Fired {
                id: entry.id,
                callback: entry.callback.clone(),
            });

            if entry.repeat {
                if self.pending_interval_first_tick.remove(&entry.id) {
                    self.maybe_drain_interval_waiters();
                }
                // Still registered (not cleared mid-fire); reschedule.
                if self.pending_intervals.contains(&entry.id) {
                    self.entries.push(TimerEntry {
                        id: entry.id,
                        fire_at: now + entry.delay,
                        delay: entry.delay,
                        repeat: true,
                        callback: entry.callback,
                    });
                }
            } else {
                self.pending_timeouts.remove(&entry.id);
                self.maybe_drain_timeout_waiters();
            }
        }
        fired
    }

    /// Cancels every outstanding handle and resets bookkeeping, per the
    /// execution loop's finalization step.
    pub fn clear_all(&mut self) {
        self.entries.clear();
        self.pending_timeouts.clear();
        self.pending_intervals.clear();
        self.pending_interval_first_tick.clear();
        self.timeout_waiters.clear();
        self.interval_waiters.clear();
        self.interval_done_waiters.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn set_timeout_tracks_pending_and_clears_on_fire() {
        let mut registry: TimerRegistry<u32> = TimerRegistry::new();
        let id = registry.set_timeout(Duration::from_millis(0), 42);
        assert!(!registry.pending_timeouts_empty());

        let fired = registry.poll_ready(Instant::now() + Duration::from_millis(1));
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].id, id);
        assert!(registry.pending_timeouts_empty());
    }

    #[test]
    fn clear_timeout_removes_before_it_fires() {
        let mut registry: TimerRegistry<u32> = TimerRegistry::new();
        let id = registry.set_timeout(Duration::from_secs(10), 1);
        registry.clear_timeout(id);
        assert!(registry.pending_timeouts_empty());
        let fired = registry.poll_ready(Instant::now() + Duration::from_secs(20));
        assert!(fired.is_empty());
    }

    #[test]
    fn interval_migrates_from_first_tick_to_steady_state() {
        let mut registry: TimerRegistry<u32> = TimerRegistry::new();
        registry.set_interval(Duration::from_millis(0), 7);
        assert!(!registry.intervals_ticked());
        assert!(!registry.intervals_cleared());

        registry.poll_ready(Instant::now() + Duration::from_millis(1));
        assert!(registry.intervals_ticked());
        assert!(!registry.intervals_cleared());
    }

    #[test]
    fn clear_interval_drains_done_waiters() {
        let mut registry: TimerRegistry<u32> = TimerRegistry::new();
        let id = registry.set_interval(Duration::from_millis(0), 1);
        let done = Rc::new(RefCell::new(false));
        let done_clone = done.clone();
        registry.on_intervals_cleared(move || {
            *done_clone.borrow_mut() = true;
        });
        assert!(!*done.borrow());

        registry.clear_interval(id);
        assert!(*done.borrow());
    }

    #[test]
    fn waiter_fires_immediately_when_already_empty() {
        let mut registry: TimerRegistry<u32> = TimerRegistry::new();
        let fired = Rc::new(RefCell::new(false));
        let fired_clone = fired.clone();
        registry.on_timeouts_drained(move || {
            *fired_clone.borrow_mut() = true;
        });
        assert!(*fired.borrow());
    }

    #[test]
    fn clear_all_resets_every_set() {
        let mut registry: TimerRegistry<u32> = TimerRegistry::new();
        registry.set_timeout(Duration::from_secs(5), 1);
        registry.set_interval(Duration::from_secs(5), 2);
        registry.clear_all();
        assert!(registry.pending_timeouts_empty());
        assert!(registry.intervals_ticked());
        assert!(registry.intervals_cleared());
        assert!(registry.next_fire_time().is_none());
    }
}
