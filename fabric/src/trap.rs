//! Armed one-shot observers of portal status.

use core_types::{PortalStatus, TrapConditionFlags, TrapConditions, TrapEvent};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;

/// Why a trap is being shown a status snapshot; distinguishes the
/// edge-triggered new-parcel condition from level-triggered ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateReason {
    NewLocalParcel,
    LocalParcelConsumed,
    StatusQuery,
    RouteClosed,
}

pub type TrapHandler = Box<dyn Fn(&TrapEvent) + Send + Sync>;

/// Failure to arm a trap.
#[derive(Debug)]
pub enum ArmError {
    /// One or more observed conditions are already met; the trap would fire
    /// immediately. Carries the satisfied flags and the status snapshot.
    AlreadySatisfied {
        satisfied: TrapConditionFlags,
        status: PortalStatus,
    },
    /// The trap is already armed.
    AlreadyArmed,
    /// The trap has been destroyed.
    Destroyed,
}

struct TrapState {
    enabled: bool,
    armed: bool,
    dispatches_in_flight: usize,
}

/// Watches one portal for a condition set and invokes a fixed handler when
/// armed conditions become met. Arming fails while conditions are already
/// satisfied; each firing disarms the trap.
pub struct Trap {
    conditions: TrapConditions,
    handler: TrapHandler,
    context: u64,
    state: Mutex<TrapState>,
    idle: Condvar,
}

impl Trap {
    pub fn new(conditions: TrapConditions, handler: TrapHandler, context: u64) -> Arc<Trap> {
        Arc::new(Trap {
            conditions,
            handler,
            context,
            state: Mutex::new(TrapState {
                enabled: true,
                armed: false,
                dispatches_in_flight: 0,
            }),
            idle: Condvar::new(),
        })
    }

    /// Attempts to arm against the given status snapshot. The caller holds
    /// the owning router's lock, keeping the snapshot stable.
    pub(crate) fn arm_with_status(&self, status: &PortalStatus) -> Result<(), ArmError> {
        let mut state = self.state.lock();
        if !state.enabled {
            return Err(ArmError::Destroyed);
        }
        if state.armed {
            return Err(ArmError::AlreadyArmed);
        }
        let satisfied = self.event_flags(status, UpdateReason::StatusQuery);
        if !satisfied.is_empty() {
            return Err(ArmError::AlreadySatisfied {
                satisfied,
                status: *status,
            });
        }
        state.armed = true;
        Ok(())
    }

    /// Permanently disables the trap. With `blocking`, waits until every
    /// in-flight handler invocation has returned.
    pub fn destroy(&self, blocking: bool) {
        let mut state = self.state.lock();
        state.enabled = false;
        state.armed = false;
        if blocking {
            while state.dispatches_in_flight > 0 {
                self.idle.wait(&mut state);
            }
        }
    }

    /// Shows the trap a fresh status. If armed conditions are met, the trap
    /// disarms and queues an event on `dispatcher`.
    pub(crate) fn update_status(
        this: &Arc<Self>,
        status: &PortalStatus,
        reason: UpdateReason,
        dispatcher: &mut TrapEventDispatcher,
    ) {
        let mut state = this.state.lock();
        if !state.enabled || !state.armed {
            return;
        }
        let flags = this.event_flags(status, reason);
        if flags.is_empty() {
            return;
        }
        state.armed = false;
        dispatcher.defer(
            this.clone(),
            TrapEvent {
                context: this.context,
                condition_flags: flags,
                status: *status,
            },
        );
    }

    fn event_flags(&self, status: &PortalStatus, reason: UpdateReason) -> TrapConditionFlags {
        let watched = self.conditions.flags;
        let mut flags = TrapConditionFlags::NONE;
        if watched.contains(TrapConditionFlags::PEER_CLOSED) && status.peer_closed() {
            flags.insert(TrapConditionFlags::PEER_CLOSED);
        }
        if watched.contains(TrapConditionFlags::DEAD) && status.is_dead() {
            flags.insert(TrapConditionFlags::DEAD);
        }
        if watched.contains(TrapConditionFlags::ABOVE_MIN_LOCAL_PARCELS)
            && status.num_local_parcels >= self.conditions.min_local_parcels
        {
            flags.insert(TrapConditionFlags::ABOVE_MIN_LOCAL_PARCELS);
        }
        if watched.contains(TrapConditionFlags::ABOVE_MIN_LOCAL_BYTES)
            && status.num_local_bytes >= self.conditions.min_local_bytes
        {
            flags.insert(TrapConditionFlags::ABOVE_MIN_LOCAL_BYTES);
        }
        if watched.contains(TrapConditionFlags::BELOW_MAX_REMOTE_PARCELS)
            && status.num_remote_parcels < self.conditions.max_remote_parcels
        {
            flags.insert(TrapConditionFlags::BELOW_MAX_REMOTE_PARCELS);
        }
        if watched.contains(TrapConditionFlags::BELOW_MAX_REMOTE_BYTES)
            && status.num_remote_bytes < self.conditions.max_remote_bytes
        {
            flags.insert(TrapConditionFlags::BELOW_MAX_REMOTE_BYTES);
        }
        if reason == UpdateReason::NewLocalParcel
            && watched.contains(TrapConditionFlags::NEW_LOCAL_PARCEL)
        {
            flags.insert(TrapConditionFlags::NEW_LOCAL_PARCEL);
        }
        flags
    }

    fn dispatch(&self, event: &TrapEvent) {
        {
            let mut state = self.state.lock();
            if !state.enabled {
                return;
            }
            state.dispatches_in_flight += 1;
        }

        (self.handler)(event);

        let mut state = self.state.lock();
        state.dispatches_in_flight -= 1;
        if state.dispatches_in_flight == 0 {
            self.idle.notify_all();
        }
    }
}

/// The traps installed on one portal.
#[derive(Default)]
pub struct TrapSet {
    traps: Vec<Arc<Trap>>,
}

impl TrapSet {
    pub fn add(&mut self, trap: Arc<Trap>) {
        self.traps.retain(|t| !Arc::ptr_eq(t, &trap));
        self.traps.push(trap);
    }

    pub fn remove(&mut self, trap: &Arc<Trap>) {
        self.traps.retain(|t| !Arc::ptr_eq(t, trap));
    }

    pub fn update_status(
        &mut self,
        status: &PortalStatus,
        reason: UpdateReason,
        dispatcher: &mut TrapEventDispatcher,
    ) {
        for trap in &self.traps {
            Trap::update_status(trap, status, reason, dispatcher);
        }
    }

    /// Disables and drops every trap, e.g. when the portal closes.
    pub fn remove_all(&mut self) {
        for trap in self.traps.drain(..) {
            trap.destroy(false);
        }
    }
}

/// Collects trap events under a router's lock and fires them after the lock
/// is released. Callers allocate one per mutating operation; events fire on
/// drop at the latest.
#[derive(Default)]
pub struct TrapEventDispatcher {
    events: Vec<(Arc<Trap>, TrapEvent)>,
}

impl TrapEventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    fn defer(&mut self, trap: Arc<Trap>, event: TrapEvent) {
        self.events.push((trap, event));
    }

    pub fn dispatch_all(&mut self) {
        for (trap, event) in self.events.drain(..) {
            trap.dispatch(&event);
        }
    }
}

impl Drop for TrapEventDispatcher {
    fn drop(&mut self) {
        self.dispatch_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_trap(conditions: TrapConditions) -> (Arc<Trap>, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        let trap = Trap::new(
            conditions,
            Box::new(move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
            }),
            0,
        );
        (trap, count)
    }

    fn parcel_conditions() -> TrapConditions {
        TrapConditions {
            flags: TrapConditionFlags::ABOVE_MIN_LOCAL_PARCELS,
            min_local_parcels: 1,
            ..Default::default()
        }
    }

    #[test]
    fn test_trap_fires_once_per_arming() {
        let (trap, count) = counting_trap(parcel_conditions());
        let empty = PortalStatus::default();
        let one = PortalStatus {
            num_local_parcels: 1,
            ..Default::default()
        };

        trap.arm_with_status(&empty).unwrap();
        let mut dispatcher = TrapEventDispatcher::new();
        Trap::update_status(&trap, &one, UpdateReason::NewLocalParcel, &mut dispatcher);
        Trap::update_status(&trap, &one, UpdateReason::NewLocalParcel, &mut dispatcher);
        dispatcher.dispatch_all();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_arm_fails_when_satisfied() {
        let (trap, _count) = counting_trap(parcel_conditions());
        let one = PortalStatus {
            num_local_parcels: 1,
            ..Default::default()
        };
        match trap.arm_with_status(&one) {
            Err(ArmError::AlreadySatisfied { satisfied, status }) => {
                assert!(satisfied.contains(TrapConditionFlags::ABOVE_MIN_LOCAL_PARCELS));
                assert_eq!(status.num_local_parcels, 1);
            }
            other => panic!("expected AlreadySatisfied, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_destroyed_trap_never_fires() {
        let (trap, count) = counting_trap(parcel_conditions());
        trap.arm_with_status(&PortalStatus::default()).unwrap();
        trap.destroy(false);
        let one = PortalStatus {
            num_local_parcels: 1,
            ..Default::default()
        };
        let mut dispatcher = TrapEventDispatcher::new();
        Trap::update_status(&trap, &one, UpdateReason::NewLocalParcel, &mut dispatcher);
        dispatcher.dispatch_all();
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_blocking_destroy_waits_for_dispatch() {
        let started = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicUsize::new(0));
        let trap = {
            let started = started.clone();
            let finished = finished.clone();
            Trap::new(
                TrapConditions {
                    flags: TrapConditionFlags::ABOVE_MIN_LOCAL_PARCELS,
                    min_local_parcels: 1,
                    ..Default::default()
                },
                Box::new(move |_| {
                    started.store(1, Ordering::SeqCst);
                    std::thread::sleep(std::time::Duration::from_millis(10));
                    finished.store(1, Ordering::SeqCst);
                }),
                0,
            )
        };
        trap.arm_with_status(&PortalStatus::default()).unwrap();

        let mut dispatcher = TrapEventDispatcher::new();
        let one = PortalStatus {
            num_local_parcels: 1,
            ..Default::default()
        };
        Trap::update_status(&trap, &one, UpdateReason::NewLocalParcel, &mut dispatcher);

        let worker = std::thread::spawn(move || {
            drop(dispatcher);
        });
        // Wait for the handler to be observed running, then block on
        // destruction; it must only return after the handler completes.
        while started.load(Ordering::SeqCst) == 0 {
            std::thread::yield_now();
        }
        trap.destroy(true);
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        worker.join().unwrap();
    }
}
