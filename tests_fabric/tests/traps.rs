//! Trap arming, firing, and destruction scenarios.

use core_types::{TrapConditionFlags, TrapConditions};
use fabric::ArmError;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tests_fabric::new_broker;

fn local_parcel_conditions() -> TrapConditions {
    TrapConditions {
        flags: TrapConditionFlags::ABOVE_MIN_LOCAL_PARCELS,
        min_local_parcels: 1,
        ..Default::default()
    }
}

#[test]
fn test_trap_fires_then_rearms() {
    let node = new_broker();
    let (a, b) = node.open_portals();

    let fired = Arc::new(AtomicUsize::new(0));
    let observed = fired.clone();
    let trap = b.create_trap(
        local_parcel_conditions(),
        Box::new(move |event| {
            assert!(event
                .condition_flags
                .contains(TrapConditionFlags::ABOVE_MIN_LOCAL_PARCELS));
            observed.fetch_add(1, Ordering::SeqCst);
        }),
        7,
    );

    b.arm_trap(&trap).unwrap();
    a.put(b"x", Vec::new()).unwrap();
    assert_eq!(fired.load(Ordering::SeqCst), 1);

    // A second put without rearming must not fire.
    a.put(b"y", Vec::new()).unwrap();
    assert_eq!(fired.load(Ordering::SeqCst), 1);

    // Drain and rearm; the next put fires exactly once more.
    b.get().unwrap();
    b.get().unwrap();
    b.arm_trap(&trap).unwrap();
    a.put(b"z", Vec::new()).unwrap();
    assert_eq!(fired.load(Ordering::SeqCst), 2);
}

#[test]
fn test_arm_while_already_satisfied() {
    let node = new_broker();
    let (a, b) = node.open_portals();
    a.put(b"x", Vec::new()).unwrap();

    let trap = b.create_trap(local_parcel_conditions(), Box::new(|_| {}), 0);
    match b.arm_trap(&trap) {
        Err(ArmError::AlreadySatisfied { satisfied, status }) => {
            assert!(satisfied.contains(TrapConditionFlags::ABOVE_MIN_LOCAL_PARCELS));
            assert_eq!(status.num_local_parcels, 1);
        }
        other => panic!("expected AlreadySatisfied, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn test_peer_closed_trap() {
    let node = new_broker();
    let (a, b) = node.open_portals();

    let fired = Arc::new(AtomicUsize::new(0));
    let observed = fired.clone();
    let trap = b.create_trap(
        TrapConditions {
            flags: TrapConditionFlags::PEER_CLOSED | TrapConditionFlags::DEAD,
            ..Default::default()
        },
        Box::new(move |event| {
            assert!(event.condition_flags.contains(TrapConditionFlags::PEER_CLOSED));
            assert!(event.status.peer_closed());
            observed.fetch_add(1, Ordering::SeqCst);
        }),
        0,
    );
    b.arm_trap(&trap).unwrap();
    a.close();
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[test]
fn test_blocking_destroy_waits_for_handler() {
    let node = new_broker();
    let (a, b) = node.open_portals();

    let started = Arc::new(AtomicUsize::new(0));
    let finished = Arc::new(AtomicUsize::new(0));
    let trap = {
        let started = started.clone();
        let finished = finished.clone();
        b.create_trap(
            local_parcel_conditions(),
            Box::new(move |_| {
                started.store(1, Ordering::SeqCst);
                std::thread::sleep(std::time::Duration::from_millis(10));
                finished.store(1, Ordering::SeqCst);
            }),
            0,
        )
    };
    b.arm_trap(&trap).unwrap();

    // Fire the trap from a background thread; its handler runs there.
    let worker = {
        let a = a;
        std::thread::spawn(move || {
            a.put(b"x", Vec::new()).unwrap();
        })
    };

    while started.load(Ordering::SeqCst) == 0 {
        std::thread::yield_now();
    }
    // The handler is mid-flight; a blocking destroy must wait it out.
    b.destroy_trap(&trap, true);
    assert_eq!(finished.load(Ordering::SeqCst), 1);
    worker.join().unwrap();
}

#[test]
fn test_destroyed_trap_stops_firing() {
    let node = new_broker();
    let (a, b) = node.open_portals();

    let fired = Arc::new(AtomicUsize::new(0));
    let observed = fired.clone();
    let trap = b.create_trap(
        local_parcel_conditions(),
        Box::new(move |_| {
            observed.fetch_add(1, Ordering::SeqCst);
        }),
        0,
    );
    b.arm_trap(&trap).unwrap();
    b.destroy_trap(&trap, false);
    a.put(b"x", Vec::new()).unwrap();
    assert_eq!(fired.load(Ordering::SeqCst), 0);
}
