//! Two-node scenarios over the simulated transport.

use core_types::ApiError;
use tests_fabric::{connect_pair, connect_pair_with_transports, new_broker, new_normal};

#[test]
fn test_remote_echo() {
    let broker = new_broker();
    let normal = new_normal();
    let (mut bp, mut np) = connect_pair(&broker, &normal, 1);
    let b = bp.remove(0);
    let n = np.remove(0);

    b.put(b"ping", Vec::new()).unwrap();
    assert_eq!(n.get().unwrap().0, b"ping");
    n.put(b"pong", Vec::new()).unwrap();
    assert_eq!(b.get().unwrap().0, b"pong");
}

#[test]
fn test_parcels_put_before_handshake_completes() {
    // Parcels put on an initial portal before the link exists must queue
    // and flow once the handshake finishes.
    let broker = new_broker();
    let normal = new_normal();

    let (t0, t1) = sim_driver::SimDriver::create_sim_transport_pair();
    let mut bp = broker
        .connect_node(t0, fabric::ConnectMode::BrokerToNonBroker, 1)
        .unwrap();
    let b = bp.remove(0);
    b.put(b"early", Vec::new()).unwrap();

    let mut np = normal
        .connect_node(t1, fabric::ConnectMode::NonBrokerToBroker, 1)
        .unwrap();
    let n = np.remove(0);
    assert_eq!(n.get().unwrap().0, b"early");
}

#[test]
fn test_remote_ordering_with_many_parcels() {
    let broker = new_broker();
    let normal = new_normal();
    let (mut bp, mut np) = connect_pair(&broker, &normal, 1);
    let b = bp.remove(0);
    let n = np.remove(0);

    for i in 0..200u16 {
        b.put(&i.to_le_bytes(), Vec::new()).unwrap();
    }
    for i in 0..200u16 {
        assert_eq!(n.get().unwrap().0, i.to_le_bytes());
    }
}

#[test]
fn test_closure_propagates_across_link() {
    let broker = new_broker();
    let normal = new_normal();
    let (mut bp, mut np) = connect_pair(&broker, &normal, 1);
    let b = bp.remove(0);
    let n = np.remove(0);

    b.put(b"final", Vec::new()).unwrap();
    b.close();

    assert!(n.query_status().peer_closed());
    assert!(!n.query_status().is_dead());
    assert_eq!(n.get().unwrap().0, b"final");
    assert!(n.query_status().is_dead());
    assert!(matches!(n.get(), Err(ApiError::NotFound)));
}

#[test]
fn test_unequal_connect_counts() {
    let broker = new_broker();
    let normal = new_normal();

    let (t0, t1) = sim_driver::SimDriver::create_sim_transport_pair();
    let mut bp = broker
        .connect_node(t0, fabric::ConnectMode::BrokerToNonBroker, 2)
        .unwrap();
    let mut np = normal
        .connect_node(t1, fabric::ConnectMode::NonBrokerToBroker, 1)
        .unwrap();

    let excess = bp.remove(1);
    assert!(excess.query_status().peer_closed());
    assert!(excess.query_status().is_dead());

    let b = bp.remove(0);
    let n = np.remove(0);
    b.put(b"still fine", Vec::new()).unwrap();
    assert_eq!(n.get().unwrap().0, b"still fine");
}

#[test]
fn test_transport_failure_isolates_as_peer_closure() {
    let broker = new_broker();
    let normal = new_normal();
    let (mut bp, mut np, _t0, t1) = connect_pair_with_transports(&broker, &normal, 1);
    let b = bp.remove(0);
    let n = np.remove(0);

    b.put(b"delivered", Vec::new()).unwrap();
    assert_eq!(b.query_status().flags.bits(), 0);

    // Break the normal side's transport. Its portal must observe peer
    // closure at the last received sequence number instead of hanging.
    t1.inject_error();
    assert!(n.query_status().peer_closed());
    assert_eq!(n.get().unwrap().0, b"delivered");
    assert!(matches!(n.get(), Err(ApiError::NotFound)));
}
