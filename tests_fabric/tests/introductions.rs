//! Broker introductions and indirect connections.

use fabric::{ConnectMode, PortalObject};
use sim_driver::SimDriver;
use tests_fabric::{connect_pair, new_broker, new_normal, three_nodes};

#[test]
fn test_introduced_nodes_route_directly() {
    // Covered in more depth by the bypass tests; here we only check that
    // an introduction yields a working direct route between two
    // non-brokers.
    let nodes = three_nodes();
    let (to_first_tx, to_first_rx) = nodes.to_first;
    let (to_second_tx, to_second_rx) = nodes.to_second;

    let (a, b) = nodes.broker.open_portals();
    to_first_tx.put(b"", vec![PortalObject::Portal(a)]).unwrap();
    to_second_tx.put(b"", vec![PortalObject::Portal(b)]).unwrap();

    let a1 = to_first_rx.get().unwrap().1.remove(0).into_portal().unwrap();
    let b2 = to_second_rx.get().unwrap().1.remove(0).into_portal().unwrap();

    // Whatever proxies remain decay toward a direct first<->second link;
    // traffic must flow correctly throughout.
    for i in 0..16u8 {
        a1.put(&[i], Vec::new()).unwrap();
        b2.put(&[0x80 | i], Vec::new()).unwrap();
    }
    for i in 0..16u8 {
        assert_eq!(b2.get().unwrap().0, vec![i]);
        assert_eq!(a1.get().unwrap().0, vec![0x80 | i]);
    }
}

#[test]
fn test_share_broker_connects_two_non_brokers() {
    let broker = new_broker();
    let sharer = new_normal();
    let (_bp, _sp) = connect_pair(&broker, &sharer, 0);

    let newcomer = new_normal();
    let (t0, t1) = SimDriver::create_sim_transport_pair();

    let mut sharer_portals = sharer
        .connect_node(t0, ConnectMode::ShareBroker, 1)
        .unwrap();
    let mut newcomer_portals = newcomer
        .connect_node(t1, ConnectMode::InheritBroker, 1)
        .unwrap();

    let s = sharer_portals.remove(0);
    let n = newcomer_portals.remove(0);

    s.put(b"welcome", Vec::new()).unwrap();
    assert_eq!(n.get().unwrap().0, b"welcome");
    n.put(b"thanks", Vec::new()).unwrap();
    assert_eq!(s.get().unwrap().0, b"thanks");

    // The newcomer inherited the sharer's broker and can now be
    // introduced to other nodes through it.
    assert!(newcomer.assigned_name().is_valid());
}

#[test]
fn test_share_broker_without_broker_fails() {
    let isolated = new_normal();
    let other = new_normal();
    let (t0, t1) = SimDriver::create_sim_transport_pair();

    let result = isolated.connect_node(t0, ConnectMode::ShareBroker, 1);
    assert!(result.is_err());
    drop((t1, other));
}

#[test]
fn test_node_shutdown_closes_remote_routes() {
    let broker = new_broker();
    let normal = new_normal();
    let (mut bp, mut np) = connect_pair(&broker, &normal, 1);
    let b = bp.remove(0);
    let n = np.remove(0);

    b.put(b"parting", Vec::new()).unwrap();
    broker.shutdown();

    assert!(n.query_status().peer_closed());
    assert_eq!(n.get().unwrap().0, b"parting");
    assert!(n.query_status().is_dead());
}
