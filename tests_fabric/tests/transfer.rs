//! Portal transfer and proxy bypass scenarios.

use fabric::PortalObject;
use tests_fabric::{connect_pair, new_broker, new_normal, three_nodes};

#[test]
fn test_portal_transfer_preserves_stream() {
    // A portal pair is opened on one node; one end moves to another node
    // inside a parcel. Parcels sent before, during and after the move must
    // all arrive exactly once, in order.
    let broker = new_broker();
    let normal = new_normal();
    let (mut bp, mut np) = connect_pair(&broker, &normal, 1);
    let carrier_tx = bp.remove(0);
    let carrier_rx = np.remove(0);

    let (c, d) = broker.open_portals();
    c.put(b"before-1", Vec::new()).unwrap();
    c.put(b"before-2", Vec::new()).unwrap();

    carrier_tx
        .put(b"moving d", vec![PortalObject::Portal(d)])
        .unwrap();

    c.put(b"after-1", Vec::new()).unwrap();

    let (data, mut objects) = carrier_rx.get().unwrap();
    assert_eq!(data, b"moving d");
    assert_eq!(objects.len(), 1);
    let d_moved = objects.remove(0).into_portal().unwrap();

    c.put(b"after-2", Vec::new()).unwrap();

    for expected in [
        b"before-1".as_slice(),
        b"before-2".as_slice(),
        b"after-1".as_slice(),
        b"after-2".as_slice(),
    ] {
        assert_eq!(d_moved.get().unwrap().0, expected);
    }

    // The reverse direction crosses the reconfigured route too.
    d_moved.put(b"ok", Vec::new()).unwrap();
    assert_eq!(c.get().unwrap().0, b"ok");
}

#[test]
fn test_transfer_of_portal_with_queued_inbound_parcels() {
    let broker = new_broker();
    let normal = new_normal();
    let (mut bp, mut np) = connect_pair(&broker, &normal, 1);
    let carrier_tx = bp.remove(0);
    let carrier_rx = np.remove(0);

    let (c, d) = broker.open_portals();
    // These sit unread in d's queue when d moves.
    c.put(b"queued-1", Vec::new()).unwrap();
    c.put(b"queued-2", Vec::new()).unwrap();

    carrier_tx.put(b"", vec![PortalObject::Portal(d)]).unwrap();
    let (_, mut objects) = carrier_rx.get().unwrap();
    let d_moved = objects.remove(0).into_portal().unwrap();

    assert_eq!(d_moved.get().unwrap().0, b"queued-1");
    assert_eq!(d_moved.get().unwrap().0, b"queued-2");
}

#[test]
fn test_transfer_then_close_propagates() {
    let broker = new_broker();
    let normal = new_normal();
    let (mut bp, mut np) = connect_pair(&broker, &normal, 1);
    let carrier_tx = bp.remove(0);
    let carrier_rx = np.remove(0);

    let (c, d) = broker.open_portals();
    carrier_tx.put(b"", vec![PortalObject::Portal(d)]).unwrap();
    let (_, mut objects) = carrier_rx.get().unwrap();
    let d_moved = objects.remove(0).into_portal().unwrap();

    c.put(b"last", Vec::new()).unwrap();
    c.close();
    assert!(d_moved.query_status().peer_closed());
    assert_eq!(d_moved.get().unwrap().0, b"last");
    assert!(d_moved.query_status().is_dead());
}

#[test]
fn test_transfer_both_ends_separately() {
    // Move both ends of one route to the same remote node; the route must
    // keep working end to end.
    let broker = new_broker();
    let normal = new_normal();
    let (mut bp, mut np) = connect_pair(&broker, &normal, 2);
    let tx_a = bp.remove(1);
    let tx_b = bp.remove(0);
    let rx_a = np.remove(1);
    let rx_b = np.remove(0);

    let (c, d) = broker.open_portals();
    c.put(b"one", Vec::new()).unwrap();

    tx_a.put(b"", vec![PortalObject::Portal(d)]).unwrap();
    let d_moved = rx_a.get().unwrap().1.remove(0).into_portal().unwrap();

    tx_b.put(b"", vec![PortalObject::Portal(c)]).unwrap();
    let c_moved = rx_b.get().unwrap().1.remove(0).into_portal().unwrap();

    assert_eq!(d_moved.get().unwrap().0, b"one");
    c_moved.put(b"two", Vec::new()).unwrap();
    assert_eq!(d_moved.get().unwrap().0, b"two");
    d_moved.put(b"three", Vec::new()).unwrap();
    assert_eq!(c_moved.get().unwrap().0, b"three");
}

#[test]
fn test_three_node_bypass_via_introduction() {
    // A route between the broker and the first node gets its broker-side
    // end moved to the second node. Eliminating the broker-side proxy
    // requires the two non-brokers to be introduced and a direct link
    // established between them.
    let nodes = three_nodes();
    let (to_first_tx, to_first_rx) = nodes.to_first;
    let (to_second_tx, to_second_rx) = nodes.to_second;

    // Build a route with one end on the first node: open locally on the
    // broker and move one end over.
    let (a, b) = nodes.broker.open_portals();
    to_first_tx.put(b"", vec![PortalObject::Portal(b)]).unwrap();
    let b_on_first = to_first_rx.get().unwrap().1.remove(0).into_portal().unwrap();

    b_on_first.put(b"warm-up", Vec::new()).unwrap();
    assert_eq!(a.get().unwrap().0, b"warm-up");

    // Now move the other end to the second node. The proxy left on the
    // broker must be bypassed with a direct first<->second link.
    b_on_first.put(b"in-flight-1", Vec::new()).unwrap();
    to_second_tx.put(b"", vec![PortalObject::Portal(a)]).unwrap();
    b_on_first.put(b"in-flight-2", Vec::new()).unwrap();

    let a_on_second = to_second_rx
        .get()
        .unwrap()
        .1
        .remove(0)
        .into_portal()
        .unwrap();

    b_on_first.put(b"after-move", Vec::new()).unwrap();

    for expected in [
        b"in-flight-1".as_slice(),
        b"in-flight-2".as_slice(),
        b"after-move".as_slice(),
    ] {
        assert_eq!(a_on_second.get().unwrap().0, expected);
    }

    // Traffic flows the other way across the reconfigured route as well,
    // and continues to do so for many parcels.
    for i in 0..32u8 {
        a_on_second.put(&[i], Vec::new()).unwrap();
    }
    for i in 0..32u8 {
        assert_eq!(b_on_first.get().unwrap().0, vec![i]);
    }

    // Both ends still observe closure correctly after all reconfiguration.
    a_on_second.close();
    assert!(b_on_first.query_status().peer_closed());
}

#[test]
fn test_repeated_transfers_keep_ordering() {
    // Shuttle one end of a route back and forth between two nodes while
    // the stationary end keeps sending.
    let broker = new_broker();
    let normal = new_normal();
    let (mut bp, mut np) = connect_pair(&broker, &normal, 2);
    let to_normal = bp.remove(1);
    let to_broker_back = np.remove(1);
    let _spare_b = bp.remove(0);
    let _spare_n = np.remove(0);

    let (c, d) = broker.open_portals();
    let mut expectations = Vec::new();
    let mut counter = 0u8;
    let mut send = |c: &fabric::Portal, expectations: &mut Vec<u8>, counter: &mut u8| {
        c.put(&[*counter], Vec::new()).unwrap();
        expectations.push(*counter);
        *counter += 1;
    };

    send(&c, &mut expectations, &mut counter);

    // Broker -> normal.
    to_normal.put(b"", vec![PortalObject::Portal(d)]).unwrap();
    let d1 = to_broker_back.get().unwrap().1.remove(0).into_portal().unwrap();
    send(&c, &mut expectations, &mut counter);

    // Normal -> broker again.
    to_broker_back
        .put(b"", vec![PortalObject::Portal(d1)])
        .unwrap();
    let d2 = to_normal.get().unwrap().1.remove(0).into_portal().unwrap();
    send(&c, &mut expectations, &mut counter);

    for expected in expectations {
        assert_eq!(d2.get().unwrap().0, vec![expected]);
    }
    d2.put(b"done", Vec::new()).unwrap();
    assert_eq!(c.get().unwrap().0, b"done");
}
