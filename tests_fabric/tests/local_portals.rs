//! Local portal pair scenarios.

use core_types::ApiError;
use driver_api::{CustomDriverObject, DriverObject};
use fabric::PortalObject;
use sim_driver::Blob;
use tests_fabric::new_broker;

#[test]
fn test_local_echo() {
    let node = new_broker();
    let (a, b) = node.open_portals();

    a.put(b"hello", Vec::new()).unwrap();
    let (data, objects) = b.get().unwrap();
    assert_eq!(data, b"hello");
    assert!(objects.is_empty());

    assert_eq!(b.query_status().flags.bits(), 0);
    a.close();
    assert!(b.query_status().peer_closed());
    assert!(b.query_status().is_dead());
}

#[test]
fn test_strict_fifo_per_direction() {
    let node = new_broker();
    let (a, b) = node.open_portals();

    for i in 0..50u8 {
        a.put(&[i], Vec::new()).unwrap();
        b.put(&[100 + i], Vec::new()).unwrap();
    }
    for i in 0..50u8 {
        assert_eq!(b.get().unwrap().0, vec![i]);
        assert_eq!(a.get().unwrap().0, vec![100 + i]);
    }
}

#[test]
fn test_get_error_taxonomy() {
    let node = new_broker();
    let (a, b) = node.open_portals();

    assert!(matches!(b.get(), Err(ApiError::Unavailable)));
    a.put(b"x", Vec::new()).unwrap();
    a.close();
    assert_eq!(b.get().unwrap().0, b"x");
    assert!(matches!(b.get(), Err(ApiError::NotFound)));
    assert!(matches!(b.put(b"y", Vec::new()), Err(ApiError::NotFound)));
}

#[test]
fn test_two_phase_get_partial_consumption() {
    let node = new_broker();
    let (a, b) = node.open_portals();
    a.put(b"abcdef", Vec::new()).unwrap();

    let view = b.begin_get().unwrap();
    assert_eq!(&*view.data(), b"abcdef");
    view.commit(4, 0).unwrap();

    // The same parcel remains at the head with its remaining bytes.
    let view = b.begin_get().unwrap();
    assert_eq!(&*view.data(), b"ef");
    view.commit(2, 0).unwrap();

    assert!(matches!(b.get(), Err(ApiError::Unavailable)));
}

#[test]
fn test_two_phase_get_abort_leaves_parcel() {
    let node = new_broker();
    let (a, b) = node.open_portals();
    a.put(b"keep", Vec::new()).unwrap();

    let view = b.begin_get().unwrap();
    view.abort();
    assert_eq!(b.get().unwrap().0, b"keep");
}

#[test]
fn test_only_one_two_phase_get_at_a_time() {
    let node = new_broker();
    let (a, b) = node.open_portals();
    a.put(b"x", Vec::new()).unwrap();

    let view = b.begin_get().unwrap();
    assert!(matches!(b.begin_get(), Err(ApiError::AlreadyExists)));
    assert!(matches!(b.get(), Err(ApiError::AlreadyExists)));
    drop(view);
    assert!(b.get().is_ok());
}

#[test]
fn test_two_phase_put() {
    let node = new_broker();
    let (a, b) = node.open_portals();

    let slot = a.begin_put(8).unwrap();
    slot.write(b"partial").unwrap();
    slot.commit(7, Vec::new()).unwrap();
    assert_eq!(b.get().unwrap().0, b"partial");

    let slot = a.begin_put(4).unwrap();
    assert!(matches!(a.begin_put(4), Err(ApiError::AlreadyExists)));
    slot.abort();
    let slot = a.begin_put(4).unwrap();
    slot.commit(0, Vec::new()).unwrap();
    assert_eq!(b.get().unwrap().0, b"");
}

#[test]
fn test_boxed_blob_travels_in_parcel() {
    let node = new_broker();
    let (a, b) = node.open_portals();

    let blob = DriverObject::Custom(Box::new(Blob::new(b"boxed".to_vec())));
    a.put(b"with box", vec![PortalObject::Box(blob)]).unwrap();

    let (data, mut objects) = b.get().unwrap();
    assert_eq!(data, b"with box");
    assert_eq!(objects.len(), 1);
    let object = objects.remove(0).into_box().unwrap();
    match object {
        DriverObject::Custom(custom) => {
            assert_eq!(custom.serialize().unwrap().data, b"boxed");
        }
        other => panic!("unexpected object {other:?}"),
    }
}

#[test]
fn test_cannot_send_portal_over_itself_or_peer() {
    let node = new_broker();
    let (a, b) = node.open_portals();

    // Sending b over a would send a portal across its own route. The
    // rejected attachment is consumed and closed like any dropped portal.
    let result = a.put(b"", vec![PortalObject::Portal(b)]);
    assert!(matches!(result, Err(ApiError::InvalidArgument)));
    assert!(a.query_status().peer_closed());
}

#[test]
fn test_unretrieved_portal_in_dropped_parcel_closes_route() {
    let node = new_broker();
    let (a, b) = node.open_portals();
    let (c, d) = node.open_portals();

    a.put(b"carrier", vec![PortalObject::Portal(d)]).unwrap();
    // b never retrieves the parcel. Dropping b discards it, and the portal
    // it carried must observe closure rather than hanging.
    drop(b);
    drop(a);
    assert!(c.query_status().peer_closed());
}

#[test]
fn test_closing_receiver_is_observed_by_sender() {
    let node = new_broker();
    let (a, b) = node.open_portals();
    b.close();
    assert!(a.query_status().peer_closed());
    assert!(matches!(a.put(b"x", Vec::new()), Err(ApiError::NotFound)));
    drop(node);
}
