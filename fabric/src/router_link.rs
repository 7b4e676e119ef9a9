//! Links between routers.

use crate::memory::{Fragment, RouterLinkState, LINK_STATE_BUFFER_SIZE};
use crate::node_link::NodeLink;
use crate::parcel::{Parcel, ParcelObject, PutLimits};
use crate::router::Router;
use crate::wire::{NodeMessage, WireObject};
use core_types::{LinkSide, LinkType, NodeName, SequenceNumber, SublinkId};
use driver_api::DriverObject;
use log::{debug, warn};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU8, Ordering};
use std::sync::Arc;

/// One endpoint of a link between two routers. Each conceptual link has two
/// `RouterLink` objects, one per side.
pub trait RouterLink: Send + Sync {
    fn link_type(&self) -> LinkType;

    /// The router on the other side, when it lives on this node.
    fn local_peer(&self) -> Option<Arc<Router>>;

    /// Whether this is a remote link over `sublink` of `link`.
    fn is_remote_link_to(&self, link: &NodeLink, sublink: SublinkId) -> bool;

    /// For remote links, the node-link and sublink carrying this end.
    fn remote_endpoint(&self) -> Option<(Arc<NodeLink>, SublinkId)>;

    /// Marks this side stable: its links will no longer change, so the
    /// other side may lock the link for bypass or closure.
    fn mark_side_stable(&self);

    /// Locks the link so the router on this side can coordinate its own
    /// bypass; `bypass_request_source` is stored for the other side to
    /// authenticate the eventual bypass request.
    fn try_lock_for_bypass(&self, bypass_request_source: NodeName) -> bool;

    /// Locks the link to propagate closure from this side.
    fn try_lock_for_closure(&self) -> bool;

    fn unlock(&self);

    /// If the other side parked a waiting bit and both sides are now
    /// stable, clears it and pokes the other side to flush.
    fn flush_other_side_if_waiting(&self);

    /// Whether a bypass request from `source` is authorized against this
    /// link: the other side must hold the lock and have stored `source`.
    fn can_node_request_bypass(&self, source: NodeName) -> bool;

    /// Best-effort estimate of whether a parcel of `data_size` bytes could
    /// exceed `limits` at its destination.
    fn would_parcel_exceed_limits(&self, data_size: usize, limits: &PutLimits) -> bool;

    /// Hands a parcel to the router on the other side.
    fn accept_parcel(&self, parcel: Parcel);

    /// Tells the other side that this side's route endpoint closed after
    /// `sequence_length` parcels.
    fn accept_route_closure(&self, sequence_length: SequenceNumber);

    /// Tells the other side its route has been severed on this side.
    fn accept_route_disconnection(&self);

    /// Asks the other side to initiate bypass of the router on this side.
    fn request_proxy_bypass_initiation(
        &self,
        to_new_peer: NodeName,
        proxy_peer_sublink: SublinkId,
    );

    /// Tells the proxying router on the other side when it may stop
    /// forwarding in each direction.
    fn stop_proxying(
        &self,
        proxy_inbound_sequence_length: SequenceNumber,
        proxy_outbound_sequence_length: SequenceNumber,
    );

    /// Tells the other side the proxy it just bypassed stops sending at
    /// the given inbound length.
    fn proxy_will_stop(&self, proxy_inbound_sequence_length: SequenceNumber);

    /// Tells the other side to cut over to `new_sublink`, bypassing the
    /// proxying router on this side whose outward peer shares its node.
    fn bypass_proxy_to_same_node(
        &self,
        new_sublink: SublinkId,
        new_link_state: Option<Fragment>,
        proxy_inbound_sequence_length: SequenceNumber,
    );

    /// Reply to `bypass_proxy_to_same_node`: the proxy learns its final
    /// outbound length.
    fn stop_proxying_to_local_peer(&self, proxy_outbound_sequence_length: SequenceNumber);

    /// Shares the link's shared-state cell with the other side if this side
    /// allocated it after link creation.
    fn share_link_state_if_necessary(&self);

    /// Stops this link from delivering anything further to its router.
    fn deactivate(&self);

    fn describe(&self) -> String;
}

/// Initial lockability of a new local link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitialLinkState {
    /// A brand-new route with nothing to decay: immediately lockable.
    CanBypass,
    /// A link born of bypass; each side must stabilize first.
    CannotBypass,
}

struct LocalLinkShared {
    link_type: LinkType,
    state: RouterLinkState,
    router_a: Arc<Router>,
    router_b: Arc<Router>,
}

impl LocalLinkShared {
    fn side(&self, side: LinkSide) -> &Arc<Router> {
        match side {
            LinkSide::A => &self.router_a,
            LinkSide::B => &self.router_b,
        }
    }
}

/// A link between two routers on the same node. Parcels are enqueued on the
/// peer directly; coordination state is an in-process cell.
pub struct LocalRouterLink {
    side: LinkSide,
    shared: Arc<LocalLinkShared>,
}

impl LocalRouterLink {
    /// Creates both ends of a link between `router_a` and `router_b`.
    pub fn new_pair(
        link_type: LinkType,
        initial_state: InitialLinkState,
        router_a: Arc<Router>,
        router_b: Arc<Router>,
    ) -> (Arc<dyn RouterLink>, Arc<dyn RouterLink>) {
        let shared = Arc::new(LocalLinkShared {
            link_type,
            state: RouterLinkState::default(),
            router_a,
            router_b,
        });
        if initial_state == InitialLinkState::CanBypass {
            shared.state.mark_fully_stable();
        }
        (
            Arc::new(LocalRouterLink {
                side: LinkSide::A,
                shared: shared.clone(),
            }),
            Arc::new(LocalRouterLink {
                side: LinkSide::B,
                shared,
            }),
        )
    }
}

impl RouterLink for LocalRouterLink {
    fn link_type(&self) -> LinkType {
        self.shared.link_type
    }

    fn local_peer(&self) -> Option<Arc<Router>> {
        Some(self.shared.side(self.side.opposite()).clone())
    }

    fn is_remote_link_to(&self, _link: &NodeLink, _sublink: SublinkId) -> bool {
        false
    }

    fn remote_endpoint(&self) -> Option<(Arc<NodeLink>, SublinkId)> {
        None
    }

    fn mark_side_stable(&self) {
        self.shared.state.set_side_stable(self.side);
    }

    fn try_lock_for_bypass(&self, bypass_request_source: NodeName) -> bool {
        if !self.shared.state.try_lock(self.side) {
            return false;
        }
        self.shared
            .state
            .set_allowed_bypass_request_source(bypass_request_source);
        true
    }

    fn try_lock_for_closure(&self) -> bool {
        self.shared.state.try_lock(self.side)
    }

    fn unlock(&self) {
        self.shared.state.unlock(self.side);
    }

    fn flush_other_side_if_waiting(&self) {
        let other = self.side.opposite();
        if self.shared.state.reset_waiting_bit(other) {
            self.shared.side(other).flush(true);
        }
    }

    fn can_node_request_bypass(&self, source: NodeName) -> bool {
        self.shared.state.is_locked_by(self.side.opposite())
            && self.shared.state.allowed_bypass_request_source() == source
    }

    fn would_parcel_exceed_limits(&self, data_size: usize, limits: &PutLimits) -> bool {
        self.shared
            .side(self.side.opposite())
            .would_inbound_parcel_exceed_limits(data_size, limits)
    }

    fn accept_parcel(&self, parcel: Parcel) {
        self.shared
            .side(self.side.opposite())
            .accept_inbound_parcel(parcel);
    }

    fn accept_route_closure(&self, sequence_length: SequenceNumber) {
        self.shared
            .side(self.side.opposite())
            .accept_route_closure(self.shared.link_type, sequence_length);
    }

    fn accept_route_disconnection(&self) {
        self.shared
            .side(self.side.opposite())
            .accept_route_disconnection(self.shared.link_type);
    }

    fn request_proxy_bypass_initiation(
        &self,
        _to_new_peer: NodeName,
        _proxy_peer_sublink: SublinkId,
    ) {
        debug_assert!(false, "local links have no proxies to bypass");
    }

    fn stop_proxying(
        &self,
        _proxy_inbound_sequence_length: SequenceNumber,
        _proxy_outbound_sequence_length: SequenceNumber,
    ) {
        debug_assert!(false, "local links have no proxies to bypass");
    }

    fn proxy_will_stop(&self, _proxy_inbound_sequence_length: SequenceNumber) {
        debug_assert!(false, "local links have no proxies to bypass");
    }

    fn bypass_proxy_to_same_node(
        &self,
        _new_sublink: SublinkId,
        _new_link_state: Option<Fragment>,
        _proxy_inbound_sequence_length: SequenceNumber,
    ) {
        debug_assert!(false, "local links have no proxies to bypass");
    }

    fn stop_proxying_to_local_peer(&self, _proxy_outbound_sequence_length: SequenceNumber) {
        debug_assert!(false, "local links have no proxies to bypass");
    }

    fn share_link_state_if_necessary(&self) {}

    fn deactivate(&self) {}

    fn describe(&self) -> String {
        format!("{} local link ({} end)", self.shared.link_type, self.side)
    }
}

const LINK_STATE_NOT_PRESENT: u8 = 0;
const LINK_STATE_BUSY: u8 = 1;
const LINK_STATE_PRESENT: u8 = 2;

/// A link to a router on another node, carried over one sublink of a
/// node-link. Central remote links coordinate through a `RouterLinkState`
/// fragment in the link's shared memory; if side A starts without one it
/// allocates the cell asynchronously and announces it to side B.
pub struct RemoteRouterLink {
    node_link: Arc<NodeLink>,
    sublink: SublinkId,
    link_type: LinkType,
    link_side: LinkSide,
    link_state: AtomicPtr<RouterLinkState>,
    link_state_fragment: Mutex<Option<Fragment>>,
    link_state_phase: AtomicU8,
    side_is_stable: AtomicBool,
    must_share_link_state: AtomicBool,
}

impl RemoteRouterLink {
    pub fn new(
        node_link: Arc<NodeLink>,
        sublink: SublinkId,
        link_state_fragment: Option<Fragment>,
        link_type: LinkType,
        link_side: LinkSide,
    ) -> Arc<RemoteRouterLink> {
        let link = Arc::new(RemoteRouterLink {
            node_link,
            sublink,
            link_type,
            link_side,
            link_state: AtomicPtr::new(std::ptr::null_mut()),
            link_state_fragment: Mutex::new(None),
            link_state_phase: AtomicU8::new(LINK_STATE_NOT_PRESENT),
            side_is_stable: AtomicBool::new(false),
            must_share_link_state: AtomicBool::new(false),
        });

        match link_state_fragment {
            Some(fragment) => Self::set_link_state(&link, fragment),
            None if link_type.is_central() && link_side.is_side_a() => {
                // No shared cell could be provided at construction. Allocate
                // one asynchronously and share it with the other side.
                link.must_share_link_state.store(true, Ordering::Relaxed);
                Self::allocate_link_state(&link);
            }
            None => {}
        }
        link
    }

    pub fn node_link(&self) -> &Arc<NodeLink> {
        &self.node_link
    }

    pub fn sublink(&self) -> SublinkId {
        self.sublink
    }

    pub fn link_side(&self) -> LinkSide {
        self.link_side
    }

    pub(crate) fn set_link_state(this: &Arc<Self>, fragment: Fragment) {
        debug_assert!(this.link_type.is_central() || fragment.is_addressable());
        if fragment.is_pending() {
            // The cell's buffer has not arrived yet; resolve once it does.
            let memory = this.node_link.memory().clone();
            let descriptor = fragment.descriptor();
            let link = this.clone();
            memory.on_buffer_available(
                descriptor.buffer,
                Box::new(move || {
                    let resolved = link.node_link.memory().get_fragment(descriptor);
                    if resolved.is_addressable() {
                        Self::set_link_state(&link, resolved);
                    }
                }),
            );
            return;
        }

        if this
            .link_state_phase
            .compare_exchange(
                LINK_STATE_NOT_PRESENT,
                LINK_STATE_BUSY,
                Ordering::Acquire,
                Ordering::Relaxed,
            )
            .is_err()
        {
            return;
        }

        *this.link_state_fragment.lock() = Some(fragment);
        this.link_state
            .store(fragment.ptr() as *mut RouterLinkState, Ordering::Release);
        this.link_state_phase
            .store(LINK_STATE_PRESENT, Ordering::Release);

        if this.side_is_stable.load(Ordering::Acquire) {
            this.mark_side_stable();
        }

        if let Some(router) = this.node_link.get_router(this.sublink) {
            router.flush(true);
        }
    }

    fn allocate_link_state(this: &Arc<Self>) {
        let memory = this.node_link.memory().clone();
        let link = this.clone();
        memory.clone().request_fragment_capacity(
            LINK_STATE_BUFFER_SIZE,
            64,
            Box::new(move || match memory.allocate_router_link_state() {
                Some(fragment) => Self::set_link_state(&link, fragment),
                // The fresh capacity was consumed by other allocations
                // before we got to it; ask again.
                None => Self::allocate_link_state(&link),
            }),
        );
    }

    fn get_link_state(&self) -> Option<&RouterLinkState> {
        let ptr = self.link_state.load(Ordering::Acquire);
        if ptr.is_null() {
            return None;
        }
        // The cell lives in a buffer owned by the node-link's memory pool,
        // which this link keeps alive through `node_link`.
        Some(unsafe { &*ptr })
    }

    fn transmit(&self, message: NodeMessage) {
        self.node_link.transmit_message(message, Vec::new());
    }
}

impl RouterLink for RemoteRouterLink {
    fn link_type(&self) -> LinkType {
        self.link_type
    }

    fn local_peer(&self) -> Option<Arc<Router>> {
        None
    }

    fn is_remote_link_to(&self, link: &NodeLink, sublink: SublinkId) -> bool {
        std::ptr::eq(self.node_link.as_ref(), link) && self.sublink == sublink
    }

    fn remote_endpoint(&self) -> Option<(Arc<NodeLink>, SublinkId)> {
        Some((self.node_link.clone(), self.sublink))
    }

    fn mark_side_stable(&self) {
        self.side_is_stable.store(true, Ordering::Release);
        if let Some(state) = self.get_link_state() {
            state.set_side_stable(self.link_side);
        }
    }

    fn try_lock_for_bypass(&self, bypass_request_source: NodeName) -> bool {
        let Some(state) = self.get_link_state() else {
            return false;
        };
        if !state.try_lock(self.link_side) {
            return false;
        }
        state.set_allowed_bypass_request_source(bypass_request_source);
        true
    }

    fn try_lock_for_closure(&self) -> bool {
        match self.get_link_state() {
            Some(state) => state.try_lock(self.link_side),
            None => false,
        }
    }

    fn unlock(&self) {
        if let Some(state) = self.get_link_state() {
            state.unlock(self.link_side);
        }
    }

    fn flush_other_side_if_waiting(&self) {
        let Some(state) = self.get_link_state() else {
            return;
        };
        if state.reset_waiting_bit(self.link_side.opposite()) {
            self.transmit(NodeMessage::FlushRouter {
                sublink: self.sublink,
            });
        }
    }

    fn can_node_request_bypass(&self, source: NodeName) -> bool {
        match self.get_link_state() {
            Some(state) => {
                state.is_locked_by(self.link_side.opposite())
                    && state.allowed_bypass_request_source() == source
            }
            None => false,
        }
    }

    fn would_parcel_exceed_limits(&self, _data_size: usize, _limits: &PutLimits) -> bool {
        // Distributed back-pressure is bounded by sender-side accounting
        // only; see the put-limits decision in DESIGN.md.
        false
    }

    fn accept_parcel(&self, mut parcel: Parcel) {
        let driver = self.node_link.node().driver().clone();
        let sequence_number = parcel.sequence_number();
        let data = parcel.data_view().to_vec();

        let mut wire_objects = Vec::new();
        let mut attachments = Vec::new();
        let mut new_routers = Vec::new();
        for object in parcel.take_objects() {
            match object {
                ParcelObject::Portal(router) => {
                    let descriptor = router.serialize_new_router(&self.node_link);
                    wire_objects.push(WireObject::Portal(descriptor.clone()));
                    new_routers.push((router, descriptor));
                }
                ParcelObject::Box(DriverObject::Custom(custom)) => {
                    match driver.serialize_object(custom) {
                        Ok(serialized) => {
                            wire_objects.push(WireObject::Box {
                                data: serialized.data,
                                num_attachments: serialized.objects.len() as u32,
                            });
                            attachments.extend(serialized.objects);
                        }
                        Err(err) => {
                            warn!("dropping unserializable boxed object: {err}");
                            wire_objects.push(WireObject::Box {
                                data: Vec::new(),
                                num_attachments: 0,
                            });
                        }
                    }
                }
                ParcelObject::Box(object) => {
                    // Transport and memory objects ride the table directly.
                    wire_objects.push(WireObject::Box {
                        data: Vec::new(),
                        num_attachments: 1,
                    });
                    attachments.push(object);
                }
            }
        }

        debug!(
            "transmitting parcel {} over {}",
            sequence_number,
            self.describe()
        );
        self.node_link.transmit_message(
            NodeMessage::AcceptParcel {
                sublink: self.sublink,
                sequence_number,
                data,
                objects: wire_objects,
            },
            attachments,
        );

        // Only after transmission is it safe for the routers we serialized
        // to begin proxying toward their new locations.
        for (router, descriptor) in new_routers {
            router.begin_proxying_to_new_router(&self.node_link, &descriptor);
        }
    }

    fn accept_route_closure(&self, sequence_length: SequenceNumber) {
        self.transmit(NodeMessage::RouteClosed {
            sublink: self.sublink,
            sequence_length,
        });
    }

    fn accept_route_disconnection(&self) {
        // A severed route propagates as a transport-level concern; peers
        // learn of it when their sublink is removed. Nothing to send.
    }

    fn request_proxy_bypass_initiation(
        &self,
        to_new_peer: NodeName,
        proxy_peer_sublink: SublinkId,
    ) {
        self.transmit(NodeMessage::InitiateProxyBypass {
            sublink: self.sublink,
            proxy_peer_name: to_new_peer,
            proxy_peer_sublink,
        });
    }

    fn stop_proxying(
        &self,
        proxy_inbound_sequence_length: SequenceNumber,
        proxy_outbound_sequence_length: SequenceNumber,
    ) {
        self.transmit(NodeMessage::StopProxying {
            sublink: self.sublink,
            proxy_inbound_sequence_length,
            proxy_outbound_sequence_length,
        });
    }

    fn proxy_will_stop(&self, proxy_inbound_sequence_length: SequenceNumber) {
        self.transmit(NodeMessage::ProxyWillStop {
            sublink: self.sublink,
            proxy_inbound_sequence_length,
        });
    }

    fn bypass_proxy_to_same_node(
        &self,
        new_sublink: SublinkId,
        new_link_state: Option<Fragment>,
        proxy_inbound_sequence_length: SequenceNumber,
    ) {
        self.transmit(NodeMessage::BypassProxyToSameNode {
            sublink: self.sublink,
            new_sublink,
            new_link_state_fragment: new_link_state.map(|f| f.descriptor()),
            proxy_inbound_sequence_length,
        });
    }

    fn stop_proxying_to_local_peer(&self, proxy_outbound_sequence_length: SequenceNumber) {
        self.transmit(NodeMessage::StopProxyingToLocalPeer {
            sublink: self.sublink,
            proxy_outbound_sequence_length,
        });
    }

    fn share_link_state_if_necessary(&self) {
        if !self.must_share_link_state.load(Ordering::Relaxed) {
            return;
        }
        if self.link_state_phase.load(Ordering::Acquire) != LINK_STATE_PRESENT {
            return;
        }
        if self
            .must_share_link_state
            .compare_exchange(true, false, Ordering::Relaxed, Ordering::Relaxed)
            .is_err()
        {
            return;
        }

        let descriptor = self
            .link_state_fragment
            .lock()
            .as_ref()
            .map(|fragment| fragment.descriptor());
        if let Some(descriptor) = descriptor {
            self.transmit(NodeMessage::SetRouterLinkStateFragment {
                sublink: self.sublink,
                descriptor,
            });
        }
    }

    fn deactivate(&self) {
        self.node_link.remove_remote_router_link(self.sublink);
    }

    fn describe(&self) -> String {
        format!(
            "{} remote link ({} end) from {} to {} via {}",
            self.link_type,
            self.link_side,
            self.node_link.local_node_name(),
            self.node_link.remote_node_name(),
            self.sublink
        )
    }
}
