//! Routers: the nodes of the routing graph.

use crate::node_link::NodeLink;
use crate::parcel::{Parcel, ParcelObject, PutLimits};
use crate::route_edge::RouteEdge;
use crate::router_link::{InitialLinkState, LocalRouterLink, RemoteRouterLink, RouterLink};
use crate::sequenced_queue::SequencedQueue;
use crate::trap::{ArmError, Trap, TrapEventDispatcher, TrapSet, UpdateReason};
use crate::wire::RouterDescriptor;
use core_types::{
    ApiError, LinkType, NodeName, PortalStatusFlags, PortalStatus, SequenceNumber, Side, SublinkId,
};
use log::{debug, warn};
use parking_lot::{Mutex, MutexGuard};
use std::sync::{Arc, Weak};

pub(crate) struct RouterState {
    pub(crate) side: Side,
    pub(crate) status: PortalStatus,
    pub(crate) traps: TrapSet,
    /// Edge toward the other side of the route.
    pub(crate) outward: RouteEdge,
    /// Parcels awaiting transmission along the outward edge.
    pub(crate) outbound: SequencedQueue<Parcel>,
    /// Edge toward this side's terminal router; present only while this
    /// router acts as a proxy.
    pub(crate) inward: Option<RouteEdge>,
    /// Parcels from the other side, retrievable here when terminal and
    /// otherwise forwarded along the inward edge.
    pub(crate) inbound: SequencedQueue<Parcel>,
    pub(crate) closed_locally: bool,
}

impl RouterState {
    fn new(side: Side) -> Self {
        Self {
            side,
            status: PortalStatus::default(),
            traps: TrapSet::default(),
            outward: RouteEdge::new(),
            outbound: SequencedQueue::default(),
            inward: None,
            inbound: SequencedQueue::default(),
            closed_locally: false,
        }
    }

    fn refresh_local_counters(&mut self) {
        self.status.num_local_parcels = self.inbound.available_count() as u64;
        self.status.num_local_bytes = self.inbound.available_size() as u64;
    }

    fn refresh_remote_counters(&mut self) {
        self.status.num_remote_parcels = self.outbound.available_count() as u64;
        self.status.num_remote_bytes = self.outbound.available_size() as u64;
    }
}

/// The primitive that routes parcels between portals. Each portal controls
/// a terminal router; every route stabilizes toward exactly two terminal
/// routers talking over one central link. When a portal moves, the route is
/// extended with a new terminal router at the new location and the old one
/// proxies until bypass eliminates it.
pub struct Router {
    weak_self: Weak<Router>,
    state: Mutex<RouterState>,
}

/// Locks two routers in address order to avoid lock cycles.
fn lock_two<'a>(
    first: &'a Router,
    second: &'a Router,
) -> (MutexGuard<'a, RouterState>, MutexGuard<'a, RouterState>) {
    debug_assert!(!std::ptr::eq(first, second));
    if (first as *const Router) < (second as *const Router) {
        let a = first.state.lock();
        let b = second.state.lock();
        (a, b)
    } else {
        let b = second.state.lock();
        let a = first.state.lock();
        (a, b)
    }
}

impl Router {
    pub fn new(side: Side) -> Arc<Router> {
        Arc::new_cyclic(|weak| Router {
            weak_self: weak.clone(),
            state: Mutex::new(RouterState::new(side)),
        })
    }

    /// Creates the two linked terminal routers of a fresh local route.
    pub fn new_local_pair() -> (Arc<Router>, Arc<Router>) {
        let a = Router::new(Side::A);
        let b = Router::new(Side::B);
        let (link_a, link_b) = LocalRouterLink::new_pair(
            LinkType::Central,
            InitialLinkState::CanBypass,
            a.clone(),
            b.clone(),
        );
        a.set_outward_link(link_a);
        b.set_outward_link(link_b);
        (a, b)
    }

    fn arc(&self) -> Arc<Router> {
        self.weak_self.upgrade().expect("router is referenced")
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, RouterState> {
        self.state.lock()
    }

    pub fn side(&self) -> Side {
        self.state.lock().side
    }

    pub fn is_peer_closed(&self) -> bool {
        self.state.lock().status.peer_closed()
    }

    pub fn is_route_dead(&self) -> bool {
        self.state.lock().status.is_dead()
    }

    pub fn query_status(&self) -> PortalStatus {
        self.state.lock().status
    }

    /// Whether this router's outward link goes directly to `other` in this
    /// process.
    pub fn has_local_peer(&self, other: &Arc<Router>) -> bool {
        match self.state.lock().outward.local_peer() {
            Some(peer) => Arc::ptr_eq(&peer, other),
            None => false,
        }
    }

    pub(crate) fn would_outbound_parcel_exceed_limits(
        &self,
        data_size: usize,
        limits: &PutLimits,
    ) -> bool {
        let link = {
            let state = self.state.lock();
            if state.outbound.available_count() as u64 >= limits.max_queued_parcels {
                return true;
            }
            let queued = state.outbound.available_size() as u64;
            if queued > limits.max_queued_bytes
                || data_size as u64 > limits.max_queued_bytes - queued
            {
                return true;
            }
            match state.outward.primary_link() {
                Some(link) => link,
                None => return false,
            }
        };
        link.would_parcel_exceed_limits(data_size, limits)
    }

    pub(crate) fn would_inbound_parcel_exceed_limits(
        &self,
        data_size: usize,
        limits: &PutLimits,
    ) -> bool {
        let state = self.state.lock();
        let queued = state.inbound.available_size() as u64;
        queued > limits.max_queued_bytes
            || data_size as u64 > limits.max_queued_bytes - queued
            || state.inbound.available_count() as u64 >= limits.max_queued_parcels
    }

    /// Sends a parcel toward the other side of the route. Called only on a
    /// terminal router, by its controlling portal.
    pub(crate) fn send_outbound_parcel(&self, mut parcel: Parcel) -> Result<(), ApiError> {
        let mut state = self.state.lock();
        debug_assert!(state.inward.is_none());
        let sequence_number = state.outbound.current_sequence_length();
        parcel.set_sequence_number(sequence_number);

        let link = if state.outbound.is_empty() {
            // Fast path: nothing queued ahead of this parcel, so it may
            // go straight out if a link can carry it.
            state.outward.link_for_transmission(sequence_number)
        } else {
            None
        };

        match link {
            Some(link) => {
                state.outbound.reset_base(sequence_number + 1);
                state.refresh_remote_counters();
                drop(state);
                link.accept_parcel(parcel);
            }
            None => {
                debug!("queuing outbound {}", parcel.describe());
                if state.outbound.push(sequence_number, parcel).is_err() {
                    return Err(ApiError::ResourceExhausted);
                }
                state.refresh_remote_counters();
                drop(state);
                self.flush(false);
            }
        }
        Ok(())
    }

    /// Closes this side of the route. Called by the controlling portal, or
    /// when an in-transit portal is destroyed unread.
    pub fn close_route(&self) {
        {
            let mut state = self.state.lock();
            if state.closed_locally {
                return;
            }
            state.closed_locally = true;
            state.traps.remove_all();
            let length = state.outbound.current_sequence_length();
            state.outbound.set_final_length(length);
        }
        self.flush(false);
    }

    /// Adopts `link` as the outward link. The router must not already have
    /// one.
    pub fn set_outward_link(&self, link: Arc<dyn RouterLink>) {
        {
            let mut state = self.state.lock();
            state.outward.set_primary_link(link.clone());
            if link.link_type().is_central()
                && state.outward.is_stable()
                && state.inward.as_ref().map_or(true, |edge| edge.is_stable())
            {
                link.mark_side_stable();
            }
        }
        self.flush(true);
    }

    /// Finalizes this proxy's forwarding in both directions; it will
    /// dissolve once the given lengths have passed through.
    pub(crate) fn stop_proxying(
        &self,
        proxy_inbound_sequence_length: SequenceNumber,
        proxy_outbound_sequence_length: SequenceNumber,
    ) -> bool {
        {
            let mut state = self.state.lock();
            if !state.outward.is_decaying() {
                return false;
            }
            let Some(inward) = state.inward.as_mut() else {
                return false;
            };
            if !inward.is_decaying() {
                return false;
            }
            inward.set_length_to_and_from_decaying_link(
                proxy_inbound_sequence_length,
                proxy_outbound_sequence_length,
            );
            state.outward.set_length_to_and_from_decaying_link(
                proxy_outbound_sequence_length,
                proxy_inbound_sequence_length,
            );
        }
        self.flush(false);
        true
    }

    /// Accepts a parcel moving toward this side's terminal router.
    pub fn accept_inbound_parcel(&self, parcel: Parcel) -> bool {
        let mut dispatcher = TrapEventDispatcher::new();
        {
            let mut state = self.state.lock();
            let sequence_number = parcel.sequence_number();
            if state.inbound.push(sequence_number, parcel).is_err() {
                // An out-of-range or duplicate sequence number is a protocol
                // violation by the sender.
                return false;
            }

            if state.inward.is_none() {
                state.refresh_local_counters();
                let status = state.status;
                state
                    .traps
                    .update_status(&status, UpdateReason::NewLocalParcel, &mut dispatcher);
            }
        }
        self.flush(false);
        true
    }

    /// Accepts a parcel moving toward the other side, forwarded here by a
    /// proxying predecessor.
    pub fn accept_outbound_parcel(&self, parcel: Parcel) -> bool {
        {
            let mut state = self.state.lock();
            let sequence_number = parcel.sequence_number();
            if state.outbound.push(sequence_number, parcel).is_err() {
                return false;
            }
        }
        self.flush(false);
        true
    }

    /// Accepts notice that the other side closed after `sequence_length`
    /// parcels.
    pub fn accept_route_closure(
        &self,
        link_type: LinkType,
        sequence_length: SequenceNumber,
    ) -> bool {
        let mut dispatcher = TrapEventDispatcher::new();
        {
            let mut state = self.state.lock();
            match link_type {
                LinkType::Central | LinkType::PeripheralOutward => {
                    if !state.inbound.set_final_length(sequence_length) {
                        return false;
                    }
                    if state.inward.is_none() {
                        state.status.flags.insert(PortalStatusFlags::PEER_CLOSED);
                        if state.inbound.is_dead() {
                            state.status.flags.insert(PortalStatusFlags::DEAD);
                        }
                        let status = state.status;
                        state.traps.update_status(
                            &status,
                            UpdateReason::RouteClosed,
                            &mut dispatcher,
                        );
                    }
                }
                LinkType::PeripheralInward => return false,
            }
        }
        self.flush(false);
        true
    }

    /// Accepts notice that the route is broken at or beyond a link of
    /// `link_type`. Terminal routers translate this into peer closure at
    /// the current inbound length; proxies forward it.
    pub fn accept_route_disconnection(&self, link_type: LinkType) {
        let mut dispatcher = TrapEventDispatcher::new();
        let mut forward_links: Vec<Arc<dyn RouterLink>> = Vec::new();
        {
            let mut state = self.state.lock();
            if link_type.is_peripheral_inward() {
                forward_links.extend(state.outward.release_primary_link());
                forward_links.extend(state.outward.release_decaying_link());
            } else if let Some(inward) = state.inward.as_mut() {
                forward_links.extend(inward.release_primary_link());
                forward_links.extend(inward.release_decaying_link());
            } else {
                state.status.flags.insert(PortalStatusFlags::PEER_CLOSED);
                if state.inbound.final_length().is_none() {
                    let length = state.inbound.current_sequence_length();
                    state.inbound.set_final_length(length);
                }
                if state.inbound.is_dead() {
                    state.status.flags.insert(PortalStatusFlags::DEAD);
                }
                let status = state.status;
                state
                    .traps
                    .update_status(&status, UpdateReason::RouteClosed, &mut dispatcher);
            }
        }

        for link in forward_links {
            link.accept_route_disconnection();
        }
        self.flush(false);
    }

    /// Retrieves the next whole inbound parcel, if one is available.
    pub(crate) fn get_next_parcel(&self) -> Result<Parcel, ApiError> {
        let mut dispatcher = TrapEventDispatcher::new();
        let mut state = self.state.lock();
        if !state.inbound.has_next_element() {
            if state.inbound.is_dead() {
                return Err(ApiError::NotFound);
            }
            return Err(ApiError::Unavailable);
        }

        let parcel = state.inbound.pop().expect("head was available");
        state.refresh_local_counters();
        if state.inbound.is_dead() {
            state.status.flags.insert(PortalStatusFlags::DEAD);
        }
        let status = state.status;
        state
            .traps
            .update_status(&status, UpdateReason::LocalParcelConsumed, &mut dispatcher);
        drop(state);
        dispatcher.dispatch_all();
        Ok(parcel)
    }

    /// Consumes part of the next inbound parcel in place; pops the parcel
    /// once both its bytes and objects are exhausted.
    pub(crate) fn commit_inbound_get(
        &self,
        num_bytes: usize,
        num_objects: usize,
    ) -> Result<Vec<ParcelObject>, ApiError> {
        let mut dispatcher = TrapEventDispatcher::new();
        let mut state = self.state.lock();
        let Some(parcel) = state.inbound.next_element_mut() else {
            return Err(ApiError::FailedPrecondition);
        };
        if num_bytes > parcel.data_len() || num_objects > parcel.num_objects() {
            return Err(ApiError::InvalidArgument);
        }

        let objects = parcel.consume(num_bytes, num_objects);
        if parcel.is_fully_consumed() {
            state.inbound.pop();
        } else {
            state.inbound.reduce_head_size(num_bytes);
        }
        state.refresh_local_counters();
        if state.inbound.is_dead() {
            state.status.flags.insert(PortalStatusFlags::DEAD);
        }
        let status = state.status;
        state
            .traps
            .update_status(&status, UpdateReason::LocalParcelConsumed, &mut dispatcher);
        drop(state);
        dispatcher.dispatch_all();
        Ok(objects)
    }

    pub(crate) fn add_trap(&self, trap: Arc<Trap>) {
        self.state.lock().traps.add(trap);
    }

    pub(crate) fn arm_trap(&self, trap: &Trap) -> Result<(), ArmError> {
        let state = self.state.lock();
        trap.arm_with_status(&state.status)
    }

    pub(crate) fn remove_trap(&self, trap: &Arc<Trap>) {
        self.state.lock().traps.remove(trap);
    }

    /// Serializes this router for transfer over `node_link`, reconfiguring
    /// it (and possibly its local peer) to proxy toward the new location.
    pub(crate) fn serialize_new_router(&self, node_link: &Arc<NodeLink>) -> RouterDescriptor {
        let (local_peer, initiate_proxy_bypass) = {
            let mut state = self.state.lock();
            state.traps.remove_all();
            let local_peer = state.outward.local_peer();
            let initiate = state
                .outward
                .try_lock_primary_link_for_bypass(node_link.remote_node_name());
            (local_peer, initiate)
        };

        if let Some(local_peer) = local_peer {
            if initiate_proxy_bypass {
                if let Some(descriptor) =
                    self.serialize_new_router_with_local_peer(node_link, &local_peer)
                {
                    return descriptor;
                }
            }
        }

        self.serialize_new_router_and_configure_proxy(node_link, initiate_proxy_bypass)
    }

    /// The half-proxy split: this router's stable local peer takes a new
    /// central link straight to the moved router, and this router keeps
    /// only a decaying link to drain already-queued parcels.
    fn serialize_new_router_with_local_peer(
        &self,
        node_link: &Arc<NodeLink>,
        local_peer: &Arc<Router>,
    ) -> Option<RouterDescriptor> {
        let proxy_inbound_sequence_length = {
            let (_state, mut peer_state) = lock_two(self, local_peer);
            match peer_state.outward.local_peer() {
                Some(peer_of_peer) if std::ptr::eq(peer_of_peer.as_ref(), self) => {}
                // The peer was closed; its link to us is already gone.
                _ => return None,
            }
            let length = peer_state.outbound.current_sequence_number();
            peer_state.outward.release_primary_link();
            length
        };

        // The first sublink becomes the route's new central link between our
        // local peer and the moved router; the second is our own decaying
        // inward link for parcels already in flight.
        let new_sublink = node_link.memory().allocate_sublinks(2);
        let decaying_sublink = new_sublink.offset_by(1);
        let link_state = node_link.memory().allocate_router_link_state();
        let link_state_descriptor = link_state.as_ref().map(|fragment| fragment.descriptor());

        let new_link = node_link.add_remote_router_link(
            new_sublink,
            link_state,
            LinkType::Central,
            core_types::LinkSide::A,
            local_peer.clone(),
        )?;
        // The local peer has nothing of its own to decay.
        new_link.mark_side_stable();
        node_link.add_remote_router_link(
            decaying_sublink,
            None,
            LinkType::PeripheralInward,
            core_types::LinkSide::A,
            self.arc(),
        )?;

        let mut descriptor = RouterDescriptor {
            new_sublink,
            new_decaying_sublink: Some(decaying_sublink),
            new_link_state_fragment: link_state_descriptor,
            proxy_already_bypassed: true,
            decaying_incoming_sequence_length: proxy_inbound_sequence_length,
            ..Default::default()
        };

        let (mut state, _peer_state) = lock_two(self, local_peer);
        descriptor.side = state.side;
        descriptor.next_outgoing_sequence_number = state.outbound.current_sequence_number();
        descriptor.next_incoming_sequence_number = state.inbound.current_sequence_number();
        if let Some(final_length) = state.inbound.final_length() {
            descriptor.peer_closed = true;
            descriptor.closed_peer_sequence_length = final_length;
        }

        debug!(
            "splitting local pair to move router with outbound length {} and inbound number {}",
            descriptor.next_outgoing_sequence_number, descriptor.next_incoming_sequence_number,
        );

        // This router decays as soon as links are adopted after transmit.
        let outbound_length = state.outbound.current_sequence_number();
        let mut inward = RouteEdge::new();
        inward.start_decaying(Some(proxy_inbound_sequence_length), Some(outbound_length));
        state.inward = Some(inward);
        Some(descriptor)
    }

    /// The general path: this router stays behind as a proxy, full or (with
    /// `initiate_proxy_bypass`) one the moved router will bypass at once.
    fn serialize_new_router_and_configure_proxy(
        &self,
        node_link: &Arc<NodeLink>,
        initiate_proxy_bypass: bool,
    ) -> RouterDescriptor {
        let mut descriptor = RouterDescriptor::default();
        {
            let mut state = self.state.lock();
            descriptor.side = state.side;
            descriptor.proxy_already_bypassed = false;
            descriptor.next_outgoing_sequence_number = state.outbound.current_sequence_number();
            descriptor.next_incoming_sequence_number = state.inbound.current_sequence_number();

            let mut inward = RouteEdge::new();
            if state.status.peer_closed() {
                descriptor.peer_closed = true;
                let final_length = state
                    .inbound
                    .final_length()
                    .unwrap_or_else(|| state.inbound.current_sequence_length());
                descriptor.closed_peer_sequence_length = final_length;

                // Nothing more will ever flow through here; decay at once.
                inward.start_decaying(
                    Some(final_length),
                    Some(state.outbound.current_sequence_number()),
                );
            } else if initiate_proxy_bypass && state.outward.local_peer().is_none() {
                if let Some((peer_node_link, peer_sublink)) = state
                    .outward
                    .primary_link()
                    .and_then(|link| link.remote_endpoint())
                {
                    descriptor.proxy_peer_node_name = peer_node_link.remote_node_name();
                    descriptor.proxy_peer_sublink = peer_sublink;
                    debug!(
                        "will initiate proxy bypass on deserialization against {} via {}",
                        descriptor.proxy_peer_node_name, descriptor.proxy_peer_sublink,
                    );
                    inward.start_decaying(None, None);
                    state.outward.start_decaying(None, None);
                }
            }
            state.inward = Some(inward);
        }

        let new_sublink = node_link.memory().allocate_sublinks(1);
        descriptor.new_sublink = new_sublink;
        node_link.add_remote_router_link(
            new_sublink,
            None,
            LinkType::PeripheralInward,
            core_types::LinkSide::A,
            self.arc(),
        );
        descriptor
    }

    /// Finalizes state after the descriptor built by
    /// [`Self::serialize_new_router`] was transmitted: adopts the links
    /// registered there, which were unsafe to use before transmission.
    pub(crate) fn begin_proxying_to_new_router(
        &self,
        node_link: &Arc<NodeLink>,
        descriptor: &RouterDescriptor,
    ) {
        let Some((new_link, _)) = node_link.get_sublink(descriptor.new_sublink) else {
            // The sublink is gone, presumably because the link died.
            return;
        };
        let decaying = descriptor
            .new_decaying_sublink
            .and_then(|sublink| node_link.get_sublink(sublink));

        let mut local_peer = None;
        {
            let mut state = self.state.lock();
            debug_assert!(state.inward.is_some());
            if descriptor.proxy_already_bypassed {
                let Some(decaying) = decaying else {
                    return;
                };
                local_peer = state
                    .outward
                    .release_primary_link()
                    .and_then(|link| link.local_peer());
                if let Some(inward) = state.inward.as_mut() {
                    inward.set_primary_link(decaying.0);
                }
            } else if let Some(inward) = state.inward.as_mut() {
                inward.set_primary_link(new_link.clone());
            }

            let outward_link = state.outward.primary_link();
            if let Some(outward_link) = outward_link {
                if state.outward.is_stable()
                    && state.inward.as_ref().map_or(false, |edge| edge.is_stable())
                {
                    outward_link.mark_side_stable();
                }
            }
        }

        if let Some(local_peer) = local_peer {
            local_peer.set_outward_link(new_link);
        }
        self.flush(true);
    }

    /// Builds the router described by a received descriptor and binds it to
    /// `from_node_link`.
    pub(crate) fn deserialize(
        descriptor: &RouterDescriptor,
        from_node_link: &Arc<NodeLink>,
    ) -> Option<Arc<Router>> {
        let router = Router::new(descriptor.side);
        {
            let mut state = router.state.lock();
            state
                .outbound
                .reset_base(descriptor.next_outgoing_sequence_number);
            state
                .inbound
                .reset_base(descriptor.next_incoming_sequence_number);
            if descriptor.peer_closed {
                state.status.flags.insert(PortalStatusFlags::PEER_CLOSED);
                if !state
                    .inbound
                    .set_final_length(descriptor.closed_peer_sequence_length)
                {
                    return None;
                }
                if state.inbound.is_dead() {
                    state.status.flags.insert(PortalStatusFlags::DEAD);
                }
            }

            if descriptor.proxy_already_bypassed {
                // Our counterpart's former local peer keeps a decaying link
                // to us for parcels it already accepted; the route's new
                // central link arrives alongside it.
                let decaying_sublink = descriptor.new_decaying_sublink?;
                let decaying_link = from_node_link.add_remote_router_link(
                    decaying_sublink,
                    None,
                    LinkType::PeripheralOutward,
                    core_types::LinkSide::B,
                    router.clone(),
                )?;
                state.outward.set_primary_link(decaying_link);
                let length_from = if descriptor.decaying_incoming_sequence_length
                    > SequenceNumber::ZERO
                {
                    descriptor.decaying_incoming_sequence_length
                } else {
                    descriptor.next_incoming_sequence_number
                };
                let length_to = state.outbound.current_sequence_number();
                state.outward.start_decaying(Some(length_to), Some(length_from));

                let link_state = descriptor
                    .new_link_state_fragment
                    .map(|fragment| from_node_link.memory().get_fragment(fragment));
                let central_link = from_node_link.add_remote_router_link(
                    descriptor.new_sublink,
                    link_state,
                    LinkType::Central,
                    core_types::LinkSide::B,
                    router.clone(),
                )?;
                state.outward.set_primary_link(central_link);
                debug!(
                    "route moved from split pair on {} to {} via {}",
                    from_node_link.remote_node_name(),
                    from_node_link.local_node_name(),
                    descriptor.new_sublink,
                );
            } else {
                let link = from_node_link.add_remote_router_link(
                    descriptor.new_sublink,
                    None,
                    LinkType::PeripheralOutward,
                    core_types::LinkSide::B,
                    router.clone(),
                )?;
                state.outward.set_primary_link(link);
                debug!(
                    "route extended from {} to {} via {}",
                    from_node_link.remote_node_name(),
                    from_node_link.local_node_name(),
                    descriptor.new_sublink,
                );
            }
        }

        if descriptor.proxy_peer_node_name.is_valid() {
            // Our predecessor handed us the means to initiate its bypass.
            router.initiate_proxy_bypass(
                from_node_link,
                descriptor.new_sublink,
                descriptor.proxy_peer_node_name,
                descriptor.proxy_peer_sublink,
            );
        }

        router.flush(true);
        Some(router)
    }

    /// Starts elimination of this router's outward peer, a proxy that just
    /// forwarded us its route end. `requesting_node_link`/`requesting_sublink`
    /// identify the link the request arrived on, which must be our outward
    /// link to the proxy.
    pub(crate) fn initiate_proxy_bypass(
        &self,
        requesting_node_link: &Arc<NodeLink>,
        requesting_sublink: SublinkId,
        proxy_peer_node_name: NodeName,
        proxy_peer_sublink: SublinkId,
    ) -> bool {
        {
            let state = self.state.lock();
            let Some(outward_link) = state.outward.primary_link() else {
                // Already disconnected; nothing to bypass.
                return true;
            };
            if !outward_link.is_remote_link_to(requesting_node_link, requesting_sublink) {
                warn!(
                    "rejecting bypass initiation from {} on {}",
                    requesting_node_link.remote_node_name(),
                    requesting_sublink,
                );
                return false;
            }
        }

        if proxy_peer_node_name != requesting_node_link.local_node_name() {
            // Common case: the proxy's outward peer is on some other node.
            // Decay our link to the proxy and ask that peer to reconnect
            // directly here. The length expected from the decaying link
            // arrives later in ProxyWillStop.
            let proxy_outbound_sequence_length = {
                let mut state = self.state.lock();
                let length = state.outbound.current_sequence_number();
                if !state.outward.start_decaying(Some(length), None) {
                    return false;
                }
                length
            };

            let router = self.arc();
            let proxy_name = requesting_node_link.remote_node_name();
            requesting_node_link.node().establish_link(
                proxy_peer_node_name,
                Box::new(move |new_link| match new_link {
                    Some(new_link) => {
                        new_link.bypass_proxy(
                            proxy_name,
                            proxy_peer_sublink,
                            proxy_outbound_sequence_length,
                            router,
                        );
                    }
                    None => {
                        warn!("failed to reach {} for proxy bypass", proxy_peer_node_name);
                    }
                }),
            );
            return true;
        }

        // The proxy's outward peer lives on this very node: link the two
        // routers locally right now, no further messaging required.
        let Some(new_local_peer) = requesting_node_link.get_router(proxy_peer_sublink) else {
            // The peer may have been closed before this arrived.
            return true;
        };

        let previous_peer_link;
        let proxy_inbound_sequence_length;
        let proxy_outbound_sequence_length;
        {
            let (mut state, mut peer_state) = lock_two(self, &new_local_peer);
            proxy_inbound_sequence_length = peer_state.outbound.current_sequence_number();
            proxy_outbound_sequence_length = state.outbound.current_sequence_number();

            debug!(
                "initiating proxy bypass with local peer; inbound length {} outbound length {}",
                proxy_inbound_sequence_length, proxy_outbound_sequence_length,
            );

            if !state.outward.start_decaying(
                Some(proxy_outbound_sequence_length),
                Some(proxy_inbound_sequence_length),
            ) {
                return false;
            }

            previous_peer_link = peer_state.outward.primary_link();
            if !peer_state.outward.start_decaying(
                Some(proxy_inbound_sequence_length),
                Some(proxy_outbound_sequence_length),
            ) {
                return false;
            }

            let (link_a, link_b) = LocalRouterLink::new_pair(
                LinkType::Central,
                InitialLinkState::CannotBypass,
                self.arc(),
                new_local_peer.clone(),
            );
            state.outward.set_primary_link(link_a);
            peer_state.outward.set_primary_link(link_b);
        }

        if let Some(previous_peer_link) = previous_peer_link {
            previous_peer_link
                .stop_proxying(proxy_inbound_sequence_length, proxy_outbound_sequence_length);
        }

        self.flush(false);
        new_local_peer.flush(false);
        true
    }

    /// Handles a `BypassProxy` request: replace our outward link to the
    /// proxy with `new_peer`, after authenticating the requester against
    /// the link's shared state.
    pub(crate) fn bypass_proxy_with_new_remote_link(
        &self,
        new_peer: Arc<RemoteRouterLink>,
        proxy_outbound_sequence_length: SequenceNumber,
    ) -> bool {
        let proxy_inbound_sequence_length;
        let decaying_outward_link_to_proxy;
        {
            let mut state = self.state.lock();
            if state.outward.primary_link().is_none() {
                // Severed already; not a validation failure.
                return true;
            }

            let requester = new_peer.node_link().remote_node_name();
            if !state.outward.can_node_request_bypass_of_primary_link(requester) {
                new_peer.deactivate();
                return false;
            }

            proxy_inbound_sequence_length = state.outbound.current_sequence_number();
            decaying_outward_link_to_proxy = state.outward.primary_link();
            if !state.outward.start_decaying(
                Some(proxy_inbound_sequence_length),
                Some(proxy_outbound_sequence_length),
            ) {
                new_peer.deactivate();
                return false;
            }
            state.outward.set_primary_link(new_peer.clone());
        }

        if let Some(proxy_link) = decaying_outward_link_to_proxy {
            proxy_link.stop_proxying(
                proxy_inbound_sequence_length,
                proxy_outbound_sequence_length,
            );
        }
        new_peer.proxy_will_stop(proxy_inbound_sequence_length);

        self.flush(false);
        true
    }

    /// Handles `BypassProxyToSameNode`: our outward peer is a proxy whose
    /// own peer shares its node; cut over to `new_peer` on a new sublink of
    /// the same node-link. Trust needs no shared-state check because the
    /// links share a node-link.
    pub(crate) fn bypass_proxy_with_new_link_to_same_node(
        &self,
        new_peer: Arc<dyn RouterLink>,
        proxy_inbound_sequence_length: SequenceNumber,
    ) -> bool {
        let decaying_proxy;
        let proxy_outbound_sequence_length;
        {
            let mut state = self.state.lock();
            let Some(current) = state.outward.primary_link() else {
                return true;
            };
            if state.outward.local_peer().is_some() {
                // Bogus request: our outward link is local, so it cannot go
                // to a proxy on the requester's node.
                new_peer.deactivate();
                return false;
            }
            let same_link = match (current.remote_endpoint(), new_peer.remote_endpoint()) {
                (Some((current_link, _)), Some((new_link, _))) => {
                    Arc::ptr_eq(&current_link, &new_link)
                }
                _ => false,
            };
            if !same_link {
                new_peer.deactivate();
                return false;
            }

            proxy_outbound_sequence_length = state.outbound.current_sequence_number();
            decaying_proxy = state.outward.primary_link();
            if !state.outward.start_decaying(
                Some(proxy_outbound_sequence_length),
                Some(proxy_inbound_sequence_length),
            ) {
                new_peer.deactivate();
                return false;
            }
            state.outward.set_primary_link(new_peer);
        }

        if let Some(decaying_proxy) = decaying_proxy {
            decaying_proxy.stop_proxying_to_local_peer(proxy_outbound_sequence_length);
        }

        self.flush(false);
        true
    }

    /// Handles `StopProxyingToLocalPeer`: the reply to our same-node bypass
    /// offer, fixing the outbound length of our decaying links.
    pub(crate) fn stop_proxying_to_local_peer(
        &self,
        proxy_outbound_sequence_length: SequenceNumber,
    ) -> bool {
        let local_peer = {
            let state = self.state.lock();
            if !state.outward.is_decaying() {
                return false;
            }
            match state.outward.decaying_local_peer() {
                Some(peer) => peer,
                None => return false,
            }
        };

        {
            let (mut state, mut peer_state) = lock_two(self, &local_peer);
            let inward_ok = state
                .inward
                .as_ref()
                .map_or(false, |edge| edge.is_decaying());
            if peer_state.outward.is_stable() || !state.outward.is_decaying() || !inward_ok {
                return false;
            }

            peer_state
                .outward
                .set_length_from_decaying_link(proxy_outbound_sequence_length);
            state
                .outward
                .set_length_to_decaying_link(proxy_outbound_sequence_length);
            if let Some(inward) = state.inward.as_mut() {
                inward.set_length_from_decaying_link(proxy_outbound_sequence_length);
            }
        }

        self.flush(false);
        local_peer.flush(false);
        true
    }

    /// Handles `ProxyWillStop`: the proxy we bypassed finalizes the length
    /// of its inbound forwarding.
    pub(crate) fn on_proxy_will_stop(
        &self,
        proxy_inbound_sequence_length: SequenceNumber,
    ) -> bool {
        {
            let mut state = self.state.lock();
            if state.outward.is_stable() {
                return true;
            }
            if state.outward.length_from_decaying_link().is_none() {
                debug!(
                    "bypassed proxy will stop at inbound length {}",
                    proxy_inbound_sequence_length,
                );
                state
                    .outward
                    .set_length_from_decaying_link(proxy_inbound_sequence_length);
            }
        }
        self.flush(false);
        true
    }

    /// Notice that `sublink` of `link` was torn down while bound here.
    pub fn notify_link_disconnected(&self, link: &NodeLink, sublink: SublinkId) {
        let (outward, inward) = {
            let state = self.state.lock();
            (
                state.outward.is_routed_through(link, sublink),
                state
                    .inward
                    .as_ref()
                    .map_or(false, |edge| edge.is_routed_through(link, sublink)),
            )
        };
        if outward {
            self.accept_route_disconnection(LinkType::PeripheralOutward);
        } else if inward {
            self.accept_route_disconnection(LinkType::PeripheralInward);
        }
    }

    /// Drains queues along both edges, finishes link decay, propagates
    /// closure, and re-evaluates bypass eligibility. The heart of the
    /// router: every state transition funnels through here.
    pub fn flush(&self, force_bypass_attempt: bool) {
        let mut outbound_to_primary = Vec::new();
        let mut outbound_to_decaying = Vec::new();
        let mut inbound_to_primary = Vec::new();
        let mut inbound_to_decaying = Vec::new();
        let inward_link;
        let outward_link;
        let decaying_inward_link;
        let decaying_outward_link;
        let mut dead_outward_link = None;
        let mut dead_inward_link = None;
        let mut final_outward_length = None;
        let mut final_inward_length = None;
        let mut inward_link_decayed = false;
        let mut outward_link_decayed = false;
        let mut dropped_last_decaying_link = false;
        let on_central_link;
        let mut dispatcher = TrapEventDispatcher::new();
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            inward_link = state.inward.as_ref().and_then(|edge| edge.primary_link());
            outward_link = state.outward.primary_link();
            on_central_link = outward_link
                .as_ref()
                .map_or(false, |link| link.link_type().is_central());
            decaying_inward_link = state.inward.as_ref().and_then(|edge| edge.decaying_link());
            decaying_outward_link = state.outward.decaying_link();

            state.outward.flush_parcels_from_queue(
                &mut state.outbound,
                &mut outbound_to_decaying,
                &mut outbound_to_primary,
            );
            let outbound_sequence_length_sent = state.outbound.current_sequence_number();
            let inbound_sequence_length_received = state.inbound.current_sequence_length();
            if state
                .outward
                .try_finish_decay(outbound_sequence_length_sent, inbound_sequence_length_received)
            {
                debug!(
                    "outward link fully decayed at {} sent, {} received",
                    outbound_sequence_length_sent, inbound_sequence_length_received,
                );
                outward_link_decayed = true;
            }

            if let Some(inward) = state.inward.as_mut() {
                inward.flush_parcels_from_queue(
                    &mut state.inbound,
                    &mut inbound_to_decaying,
                    &mut inbound_to_primary,
                );
                let inbound_sequence_length_sent = state.inbound.current_sequence_number();
                let outbound_sequence_length_received = state.outbound.current_sequence_length();
                if inward.try_finish_decay(
                    inbound_sequence_length_sent,
                    outbound_sequence_length_received,
                ) {
                    debug!(
                        "inward link fully decayed at {} sent, {} received",
                        inbound_sequence_length_sent, outbound_sequence_length_received,
                    );
                    inward_link_decayed = true;
                }
            }

            // Shedding the last decaying link may have stabilized this side
            // of the central link, unblocking bypass or closure elsewhere.
            let inward_edge_stable = decaying_inward_link.is_none() || inward_link_decayed;
            let outward_edge_stable = decaying_outward_link.is_none() || outward_link_decayed;
            let both_edges_stable = inward_edge_stable && outward_edge_stable;
            let either_link_decayed = inward_link_decayed || outward_link_decayed;
            if on_central_link && either_link_decayed && both_edges_stable {
                if let Some(link) = outward_link.as_ref() {
                    link.mark_side_stable();
                }
                dropped_last_decaying_link = true;
            }

            if on_central_link
                && state.outbound.is_dead()
                && outward_link
                    .as_ref()
                    .map_or(false, |link| link.try_lock_for_closure())
            {
                // Our side is closed and fully transmitted; we are the last
                // router on this side, so propagate closure across.
                dead_outward_link = state.outward.release_primary_link();
                final_outward_length = state.outbound.final_length();
            } else if !state.inbound.expects_more_elements() {
                // Everything the other side will ever send has arrived; the
                // outward link has nothing left to carry.
                dead_outward_link = state.outward.release_primary_link();
            }

            if state.inbound.is_dead() {
                // All inbound parcels are received and forwarded; any
                // inward link is finished.
                final_inward_length = state.inbound.final_length();
                if let Some(inward) = state.inward.as_mut() {
                    dead_inward_link = inward.release_primary_link();
                }
            }

            if state.inward.is_none() {
                state.refresh_remote_counters();
                let status = state.status;
                state
                    .traps
                    .update_status(&status, UpdateReason::StatusQuery, &mut dispatcher);
            }
        }

        if on_central_link {
            if let Some(link) = outward_link.as_ref() {
                link.share_link_state_if_necessary();
            }
        }

        for parcel in outbound_to_decaying {
            if let Some(link) = decaying_outward_link.as_ref() {
                link.accept_parcel(parcel);
            }
        }
        for parcel in outbound_to_primary {
            if let Some(link) = outward_link.as_ref() {
                link.accept_parcel(parcel);
            }
        }
        for parcel in inbound_to_decaying {
            if let Some(link) = decaying_inward_link.as_ref() {
                link.accept_parcel(parcel);
            }
        }
        for parcel in inbound_to_primary {
            if let Some(link) = inward_link.as_ref() {
                link.accept_parcel(parcel);
            }
        }

        if outward_link_decayed {
            if let Some(link) = decaying_outward_link.as_ref() {
                link.deactivate();
            }
        }
        if inward_link_decayed {
            if let Some(link) = decaying_inward_link.as_ref() {
                link.deactivate();
            }
        }

        if let Some(link) = dead_outward_link.as_ref() {
            if let Some(length) = final_outward_length {
                link.accept_route_closure(length);
            }
            link.deactivate();
        }
        if let Some(link) = dead_inward_link.as_ref() {
            if let Some(length) = final_inward_length {
                link.accept_route_closure(length);
            }
            link.deactivate();
        }

        if dead_outward_link.is_some() || !on_central_link {
            // No bypass work without a live central link.
            return;
        }
        if !dropped_last_decaying_link && !force_bypass_attempt {
            // No relevant state change.
            return;
        }

        if inward_link.is_some() && self.maybe_initiate_self_removal() {
            return;
        }

        if let Some(link) = outward_link.as_ref() {
            link.flush_other_side_if_waiting();
        }
    }

    /// If this router is a stable proxy, try to lock the central link and
    /// kick off its own elimination.
    fn maybe_initiate_self_removal(&self) -> bool {
        let successor;
        let successor_endpoint;
        let local_peer;
        let mut remote_peer_endpoint = None;
        {
            let mut state = self.state.lock();
            let Some(inward) = state.inward.as_ref() else {
                return false;
            };
            if !inward.is_stable() {
                return false;
            }
            let Some(inward_primary) = inward.primary_link() else {
                return false;
            };
            let Some(endpoint) = inward_primary.remote_endpoint() else {
                // A proxy's successor is always remote.
                return false;
            };
            successor = inward_primary;
            successor_endpoint = endpoint;

            if !state
                .outward
                .try_lock_primary_link_for_bypass(successor_endpoint.0.remote_node_name())
            {
                debug!("proxy self-removal blocked by busy outward link");
                return false;
            }

            local_peer = state.outward.local_peer();
            if local_peer.is_none() {
                remote_peer_endpoint = state
                    .outward
                    .primary_link()
                    .and_then(|link| link.remote_endpoint());
            }
        }

        let Some(local_peer) = local_peer else {
            // Case A: peer is on another node. Decay both edges and ask our
            // successor to have the peer reconnect directly to it.
            let Some((peer_node_link, peer_sublink)) = remote_peer_endpoint else {
                return false;
            };
            {
                let mut state = self.state.lock();
                state.outward.start_decaying(None, None);
                if let Some(inward) = state.inward.as_mut() {
                    inward.start_decaying(None, None);
                }
            }
            debug!(
                "proxy initiating its own bypass toward {} via {}",
                peer_node_link.remote_node_name(),
                peer_sublink,
            );
            successor.request_proxy_bypass_initiation(
                peer_node_link.remote_node_name(),
                peer_sublink,
            );
            return true;
        };

        // Case B: peer is local to this node. Build the replacement central
        // link to the successor's node ourselves.
        let successor_node_link = successor_endpoint.0;
        let new_sublink = successor_node_link.memory().allocate_sublinks(1);
        let new_link_state = successor_node_link.memory().allocate_router_link_state();
        let state_for_message = new_link_state;
        let Some(new_link) = successor_node_link.add_remote_router_link(
            new_sublink,
            new_link_state,
            LinkType::Central,
            core_types::LinkSide::A,
            local_peer.clone(),
        ) else {
            return false;
        };

        let sequence_length;
        {
            let (mut state, mut peer_state) = lock_two(self, &local_peer);
            if peer_state.outward.primary_link().is_none() {
                // The local peer closed; closure is already propagating and
                // there is no bypass to perform.
                debug!("proxy self-removal aborted by peer closure");
                return false;
            }

            sequence_length = peer_state.outbound.current_sequence_number();
            peer_state.outward.start_decaying(Some(sequence_length), None);
            state.outward.start_decaying(None, Some(sequence_length));
            if let Some(inward) = state.inward.as_mut() {
                inward.start_decaying(Some(sequence_length), None);
            }
        }

        successor.bypass_proxy_to_same_node(new_sublink, state_for_message, sequence_length);
        local_peer.set_outward_link(new_link);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_pair_round_trip() {
        let (a, b) = Router::new_local_pair();
        assert!(a.has_local_peer(&b));
        assert!(b.has_local_peer(&a));

        a.send_outbound_parcel(Parcel::new(b"hello".to_vec(), Vec::new()))
            .unwrap();
        let parcel = b.get_next_parcel().unwrap();
        assert_eq!(parcel.data_view(), b"hello");
        assert!(matches!(b.get_next_parcel(), Err(ApiError::Unavailable)));
    }

    #[test]
    fn test_closure_propagates_to_local_peer() {
        let (a, b) = Router::new_local_pair();
        a.send_outbound_parcel(Parcel::new(b"last".to_vec(), Vec::new()))
            .unwrap();
        a.close_route();

        assert!(b.is_peer_closed());
        assert!(!b.is_route_dead());
        let parcel = b.get_next_parcel().unwrap();
        assert_eq!(parcel.data_view(), b"last");
        assert!(b.is_route_dead());
        assert!(matches!(b.get_next_parcel(), Err(ApiError::NotFound)));
    }

    #[test]
    fn test_ordering_across_local_pair() {
        let (a, b) = Router::new_local_pair();
        for i in 0..10u8 {
            a.send_outbound_parcel(Parcel::new(vec![i], Vec::new())).unwrap();
        }
        for i in 0..10u8 {
            assert_eq!(b.get_next_parcel().unwrap().data_view(), &[i]);
        }
    }

    #[test]
    fn test_outbound_limits() {
        let (a, b) = Router::new_local_pair();
        let limits = PutLimits {
            max_queued_parcels: 2,
            max_queued_bytes: 16,
        };
        assert!(!a.would_outbound_parcel_exceed_limits(4, &limits));
        a.send_outbound_parcel(Parcel::new(vec![0; 8], Vec::new())).unwrap();
        a.send_outbound_parcel(Parcel::new(vec![0; 8], Vec::new())).unwrap();
        // Both parcels sit unretrieved in b's inbound queue.
        assert!(a.would_outbound_parcel_exceed_limits(4, &limits));
        b.get_next_parcel().unwrap();
        b.get_next_parcel().unwrap();
        assert!(!a.would_outbound_parcel_exceed_limits(4, &limits));
    }
}
