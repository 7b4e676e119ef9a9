//! Node-links: the per-peer multiplexing channel.

use crate::memory::{Fragment, NodeLinkMemory};
use crate::node::{Node, NodeType};
use crate::parcel::{Parcel, ParcelObject};
use crate::router::Router;
use crate::router_link::{RemoteRouterLink, RouterLink};
use crate::wire::{self, NodeMessage, WireObject};
use core_types::{BufferId, LinkSide, LinkType, NodeName, SequenceNumber, SublinkId};
use driver_api::{
    DriverObject, ProtocolViolation, SerializedObject, SharedMemoryRegion, Transport,
    TransportListener, TransportMessage,
};
use log::{debug, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

pub(crate) type MemoryResponseCallback =
    Box<dyn FnOnce(Option<Arc<dyn SharedMemoryRegion>>) + Send>;
pub(crate) type IndirectConnectionCallback =
    Box<dyn FnOnce(Option<(NodeName, u32)>) + Send>;

/// One multiplexed route binding: the remote link object at this end and
/// the router receiving traffic for it.
#[derive(Clone)]
pub struct Sublink {
    pub link: Arc<RemoteRouterLink>,
    pub receiver: Arc<Router>,
}

struct LinkState {
    active: bool,
    sublinks: HashMap<SublinkId, Sublink>,
    next_request_id: u64,
    /// In-flight memory requests, in transmission order per size.
    pending_memory_requests: Vec<(u32, MemoryResponseCallback)>,
    pending_indirect_connections: HashMap<u64, IndirectConnectionCallback>,
}

/// Encapsulates all communication between this node and exactly one remote
/// node: a transport for control and parcel frames, a cooperatively managed
/// memory pool, and a table of sublinks multiplexing router-to-router
/// traffic.
pub struct NodeLink {
    weak_self: Weak<NodeLink>,
    node: Arc<Node>,
    link_side: LinkSide,
    local_node_name: NodeName,
    remote_node_name: NodeName,
    remote_node_type: NodeType,
    transport: Arc<dyn Transport>,
    memory: Arc<NodeLinkMemory>,
    /// Stamped on every outgoing frame; keeps ordering well-defined if
    /// frames ever flow through more than one channel.
    next_transport_sequence: AtomicU64,
    state: Mutex<LinkState>,
}

impl NodeLink {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        node: Arc<Node>,
        link_side: LinkSide,
        local_node_name: NodeName,
        remote_node_name: NodeName,
        remote_node_type: NodeType,
        transport: Arc<dyn Transport>,
        memory: Arc<NodeLinkMemory>,
    ) -> Arc<NodeLink> {
        let link = Arc::new_cyclic(|weak| NodeLink {
            weak_self: weak.clone(),
            node,
            link_side,
            local_node_name,
            remote_node_name,
            remote_node_type,
            transport,
            memory,
            next_transport_sequence: AtomicU64::new(0),
            state: Mutex::new(LinkState {
                active: true,
                sublinks: HashMap::new(),
                next_request_id: 0,
                pending_memory_requests: Vec::new(),
                pending_indirect_connections: HashMap::new(),
            }),
        });
        link.memory.set_node_link(Some(link.clone()));
        link
    }

    fn arc(&self) -> Arc<NodeLink> {
        self.weak_self.upgrade().expect("node link is referenced")
    }

    /// Starts delivering transport traffic straight to this link. Used for
    /// introduced links, which skip the connect handshake.
    pub fn activate(link: &Arc<NodeLink>) {
        if link.transport.activate(link.clone()).is_err() {
            link.deactivate();
        }
    }

    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    pub fn link_side(&self) -> LinkSide {
        self.link_side
    }

    pub fn local_node_name(&self) -> NodeName {
        self.local_node_name
    }

    pub fn remote_node_name(&self) -> NodeName {
        self.remote_node_name
    }

    pub fn remote_node_type(&self) -> NodeType {
        self.remote_node_type
    }

    pub fn memory(&self) -> &Arc<NodeLinkMemory> {
        &self.memory
    }

    /// Binds `sublink` to `router`. Returns the new link object, or `None`
    /// if the sublink is taken or the link is already deactivated.
    pub fn add_remote_router_link(
        &self,
        sublink: SublinkId,
        link_state: Option<Fragment>,
        link_type: LinkType,
        side: LinkSide,
        router: Arc<Router>,
    ) -> Option<Arc<RemoteRouterLink>> {
        let link = RemoteRouterLink::new(self.arc(), sublink, link_state, link_type, side);
        let mut state = self.state.lock();
        if !state.active {
            return None;
        }
        if state.sublinks.contains_key(&sublink) {
            return None;
        }
        state.sublinks.insert(
            sublink,
            Sublink {
                link: link.clone(),
                receiver: router,
            },
        );
        Some(link)
    }

    /// Unbinds `sublink`; subsequent messages for it are ignored.
    pub fn remove_remote_router_link(&self, sublink: SublinkId) -> bool {
        self.state.lock().sublinks.remove(&sublink).is_some()
    }

    pub fn get_sublink(&self, sublink: SublinkId) -> Option<(Arc<RemoteRouterLink>, Arc<Router>)> {
        let state = self.state.lock();
        state
            .sublinks
            .get(&sublink)
            .map(|entry| (entry.link.clone(), entry.receiver.clone()))
    }

    pub fn get_router(&self, sublink: SublinkId) -> Option<Arc<Router>> {
        let state = self.state.lock();
        state.sublinks.get(&sublink).map(|entry| entry.receiver.clone())
    }

    /// Permanently deactivates this link: the transport stops, sublinks are
    /// scrubbed, and every bound router observes a disconnection.
    pub fn deactivate(&self) {
        let (sublinks, memory_requests, indirect) = {
            let mut state = self.state.lock();
            if !state.active {
                return;
            }
            state.active = false;
            (
                std::mem::take(&mut state.sublinks),
                std::mem::take(&mut state.pending_memory_requests),
                std::mem::take(&mut state.pending_indirect_connections),
            )
        };

        debug!(
            "deactivating link from {} to {}",
            self.local_node_name, self.remote_node_name
        );
        self.transport.deactivate();
        self.memory.set_node_link(None);
        self.node.forget_link(self.remote_node_name);

        for (sublink, entry) in sublinks {
            entry.receiver.notify_link_disconnected(self, sublink);
        }
        for (_, callback) in memory_requests {
            callback(None);
        }
        for (_, callback) in indirect {
            callback(None);
        }
    }

    /// Transmits one control message with its object attachments.
    pub fn transmit_message(&self, message: NodeMessage, objects: Vec<DriverObject>) {
        let sequence = self.next_transport_sequence.fetch_add(1, Ordering::Relaxed);
        let frame = wire::encode(&message, sequence);
        if self
            .transport
            .transmit(TransportMessage::with_objects(frame, objects))
            .is_err()
        {
            debug!(
                "transmit failed on link from {} to {}",
                self.local_node_name, self.remote_node_name
            );
        }
    }

    /// Asks the broker at the other end to link us with `name`.
    pub fn request_introduction(&self, name: NodeName) {
        self.transmit_message(NodeMessage::RequestIntroduction { name }, Vec::new());
    }

    /// Introduces the remote node to `name` with a fresh transport and
    /// primary buffer.
    pub fn introduce_node(
        &self,
        name: NodeName,
        link_side: LinkSide,
        transport: Arc<dyn Transport>,
        primary_buffer: Arc<dyn SharedMemoryRegion>,
    ) {
        self.transmit_message(
            NodeMessage::IntroduceNode {
                name,
                known: true,
                link_side,
            },
            vec![
                DriverObject::Transport(transport),
                DriverObject::Memory(primary_buffer),
            ],
        );
    }

    /// Tells the remote node the introduction to `name` failed.
    pub fn introduce_node_failure(&self, name: NodeName) {
        self.transmit_message(
            NodeMessage::IntroduceNode {
                name,
                known: false,
                link_side: LinkSide::A,
            },
            Vec::new(),
        );
    }

    /// Asks the remote node to replace its link to the proxy at
    /// `proxy_name`/`proxy_sublink` with a direct link to `new_peer` here.
    /// By convention the requesting side adopts side A of the bypass link.
    pub fn bypass_proxy(
        &self,
        proxy_name: NodeName,
        proxy_sublink: SublinkId,
        proxy_outbound_sequence_length: SequenceNumber,
        new_peer: Arc<Router>,
    ) -> bool {
        let new_sublink = self.memory.allocate_sublinks(1);
        let link_state = self.memory.allocate_router_link_state();
        let descriptor = link_state.as_ref().map(|fragment| fragment.descriptor());
        let Some(new_link) = self.add_remote_router_link(
            new_sublink,
            link_state,
            LinkType::Central,
            LinkSide::A,
            new_peer.clone(),
        ) else {
            return false;
        };

        debug!(
            "sending bypass request from {} to {} with new sublink {}",
            self.local_node_name, self.remote_node_name, new_sublink
        );
        self.transmit_message(
            NodeMessage::BypassProxy {
                proxy_name,
                proxy_sublink,
                new_sublink,
                new_link_state_fragment: descriptor,
                proxy_outbound_sequence_length,
            },
            Vec::new(),
        );

        // Only handed over after transmission so nothing flows on the new
        // sublink before the receiving node knows about it.
        new_peer.set_outward_link(new_link);
        true
    }

    /// Grants a new allocator buffer to the other side.
    pub fn add_fragment_allocator_buffer(
        &self,
        buffer_id: BufferId,
        fragment_size: u32,
        region: Arc<dyn SharedMemoryRegion>,
    ) {
        self.transmit_message(
            NodeMessage::AddFragmentAllocatorBuffer {
                buffer_id,
                fragment_size,
            },
            vec![DriverObject::Memory(region)],
        );
    }

    /// Asks the other side to allocate `size` bytes of shared memory.
    pub fn request_memory(&self, size: u32, callback: MemoryResponseCallback) {
        {
            let mut state = self.state.lock();
            if !state.active {
                drop(state);
                callback(None);
                return;
            }
            state.pending_memory_requests.push((size, callback));
        }
        self.transmit_message(NodeMessage::RequestMemory { size }, Vec::new());
    }

    /// Forwards a new node's transport to the broker at the other end of
    /// this link for admission into the network.
    pub fn request_indirect_broker_connection(
        &self,
        transport: Arc<dyn Transport>,
        num_initial_portals: u32,
        callback: IndirectConnectionCallback,
    ) {
        let request_id = {
            let mut state = self.state.lock();
            if !state.active {
                drop(state);
                callback(None);
                return;
            }
            let id = state.next_request_id;
            state.next_request_id += 1;
            state.pending_indirect_connections.insert(id, callback);
            id
        };
        self.transmit_message(
            NodeMessage::RequestIndirectBrokerConnection {
                request_id,
                num_initial_portals,
            },
            vec![DriverObject::Transport(transport)],
        );
    }

    fn handle_message(
        &self,
        message: NodeMessage,
        objects: Vec<DriverObject>,
    ) -> Result<(), ProtocolViolation> {
        match message {
            NodeMessage::Connect { .. } => {
                // The handshake happened before this link existed.
                warn!("ignoring unexpected Connect on established link");
                Ok(())
            }
            NodeMessage::AcceptParcel {
                sublink,
                sequence_number,
                data,
                objects: wire_objects,
            } => self.on_accept_parcel(sublink, sequence_number, data, wire_objects, objects),
            NodeMessage::RouteClosed {
                sublink,
                sequence_length,
            } => {
                let Some((link, receiver)) = self.get_sublink(sublink) else {
                    return Ok(());
                };
                if receiver.accept_route_closure(link.link_type(), sequence_length) {
                    Ok(())
                } else {
                    Err(ProtocolViolation)
                }
            }
            NodeMessage::SetRouterLinkStateFragment {
                sublink,
                descriptor,
            } => {
                let Some((link, _)) = self.get_sublink(sublink) else {
                    return Ok(());
                };
                let fragment = self.memory.get_fragment(descriptor);
                RemoteRouterLink::set_link_state(&link, fragment);
                Ok(())
            }
            NodeMessage::AddFragmentAllocatorBuffer {
                buffer_id,
                fragment_size,
            } => {
                let mut objects = objects.into_iter();
                let Some(DriverObject::Memory(region)) = objects.next() else {
                    return Err(ProtocolViolation);
                };
                if self
                    .memory
                    .add_fragment_allocator_buffer(buffer_id, fragment_size, &region)
                {
                    Ok(())
                } else {
                    Err(ProtocolViolation)
                }
            }
            NodeMessage::RequestMemory { size } => {
                let link = self.arc();
                self.node.allocate_shared_memory(
                    size as usize,
                    Box::new(move |region| {
                        if let Some(region) = region {
                            link.transmit_message(
                                NodeMessage::ProvideMemory { size },
                                vec![DriverObject::Memory(region)],
                            );
                        }
                    }),
                );
                Ok(())
            }
            NodeMessage::ProvideMemory { size } => {
                let mut objects = objects.into_iter();
                let Some(DriverObject::Memory(region)) = objects.next() else {
                    return Err(ProtocolViolation);
                };
                let callback = {
                    let mut state = self.state.lock();
                    let index = state
                        .pending_memory_requests
                        .iter()
                        .position(|(pending_size, _)| *pending_size == size);
                    match index {
                        Some(index) => state.pending_memory_requests.remove(index).1,
                        None => return Err(ProtocolViolation),
                    }
                };
                callback(Some(region));
                Ok(())
            }
            NodeMessage::RequestIntroduction { name } => {
                if self.node.handle_request_introduction(self, name) {
                    Ok(())
                } else {
                    Err(ProtocolViolation)
                }
            }
            NodeMessage::IntroduceNode {
                name,
                known,
                link_side,
            } => {
                let mut objects = objects.into_iter();
                let transport = match objects.next() {
                    Some(DriverObject::Transport(transport)) if known => Some(transport),
                    None if !known => None,
                    _ => return Err(ProtocolViolation),
                };
                let region = match objects.next() {
                    Some(DriverObject::Memory(region)) if known => Some(region),
                    None if !known => None,
                    _ => return Err(ProtocolViolation),
                };
                if self
                    .node
                    .handle_introduce_node(name, link_side, transport, region)
                {
                    Ok(())
                } else {
                    Err(ProtocolViolation)
                }
            }
            NodeMessage::RequestIndirectBrokerConnection {
                request_id,
                num_initial_portals,
            } => {
                let mut objects = objects.into_iter();
                let Some(DriverObject::Transport(transport)) = objects.next() else {
                    return Err(ProtocolViolation);
                };
                if self.node.handle_request_indirect_broker_connection(
                    &self.arc(),
                    request_id,
                    transport,
                    num_initial_portals,
                ) {
                    Ok(())
                } else {
                    Err(ProtocolViolation)
                }
            }
            NodeMessage::AcceptIndirectBrokerConnection {
                request_id,
                success,
                name,
                num_remote_portals,
            } => {
                let callback = {
                    let mut state = self.state.lock();
                    state.pending_indirect_connections.remove(&request_id)
                };
                let Some(callback) = callback else {
                    return Err(ProtocolViolation);
                };
                callback(success.then_some((name, num_remote_portals)));
                Ok(())
            }
            NodeMessage::FlushRouter { sublink } => {
                if let Some(router) = self.get_router(sublink) {
                    router.flush(true);
                }
                Ok(())
            }
            NodeMessage::InitiateProxyBypass {
                sublink,
                proxy_peer_name,
                proxy_peer_sublink,
            } => {
                let Some(router) = self.get_router(sublink) else {
                    return Ok(());
                };
                if router.initiate_proxy_bypass(
                    &self.arc(),
                    sublink,
                    proxy_peer_name,
                    proxy_peer_sublink,
                ) {
                    Ok(())
                } else {
                    Err(ProtocolViolation)
                }
            }
            NodeMessage::BypassProxy {
                proxy_name,
                proxy_sublink,
                new_sublink,
                new_link_state_fragment,
                proxy_outbound_sequence_length,
            } => {
                let Some(proxy_node_link) = self.node.get_link(proxy_name) else {
                    return Ok(());
                };
                let Some(proxy_peer) = proxy_node_link.get_router(proxy_sublink) else {
                    warn!(
                        "invalid bypass request for unknown sublink {} to {}",
                        proxy_sublink, proxy_name
                    );
                    return Err(ProtocolViolation);
                };
                // The requester took side A of the bypass link; we take B.
                let link_state =
                    new_link_state_fragment.map(|descriptor| self.memory.get_fragment(descriptor));
                let Some(new_peer_link) = self.add_remote_router_link(
                    new_sublink,
                    link_state,
                    LinkType::Central,
                    LinkSide::B,
                    proxy_peer.clone(),
                ) else {
                    return Ok(());
                };
                if proxy_peer.bypass_proxy_with_new_remote_link(
                    new_peer_link,
                    proxy_outbound_sequence_length,
                ) {
                    Ok(())
                } else {
                    Err(ProtocolViolation)
                }
            }
            NodeMessage::BypassProxyToSameNode {
                sublink,
                new_sublink,
                new_link_state_fragment,
                proxy_inbound_sequence_length,
            } => {
                let Some((_, receiver)) = self.get_sublink(sublink) else {
                    return Ok(());
                };
                let link_state =
                    new_link_state_fragment.map(|descriptor| self.memory.get_fragment(descriptor));
                let Some(new_link) = self.add_remote_router_link(
                    new_sublink,
                    link_state,
                    LinkType::Central,
                    LinkSide::B,
                    receiver.clone(),
                ) else {
                    return Ok(());
                };
                if receiver
                    .bypass_proxy_with_new_link_to_same_node(new_link, proxy_inbound_sequence_length)
                {
                    Ok(())
                } else {
                    Err(ProtocolViolation)
                }
            }
            NodeMessage::StopProxying {
                sublink,
                proxy_inbound_sequence_length,
                proxy_outbound_sequence_length,
            } => {
                if let Some(router) = self.get_router(sublink) {
                    router.stop_proxying(
                        proxy_inbound_sequence_length,
                        proxy_outbound_sequence_length,
                    );
                }
                Ok(())
            }
            NodeMessage::StopProxyingToLocalPeer {
                sublink,
                proxy_outbound_sequence_length,
            } => {
                if let Some(router) = self.get_router(sublink) {
                    if !router.stop_proxying_to_local_peer(proxy_outbound_sequence_length) {
                        return Err(ProtocolViolation);
                    }
                }
                Ok(())
            }
            NodeMessage::ProxyWillStop {
                sublink,
                proxy_inbound_sequence_length,
            } => {
                if let Some(router) = self.get_router(sublink) {
                    router.on_proxy_will_stop(proxy_inbound_sequence_length);
                }
                Ok(())
            }
        }
    }

    fn on_accept_parcel(
        &self,
        sublink: SublinkId,
        sequence_number: SequenceNumber,
        data: Vec<u8>,
        wire_objects: Vec<WireObject>,
        attachments: Vec<DriverObject>,
    ) -> Result<(), ProtocolViolation> {
        let Some((link, receiver)) = self.get_sublink(sublink) else {
            // The sublink raced away; the parcel is moot.
            return Ok(());
        };

        let mut attachments: std::collections::VecDeque<DriverObject> = attachments.into();
        let mut take_attachments = |count: usize| -> Result<Vec<DriverObject>, ProtocolViolation> {
            if count > attachments.len() {
                return Err(ProtocolViolation);
            }
            Ok(attachments.drain(..count).collect())
        };

        let mut parcel_objects = Vec::new();
        for object in wire_objects {
            match object {
                WireObject::Portal(descriptor) => {
                    let Some(router) = Router::deserialize(&descriptor, &self.arc()) else {
                        return Err(ProtocolViolation);
                    };
                    parcel_objects.push(ParcelObject::Portal(router));
                }
                WireObject::Box {
                    data,
                    num_attachments,
                } => {
                    let mut taken = take_attachments(num_attachments as usize)?;
                    if data.is_empty() && taken.len() == 1 {
                        // A transport or memory object passed through the
                        // driver's table untouched.
                        parcel_objects.push(ParcelObject::Box(taken.remove(0)));
                    } else {
                        let restored = self
                            .node
                            .driver()
                            .deserialize_object(SerializedObject {
                                data,
                                objects: taken,
                            })
                            .map_err(|_| ProtocolViolation)?;
                        parcel_objects.push(ParcelObject::Box(DriverObject::Custom(restored)));
                    }
                }
            }
        }

        let mut parcel = Parcel::new(data, parcel_objects);
        parcel.set_sequence_number(sequence_number);
        debug!("accepting {} on {}", parcel.describe(), sublink);

        let accepted = if link.link_type().is_peripheral_inward() {
            receiver.accept_outbound_parcel(parcel)
        } else {
            receiver.accept_inbound_parcel(parcel)
        };
        if accepted {
            Ok(())
        } else {
            Err(ProtocolViolation)
        }
    }
}

impl TransportListener for NodeLink {
    fn on_message(&self, message: TransportMessage) -> Result<(), ProtocolViolation> {
        {
            let state = self.state.lock();
            if !state.active {
                return Ok(());
            }
        }
        match wire::decode(&message.data) {
            Err(_) => Err(ProtocolViolation),
            Ok(None) => Ok(()),
            Ok(Some((_sequence, decoded))) => self.handle_message(decoded, message.objects),
        }
    }

    fn on_error(&self) {
        warn!(
            "transport error on link from {} to {}",
            self.local_node_name, self.remote_node_name
        );
        self.deactivate();
    }
}
