//! Nodes: the top-level containers of the fabric.

use crate::memory::{NodeLinkMemory, MAX_INITIAL_PORTALS};
use crate::node_link::NodeLink;
use crate::portal::Portal;
use crate::router::Router;
use crate::router_link::RouterLink;
use crate::wire::{self, NodeMessage, PROTOCOL_VERSION};
use core_types::{LinkSide, LinkType, NodeName, SequenceNumber, Side, SublinkId};
use driver_api::{
    Driver, DriverObject, ProtocolViolation, SharedMemoryRegion, Transport, TransportListener,
    TransportMessage,
};
use log::{debug, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use thiserror::Error;

/// Whether a node is authorized to assign names and introduce other nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeType {
    /// Trusted; assigns names and brokers introductions.
    Broker,
    /// Everyone else; relies on a broker for naming and introductions.
    Normal,
}

/// The caller's role in a `connect_node` handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectMode {
    /// This node is a broker accepting a new non-broker.
    BrokerToNonBroker,
    /// This node is a non-broker connecting directly to a broker.
    NonBrokerToBroker,
    /// This non-broker hands the transport to its own broker so the node on
    /// the other end can join the network and be introduced back to us.
    ShareBroker,
    /// This new node connects to a non-broker that is sharing its broker;
    /// the handshake actually completes against that broker.
    InheritBroker,
}

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("too many initial portals requested")]
    TooManyInitialPortals,
    #[error("node type does not permit this connection mode")]
    WrongNodeType,
    #[error("no broker link available to share")]
    NoBroker,
    #[error("driver rejected the transport or memory")]
    Driver(#[from] driver_api::DriverError),
}

pub(crate) type EstablishLinkCallback = Box<dyn FnOnce(Option<Arc<NodeLink>>) + Send>;
type MemoryCallback = Box<dyn FnOnce(Option<Arc<dyn SharedMemoryRegion>>) + Send>;

/// Portals parked until a link to a specific peer node appears.
struct PortalBinding {
    routers: Vec<Arc<Router>>,
    remote_count: u32,
}

struct NodeState {
    assigned_name: NodeName,
    node_links: HashMap<NodeName, Arc<NodeLink>>,
    broker_link: Option<Arc<NodeLink>>,
    /// When set, shared memory is allocated by this link's remote side
    /// instead of the local driver.
    allocation_delegate: Option<Arc<NodeLink>>,
    pending_introductions: HashMap<NodeName, Vec<EstablishLinkCallback>>,
    pending_portal_bindings: HashMap<NodeName, Vec<PortalBinding>>,
}

/// A participant in the fabric: owns a driver, a name, links to peer nodes,
/// and the portals the application opens on it.
pub struct Node {
    weak_self: Weak<Node>,
    node_type: NodeType,
    driver: Arc<dyn Driver>,
    state: Mutex<NodeState>,
}

impl Node {
    pub fn new(node_type: NodeType, driver: Arc<dyn Driver>) -> Arc<Node> {
        let assigned_name = match node_type {
            // Only brokers name themselves.
            NodeType::Broker => NodeName::generate(),
            NodeType::Normal => NodeName::default(),
        };
        Arc::new_cyclic(|weak| Node {
            weak_self: weak.clone(),
            node_type,
            driver,
            state: Mutex::new(NodeState {
                assigned_name,
                node_links: HashMap::new(),
                broker_link: None,
                allocation_delegate: None,
                pending_introductions: HashMap::new(),
                pending_portal_bindings: HashMap::new(),
            }),
        })
    }

    fn arc(&self) -> Arc<Node> {
        self.weak_self.upgrade().expect("node is referenced")
    }

    pub fn node_type(&self) -> NodeType {
        self.node_type
    }

    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    pub fn assigned_name(&self) -> NodeName {
        self.state.lock().assigned_name
    }

    fn set_assigned_name(&self, name: NodeName) {
        let mut state = self.state.lock();
        if !state.assigned_name.is_valid() {
            state.assigned_name = name;
        }
    }

    /// Opens a fresh connected portal pair local to this node.
    pub fn open_portals(&self) -> (Portal, Portal) {
        let (a, b) = Router::new_local_pair();
        (Portal::from_router(a), Portal::from_router(b))
    }

    /// Connects this node to another over `transport`, exchanging
    /// `num_initial_portals` bootstrap portals. Portals are returned
    /// immediately and become routable once the handshake completes.
    pub fn connect_node(
        &self,
        transport: Arc<dyn Transport>,
        mode: ConnectMode,
        num_initial_portals: usize,
    ) -> Result<Vec<Portal>, ConnectError> {
        if num_initial_portals > MAX_INITIAL_PORTALS {
            return Err(ConnectError::TooManyInitialPortals);
        }
        match (self.node_type, mode) {
            (NodeType::Broker, ConnectMode::BrokerToNonBroker) => {}
            (NodeType::Normal, ConnectMode::NonBrokerToBroker)
            | (NodeType::Normal, ConnectMode::ShareBroker)
            | (NodeType::Normal, ConnectMode::InheritBroker) => {}
            _ => return Err(ConnectError::WrongNodeType),
        }

        let side = match mode {
            ConnectMode::BrokerToNonBroker => Side::A,
            _ => Side::B,
        };
        let routers: Vec<Arc<Router>> =
            (0..num_initial_portals).map(|_| Router::new(side)).collect();
        let portals = routers
            .iter()
            .map(|router| Portal::from_router(router.clone()))
            .collect();

        match mode {
            ConnectMode::BrokerToNonBroker => {
                let (memory, region) = NodeLinkMemory::allocate(self.arc(), num_initial_portals)
                    .ok_or(driver_api::DriverError::ResourceExhausted)?;
                let assigned_peer_name = NodeName::generate();
                let connector = Arc::new(Connector::new(
                    self.arc(),
                    transport.clone(),
                    routers,
                    ConnectorRole::Broker {
                        assigned_peer_name,
                        memory,
                        referral: None,
                    },
                ));
                transport.activate(connector)?;
                let greeting = NodeMessage::Connect {
                    name: self.assigned_name(),
                    assigned_name: assigned_peer_name,
                    protocol_version: PROTOCOL_VERSION,
                    num_initial_portals: num_initial_portals as u32,
                    has_primary_buffer: true,
                    referrer_name: NodeName::default(),
                };
                transport.transmit(TransportMessage::with_objects(
                    wire::encode(&greeting, 0),
                    vec![DriverObject::Memory(region)],
                ))?;
            }
            ConnectMode::NonBrokerToBroker | ConnectMode::InheritBroker => {
                let connector = Arc::new(Connector::new(
                    self.arc(),
                    transport.clone(),
                    routers,
                    ConnectorRole::NonBroker,
                ));
                transport.activate(connector)?;
                let greeting = NodeMessage::Connect {
                    name: NodeName::default(),
                    assigned_name: NodeName::default(),
                    protocol_version: PROTOCOL_VERSION,
                    num_initial_portals: num_initial_portals as u32,
                    has_primary_buffer: false,
                    referrer_name: NodeName::default(),
                };
                transport.transmit(TransportMessage::new(wire::encode(&greeting, 0)))?;
            }
            ConnectMode::ShareBroker => {
                let broker = self
                    .state
                    .lock()
                    .broker_link
                    .clone()
                    .ok_or(ConnectError::NoBroker)?;
                let node = self.arc();
                broker.request_indirect_broker_connection(
                    transport,
                    num_initial_portals as u32,
                    Box::new(move |outcome| match outcome {
                        Some((name, num_remote_portals)) => {
                            node.on_indirect_connection_established(
                                name,
                                routers,
                                num_remote_portals,
                            );
                        }
                        None => {
                            for router in routers {
                                router.accept_route_closure(
                                    LinkType::Central,
                                    SequenceNumber::ZERO,
                                );
                            }
                        }
                    }),
                );
            }
        }
        Ok(portals)
    }

    /// Tears down every link. Routers with outward links on those links
    /// observe disconnection; pending callbacks are released.
    pub fn shutdown(&self) {
        let (links, introductions, bindings) = {
            let mut state = self.state.lock();
            state.broker_link = None;
            state.allocation_delegate = None;
            (
                std::mem::take(&mut state.node_links),
                std::mem::take(&mut state.pending_introductions),
                std::mem::take(&mut state.pending_portal_bindings),
            )
        };
        for (_, link) in links {
            link.deactivate();
        }
        for (_, callbacks) in introductions {
            for callback in callbacks {
                callback(None);
            }
        }
        for (_, bindings) in bindings {
            for binding in bindings {
                for router in binding.routers {
                    router.accept_route_closure(LinkType::Central, SequenceNumber::ZERO);
                }
            }
        }
    }

    pub(crate) fn get_link(&self, name: NodeName) -> Option<Arc<NodeLink>> {
        self.state.lock().node_links.get(&name).cloned()
    }

    pub(crate) fn forget_link(&self, name: NodeName) {
        let mut state = self.state.lock();
        state.node_links.remove(&name);
        if state
            .broker_link
            .as_ref()
            .map_or(false, |link| link.remote_node_name() == name)
        {
            state.broker_link = None;
        }
        if state
            .allocation_delegate
            .as_ref()
            .map_or(false, |link| link.remote_node_name() == name)
        {
            state.allocation_delegate = None;
        }
    }

    fn add_link(&self, name: NodeName, link: Arc<NodeLink>) -> bool {
        let mut state = self.state.lock();
        if state.node_links.contains_key(&name) {
            return false;
        }
        state.node_links.insert(name, link);
        true
    }

    /// Finds or establishes a link to `name`, asking the broker for an
    /// introduction when necessary. The callback may run synchronously.
    pub(crate) fn establish_link(&self, name: NodeName, callback: EstablishLinkCallback) {
        if let Some(link) = self.get_link(name) {
            callback(Some(link));
            return;
        }

        if self.node_type == NodeType::Broker {
            // A broker knows everyone it can know.
            warn!("broker has no link to {}", name);
            callback(None);
            return;
        }

        let broker = {
            let mut state = self.state.lock();
            let Some(broker) = state.broker_link.clone() else {
                drop(state);
                warn!("cannot reach {} without a broker", name);
                callback(None);
                return;
            };
            let callbacks = state.pending_introductions.entry(name).or_default();
            let request_in_flight = !callbacks.is_empty();
            callbacks.push(callback);
            if request_in_flight {
                return;
            }
            broker
        };

        debug!("requesting introduction to {}", name);
        broker.request_introduction(name);
    }

    /// Allocates shared memory through the driver, or through the
    /// allocation delegate when one is set.
    pub(crate) fn allocate_shared_memory(&self, size: usize, callback: MemoryCallback) {
        let delegate = self.state.lock().allocation_delegate.clone();
        match delegate {
            Some(link) => link.request_memory(size as u32, callback),
            None => callback(self.driver.allocate_shared_memory(size).ok()),
        }
    }

    /// Broker-side handling of an introduction request from `from_link`.
    pub(crate) fn handle_request_introduction(
        &self,
        from_link: &NodeLink,
        name: NodeName,
    ) -> bool {
        if self.node_type != NodeType::Broker {
            return false;
        }

        let Some(other_link) = self.get_link(name) else {
            from_link.introduce_node_failure(name);
            return true;
        };

        let Some((t0, t1)) = self.driver.create_transport_pair().ok() else {
            from_link.introduce_node_failure(name);
            return true;
        };
        let Some(region) = self.make_introduction_buffer(0) else {
            from_link.introduce_node_failure(name);
            return true;
        };
        let Ok(region_dup) = region.duplicate() else {
            from_link.introduce_node_failure(name);
            return true;
        };

        debug!(
            "introducing {} and {}",
            from_link.remote_node_name(),
            name
        );
        other_link.introduce_node(from_link.remote_node_name(), LinkSide::A, t0, region_dup);
        from_link.introduce_node(name, LinkSide::B, t1, region);
        true
    }

    /// Allocates and formats a primary buffer for a link between two other
    /// nodes.
    fn make_introduction_buffer(
        &self,
        num_initial_portals: usize,
    ) -> Option<Arc<dyn SharedMemoryRegion>> {
        // The local pool is only used to format the buffer; the two
        // introduced nodes adopt it for themselves.
        let (_pool, region) = NodeLinkMemory::allocate(self.arc(), num_initial_portals)?;
        Some(region)
    }

    /// Handles an introduction (or introduction failure) from the broker.
    pub(crate) fn handle_introduce_node(
        &self,
        name: NodeName,
        link_side: LinkSide,
        transport: Option<Arc<dyn Transport>>,
        region: Option<Arc<dyn SharedMemoryRegion>>,
    ) -> bool {
        let (Some(transport), Some(region)) = (transport, region) else {
            // Introduction failed; release everything waiting on it.
            let (callbacks, bindings) = {
                let mut state = self.state.lock();
                (
                    state.pending_introductions.remove(&name).unwrap_or_default(),
                    state
                        .pending_portal_bindings
                        .remove(&name)
                        .unwrap_or_default(),
                )
            };
            for callback in callbacks {
                callback(None);
            }
            for binding in bindings {
                for router in binding.routers {
                    router.accept_route_closure(LinkType::Central, SequenceNumber::ZERO);
                }
            }
            return true;
        };

        let local_name = self.assigned_name();
        if !local_name.is_valid() {
            return false;
        }
        let Some(memory) = NodeLinkMemory::adopt(self.arc(), link_side, &region) else {
            return false;
        };
        let link = NodeLink::new(
            self.arc(),
            link_side,
            local_name,
            name,
            NodeType::Normal,
            transport,
            memory,
        );

        let (callbacks, bindings) = {
            let mut state = self.state.lock();
            if state.node_links.contains_key(&name) {
                // Already introduced; nothing further to do.
                return true;
            }
            state.node_links.insert(name, link.clone());
            (
                state.pending_introductions.remove(&name).unwrap_or_default(),
                state
                    .pending_portal_bindings
                    .remove(&name)
                    .unwrap_or_default(),
            )
        };

        debug!("{} received introduction to {}", local_name, name);
        NodeLink::activate(&link);

        for callback in callbacks {
            callback(Some(link.clone()));
        }
        for binding in bindings {
            bind_initial_portals(&link, binding.routers, binding.remote_count);
        }
        true
    }

    /// Broker-side handling of a forwarded transport from `from_link`: run
    /// the admission handshake with the new node on that transport, then
    /// introduce it back to the referrer.
    pub(crate) fn handle_request_indirect_broker_connection(
        &self,
        from_link: &Arc<NodeLink>,
        request_id: u64,
        transport: Arc<dyn Transport>,
        num_initial_portals: u32,
    ) -> bool {
        if self.node_type != NodeType::Broker {
            return false;
        }

        let Some((memory, region)) = NodeLinkMemory::allocate(self.arc(), 0) else {
            return false;
        };
        let assigned_peer_name = NodeName::generate();
        let referrer_name = from_link.remote_node_name();
        let connector = Arc::new(Connector::new(
            self.arc(),
            transport.clone(),
            Vec::new(),
            ConnectorRole::Broker {
                assigned_peer_name,
                memory,
                referral: Some(Referral {
                    referrer: from_link.clone(),
                    request_id,
                    referrer_portal_count: num_initial_portals,
                }),
            },
        ));
        if transport.activate(connector).is_err() {
            return false;
        }

        let greeting = NodeMessage::Connect {
            name: self.assigned_name(),
            assigned_name: assigned_peer_name,
            protocol_version: PROTOCOL_VERSION,
            num_initial_portals,
            has_primary_buffer: true,
            referrer_name,
        };
        transport
            .transmit(TransportMessage::with_objects(
                wire::encode(&greeting, 0),
                vec![DriverObject::Memory(region)],
            ))
            .is_ok()
    }

    /// The broker admitted the node we referred; its portals now wait for
    /// the introduction link.
    fn on_indirect_connection_established(
        &self,
        name: NodeName,
        routers: Vec<Arc<Router>>,
        remote_count: u32,
    ) {
        if let Some(link) = self.get_link(name) {
            bind_initial_portals(&link, routers, remote_count);
            return;
        }
        self.state
            .lock()
            .pending_portal_bindings
            .entry(name)
            .or_default()
            .push(PortalBinding {
                routers,
                remote_count,
            });
    }

    fn set_broker_link(&self, link: Arc<NodeLink>) {
        let mut state = self.state.lock();
        state.broker_link = Some(link.clone());
        // Non-brokers lean on the broker for shared memory so allocation
        // behaves uniformly regardless of local driver capability.
        state.allocation_delegate = Some(link);
    }
}

/// Binds parked initial-portal routers to the fixed link-state cells of a
/// fresh link, closing any excess portals the other side does not match.
fn bind_initial_portals(link: &Arc<NodeLink>, routers: Vec<Arc<Router>>, remote_count: u32) {
    let n = routers.len().min(remote_count as usize);
    for (i, router) in routers.into_iter().enumerate() {
        if i < n {
            let fragment = link.memory().initial_router_link_state(i);
            let Some(remote_link) = link.add_remote_router_link(
                SublinkId::from_u64(i as u64),
                Some(fragment),
                LinkType::Central,
                link.link_side(),
                router.clone(),
            ) else {
                router.accept_route_closure(LinkType::Central, SequenceNumber::ZERO);
                continue;
            };
            router.set_outward_link(remote_link as Arc<dyn RouterLink>);
        } else {
            // The other side opened fewer initial portals; this one behaves
            // as if its peer closed immediately.
            router.accept_route_closure(LinkType::Central, SequenceNumber::ZERO);
        }
    }
}

struct Referral {
    referrer: Arc<NodeLink>,
    request_id: u64,
    referrer_portal_count: u32,
}

enum ConnectorRole {
    Broker {
        assigned_peer_name: NodeName,
        memory: Arc<NodeLinkMemory>,
        referral: Option<Referral>,
    },
    NonBroker,
}

/// Bootstrap listener for a connecting transport: completes the one-message
/// handshake, builds the node-link, then forwards all further traffic to
/// it.
struct Connector {
    node: Arc<Node>,
    transport: Arc<dyn Transport>,
    state: Mutex<ConnectorState>,
}

struct ConnectorState {
    role: Option<ConnectorRole>,
    portal_routers: Vec<Arc<Router>>,
    established: Option<Arc<NodeLink>>,
}

impl Connector {
    fn new(
        node: Arc<Node>,
        transport: Arc<dyn Transport>,
        portal_routers: Vec<Arc<Router>>,
        role: ConnectorRole,
    ) -> Connector {
        Connector {
            node,
            transport,
            state: Mutex::new(ConnectorState {
                role: Some(role),
                portal_routers,
                established: None,
            }),
        }
    }

    fn fail(&self) {
        let (role, routers) = {
            let mut state = self.state.lock();
            (state.role.take(), std::mem::take(&mut state.portal_routers))
        };
        for router in routers {
            router.accept_route_closure(LinkType::Central, SequenceNumber::ZERO);
        }
        if let Some(ConnectorRole::Broker {
            referral: Some(referral),
            ..
        }) = role
        {
            referral.referrer.transmit_message(
                NodeMessage::AcceptIndirectBrokerConnection {
                    request_id: referral.request_id,
                    success: false,
                    name: NodeName::default(),
                    num_remote_portals: 0,
                },
                Vec::new(),
            );
        }
    }

    fn complete(
        &self,
        peer_name: NodeName,
        assigned_name: NodeName,
        num_remote_portals: u32,
        referrer_name: NodeName,
        objects: Vec<DriverObject>,
    ) -> Result<(), ProtocolViolation> {
        let (role, routers) = {
            let mut state = self.state.lock();
            let Some(role) = state.role.take() else {
                // A second Connect greeting is hostile.
                return Err(ProtocolViolation);
            };
            (role, std::mem::take(&mut state.portal_routers))
        };

        match role {
            ConnectorRole::Broker {
                assigned_peer_name,
                memory,
                referral,
            } => {
                let link = NodeLink::new(
                    self.node.clone(),
                    LinkSide::A,
                    self.node.assigned_name(),
                    assigned_peer_name,
                    NodeType::Normal,
                    self.transport.clone(),
                    memory,
                );
                self.node.add_link(assigned_peer_name, link.clone());
                self.state.lock().established = Some(link.clone());
                bind_initial_portals(&link, routers, num_remote_portals);

                if let Some(referral) = referral {
                    referral.referrer.transmit_message(
                        NodeMessage::AcceptIndirectBrokerConnection {
                            request_id: referral.request_id,
                            success: true,
                            name: assigned_peer_name,
                            num_remote_portals,
                        },
                        Vec::new(),
                    );
                    self.introduce_referred_nodes(
                        &referral,
                        &link,
                        referral
                            .referrer_portal_count
                            .min(num_remote_portals),
                    );
                }
                Ok(())
            }
            ConnectorRole::NonBroker => {
                if !peer_name.is_valid() || !assigned_name.is_valid() {
                    return Err(ProtocolViolation);
                }
                let mut objects = objects.into_iter();
                let Some(DriverObject::Memory(region)) = objects.next() else {
                    return Err(ProtocolViolation);
                };
                let Some(memory) =
                    NodeLinkMemory::adopt(self.node.clone(), LinkSide::B, &region)
                else {
                    return Err(ProtocolViolation);
                };
                self.node.set_assigned_name(assigned_name);
                let link = NodeLink::new(
                    self.node.clone(),
                    LinkSide::B,
                    self.node.assigned_name(),
                    peer_name,
                    NodeType::Broker,
                    self.transport.clone(),
                    memory,
                );
                self.node.add_link(peer_name, link.clone());
                self.node.set_broker_link(link.clone());
                self.state.lock().established = Some(link.clone());

                if referrer_name.is_valid() {
                    // Our portals pair with the referrer's, not the
                    // broker's; they wait for that introduction.
                    if !routers.is_empty() {
                        self.node
                            .state
                            .lock()
                            .pending_portal_bindings
                            .entry(referrer_name)
                            .or_default()
                            .push(PortalBinding {
                                routers,
                                remote_count: num_remote_portals,
                            });
                    }
                } else {
                    bind_initial_portals(&link, routers, num_remote_portals);
                }
                Ok(())
            }
        }
    }

    /// Completes an indirect admission by introducing the new node and its
    /// referrer to each other, with portal slots for both sides.
    fn introduce_referred_nodes(
        &self,
        referral: &Referral,
        new_link: &Arc<NodeLink>,
        num_portals: u32,
    ) {
        let Ok((t0, t1)) = self.node.driver().create_transport_pair() else {
            return;
        };
        let Some(region) = self.node.make_introduction_buffer(num_portals as usize) else {
            return;
        };
        let Ok(region_dup) = region.duplicate() else {
            return;
        };
        new_link.introduce_node(
            referral.referrer.remote_node_name(),
            LinkSide::A,
            t0,
            region_dup,
        );
        referral
            .referrer
            .introduce_node(new_link.remote_node_name(), LinkSide::B, t1, region);
    }
}

impl TransportListener for Connector {
    fn on_message(&self, message: TransportMessage) -> Result<(), ProtocolViolation> {
        let established = self.state.lock().established.clone();
        if let Some(link) = established {
            return link.on_message(message);
        }

        match wire::decode(&message.data) {
            Err(_) => Err(ProtocolViolation),
            Ok(None) => Ok(()),
            Ok(Some((
                _,
                NodeMessage::Connect {
                    name,
                    assigned_name,
                    protocol_version: _,
                    num_initial_portals,
                    has_primary_buffer: _,
                    referrer_name,
                },
            ))) => {
                if num_initial_portals as usize > MAX_INITIAL_PORTALS {
                    return Err(ProtocolViolation);
                }
                self.complete(
                    name,
                    assigned_name,
                    num_initial_portals,
                    referrer_name,
                    message.objects,
                )
            }
            Ok(Some(_)) => {
                // Anything else before the greeting is hostile.
                Err(ProtocolViolation)
            }
        }
    }

    fn on_error(&self) {
        let established = self.state.lock().established.clone();
        match established {
            Some(link) => link.on_error(),
            None => self.fail(),
        }
    }
}
