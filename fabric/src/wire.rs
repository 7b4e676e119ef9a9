//! The node-to-node wire protocol.
//!
//! Every frame is one message: a fixed 16-byte header followed by a
//! fixed-layout parameter block and length-prefixed inline arrays. All
//! multi-byte fields are little-endian. Driver object attachments travel
//! out-of-band in the transport's object table; messages reference them by
//! position. Unknown message ids are ignored by receivers; structurally
//! malformed frames are protocol violations and deactivate the link.

use crate::memory::FragmentDescriptor;
use core_types::{BufferId, LinkSide, NodeName, SequenceNumber, Side, SublinkId};
use thiserror::Error;
use zerocopy::byteorder::{LittleEndian, U32, U64};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

/// Version of the protocol defined by this module.
pub const PROTOCOL_VERSION: u8 = 0;

pub const HEADER_SIZE: usize = 16;

/// Leads every frame.
#[derive(Debug, Clone, Copy, FromZeroes, FromBytes, AsBytes)]
#[repr(C)]
pub struct MessageHeader {
    /// Total frame size, header included. Bytes past this are preserved
    /// opaquely by forwarders and ignored here.
    pub total_size: U32<LittleEndian>,
    pub message_id: u8,
    pub version: u8,
    pub reserved: [u8; 2],
    /// Transport-scope sequence number; guards against reordering between
    /// the transport and any auxiliary delivery channel.
    pub sequence_number: U64<LittleEndian>,
}

static_assertions::const_assert_eq!(std::mem::size_of::<MessageHeader>(), HEADER_SIZE);

mod id {
    pub const CONNECT: u8 = 0;
    pub const REQUEST_INTRODUCTION: u8 = 1;
    pub const INTRODUCE_NODE: u8 = 2;
    pub const REQUEST_INDIRECT_BROKER_CONNECTION: u8 = 3;
    pub const ACCEPT_INDIRECT_BROKER_CONNECTION: u8 = 4;
    pub const REQUEST_MEMORY: u8 = 5;
    pub const PROVIDE_MEMORY: u8 = 6;
    pub const ADD_FRAGMENT_ALLOCATOR_BUFFER: u8 = 7;
    pub const ACCEPT_PARCEL: u8 = 8;
    pub const ROUTE_CLOSED: u8 = 9;
    pub const SET_ROUTER_LINK_STATE_FRAGMENT: u8 = 10;
    pub const FLUSH_ROUTER: u8 = 11;
    pub const INITIATE_PROXY_BYPASS: u8 = 12;
    pub const BYPASS_PROXY: u8 = 13;
    pub const BYPASS_PROXY_TO_SAME_NODE: u8 = 14;
    pub const STOP_PROXYING: u8 = 15;
    pub const STOP_PROXYING_TO_LOCAL_PEER: u8 = 16;
    pub const PROXY_WILL_STOP: u8 = 17;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("truncated message")]
    Truncated,
    #[error("malformed message field")]
    Malformed,
}

/// Describes a router being extended onto the receiving node inside an
/// `AcceptParcel` message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouterDescriptor {
    /// Route side inherited by the new router.
    pub side: Side,
    /// Sublink binding the new router to its sender-side counterpart.
    pub new_sublink: SublinkId,
    /// With `proxy_already_bypassed`, the extra sublink draining parcels
    /// already queued at the sender.
    pub new_decaying_sublink: Option<SublinkId>,
    /// Shared state cell for the new central link, when central.
    pub new_link_state_fragment: Option<FragmentDescriptor>,
    /// The sender split a stable local pair: the new router's outward link
    /// is already direct and only the decaying sublink needs draining.
    pub proxy_already_bypassed: bool,
    pub next_outgoing_sequence_number: SequenceNumber,
    pub next_incoming_sequence_number: SequenceNumber,
    /// With `proxy_already_bypassed`, the inbound length at which the
    /// decaying sublink stops.
    pub decaying_incoming_sequence_length: SequenceNumber,
    pub peer_closed: bool,
    pub closed_peer_sequence_length: SequenceNumber,
    /// When valid, the new router may immediately initiate bypass of the
    /// sender against this peer.
    pub proxy_peer_node_name: NodeName,
    pub proxy_peer_sublink: SublinkId,
}

impl Default for RouterDescriptor {
    fn default() -> Self {
        Self {
            side: Side::A,
            new_sublink: SublinkId::from_u64(0),
            new_decaying_sublink: None,
            new_link_state_fragment: None,
            proxy_already_bypassed: false,
            next_outgoing_sequence_number: SequenceNumber::ZERO,
            next_incoming_sequence_number: SequenceNumber::ZERO,
            decaying_incoming_sequence_length: SequenceNumber::ZERO,
            peer_closed: false,
            closed_peer_sequence_length: SequenceNumber::ZERO,
            proxy_peer_node_name: NodeName::default(),
            proxy_peer_sublink: SublinkId::from_u64(0),
        }
    }
}

/// One attachment slot of an `AcceptParcel` frame, in parcel order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireObject {
    /// A transferred portal, described inline.
    Portal(RouterDescriptor),
    /// A boxed driver object: driver-serialized bytes plus the number of
    /// driver objects it consumes from the transport's object table.
    Box { data: Vec<u8>, num_attachments: u32 },
}

/// The control-plane message set, protocol version 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeMessage {
    /// Greeting exchanged over a fresh transport. The broker side attaches
    /// the primary buffer region and assigns the receiver its name.
    Connect {
        name: NodeName,
        assigned_name: NodeName,
        protocol_version: u8,
        num_initial_portals: u32,
        has_primary_buffer: bool,
        /// Valid only when the sender is a broker admitting a node referred
        /// by another non-broker; names the referrer whose link the
        /// receiver's initial portals should wait for.
        referrer_name: NodeName,
    },
    /// Ask the broker to link us with `name`.
    RequestIntroduction { name: NodeName },
    /// Broker response linking two nodes. When `known`, a fresh transport
    /// and primary buffer are attached.
    IntroduceNode {
        name: NodeName,
        known: bool,
        link_side: LinkSide,
    },
    /// A non-broker forwards a new node's transport to the broker for
    /// admission. The transport is attached.
    RequestIndirectBrokerConnection {
        request_id: u64,
        num_initial_portals: u32,
    },
    /// Broker's answer to `RequestIndirectBrokerConnection`.
    AcceptIndirectBrokerConnection {
        request_id: u64,
        success: bool,
        name: NodeName,
        num_remote_portals: u32,
    },
    /// Ask the other side to allocate a region of `size` bytes.
    RequestMemory { size: u32 },
    /// Fulfills `RequestMemory`; the region is attached.
    ProvideMemory { size: u32 },
    /// Grants a new fragment allocator buffer; the region is attached.
    AddFragmentAllocatorBuffer {
        buffer_id: BufferId,
        fragment_size: u32,
    },
    /// A parcel for the router bound to `sublink`.
    AcceptParcel {
        sublink: SublinkId,
        sequence_number: SequenceNumber,
        data: Vec<u8>,
        objects: Vec<WireObject>,
    },
    /// One side of the route closed after `sequence_length` parcels.
    RouteClosed {
        sublink: SublinkId,
        sequence_length: SequenceNumber,
    },
    /// Announces the shared state cell for a central link whose side A
    /// allocated it after link creation.
    SetRouterLinkStateFragment {
        sublink: SublinkId,
        descriptor: FragmentDescriptor,
    },
    /// Ask the router on `sublink` to flush; sent when the other side was
    /// waiting for this side to become stable.
    FlushRouter { sublink: SublinkId },
    /// Tell the successor of a proxy to start the proxy's bypass by
    /// reaching out to the proxy's outward peer.
    InitiateProxyBypass {
        sublink: SublinkId,
        proxy_peer_name: NodeName,
        proxy_peer_sublink: SublinkId,
    },
    /// Ask the receiver to replace its link to `proxy_name` with a direct
    /// link to the sender on `new_sublink`.
    BypassProxy {
        proxy_name: NodeName,
        proxy_sublink: SublinkId,
        new_sublink: SublinkId,
        new_link_state_fragment: Option<FragmentDescriptor>,
        proxy_outbound_sequence_length: SequenceNumber,
    },
    /// Bypass of a proxy whose outward peer shares the proxy's node.
    BypassProxyToSameNode {
        sublink: SublinkId,
        new_sublink: SublinkId,
        new_link_state_fragment: Option<FragmentDescriptor>,
        proxy_inbound_sequence_length: SequenceNumber,
    },
    /// The proxy on `sublink` may die once it has forwarded up to the given
    /// lengths in each direction.
    StopProxying {
        sublink: SublinkId,
        proxy_inbound_sequence_length: SequenceNumber,
        proxy_outbound_sequence_length: SequenceNumber,
    },
    /// Reply to `BypassProxyToSameNode`.
    StopProxyingToLocalPeer {
        sublink: SublinkId,
        proxy_outbound_sequence_length: SequenceNumber,
    },
    /// The bypassed proxy will stop sending at the given inbound length.
    ProxyWillStop {
        sublink: SublinkId,
        proxy_inbound_sequence_length: SequenceNumber,
    },
}

impl NodeMessage {
    fn message_id(&self) -> u8 {
        match self {
            NodeMessage::Connect { .. } => id::CONNECT,
            NodeMessage::RequestIntroduction { .. } => id::REQUEST_INTRODUCTION,
            NodeMessage::IntroduceNode { .. } => id::INTRODUCE_NODE,
            NodeMessage::RequestIndirectBrokerConnection { .. } => {
                id::REQUEST_INDIRECT_BROKER_CONNECTION
            }
            NodeMessage::AcceptIndirectBrokerConnection { .. } => {
                id::ACCEPT_INDIRECT_BROKER_CONNECTION
            }
            NodeMessage::RequestMemory { .. } => id::REQUEST_MEMORY,
            NodeMessage::ProvideMemory { .. } => id::PROVIDE_MEMORY,
            NodeMessage::AddFragmentAllocatorBuffer { .. } => id::ADD_FRAGMENT_ALLOCATOR_BUFFER,
            NodeMessage::AcceptParcel { .. } => id::ACCEPT_PARCEL,
            NodeMessage::RouteClosed { .. } => id::ROUTE_CLOSED,
            NodeMessage::SetRouterLinkStateFragment { .. } => id::SET_ROUTER_LINK_STATE_FRAGMENT,
            NodeMessage::FlushRouter { .. } => id::FLUSH_ROUTER,
            NodeMessage::InitiateProxyBypass { .. } => id::INITIATE_PROXY_BYPASS,
            NodeMessage::BypassProxy { .. } => id::BYPASS_PROXY,
            NodeMessage::BypassProxyToSameNode { .. } => id::BYPASS_PROXY_TO_SAME_NODE,
            NodeMessage::StopProxying { .. } => id::STOP_PROXYING,
            NodeMessage::StopProxyingToLocalPeer { .. } => id::STOP_PROXYING_TO_LOCAL_PEER,
            NodeMessage::ProxyWillStop { .. } => id::PROXY_WILL_STOP,
        }
    }
}

struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    fn new() -> Self {
        Self {
            buf: vec![0; HEADER_SIZE],
        }
    }

    fn put_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    fn put_bool(&mut self, value: bool) {
        self.buf.push(value as u8);
    }

    fn put_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    fn put_u64(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    fn put_name(&mut self, name: NodeName) {
        self.buf.extend_from_slice(&name.to_bytes());
    }

    fn put_sublink(&mut self, sublink: SublinkId) {
        self.put_u64(sublink.value());
    }

    fn put_seq(&mut self, n: SequenceNumber) {
        self.put_u64(n.value());
    }

    fn put_bytes(&mut self, bytes: &[u8]) {
        self.put_u32(bytes.len() as u32);
        self.buf.extend_from_slice(bytes);
    }

    fn put_opt_fragment(&mut self, fragment: Option<FragmentDescriptor>) {
        match fragment {
            Some(descriptor) => {
                self.put_u8(1);
                self.put_u64(descriptor.buffer.value());
                self.put_u32(descriptor.offset);
                self.put_u32(descriptor.size);
            }
            None => {
                self.put_u8(0);
                self.put_u64(0);
                self.put_u32(0);
                self.put_u32(0);
            }
        }
    }

    fn put_opt_sublink(&mut self, sublink: Option<SublinkId>) {
        match sublink {
            Some(sublink) => {
                self.put_u8(1);
                self.put_sublink(sublink);
            }
            None => {
                self.put_u8(0);
                self.put_u64(0);
            }
        }
    }

    fn put_descriptor(&mut self, descriptor: &RouterDescriptor) {
        self.put_u8(match descriptor.side {
            Side::A => 0,
            Side::B => 1,
        });
        self.put_sublink(descriptor.new_sublink);
        self.put_opt_sublink(descriptor.new_decaying_sublink);
        self.put_opt_fragment(descriptor.new_link_state_fragment);
        self.put_bool(descriptor.proxy_already_bypassed);
        self.put_seq(descriptor.next_outgoing_sequence_number);
        self.put_seq(descriptor.next_incoming_sequence_number);
        self.put_seq(descriptor.decaying_incoming_sequence_length);
        self.put_bool(descriptor.peer_closed);
        self.put_seq(descriptor.closed_peer_sequence_length);
        self.put_name(descriptor.proxy_peer_node_name);
        self.put_sublink(descriptor.proxy_peer_sublink);
    }

    fn finish(mut self, message_id: u8, sequence_number: u64) -> Vec<u8> {
        let header = MessageHeader {
            total_size: U32::new(self.buf.len() as u32),
            message_id,
            version: PROTOCOL_VERSION,
            reserved: [0; 2],
            sequence_number: U64::new(sequence_number),
        };
        self.buf[..HEADER_SIZE].copy_from_slice(header.as_bytes());
        self.buf
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], WireError> {
        if self.buf.len() - self.pos < len {
            return Err(WireError::Truncated);
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    fn bool(&mut self) -> Result<bool, WireError> {
        match self.u8()? {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(WireError::Malformed),
        }
    }

    fn u32(&mut self) -> Result<u32, WireError> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64, WireError> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn name(&mut self) -> Result<NodeName, WireError> {
        Ok(NodeName::from_bytes(self.take(16)?.try_into().unwrap()))
    }

    fn sublink(&mut self) -> Result<SublinkId, WireError> {
        Ok(SublinkId::from_u64(self.u64()?))
    }

    fn seq(&mut self) -> Result<SequenceNumber, WireError> {
        Ok(SequenceNumber::new(self.u64()?))
    }

    fn bytes(&mut self) -> Result<Vec<u8>, WireError> {
        let len = self.u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    fn opt_fragment(&mut self) -> Result<Option<FragmentDescriptor>, WireError> {
        let present = self.bool()?;
        let buffer = self.u64()?;
        let offset = self.u32()?;
        let size = self.u32()?;
        Ok(present.then(|| FragmentDescriptor::new(BufferId::from_u64(buffer), offset, size)))
    }

    fn opt_sublink(&mut self) -> Result<Option<SublinkId>, WireError> {
        let present = self.bool()?;
        let value = self.u64()?;
        Ok(present.then(|| SublinkId::from_u64(value)))
    }

    fn descriptor(&mut self) -> Result<RouterDescriptor, WireError> {
        Ok(RouterDescriptor {
            side: match self.u8()? {
                0 => Side::A,
                1 => Side::B,
                _ => return Err(WireError::Malformed),
            },
            new_sublink: self.sublink()?,
            new_decaying_sublink: self.opt_sublink()?,
            new_link_state_fragment: self.opt_fragment()?,
            proxy_already_bypassed: self.bool()?,
            next_outgoing_sequence_number: self.seq()?,
            next_incoming_sequence_number: self.seq()?,
            decaying_incoming_sequence_length: self.seq()?,
            peer_closed: self.bool()?,
            closed_peer_sequence_length: self.seq()?,
            proxy_peer_node_name: self.name()?,
            proxy_peer_sublink: self.sublink()?,
        })
    }
}

/// Encodes `message` as one frame carrying transport sequence number
/// `sequence_number`.
pub fn encode(message: &NodeMessage, sequence_number: u64) -> Vec<u8> {
    let mut w = Writer::new();
    match message {
        NodeMessage::Connect {
            name,
            assigned_name,
            protocol_version,
            num_initial_portals,
            has_primary_buffer,
            referrer_name,
        } => {
            w.put_name(*name);
            w.put_name(*assigned_name);
            w.put_u8(*protocol_version);
            w.put_u32(*num_initial_portals);
            w.put_bool(*has_primary_buffer);
            w.put_name(*referrer_name);
        }
        NodeMessage::RequestIntroduction { name } => {
            w.put_name(*name);
        }
        NodeMessage::IntroduceNode {
            name,
            known,
            link_side,
        } => {
            w.put_name(*name);
            w.put_bool(*known);
            w.put_u8(link_side.to_wire());
        }
        NodeMessage::RequestIndirectBrokerConnection {
            request_id,
            num_initial_portals,
        } => {
            w.put_u64(*request_id);
            w.put_u32(*num_initial_portals);
        }
        NodeMessage::AcceptIndirectBrokerConnection {
            request_id,
            success,
            name,
            num_remote_portals,
        } => {
            w.put_u64(*request_id);
            w.put_bool(*success);
            w.put_name(*name);
            w.put_u32(*num_remote_portals);
        }
        NodeMessage::RequestMemory { size } => {
            w.put_u32(*size);
        }
        NodeMessage::ProvideMemory { size } => {
            w.put_u32(*size);
        }
        NodeMessage::AddFragmentAllocatorBuffer {
            buffer_id,
            fragment_size,
        } => {
            w.put_u64(buffer_id.value());
            w.put_u32(*fragment_size);
        }
        NodeMessage::AcceptParcel {
            sublink,
            sequence_number,
            data,
            objects,
        } => {
            w.put_sublink(*sublink);
            w.put_seq(*sequence_number);
            w.put_bytes(data);
            w.put_u32(objects.len() as u32);
            for object in objects {
                match object {
                    WireObject::Portal(descriptor) => {
                        w.put_u8(0);
                        w.put_descriptor(descriptor);
                    }
                    WireObject::Box {
                        data,
                        num_attachments,
                    } => {
                        w.put_u8(1);
                        w.put_bytes(data);
                        w.put_u32(*num_attachments);
                    }
                }
            }
        }
        NodeMessage::RouteClosed {
            sublink,
            sequence_length,
        } => {
            w.put_sublink(*sublink);
            w.put_seq(*sequence_length);
        }
        NodeMessage::SetRouterLinkStateFragment {
            sublink,
            descriptor,
        } => {
            w.put_sublink(*sublink);
            w.put_opt_fragment(Some(*descriptor));
        }
        NodeMessage::FlushRouter { sublink } => {
            w.put_sublink(*sublink);
        }
        NodeMessage::InitiateProxyBypass {
            sublink,
            proxy_peer_name,
            proxy_peer_sublink,
        } => {
            w.put_sublink(*sublink);
            w.put_name(*proxy_peer_name);
            w.put_sublink(*proxy_peer_sublink);
        }
        NodeMessage::BypassProxy {
            proxy_name,
            proxy_sublink,
            new_sublink,
            new_link_state_fragment,
            proxy_outbound_sequence_length,
        } => {
            w.put_name(*proxy_name);
            w.put_sublink(*proxy_sublink);
            w.put_sublink(*new_sublink);
            w.put_opt_fragment(*new_link_state_fragment);
            w.put_seq(*proxy_outbound_sequence_length);
        }
        NodeMessage::BypassProxyToSameNode {
            sublink,
            new_sublink,
            new_link_state_fragment,
            proxy_inbound_sequence_length,
        } => {
            w.put_sublink(*sublink);
            w.put_sublink(*new_sublink);
            w.put_opt_fragment(*new_link_state_fragment);
            w.put_seq(*proxy_inbound_sequence_length);
        }
        NodeMessage::StopProxying {
            sublink,
            proxy_inbound_sequence_length,
            proxy_outbound_sequence_length,
        } => {
            w.put_sublink(*sublink);
            w.put_seq(*proxy_inbound_sequence_length);
            w.put_seq(*proxy_outbound_sequence_length);
        }
        NodeMessage::StopProxyingToLocalPeer {
            sublink,
            proxy_outbound_sequence_length,
        } => {
            w.put_sublink(*sublink);
            w.put_seq(*proxy_outbound_sequence_length);
        }
        NodeMessage::ProxyWillStop {
            sublink,
            proxy_inbound_sequence_length,
        } => {
            w.put_sublink(*sublink);
            w.put_seq(*proxy_inbound_sequence_length);
        }
    }
    w.finish(message.message_id(), sequence_number)
}

/// Decodes one frame. `Ok(None)` means the message id is unknown and the
/// frame should be ignored; errors are protocol violations.
pub fn decode(frame: &[u8]) -> Result<Option<(u64, NodeMessage)>, WireError> {
    let Some(header) = MessageHeader::read_from_prefix(frame) else {
        return Err(WireError::Truncated);
    };
    let total_size = header.total_size.get() as usize;
    if total_size < HEADER_SIZE || total_size > frame.len() {
        return Err(WireError::Truncated);
    }

    let sequence_number = header.sequence_number.get();
    let mut r = Reader::new(&frame[HEADER_SIZE..total_size]);
    let message = match header.message_id {
        id::CONNECT => NodeMessage::Connect {
            name: r.name()?,
            assigned_name: r.name()?,
            protocol_version: r.u8()?,
            num_initial_portals: r.u32()?,
            has_primary_buffer: r.bool()?,
            referrer_name: r.name()?,
        },
        id::REQUEST_INTRODUCTION => NodeMessage::RequestIntroduction { name: r.name()? },
        id::INTRODUCE_NODE => NodeMessage::IntroduceNode {
            name: r.name()?,
            known: r.bool()?,
            link_side: LinkSide::from_wire(r.u8()?).ok_or(WireError::Malformed)?,
        },
        id::REQUEST_INDIRECT_BROKER_CONNECTION => NodeMessage::RequestIndirectBrokerConnection {
            request_id: r.u64()?,
            num_initial_portals: r.u32()?,
        },
        id::ACCEPT_INDIRECT_BROKER_CONNECTION => NodeMessage::AcceptIndirectBrokerConnection {
            request_id: r.u64()?,
            success: r.bool()?,
            name: r.name()?,
            num_remote_portals: r.u32()?,
        },
        id::REQUEST_MEMORY => NodeMessage::RequestMemory { size: r.u32()? },
        id::PROVIDE_MEMORY => NodeMessage::ProvideMemory { size: r.u32()? },
        id::ADD_FRAGMENT_ALLOCATOR_BUFFER => NodeMessage::AddFragmentAllocatorBuffer {
            buffer_id: BufferId::from_u64(r.u64()?),
            fragment_size: r.u32()?,
        },
        id::ACCEPT_PARCEL => {
            let sublink = r.sublink()?;
            let sequence_number = r.seq()?;
            let data = r.bytes()?;
            let num_objects = r.u32()?;
            let mut objects = Vec::new();
            for _ in 0..num_objects {
                let object = match r.u8()? {
                    0 => WireObject::Portal(r.descriptor()?),
                    1 => WireObject::Box {
                        data: r.bytes()?,
                        num_attachments: r.u32()?,
                    },
                    _ => return Err(WireError::Malformed),
                };
                objects.push(object);
            }
            NodeMessage::AcceptParcel {
                sublink,
                sequence_number,
                data,
                objects,
            }
        }
        id::ROUTE_CLOSED => NodeMessage::RouteClosed {
            sublink: r.sublink()?,
            sequence_length: r.seq()?,
        },
        id::SET_ROUTER_LINK_STATE_FRAGMENT => {
            let sublink = r.sublink()?;
            let descriptor = r.opt_fragment()?.ok_or(WireError::Malformed)?;
            NodeMessage::SetRouterLinkStateFragment {
                sublink,
                descriptor,
            }
        }
        id::FLUSH_ROUTER => NodeMessage::FlushRouter {
            sublink: r.sublink()?,
        },
        id::INITIATE_PROXY_BYPASS => NodeMessage::InitiateProxyBypass {
            sublink: r.sublink()?,
            proxy_peer_name: r.name()?,
            proxy_peer_sublink: r.sublink()?,
        },
        id::BYPASS_PROXY => NodeMessage::BypassProxy {
            proxy_name: r.name()?,
            proxy_sublink: r.sublink()?,
            new_sublink: r.sublink()?,
            new_link_state_fragment: r.opt_fragment()?,
            proxy_outbound_sequence_length: r.seq()?,
        },
        id::BYPASS_PROXY_TO_SAME_NODE => NodeMessage::BypassProxyToSameNode {
            sublink: r.sublink()?,
            new_sublink: r.sublink()?,
            new_link_state_fragment: r.opt_fragment()?,
            proxy_inbound_sequence_length: r.seq()?,
        },
        id::STOP_PROXYING => NodeMessage::StopProxying {
            sublink: r.sublink()?,
            proxy_inbound_sequence_length: r.seq()?,
            proxy_outbound_sequence_length: r.seq()?,
        },
        id::STOP_PROXYING_TO_LOCAL_PEER => NodeMessage::StopProxyingToLocalPeer {
            sublink: r.sublink()?,
            proxy_outbound_sequence_length: r.seq()?,
        },
        id::PROXY_WILL_STOP => NodeMessage::ProxyWillStop {
            sublink: r.sublink()?,
            proxy_inbound_sequence_length: r.seq()?,
        },
        _ => return Ok(None),
    };
    Ok(Some((sequence_number, message)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(message: NodeMessage) {
        let frame = encode(&message, 42);
        let (seq, decoded) = decode(&frame).unwrap().unwrap();
        assert_eq!(seq, 42);
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_connect_round_trip() {
        round_trip(NodeMessage::Connect {
            name: NodeName::generate(),
            assigned_name: NodeName::generate(),
            protocol_version: PROTOCOL_VERSION,
            num_initial_portals: 2,
            has_primary_buffer: true,
            referrer_name: NodeName::default(),
        });
    }

    #[test]
    fn test_accept_parcel_round_trip() {
        let descriptor = RouterDescriptor {
            side: Side::B,
            new_sublink: SublinkId::from_u64(7),
            new_decaying_sublink: Some(SublinkId::from_u64(8)),
            new_link_state_fragment: Some(FragmentDescriptor::new(
                BufferId::from_u64(3),
                128,
                64,
            )),
            proxy_already_bypassed: true,
            next_outgoing_sequence_number: SequenceNumber::new(5),
            next_incoming_sequence_number: SequenceNumber::new(9),
            decaying_incoming_sequence_length: SequenceNumber::new(9),
            peer_closed: false,
            closed_peer_sequence_length: SequenceNumber::ZERO,
            proxy_peer_node_name: NodeName::generate(),
            proxy_peer_sublink: SublinkId::from_u64(2),
        };
        round_trip(NodeMessage::AcceptParcel {
            sublink: SublinkId::from_u64(1),
            sequence_number: SequenceNumber::new(77),
            data: b"hello there".to_vec(),
            objects: vec![
                WireObject::Portal(descriptor),
                WireObject::Box {
                    data: b"blob".to_vec(),
                    num_attachments: 0,
                },
            ],
        });
    }

    #[test]
    fn test_bypass_messages_round_trip() {
        round_trip(NodeMessage::BypassProxy {
            proxy_name: NodeName::generate(),
            proxy_sublink: SublinkId::from_u64(4),
            new_sublink: SublinkId::from_u64(11),
            new_link_state_fragment: None,
            proxy_outbound_sequence_length: SequenceNumber::new(3),
        });
        round_trip(NodeMessage::StopProxying {
            sublink: SublinkId::from_u64(4),
            proxy_inbound_sequence_length: SequenceNumber::new(6),
            proxy_outbound_sequence_length: SequenceNumber::new(3),
        });
    }

    #[test]
    fn test_unknown_message_id_is_ignored() {
        let mut frame = encode(
            &NodeMessage::FlushRouter {
                sublink: SublinkId::from_u64(0),
            },
            0,
        );
        frame[4] = 0xee;
        assert_eq!(decode(&frame).unwrap(), None);
    }

    #[test]
    fn test_truncated_frame_is_rejected() {
        let frame = encode(
            &NodeMessage::RequestIntroduction {
                name: NodeName::generate(),
            },
            0,
        );
        assert!(decode(&frame[..frame.len() - 1]).is_err());
        assert!(decode(&frame[..8]).is_err());
    }

    #[test]
    fn test_trailing_bytes_are_tolerated() {
        let mut frame = encode(&NodeMessage::RequestMemory { size: 4096 }, 9);
        frame.extend_from_slice(b"future fields");
        let (_, decoded) = decode(&frame).unwrap().unwrap();
        assert_eq!(decoded, NodeMessage::RequestMemory { size: 4096 });
    }
}
