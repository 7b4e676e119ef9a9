//! # Driver API
//!
//! This crate defines the contract between the portal messaging fabric and
//! its hosting environment. The fabric never performs I/O or allocates
//! shared memory itself; an injected [`Driver`] supplies transport pairs,
//! shared memory regions, and serialization of driver-owned objects.
//!
//! The contract is deliberately narrow:
//!
//! - A [`Transport`] moves framed byte messages plus out-of-band
//!   [`DriverObject`] attachments between two endpoints, in order.
//! - A [`SharedMemoryRegion`] can be duplicated and mapped; mappings from
//!   both ends of a link genuinely alias the same bytes.
//! - Driver objects boxed into parcels are serialized through the driver so
//!   they can cross whatever boundary the transport crosses.
//!
//! Everything here is object-safe so drivers can be injected dynamically.

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Errors reported by driver implementations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DriverError {
    /// The operation is not supported by this driver.
    #[error("driver does not support this operation")]
    Unsupported,

    /// A handle passed to the driver was not one of its own live objects.
    #[error("invalid driver handle")]
    InvalidHandle,

    /// The transport cannot carry this message (e.g. its peer is gone).
    #[error("transport failure")]
    TransportFailure,

    /// The driver could not allocate the requested resource.
    #[error("driver resource exhausted")]
    ResourceExhausted,

    /// Serialized data did not describe a valid driver object.
    #[error("malformed serialized driver object")]
    MalformedObject,
}

/// Returned by a transport listener to reject a malformed or hostile
/// message. The driver responds by reporting a transport error, which the
/// fabric turns into link deactivation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolViolation;

/// One framed message crossing a transport: an opaque byte frame plus an
/// ordered table of driver object attachments.
pub struct TransportMessage {
    pub data: Vec<u8>,
    pub objects: Vec<DriverObject>,
}

impl TransportMessage {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            objects: Vec::new(),
        }
    }

    pub fn with_objects(data: Vec<u8>, objects: Vec<DriverObject>) -> Self {
        Self { data, objects }
    }
}

impl fmt::Debug for TransportMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportMessage")
            .field("data_len", &self.data.len())
            .field("num_objects", &self.objects.len())
            .finish()
    }
}

/// Receives activity from an activated transport.
///
/// Callbacks may arrive on arbitrary driver threads. For a single endpoint
/// they are serialized: the driver never invokes `on_message` concurrently
/// with itself for the same endpoint.
pub trait TransportListener: Send + Sync {
    /// A message has arrived. Returning an error indicates a protocol
    /// violation; the driver will stop delivery and report `on_error`.
    fn on_message(&self, message: TransportMessage) -> Result<(), ProtocolViolation>;

    /// The transport has failed and will deliver nothing further.
    fn on_error(&self);
}

/// One end of a duplex byte-and-object channel.
pub trait Transport: Send + Sync {
    /// Starts delivery of inbound messages to `listener`. Messages received
    /// before activation are buffered and delivered in order on activation.
    fn activate(&self, listener: Arc<dyn TransportListener>) -> Result<(), DriverError>;

    /// Permanently stops delivery and releases the listener. Idempotent.
    fn deactivate(&self);

    /// Queues `message` for in-order delivery to the opposite endpoint.
    fn transmit(&self, message: TransportMessage) -> Result<(), DriverError>;
}

/// A driver-owned region of memory shareable between the two ends of a
/// transport.
pub trait SharedMemoryRegion: Send + Sync {
    /// Size of the region in bytes.
    fn size(&self) -> usize;

    /// Creates a second handle to the same underlying region.
    fn duplicate(&self) -> Result<Arc<dyn SharedMemoryRegion>, DriverError>;

    /// Maps the region into the caller's address space.
    fn map(&self) -> Result<Mapping, DriverError>;
}

/// A mapped view of a [`SharedMemoryRegion`].
///
/// Both ends of a link may hold mappings of the same region concurrently, so
/// the bytes behind `base()` must only be accessed through raw pointers or
/// atomics; the fabric's memory plane owns all such access.
pub struct Mapping {
    base: *mut u8,
    len: usize,
    _keepalive: Arc<dyn Any + Send + Sync>,
}

// The mapping itself is just a pointer and a keepalive; all access goes
// through raw pointer reads/writes or atomics.
unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

impl Mapping {
    /// Wraps a mapped range.
    ///
    /// # Safety
    ///
    /// `base..base + len` must remain valid and writable for as long as
    /// `keepalive` is alive, and the memory must tolerate concurrent access
    /// from other mappings of the same region.
    pub unsafe fn new(base: *mut u8, len: usize, keepalive: Arc<dyn Any + Send + Sync>) -> Self {
        Self {
            base,
            len,
            _keepalive: keepalive,
        }
    }

    pub fn base(&self) -> *mut u8 {
        self.base
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl fmt::Debug for Mapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mapping").field("len", &self.len).finish()
    }
}

/// A driver object which the fabric treats as opaque user data ("boxed"
/// objects in parcels).
pub trait CustomDriverObject: Send + fmt::Debug {
    /// Serializes the object for transmission. Nested driver objects ride
    /// the returned table.
    fn serialize(&self) -> Result<SerializedObject, DriverError>;
}

/// Opaque driver-owned attachments carried by transports and parcels.
#[derive(Debug)]
pub enum DriverObject {
    /// One end of a transport pair, e.g. attached to an introduction.
    Transport(Arc<dyn Transport>),
    /// A shareable memory region, e.g. a fragment allocator buffer.
    Memory(Arc<dyn SharedMemoryRegion>),
    /// A driver-defined object boxed into a parcel by the application.
    Custom(Box<dyn CustomDriverObject>),
}

/// The byte form of a driver object produced by [`Driver::serialize_object`].
#[derive(Debug, Default)]
pub struct SerializedObject {
    pub data: Vec<u8>,
    pub objects: Vec<DriverObject>,
}

/// The capability injected into every node.
pub trait Driver: Send + Sync {
    /// Creates a connected pair of transports.
    fn create_transport_pair(
        &self,
    ) -> Result<(Arc<dyn Transport>, Arc<dyn Transport>), DriverError>;

    /// Allocates a new shareable memory region of at least `size` bytes.
    fn allocate_shared_memory(
        &self,
        size: usize,
    ) -> Result<Arc<dyn SharedMemoryRegion>, DriverError>;

    /// Serializes a custom driver object for transmission inside a parcel.
    fn serialize_object(
        &self,
        object: Box<dyn CustomDriverObject>,
    ) -> Result<SerializedObject, DriverError>;

    /// Reconstructs a custom driver object from its serialized form.
    fn deserialize_object(
        &self,
        data: SerializedObject,
    ) -> Result<Box<dyn CustomDriverObject>, DriverError>;
}

impl fmt::Debug for dyn Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Transport")
    }
}

impl fmt::Debug for dyn SharedMemoryRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SharedMemoryRegion")
    }
}
