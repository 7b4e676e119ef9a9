//! Parcels: the unit of transmission between portals.

use crate::router::Router;
use crate::sequenced_queue::QueueElement;
use core_types::SequenceNumber;
use driver_api::DriverObject;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

/// Optional queue limits supplied with a put operation.
///
/// The sender-side outbound queue is always checked. A local outward link
/// additionally checks the peer's inbound queue exactly; a remote link
/// bounds only the sender-side view (see DESIGN.md).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PutLimits {
    pub max_queued_parcels: u64,
    pub max_queued_bytes: u64,
}

/// A transferable object attached to a parcel, in attachment order.
pub enum ParcelObject {
    /// One end of a route, represented by its terminal router. Wrapped back
    /// into a portal when the receiving application retrieves it.
    Portal(Arc<Router>),
    /// An opaque driver object boxed by the application.
    Box(DriverObject),
}

impl fmt::Debug for ParcelObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParcelObject::Portal(_) => write!(f, "Portal"),
            ParcelObject::Box(_) => write!(f, "Box"),
        }
    }
}

/// One ordered unit of application data with attached transferable objects.
///
/// Bytes and objects are consumed independently; a parcel survives in its
/// queue until both are exhausted. Dropping a parcel that still carries
/// unread portals closes their routes so the far ends observe peer closure
/// rather than hanging.
#[derive(Debug, Default)]
pub struct Parcel {
    sequence_number: SequenceNumber,
    data: Vec<u8>,
    consumed_bytes: usize,
    objects: VecDeque<ParcelObject>,
}

impl Parcel {
    pub fn new(data: Vec<u8>, objects: Vec<ParcelObject>) -> Self {
        Self {
            sequence_number: SequenceNumber::ZERO,
            data,
            consumed_bytes: 0,
            objects: objects.into(),
        }
    }

    pub fn sequence_number(&self) -> SequenceNumber {
        self.sequence_number
    }

    pub fn set_sequence_number(&mut self, n: SequenceNumber) {
        self.sequence_number = n;
    }

    /// The unconsumed portion of the payload.
    pub fn data_view(&self) -> &[u8] {
        &self.data[self.consumed_bytes..]
    }

    /// Mutable view of the unconsumed payload, for in-place two-phase get.
    pub fn data_view_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.consumed_bytes..]
    }

    pub fn data_len(&self) -> usize {
        self.data.len() - self.consumed_bytes
    }

    pub fn num_objects(&self) -> usize {
        self.objects.len()
    }

    pub fn is_fully_consumed(&self) -> bool {
        self.data_len() == 0 && self.objects.is_empty()
    }

    /// Consumes `num_bytes` of payload and up to `num_objects` attachments,
    /// returning the attachments in order. `num_bytes` must not exceed the
    /// unconsumed length.
    pub fn consume(&mut self, num_bytes: usize, num_objects: usize) -> Vec<ParcelObject> {
        debug_assert!(num_bytes <= self.data_len());
        self.consumed_bytes += num_bytes;
        let take = num_objects.min(self.objects.len());
        self.objects.drain(..take).collect()
    }

    /// Detaches every remaining object, e.g. for serialization over a remote
    /// link.
    pub fn take_objects(&mut self) -> Vec<ParcelObject> {
        self.objects.drain(..).collect()
    }

    /// Consumes the whole parcel, returning payload and attachments.
    pub fn into_parts(mut self) -> (Vec<u8>, Vec<ParcelObject>) {
        let data = std::mem::take(&mut self.data).split_off(self.consumed_bytes);
        let objects = self.objects.drain(..).collect();
        (data, objects)
    }

    pub fn describe(&self) -> String {
        format!(
            "parcel {} ({} bytes, {} objects)",
            self.sequence_number,
            self.data_len(),
            self.num_objects()
        )
    }
}

impl QueueElement for Parcel {
    fn element_size(&self) -> usize {
        self.data_len()
    }
}

impl Drop for Parcel {
    fn drop(&mut self) {
        for object in self.objects.drain(..) {
            if let ParcelObject::Portal(router) = object {
                router.close_route();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_independent_consumption() {
        let mut parcel = Parcel::new(b"abcdef".to_vec(), Vec::new());
        assert_eq!(parcel.data_view(), b"abcdef");
        let objects = parcel.consume(4, 0);
        assert!(objects.is_empty());
        assert_eq!(parcel.data_view(), b"ef");
        assert_eq!(parcel.data_len(), 2);
        assert!(!parcel.is_fully_consumed());
        parcel.consume(2, 0);
        assert!(parcel.is_fully_consumed());
    }

    #[test]
    fn test_element_size_shrinks_with_consumption() {
        let mut parcel = Parcel::new(vec![0; 10], Vec::new());
        assert_eq!(parcel.element_size(), 10);
        parcel.consume(3, 0);
        assert_eq!(parcel.element_size(), 7);
    }

    #[test]
    fn test_into_parts_skips_consumed_prefix() {
        let mut parcel = Parcel::new(b"xyz123".to_vec(), Vec::new());
        parcel.consume(3, 0);
        let (data, objects) = parcel.into_parts();
        assert_eq!(data, b"123");
        assert!(objects.is_empty());
    }
}
