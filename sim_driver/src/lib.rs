//! # Simulated Driver
//!
//! This crate provides a complete in-process implementation of the driver
//! contract.
//!
//! ## Purpose
//!
//! The simulated driver allows the whole fabric to run without any OS
//! transport or real shared memory:
//! - Runs under `cargo test`
//! - Deterministic delivery (per-endpoint FIFO with a single drainer)
//! - Mappings of a "shared" region genuinely alias the same bytes
//! - Inspectable and faultable (errors can be injected on any transport)
//!
//! This is not a mock: it is a full implementation of the driver contract
//! that happens to run in one process, so every code path of the fabric,
//! including the shared-memory plane and multi-node routing, is exercised
//! for real in tests.

mod blob;
mod memory;
mod transport;

pub use blob::Blob;
pub use memory::SimSharedMemory;
pub use transport::SimTransport;

use driver_api::{
    CustomDriverObject, Driver, DriverError, SerializedObject, SharedMemoryRegion, Transport,
};
use std::sync::Arc;

/// The in-process driver. Stateless; all state lives in the objects it
/// creates.
#[derive(Debug, Default, Clone, Copy)]
pub struct SimDriver;

impl SimDriver {
    pub fn new() -> Self {
        SimDriver
    }

    /// Creates a connected transport pair with access to the concrete
    /// endpoint type, e.g. so tests can inject errors.
    pub fn create_sim_transport_pair() -> (Arc<SimTransport>, Arc<SimTransport>) {
        SimTransport::create_pair()
    }
}

impl Driver for SimDriver {
    fn create_transport_pair(
        &self,
    ) -> Result<(Arc<dyn Transport>, Arc<dyn Transport>), DriverError> {
        let (a, b) = SimTransport::create_pair();
        Ok((a, b))
    }

    fn allocate_shared_memory(
        &self,
        size: usize,
    ) -> Result<Arc<dyn SharedMemoryRegion>, DriverError> {
        if size == 0 {
            return Err(DriverError::ResourceExhausted);
        }
        Ok(Arc::new(SimSharedMemory::new(size)))
    }

    fn serialize_object(
        &self,
        object: Box<dyn CustomDriverObject>,
    ) -> Result<SerializedObject, DriverError> {
        object.serialize()
    }

    fn deserialize_object(
        &self,
        data: SerializedObject,
    ) -> Result<Box<dyn CustomDriverObject>, DriverError> {
        Ok(Box::new(Blob::new(data.data)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use driver_api::DriverObject;

    #[test]
    fn test_blob_round_trip() {
        let driver = SimDriver::new();
        let blob: Box<dyn CustomDriverObject> = Box::new(Blob::new(b"payload".to_vec()));
        let serialized = driver.serialize_object(blob).unwrap();
        let restored = driver.deserialize_object(serialized).unwrap();
        let restored = restored.serialize().unwrap();
        assert_eq!(restored.data, b"payload");
        assert!(restored.objects.is_empty());
    }

    #[test]
    fn test_shared_memory_alias() {
        let driver = SimDriver::new();
        let region = driver.allocate_shared_memory(64).unwrap();
        let dup = region.duplicate().unwrap();
        let map_a = region.map().unwrap();
        let map_b = dup.map().unwrap();
        unsafe {
            map_a.base().write(0x5a);
        }
        assert_eq!(unsafe { map_b.base().read() }, 0x5a);
        drop(DriverObject::Memory(region));
    }
}
