//! Boxable byte blobs.

use driver_api::{CustomDriverObject, DriverError, SerializedObject};

/// The simulated driver's only custom object type: an immutable byte string
/// applications can box into parcels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blob {
    data: Vec<u8>,
}

impl Blob {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }
}

impl CustomDriverObject for Blob {
    fn serialize(&self) -> Result<SerializedObject, DriverError> {
        Ok(SerializedObject {
            data: self.data.clone(),
            objects: Vec::new(),
        })
    }
}
