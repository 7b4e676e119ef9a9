//! Portals: the application-facing endpoints.

use crate::parcel::{Parcel, ParcelObject, PutLimits};
use crate::router::Router;
use crate::trap::{ArmError, Trap, TrapHandler};
use core_types::{ApiError, PortalStatus, TrapConditions};
use driver_api::DriverObject;
use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A transferable object retrieved from or attached to a parcel.
pub enum PortalObject {
    /// Another portal, moved whole into the parcel.
    Portal(Portal),
    /// An opaque boxed driver object.
    Box(DriverObject),
}

/// One end of a route. Parcels put here come out of the paired portal in
/// order, wherever in the fabric it currently lives.
///
/// All operations are non-blocking. At most one two-phase get and one
/// two-phase put may be in progress at a time.
pub struct Portal {
    router: Arc<Router>,
    closed: AtomicBool,
    two_phase_get: AtomicBool,
    pending_put: Mutex<Option<Vec<u8>>>,
}

impl Portal {
    pub(crate) fn from_router(router: Arc<Router>) -> Portal {
        Portal {
            router,
            closed: AtomicBool::new(false),
            two_phase_get: AtomicBool::new(false),
            pending_put: Mutex::new(None),
        }
    }

    pub(crate) fn router(&self) -> &Arc<Router> {
        &self.router
    }

    fn check_open(&self) -> Result<(), ApiError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ApiError::InvalidArgument);
        }
        Ok(())
    }

    /// Sends a parcel to the other side of the route.
    ///
    /// `objects` are consumed whether or not the put succeeds; a portal
    /// attached to a failed put is dropped and therefore closed.
    pub fn put(&self, data: &[u8], objects: Vec<PortalObject>) -> Result<(), ApiError> {
        self.put_with_limits(data, objects, None)
    }

    /// Sends a parcel, failing with `ResourceExhausted` if `limits` would
    /// be exceeded.
    pub fn put_with_limits(
        &self,
        data: &[u8],
        objects: Vec<PortalObject>,
        limits: Option<&PutLimits>,
    ) -> Result<(), ApiError> {
        self.check_open()?;
        if self.router.is_peer_closed() {
            return Err(ApiError::NotFound);
        }
        for object in &objects {
            if let PortalObject::Portal(portal) = object {
                if portal.closed.load(Ordering::Acquire)
                    || Arc::ptr_eq(&portal.router, &self.router)
                    || portal.router.has_local_peer(&self.router)
                {
                    // A portal cannot travel over itself or its own peer.
                    return Err(ApiError::InvalidArgument);
                }
            }
        }
        if let Some(limits) = limits {
            if self.router.would_outbound_parcel_exceed_limits(data.len(), limits) {
                return Err(ApiError::ResourceExhausted);
            }
        }

        let attachments = objects.into_iter().map(PortalObject::into_parcel_object);
        let parcel = Parcel::new(data.to_vec(), attachments.collect());
        self.router.send_outbound_parcel(parcel)
    }

    /// Retrieves the next whole parcel.
    ///
    /// `Unavailable` means nothing is here yet; `NotFound` means nothing is
    /// here and the peer is closed, so nothing ever will be.
    pub fn get(&self) -> Result<(Vec<u8>, Vec<PortalObject>), ApiError> {
        self.check_open()?;
        if self.two_phase_get.load(Ordering::Acquire) {
            return Err(ApiError::AlreadyExists);
        }
        let parcel = self.router.get_next_parcel()?;
        let (data, objects) = parcel.into_parts();
        Ok((data, objects.into_iter().map(PortalObject::from_parcel_object).collect()))
    }

    /// Starts a two-phase get, exposing a direct view of the next parcel's
    /// payload. Dropping the view without committing leaves the parcel
    /// intact.
    pub fn begin_get(&self) -> Result<ParcelView<'_>, ApiError> {
        self.check_open()?;
        if self
            .two_phase_get
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(ApiError::AlreadyExists);
        }

        let available = {
            let mut state = self.router.lock_state();
            if state.inbound.next_element_mut().is_some() {
                Ok(())
            } else if state.inbound.is_dead() {
                Err(ApiError::NotFound)
            } else {
                Err(ApiError::Unavailable)
            }
        };
        if let Err(error) = available {
            self.two_phase_get.store(false, Ordering::Release);
            return Err(error);
        }
        Ok(ParcelView {
            portal: self,
            finished: false,
        })
    }

    /// Starts a two-phase put with a zeroed payload buffer of `num_bytes`.
    pub fn begin_put(&self, num_bytes: usize) -> Result<PutSlot<'_>, ApiError> {
        self.check_open()?;
        if self.router.is_peer_closed() {
            return Err(ApiError::NotFound);
        }
        let mut pending = self.pending_put.lock();
        if pending.is_some() {
            return Err(ApiError::AlreadyExists);
        }
        *pending = Some(vec![0; num_bytes]);
        drop(pending);
        Ok(PutSlot {
            portal: self,
            finished: false,
        })
    }

    /// A snapshot of this portal's observable state.
    pub fn query_status(&self) -> PortalStatus {
        self.router.query_status()
    }

    /// Creates a trap watching this portal. The trap must be armed before
    /// it can fire.
    pub fn create_trap(
        &self,
        conditions: TrapConditions,
        handler: TrapHandler,
        context: u64,
    ) -> Arc<Trap> {
        let trap = Trap::new(conditions, handler, context);
        self.router.add_trap(trap.clone());
        trap
    }

    /// Arms `trap`; fails with the satisfied conditions if any are already
    /// met.
    pub fn arm_trap(&self, trap: &Arc<Trap>) -> Result<(), ArmError> {
        self.router.arm_trap(trap)
    }

    /// Destroys `trap`. With `blocking`, waits for in-flight handler
    /// invocations to finish first.
    pub fn destroy_trap(&self, trap: &Arc<Trap>, blocking: bool) {
        trap.destroy(blocking);
        self.router.remove_trap(trap);
    }

    /// Closes this end of the route. The peer observes peer-closure once
    /// every parcel sent before the close has been delivered.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        *self.pending_put.lock() = None;
        self.router.close_route();
    }

    fn into_parcel_object(self) -> ParcelObject {
        // Mark transferred so drop does not close the route we just moved.
        self.closed.store(true, Ordering::Release);
        ParcelObject::Portal(self.router.clone())
    }
}

impl Drop for Portal {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Portal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Portal")
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl std::fmt::Debug for PortalObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PortalObject::Portal(_) => write!(f, "PortalObject::Portal"),
            PortalObject::Box(_) => write!(f, "PortalObject::Box"),
        }
    }
}

impl PortalObject {
    fn into_parcel_object(self) -> ParcelObject {
        match self {
            PortalObject::Portal(portal) => portal.into_parcel_object(),
            PortalObject::Box(object) => ParcelObject::Box(object),
        }
    }

    fn from_parcel_object(object: ParcelObject) -> PortalObject {
        match object {
            ParcelObject::Portal(router) => PortalObject::Portal(Portal::from_router(router)),
            ParcelObject::Box(object) => PortalObject::Box(object),
        }
    }

    /// Unwraps a transferred portal.
    pub fn into_portal(self) -> Option<Portal> {
        match self {
            PortalObject::Portal(portal) => Some(portal),
            PortalObject::Box(_) => None,
        }
    }

    /// Unwraps a boxed driver object.
    pub fn into_box(self) -> Option<DriverObject> {
        match self {
            PortalObject::Box(object) => Some(object),
            PortalObject::Portal(_) => None,
        }
    }
}

/// An in-progress two-phase get.
pub struct ParcelView<'a> {
    portal: &'a Portal,
    finished: bool,
}

impl ParcelView<'_> {
    /// Direct view of the parcel's unconsumed payload.
    pub fn data(&self) -> MappedMutexGuard<'_, [u8]> {
        MutexGuard::map(self.portal.router.lock_state(), |state| {
            state
                .inbound
                .next_element_mut()
                .expect("parcel pinned by two-phase get")
                .data_view_mut()
        })
    }

    pub fn num_bytes(&self) -> usize {
        self.data().len()
    }

    pub fn num_objects(&self) -> usize {
        let mut state = self.portal.router.lock_state();
        state
            .inbound
            .next_element_mut()
            .map_or(0, |parcel| parcel.num_objects())
    }

    /// Consumes `num_bytes` of payload and up to `num_objects` attachments.
    /// The parcel is retired once everything in it has been consumed. On
    /// failure the get is aborted and the parcel left intact.
    pub fn commit(
        mut self,
        num_bytes: usize,
        num_objects: usize,
    ) -> Result<Vec<PortalObject>, ApiError> {
        let result = self.portal.router.commit_inbound_get(num_bytes, num_objects);
        self.finished = true;
        self.portal.two_phase_get.store(false, Ordering::Release);
        result.map(|objects| {
            objects
                .into_iter()
                .map(PortalObject::from_parcel_object)
                .collect()
        })
    }

    /// Ends the get without consuming anything.
    pub fn abort(self) {}
}

impl Drop for ParcelView<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.portal.two_phase_get.store(false, Ordering::Release);
        }
    }
}

/// An in-progress two-phase put.
pub struct PutSlot<'a> {
    portal: &'a Portal,
    finished: bool,
}

impl PutSlot<'_> {
    /// The reserved payload buffer.
    pub fn data(&self) -> MappedMutexGuard<'_, [u8]> {
        MutexGuard::map(self.portal.pending_put.lock(), |pending| {
            pending
                .as_mut()
                .expect("buffer pinned by two-phase put")
                .as_mut_slice()
        })
    }

    /// Writes `bytes` at the start of the reserved buffer.
    pub fn write(&self, bytes: &[u8]) -> Result<(), ApiError> {
        let mut pending = self.portal.pending_put.lock();
        let Some(buffer) = pending.as_mut() else {
            return Err(ApiError::FailedPrecondition);
        };
        if bytes.len() > buffer.len() {
            return Err(ApiError::ResourceExhausted);
        }
        buffer[..bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// Sends the first `num_bytes_produced` bytes of the reserved buffer
    /// with `objects` attached.
    pub fn commit(
        mut self,
        num_bytes_produced: usize,
        objects: Vec<PortalObject>,
    ) -> Result<(), ApiError> {
        let buffer = {
            let mut pending = self.portal.pending_put.lock();
            let reserved = match pending.as_ref() {
                Some(buffer) => buffer.len(),
                None => return Err(ApiError::FailedPrecondition),
            };
            if num_bytes_produced > reserved {
                return Err(ApiError::InvalidArgument);
            }
            let mut buffer = pending.take().expect("buffer present");
            buffer.truncate(num_bytes_produced);
            buffer
        };
        self.finished = true;
        self.portal.put(&buffer, objects)
    }

    /// Discards the reserved buffer.
    pub fn abort(self) {}
}

impl Drop for PutSlot<'_> {
    fn drop(&mut self) {
        if !self.finished {
            *self.portal.pending_put.lock() = None;
        }
    }
}
