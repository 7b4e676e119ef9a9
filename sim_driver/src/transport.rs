//! In-process transport pairs.

use driver_api::{DriverError, Transport, TransportListener, TransportMessage};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::{Arc, OnceLock, Weak};

#[derive(Default)]
struct EndpointState {
    listener: Option<Arc<dyn TransportListener>>,
    queue: VecDeque<TransportMessage>,
    /// Set while some thread is draining `queue` into the listener. Ensures
    /// per-endpoint delivery is serialized even when both ends transmit
    /// concurrently from different threads.
    dispatching: bool,
    active: bool,
    dead: bool,
}

/// One endpoint of an in-process transport pair.
///
/// Delivery is synchronous on whichever thread transmits (or activates), but
/// only one thread drains an endpoint at a time, so listener callbacks for a
/// single endpoint never interleave.
pub struct SimTransport {
    state: Mutex<EndpointState>,
    peer: OnceLock<Weak<SimTransport>>,
}

impl SimTransport {
    pub(crate) fn create_pair() -> (Arc<SimTransport>, Arc<SimTransport>) {
        let a = Arc::new(SimTransport {
            state: Mutex::new(EndpointState::default()),
            peer: OnceLock::new(),
        });
        let b = Arc::new(SimTransport {
            state: Mutex::new(EndpointState::default()),
            peer: OnceLock::new(),
        });
        a.peer.set(Arc::downgrade(&b)).ok();
        b.peer.set(Arc::downgrade(&a)).ok();
        (a, b)
    }

    /// Simulates a transport-level failure: the listener (if any) observes
    /// an error and the endpoint goes dead. The peer endpoint fails on its
    /// next transmit.
    pub fn inject_error(&self) {
        let listener = {
            let mut state = self.state.lock();
            state.dead = true;
            state.active = false;
            state.queue.clear();
            state.listener.take()
        };
        if let Some(listener) = listener {
            listener.on_error();
        }
    }

    /// The peer endpoint closed its end; behaves like a pipe hangup.
    fn hangup(&self) {
        let listener = {
            let mut state = self.state.lock();
            if state.dead {
                return;
            }
            state.dead = true;
            state.active = false;
            state.queue.clear();
            state.listener.take()
        };
        if let Some(listener) = listener {
            listener.on_error();
        }
    }

    fn enqueue(&self, message: TransportMessage) {
        {
            let mut state = self.state.lock();
            if state.dead {
                return;
            }
            state.queue.push_back(message);
            if !state.active || state.dispatching {
                return;
            }
            state.dispatching = true;
        }
        self.drain();
    }

    fn drain(&self) {
        loop {
            let (message, listener) = {
                let mut state = self.state.lock();
                let Some(listener) = state.listener.clone() else {
                    state.dispatching = false;
                    return;
                };
                match state.queue.pop_front() {
                    Some(message) if state.active => (message, listener),
                    _ => {
                        state.dispatching = false;
                        return;
                    }
                }
            };

            if listener.on_message(message).is_err() {
                {
                    let mut state = self.state.lock();
                    state.dispatching = false;
                }
                self.inject_error();
                return;
            }
        }
    }
}

impl Transport for SimTransport {
    fn activate(&self, listener: Arc<dyn TransportListener>) -> Result<(), DriverError> {
        {
            let mut state = self.state.lock();
            if state.dead {
                return Err(DriverError::TransportFailure);
            }
            state.listener = Some(listener);
            state.active = true;
            if state.dispatching || state.queue.is_empty() {
                return Ok(());
            }
            state.dispatching = true;
        }
        // Deliver anything buffered before activation.
        self.drain();
        Ok(())
    }

    fn deactivate(&self) {
        let was_dead = {
            let mut state = self.state.lock();
            let was_dead = state.dead;
            state.active = false;
            state.listener = None;
            state.queue.clear();
            state.dead = true;
            was_dead
        };
        // Deactivation closes this end for good; the peer observes it as a
        // transport error, the way a closed pipe would read.
        if !was_dead {
            if let Some(peer) = self.peer.get().and_then(Weak::upgrade) {
                peer.hangup();
            }
        }
    }

    fn transmit(&self, message: TransportMessage) -> Result<(), DriverError> {
        {
            let state = self.state.lock();
            if state.dead {
                return Err(DriverError::TransportFailure);
            }
        }
        let Some(peer) = self.peer.get().and_then(Weak::upgrade) else {
            return Err(DriverError::TransportFailure);
        };
        peer.enqueue(message);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use driver_api::ProtocolViolation;
    use parking_lot::Mutex as PlMutex;

    #[derive(Default)]
    struct Recorder {
        frames: PlMutex<Vec<Vec<u8>>>,
        errors: PlMutex<usize>,
    }

    impl TransportListener for Recorder {
        fn on_message(&self, message: TransportMessage) -> Result<(), ProtocolViolation> {
            self.frames.lock().push(message.data);
            Ok(())
        }

        fn on_error(&self) {
            *self.errors.lock() += 1;
        }
    }

    #[test]
    fn test_in_order_delivery() {
        let (a, b) = SimTransport::create_pair();
        let recorder = Arc::new(Recorder::default());
        b.activate(recorder.clone()).unwrap();

        a.transmit(TransportMessage::new(vec![1])).unwrap();
        a.transmit(TransportMessage::new(vec![2])).unwrap();
        a.transmit(TransportMessage::new(vec![3])).unwrap();

        assert_eq!(*recorder.frames.lock(), vec![vec![1], vec![2], vec![3]]);
    }

    #[test]
    fn test_buffered_until_activation() {
        let (a, b) = SimTransport::create_pair();
        a.transmit(TransportMessage::new(vec![9])).unwrap();

        let recorder = Arc::new(Recorder::default());
        b.activate(recorder.clone()).unwrap();
        assert_eq!(*recorder.frames.lock(), vec![vec![9]]);
    }

    #[test]
    fn test_deactivation_hangs_up_peer() {
        let (a, b) = SimTransport::create_pair();
        let b_recorder = Arc::new(Recorder::default());
        b.activate(b_recorder.clone()).unwrap();
        let a_recorder = Arc::new(Recorder::default());
        a.activate(a_recorder.clone()).unwrap();

        b.deactivate();
        assert!(a.transmit(TransportMessage::new(vec![4])).is_err());
        assert!(b_recorder.frames.lock().is_empty());
        assert_eq!(*a_recorder.errors.lock(), 1);
    }

    #[test]
    fn test_injected_error_reaches_listener() {
        let (a, b) = SimTransport::create_pair();
        let recorder = Arc::new(Recorder::default());
        b.activate(recorder.clone()).unwrap();
        b.inject_error();
        assert_eq!(*recorder.errors.lock(), 1);
        assert!(b.transmit(TransportMessage::new(vec![0])).is_err());
        drop(a);
    }
}
