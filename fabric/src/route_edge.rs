//! Route edges: one router port's links and their decay.

use crate::parcel::Parcel;
use crate::router::Router;
use crate::router_link::RouterLink;
use crate::sequenced_queue::SequencedQueue;
use crate::node_link::NodeLink;
use core_types::{SequenceNumber, SublinkId};
use std::sync::Arc;

/// Decay progress for an edge's outgoing link replacement.
enum DecayState {
    None,
    /// Decay was requested before the edge had a primary link; the next
    /// link it acquires starts decaying immediately.
    Deferred {
        length_to: Option<SequenceNumber>,
        length_from: Option<SequenceNumber>,
    },
    Decaying {
        link: Arc<dyn RouterLink>,
        /// Sequence length after which nothing more is sent on the link.
        length_to: Option<SequenceNumber>,
        /// Sequence length after which nothing more is expected from it.
        length_from: Option<SequenceNumber>,
    },
}

/// One (inward- or outward-facing) side of a router.
///
/// Over its lifetime an edge may use many links, but at any moment it holds
/// at most a primary link and one decaying link. A decaying link only
/// carries parcels below its per-direction sequence limits; once those are
/// reached it is dropped. Incremental link replacement through this type is
/// the basis of proxy elimination.
pub struct RouteEdge {
    primary: Option<Arc<dyn RouterLink>>,
    decay: DecayState,
}

impl Default for RouteEdge {
    fn default() -> Self {
        Self::new()
    }
}

impl RouteEdge {
    pub fn new() -> Self {
        Self {
            primary: None,
            decay: DecayState::None,
        }
    }

    pub fn primary_link(&self) -> Option<Arc<dyn RouterLink>> {
        self.primary.clone()
    }

    pub fn decaying_link(&self) -> Option<Arc<dyn RouterLink>> {
        match &self.decay {
            DecayState::Decaying { link, .. } => Some(link.clone()),
            _ => None,
        }
    }

    /// Stable: a primary link and no decay in progress or deferred.
    pub fn is_stable(&self) -> bool {
        self.primary.is_some() && matches!(self.decay, DecayState::None)
    }

    /// Exclusively decaying, with no replacement link anticipated.
    pub fn is_decaying(&self) -> bool {
        self.primary.is_none() && !matches!(self.decay, DecayState::None)
    }

    pub fn set_length_to_decaying_link(&mut self, length: SequenceNumber) {
        match &mut self.decay {
            DecayState::Deferred { length_to, .. } | DecayState::Decaying { length_to, .. } => {
                debug_assert!(length_to.is_none());
                *length_to = Some(length);
            }
            DecayState::None => debug_assert!(false, "no decaying link on this edge"),
        }
    }

    pub fn set_length_from_decaying_link(&mut self, length: SequenceNumber) {
        match &mut self.decay {
            DecayState::Deferred { length_from, .. } | DecayState::Decaying { length_from, .. } => {
                debug_assert!(length_from.is_none());
                *length_from = Some(length);
            }
            DecayState::None => debug_assert!(false, "no decaying link on this edge"),
        }
    }

    pub fn set_length_to_and_from_decaying_link(
        &mut self,
        length_to: SequenceNumber,
        length_from: SequenceNumber,
    ) {
        self.set_length_to_decaying_link(length_to);
        self.set_length_from_decaying_link(length_from);
    }

    pub fn length_from_decaying_link(&self) -> Option<SequenceNumber> {
        match &self.decay {
            DecayState::Deferred { length_from, .. } | DecayState::Decaying { length_from, .. } => {
                *length_from
            }
            DecayState::None => None,
        }
    }

    /// The peer router when the primary link is local to this node.
    pub fn local_peer(&self) -> Option<Arc<Router>> {
        self.primary.as_ref()?.local_peer()
    }

    /// The peer router when the decaying link is local to this node.
    pub fn decaying_local_peer(&self) -> Option<Arc<Router>> {
        match &self.decay {
            DecayState::Decaying { link, .. } => link.local_peer(),
            _ => None,
        }
    }

    /// Installs the edge's primary link. If decay was deferred, the link
    /// instead becomes the decaying link immediately.
    pub fn set_primary_link(&mut self, link: Arc<dyn RouterLink>) {
        debug_assert!(self.primary.is_none());
        let deferred = match &self.decay {
            DecayState::Deferred {
                length_to,
                length_from,
            } => Some((*length_to, *length_from)),
            _ => None,
        };
        match deferred {
            Some((length_to, length_from)) => {
                self.decay = DecayState::Decaying {
                    link,
                    length_to,
                    length_from,
                };
            }
            None => self.primary = Some(link),
        }
    }

    pub fn release_primary_link(&mut self) -> Option<Arc<dyn RouterLink>> {
        self.primary.take()
    }

    pub fn release_decaying_link(&mut self) -> Option<Arc<dyn RouterLink>> {
        match std::mem::replace(&mut self.decay, DecayState::None) {
            DecayState::Decaying { link, .. } => Some(link),
            _ => None,
        }
    }

    /// Whether either of the edge's links runs over `sublink` of `link`.
    pub fn is_routed_through(&self, link: &NodeLink, sublink: SublinkId) -> bool {
        if let Some(primary) = &self.primary {
            if primary.is_remote_link_to(link, sublink) {
                return true;
            }
        }
        if let DecayState::Decaying { link: decaying, .. } = &self.decay {
            if decaying.is_remote_link_to(link, sublink) {
                return true;
            }
        }
        false
    }

    /// Begins decaying the primary link (or defers decay if there is none
    /// yet). Fails if a decay is already pending.
    pub fn start_decaying(
        &mut self,
        length_to: Option<SequenceNumber>,
        length_from: Option<SequenceNumber>,
    ) -> bool {
        if !matches!(self.decay, DecayState::None) {
            return false;
        }
        self.decay = match self.primary.take() {
            Some(link) => DecayState::Decaying {
                link,
                length_to,
                length_from,
            },
            None => DecayState::Deferred {
                length_to,
                length_from,
            },
        };
        true
    }

    /// Completes decay if both direction limits are known and reached.
    pub fn try_finish_decay(
        &mut self,
        sequence_length_sent: SequenceNumber,
        sequence_length_received: SequenceNumber,
    ) -> bool {
        let DecayState::Decaying {
            length_to,
            length_from,
            ..
        } = &self.decay
        else {
            return false;
        };
        let (Some(length_to), Some(length_from)) = (*length_to, *length_from) else {
            return false;
        };
        if sequence_length_sent < length_to || sequence_length_received < length_from {
            return false;
        }
        self.decay = DecayState::None;
        true
    }

    /// Pops every transmittable parcel off `queue`, splitting them between
    /// the decaying link (for sequence numbers under its limit) and the
    /// primary link.
    pub fn flush_parcels_from_queue(
        &mut self,
        queue: &mut SequencedQueue<Parcel>,
        to_decaying: &mut Vec<Parcel>,
        to_primary: &mut Vec<Parcel>,
    ) {
        while queue.has_next_element() {
            let n = queue.current_sequence_number();
            if self.should_send_on_decaying_link(n) {
                if matches!(self.decay, DecayState::Decaying { .. }) {
                    to_decaying.push(queue.pop().expect("head was available"));
                } else {
                    // Decay is deferred; hold parcels until a link arrives.
                    return;
                }
            } else if self.primary.is_some() {
                to_primary.push(queue.pop().expect("head was available"));
            } else {
                return;
            }
        }
    }

    /// Fast path: the link on which a parcel with sequence number `n` can
    /// be transmitted right now, if any.
    pub fn link_for_transmission(&self, n: SequenceNumber) -> Option<Arc<dyn RouterLink>> {
        if self.should_send_on_decaying_link(n) {
            self.decaying_link()
        } else {
            self.primary.clone()
        }
    }

    /// Locks the primary link for bypass of the router on this side,
    /// recording `bypass_request_source` for authentication by the peer.
    pub fn try_lock_primary_link_for_bypass(
        &mut self,
        bypass_request_source: core_types::NodeName,
    ) -> bool {
        if !self.is_stable() {
            return false;
        }
        let Some(link) = &self.primary else {
            return false;
        };
        link.try_lock_for_bypass(bypass_request_source)
    }

    /// Whether a bypass request from `source` may legitimately target this
    /// edge's primary link.
    pub fn can_node_request_bypass_of_primary_link(
        &self,
        source: core_types::NodeName,
    ) -> bool {
        match &self.primary {
            Some(link) => link.can_node_request_bypass(source),
            None => false,
        }
    }

    fn should_send_on_decaying_link(&self, n: SequenceNumber) -> bool {
        match &self.decay {
            DecayState::None => false,
            DecayState::Deferred { length_to, .. } | DecayState::Decaying { length_to, .. } => {
                match length_to {
                    Some(limit) => n < *limit,
                    None => true,
                }
            }
        }
    }
}
