//! In-process frame-capture bridge: the frame-level surface a test drives
//! directly, with no real transport underneath.

use capnp_rpc_core::{Peer, PeerEffects};

use crate::error::{BridgeError, MAX_FRAME_BYTES};

/// Wraps a `Peer` behind `push_frame`/`pop_outgoing_frame`, the same two
/// operations a real transport adapter would perform against it, minus any
/// actual I/O.
pub struct Bridge<E: PeerEffects> {
    peer: Peer<E>,
}

impl<E: PeerEffects> Bridge<E> {
    pub fn new(peer: Peer<E>) -> Self {
        Self { peer }
    }

    pub fn peer(&self) -> &Peer<E> {
        &self.peer
    }

    pub fn peer_mut(&mut self) -> &mut Peer<E> {
        &mut self.peer
    }

    /// Feed an inbound frame to the wrapped peer. Refuses anything over
    /// `MAX_FRAME_BYTES` before the peer's own decoder ever sees it, so a
    /// rejected frame leaves no trace in any table.
    pub fn push_frame(&mut self, frame: Vec<u8>) -> Result<(), BridgeError> {
        if frame.len() > MAX_FRAME_BYTES {
            return Err(BridgeError::FrameTooLarge { bytes: frame.len() });
        }
        self.peer.dispatch(&frame)?;
        Ok(())
    }

    pub fn pop_outgoing_frame(&mut self) -> Option<Vec<u8>> {
        self.peer.pop_outbound_frame()
    }
}

/// Drains `a`'s outbound frames into `b` and vice versa, alternating, until
/// both queues run dry. Enough to carry a call/return exchange — including
/// any calls it pipelines along the way — to completion between two
/// in-process peers without a test hand-shuttling frames itself.
pub fn pump<EA: PeerEffects, EB: PeerEffects>(a: &mut Bridge<EA>, b: &mut Bridge<EB>) -> Result<(), BridgeError> {
    loop {
        let mut moved = false;
        while let Some(frame) = a.pop_outgoing_frame() {
            b.push_frame(frame)?;
            moved = true;
        }
        while let Some(frame) = b.pop_outgoing_frame() {
            a.push_frame(frame)?;
            moved = true;
        }
        if !moved {
            return Ok(());
        }
    }
}
