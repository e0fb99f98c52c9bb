//! Drives a `Peer` against a real byte stream.
//!
//! A `Peer` owns `Rc`s internally, so it (and everything wrapping it) is
//! `!Send`. `PeerDriver` must be spawned with `tokio::task::spawn_local`
//! inside a `LocalSet`, never `tokio::spawn` — the compiler already refuses
//! the latter, but a `LocalSet` can still end up polled from the wrong
//! thread between two `.await` points if an embedder is careless with
//! thread pools, so each public entry point also checks a thread id
//! captured at construction.

use std::thread::ThreadId;

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, trace};

use capnp_rpc_core::{Peer, PeerEffects};

use crate::error::IoError;
use crate::framing::{FrameReader, FrameWriter};
use crate::limits::IoLimits;

pub struct PeerDriver<E: PeerEffects, R, W> {
    peer: Peer<E>,
    reader: FrameReader<R>,
    writer: FrameWriter<W>,
    home_thread: ThreadId,
}

impl<E, R, W> PeerDriver<E, R, W>
where
    E: PeerEffects,
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(peer: Peer<E>, reader: R, writer: W, limits: IoLimits) -> Self {
        Self {
            peer,
            reader: FrameReader::new(reader, limits),
            writer: FrameWriter::new(writer),
            home_thread: std::thread::current().id(),
        }
    }

    fn assert_home_thread(&self) {
        debug_assert_eq!(
            std::thread::current().id(),
            self.home_thread,
            "PeerDriver polled from a thread other than the one it was built on; \
             it must be driven via tokio::task::spawn_local inside a single LocalSet"
        );
    }

    pub fn peer(&self) -> &Peer<E> {
        self.assert_home_thread();
        &self.peer
    }

    pub fn peer_mut(&mut self) -> &mut Peer<E> {
        self.assert_home_thread();
        &mut self.peer
    }

    async fn flush_outbound(&mut self) -> Result<(), IoError> {
        self.assert_home_thread();
        while let Some(frame) = self.peer.pop_outbound_frame() {
            self.writer.write_frame(&frame).await?;
        }
        Ok(())
    }

    /// Runs until the stream closes cleanly with no outstanding partial
    /// frame. Any inbound frame that fails to dispatch is propagated; the
    /// caller decides whether that should tear down the connection.
    pub async fn run(&mut self) -> Result<(), IoError> {
        self.assert_home_thread();
        self.flush_outbound().await?;
        loop {
            let frame = match self.reader.read_frame().await? {
                Some(frame) => frame,
                None => {
                    debug!("peer stream closed cleanly");
                    return Ok(());
                }
            };
            trace!(bytes = frame.len(), "dispatching inbound frame");
            self.peer.dispatch(&frame)?;
            self.flush_outbound().await?;
        }
    }
}
