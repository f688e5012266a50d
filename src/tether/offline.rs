//! Offline status mode: answers server-list status and ping queries while no
//! tunnel to the origin is available.
//!
//! The state machine is sans-IO. The relay feeds it whatever the socket
//! produced and writes back whatever it returns.

use std::sync::Arc;

use bytes::{Buf, Bytes, BytesMut};

use crate::tether::{
    protocol::{self, CodecError},
    status::StatusResponder,
};

const HANDSHAKE_ID: u32 = 0x00;
const STATUS_REQUEST_ID: u32 = 0x00;
const PING_ID: u32 = 0x01;

/// Unparsed bytes allowed to pile up before the peer is considered hostile.
pub const MAX_BUFFERED_BYTES: usize = 64 * 1024;

/// Raw bytes kept for replay into a tunnel on switchover.
pub const MAX_REPLAY_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Handshake,
    Status,
    /// No recovery point left in the stream; the connection should be dropped.
    Failed,
}

#[derive(Debug)]
pub struct OfflineSession {
    responder: Arc<StatusResponder>,
    phase: Phase,
    buf: BytesMut,
    replay: BytesMut,
    replay_overflow: bool,
    answered_status: bool,
}

impl OfflineSession {
    pub fn new(responder: Arc<StatusResponder>) -> Self {
        Self {
            responder,
            phase: Phase::Handshake,
            buf: BytesMut::new(),
            replay: BytesMut::new(),
            replay_overflow: false,
            answered_status: false,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Consume a chunk read from the client and return the packets to write
    /// back, in order.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        if self.phase == Phase::Failed {
            return Vec::new();
        }

        if !self.replay_overflow {
            if self.replay.len() + chunk.len() > MAX_REPLAY_BYTES {
                self.replay_overflow = true;
                self.replay = BytesMut::new();
            } else {
                self.replay.extend_from_slice(chunk);
            }
        }

        self.buf.extend_from_slice(chunk);

        let mut out = Vec::new();
        loop {
            match protocol::decode_packet(&self.buf) {
                Ok((frame, n)) => {
                    self.buf.advance(n);
                    if let Some(reply) = self.on_frame(frame) {
                        out.push(reply);
                    }
                }
                Err(CodecError::Incomplete) => break,
                Err(CodecError::MalformedFrame { consumed }) => {
                    tracing::debug!(consumed, "offline: skipped malformed frame");
                    self.buf.advance(consumed);
                }
                Err(CodecError::Malformed) => {
                    tracing::debug!("offline: malformed length prefix");
                    self.fail();
                    break;
                }
            }
        }

        if self.buf.len() > MAX_BUFFERED_BYTES {
            tracing::debug!(buffered = self.buf.len(), "offline: too much unparsed data");
            self.fail();
        }

        out
    }

    fn on_frame(&mut self, frame: protocol::Frame) -> Option<Bytes> {
        match (self.phase, frame.id) {
            (Phase::Handshake, HANDSHAKE_ID) => {
                self.phase = Phase::Status;
                None
            }
            (Phase::Status, STATUS_REQUEST_ID) => {
                self.answered_status = true;
                metrics::counter!("tether_offline_replies_total").increment(1);
                Some(self.responder.packet())
            }
            (Phase::Status, PING_ID) => Some(protocol::encode_packet(PING_ID, &frame.body)),
            _ => None,
        }
    }

    fn fail(&mut self) {
        self.phase = Phase::Failed;
        self.buf.clear();
    }

    /// Whether the connection may still be handed to a tunnel.
    ///
    /// Once a status reply went out locally the real server must not see the
    /// same query again.
    pub fn can_switch(&self) -> bool {
        !self.answered_status && !self.replay_overflow && self.phase != Phase::Failed
    }

    /// Every byte the client has sent so far.
    pub fn replay(&self) -> Bytes {
        Bytes::copy_from_slice(&self.replay)
    }
}
