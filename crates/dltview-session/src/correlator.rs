use std::collections::VecDeque;

use dltview_types::RequestSeq;
use dltview_wire::is_ok_reply;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::RpcError;

pub type ReplyResult = Result<String, RpcError>;

struct PendingReply {
    seq: RequestSeq,
    command: &'static str,
    tx: oneshot::Sender<ReplyResult>,
}

/// Pairs text replies with requests in strict send order.
///
/// The engine does not echo any correlation id, so a reply always belongs to
/// the oldest request still waiting. Every request carries a local sequence
/// number; replies are paired in strictly increasing sequence order.
pub struct RpcCorrelator {
    next_seq: RequestSeq,
    last_resolved: Option<RequestSeq>,
    pending: VecDeque<PendingReply>,
    closed: bool,
}

impl Default for RpcCorrelator {
    fn default() -> Self {
        Self::new()
    }
}

impl RpcCorrelator {
    pub fn new() -> Self {
        Self {
            next_seq: RequestSeq::ONE,
            last_resolved: None,
            pending: VecDeque::new(),
            closed: false,
        }
    }

    /// Queues a completion slot. Must happen before the request is transmitted.
    pub fn enqueue(
        &mut self,
        command: &'static str,
    ) -> Result<(RequestSeq, oneshot::Receiver<ReplyResult>), RpcError> {
        if self.closed {
            return Err(RpcError::TransportClosed { command });
        }
        let seq = self.next_seq;
        self.next_seq = seq.next();
        let (tx, rx) = oneshot::channel();
        self.pending.push_back(PendingReply { seq, command, tx });
        Ok((seq, rx))
    }

    /// Fails a request that never reached the transport.
    pub fn fail(&mut self, seq: RequestSeq, err: RpcError) {
        let Some(pos) = self.pending.iter().position(|p| p.seq == seq) else {
            return;
        };
        if let Some(pending) = self.pending.remove(pos) {
            let _ = pending.tx.send(Err(err));
        }
    }

    /// Hands a text reply to the oldest waiting request.
    ///
    /// Returns the sequence number it was paired with, or `None` if nothing
    /// was waiting.
    pub fn resolve(&mut self, reply: String) -> Option<RequestSeq> {
        let Some(pending) = self.pending.pop_front() else {
            warn!(reply = %reply, "text reply without a pending request");
            return None;
        };
        if let Some(last) = self.last_resolved {
            assert!(
                pending.seq > last,
                "invariant violated: reply for {} paired after {last}",
                pending.seq
            );
        }
        self.last_resolved = Some(pending.seq);

        let result = if is_ok_reply(&reply) {
            Ok(reply)
        } else {
            Err(RpcError::Rejected {
                command: pending.command,
                detail: reply,
            })
        };
        if pending.tx.send(result).is_err() {
            debug!(seq = %pending.seq, command = pending.command, "reply receiver dropped");
        }
        Some(pending.seq)
    }

    /// Fails every waiting request and refuses new ones.
    pub fn close(&mut self) -> usize {
        self.closed = true;
        let failed = self.pending.len();
        for pending in self.pending.drain(..) {
            let _ = pending.tx.send(Err(RpcError::TransportClosed {
                command: pending.command,
            }));
        }
        failed
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}
