//! Transaction state for the request/response discipline
//!
//! At most one request is pending at a time, because every request is
//! issued from the driver task and awaited before the next one. The
//! matcher peels the matching frame off the receive path; everything else
//! flows to the control-plane dispatch.

use ncplink_core::{Command, Header, PropKey, Tid};

use crate::config::FRAME_BUFFER_SIZE;
use crate::hdlc::Decoder;

/// The request currently awaiting its response.
pub(crate) struct Pending {
    pub tid: Tid,
    /// Expected response command.
    pub command: Command,
    /// Expected response key.
    pub key: PropKey,
    pub received: bool,
    pub success: bool,
    /// Argument range within the decoder scratch.
    pub args: (usize, usize),
}

pub(crate) struct Transport {
    pub decoder: Decoder<FRAME_BUFFER_SIZE>,
    pub tx_frame: [u8; FRAME_BUFFER_SIZE],
    pub pending: Option<Pending>,
    tid: Tid,
}

impl Transport {
    pub fn new() -> Self {
        Self {
            decoder: Decoder::new(),
            tx_frame: [0; FRAME_BUFFER_SIZE],
            pending: None,
            tid: Tid::default(),
        }
    }

    /// Draws the next rolling transaction identifier.
    pub fn next_tid(&mut self) -> Tid {
        self.tid = self.tid.next();
        self.tid
    }

    /// Registers what the next response must look like.
    pub fn expect(&mut self, tid: Tid, command: Command, key: PropKey) {
        self.pending = Some(Pending {
            tid,
            command,
            key,
            received: false,
            success: false,
            args: (0, 0),
        });
    }

    pub fn response_received(&self) -> bool {
        self.pending.as_ref().is_some_and(|p| p.received)
    }

    /// Decides whether an inbound frame answers the pending request.
    ///
    /// With an ordinary identifier, any frame carrying that identifier is
    /// the answer; it is a success only when (command, key) also match,
    /// otherwise the NCP substituted a failure report (typically a
    /// last-status carrying its error code). With the don't-care
    /// identifier the (command, key) pair alone decides, and a match is
    /// always a success.
    pub fn match_response(&mut self, header: Header, command: Command, key: PropKey) -> bool {
        let Some(pending) = self.pending.as_mut() else {
            return false;
        };
        if pending.received {
            return false;
        }

        if !pending.tid.is_dont_care() {
            if header.tid() == pending.tid {
                if pending.command == command && pending.key == key {
                    pending.success = true;
                }
                return true;
            }
            false
        } else if pending.command == command && pending.key == key {
            pending.success = true;
            true
        } else {
            false
        }
    }
}
