//! APCI sequence and timer state shared by both CS104 station roles.
//!
//! Pure state machine: callers feed received frames and the current time in,
//! and get back the frames to send and the queue entries confirmed by the
//! peer. Nothing here performs I/O.

use std::collections::VecDeque;

use tokio::time::Instant;
use tracing::{debug, warn};

use super::apci::{seq_distance, seq_next, Apci, UFunction};
use crate::error::{Iec60870Error, Result};
use crate::params::ApciParameters;

/// Action requested by [`ApciState::poll_timers`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerAction {
    /// T2 expired: acknowledge received I-frames with an S-frame.
    SendSFrame,
    /// T3 expired: test the idle connection with TESTFR act.
    SendTestFrame,
    /// T1 expired: the connection must be closed.
    Close,
}

#[derive(Debug, Clone)]
struct SentFrame {
    seq: u16,
    sent_at: Instant,
    tag: Option<u64>,
}

/// Sequence numbers, windows and timers of one CS104 connection.
#[derive(Debug)]
pub struct ApciState {
    params: ApciParameters,
    /// V(S): sequence number of the next I-frame to send
    send_seq: u16,
    /// V(R): sequence number of the next I-frame expected
    recv_seq: u16,
    /// Oldest sequence number not yet acknowledged by the peer
    ack_seq: u16,
    unconfirmed: VecDeque<SentFrame>,
    received_unacked: u16,
    first_unacked_at: Option<Instant>,
    last_received: Instant,
    /// Outstanding STARTDT or STOPDT act
    pending_u: Option<(UFunction, Instant)>,
    /// Outstanding TESTFR act
    pending_test: Option<Instant>,
}

impl ApciState {
    /// Create fresh state for a new connection.
    pub fn new(params: ApciParameters, now: Instant) -> Self {
        Self {
            params,
            send_seq: 0,
            recv_seq: 0,
            ack_seq: 0,
            unconfirmed: VecDeque::new(),
            received_unacked: 0,
            first_unacked_at: None,
            last_received: now,
            pending_u: None,
            pending_test: None,
        }
    }

    /// V(S)
    pub fn send_seq(&self) -> u16 {
        self.send_seq
    }

    /// V(R)
    pub fn recv_seq(&self) -> u16 {
        self.recv_seq
    }

    /// Number of sent I-frames awaiting acknowledgment.
    pub fn unconfirmed_count(&self) -> usize {
        self.unconfirmed.len()
    }

    /// True when K unconfirmed I-frames are outstanding.
    pub fn is_window_full(&self) -> bool {
        self.unconfirmed.len() >= self.params.k as usize
    }

    /// Allocate the APCI of the next I-frame.
    ///
    /// `tag` identifies the queue entry carried by the frame; it is returned
    /// once the peer acknowledges the frame.
    pub fn next_i_frame(&mut self, tag: Option<u64>, now: Instant) -> Result<Apci> {
        if self.is_window_full() {
            return Err(Iec60870Error::TooManyUnconfirmed(self.params.k));
        }
        let apci = Apci::i_frame(self.send_seq, self.recv_seq);
        self.unconfirmed.push_back(SentFrame {
            seq: self.send_seq,
            sent_at: now,
            tag,
        });
        self.send_seq = seq_next(self.send_seq);
        // An I-frame carries N(R) and acknowledges everything received so far
        self.received_unacked = 0;
        self.first_unacked_at = None;
        Ok(apci)
    }

    /// Build an S-frame acknowledging all received I-frames.
    pub fn s_frame(&mut self) -> Apci {
        self.received_unacked = 0;
        self.first_unacked_at = None;
        Apci::s_frame(self.recv_seq)
    }

    /// Record any received frame (restarts T3).
    pub fn on_frame_received(&mut self, now: Instant) {
        self.last_received = now;
    }

    /// Process N(R) from an I- or S-frame. Returns the tags of confirmed frames.
    pub fn on_ack(&mut self, ack: u16) -> Result<Vec<u64>> {
        let outstanding = seq_distance(self.ack_seq, self.send_seq);
        let acked = seq_distance(self.ack_seq, ack);
        if acked > outstanding {
            warn!(
                ack,
                oldest = self.ack_seq,
                next = self.send_seq,
                "acknowledgment outside send window"
            );
            return Err(Iec60870Error::InvalidAck {
                ack,
                oldest: self.ack_seq,
                next: self.send_seq,
            });
        }

        let mut confirmed = Vec::new();
        for _ in 0..acked {
            if let Some(frame) = self.unconfirmed.pop_front() {
                if let Some(tag) = frame.tag {
                    confirmed.push(tag);
                }
            }
        }
        self.ack_seq = ack;
        Ok(confirmed)
    }

    /// Process a received I-frame.
    ///
    /// Returns the confirmed tags and whether W unacknowledged frames have
    /// accumulated so that an S-frame must be sent now.
    pub fn on_i_frame(&mut self, send_seq: u16, recv_seq: u16, now: Instant) -> Result<(Vec<u64>, bool)> {
        if send_seq != self.recv_seq {
            warn!(
                expected = self.recv_seq,
                actual = send_seq,
                "receive sequence mismatch"
            );
            return Err(Iec60870Error::SequenceMismatch {
                expected: self.recv_seq,
                actual: send_seq,
            });
        }
        let confirmed = self.on_ack(recv_seq)?;
        self.recv_seq = seq_next(self.recv_seq);
        self.received_unacked += 1;
        self.first_unacked_at.get_or_insert(now);
        Ok((confirmed, self.received_unacked >= self.params.w))
    }

    /// Record a sent U-frame. Activations start T1 until confirmed.
    ///
    /// TESTFR is tracked apart from STARTDT/STOPDT so a keep-alive never
    /// blocks a data transfer request.
    pub fn on_u_sent(&mut self, function: UFunction, now: Instant) {
        match function {
            UFunction::TestFrAct => self.pending_test = Some(now),
            f if f.confirmation().is_some() => self.pending_u = Some((f, now)),
            _ => {}
        }
    }

    /// Process a received U-frame confirmation.
    ///
    /// Returns `true` if it answers the outstanding activation.
    pub fn on_u_confirm(&mut self, function: UFunction) -> bool {
        if function == UFunction::TestFrCon {
            return self.pending_test.take().is_some();
        }
        match self.pending_u {
            Some((act, _)) if act.confirmation() == Some(function) => {
                self.pending_u = None;
                true
            }
            _ => {
                debug!(?function, "unsolicited U-frame confirmation");
                false
            }
        }
    }

    /// Outstanding STARTDT/STOPDT activation, if any.
    pub fn pending_activation(&self) -> Option<UFunction> {
        self.pending_u.map(|(f, _)| f)
    }

    /// Evaluate T1, T2 and T3.
    pub fn poll_timers(&mut self, now: Instant) -> Option<TimerAction> {
        let t1_expired = |since: Instant| now.saturating_duration_since(since) >= self.params.t1;

        if let Some(frame) = self.unconfirmed.front() {
            if t1_expired(frame.sent_at) {
                warn!(seq = frame.seq, "T1 expired waiting for acknowledgment");
                return Some(TimerAction::Close);
            }
        }
        if let Some((function, sent_at)) = self.pending_u {
            if t1_expired(sent_at) {
                warn!(?function, "T1 expired waiting for U-frame confirmation");
                return Some(TimerAction::Close);
            }
        }
        if let Some(since) = self.first_unacked_at {
            if now.saturating_duration_since(since) >= self.params.t2 {
                return Some(TimerAction::SendSFrame);
            }
        }
        if let Some(sent_at) = self.pending_test {
            if t1_expired(sent_at) {
                warn!("T1 expired waiting for TESTFR con");
                return Some(TimerAction::Close);
            }
        }
        if self.pending_test.is_none()
            && now.saturating_duration_since(self.last_received) >= self.params.t3
        {
            return Some(TimerAction::SendTestFrame);
        }
        None
    }

    /// Detach the queue entries from all unconfirmed frames and return their
    /// tags, oldest first.
    ///
    /// The frames keep their place in the send window, so a later
    /// acknowledgment of them confirms nothing.
    pub fn release_unconfirmed(&mut self) -> Vec<u64> {
        self.unconfirmed
            .iter_mut()
            .filter_map(|f| f.tag.take())
            .collect()
    }

    /// Forget all sequence and timer state, as for a new connection.
    pub fn reset(&mut self, now: Instant) {
        *self = Self::new(self.params, now);
    }
}
