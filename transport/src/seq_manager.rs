use rustc_hash::FxHashSet;
use tracing::trace;
use crate::control_messages::ControlMessageAcks;
use crate::seq::Seq;

/// acknowledgement data to send to the peer
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct Feedback {
    pub una: Option<Seq>,
    pub acks: Vec<Seq>,
}

/// Tracks what the peer needs to be told about the seqs we received from it: the cumulative
///  UNA, and individual ACKs for seqs beyond it.
#[derive(Default)]
pub struct SeqManager {
    una: Option<Seq>,
    una_changed: bool,
    /// a duplicate arrived, so the peer probably missed our last UNA
    repeat_una: bool,

    /// received beyond the UNA and not acknowledged yet
    pending_acks: FxHashSet<Seq>,
    /// everything received beyond the UNA, for a full resync
    received_ahead: FxHashSet<Seq>,

    /// the peer asked for a full snapshot of our receive state
    pub require_force_sync: bool,
}

impl SeqManager {
    pub fn una(&self) -> Option<Seq> {
        self.una
    }

    #[cfg(test)]
    pub fn num_pending_acks(&self) -> usize {
        self.pending_acks.len()
    }

    pub fn update_last_una(&mut self, una: Seq) {
        if self.una == Some(una) {
            return;
        }
        self.una = Some(una);
        self.una_changed = true;
        self.pending_acks.retain(|s| !s.is_covered_by(una));
        self.received_ahead.retain(|s| !s.is_covered_by(una));
    }

    pub fn repeat_una(&mut self) {
        self.repeat_una = true;
    }

    pub fn new_received_seqs(&mut self, seqs: &[Seq]) {
        for &seq in seqs {
            if let Some(una) = self.una {
                if seq.is_covered_by(una) {
                    continue;
                }
            }
            self.pending_acks.insert(seq);
            self.received_ahead.insert(seq);
        }
    }

    pub fn need_sync_seq_status(&self) -> bool {
        self.una.is_some() && (self.una_changed || self.repeat_una || !self.pending_acks.is_empty())
    }

    /// Builds feedback for the peer: the UNA plus as many ACKs as fit into `acks_budget` bytes.
    ///  A full sync acknowledges everything received beyond the UNA rather than only what is
    ///  new. ACKs that do not fit stay pending.
    pub fn take_feedback(&mut self, acks_budget: usize, full_sync: bool) -> Feedback {
        let Some(una) = self.una else {
            return Feedback::default();
        };

        let max_acks = ControlMessageAcks::max_acks_for(acks_budget);
        let acks = if full_sync {
            self.pending_acks.clear();
            self.received_ahead.iter().copied().take(max_acks).collect::<Vec<_>>()
        }
        else {
            let acks = self.pending_acks.iter().copied().take(max_acks).collect::<Vec<_>>();
            for seq in &acks {
                self.pending_acks.remove(seq);
            }
            acks
        };

        trace!("feedback: UNA {}, {} ACKs, {} pending", una, acks.len(), self.pending_acks.len());
        self.una_changed = false;
        self.repeat_una = false;
        Feedback { una: Some(una), acks }
    }
}
