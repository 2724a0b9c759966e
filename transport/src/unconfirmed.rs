use rustc_hash::FxHashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};
use crate::packet_header::Section;
use crate::seq::Seq;

/// a tracked section that was sent but not acknowledged yet
struct UnconfirmedSection {
    section: Section,
    /// insertion order, used for resending oldest first
    order: u64,
    last_sent: Instant,
    resent_count: u32,
    /// the data is worthless after this, so there is no point in resending it
    expires: Option<Instant>,
}

/// round trip samples from acknowledged sections
#[derive(Debug, Default, Clone, Copy, Eq, PartialEq)]
pub struct AckStats {
    pub count: usize,
    pub total_delay: Duration,
}

impl AckStats {
    fn add(&mut self, entry: &UnconfirmedSection, now: Instant) {
        // only sections that were never resent give unambiguous round trip times
        if entry.resent_count == 0 {
            self.count += 1;
            self.total_delay += now.saturating_duration_since(entry.last_sent);
        }
    }
}

/// The sender's ledger of tracked sections awaiting acknowledgement, keyed by seq
#[derive(Default)]
pub struct UnconfirmedLedger {
    sections: FxHashMap<Seq, UnconfirmedSection>,
    next_order: u64,
}

impl UnconfirmedLedger {
    pub fn len(&self) -> usize {
        self.sections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }

    #[cfg(test)]
    pub fn contains(&self, seq: Seq) -> bool {
        self.sections.contains_key(&seq)
    }

    pub fn insert(&mut self, section: Section, now: Instant, expires: Option<Instant>) {
        let order = self.next_order;
        self.next_order += 1;
        self.sections.insert(section.seq, UnconfirmedSection {
            section,
            order,
            last_sent: now,
            resent_count: 0,
            expires,
        });
    }

    /// Gives up on sections whose data expired. The peer skips the resulting gap after a timeout.
    pub fn drop_expired(&mut self, now: Instant) -> usize {
        let before = self.sections.len();
        self.sections.retain(|seq, entry| {
            let expired = entry.expires.is_some_and(|e| e <= now);
            if expired {
                debug!("dropping expired unconfirmed section {}", seq);
            }
            !expired
        });
        before - self.sections.len()
    }

    /// removes everything covered by a cumulative acknowledgement
    pub fn clean_by_una(&mut self, una: Seq, now: Instant) -> AckStats {
        let mut stats = AckStats::default();
        self.sections.retain(|seq, entry| {
            if seq.is_covered_by(una) {
                stats.add(entry, now);
                false
            }
            else {
                true
            }
        });
        if stats.count > 0 {
            trace!("UNA {} confirmed {} sections", una, stats.count);
        }
        stats
    }

    pub fn clean_by_acks(&mut self, acks: &[Seq], now: Instant) -> AckStats {
        let mut stats = AckStats::default();
        for seq in acks {
            if let Some(entry) = self.sections.remove(seq) {
                stats.add(&entry, now);
            }
        }
        stats
    }

    /// seqs that were last sent at or before `threshold`, oldest first
    pub fn overdue(&self, threshold: Instant) -> Vec<Seq> {
        let mut overdue = self.sections.iter()
            .filter(|(_, entry)| entry.last_sent <= threshold)
            .map(|(seq, entry)| (entry.order, *seq))
            .collect::<Vec<_>>();
        overdue.sort_unstable_by_key(|(order, _)| *order);
        overdue.into_iter()
            .map(|(_, seq)| seq)
            .collect()
    }

    /// registers a resend and returns the section to put on the wire
    pub fn mark_resent(&mut self, seq: Seq, now: Instant) -> Option<Section> {
        let entry = self.sections.get_mut(&seq)?;
        entry.last_sent = now;
        entry.resent_count += 1;
        Some(entry.section.clone())
    }

    /// Fills `byte_budget` with overdue sections (by their combined length), oldest first, marking
    ///  them as resent. Sections that do not fit are skipped, so a big one does not block smaller
    ///  ones behind it.
    pub fn fetch_overdue(&mut self, threshold: Instant, now: Instant, byte_budget: usize, max_count: usize) -> Vec<Section> {
        let mut remaining = byte_budget;
        let mut result = Vec::new();
        for seq in self.overdue(threshold) {
            if result.len() >= max_count {
                break;
            }
            let Some(entry) = self.sections.get(&seq) else {
                continue;
            };
            let len = entry.section.combined_len();
            if len > remaining {
                continue;
            }
            remaining -= len;
            if let Some(section) = self.mark_resent(seq, now) {
                result.push(section);
            }
        }
        result
    }

    /// the oldest overdue section regardless of size
    pub fn fetch_first_overdue(&mut self, threshold: Instant, now: Instant) -> Option<Section> {
        let seq = *self.overdue(threshold).first()?;
        self.mark_resent(seq, now)
    }

    #[cfg(test)]
    pub fn max_resent_count(&self) -> u32 {
        self.sections.values()
            .map(|e| e.resent_count)
            .max()
            .unwrap_or(0)
    }
}
