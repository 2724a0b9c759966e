use anyhow::bail;
use bytes::{Bytes, BytesMut};
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};
use crate::config::ArqConfig;

/// A segmented package for which not all segments were received yet
struct UncompletedPackage {
    /// number of segments, known once the last segment arrived
    segment_count: Option<u32>,
    cached_size: usize,
    created: Instant,
    discardable: bool,
    segments: BTreeMap<u32, Bytes>,
}

impl UncompletedPackage {
    fn new(discardable: bool, now: Instant) -> UncompletedPackage {
        UncompletedPackage {
            segment_count: None,
            cached_size: 0,
            created: now,
            discardable,
            segments: BTreeMap::new(),
        }
    }

    fn is_complete(&self) -> bool {
        self.segment_count == Some(self.segments.len() as u32)
    }

    fn assemble(self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.cached_size);
        for segment in self.segments.into_values() {
            buf.extend_from_slice(&segment);
        }
        buf.freeze()
    }
}

/// Caches segments of packages that were split across several datagrams, and reassembles them
///  once all segments are there. Memory is bounded: packages that are not completed within a
///  staleness threshold are dropped, and so are packages beyond the configured number of cached
///  segments (discardable packages first, then oldest first).
pub struct SegmentReassembler {
    packages: FxHashMap<u16, UncompletedPackage>,
    total_segments: usize,

    timeout: Duration,
    max_cached_segments: usize,
    max_package_len: usize,
}

#[derive(Debug, Eq, PartialEq)]
pub enum SegmentOutcome {
    /// waiting for more segments
    Pending,
    Completed(Bytes),
    /// the segment was a duplicate or belonged to a package that was dropped
    Ignored,
}

impl SegmentReassembler {
    pub fn new(config: &ArqConfig) -> SegmentReassembler {
        SegmentReassembler {
            packages: FxHashMap::default(),
            total_segments: 0,
            timeout: config.uncompleted_package_timeout,
            max_cached_segments: config.max_cached_segments,
            max_package_len: config.max_recv_package_length,
        }
    }

    #[cfg(test)]
    pub fn num_uncompleted_packages(&self) -> usize {
        self.packages.len()
    }

    #[cfg(test)]
    pub fn num_cached_segments(&self) -> usize {
        self.total_segments
    }

    /// Adds a segment. An `Err` means that the peer announced a package exceeding the maximum
    ///  package size, which is not recoverable.
    pub fn add_segment(
        &mut self,
        package_id: u16,
        segment_index: u32,
        is_last: bool,
        discardable: bool,
        data: Bytes,
        now: Instant,
    ) -> anyhow::Result<SegmentOutcome> {
        let package = self.packages.entry(package_id)
            .or_insert_with(|| UncompletedPackage::new(discardable, now));

        if package.segments.contains_key(&segment_index) {
            trace!("duplicate segment {} of package {}", segment_index, package_id);
            return Ok(SegmentOutcome::Ignored);
        }
        if let Some(count) = package.segment_count {
            if segment_index >= count || is_last {
                debug!("inconsistent segment {} for package {} with {} segments - dropping package", segment_index, package_id, count);
                self.remove_package(package_id);
                return Ok(SegmentOutcome::Ignored);
            }
        }
        if is_last {
            if let Some(highest) = package.segments.keys().next_back() {
                if *highest > segment_index {
                    debug!("last segment {} of package {} is below already received segment {} - dropping package", segment_index, package_id, highest);
                    self.remove_package(package_id);
                    return Ok(SegmentOutcome::Ignored);
                }
            }
        }

        package.cached_size += data.len();
        let cached_size = package.cached_size;
        package.segments.insert(segment_index, data);
        if is_last {
            package.segment_count = Some(segment_index + 1);
        }
        self.total_segments += 1;

        if cached_size > self.max_package_len {
            self.remove_package(package_id);
            bail!("segmented package {} exceeds the maximum package size of {} bytes", package_id, self.max_package_len);
        }

        let is_complete = self.packages.get(&package_id)
            .map(|p| p.is_complete())
            .unwrap_or(false);
        if is_complete {
            if let Some(package) = self.packages.remove(&package_id) {
                self.total_segments -= package.segments.len();
                trace!("reassembled package {} from {} segments", package_id, package.segments.len());
                return Ok(SegmentOutcome::Completed(package.assemble()));
            }
        }

        self.enforce_segment_limit(package_id);
        if self.packages.contains_key(&package_id) {
            Ok(SegmentOutcome::Pending)
        }
        else {
            Ok(SegmentOutcome::Ignored)
        }
    }

    /// drops all uncompleted packages that are older than the staleness threshold
    pub fn drop_expired(&mut self, now: Instant) {
        let timeout = self.timeout;
        let expired = self.packages.iter()
            .filter(|(_, p)| now.saturating_duration_since(p.created) > timeout)
            .map(|(&id, _)| id)
            .collect::<Vec<_>>();

        for package_id in expired {
            debug!("dropping expired uncompleted package {}", package_id);
            self.remove_package(package_id);
        }
    }

    fn remove_package(&mut self, package_id: u16) {
        if let Some(package) = self.packages.remove(&package_id) {
            self.total_segments -= package.segments.len();
        }
    }

    /// Evicts whole packages until the number of cached segments is within limits. Discardable
    ///  packages go first, then the oldest. The package that just received a segment is evicted
    ///  last.
    fn enforce_segment_limit(&mut self, current_package_id: u16) {
        while self.total_segments > self.max_cached_segments {
            let victim = self.packages.iter()
                .min_by_key(|(&id, p)| (id == current_package_id, !p.discardable, p.created))
                .map(|(&id, _)| id);

            match victim {
                Some(package_id) => {
                    debug!("too many cached segments - dropping uncompleted package {}", package_id);
                    self.remove_package(package_id);
                }
                None => break,
            }
        }
    }
}
