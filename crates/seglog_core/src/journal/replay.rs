//! Crash replay.

use super::Journal;
use crate::error::{JournalError, JournalResult};
use crate::format::SegmentHeader;
use crate::provider::SegmentProvider;
use crate::record::{decode_metadata, Delta};
use crate::scanner::ScanStop;
use crate::types::{JournalSeq, SegmentSeq};
use seglog_storage::{Paddr, SegmentId};
use std::ops::ControlFlow;

/// What a replay went through.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    /// Segments scanned.
    pub segments_replayed: usize,
    /// Record groups decoded.
    pub record_groups: usize,
    /// Records decoded.
    pub records: usize,
    /// Deltas handed to the handler.
    pub deltas: usize,
    /// Position of the last decoded record.
    pub last_position: Option<JournalSeq>,
}

/// A segment to scan and where to start.
#[derive(Debug)]
struct ReplaySegment {
    header: SegmentHeader,
    start: Paddr,
}

/// Orders segment headers and works out where replay starts.
///
/// The journal tail stored in the newest header names the oldest position
/// that still matters; segments before it are skipped.
fn prepare_replay(
    mut headers: Vec<(SegmentId, SegmentHeader)>,
    header_length: u32,
) -> JournalResult<Vec<ReplaySegment>> {
    headers.sort_by_key(|(_, header)| header.segment_seq);
    for pair in headers.windows(2) {
        if pair[0].1.segment_seq == pair[1].1.segment_seq {
            return Err(JournalError::malformed(format!(
                "segments {} and {} share sequence {}",
                pair[0].0, pair[1].0, pair[0].1.segment_seq
            )));
        }
    }
    for (id, header) in &headers {
        if header.physical_segment_id != *id {
            return Err(JournalError::malformed(format!(
                "segment {id} carries the header of segment {}",
                header.physical_segment_id
            )));
        }
    }

    let Some((_, newest)) = headers.last() else {
        return Ok(Vec::new());
    };
    let (first, first_offset) = match newest.journal_tail {
        Some(tail) => {
            let index = headers
                .iter()
                .position(|(_, header)| header.segment_seq == tail.segment_seq)
                .ok_or_else(|| {
                    JournalError::malformed(format!("journal tail {tail} names a missing segment"))
                })?;
            if headers[index].0 != tail.offset.segment {
                return Err(JournalError::malformed(format!(
                    "journal tail {tail} disagrees with segment {}",
                    headers[index].0
                )));
            }
            (index, tail.offset.offset.max(header_length))
        }
        None => (0, header_length),
    };

    Ok(headers
        .into_iter()
        .enumerate()
        .skip(first)
        .map(|(index, (id, header))| {
            let offset = if index == first { first_offset } else { header_length };
            ReplaySegment {
                header,
                start: Paddr::new(id, offset),
            }
        })
        .collect())
}

impl Journal {
    /// Replays the records of the segments in `headers`.
    ///
    /// Segments are visited in sequence order, starting at the journal tail
    /// recorded in the newest header. `handler` is called for every delta,
    /// in on-disk order, with the record's position and data address.
    ///
    /// Within a segment replay stops at the first record group that does
    /// not validate or decode: that is where the previous writer stopped.
    /// Afterwards the journal continues with the sequence after the newest
    /// segment and its commit watermark is the last decoded record.
    ///
    /// # Errors
    ///
    /// - [`JournalError::Malformed`] if the headers are inconsistent
    /// - [`JournalError::ProviderNotSet`] if no provider is set
    /// - Any device read error or error returned by `handler`, which abort
    ///   replay
    pub async fn replay<F>(
        &self,
        headers: Vec<(SegmentId, SegmentHeader)>,
        mut handler: F,
    ) -> JournalResult<ReplaySummary>
    where
        F: FnMut(JournalSeq, Paddr, &Delta) -> JournalResult<()>,
    {
        if self.submitter.is_open() {
            return Err(JournalError::invalid_operation(
                "cannot replay a journal that is open for write",
            ));
        }
        let provider = self.tracker.provider()?;
        let known: Vec<(SegmentId, SegmentSeq)> = headers
            .iter()
            .map(|(id, header)| (*id, header.segment_seq))
            .collect();
        let segments = prepare_replay(headers, self.tracker.header_length())?;
        let Some(newest) = known.iter().map(|(_, seq)| *seq).max() else {
            tracing::info!("nothing to replay");
            return Ok(ReplaySummary::default());
        };

        self.tracker.set_segment_seq(newest);
        for (id, seq) in known {
            provider.init_mark_segment_closed(id, seq);
        }
        if let Some(tail) = segments.last().and_then(|s| s.header.journal_tail) {
            provider.update_journal_tail_committed(tail);
        }

        let mut summary = ReplaySummary::default();
        for segment in &segments {
            let seq = segment.header.segment_seq;
            tracing::debug!(start = %segment.start, seq = %seq, "replaying segment");

            let outcome = self
                .reader
                .scan_valid_records(segment.start, segment.header.segment_nonce, |group| {
                    let layouts = group.records();
                    let mut decoded = Vec::with_capacity(layouts.len());
                    for layout in &layouts {
                        match decode_metadata(&layout.metadata) {
                            Some(metadata) => decoded.push(metadata),
                            None => {
                                tracing::warn!(position = %layout.position, "undecodable record metadata");
                                return Ok(ControlFlow::Break(()));
                            }
                        }
                    }

                    for (layout, metadata) in layouts.iter().zip(&decoded) {
                        let position = JournalSeq::new(seq, layout.position);
                        for delta in &metadata.deltas {
                            handler(position, layout.base, delta)?;
                            summary.deltas += 1;
                        }
                        summary.records += 1;
                        summary.last_position = Some(position);
                    }
                    summary.record_groups += 1;
                    Ok(ControlFlow::Continue(()))
                })
                .await?;

            summary.segments_replayed += 1;
            if outcome.stop != ScanStop::EndOfSegment {
                tracing::debug!(end = %outcome.end, stop = ?outcome.stop, "end of segment log");
            }
        }

        if summary.last_position.is_some() {
            self.tracker.set_committed_to(summary.last_position);
        }
        tracing::info!(
            segments = summary.segments_replayed,
            records = summary.records,
            deltas = summary.deltas,
            last = ?summary.last_position,
            "replay finished"
        );
        Ok(summary)
    }
}
