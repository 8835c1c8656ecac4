//! Cuts labeled frames out of the raw byte stream.
//!
//! A [`Chunker`] is created per connection session with the matchers
//! for every frame shape the instrument can emit. Raw reads are pushed
//! in as they arrive; complete frames come back out in stream order as
//! [`Chunk`]s carrying absolute byte offsets. Bytes that belong to a
//! sync-matched but not-yet-complete binary frame stay buffered until
//! the rest shows up.
//!
//! The command engine can [`claim`](Chunker::claim_next) the next frame
//! of a given label so that a config block read back over the command
//! channel is not republished as a sample.

use std::collections::{HashMap, VecDeque};

use bytes::{Bytes, BytesMut};
use regex::bytes::Regex;
use tracing::{debug, warn};

use crate::codec::{self, FrameSpec};

const DEFAULT_MAX_BUFFER: usize = 64 * 1024;

/// One frame shape the chunker looks for.
#[derive(Debug, Clone)]
pub enum ChunkMatcher {
    /// Fixed-length binary frame identified by its sync prefix and
    /// guarded by the trailing checksum. Strict matchers silently
    /// consume frames whose checksum fails; lenient matchers emit them
    /// flagged with `checksum_ok = false`.
    Binary { spec: FrameSpec, lenient: bool },
    /// Pattern-delimited text record. The pattern must include the
    /// record terminator, otherwise a partially arrived record can
    /// match early.
    Text { label: &'static str, pattern: Regex },
}

/// A complete frame cut from the stream.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub label: &'static str,
    pub data: Bytes,
    /// Absolute offset of the first byte, counted from session start.
    pub start: u64,
    /// Absolute offset one past the last byte.
    pub end: u64,
    /// `false` only for frames a lenient binary matcher let through.
    pub checksum_ok: bool,
}

/// A claim fulfilled by the chunker: the byte range of a frame that was
/// consumed by the command engine instead of being published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimedRange {
    pub label: &'static str,
    pub start: u64,
    pub end: u64,
}

struct Candidate {
    start: usize,
    len: usize,
    label: &'static str,
    checksum_ok: bool,
    /// Strict checksum failures consume bytes without emitting.
    emit: bool,
}

enum BinaryScan {
    Nothing,
    /// Sync seen at this offset but the frame tail has not arrived.
    Incomplete(usize),
    Complete(Candidate),
}

pub struct Chunker {
    matchers: Vec<ChunkMatcher>,
    buf: BytesMut,
    /// Absolute offset of `buf[0]`.
    base: u64,
    ready: VecDeque<Chunk>,
    claims: HashMap<&'static str, usize>,
    claimed: Vec<ClaimedRange>,
    max_buffer: usize,
}

impl Chunker {
    pub fn new(matchers: Vec<ChunkMatcher>) -> Self {
        Self {
            matchers,
            buf: BytesMut::new(),
            base: 0,
            ready: VecDeque::new(),
            claims: HashMap::new(),
            claimed: Vec::new(),
            max_buffer: DEFAULT_MAX_BUFFER,
        }
    }

    pub fn with_max_buffer(mut self, max_buffer: usize) -> Self {
        self.max_buffer = max_buffer;
        self
    }

    /// Reserve the next emitted frame with this label for the caller.
    /// Claims stack; each one swallows exactly one frame.
    pub fn claim_next(&mut self, label: &'static str) {
        *self.claims.entry(label).or_insert(0) += 1;
    }

    /// Byte ranges of frames consumed by claims this session.
    pub fn claimed_ranges(&self) -> &[ClaimedRange] {
        &self.claimed
    }

    /// Append freshly read bytes and sieve out whatever completed.
    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
        self.sieve();
        self.enforce_cap();
    }

    /// Earliest completed frame, if any.
    pub fn next_chunk(&mut self) -> Option<Chunk> {
        self.ready.pop_front()
    }

    /// Drop buffered bytes and pending claims, keeping the offset
    /// counter running.
    pub fn clear(&mut self) {
        self.base += self.buf.len() as u64;
        self.buf.clear();
        self.ready.clear();
        self.claims.clear();
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    fn sieve(&mut self) {
        loop {
            let mut best: Option<Candidate> = None;
            let mut first_incomplete: Option<usize> = None;

            for matcher in &self.matchers {
                let found = match matcher {
                    ChunkMatcher::Binary { spec, lenient } => {
                        match scan_binary(&self.buf, spec, *lenient) {
                            BinaryScan::Nothing => None,
                            BinaryScan::Incomplete(at) => {
                                first_incomplete =
                                    Some(first_incomplete.map_or(at, |cur| cur.min(at)));
                                None
                            }
                            BinaryScan::Complete(c) => Some(c),
                        }
                    }
                    ChunkMatcher::Text { label, pattern } => {
                        pattern.find(&self.buf).map(|m| Candidate {
                            start: m.start(),
                            len: m.end() - m.start(),
                            label,
                            checksum_ok: true,
                            emit: true,
                        })
                    }
                };
                if let Some(c) = found {
                    let earlier = best.as_ref().map_or(true, |b| c.start < b.start);
                    if earlier {
                        best = Some(c);
                    }
                }
            }

            let Some(candidate) = best else {
                break;
            };
            // A partial frame ahead of the candidate owns those bytes;
            // wait for it to resolve before emitting anything behind it.
            if first_incomplete.is_some_and(|at| at < candidate.start) {
                break;
            }
            self.take(candidate);
        }
    }

    fn take(&mut self, candidate: Candidate) {
        if candidate.start > 0 {
            let _ = self.buf.split_to(candidate.start);
            self.base += candidate.start as u64;
        }
        let data = self.buf.split_to(candidate.len).freeze();
        let start = self.base;
        let end = start + candidate.len as u64;
        self.base = end;

        if !candidate.emit {
            warn!(stream = candidate.label, start, "dropping frame with bad checksum");
            return;
        }
        if !candidate.checksum_ok {
            warn!(stream = candidate.label, start, "passing frame with bad checksum");
        }
        if let Some(count) = self.claims.get_mut(candidate.label) {
            if *count > 0 {
                *count -= 1;
                debug!(stream = candidate.label, start, end, "frame taken by claim");
                self.claimed.push(ClaimedRange {
                    label: candidate.label,
                    start,
                    end,
                });
                return;
            }
        }
        self.ready.push_back(Chunk {
            label: candidate.label,
            data,
            start,
            end,
            checksum_ok: candidate.checksum_ok,
        });
    }

    fn enforce_cap(&mut self) {
        if self.buf.len() <= self.max_buffer {
            return;
        }
        let dropped = self.buf.len() - self.max_buffer;
        let _ = self.buf.split_to(dropped);
        self.base += dropped as u64;
        warn!(dropped, "unframed buffer over limit, discarding oldest bytes");
    }
}

fn scan_binary(buf: &[u8], spec: &FrameSpec, lenient: bool) -> BinaryScan {
    match codec::find_sub(buf, spec.sync) {
        None => BinaryScan::Nothing,
        Some(at) if buf.len() - at < spec.length => BinaryScan::Incomplete(at),
        Some(at) => {
            let ok = spec.checksum_ok(&buf[at..at + spec.length]);
            BinaryScan::Complete(Candidate {
                start: at,
                len: spec.length,
                label: spec.label,
                checksum_ok: ok,
                emit: ok || lenient,
            })
        }
    }
}
