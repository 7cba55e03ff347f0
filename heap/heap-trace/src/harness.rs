//! Harness adapters: replay parsed trace scripts against a live heap and
//! account for payload, peak occupancy, and utilization along the way.

use crate::script::{Request, TraceLine, TraceScript};
use crate::segment::{SegmentBuffer, SegmentError};
use heap_alloc::{FreeIndex, Heap, HeapAuditError, InitError, RbIndex};
use std::ptr::NonNull;
use std::time::{Duration, Instant};

#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error(transparent)]
    Segment(#[from] SegmentError),
    #[error(transparent)]
    Init(#[from] InitError),
    #[error("id {id} is out of range (script declares {declared})")]
    IdOutOfRange { id: usize, declared: usize },
    #[error("id {id} already holds a block")]
    SlotBusy { id: usize },
    #[error("allocate({size}) returned null")]
    AllocFailed { size: usize },
    #[error("reallocate({size}) returned null")]
    ReallocFailed { size: usize },
    #[error("heap audit failed: {0}")]
    Audit(#[from] HeapAuditError),
}

/// End-of-run measurements.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Stats {
    /// Largest payload total ever in flight, in bytes.
    pub peak_payload: usize,
    /// Bytes of the segment the heap ever reached into.
    pub segment_used: usize,
    /// Mean of payload-in-use over segment-used across requests, in percent.
    pub average_utilization: f64,
}

#[derive(Copy, Clone, Default)]
struct Slot {
    ptr: Option<NonNull<u8>>,
    size: usize,
}

/// Replays trace requests against one heap instance.
///
/// The runner wires three adapters together for external drivers: request
/// execution ([`exec`](Self::exec), [`exec_timed`](Self::exec_timed)) and
/// whole-heap validation ([`validate`](Self::validate)).
pub struct Runner<I: FreeIndex = RbIndex> {
    heap: Heap<I>,
    segment: SegmentBuffer,
    slots: Vec<Slot>,
    payload_in_use: usize,
    peak_payload: usize,
    extent: usize,
    utilization_sum: f64,
    utilization_samples: u32,
}

impl<I: FreeIndex> Runner<I> {
    /// Build a runner over a fresh segment of `segment_bytes`, sized for the
    /// ids `script` declares.
    ///
    /// # Errors
    /// Segment reservation or heap initialization failure.
    pub fn new(script: &TraceScript, segment_bytes: usize) -> Result<Self, HarnessError> {
        let segment = SegmentBuffer::new(segment_bytes)?;
        // SAFETY: the buffer is exclusive to this runner and outlives the heap.
        let heap = unsafe { Heap::init(segment.start(), segment.len()) }?;
        Ok(Self {
            heap,
            segment,
            slots: vec![Slot::default(); script.id_count()],
            payload_in_use: 0,
            peak_payload: 0,
            extent: 0,
            utilization_sum: 0.0,
            utilization_samples: 0,
        })
    }

    /// Execute one request (the `exec_request` adapter).
    ///
    /// # Errors
    /// Out-of-range or busy ids, and denied allocations.
    pub fn exec(&mut self, line: &TraceLine) -> Result<(), HarnessError> {
        match line.request {
            Request::Alloc { id, size } => {
                self.check_id(id)?;
                if self.slots[id].ptr.is_some() {
                    return Err(HarnessError::SlotBusy { id });
                }
                let ptr = self
                    .heap
                    .allocate(size)
                    .ok_or(HarnessError::AllocFailed { size })?;
                self.payload_in_use += size;
                self.note_extent(ptr);
                self.slots[id] = Slot {
                    ptr: Some(ptr),
                    size,
                };
            }
            Request::Realloc { id, size } => {
                self.check_id(id)?;
                let old = self.slots[id];
                // SAFETY: the slot pointer came from this heap.
                let ptr = unsafe { self.heap.reallocate(old.ptr, size) };
                self.payload_in_use -= old.size;
                match ptr {
                    Some(ptr) => {
                        self.payload_in_use += size;
                        self.note_extent(ptr);
                        self.slots[id] = Slot {
                            ptr: Some(ptr),
                            size,
                        };
                    }
                    None => {
                        // Failure released the old block (and size 0 is a
                        // plain free): the slot is empty either way.
                        self.slots[id] = Slot::default();
                        if size != 0 {
                            return Err(HarnessError::ReallocFailed { size });
                        }
                    }
                }
            }
            Request::Free { id } => {
                self.check_id(id)?;
                let old = std::mem::take(&mut self.slots[id]);
                // SAFETY: the slot pointer came from this heap.
                unsafe { self.heap.deallocate(old.ptr) };
                self.payload_in_use -= old.size;
            }
        }
        self.sample_utilization();
        Ok(())
    }

    /// Execute one request under a wall-clock stopwatch (the `time_request`
    /// adapter).
    ///
    /// # Errors
    /// As [`exec`](Self::exec).
    pub fn exec_timed(&mut self, line: &TraceLine) -> Result<Duration, HarnessError> {
        let started = Instant::now();
        self.exec(line)?;
        Ok(started.elapsed())
    }

    /// Run the whole-heap audit (the `validate_heap` adapter).
    ///
    /// # Errors
    /// The first invariant violation.
    pub fn validate(&self) -> Result<(), HarnessError> {
        self.heap.audit()?;
        Ok(())
    }

    #[must_use]
    pub fn free_block_count(&self) -> usize {
        self.heap.free_block_count()
    }

    #[must_use]
    pub const fn heap(&self) -> &Heap<I> {
        &self.heap
    }

    /// Render the free-index contents (the inspector's breakpoint view).
    #[must_use]
    pub fn free_index_contents(&self, verbose: bool) -> String {
        let mut out = String::new();
        // Infallible for String sinks.
        let _ = self.heap.write_free_index(&mut out, verbose);
        out
    }

    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn stats(&self) -> Stats {
        let average = if self.utilization_samples == 0 {
            0.0
        } else {
            100.0 * self.utilization_sum / f64::from(self.utilization_samples)
        };
        Stats {
            peak_payload: self.peak_payload,
            segment_used: self.extent,
            average_utilization: average,
        }
    }

    fn check_id(&self, id: usize) -> Result<(), HarnessError> {
        if id < self.slots.len() {
            Ok(())
        } else {
            Err(HarnessError::IdOutOfRange {
                id,
                declared: self.slots.len(),
            })
        }
    }

    fn note_extent(&mut self, ptr: NonNull<u8>) {
        // SAFETY: `ptr` is live and was returned by this heap.
        let payload = unsafe { self.heap.payload_size(ptr) };
        let base = self.segment.start().as_ptr() as usize;
        let end = ptr.as_ptr() as usize + payload - base;
        self.extent = self.extent.max(end);
    }

    #[allow(clippy::cast_precision_loss)]
    fn sample_utilization(&mut self) {
        self.peak_payload = self.peak_payload.max(self.payload_in_use);
        if self.extent > 0 {
            self.utilization_sum += self.payload_in_use as f64 / self.extent as f64;
            self.utilization_samples += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::TraceScript;

    fn run(script_text: &str) -> (Runner, TraceScript) {
        let script = TraceScript::parse(script_text).unwrap();
        let mut runner: Runner<RbIndex> = Runner::new(&script, 1 << 16).unwrap();
        for line in &script.lines {
            runner.exec(line).unwrap();
            runner.validate().unwrap();
        }
        (runner, script)
    }

    #[test]
    fn replays_a_mixed_script() {
        let (runner, _) = run(
            "a 0 128\n\
             a 1 512\n\
             r 0 1024\n\
             f 1\n\
             f 0\n",
        );
        assert_eq!(runner.free_block_count(), 1);
        let stats = runner.stats();
        assert_eq!(stats.peak_payload, 1024 + 512);
        assert!(stats.segment_used >= stats.peak_payload);
        assert!(stats.average_utilization > 0.0);
    }

    #[test]
    fn realloc_to_zero_empties_the_slot() {
        let (runner, _) = run("a 0 64\nr 0 0\n");
        assert_eq!(runner.stats().peak_payload, 64);
        assert_eq!(runner.free_block_count(), 1);
    }

    #[test]
    fn free_of_an_empty_slot_is_a_no_op() {
        let (runner, _) = run("f 3\n");
        assert_eq!(runner.free_block_count(), 1);
    }

    #[test]
    fn out_of_range_id_is_refused() {
        let script = TraceScript::parse("a 0 64\n").unwrap();
        let mut runner: Runner<RbIndex> = Runner::new(&script, 1 << 16).unwrap();
        let bogus = TraceLine {
            number: 1,
            request: Request::Alloc { id: 7, size: 8 },
        };
        assert!(matches!(
            runner.exec(&bogus),
            Err(HarnessError::IdOutOfRange { id: 7, declared: 1 })
        ));
    }

    #[test]
    fn oversized_allocation_reports_failure() {
        let script = TraceScript::parse("a 0 1048576\n").unwrap();
        let mut runner: Runner<RbIndex> = Runner::new(&script, 4096).unwrap();
        assert!(matches!(
            runner.exec(&script.lines[0]),
            Err(HarnessError::AllocFailed { size: 1_048_576 })
        ));
    }

    #[test]
    fn timing_adapter_executes_the_request() {
        let script = TraceScript::parse("a 0 256\n").unwrap();
        let mut runner: Runner<RbIndex> = Runner::new(&script, 1 << 16).unwrap();
        let elapsed = runner.exec_timed(&script.lines[0]).unwrap();
        assert!(elapsed <= Duration::from_secs(1));
        assert_eq!(runner.free_block_count(), 1);
    }
}
