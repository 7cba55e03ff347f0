//! # Trace Scripts and Harness Adapters
//!
//! The host-side layer between the allocator core and the driver binaries:
//! parsing of `a`/`r`/`f` trace scripts, the segment provider that backs each
//! run, and the [`Runner`] that replays requests while measuring peak
//! payload, touched segment bytes, and utilization.
//!
//! The allocator itself lives in `heap-alloc` and stays `no_std`; everything
//! here assumes a hosted environment.

mod harness;
mod logger;
mod script;
mod segment;

pub use harness::{HarnessError, Runner, Stats};
pub use logger::StderrLogger;
pub use script::{Request, ScriptError, TraceLine, TraceScript};
pub use segment::{SegmentBuffer, SegmentError};
