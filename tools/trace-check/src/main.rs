//! Correctness harness: replay trace scripts, audit the heap after every
//! request, and report utilization. The exit status is the number of failed
//! scripts.

use heap_trace::{Runner, StderrLogger, TraceScript};
use log::LevelFilter;
use std::env;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

const DEFAULT_SEGMENT_BYTES: usize = 4 << 20;

fn main() -> ExitCode {
    // args: [-q] [-d] [-z bytes] <script>...
    let mut quiet = false;
    let mut level = LevelFilter::Warn;
    let mut segment_bytes = DEFAULT_SEGMENT_BYTES;
    let mut scripts: Vec<PathBuf> = Vec::new();

    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-q" => quiet = true,
            "-d" => level = LevelFilter::Trace,
            "-z" => segment_bytes = number(args.next(), "-z"),
            _ => scripts.push(PathBuf::from(arg)),
        }
    }
    if scripts.is_empty() {
        eprintln!("usage: trace-check [-q] [-d] [-z bytes] <script>...");
        return ExitCode::FAILURE;
    }
    let _ = StderrLogger::new(level).init();

    let mut failures: u8 = 0;
    for path in &scripts {
        if !run_script(path, quiet, segment_bytes) {
            failures = failures.saturating_add(1);
        }
    }
    ExitCode::from(failures)
}

fn run_script(path: &Path, quiet: bool, segment_bytes: usize) -> bool {
    let script = match TraceScript::load(path) {
        Ok(script) => script,
        Err(error) => {
            println!("ALLOCATOR FAILURE [{}]: {error}", path.display());
            return false;
        }
    };
    let mut runner: Runner = match Runner::new(&script, segment_bytes) {
        Ok(runner) => runner,
        Err(error) => {
            println!("ALLOCATOR FAILURE [{}]: {error}", path.display());
            return false;
        }
    };

    for line in &script.lines {
        if let Err(error) = runner.exec(line) {
            failure(path, line.number, &error);
            return false;
        }
        if !quiet {
            if let Err(error) = runner.validate() {
                failure(path, line.number, &error);
                return false;
            }
        }
    }
    // One final audit even in quiet mode.
    if quiet {
        if let Err(error) = runner.validate() {
            let last = script.lines.last().map_or(0, |line| line.number);
            failure(path, last, &error);
            return false;
        }
    }

    let stats = runner.stats();
    println!(
        "{}: peak payload {} bytes, segment used {} bytes, utilization {:.1}%",
        path.display(),
        stats.peak_payload,
        stats.segment_used,
        stats.average_utilization
    );
    true
}

fn failure(path: &Path, line: usize, error: &dyn std::fmt::Display) {
    println!("ALLOCATOR FAILURE [{}, line {line}]: {error}", path.display());
}

fn number(arg: Option<String>, flag: &str) -> usize {
    arg.and_then(|value| value.parse().ok())
        .unwrap_or_else(|| panic!("{flag} expects a number"))
}
