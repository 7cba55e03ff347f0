//! Timing harness: replay one trace script and report elapsed time over
//! chosen request intervals.
//!
//! Intervals are given as `-s start [-e end]` pairs of 1-based request
//! ordinals (comments and blank lines do not count); they must not overlap.
//! Without `-s` the whole script is timed.

use heap_trace::{Runner, StderrLogger, TraceScript};
use log::LevelFilter;
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

const DEFAULT_SEGMENT_BYTES: usize = 4 << 20;

struct Interval {
    start: usize,
    end: Option<usize>,
}

fn main() -> ExitCode {
    // args: (-s start [-e end])... [-z bytes] <script>
    let mut intervals: Vec<Interval> = Vec::new();
    let mut segment_bytes = DEFAULT_SEGMENT_BYTES;
    let mut script_path: Option<PathBuf> = None;

    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-s" => intervals.push(Interval {
                start: number(args.next(), "-s"),
                end: None,
            }),
            "-e" => match intervals.last_mut() {
                Some(open) if open.end.is_none() => open.end = Some(number(args.next(), "-e")),
                _ => return usage("-e without a preceding -s"),
            },
            "-z" => segment_bytes = number(args.next(), "-z"),
            _ => script_path = Some(PathBuf::from(arg)),
        }
    }
    let Some(path) = script_path else {
        return usage("missing script");
    };
    let _ = StderrLogger::new(LevelFilter::Warn).init();

    let script = match TraceScript::load(&path) {
        Ok(script) => script,
        Err(error) => {
            eprintln!("{}: {error}", path.display());
            return ExitCode::FAILURE;
        }
    };

    let total = script.request_count();
    if intervals.is_empty() && total > 0 {
        intervals.push(Interval {
            start: 1,
            end: Some(total),
        });
    }
    let mut spans: Vec<(usize, usize)> = intervals
        .iter()
        .map(|interval| (interval.start, interval.end.unwrap_or(total)))
        .collect();
    spans.sort_unstable();
    for pair in spans.windows(2) {
        if pair[0].1 >= pair[1].0 {
            return usage("intervals overlap");
        }
    }
    if spans.iter().any(|&(start, end)| start == 0 || end < start) {
        return usage("intervals are 1-based and must not be empty");
    }

    let mut runner: Runner = match Runner::new(&script, segment_bytes) {
        Ok(runner) => runner,
        Err(error) => {
            eprintln!("{}: {error}", path.display());
            return ExitCode::FAILURE;
        }
    };

    let mut elapsed: Vec<Duration> = vec![Duration::ZERO; spans.len()];
    for (ordinal, line) in script.lines.iter().enumerate() {
        let ordinal = ordinal + 1;
        let span = spans
            .iter()
            .position(|&(start, end)| ordinal >= start && ordinal <= end);
        let outcome = match span {
            Some(index) => runner.exec_timed(line).map(|cost| elapsed[index] += cost),
            None => runner.exec(line),
        };
        if let Err(error) = outcome {
            eprintln!(
                "{}: line {}: request failed: {error}",
                path.display(),
                line.number
            );
            return ExitCode::FAILURE;
        }
    }

    for (&(start, end), cost) in spans.iter().zip(&elapsed) {
        println!(
            "requests {start}..{end}: {:.3} ms",
            cost.as_secs_f64() * 1e3
        );
    }
    let stats = runner.stats();
    println!("utilization {:.1}%", stats.average_utilization);
    ExitCode::SUCCESS
}

fn usage(reason: &str) -> ExitCode {
    eprintln!("trace-time: {reason}");
    eprintln!("usage: trace-time (-s start [-e end])... [-z bytes] <script>");
    ExitCode::FAILURE
}

fn number(arg: Option<String>, flag: &str) -> usize {
    arg.and_then(|value| value.parse().ok())
        .unwrap_or_else(|| panic!("{flag} expects a number"))
}
