//! Interactive inspector: replay a trace script, stopping at chosen requests
//! to show the free-index contents, then report the moment the free-block
//! count peaked.
//!
//! At each `-b` breakpoint the tool prints the free index and waits on
//! stdin: `C` continues to the next breakpoint, an empty line or EOF drops
//! the remaining breakpoints (the replay itself continues).

use heap_alloc::DumpStyle;
use heap_trace::{Runner, StderrLogger, TraceScript};
use log::LevelFilter;
use std::env;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process::ExitCode;

const DEFAULT_SEGMENT_BYTES: usize = 4 << 20;

fn main() -> ExitCode {
    // args: [-v] [-m] (-b line)... [-z bytes] <script>
    let mut verbose = false;
    let mut heap_map = false;
    let mut breakpoints: Vec<usize> = Vec::new();
    let mut segment_bytes = DEFAULT_SEGMENT_BYTES;
    let mut script_path: Option<PathBuf> = None;

    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-v" => verbose = true,
            "-m" => heap_map = true,
            "-b" => breakpoints.push(number(args.next(), "-b")),
            "-z" => segment_bytes = number(args.next(), "-z"),
            _ => script_path = Some(PathBuf::from(arg)),
        }
    }
    let Some(path) = script_path else {
        eprintln!("usage: trace-inspect [-v] [-m] (-b line)... [-z bytes] <script>");
        return ExitCode::FAILURE;
    };
    let _ = StderrLogger::new(LevelFilter::Warn).init();
    breakpoints.sort_unstable();
    breakpoints.dedup();

    let script = match TraceScript::load(&path) {
        Ok(script) => script,
        Err(error) => {
            eprintln!("{}: {error}", path.display());
            return ExitCode::FAILURE;
        }
    };

    let (peak, runner) = match replay(&script, segment_bytes, &breakpoints, verbose) {
        Ok(outcome) => outcome,
        Err(error) => {
            eprintln!("{}: {error}", path.display());
            return ExitCode::FAILURE;
        }
    };

    if heap_map {
        let style = if verbose {
            DumpStyle::Verbose
        } else {
            DumpStyle::Plain
        };
        let mut map = String::new();
        let _ = runner.heap().write_dump(&mut map, style);
        println!("final heap state:");
        print!("{map}");
    }

    let Some((ordinal, line, count)) = peak else {
        println!("script has no requests");
        return ExitCode::SUCCESS;
    };
    println!("maximum of {count} free blocks after request {ordinal} (line {line}):");

    // Replay up to the peak to reconstruct the index state at that moment.
    match replay_to(&script, segment_bytes, ordinal) {
        Ok(contents) => print!("{contents}"),
        Err(error) => {
            eprintln!("{}: {error}", path.display());
            return ExitCode::FAILURE;
        }
    }
    ExitCode::SUCCESS
}

/// Run the whole script, honoring breakpoints; returns the first request at
/// which the free-block count peaked, as `(ordinal, line, count)`, plus the
/// finished runner for final-state inspection.
#[allow(clippy::type_complexity)]
fn replay(
    script: &TraceScript,
    segment_bytes: usize,
    breakpoints: &[usize],
    verbose: bool,
) -> Result<(Option<(usize, usize, usize)>, Runner), heap_trace::HarnessError> {
    let mut runner: Runner = Runner::new(script, segment_bytes)?;
    let mut pending = breakpoints.iter().copied().peekable();
    let mut interactive = true;
    let mut peak: Option<(usize, usize, usize)> = None;

    for (index, line) in script.lines.iter().enumerate() {
        let ordinal = index + 1;
        if interactive && pending.peek() == Some(&ordinal) {
            pending.next();
            println!("breakpoint before request {ordinal} (line {}):", line.number);
            print!("{}", runner.free_index_contents(verbose));
            if !prompt_continue() {
                interactive = false;
            }
        }

        runner.exec(line)?;
        let count = runner.free_block_count();
        if peak.is_none_or(|(_, _, best)| count > best) {
            peak = Some((ordinal, line.number, count));
        }
    }
    Ok((peak, runner))
}

/// Fresh replay of the first `upto` requests; returns the free-index dump.
fn replay_to(
    script: &TraceScript,
    segment_bytes: usize,
    upto: usize,
) -> Result<String, heap_trace::HarnessError> {
    let mut runner: Runner = Runner::new(script, segment_bytes)?;
    for line in &script.lines[..upto] {
        runner.exec(line)?;
    }
    Ok(runner.free_index_contents(true))
}

/// `C` keeps breakpoints live; empty input or EOF drops them.
fn prompt_continue() -> bool {
    print!("(C to continue, Enter to skip remaining breakpoints) ");
    let _ = io::stdout().flush();
    let mut input = String::new();
    match io::stdin().lock().read_line(&mut input) {
        Ok(0) | Err(_) => false,
        Ok(_) => input.trim() == "C",
    }
}

fn number(arg: Option<String>, flag: &str) -> usize {
    arg.and_then(|value| value.parse().ok())
        .unwrap_or_else(|| panic!("{flag} expects a number"))
}
