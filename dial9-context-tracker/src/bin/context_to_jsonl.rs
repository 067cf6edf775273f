//! Convert a persisted context blob to JSONL (one JSON object per line).
//!
//! The first line is a header with the blob-level fields, every following
//! line is one interval.
//!
//! Usage:
//!   context_to_jsonl <input.bin> [output.jsonl]
//!
//! If output is omitted, writes to stdout.

use clap::Parser;
use dial9_context_tracker::context::parser::{DecodedContext, parse};
use serde::Serialize;
use std::io::{BufWriter, Write};
use std::path::PathBuf;

#[derive(Parser)]
#[command(about = "Decode a persisted tracing context blob into JSONL")]
struct Args {
    #[arg(help = "Persisted context blob")]
    input: PathBuf,

    #[arg(help = "Output file, stdout when omitted")]
    output: Option<PathBuf>,
}

#[derive(Serialize)]
struct Header {
    truncated: bool,
    base_ns: u64,
    tick_multiplier: u64,
    threads: usize,
}

#[derive(Serialize)]
struct Line {
    thread_id: u64,
    start_ticks: i64,
    end_ticks: i64,
    start_ns: u64,
    end_ns: u64,
}

fn write_jsonl(decoded: &DecodedContext, w: &mut impl Write) -> std::io::Result<usize> {
    let header = Header {
        truncated: decoded.truncated,
        base_ns: decoded.base_ns,
        tick_multiplier: decoded.tick_multiplier,
        threads: decoded.threads.len(),
    };
    serde_json::to_writer(&mut *w, &header)?;
    writeln!(w)?;
    let mut count = 0;
    for thread in &decoded.threads {
        for interval in &thread.intervals {
            let line = Line {
                thread_id: thread.thread_id,
                start_ticks: interval.start_ticks,
                end_ticks: interval.end_ticks,
                start_ns: interval.start_ns,
                end_ns: interval.end_ns,
            };
            serde_json::to_writer(&mut *w, &line)?;
            writeln!(w)?;
            count += 1;
        }
    }
    Ok(count)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let bytes = std::fs::read(&args.input)?;
    let decoded = parse(&bytes)?;
    if decoded.truncated {
        eprintln!("warning: context blob was truncated at the size limit");
    }

    let out: Box<dyn Write> = if let Some(path) = &args.output {
        Box::new(std::fs::File::create(path)?)
    } else {
        Box::new(std::io::stdout().lock())
    };
    let mut w = BufWriter::new(out);
    let count = write_jsonl(&decoded, &mut w)?;
    w.flush()?;
    eprintln!("{count} intervals written");
    Ok(())
}
