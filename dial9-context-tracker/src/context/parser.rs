//! Decoder for blobs produced by [`IntervalEncoder`](crate::context::encoder::IntervalEncoder).

use crate::context::encoder::{DATA_CHUNK_HEADER_LEN, FIXED_PROLOGUE_LEN};
use crate::context::error::{Error, Result};
use crate::context::leb128::{GroupVarintReader, read_varint};
use serde::Serialize;
use std::io::Read;

/// One decoded interval, in ticks relative to the tracker start and in
/// absolute epoch nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Interval {
    pub start_ticks: i64,
    pub end_ticks: i64,
    pub start_ns: u64,
    pub end_ns: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ThreadIntervals {
    pub thread_id: u64,
    pub intervals: Vec<Interval>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DecodedContext {
    pub truncated: bool,
    pub base_ns: u64,
    /// Ticks per 1000 ns.
    pub tick_multiplier: u64,
    pub threads: Vec<ThreadIntervals>,
}

impl DecodedContext {
    /// `(thread id, start tick, end tick)` in encoding order.
    pub fn triples(&self) -> impl Iterator<Item = (u64, i64, i64)> + '_ {
        self.threads.iter().flat_map(|t| {
            t.intervals
                .iter()
                .map(move |i| (t.thread_id, i.start_ticks, i.end_ticks))
        })
    }

    pub fn interval_count(&self) -> usize {
        self.threads.iter().map(|t| t.intervals.len()).sum()
    }
}

/// `base + round(tick * 1000 / multiplier)`, saturating at the `u64` range.
pub fn ticks_to_nanos(base_ns: u64, tick_multiplier: u64, tick: i64) -> u64 {
    let mult = tick_multiplier.max(1) as i128;
    let scaled = tick as i128 * 1000;
    let offset = if scaled >= 0 {
        (scaled + mult / 2) / mult
    } else {
        (scaled - mult / 2) / mult
    };
    (base_ns as i128 + offset).clamp(0, u64::MAX as i128) as u64
}

fn read_i32_le(bytes: &[u8], at: usize, what: &str) -> Result<usize> {
    let raw = bytes
        .get(at..at + 4)
        .ok_or_else(|| Error::malformed(format!("{what} missing")))?;
    let value = i32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
    usize::try_from(value).map_err(|_| Error::malformed(format!("negative {what}: {value}")))
}

fn varint(r: &mut &[u8], what: &str) -> Result<u64> {
    read_varint(r).map_err(|e| Error::malformed(format!("{what}: {e}")))
}

/// Decode a complete blob.
pub fn parse(bytes: &[u8]) -> Result<DecodedContext> {
    let flag = *bytes
        .first()
        .ok_or_else(|| Error::malformed("empty input"))?;
    let truncated = match flag {
        0 => false,
        1 => true,
        other => return Err(Error::malformed(format!("bad truncated flag {other}"))),
    };

    let data_offset = read_i32_le(bytes, 1, "data chunk offset")?;
    if data_offset < FIXED_PROLOGUE_LEN || data_offset > bytes.len() {
        return Err(Error::malformed(format!(
            "data chunk offset {data_offset} outside of {} byte blob",
            bytes.len()
        )));
    }

    let mut header = &bytes[FIXED_PROLOGUE_LEN..data_offset];
    let base_ns = varint(&mut header, "base timestamp")?;
    let tick_multiplier = varint(&mut header, "tick multiplier")?;
    if tick_multiplier == 0 {
        return Err(Error::malformed("tick multiplier is zero"));
    }
    let thread_count = varint(&mut header, "thread count")?;
    // every thread entry takes at least two bytes
    if thread_count > header.len() as u64 / 2 {
        return Err(Error::malformed(format!(
            "thread count {thread_count} does not fit the prologue"
        )));
    }
    let mut thread_map = Vec::with_capacity(thread_count as usize);
    for _ in 0..thread_count {
        let id = varint(&mut header, "thread id")?;
        let count = varint(&mut header, "interval count")?;
        thread_map.push((id, count));
    }
    if !header.is_empty() {
        return Err(Error::malformed("trailing bytes in prologue"));
    }

    let data = &bytes[data_offset..];
    let bitmap_offset = read_i32_le(data, 0, "bitmap offset")?;
    if bitmap_offset < DATA_CHUNK_HEADER_LEN || bitmap_offset > data.len() {
        return Err(Error::malformed(format!(
            "bitmap offset {bitmap_offset} outside of {} byte data chunk",
            data.len()
        )));
    }
    let mut values = GroupVarintReader::new(
        &data[DATA_CHUNK_HEADER_LEN..bitmap_offset],
        &data[bitmap_offset..],
    );

    let mut threads = Vec::with_capacity(thread_map.len());
    for (thread_id, count) in thread_map {
        // every interval takes at least two payload bytes
        if count > values.remaining() as u64 / 2 {
            return Err(Error::malformed(format!(
                "thread {thread_id} claims {count} intervals beyond the payload"
            )));
        }
        let mut intervals = Vec::with_capacity(count as usize);
        let mut running = 0i64;
        for _ in 0..count {
            let start_delta = values
                .read()
                .map_err(|e| Error::malformed(format!("start delta: {e}")))?;
            let end_delta = values
                .read()
                .map_err(|e| Error::malformed(format!("end delta: {e}")))?;
            let start = running.wrapping_add(start_delta as i64);
            let end = start.wrapping_add(end_delta as i64);
            running = end;
            intervals.push(Interval {
                start_ticks: start,
                end_ticks: end,
                start_ns: ticks_to_nanos(base_ns, tick_multiplier, start),
                end_ns: ticks_to_nanos(base_ns, tick_multiplier, end),
            });
        }
        threads.push(ThreadIntervals {
            thread_id,
            intervals,
        });
    }
    if values.remaining() != 0 {
        return Err(Error::malformed("trailing bytes in interval payload"));
    }

    Ok(DecodedContext {
        truncated,
        base_ns,
        tick_multiplier,
        threads,
    })
}

/// Read the whole input and decode it.
pub fn parse_reader(mut r: impl Read) -> Result<DecodedContext> {
    let mut bytes = Vec::new();
    r.read_to_end(&mut bytes)?;
    parse(&bytes)
}
