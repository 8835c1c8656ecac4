//! Little-endian wire helpers shared by frame builders, verifiers and
//! response parsers.

use std::time::Duration;

use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc};
use once_cell::sync::Lazy;
use regex::Regex;

use seadaq_core::{DriverResult, InstrumentError};

/// Seed for the 16-bit additive frame checksum.
pub const CHECKSUM_SEED: u16 = 0xB58C;

/// Sum of little-endian 16-bit words over `data`, seeded with
/// [`CHECKSUM_SEED`], modulo 2^16. A trailing odd byte does not
/// contribute.
pub fn frame_checksum(data: &[u8]) -> u16 {
    let mut sum = CHECKSUM_SEED;
    for pair in data.chunks_exact(2) {
        sum = sum.wrapping_add(u16::from_le_bytes([pair[0], pair[1]]));
    }
    sum
}

pub fn read_u16_le(data: &[u8], offset: usize) -> DriverResult<u16> {
    match data.get(offset..offset + 2) {
        Some(b) => Ok(u16::from_le_bytes([b[0], b[1]])),
        None => Err(InstrumentError::Protocol(format!(
            "short read: no word at offset {offset} in {} bytes",
            data.len()
        ))),
    }
}

pub fn read_u32_le(data: &[u8], offset: usize) -> DriverResult<u32> {
    match data.get(offset..offset + 4) {
        Some(b) => Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]])),
        None => Err(InstrumentError::Protocol(format!(
            "short read: no double word at offset {offset} in {} bytes",
            data.len()
        ))),
    }
}

/// First occurrence of `needle` in `haystack`.
pub fn find_sub(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

//============================================================
// Binary frame layout
//============================================================

/// Fixed-length binary frame: a sync prefix (which encodes the frame
/// id and size), a payload, and a trailing little-endian checksum word
/// computed over everything before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSpec {
    /// Stream label attached to chunks and samples cut from this frame.
    pub label: &'static str,
    /// Exact bytes the frame starts with.
    pub sync: &'static [u8],
    /// Total frame length in bytes, sync and checksum included.
    pub length: usize,
}

impl FrameSpec {
    pub const fn new(label: &'static str, sync: &'static [u8], length: usize) -> Self {
        Self { label, sync, length }
    }

    /// Whether `frame` has this spec's exact length and sync and a
    /// valid trailing checksum.
    pub fn verify(&self, frame: &[u8]) -> bool {
        frame.len() == self.length
            && frame.starts_with(self.sync)
            && self.checksum_ok(frame)
    }

    /// Trailing-checksum test alone, assuming length already matched.
    pub fn checksum_ok(&self, frame: &[u8]) -> bool {
        if frame.len() < self.sync.len() + 2 {
            return false;
        }
        let body = &frame[..frame.len() - 2];
        let stored = u16::from_le_bytes([frame[frame.len() - 2], frame[frame.len() - 1]]);
        frame_checksum(body) == stored
    }
}

//============================================================
// BCD clock words
//============================================================

pub fn to_bcd(value: u8) -> DriverResult<u8> {
    if value > 99 {
        return Err(InstrumentError::Protocol(format!(
            "{value} does not fit in a BCD byte"
        )));
    }
    Ok(((value / 10) << 4) | (value % 10))
}

pub fn from_bcd(byte: u8) -> DriverResult<u8> {
    let tens = byte >> 4;
    let ones = byte & 0x0F;
    if tens > 9 || ones > 9 {
        return Err(InstrumentError::Protocol(format!(
            "0x{byte:02X} is not valid BCD"
        )));
    }
    Ok(tens * 10 + ones)
}

/// Pack a timestamp into the six-byte BCD clock layout: minute,
/// second, day, hour, two-digit year, month.
pub fn encode_clock(when: DateTime<Utc>) -> DriverResult<[u8; 6]> {
    Ok([
        to_bcd(when.minute() as u8)?,
        to_bcd(when.second() as u8)?,
        to_bcd(when.day() as u8)?,
        to_bcd(when.hour() as u8)?,
        to_bcd((when.year() % 100) as u8)?,
        to_bcd(when.month() as u8)?,
    ])
}

/// Inverse of [`encode_clock`]. Two-digit years land in 2000..=2099.
pub fn decode_clock(bytes: &[u8]) -> DriverResult<DateTime<Utc>> {
    if bytes.len() < 6 {
        return Err(InstrumentError::Protocol(format!(
            "clock response needs 6 bytes, got {}",
            bytes.len()
        )));
    }
    let minute = from_bcd(bytes[0])? as u32;
    let second = from_bcd(bytes[1])? as u32;
    let day = from_bcd(bytes[2])? as u32;
    let hour = from_bcd(bytes[3])? as u32;
    let year = 2000 + from_bcd(bytes[4])? as i32;
    let month = from_bcd(bytes[5])? as u32;
    Utc.with_ymd_and_hms(year, month, day, hour, minute, second)
        .single()
        .ok_or_else(|| {
            InstrumentError::Protocol(format!(
                "clock bytes decode to invalid date {year}-{month:02}-{day:02} {hour:02}:{minute:02}:{second:02}"
            ))
        })
}

//============================================================
// HH:MM:SS intervals
//============================================================

static INTERVAL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d{2}):([0-5]\d):([0-5]\d)$").expect("valid interval regex"));

/// Parse an `HH:MM:SS` interval string. `00:00:00` parses to a zero
/// duration; callers treat that as "disabled".
pub fn parse_interval(text: &str) -> DriverResult<Duration> {
    let caps = INTERVAL_RE.captures(text).ok_or_else(|| {
        InstrumentError::Configuration(format!("'{text}' is not an HH:MM:SS interval"))
    })?;
    let field = |i: usize| -> u64 {
        // Guaranteed numeric by the pattern.
        caps.get(i).map(|m| m.as_str().parse().unwrap_or(0)).unwrap_or(0)
    };
    Ok(Duration::from_secs(field(1) * 3600 + field(2) * 60 + field(3)))
}
