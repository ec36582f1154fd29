//! ASCII wire codec.
//!
//! All frames are pipe-delimited ASCII terminated by a single `0x04`
//! (EOT) byte. 64-bit values in the macrocycle frame are split into
//! two 32-bit decimal fields (high then low) so no endpoint depends on
//! a runtime's 64-bit integer printing. The high word of a signed
//! split is two's-complement (arithmetic shift), so a negative offset
//! prints a leading `-` on the high field.
//!
//! The codec rejects frames on structural faults only: missing colon,
//! non-decimal fields, fewer fields than the command requires, or a
//! declared event count above the batch limit. Semantic ranges are the
//! sync/session engine's job. Unknown commands decode to `None` and
//! are dropped by the caller.

use crate::consts::{BATCH_EVENT_MAX, FRAME_BUF_LEN, FRAME_EOT};
use crate::event::{Batch, EventSpec};
use core::fmt::Write as _;
use thiserror::Error;
use tracing::debug;

/// Scratch buffer for one serialized frame.
pub type FrameBuf = heapless::String<FRAME_BUF_LEN>;

/// Structural decode/encode faults.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    /// Command requires arguments but carried no colon.
    #[error("missing colon after command {cmd:?}")]
    MissingColon {
        cmd: heapless::String<16>,
    },

    /// A field failed decimal parsing.
    #[error("non-decimal field at index {index}")]
    BadField {
        index: usize,
    },

    /// Fewer fields than the command requires.
    #[error("expected {expected} fields, found {found}")]
    MissingFields {
        expected: usize,
        found: usize,
    },

    /// Declared event count exceeds the batch limit.
    #[error("declared event count {declared} exceeds {max}", max = BATCH_EVENT_MAX)]
    TooManyEvents {
        declared: usize,
    },

    /// An event group did not have 3 or 4 comma-separated fields.
    #[error("malformed event group at index {index}")]
    BadEventGroup {
        index: usize,
    },

    /// Frame does not fit the scratch buffer.
    #[error("frame exceeds {FRAME_BUF_LEN} byte buffer")]
    BufferOverflow,

    /// Frame bytes are not valid UTF-8/ASCII.
    #[error("frame is not valid ASCII")]
    NotAscii,
}

/// One parsed frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// SECONDARY announces itself after connecting.
    Ready,
    StartSession { seq: u32, ts: u64 },
    PauseSession { seq: u32, ts: u64 },
    ResumeSession { seq: u32, ts: u64 },
    StopSession { seq: u32, ts: u64 },
    /// Keepalive probe; `t1` sampled just before sending.
    Ping { seq: u32, t1: u64 },
    /// Probe reply; `t2` at receive, `t3` just before replying.
    Pong { seq: u32, t2: u64, t3: u64 },
    Macrocycle(Batch),
    McAck { seq: u32 },
    /// Raw `key:val[:key:val]*` payload; see [`param_pairs`].
    ParamUpdate { raw: heapless::String<128> },
    Seed { value: u32 },
    SeedAck,
    GetBattery,
    BatteryResponse { volts: f32 },
}

// ─── Encoding ───────────────────────────────────────────────────────

/// Serialize `frame` into `out`, EOT-terminated.
pub fn encode(frame: &Frame, out: &mut FrameBuf) -> Result<(), WireError> {
    out.clear();
    let result = match frame {
        Frame::Ready => write!(out, "READY"),
        Frame::StartSession { seq, ts } => write!(out, "START_SESSION:{seq}|{ts}"),
        Frame::PauseSession { seq, ts } => write!(out, "PAUSE_SESSION:{seq}|{ts}"),
        Frame::ResumeSession { seq, ts } => write!(out, "RESUME_SESSION:{seq}|{ts}"),
        Frame::StopSession { seq, ts } => write!(out, "STOP_SESSION:{seq}|{ts}"),
        Frame::Ping { seq, t1 } => write!(out, "PING:{seq}|{t1}"),
        Frame::Pong { seq, t2, t3 } => write!(out, "PONG:{seq}|0|{t2}|{t3}"),
        Frame::Macrocycle(batch) => encode_macrocycle(batch, out),
        Frame::McAck { seq } => write!(out, "MC_ACK:{seq}"),
        Frame::ParamUpdate { raw } => write!(out, "PARAM_UPDATE:{raw}"),
        Frame::Seed { value } => write!(out, "SEED:{value}"),
        Frame::SeedAck => write!(out, "SEED_ACK"),
        Frame::GetBattery => write!(out, "GET_BATTERY"),
        Frame::BatteryResponse { volts } => write!(out, "BAT_RESPONSE:{volts:.2}"),
    };
    result.map_err(|_| WireError::BufferOverflow)?;
    out.push(FRAME_EOT as char)
        .map_err(|_| WireError::BufferOverflow)
}

fn encode_macrocycle(batch: &Batch, out: &mut FrameBuf) -> core::fmt::Result {
    let base_hi = (batch.base_time_us >> 32) as u32;
    let base_lo = batch.base_time_us as u32;
    // Arithmetic shift keeps the sign on the high word.
    let off_hi = batch.clock_offset_us >> 32;
    let off_lo = batch.clock_offset_us as u32;
    write!(
        out,
        "MC:{}|{}|{}|{}|{}|{}|{}",
        batch.sequence_id,
        base_hi,
        base_lo,
        off_hi,
        off_lo,
        batch.duration_ms,
        batch.events.len()
    )?;
    for spec in &batch.events {
        if spec.freq_offset == 0 {
            write!(out, "|{},{},{}", spec.delta_ms, spec.finger, spec.amplitude)?;
        } else {
            write!(
                out,
                "|{},{},{},{}",
                spec.delta_ms, spec.finger, spec.amplitude, spec.freq_offset
            )?;
        }
    }
    Ok(())
}

// ─── Decoding ───────────────────────────────────────────────────────

/// Parse one frame (without its EOT terminator).
///
/// Returns `Ok(None)` for empty frames and unknown commands — those
/// are dropped, not errors.
pub fn decode(frame: &str) -> Result<Option<Frame>, WireError> {
    if frame.is_empty() {
        return Ok(None);
    }
    let (cmd, rest) = match frame.split_once(':') {
        Some((cmd, rest)) => (cmd, Some(rest)),
        None => (frame, None),
    };

    match cmd {
        "READY" => Ok(Some(Frame::Ready)),
        "SEED_ACK" => Ok(Some(Frame::SeedAck)),
        "GET_BATTERY" => Ok(Some(Frame::GetBattery)),
        "START_SESSION" => decode_session(cmd, rest, |seq, ts| Frame::StartSession { seq, ts }),
        "PAUSE_SESSION" => decode_session(cmd, rest, |seq, ts| Frame::PauseSession { seq, ts }),
        "RESUME_SESSION" => decode_session(cmd, rest, |seq, ts| Frame::ResumeSession { seq, ts }),
        "STOP_SESSION" => decode_session(cmd, rest, |seq, ts| Frame::StopSession { seq, ts }),
        "PING" => {
            let rest = require_args(cmd, rest)?;
            let fields = collect_fields(rest)?;
            require_len(&fields, 2)?;
            Ok(Some(Frame::Ping {
                seq: parse_u32(&fields, 0)?,
                t1: parse_u64(&fields, 1)?,
            }))
        }
        "PONG" => decode_pong(cmd, rest),
        "MC" => decode_macrocycle(cmd, rest),
        "MC_ACK" => {
            let rest = require_args(cmd, rest)?;
            let fields = collect_fields(rest)?;
            require_len(&fields, 1)?;
            Ok(Some(Frame::McAck {
                seq: parse_u32(&fields, 0)?,
            }))
        }
        "PARAM_UPDATE" => {
            let rest = require_args(cmd, rest)?;
            let mut raw = heapless::String::new();
            raw.push_str(rest).map_err(|_| WireError::BufferOverflow)?;
            Ok(Some(Frame::ParamUpdate { raw }))
        }
        "SEED" => {
            let rest = require_args(cmd, rest)?;
            let fields = collect_fields(rest)?;
            require_len(&fields, 1)?;
            Ok(Some(Frame::Seed {
                value: parse_u32(&fields, 0)?,
            }))
        }
        "BAT_RESPONSE" => {
            let rest = require_args(cmd, rest)?;
            let volts: f32 = rest.parse().map_err(|_| WireError::BadField { index: 0 })?;
            Ok(Some(Frame::BatteryResponse { volts }))
        }
        // Unknown commands (including legacy BUZZ) are dropped.
        _ => Ok(None),
    }
}

fn decode_session(
    cmd: &str,
    rest: Option<&str>,
    build: impl FnOnce(u32, u64) -> Frame,
) -> Result<Option<Frame>, WireError> {
    let rest = require_args(cmd, rest)?;
    let fields = collect_fields(rest)?;
    require_len(&fields, 2)?;
    Ok(Some(build(parse_u32(&fields, 0)?, parse_u64(&fields, 1)?)))
}

fn decode_pong(cmd: &str, rest: Option<&str>) -> Result<Option<Frame>, WireError> {
    let rest = require_args(cmd, rest)?;
    let fields = collect_fields(rest)?;
    // seq|0|t2|t3, or seq|0|t2H|t2L|t3H|t3L with split timestamps.
    match fields.len() {
        4 => Ok(Some(Frame::Pong {
            seq: parse_u32(&fields, 0)?,
            t2: parse_u64(&fields, 2)?,
            t3: parse_u64(&fields, 3)?,
        })),
        n if n >= 6 => Ok(Some(Frame::Pong {
            seq: parse_u32(&fields, 0)?,
            t2: compose_u64(parse_u32(&fields, 2)?, parse_u32(&fields, 3)?),
            t3: compose_u64(parse_u32(&fields, 4)?, parse_u32(&fields, 5)?),
        })),
        found => Err(WireError::MissingFields { expected: 4, found }),
    }
}

fn decode_macrocycle(cmd: &str, rest: Option<&str>) -> Result<Option<Frame>, WireError> {
    let rest = require_args(cmd, rest)?;
    let fields = collect_fields(rest)?;
    require_len(&fields, 7)?;

    let declared = parse_u64(&fields, 6)? as usize;
    if declared > BATCH_EVENT_MAX {
        return Err(WireError::TooManyEvents { declared });
    }
    require_len(&fields, 7 + declared)?;

    let base_time_us = compose_u64(parse_u32(&fields, 1)?, parse_u32(&fields, 2)?);
    let clock_offset_us = compose_i64(parse_i64(&fields, 3)?, parse_u32(&fields, 4)?);

    let mut batch = Batch::new(
        parse_u32(&fields, 0)?,
        base_time_us,
        clock_offset_us,
        parse_u64(&fields, 5)? as u16,
    );

    for i in 0..declared {
        let group = fields[7 + i];
        let spec = parse_event_group(group, 7 + i)?;
        // Capacity equals BATCH_EVENT_MAX, checked above.
        let _ = batch.events.push(spec);
    }
    Ok(Some(Frame::Macrocycle(batch)))
}

fn parse_event_group(group: &str, index: usize) -> Result<EventSpec, WireError> {
    let mut parts = group.split(',');
    let delta = parse_dec::<u16>(parts.next(), index)?;
    let finger = parse_dec::<u8>(parts.next(), index)?;
    let amplitude = parse_dec::<u8>(parts.next(), index)?;
    let freq_offset = match parts.next() {
        Some(s) => s.parse().map_err(|_| WireError::BadEventGroup { index })?,
        None => 0,
    };
    if parts.next().is_some() {
        return Err(WireError::BadEventGroup { index });
    }
    Ok(EventSpec {
        delta_ms: delta,
        finger,
        amplitude,
        freq_offset,
    })
}

// ─── Field helpers ──────────────────────────────────────────────────

/// Frames never legitimately exceed 7 header + 12 event fields.
const MAX_FIELDS: usize = 7 + BATCH_EVENT_MAX;

fn require_args<'a>(cmd: &str, rest: Option<&'a str>) -> Result<&'a str, WireError> {
    rest.ok_or_else(|| {
        let mut name = heapless::String::new();
        let _ = name.push_str(&cmd[..cmd.len().min(16)]);
        WireError::MissingColon { cmd: name }
    })
}

fn collect_fields(rest: &str) -> Result<heapless::Vec<&str, MAX_FIELDS>, WireError> {
    let mut fields = heapless::Vec::new();
    for part in rest.split('|') {
        fields
            .push(part)
            .map_err(|_| WireError::MissingFields {
                expected: MAX_FIELDS,
                found: MAX_FIELDS + 1,
            })?;
    }
    Ok(fields)
}

fn require_len(fields: &[&str], expected: usize) -> Result<(), WireError> {
    if fields.len() < expected {
        return Err(WireError::MissingFields {
            expected,
            found: fields.len(),
        });
    }
    Ok(())
}

fn parse_dec<T: core::str::FromStr>(part: Option<&str>, index: usize) -> Result<T, WireError> {
    part.and_then(|s| s.parse().ok())
        .ok_or(WireError::BadEventGroup { index })
}

fn parse_u32(fields: &[&str], index: usize) -> Result<u32, WireError> {
    fields[index]
        .parse()
        .map_err(|_| WireError::BadField { index })
}

fn parse_u64(fields: &[&str], index: usize) -> Result<u64, WireError> {
    fields[index]
        .parse()
        .map_err(|_| WireError::BadField { index })
}

fn parse_i64(fields: &[&str], index: usize) -> Result<i64, WireError> {
    fields[index]
        .parse()
        .map_err(|_| WireError::BadField { index })
}

#[inline]
const fn compose_u64(hi: u32, lo: u32) -> u64 {
    ((hi as u64) << 32) | lo as u64
}

#[inline]
const fn compose_i64(hi: i64, lo: u32) -> i64 {
    (hi << 32) | lo as i64
}

/// Iterate `key:val` pairs of a `PARAM_UPDATE` payload.
///
/// A trailing key without a value is dropped.
pub fn param_pairs(raw: &str) -> impl Iterator<Item = (&str, &str)> {
    let mut parts = raw.split(':');
    core::iter::from_fn(move || {
        let key = parts.next()?;
        let val = parts.next()?;
        Some((key, val))
    })
}

// ─── Deframing ──────────────────────────────────────────────────────

/// Splits an incoming byte stream on EOT terminators.
///
/// Runs in the radio-callback context, so it allocates nothing: bytes
/// accumulate in a fixed buffer and oversize garbage is discarded
/// wholesale at the next terminator.
pub struct Deframer {
    buf: heapless::Vec<u8, FRAME_BUF_LEN>,
    overflowed: bool,
    /// Frames dropped to buffer overflow since construction.
    pub dropped: u32,
}

impl Deframer {
    pub const fn new() -> Self {
        Self {
            buf: heapless::Vec::new(),
            overflowed: false,
            dropped: 0,
        }
    }

    /// Feed raw bytes; `on_frame` fires once per complete frame with
    /// the EOT stripped.
    pub fn feed(&mut self, bytes: &[u8], mut on_frame: impl FnMut(&str)) {
        for &b in bytes {
            if b == FRAME_EOT {
                if self.overflowed {
                    self.dropped += 1;
                    debug!(dropped = self.dropped, "oversize frame discarded");
                } else if let Ok(s) = core::str::from_utf8(&self.buf) {
                    on_frame(s);
                }
                self.buf.clear();
                self.overflowed = false;
            } else if self.buf.push(b).is_err() {
                self.overflowed = true;
            }
        }
    }
}

impl Default for Deframer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventSpec;

    fn decode_ok(s: &str) -> Frame {
        decode(s).unwrap().unwrap()
    }

    #[test]
    fn ping_pong_roundtrip() {
        assert_eq!(decode_ok("PING:1|10000"), Frame::Ping { seq: 1, t1: 10_000 });
        assert_eq!(
            decode_ok("PONG:1|0|12000|12100"),
            Frame::Pong {
                seq: 1,
                t2: 12_000,
                t3: 12_100
            }
        );
    }

    #[test]
    fn pong_split_timestamps() {
        // t2 = (1 << 32) | 500, t3 = (1 << 32) | 600
        let f = decode_ok("PONG:7|0|1|500|1|600");
        assert_eq!(
            f,
            Frame::Pong {
                seq: 7,
                t2: (1u64 << 32) | 500,
                t3: (1u64 << 32) | 600
            }
        );
    }

    #[test]
    fn macrocycle_wire_shape() {
        let mut batch = Batch::new(42, 1_080_000, 45_000, 100);
        batch.events.push(EventSpec::from_freq(0, 0, 100, 250)).unwrap();
        batch.events.push(EventSpec::from_freq(167, 1, 100, 250)).unwrap();

        let mut buf = FrameBuf::new();
        encode(&Frame::Macrocycle(batch.clone()), &mut buf).unwrap();
        assert!(
            buf.starts_with("MC:42|0|1080000|0|45000|100|2|0,0,100,10|167,1,100,10"),
            "unexpected frame: {buf}"
        );
        assert_eq!(buf.as_bytes().last(), Some(&FRAME_EOT));

        let parsed = decode_ok(&buf[..buf.len() - 1]);
        assert_eq!(parsed, Frame::Macrocycle(batch));
    }

    #[test]
    fn negative_offset_splits_arithmetically() {
        let batch = Batch::new(1, 5, -3_950, 100);
        let mut buf = FrameBuf::new();
        encode(&Frame::Macrocycle(batch.clone()), &mut buf).unwrap();
        // -3950 = (-1 << 32) | 4294963346
        assert!(buf.starts_with("MC:1|0|5|-1|4294963346|100|0"), "{buf}");
        let parsed = decode_ok(&buf[..buf.len() - 1]);
        assert_eq!(parsed, Frame::Macrocycle(batch));
    }

    #[test]
    fn base_time_preserved_microsecond_exact_past_32_bits() {
        let base = (3u64 << 32) + 123_456_789;
        let batch = Batch::new(9, base, 0, 50);
        let mut buf = FrameBuf::new();
        encode(&Frame::Macrocycle(batch.clone()), &mut buf).unwrap();
        let Frame::Macrocycle(parsed) = decode_ok(&buf[..buf.len() - 1]) else {
            panic!("not a macrocycle");
        };
        assert_eq!(parsed.base_time_us, base);
    }

    #[test]
    fn zero_freq_offset_is_omitted_and_reparsed() {
        let mut batch = Batch::new(3, 0, 0, 10);
        batch.events.push(EventSpec::from_freq(5, 2, 60, 200)).unwrap();
        let mut buf = FrameBuf::new();
        encode(&Frame::Macrocycle(batch.clone()), &mut buf).unwrap();
        assert!(buf.contains("|5,2,60\u{4}"), "{buf}");
        assert_eq!(decode_ok(&buf[..buf.len() - 1]), Frame::Macrocycle(batch));
    }

    #[test]
    fn rejects_event_count_above_limit() {
        assert_eq!(
            decode("MC:1|0|0|0|0|100|13"),
            Err(WireError::TooManyEvents { declared: 13 })
        );
    }

    #[test]
    fn rejects_missing_colon() {
        assert!(matches!(
            decode("PING"),
            Err(WireError::MissingColon { .. })
        ));
        assert!(matches!(decode("MC"), Err(WireError::MissingColon { .. })));
    }

    #[test]
    fn rejects_non_decimal_fields() {
        assert_eq!(decode("PING:x|10000"), Err(WireError::BadField { index: 0 }));
        assert_eq!(decode("MC_ACK:abc"), Err(WireError::BadField { index: 0 }));
    }

    #[test]
    fn rejects_short_frames() {
        assert_eq!(
            decode("PING:1"),
            Err(WireError::MissingFields {
                expected: 2,
                found: 1
            })
        );
        assert!(matches!(
            decode("MC:1|0|0|0|0|100|3|0,0,50"),
            Err(WireError::MissingFields { .. })
        ));
    }

    #[test]
    fn unknown_commands_are_dropped_not_errors() {
        assert_eq!(decode("BUZZ:1|5000|0|80"), Ok(None));
        assert_eq!(decode("NOISE"), Ok(None));
        assert_eq!(decode(""), Ok(None));
    }

    #[test]
    fn session_and_ack_frames() {
        assert_eq!(
            decode_ok("START_SESSION:5|123456"),
            Frame::StartSession { seq: 5, ts: 123_456 }
        );
        assert_eq!(decode_ok("MC_ACK:42"), Frame::McAck { seq: 42 });
        assert_eq!(decode_ok("READY"), Frame::Ready);
    }

    #[test]
    fn param_update_pairs() {
        let f = decode_ok("PARAM_UPDATE:amp:80:freq:250");
        let Frame::ParamUpdate { raw } = f else {
            panic!("not a param update");
        };
        let pairs: Vec<_> = param_pairs(&raw).collect();
        assert_eq!(pairs, vec![("amp", "80"), ("freq", "250")]);
    }

    #[test]
    fn battery_response_parses_volts() {
        let Frame::BatteryResponse { volts } = decode_ok("BAT_RESPONSE:3.85") else {
            panic!("not a battery response");
        };
        assert!((volts - 3.85).abs() < 1e-6);
    }

    #[test]
    fn deframer_splits_on_eot() {
        let mut deframer = Deframer::new();
        let mut seen = Vec::new();
        deframer.feed(b"PING:1|10\x04PONG:1|0|2", |f| seen.push(f.to_string()));
        assert_eq!(seen, vec!["PING:1|10"]);
        deframer.feed(b"0|30\x04", |f| seen.push(f.to_string()));
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1], "PONG:1|0|20|30");
    }

    #[test]
    fn deframer_discards_oversize_garbage() {
        let mut deframer = Deframer::new();
        let garbage = vec![b'x'; FRAME_BUF_LEN + 10];
        let mut seen = 0;
        deframer.feed(&garbage, |_| seen += 1);
        deframer.feed(b"\x04PING:1|2\x04", |_| seen += 1);
        assert_eq!(seen, 1);
        assert_eq!(deframer.dropped, 1);
    }
}
