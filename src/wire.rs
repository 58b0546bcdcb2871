//! Fixed-size binary records exchanged over the ingest socket and stored in
//! dump files.
//!
//! Every record has a fixed width so a stream can be consumed without any
//! length framing. Strings are NUL-padded to their field width (content is
//! capped at width − 1 bytes) and numeric fields use native byte order: this
//! is a node-local protocol, both ends always run on the same machine.
//! Envelopes carry a one-byte canary; a mismatch means the stream is
//! misaligned and the connection is dropped.

use std::io::{Read, Write};

use crate::error::ProxyError;
use crate::ProxyResult;

/// Width of metric name and documentation fields (content ≤ 299 bytes).
pub const METRIC_STRING_SIZE: usize = 300;

/// Width of a descriptor block: name, doc, type tag.
pub const DESC_WIRE_SIZE: usize = 604;

/// Width of an event block: name, padding, value, update timestamp.
pub const EVENT_WIRE_SIZE: usize = 320;

/// Width of the envelope payload (descriptor or event, zero-padded).
pub const MSG_PAYLOAD_SIZE: usize = 608;

/// Width of a full message envelope.
pub const MSG_SIZE: usize = 624;

/// Envelope canary; anything else terminates the connection.
pub const MSG_CANARY: u8 = 0x07;

/// Width of a snapshot record in dump and profile files.
pub const SNAPSHOT_WIRE_SIZE: usize = 632;

/// Per-snapshot canary.
pub const SNAPSHOT_CANARY: i32 = 0x1337;

const MSG_PAYLOAD_OFF: usize = 8;
const MSG_CANARY_OFF: usize = 616;

/// The two kinds of metrics the proxy aggregates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricKind {
    /// Monotonic accumulator; every incoming value is added.
    Counter,
    /// Point-in-time observation folded into min / max / rolling average.
    Gauge,
}

impl MetricKind {
    /// Wire tag for this kind (0 is reserved for padding records).
    #[must_use]
    pub const fn to_wire(self) -> i32 {
        match self {
            Self::Counter => 1,
            Self::Gauge => 2,
        }
    }

    /// Decodes a wire tag; `None` for the padding tag 0 or garbage.
    #[must_use]
    pub const fn from_wire(v: i32) -> Option<Self> {
        match v {
            1 => Some(Self::Counter),
            2 => Some(Self::Gauge),
            _ => None,
        }
    }

    /// Prometheus exposition name of the kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Counter => "counter",
            Self::Gauge => "gauge",
        }
    }
}

/// Registration record for a metric: identity, documentation and kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricDescriptor {
    /// Metric name, the sole identity key.
    pub name: String,
    /// Documentation line, immutable after registration.
    pub doc: String,
    /// Metric kind, immutable after registration.
    pub kind: MetricKind,
}

/// A single value observation for a named metric.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricEvent {
    /// Name of the metric the value applies to.
    pub name: String,
    /// Counter delta or gauge observation.
    pub value: f64,
    /// Wall-clock seconds when the value was produced.
    pub update_ts: f64,
}

/// Point-in-time capture of one metric, as stored in dump files.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSnapshot {
    /// Kind of the captured metric.
    pub kind: MetricKind,
    /// Documentation carried along so a fresh store can be rebuilt.
    pub doc: String,
    /// Name, captured value (counter total or gauge average) and timestamp.
    pub event: MetricEvent,
}

/// Decoded ingest message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Register a metric (idempotent when the kind matches).
    Desc(MetricDescriptor),
    /// Update a metric value.
    Val(MetricEvent),
    /// Query: list all known metric descriptors.
    ListAll,
    /// Query: get all current metric values.
    GetAll,
    /// Query: get one metric value by name.
    GetOne {
        /// Name of the requested metric.
        name: String,
    },
    /// A job descriptor record follows on the same stream.
    JobDescription,
}

impl Message {
    const fn type_tag(&self) -> u32 {
        match self {
            Self::Desc(_) => 0,
            Self::Val(_) => 1,
            Self::ListAll => 2,
            Self::GetAll => 3,
            Self::GetOne { .. } => 4,
            Self::JobDescription => 5,
        }
    }

    /// Encodes the message into one fixed-size envelope.
    #[must_use]
    pub fn encode(&self) -> [u8; MSG_SIZE] {
        let mut buf = [0_u8; MSG_SIZE];
        buf[0..4].copy_from_slice(&self.type_tag().to_ne_bytes());
        let payload = &mut buf[MSG_PAYLOAD_OFF..MSG_PAYLOAD_OFF + MSG_PAYLOAD_SIZE];
        match self {
            Self::Desc(desc) => encode_descriptor(desc, payload),
            Self::Val(event) => encode_event(event, payload),
            Self::GetOne { name } => put_str(&mut payload[0..METRIC_STRING_SIZE], name),
            Self::ListAll | Self::GetAll | Self::JobDescription => {}
        }
        buf[MSG_CANARY_OFF] = MSG_CANARY;
        buf
    }

    /// Writes the encoded envelope to `w`.
    ///
    /// # Errors
    /// Propagates the underlying I/O error.
    pub fn write_to(&self, w: &mut impl Write) -> std::io::Result<()> {
        w.write_all(&self.encode())
    }

    /// Reads one envelope from `r`. `Ok(None)` is a clean end of stream
    /// (the peer closed between messages).
    ///
    /// # Errors
    /// Short reads, a bad canary and unknown message types are all fatal for
    /// the connection.
    pub fn read_from(r: &mut impl Read) -> ProxyResult<Option<Self>> {
        let mut buf = [0_u8; MSG_SIZE];
        if !read_exact_or_eof(r, &mut buf)? {
            return Ok(None);
        }
        Self::decode(&buf).map(Some)
    }

    /// Decodes one envelope.
    ///
    /// # Errors
    /// Fails on a bad canary, an unknown type tag or a padding metric kind.
    pub fn decode(buf: &[u8; MSG_SIZE]) -> ProxyResult<Self> {
        if buf[MSG_CANARY_OFF] != MSG_CANARY {
            return Err(ProxyError::BadCanary {
                context: "message",
                found: i64::from(buf[MSG_CANARY_OFF]),
            });
        }

        let tag = u32::from_ne_bytes(slice4(&buf[0..4]));
        let payload = &buf[MSG_PAYLOAD_OFF..MSG_PAYLOAD_OFF + MSG_PAYLOAD_SIZE];
        match tag {
            0 => Ok(Self::Desc(decode_descriptor(payload)?)),
            1 => Ok(Self::Val(decode_event(payload))),
            2 => Ok(Self::ListAll),
            3 => Ok(Self::GetAll),
            4 => Ok(Self::GetOne {
                name: get_str(&payload[0..METRIC_STRING_SIZE]),
            }),
            5 => Ok(Self::JobDescription),
            other => Err(ProxyError::UnknownMessage(other)),
        }
    }
}

/// Copies `s` into `buf`, truncating to `buf.len() - 1` bytes and padding
/// the rest with NULs.
pub(crate) fn put_str(buf: &mut [u8], s: &str) {
    buf.fill(0);
    let n = s.len().min(buf.len() - 1);
    buf[..n].copy_from_slice(&s.as_bytes()[..n]);
}

/// Reads a NUL-padded string field.
pub(crate) fn get_str(buf: &[u8]) -> String {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

pub(crate) fn slice4(b: &[u8]) -> [u8; 4] {
    let mut out = [0_u8; 4];
    out.copy_from_slice(&b[..4]);
    out
}

pub(crate) fn slice8(b: &[u8]) -> [u8; 8] {
    let mut out = [0_u8; 8];
    out.copy_from_slice(&b[..8]);
    out
}

fn encode_descriptor(desc: &MetricDescriptor, buf: &mut [u8]) {
    put_str(&mut buf[0..METRIC_STRING_SIZE], &desc.name);
    put_str(&mut buf[METRIC_STRING_SIZE..2 * METRIC_STRING_SIZE], &desc.doc);
    buf[600..604].copy_from_slice(&desc.kind.to_wire().to_ne_bytes());
}

fn decode_descriptor(buf: &[u8]) -> ProxyResult<MetricDescriptor> {
    let tag = i32::from_ne_bytes(slice4(&buf[600..604]));
    let kind = MetricKind::from_wire(tag)
        .ok_or_else(|| ProxyError::from(format!("invalid metric type tag {tag}")))?;
    Ok(MetricDescriptor {
        name: get_str(&buf[0..METRIC_STRING_SIZE]),
        doc: get_str(&buf[METRIC_STRING_SIZE..2 * METRIC_STRING_SIZE]),
        kind,
    })
}

fn encode_event(event: &MetricEvent, buf: &mut [u8]) {
    put_str(&mut buf[0..METRIC_STRING_SIZE], &event.name);
    buf[304..312].copy_from_slice(&event.value.to_ne_bytes());
    buf[312..320].copy_from_slice(&event.update_ts.to_ne_bytes());
}

fn decode_event(buf: &[u8]) -> MetricEvent {
    MetricEvent {
        name: get_str(&buf[0..METRIC_STRING_SIZE]),
        value: f64::from_ne_bytes(slice8(&buf[304..312])),
        update_ts: f64::from_ne_bytes(slice8(&buf[312..320])),
    }
}

impl MetricDescriptor {
    /// Writes one fixed-size descriptor block (query reply element).
    ///
    /// # Errors
    /// Propagates the underlying I/O error.
    pub fn write_block(&self, w: &mut impl Write) -> std::io::Result<()> {
        let mut buf = [0_u8; DESC_WIRE_SIZE];
        encode_descriptor(self, &mut buf);
        w.write_all(&buf)
    }

    /// Writes a zeroed padding block (type tag 0).
    ///
    /// # Errors
    /// Propagates the underlying I/O error.
    pub fn write_padding_block(w: &mut impl Write) -> std::io::Result<()> {
        w.write_all(&[0_u8; DESC_WIRE_SIZE])
    }

    /// Reads one descriptor block; `None` for a padding block.
    ///
    /// # Errors
    /// Fails on a short read or a garbage type tag.
    pub fn read_block(r: &mut impl Read) -> ProxyResult<Option<Self>> {
        let mut buf = [0_u8; DESC_WIRE_SIZE];
        r.read_exact(&mut buf)?;
        let tag = i32::from_ne_bytes(slice4(&buf[600..604]));
        if tag == 0 {
            return Ok(None);
        }
        decode_descriptor(&buf).map(Some)
    }
}

impl MetricEvent {
    /// Writes one fixed-size event block (query reply element).
    ///
    /// # Errors
    /// Propagates the underlying I/O error.
    pub fn write_block(&self, w: &mut impl Write) -> std::io::Result<()> {
        let mut buf = [0_u8; EVENT_WIRE_SIZE];
        encode_event(self, &mut buf);
        w.write_all(&buf)
    }

    /// Reads one event block. A padding block decodes to an empty name and
    /// zero value.
    ///
    /// # Errors
    /// Fails on a short read.
    pub fn read_block(r: &mut impl Read) -> ProxyResult<Self> {
        let mut buf = [0_u8; EVENT_WIRE_SIZE];
        r.read_exact(&mut buf)?;
        Ok(decode_event(&buf))
    }
}

impl MetricSnapshot {
    /// Encodes the snapshot into one fixed-size record.
    #[must_use]
    pub fn encode(&self) -> [u8; SNAPSHOT_WIRE_SIZE] {
        let mut buf = [0_u8; SNAPSHOT_WIRE_SIZE];
        buf[0..4].copy_from_slice(&self.kind.to_wire().to_ne_bytes());
        put_str(&mut buf[4..4 + METRIC_STRING_SIZE], &self.doc);
        encode_event(&self.event, &mut buf[304..304 + EVENT_WIRE_SIZE]);
        buf[624..628].copy_from_slice(&SNAPSHOT_CANARY.to_ne_bytes());
        buf
    }

    /// Writes the encoded record to `w`.
    ///
    /// # Errors
    /// Propagates the underlying I/O error.
    pub fn write_to(&self, w: &mut impl Write) -> std::io::Result<()> {
        w.write_all(&self.encode())
    }

    /// Reads and validates one snapshot record.
    ///
    /// # Errors
    /// Fails on a short read, a bad canary or a garbage kind tag.
    pub fn read_from(r: &mut impl Read) -> ProxyResult<Self> {
        let mut buf = [0_u8; SNAPSHOT_WIRE_SIZE];
        r.read_exact(&mut buf)?;
        let canary = i32::from_ne_bytes(slice4(&buf[624..628]));
        if canary != SNAPSHOT_CANARY {
            return Err(ProxyError::BadCanary {
                context: "snapshot",
                found: i64::from(canary),
            });
        }
        let tag = i32::from_ne_bytes(slice4(&buf[0..4]));
        let kind = MetricKind::from_wire(tag)
            .ok_or_else(|| ProxyError::from(format!("invalid snapshot type tag {tag}")))?;
        Ok(Self {
            kind,
            doc: get_str(&buf[4..4 + METRIC_STRING_SIZE]),
            event: decode_event(&buf[304..304 + EVENT_WIRE_SIZE]),
        })
    }
}

/// Reads exactly `buf.len()` bytes, returning `false` when the stream is
/// cleanly closed before the first byte. A close mid-record is an error.
///
/// # Errors
/// Propagates the underlying I/O error (interrupted reads are retried).
pub fn read_exact_or_eof(r: &mut impl Read, buf: &mut [u8]) -> std::io::Result<bool> {
    let first = loop {
        match r.read(buf) {
            Ok(n) => break n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    };
    if first == 0 {
        return Ok(false);
    }
    r.read_exact(&mut buf[first..])?;
    Ok(true)
}
