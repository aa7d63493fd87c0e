//! Traversal buffer codec.
//!
//! A traversal buffer is an 8-byte header `{allocatedBytes: u32, usedBytes: u32}`
//! followed by packed object reports. Every report is a 40-byte header
//! immediately followed by its body, padded to 8-byte alignment:
//!
//! ```text
//! valueBuffSize: i32 | namedSize: i16 | objectSecurityPolicyId: u16
//! objId: u64 | oclass: u64 | firstOffset: i64 | idxSizeBits: u64
//! body[valueBuffSize] padding
//! ```
//! All fields are little-endian, as the C library lays them out on supported hosts.

use crate::gci::oop::Oop;
use bit_field::BitField;
use bytes::{Buf, BufMut, Bytes, BytesMut};

pub const TRAV_HEADER_SIZE: usize = 8;
pub const REPORT_HEADER_SIZE: usize = 40;

/// Round up to the next multiple of 8.
#[inline(always)]
pub const fn align8(n: usize) -> usize {
    (n + 7) & !7
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum TraversalError {
    #[error("traversal buffer too short for a header ({0} bytes)")]
    NoHeader(usize),
    #[error("traversal needs {required} bytes, buffer capacity is {capacity}")]
    CapacityExceeded { required: usize, capacity: usize },
    #[error("object report body of {0} bytes does not fit a report header")]
    BodyTooLarge(usize),
    #[error("{0} bytes of reports do not fit the traversal header")]
    TooLarge(usize),
    #[error("more reports pending but none fits a buffer of {0} bytes")]
    EmptyPage(usize),
}

/// Status of a traversal fetch. Only the status tells whether the VM holds more reports,
/// the payload size never does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraversalStatus {
    Complete,
    More,
}

/// Object implementation format stored in [`IdxSizeBits`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum ObjImpl {
    #[strum(serialize = "pointer")]
    Pointer,
    #[strum(serialize = "byte")]
    Byte,
    #[strum(serialize = "nsc")]
    Nsc,
    #[strum(serialize = "special")]
    Special,
}

/// Bitfield describing indexable slots of a reported object.
///
/// bits 0..40: indexable size, 40..42: implementation, 42: indexable, 43: invariant.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct IdxSizeBits(pub u64);

impl IdxSizeBits {
    const SIZE: std::ops::Range<usize> = 0..40;
    const IMPL: std::ops::Range<usize> = 40..42;
    const INDEXABLE: usize = 42;
    const INVARIANT: usize = 43;

    pub fn new(idx_size: u64, implementation: ObjImpl, indexable: bool, invariant: bool) -> Self {
        let mut bits = 0u64;
        bits.set_bits(Self::SIZE, idx_size & ((1 << 40) - 1));
        bits.set_bits(Self::IMPL, implementation as u64);
        bits.set_bit(Self::INDEXABLE, indexable);
        bits.set_bit(Self::INVARIANT, invariant);
        Self(bits)
    }

    pub fn idx_size(&self) -> u64 {
        self.0.get_bits(Self::SIZE)
    }

    pub fn implementation(&self) -> ObjImpl {
        match self.0.get_bits(Self::IMPL) {
            0 => ObjImpl::Pointer,
            1 => ObjImpl::Byte,
            2 => ObjImpl::Nsc,
            _ => ObjImpl::Special,
        }
    }

    pub fn is_indexable(&self) -> bool {
        self.0.get_bit(Self::INDEXABLE)
    }

    pub fn is_invariant(&self) -> bool {
        self.0.get_bit(Self::INVARIANT)
    }
}

impl std::fmt::Debug for IdxSizeBits {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdxSizeBits")
            .field("idx_size", &self.idx_size())
            .field("impl", &self.implementation())
            .field("indexable", &self.is_indexable())
            .field("invariant", &self.is_invariant())
            .finish()
    }
}

/// Raw representation of one traversed object.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectReport {
    pub obj_id: Oop,
    pub oclass: Oop,
    pub first_offset: i64,
    pub named_size: i16,
    pub object_security_policy_id: u16,
    pub idx_size_bits: IdxSizeBits,
    pub body: Bytes,
}

impl ObjectReport {
    /// Body interpreted as OOPs, for pointer objects.
    pub fn body_oops(&self) -> Vec<Oop> {
        self.body
            .chunks_exact(8)
            .map(|mut chunk| Oop::from_raw(chunk.get_u64_le()))
            .collect()
    }

    fn packed_size(&self) -> usize {
        REPORT_HEADER_SIZE + align8(self.body.len())
    }
}

/// Packed size of reports without the buffer header.
pub fn packed_size(reports: &[ObjectReport]) -> usize {
    reports.iter().map(ObjectReport::packed_size).sum()
}

/// Encode reports into a buffer whose allocated size equals its used size.
pub fn encode(reports: &[ObjectReport]) -> Result<Bytes, TraversalError> {
    let used = packed_size(reports);
    let header = header_bytes(used)?;
    let mut buf = BytesMut::with_capacity(TRAV_HEADER_SIZE + used);
    buf.put_u32_le(header);
    buf.put_u32_le(header);
    for report in reports {
        put_report(&mut buf, report)?;
    }
    Ok(buf.freeze())
}

/// Byte count as stored in the buffer header.
fn header_bytes(n: usize) -> Result<u32, TraversalError> {
    u32::try_from(n).map_err(|_| TraversalError::TooLarge(n))
}

fn put_report(buf: &mut BytesMut, report: &ObjectReport) -> Result<(), TraversalError> {
    let value_buff_size =
        i32::try_from(report.body.len())
            .map_err(|_| TraversalError::BodyTooLarge(report.body.len()))?;
    buf.put_i32_le(value_buff_size);
    buf.put_i16_le(report.named_size);
    buf.put_u16_le(report.object_security_policy_id);
    buf.put_u64_le(report.obj_id.raw());
    buf.put_u64_le(report.oclass.raw());
    buf.put_i64_le(report.first_offset);
    buf.put_u64_le(report.idx_size_bits.0);
    buf.put_slice(&report.body);
    buf.put_bytes(0, align8(report.body.len()) - report.body.len());
    Ok(())
}

/// Decode reports until the used-bytes boundary.
///
/// A record whose header or body would cross the boundary ends decoding, the reports
/// before it are returned.
pub fn decode(buffer: &[u8]) -> Result<Vec<ObjectReport>, TraversalError> {
    if buffer.len() < TRAV_HEADER_SIZE {
        return Err(TraversalError::NoHeader(buffer.len()));
    }
    let mut header = &buffer[..TRAV_HEADER_SIZE];
    let _allocated = header.get_u32_le();
    let used = header.get_u32_le() as usize;

    let available = buffer.len() - TRAV_HEADER_SIZE;
    if used > available {
        log::warn!(target: "gci", "traversal used bytes ({used}) exceeds buffer ({available})");
    }
    let mut body = &buffer[TRAV_HEADER_SIZE..TRAV_HEADER_SIZE + used.min(available)];

    let mut reports = vec![];
    while body.remaining() >= REPORT_HEADER_SIZE {
        let mut rec = &body[..REPORT_HEADER_SIZE];
        let value_buff_size = rec.get_i32_le();
        let named_size = rec.get_i16_le();
        let object_security_policy_id = rec.get_u16_le();
        let obj_id = Oop::from_raw(rec.get_u64_le());
        let oclass = Oop::from_raw(rec.get_u64_le());
        let first_offset = rec.get_i64_le();
        let idx_size_bits = IdxSizeBits(rec.get_u64_le());

        let Ok(value_size) = usize::try_from(value_buff_size) else {
            log::warn!(target: "gci", "negative value buffer size in report for {obj_id:?}");
            break;
        };
        if REPORT_HEADER_SIZE + value_size > body.remaining() {
            log::warn!(target: "gci", "truncated report for {obj_id:?}, stop decoding");
            break;
        }
        body.advance(REPORT_HEADER_SIZE);
        let value = Bytes::copy_from_slice(&body[..value_size]);
        body.advance(align8(value_size).min(body.remaining()));

        reports.push(ObjectReport {
            obj_id,
            oclass,
            first_offset,
            named_size,
            object_security_policy_id,
            idx_size_bits,
            body: value,
        });
    }

    Ok(reports)
}

/// Heap storage for a traversal buffer handed to the C library.
///
/// Backed by 64-bit words so the body is 8-byte aligned.
pub struct TraversalBuffer {
    words: Vec<u64>,
}

impl TraversalBuffer {
    /// Empty buffer able to hold `body_capacity` bytes of reports.
    pub fn with_capacity(body_capacity: usize) -> Self {
        let body = align8(body_capacity);
        let mut buf = Self {
            words: vec![0; (TRAV_HEADER_SIZE + body) / 8],
        };
        buf.set_header(body as u32, 0);
        buf
    }

    /// Buffer holding encoded reports, fails when they do not fit `body_capacity`.
    pub fn from_reports(
        reports: &[ObjectReport],
        body_capacity: usize,
    ) -> Result<Self, TraversalError> {
        let required = packed_size(reports);
        if required > body_capacity {
            return Err(TraversalError::CapacityExceeded {
                required,
                capacity: body_capacity,
            });
        }
        let encoded = encode(reports)?;
        let mut buf = Self::with_capacity(body_capacity);
        buf.as_bytes_mut()[TRAV_HEADER_SIZE..TRAV_HEADER_SIZE + required]
            .copy_from_slice(&encoded[TRAV_HEADER_SIZE..]);
        buf.set_header(header_bytes(buf.allocated())?, header_bytes(required)?);
        Ok(buf)
    }

    fn set_header(&mut self, allocated: u32, used: u32) {
        let bytes = self.as_bytes_mut();
        bytes[0..4].copy_from_slice(&allocated.to_le_bytes());
        bytes[4..8].copy_from_slice(&used.to_le_bytes());
    }

    pub fn allocated(&self) -> usize {
        (&self.as_bytes()[0..4]).get_u32_le() as usize
    }

    pub fn used(&self) -> usize {
        (&self.as_bytes()[4..8]).get_u32_le() as usize
    }

    pub fn as_bytes(&self) -> &[u8] {
        // SAFETY: u64 storage reinterpreted as bytes, u8 has no alignment requirement.
        unsafe { std::slice::from_raw_parts(self.words.as_ptr().cast(), self.words.len() * 8) }
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: see `as_bytes`, the borrow is exclusive.
        unsafe {
            std::slice::from_raw_parts_mut(self.words.as_mut_ptr().cast(), self.words.len() * 8)
        }
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.words.as_mut_ptr().cast()
    }

    pub fn reports(&self) -> Result<Vec<ObjectReport>, TraversalError> {
        decode(self.as_bytes())
    }
}
