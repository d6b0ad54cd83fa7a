//! Bounded pre-scan of v1-encoded yrs payloads.
//!
//! The yrs decoders size some collections straight from a length prefix
//! before reading any element, so a few bytes claiming billions of entries
//! are enough to abort the process on allocation. Every state vector and
//! update received from a peer or read back from storage is walked here
//! first, following the exact layout the yrs v1 decoder reads, and rejected
//! when a count cannot fit in the bytes that remain.
//!
//! The scan only checks structure. Semantic validity is still decided by
//! yrs when the payload is decoded and applied.

use thiserror::Error;

// Block and content ref numbers of the v1 layout
const BLOCK_GC: u8 = 0;
const BLOCK_SKIP: u8 = 10;
const CONTENT_DELETED: u8 = 1;
const CONTENT_JSON: u8 = 2;
const CONTENT_BINARY: u8 = 3;
const CONTENT_STRING: u8 = 4;
const CONTENT_EMBED: u8 = 5;
const CONTENT_FORMAT: u8 = 6;
const CONTENT_TYPE: u8 = 7;
const CONTENT_ANY: u8 = 8;
const CONTENT_DOC: u8 = 9;
const CONTENT_MOVE: u8 = 11;

const HAS_ORIGIN: u8 = 0b1000_0000;
const HAS_RIGHT_ORIGIN: u8 = 0b0100_0000;
const HAS_PARENT_SUB: u8 = 0b0010_0000;

const TYPE_XML_ELEMENT: u8 = 3;
const TYPE_DOC: u8 = 9;
const TYPE_UNDEFINED: u8 = 15;

/// Deepest nesting accepted inside one `Any` value
const MAX_ANY_DEPTH: usize = 128;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PayloadError {
    #[error("Payload ends at byte {0}")]
    Truncated(usize),

    #[error("Variable-length integer too long at byte {0}")]
    VarIntTooLong(usize),

    #[error("Count {count} cannot fit in the remaining {remaining} bytes")]
    CountTooLarge { count: u64, remaining: usize },

    #[error("Delete range overflows the clock space")]
    RangeOverflow,

    #[error("Invalid UTF-8 in string field")]
    InvalidUtf8,

    #[error("Unknown block content {0}")]
    UnknownContent(u8),

    #[error("Unknown type ref {0}")]
    UnknownTypeRef(u8),

    #[error("Unknown value tag {0}")]
    UnknownValueTag(u8),

    #[error("Value nested deeper than {0} levels")]
    TooDeep(usize),
}

pub type PayloadResult<T> = Result<T, PayloadError>;

/// Check an encoded state vector: `count` pairs of varints, two bytes each
/// at the least.
pub fn check_state_vector(data: &[u8]) -> PayloadResult<()> {
    let mut scan = Scanner::new(data);
    let count = u64::from(scan.read_u32()?);
    scan.ensure_fits(count, 2)?;
    for _ in 0..count {
        scan.skip_var()?;
        scan.skip_var()?;
    }
    Ok(())
}

/// Check an encoded update: the block section, then the delete set.
pub fn check_update(data: &[u8]) -> PayloadResult<()> {
    let mut scan = Scanner::new(data);

    let clients = u64::from(scan.read_u32()?);
    scan.ensure_fits(clients, 3)?;
    for _ in 0..clients {
        let blocks = u64::from(scan.read_u32()?);
        // client, then starting clock
        scan.skip_var()?;
        scan.skip_var()?;
        scan.ensure_fits(blocks, 1)?;
        for _ in 0..blocks {
            scan.block()?;
        }
    }

    let ds_clients = u64::from(scan.read_u32()?);
    scan.ensure_fits(ds_clients, 2)?;
    for _ in 0..ds_clients {
        scan.skip_var()?;
        let ranges = scan.read_u32()?;
        scan.ensure_fits(u64::from(ranges), 2)?;
        for _ in 0..ranges {
            let clock = scan.read_u32()?;
            let len = scan.read_u32()?;
            clock.checked_add(len).ok_or(PayloadError::RangeOverflow)?;
        }
    }
    Ok(())
}

struct Scanner<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Scanner<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// `count` items of at least `min_size` bytes each must fit
    fn ensure_fits(&self, count: u64, min_size: u64) -> PayloadResult<()> {
        let remaining = self.remaining();
        if count.saturating_mul(min_size) > remaining as u64 {
            return Err(PayloadError::CountTooLarge { count, remaining });
        }
        Ok(())
    }

    fn read_u8(&mut self) -> PayloadResult<u8> {
        let byte = *self
            .data
            .get(self.pos)
            .ok_or(PayloadError::Truncated(self.pos))?;
        self.pos += 1;
        Ok(byte)
    }

    fn take(&mut self, len: usize) -> PayloadResult<&'a [u8]> {
        if len > self.remaining() {
            return Err(PayloadError::Truncated(self.data.len()));
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    /// Walk one varint and hand each 7-bit group with its shift to `f`.
    /// Up to eleven bytes, the limit yrs applies to every varint width.
    fn walk_var(&mut self, mut f: impl FnMut(u8, u32)) -> PayloadResult<()> {
        let start = self.pos;
        let mut shift = 0u32;
        loop {
            let byte = self.read_u8()?;
            f(byte & 0x7f, shift);
            shift += 7;
            if byte < 0x80 {
                return Ok(());
            }
            if shift > 70 {
                return Err(PayloadError::VarIntTooLong(start));
            }
        }
    }

    fn skip_var(&mut self) -> PayloadResult<()> {
        self.walk_var(|_, _| {})
    }

    /// Unsigned 32-bit varint with the same wrapping yrs applies
    fn read_u32(&mut self) -> PayloadResult<u32> {
        let mut value = 0u32;
        self.walk_var(|bits, shift| value |= u32::from(bits).wrapping_shl(shift))?;
        Ok(value)
    }

    fn read_u64(&mut self) -> PayloadResult<u64> {
        let mut value = 0u64;
        self.walk_var(|bits, shift| value |= u64::from(bits).wrapping_shl(shift))?;
        Ok(value)
    }

    fn skip_buf(&mut self) -> PayloadResult<&'a [u8]> {
        let len = self.read_u32()?;
        self.take(len as usize)
    }

    fn skip_string(&mut self) -> PayloadResult<()> {
        let raw = self.skip_buf()?;
        std::str::from_utf8(raw).map_err(|_| PayloadError::InvalidUtf8)?;
        Ok(())
    }

    fn block(&mut self) -> PayloadResult<()> {
        let info = self.read_u8()?;
        match info {
            BLOCK_SKIP | BLOCK_GC => self.skip_var(),
            info => {
                let copies_parent = info & (HAS_ORIGIN | HAS_RIGHT_ORIGIN) != 0;
                if info & HAS_ORIGIN != 0 {
                    self.skip_var()?;
                    self.skip_var()?;
                }
                if info & HAS_RIGHT_ORIGIN != 0 {
                    self.skip_var()?;
                    self.skip_var()?;
                }
                if !copies_parent {
                    if self.read_u32()? == 1 {
                        self.skip_string()?;
                    } else {
                        self.skip_var()?;
                        self.skip_var()?;
                    }
                    if info & HAS_PARENT_SUB != 0 {
                        self.skip_string()?;
                    }
                }
                self.content(info & 0b1111)
            }
        }
    }

    fn content(&mut self, content_ref: u8) -> PayloadResult<()> {
        match content_ref {
            CONTENT_DELETED => self.skip_var(),
            CONTENT_JSON => {
                // yrs reads one string more than the declared count
                let count = u64::from(self.read_u32()?);
                self.ensure_fits(count + 1, 1)?;
                for _ in 0..=count {
                    self.skip_string()?;
                }
                Ok(())
            }
            CONTENT_BINARY => self.skip_buf().map(|_| ()),
            CONTENT_STRING | CONTENT_EMBED => self.skip_string(),
            CONTENT_FORMAT => {
                self.skip_string()?;
                self.skip_string()
            }
            CONTENT_TYPE => match self.read_u8()? {
                TYPE_XML_ELEMENT => self.skip_string(),
                0..=6 | TYPE_DOC | TYPE_UNDEFINED => Ok(()),
                other => Err(PayloadError::UnknownTypeRef(other)),
            },
            CONTENT_ANY => {
                let count = u64::from(self.read_u32()?);
                self.ensure_fits(count, 1)?;
                for _ in 0..count {
                    self.any(0)?;
                }
                Ok(())
            }
            CONTENT_DOC => {
                self.skip_string()?;
                self.any(0)
            }
            CONTENT_MOVE => {
                // Bit 0 of the first flags byte marks a collapsed move
                let collapsed = self.data.get(self.pos).is_some_and(|b| b & 1 != 0);
                self.skip_var()?;
                let ids = if collapsed { 1 } else { 2 };
                for _ in 0..ids * 2 {
                    self.skip_var()?;
                }
                Ok(())
            }
            other => Err(PayloadError::UnknownContent(other)),
        }
    }

    fn any(&mut self, depth: usize) -> PayloadResult<()> {
        if depth >= MAX_ANY_DEPTH {
            return Err(PayloadError::TooDeep(MAX_ANY_DEPTH));
        }
        match self.read_u8()? {
            // undefined, null, false, true
            127 | 126 | 121 | 120 => Ok(()),
            125 => self.skip_var(),
            124 => self.take(4).map(|_| ()),
            123 | 122 => self.take(8).map(|_| ()),
            119 => self.skip_string(),
            118 => {
                let len = self.read_u64()?;
                self.ensure_fits(len, 2)?;
                for _ in 0..len {
                    self.skip_string()?;
                    self.any(depth + 1)?;
                }
                Ok(())
            }
            117 => {
                let len = self.read_u64()?;
                self.ensure_fits(len, 1)?;
                for _ in 0..len {
                    self.any(depth + 1)?;
                }
                Ok(())
            }
            116 => self.skip_buf().map(|_| ()),
            other => Err(PayloadError::UnknownValueTag(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use yrs::updates::encoder::Encode;
    use yrs::{
        Any, Array, Doc, Map, ReadTxn, StateVector, Text, Transact, XmlElementPrelim,
        XmlFragment,
    };

    fn full_update(doc: &Doc) -> Vec<u8> {
        doc.transact().encode_state_as_update_v1(&StateVector::default())
    }

    #[test]
    fn test_real_updates_pass() {
        let doc = Doc::with_client_id(3);
        let text = doc.get_or_insert_text("content");
        let meta = doc.get_or_insert_map("meta");
        let channels = doc.get_or_insert_array("channels");
        let xml = doc.get_or_insert_xml_fragment("xml");
        {
            let mut txn = doc.transact_mut();
            text.insert(&mut txn, 0, "hello wörld");
            text.remove_range(&mut txn, 1, 3);
            meta.insert(&mut txn, "title", Any::from("Deck"));
            meta.insert(&mut txn, "count", Any::Number(3.0));
            meta.insert(&mut txn, "ratio", Any::Number(0.5));
            meta.insert(&mut txn, "big", Any::BigInt(1 << 60));
            let nested: Any =
                serde_json::from_value(serde_json::json!({"a": [1, {"b": null}], "c": true}))
                    .unwrap();
            meta.insert(&mut txn, "nested", nested);
            channels.push_back(&mut txn, Any::from(vec![1u8, 2, 3]));
            xml.push_back(&mut txn, XmlElementPrelim::empty("p"));
        }

        assert_eq!(check_update(&full_update(&doc)), Ok(()));
        assert_eq!(check_state_vector(&doc.transact().state_vector().encode_v1()), Ok(()));
        assert_eq!(check_update(&[0, 0]), Ok(()));
    }

    #[test]
    fn test_oversized_state_vector_count() {
        // u32::MAX clients, no entries
        let result = check_state_vector(&[0xff, 0xff, 0xff, 0xff, 0x0f]);
        assert!(matches!(result, Err(PayloadError::CountTooLarge { .. })));
    }

    #[test]
    fn test_oversized_delete_ranges() {
        // no blocks, one delete-set client claiming u32::MAX ranges
        let result = check_update(&[0x00, 0x01, 0x00, 0xff, 0xff, 0xff, 0xff, 0x0f]);
        assert!(matches!(result, Err(PayloadError::CountTooLarge { .. })));
    }

    #[test]
    fn test_oversized_nested_value() {
        // one client, one Any block under root "m", array claiming 2^40 values
        let update = [
            0x01, 0x01, 0x05, 0x00, // one client with one block, client 5 at clock 0
            0x08, 0x01, 0x01, b'm', // Any content, named parent "m"
            0x01, 117, 0x80, 0x80, 0x80, 0x80, 0x80, 0x20, // one value: huge array
            0x00,
        ];
        let result = check_update(&update);
        assert!(matches!(result, Err(PayloadError::CountTooLarge { .. })));
    }

    #[test]
    fn test_deep_nesting_is_refused() {
        let mut update = vec![0x01, 0x01, 0x05, 0x00, 0x08, 0x01, 0x01, b'm', 0x01];
        for _ in 0..MAX_ANY_DEPTH + 1 {
            update.extend_from_slice(&[117, 0x01]);
        }
        update.extend_from_slice(&[126, 0x00]);
        assert_eq!(check_update(&update), Err(PayloadError::TooDeep(MAX_ANY_DEPTH)));
    }

    #[test]
    fn test_invalid_utf8_and_truncation() {
        // String content whose bytes are not UTF-8
        let update = [0x01, 0x01, 0x05, 0x00, 0x04, 0x01, 0x01, b't', 0x02, 0xc3, 0x28, 0x00];
        assert_eq!(check_update(&update), Err(PayloadError::InvalidUtf8));

        // Clock varint cut short
        assert!(matches!(
            check_update(&[0x01, 0x00, 0x05, 0x80]),
            Err(PayloadError::Truncated(_))
        ));
        assert!(matches!(
            check_update(&[0x00, 0x01, 0x00, 0x01, 0xff, 0xff, 0xff, 0xff, 0x0f, 0x01]),
            Err(PayloadError::RangeOverflow)
        ));
    }
}
