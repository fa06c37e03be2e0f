//! Fixed-width record encoding
//!
//! Every kind's record encodes to exactly [`PersistentRecord::ENCODED_LEN`]
//! bytes: a common [`RecordHeader`] followed by the kind-specific body,
//! zero padded. Freed slots are rewritten as zeros of the same width.

use fsledger_common::{
    Error, MirrorExistenceState, ObjectKindTag, ObjectName, PersistentState, Result, SerialNumber,
    TransactionId,
};
use std::fmt;

/// Fields shared by every record kind
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecordHeader {
    pub state: PersistentState,
    pub mirror_existence: MirrorExistenceState,
    /// Transaction that created the record; cleared once its outcome is applied
    pub owner: TransactionId,
    pub serial: SerialNumber,
}

impl RecordHeader {
    pub const ENCODED_LEN: usize = 16;

    #[must_use]
    pub const fn new(
        state: PersistentState,
        mirror_existence: MirrorExistenceState,
        owner: TransactionId,
    ) -> Self {
        Self {
            state,
            mirror_existence,
            owner,
            serial: SerialNumber::ZERO,
        }
    }

    pub fn encode(&self, w: &mut FixedWriter) {
        w.put_u8(self.state.as_u8());
        w.put_u8(self.mirror_existence.as_u8());
        w.put_u16(0);
        w.put_u32(self.owner.get());
        w.put_u64(self.serial.get());
    }

    pub fn decode(r: &mut FixedReader<'_>) -> Result<Self> {
        let state = r.get_u8()?;
        let mirror = r.get_u8()?;
        r.skip(2)?;
        let owner = TransactionId::new(r.get_u32()?);
        let serial = SerialNumber::new(r.get_u64()?);
        Ok(Self {
            state: PersistentState::from_u8(state)
                .ok_or_else(|| Error::corruption(format!("unknown persistent state {state}")))?,
            mirror_existence: MirrorExistenceState::from_u8(mirror)
                .ok_or_else(|| Error::corruption(format!("unknown mirror state {mirror}")))?,
            owner,
            serial,
        })
    }
}

/// A record type that can live in an [`ObjectStore`](crate::ObjectStore)
pub trait PersistentRecord: Clone + fmt::Debug + Send + Sync + 'static {
    /// Table this record type belongs to
    const KIND: ObjectKindTag;

    /// Width of the encoded image, header included
    const ENCODED_LEN: usize;

    /// Logical key used by the duplicate guard
    type Key: PartialEq + fmt::Debug;

    fn key(&self) -> Self::Key;

    fn name(&self) -> ObjectName;

    fn header(&self) -> &RecordHeader;

    fn header_mut(&mut self) -> &mut RecordHeader;

    fn encode_body(&self, w: &mut FixedWriter);

    fn decode_body(header: RecordHeader, r: &mut FixedReader<'_>) -> Result<Self>;

    /// Whether `self` may be added while `existing` is live under the same key
    fn allows_duplicate_of(&self, _existing: &Self) -> bool {
        false
    }

    fn serial(&self) -> SerialNumber {
        self.header().serial
    }

    fn state(&self) -> PersistentState {
        self.header().state
    }

    fn mirror_existence(&self) -> MirrorExistenceState {
        self.header().mirror_existence
    }

    fn encode(&self) -> Vec<u8> {
        let mut w = FixedWriter::with_capacity(Self::ENCODED_LEN);
        self.header().encode(&mut w);
        self.encode_body(&mut w);
        w.finish(Self::ENCODED_LEN)
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != Self::ENCODED_LEN {
            return Err(Error::corruption(format!(
                "{} image is {} bytes, expected {}",
                Self::KIND,
                bytes.len(),
                Self::ENCODED_LEN
            )));
        }
        let mut r = FixedReader::new(bytes);
        let header = RecordHeader::decode(&mut r)?;
        Self::decode_body(header, &mut r)
    }
}

/// Little-endian writer for fixed-width images
pub struct FixedWriter {
    buf: Vec<u8>,
}

impl FixedWriter {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    pub fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn put_bool(&mut self, v: bool) {
        self.buf.push(u8::from(v));
    }

    pub fn put_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_i16(&mut self, v: i16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_bytes(&mut self, v: &[u8]) {
        self.buf.extend_from_slice(v);
    }

    /// Zero pad to `len` bytes
    pub fn finish(mut self, len: usize) -> Vec<u8> {
        debug_assert!(self.buf.len() <= len, "record body exceeds its fixed width");
        self.buf.resize(len, 0);
        self.buf
    }
}

/// Little-endian reader over a fixed-width image
pub struct FixedReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> FixedReader<'a> {
    pub const fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn get_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let end = self.pos + N;
        let slice = self
            .data
            .get(self.pos..end)
            .ok_or_else(|| Error::corruption("record image truncated"))?;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        self.pos = end;
        Ok(out)
    }

    pub fn skip(&mut self, n: usize) -> Result<()> {
        if self.pos + n > self.data.len() {
            return Err(Error::corruption("record image truncated"));
        }
        self.pos += n;
        Ok(())
    }

    pub fn get_u8(&mut self) -> Result<u8> {
        Ok(self.get_array::<1>()?[0])
    }

    pub fn get_bool(&mut self) -> Result<bool> {
        Ok(self.get_u8()? != 0)
    }

    pub fn get_u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.get_array()?))
    }

    pub fn get_i16(&mut self) -> Result<i16> {
        Ok(i16::from_le_bytes(self.get_array()?))
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.get_array()?))
    }

    pub fn get_i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.get_array()?))
    }

    pub fn get_u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.get_array()?))
    }

    pub fn get_i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.get_array()?))
    }
}

#[cfg(test)]
pub(crate) mod test_record {
    //! Minimal record type for store-level tests

    use super::*;
    use fsledger_common::RelFileNode;

    #[derive(Clone, Debug, PartialEq, Eq)]
    pub struct TestRecord {
        pub header: RecordHeader,
        pub key: u32,
        pub payload: u64,
    }

    impl TestRecord {
        pub fn new(key: u32, state: PersistentState, mirror: MirrorExistenceState) -> Self {
            Self {
                header: RecordHeader::new(state, mirror, TransactionId::new(10)),
                key,
                payload: u64::from(key) * 100,
            }
        }

        pub fn created(key: u32) -> Self {
            Self::new(key, PersistentState::Created, MirrorExistenceState::NotMirrored)
        }
    }

    impl PersistentRecord for TestRecord {
        const KIND: ObjectKindTag = ObjectKindTag::RelationFile;
        const ENCODED_LEN: usize = RecordHeader::ENCODED_LEN + 16;
        type Key = u32;

        fn key(&self) -> u32 {
            self.key
        }

        fn name(&self) -> ObjectName {
            ObjectName::RelationFile {
                node: RelFileNode::new(1663, 1, self.key),
                segment: 0,
            }
        }

        fn header(&self) -> &RecordHeader {
            &self.header
        }

        fn header_mut(&mut self) -> &mut RecordHeader {
            &mut self.header
        }

        fn encode_body(&self, w: &mut FixedWriter) {
            w.put_u32(self.key);
            w.put_u64(self.payload);
        }

        fn decode_body(header: RecordHeader, r: &mut FixedReader<'_>) -> Result<Self> {
            Ok(Self {
                header,
                key: r.get_u32()?,
                payload: r.get_u64()?,
            })
        }

        fn allows_duplicate_of(&self, existing: &Self) -> bool {
            crate::guard::abort_race_exception(
                existing.state(),
                existing.mirror_existence(),
                self.state(),
                self.mirror_existence(),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_record::TestRecord;
    use super::*;

    #[test]
    fn test_fixed_width_image() {
        let mut record = TestRecord::created(42);
        record.header.serial = SerialNumber::new(7);

        let image = record.encode();
        assert_eq!(image.len(), TestRecord::ENCODED_LEN);
        // Padding after the body stays zero
        assert!(image[RecordHeader::ENCODED_LEN + 12..].iter().all(|b| *b == 0));

        assert_eq!(TestRecord::decode(&image).unwrap(), record);
    }

    #[test]
    fn test_decode_rejects_bad_images() {
        let mut image = TestRecord::created(1).encode();
        assert!(TestRecord::decode(&image[..image.len() - 1]).is_err());

        image[0] = 99;
        let err = TestRecord::decode(&image).unwrap_err();
        assert!(matches!(err, Error::Corruption(_)));
    }

    #[test]
    fn test_reader_bounds() {
        let mut r = FixedReader::new(&[1, 0, 0]);
        assert_eq!(r.get_u16().unwrap(), 1);
        assert!(r.get_u32().is_err());
        assert_eq!(r.get_u8().unwrap(), 0);
        assert!(r.skip(1).is_err());
    }
}
