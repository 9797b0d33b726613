//! Data tuple representation and serialization.

use bytes::Bytes;

/// A key with either a value or a tombstone marker.
///
/// Keys order lexicographically by their raw bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataTuple {
    /// Key bytes.
    key: Bytes,
    /// Value bytes, or None for a tombstone.
    value: Option<Bytes>,
}

/// Header for a serialized tuple.
///
/// Layout (5 bytes):
/// - flags: 1 byte
/// - key_len: 2 bytes
/// - value_len: 2 bytes
#[derive(Debug, Clone, Copy, Default)]
pub struct TupleHeader {
    /// Tuple flags.
    pub flags: TupleFlags,
    /// Length of the key in bytes.
    pub key_len: u16,
    /// Length of the value in bytes (0 for tombstones).
    pub value_len: u16,
}

impl TupleHeader {
    /// Size of the tuple header in bytes.
    pub const SIZE: usize = 5;

    /// Serializes the header to bytes.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0] = self.flags.0;
        buf[1..3].copy_from_slice(&self.key_len.to_le_bytes());
        buf[3..5].copy_from_slice(&self.value_len.to_le_bytes());
        buf
    }

    /// Deserializes the header from bytes.
    pub fn from_bytes(buf: &[u8]) -> Self {
        Self {
            flags: TupleFlags(buf[0]),
            key_len: u16::from_le_bytes([buf[1], buf[2]]),
            value_len: u16::from_le_bytes([buf[3], buf[4]]),
        }
    }
}

/// Flags for tuple state.
#[derive(Debug, Clone, Copy, Default)]
pub struct TupleFlags(u8);

impl TupleFlags {
    /// Tuple records a deletion.
    pub const TOMBSTONE: u8 = 0b0000_0001;

    /// Returns true if the tombstone flag is set.
    pub fn is_tombstone(&self) -> bool {
        self.0 & Self::TOMBSTONE != 0
    }

    /// Sets the tombstone flag.
    pub fn set_tombstone(&mut self, tombstone: bool) {
        if tombstone {
            self.0 |= Self::TOMBSTONE;
        } else {
            self.0 &= !Self::TOMBSTONE;
        }
    }
}

impl DataTuple {
    /// Largest key or value length the encoding can express.
    pub const MAX_FIELD_LEN: usize = u16::MAX as usize;

    /// Creates a tuple holding a value.
    pub fn new(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            value: Some(value.into()),
        }
    }

    /// Creates a tombstone for `key`.
    pub fn tombstone(key: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            value: None,
        }
    }

    /// Returns the key.
    pub fn key(&self) -> &Bytes {
        &self.key
    }

    /// Returns the value, or None for a tombstone.
    pub fn value(&self) -> Option<&Bytes> {
        self.value.as_ref()
    }

    /// Returns true if this tuple is a tombstone.
    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }

    /// Length of the value in bytes (0 for tombstones).
    fn value_len(&self) -> usize {
        self.value.as_ref().map_or(0, |v| v.len())
    }

    /// Total serialized size (header + key + value).
    pub fn encoded_size(&self) -> usize {
        TupleHeader::SIZE + self.key.len() + self.value_len()
    }

    /// Returns true if both fields fit the header's length fields.
    pub fn is_encodable(&self) -> bool {
        self.key.len() <= Self::MAX_FIELD_LEN && self.value_len() <= Self::MAX_FIELD_LEN
    }

    /// Serializes the tuple into `buf`, which must be `encoded_size()` long.
    pub fn encode_into(&self, buf: &mut [u8]) {
        let mut flags = TupleFlags::default();
        flags.set_tombstone(self.is_tombstone());
        let header = TupleHeader {
            flags,
            key_len: self.key.len() as u16,
            value_len: self.value_len() as u16,
        };

        let key_end = TupleHeader::SIZE + self.key.len();
        buf[..TupleHeader::SIZE].copy_from_slice(&header.to_bytes());
        buf[TupleHeader::SIZE..key_end].copy_from_slice(&self.key);
        if let Some(value) = &self.value {
            buf[key_end..key_end + value.len()].copy_from_slice(value);
        }
    }

    /// Serializes the tuple to a new buffer.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![0u8; self.encoded_size()];
        self.encode_into(&mut buf);
        buf
    }

    /// Deserializes a tuple from the start of `buf`.
    ///
    /// Returns the tuple and the number of bytes consumed, or None if the
    /// buffer is too short for the lengths recorded in the header.
    pub fn decode(buf: &[u8]) -> Option<(Self, usize)> {
        if buf.len() < TupleHeader::SIZE {
            return None;
        }
        let header = TupleHeader::from_bytes(buf);
        let key_end = TupleHeader::SIZE + header.key_len as usize;
        let end = key_end + header.value_len as usize;
        if buf.len() < end {
            return None;
        }

        let key = Bytes::copy_from_slice(&buf[TupleHeader::SIZE..key_end]);
        let value = if header.flags.is_tombstone() {
            None
        } else {
            Some(Bytes::copy_from_slice(&buf[key_end..end]))
        };
        Some((Self { key, value }, end))
    }
}

impl std::fmt::Display for DataTuple {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.value {
            Some(value) => write!(f, "{:?} => {} bytes", self.key, value.len()),
            None => write!(f, "{:?} => tombstone", self.key),
        }
    }
}
