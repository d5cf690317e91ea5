use crate::error::BitError;
use crate::io::{BufReadExt, BufReadExtSized, ReadExt};
use crate::serialize::{Deserialize, DeserializeSized};
use crate::BitResult;
use std::io::{BufRead, Read};

/// an instruction sequence transforming a base object into a new one, as
/// found in the body of an `ofs_delta`/`ref_delta` pack entry.
#[derive(PartialEq, Clone, Debug)]
pub struct Delta {
    pub source_size: u64,
    pub target_size: u64,
    ops: Vec<DeltaOp>,
}

impl Delta {
    /// apply every op against `bytes`, the fully resolved base object.
    pub fn expand(&self, bytes: impl AsRef<[u8]>) -> BitResult<Vec<u8>> {
        trace!("Delta::expand(source_size: {} -> target_size: {})", self.source_size, self.target_size);
        let bytes = bytes.as_ref();
        if self.source_size as usize != bytes.len() {
            return Err(BitError::corrupt(format!(
                "expected delta base size to be `{}`, but given base with size `{}`",
                self.source_size,
                bytes.len()
            )));
        }

        let mut expanded = Vec::with_capacity(self.target_size as usize);
        for op in &self.ops {
            match op {
                &DeltaOp::Copy(offset, size) => {
                    let (offset, size) = (offset as usize, size as usize);
                    let end = offset.checked_add(size).ok_or_else(|| {
                        BitError::corrupt("delta copy op overflowed base bounds")
                    })?;
                    let slice = bytes.get(offset..end).ok_or_else(|| {
                        BitError::corrupt("delta copy op read outside base bounds")
                    })?;
                    expanded.extend_from_slice(slice);
                }
                DeltaOp::Insert(slice) => expanded.extend_from_slice(slice),
            }
        }

        if self.target_size as usize != expanded.len() {
            return Err(BitError::corrupt(format!(
                "expected delta result size to be `{}`, but expanded to `{}`",
                self.target_size,
                expanded.len()
            )));
        }

        Ok(expanded)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum DeltaOp {
    /// copy (offset, size) out of the base
    Copy(u64, u64),
    Insert(Vec<u8>),
}

impl Deserialize for DeltaOp {
    fn deserialize(reader: &mut impl BufRead) -> BitResult<Self>
    where
        Self: Sized,
    {
        // the MSB of the opcode byte distinguishes `Copy` from `Insert`.
        let byte = reader.read_u8()?;
        if byte & 0x80 != 0 {
            let n = reader.read_le_packed(byte)?;
            let (offset, mut size) = (n & 0xFFFF_FFFF, n >> 32);
            // a cp_size field of zero bytes present actually means 0x10000,
            // not zero: the largest representable copy doesn't fit in 3 bytes.
            if size == 0 {
                size = 0x10000;
            }
            Ok(Self::Copy(offset, size))
        } else if byte != 0 {
            reader.read_vec::<u8>(byte as usize & 0x7f).map(Self::Insert)
        } else {
            Err(BitError::corrupt("encountered reserved delta opcode `0`"))
        }
    }
}

impl DeserializeSized for Delta {
    fn deserialize_sized(r: &mut impl BufRead, size: u64) -> BitResult<Self>
    where
        Self: Sized,
    {
        let source_size = r.read_size()?;
        let target_size = r.read_size()?;
        let r = &mut r.take(size);
        let mut ops = Vec::new();

        while !r.is_at_eof()? {
            ops.push(DeltaOp::deserialize(r)?);
        }

        Ok(Self { source_size, target_size, ops })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serialize::DeserializeSized;

    #[test]
    fn copy_with_zero_size_field_means_0x10000() {
        // opcode 0x80 (copy, no presence bits set) -> cp_off=0, cp_size=0x10000
        let bytes = [0x80u8];
        let op = DeltaOp::deserialize(&mut &bytes[..]).unwrap();
        assert_eq!(op, DeltaOp::Copy(0, 0x10000));
    }

    #[test]
    fn insert_reads_literal_bytes() {
        let bytes = [0x03u8, b'a', b'b', b'c'];
        let op = DeltaOp::deserialize(&mut &bytes[..]).unwrap();
        assert_eq!(op, DeltaOp::Insert(vec![b'a', b'b', b'c']));
    }

    #[test]
    fn reserved_zero_opcode_is_an_error() {
        let bytes = [0x00u8];
        assert!(DeltaOp::deserialize(&mut &bytes[..]).is_err());
    }

    #[test]
    fn expand_applies_copy_and_insert_ops() {
        let base = b"hello world";
        let delta = Delta {
            source_size: base.len() as u64,
            target_size: 11,
            ops: vec![DeltaOp::Copy(6, 5), DeltaOp::Insert(b" john".to_vec())],
        };
        let result = delta.expand(base).unwrap();
        assert_eq!(result, b"world john");
    }

    #[test]
    fn expand_rejects_mismatched_source_size() {
        let delta = Delta { source_size: 100, target_size: 0, ops: vec![] };
        assert!(delta.expand(b"short").is_err());
    }

    #[test]
    fn deserialize_sized_roundtrips_a_delta_payload() {
        // base_size=5, target_size=5, one copy op covering the whole base
        let mut payload = vec![5u8, 5u8];
        payload.push(0x80 | 0x10); // copy, only cp_size byte 0 present
        payload.push(5); // cp_size = 5
        let delta = Delta::deserialize_sized(&mut &payload[..], payload.len() as u64).unwrap();
        assert_eq!(delta.source_size, 5);
        assert_eq!(delta.target_size, 5);
        let expanded = delta.expand(b"abcde").unwrap();
        assert_eq!(expanded, b"abcde");
    }
}
