//! inflate a zlib stream out of an in-memory buffer, tracking exactly how
//! many compressed bytes were consumed.
//!
//! pack entries are back to back zlib streams with no length prefix: the
//! only way to know where one ends is to inflate it and see where the
//! decompressor stops consuming input. the source's `zlib_mmap_device`
//! does this against a sliding mmap window; here the window is whatever
//! slice of the mapped pack the caller hands in.

use crate::error::BitError;
use crate::BitResult;
use flate2::{Decompress, FlushDecompress, Status};

pub struct ZlibDevice<'a> {
    input: &'a [u8],
    decompress: Decompress,
}

impl<'a> ZlibDevice<'a> {
    pub fn new(input: &'a [u8]) -> Self {
        Self { input, decompress: Decompress::new(true) }
    }

    /// compressed bytes consumed from `input` so far.
    pub fn bytes_consumed(&self) -> u64 {
        self.decompress.total_in()
    }

    /// inflate the entire stream. `expected_size` is the uncompressed size
    /// recorded in the pack entry header; a mismatch means the pack is
    /// corrupt rather than that our buffer was sized wrong, so it's an
    /// error rather than a silent truncate/grow.
    pub fn inflate_to_end(&mut self, expected_size: u64) -> BitResult<Vec<u8>> {
        let mut out = vec![0u8; expected_size.max(4096) as usize];
        let mut out_pos = 0usize;

        loop {
            let in_pos = self.decompress.total_in() as usize;
            let in_slice = self
                .input
                .get(in_pos..)
                .ok_or_else(|| BitError::corrupt("zlib stream ran past the end of the pack"))?;
            if in_slice.is_empty() {
                return Err(BitError::corrupt("zlib stream truncated"));
            }

            if out_pos == out.len() {
                out.resize(out.len() + 4096, 0);
            }

            let status = self
                .decompress
                .decompress(in_slice, &mut out[out_pos..], FlushDecompress::None)
                .map_err(|err| BitError::codec(format!("zlib inflate failed: {}", err)))?;
            out_pos = self.decompress.total_out() as usize;

            match status {
                Status::StreamEnd => break,
                Status::Ok => continue,
                Status::BufError => return Err(BitError::corrupt("zlib inflate stalled")),
            }
        }

        out.truncate(out_pos);
        if out.len() as u64 != expected_size {
            return Err(BitError::corrupt(format!(
                "expected inflated size {}, got {}",
                expected_size,
                out.len()
            )));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::ZlibEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn zlib_compress(bytes: &[u8]) -> Vec<u8> {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(bytes).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn inflates_and_tracks_bytes_consumed() {
        let plain = b"the quick brown fox jumps over the lazy dog".repeat(4);
        let compressed = zlib_compress(&plain);

        let mut padded = compressed.clone();
        padded.extend_from_slice(b"trailing garbage from the next entry");

        let mut device = ZlibDevice::new(&padded);
        let out = device.inflate_to_end(plain.len() as u64).unwrap();
        assert_eq!(out, plain);
        assert_eq!(device.bytes_consumed(), compressed.len() as u64);
    }

    #[test]
    fn size_mismatch_is_reported_as_corrupt() {
        let plain = b"hello world".to_vec();
        let compressed = zlib_compress(&plain);
        let mut device = ZlibDevice::new(&compressed);
        assert!(device.inflate_to_end(plain.len() as u64 + 1).is_err());
    }
}
