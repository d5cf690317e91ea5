use super::{BitObj, BitObjType};
use crate::error::BitResult;
use crate::io::ReadExt;
use crate::serialize::{DeserializeSized, Serialize};
use std::fmt::{self, Display, Formatter};
use std::io::prelude::*;

#[derive(PartialEq, Eq, Debug, Clone)]
pub struct Blob {
    pub bytes: Vec<u8>,
}

impl Blob {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub fn from_reader<R: Read>(mut reader: R) -> BitResult<Self> {
        Ok(Self::new(reader.read_to_vec()?))
    }
}

impl Display for Blob {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.bytes) {
            Ok(utf8) => write!(f, "{}", utf8),
            Err(..) => write!(f, "<binary>"),
        }
    }
}

impl Serialize for Blob {
    fn serialize(&self, writer: &mut dyn Write) -> BitResult<()> {
        writer.write_all(&self.bytes)?;
        Ok(())
    }
}

impl DeserializeSized for Blob {
    fn deserialize_sized(reader: &mut impl BufRead, size: u64) -> BitResult<Self> {
        let bytes = reader.take(size).read_to_vec()?;
        Ok(Self::new(bytes))
    }
}

impl BitObj for Blob {
    fn obj_type(&self) -> BitObjType {
        BitObjType::Blob
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_blob_has_no_bytes() {
        let blob = Blob::from_reader(&b""[..]).unwrap();
        assert!(blob.bytes.is_empty());
    }

    #[test]
    fn displays_utf8_content_verbatim() {
        let blob = Blob::new(b"hello\n".to_vec());
        assert_eq!(blob.to_string(), "hello\n");
    }

    #[test]
    fn displays_non_utf8_content_as_binary_placeholder() {
        let blob = Blob::new(vec![0xff, 0xfe, 0x00]);
        assert_eq!(blob.to_string(), "<binary>");
    }
}
