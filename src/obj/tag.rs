use super::{BitObj, BitObjType};
use crate::error::BitError;
use crate::hash::Key;
use crate::serialize::{DeserializeSized, Serialize};
use crate::signature::Signature;
use crate::BitResult;
use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};
use std::io::prelude::*;

/// an annotated tag: a standalone object pointing at another object plus a
/// message and (optionally) a tagger signature.
#[derive(PartialEq, Clone, Debug)]
pub struct Tag {
    pub object: Key,
    pub tagged_type: BitObjType,
    pub tag: String,
    pub tagger: Option<Signature>,
    pub message: String,
}

impl Tag {
    pub fn new(
        object: Key,
        tagged_type: BitObjType,
        tag: String,
        tagger: Option<Signature>,
        message: String,
    ) -> Self {
        Self { object, tagged_type, tag, tagger, message }
    }
}

impl Display for Tag {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let mut buf = vec![];
        self.serialize(&mut buf).map_err(|_| fmt::Error)?;
        write!(f, "{}", String::from_utf8_lossy(&buf))
    }
}

impl Serialize for Tag {
    fn serialize(&self, writer: &mut dyn Write) -> BitResult<()> {
        writeln!(writer, "object {}", self.object)?;
        writeln!(writer, "type {}", self.tagged_type)?;
        writeln!(writer, "tag {}", self.tag)?;
        if let Some(tagger) = &self.tagger {
            writeln!(writer, "tagger {}", tagger)?;
        }
        writeln!(writer)?;
        write!(writer, "{}", self.message)?;
        Ok(())
    }
}

impl DeserializeSized for Tag {
    fn deserialize_sized(r: &mut impl BufRead, size: u64) -> BitResult<Self> {
        let mut lines = r.take(size).lines();
        let mut attrs: HashMap<String, String> = HashMap::new();

        for line in &mut lines {
            let line = line?;
            if line.is_empty() {
                break;
            }
            let (k, v) = line
                .split_once(' ')
                .ok_or_else(|| BitError::corrupt(format!("malformed tag header line `{}`", line)))?;
            attrs.insert(k.to_owned(), v.to_owned());
        }

        let message = lines.collect::<Result<Vec<_>, _>>()?.join("\n");

        let get = |name: &str| -> BitResult<&String> {
            attrs.get(name).ok_or_else(|| BitError::corrupt(format!("tag missing `{}`", name)))
        };

        let object = get("object")?.parse()?;
        let tagged_type = get("type")?.parse()?;
        let tag = get("tag")?.clone();
        let tagger = attrs.get("tagger").map(|s| s.parse()).transpose()?;
        Ok(Self { object, tagged_type, tag, tagger, message })
    }
}

impl BitObj for Tag {
    fn obj_type(&self) -> BitObjType {
        BitObjType::Tag
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signature::{EpochTime, Time, TimeZoneOffset};

    #[test]
    fn serialize_then_parse_roundtrips_a_tag() {
        let tagger = Signature::new(
            "Andy Yu".to_owned(),
            "andyyu2004@gmail.com".to_owned(),
            Time::new(EpochTime::new(0), TimeZoneOffset::new(0)),
        );
        let tag = Tag::new(
            Key::EMPTY_BLOB,
            BitObjType::Blob,
            "v1.0.0".to_owned(),
            Some(tagger),
            "release notes".to_owned(),
        );
        let mut bytes = vec![];
        tag.serialize(&mut bytes).unwrap();
        let parsed = Tag::deserialize_sized(&mut bytes.as_slice(), bytes.len() as u64).unwrap();
        assert_eq!(tag, parsed);
    }

    #[test]
    fn tag_without_tagger_roundtrips() {
        let tag = Tag::new(Key::EMPTY_TREE, BitObjType::Tree, "snapshot".to_owned(), None, "m".to_owned());
        let mut bytes = vec![];
        tag.serialize(&mut bytes).unwrap();
        let parsed = Tag::deserialize_sized(&mut bytes.as_slice(), bytes.len() as u64).unwrap();
        assert_eq!(tag, parsed);
    }

    #[test]
    fn missing_object_header_is_corrupt() {
        let bytes = b"type blob\ntag x\n\nmsg";
        assert!(Tag::deserialize_sized(&mut &bytes[..], bytes.len() as u64).is_err());
    }
}
