mod blob;
mod commit;
mod tag;
mod tree;

pub use blob::Blob;
pub use commit::Commit;
pub use tag::Tag;
pub use tree::{FileMode, Tree, TreeEntry};

use crate::error::BitError;
use crate::hash::{HashGenerator, Key};
use crate::io::BufReadExt;
use crate::serialize::{DeserializeSized, Serialize};
use crate::BitResult;
use std::fmt::{self, Display, Formatter};
use std::io::{BufRead, BufReader, Write};
use std::str::FromStr;

/// one of the four object kinds that may be persisted under a [`Key`].
/// `ofs_delta`/`ref_delta` are not members: they exist only inside pack
/// entry headers and are always resolved to one of these four before
/// being handed back to a caller.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum BitObjType {
    Commit,
    Tree,
    Blob,
    Tag,
}

impl Display for BitObjType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let s = match self {
            BitObjType::Commit => "commit",
            BitObjType::Tree => "tree",
            BitObjType::Tag => "tag",
            BitObjType::Blob => "blob",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for BitObjType {
    type Err = BitError;

    fn from_str(s: &str) -> BitResult<Self> {
        match s {
            "commit" => Ok(BitObjType::Commit),
            "tree" => Ok(BitObjType::Tree),
            "tag" => Ok(BitObjType::Tag),
            "blob" => Ok(BitObjType::Blob),
            _ => Err(BitError::codec(format!("unknown object type `{}`", s))),
        }
    }
}

#[derive(PartialEq, Debug, Clone, Copy)]
pub struct BitObjHeader {
    pub obj_type: BitObjType,
    pub size: u64,
}

/// parse the canonical loose-object header `<type> SP <decimal_size> NUL`.
pub(crate) fn read_obj_header(mut reader: impl BufRead) -> BitResult<BitObjHeader> {
    let obj_type = reader.read_ascii_str(0x20)?;
    let size = reader.read_ascii_num(0x00)? as u64;
    Ok(BitObjHeader { obj_type, size })
}

/// hash of `bytes` as the body of an object of `obj_type`, headers included.
/// used by the packed store, which has raw object bytes on hand before it's
/// worth deserializing into a concrete [`Object`].
pub fn hash_object_bytes(obj_type: BitObjType, bytes: &[u8]) -> Key {
    let mut gen = HashGenerator::new();
    gen.update(format!("{} {}\0", obj_type, bytes.len()));
    gen.update(bytes);
    gen.finalize()
}

/// shared behaviour of the four persisted object kinds.
///
/// implementors must never be mutated after construction: doing so would
/// make [`BitObj::hash`] disagree with the key they were looked up under.
pub trait BitObj: Serialize {
    fn obj_type(&self) -> BitObjType;

    /// serialize with the canonical `<type> <size>\0` header prefixed.
    fn serialize_with_headers(&self) -> BitResult<Vec<u8>> {
        let mut bytes = vec![];
        self.serialize(&mut bytes)?;
        let mut buf = Vec::with_capacity(bytes.len() + 32);
        write!(buf, "{} {}\0", self.obj_type(), bytes.len())?;
        buf.extend_from_slice(&bytes);
        Ok(buf)
    }

    /// the key this object would be stored under.
    fn hash(&self) -> BitResult<Key> {
        let mut bytes = vec![];
        self.serialize(&mut bytes)?;
        let mut gen = HashGenerator::new();
        gen.update(format!("{} {}\0", self.obj_type(), bytes.len()));
        gen.update(&bytes);
        Ok(gen.finalize())
    }
}

/// a fully decoded object of unknown-until-matched kind.
#[derive(PartialEq, Debug)]
pub enum Object {
    Blob(Box<Blob>),
    Commit(Box<Commit>),
    Tree(Box<Tree>),
    Tag(Box<Tag>),
}

impl Object {
    pub fn deserialize(
        obj_type: BitObjType,
        size: u64,
        reader: &mut impl BufRead,
    ) -> BitResult<Self> {
        Ok(match obj_type {
            BitObjType::Blob => Self::Blob(Box::new(Blob::deserialize_sized(reader, size)?)),
            BitObjType::Tree => Self::Tree(Box::new(Tree::deserialize_sized(reader, size)?)),
            BitObjType::Commit => Self::Commit(Box::new(Commit::deserialize_sized(reader, size)?)),
            BitObjType::Tag => Self::Tag(Box::new(Tag::deserialize_sized(reader, size)?)),
        })
    }

    pub fn from_slice(obj_type: BitObjType, size: u64, slice: &[u8]) -> BitResult<Self> {
        Self::deserialize(obj_type, size, &mut BufReader::new(slice))
    }

    pub fn is_tree(&self) -> bool {
        matches!(self, Self::Tree(..))
    }

    pub fn is_commit(&self) -> bool {
        matches!(self, Self::Commit(..))
    }

    pub fn into_blob(self) -> BitResult<Blob> {
        match self {
            Self::Blob(blob) => Ok(*blob),
            other => Err(mismatch("blob", other.obj_type())),
        }
    }

    pub fn into_tree(self) -> BitResult<Tree> {
        match self {
            Self::Tree(tree) => Ok(*tree),
            other => Err(mismatch("tree", other.obj_type())),
        }
    }

    pub fn into_commit(self) -> BitResult<Commit> {
        match self {
            Self::Commit(commit) => Ok(*commit),
            other => Err(mismatch("commit", other.obj_type())),
        }
    }

    pub fn into_tag(self) -> BitResult<Tag> {
        match self {
            Self::Tag(tag) => Ok(*tag),
            other => Err(mismatch("tag", other.obj_type())),
        }
    }
}

fn mismatch(expected: &str, found: BitObjType) -> BitError {
    BitError::corrupt(format!("expected {}, found `{}`", expected, found))
}

impl BitObj for Object {
    fn obj_type(&self) -> BitObjType {
        match self {
            Object::Blob(_) => BitObjType::Blob,
            Object::Commit(_) => BitObjType::Commit,
            Object::Tree(_) => BitObjType::Tree,
            Object::Tag(_) => BitObjType::Tag,
        }
    }
}

impl Serialize for Object {
    fn serialize(&self, writer: &mut dyn Write) -> BitResult<()> {
        match self {
            Object::Blob(blob) => blob.serialize(writer),
            Object::Commit(commit) => commit.serialize(writer),
            Object::Tree(tree) => tree.serialize(writer),
            Object::Tag(tag) => tag.serialize(writer),
        }
    }
}

impl Display for Object {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Object::Blob(blob) => Display::fmt(blob, f),
            Object::Commit(commit) => Display::fmt(commit, f),
            Object::Tree(tree) => Display::fmt(tree, f),
            Object::Tag(tag) => Display::fmt(tag, f),
        }
    }
}
