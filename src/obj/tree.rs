use super::{BitObj, BitObjType};
use crate::error::BitError;
use crate::hash::Key;
use crate::io::BufReadExt;
use crate::serialize::{Deserialize, DeserializeSized, Serialize};
use crate::BitResult;
use num_enum::TryFromPrimitive;
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::convert::TryFrom;
use std::fmt::{self, Debug, Display, Formatter};
use std::fs::Metadata;
use std::io::prelude::*;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::prelude::PermissionsExt;
use std::path::PathBuf;
use std::str::FromStr;

#[derive(Copy, PartialEq, Eq, Clone, TryFromPrimitive, PartialOrd, Ord)]
#[repr(u32)]
// variant order is significant: it implements `Ord`, and directory entries
// must sort after the "file" variants within a tree.
pub enum FileMode {
    Reg = 0o100644,
    Exec = 0o100755,
    Link = 0o120000,
    Tree = 0o40000,
    Gitlink = 0o160000,
}

impl Display for FileMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let n = self.as_u32();
        if f.alternate() { write!(f, "{:o}", n) } else { write!(f, "{:06o}", n) }
    }
}

impl Debug for FileMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl FileMode {
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    pub fn is_link(self) -> bool {
        matches!(self, FileMode::Link)
    }

    pub fn is_file(self) -> bool {
        matches!(self, FileMode::Exec | FileMode::Reg)
    }

    pub fn is_blob(self) -> bool {
        matches!(self, FileMode::Exec | FileMode::Reg | FileMode::Link)
    }

    pub fn is_tree(self) -> bool {
        matches!(self, FileMode::Tree)
    }

    pub fn new(u: u32) -> BitResult<Self> {
        Self::try_from(u).map_err(|_| BitError::corrupt(format!("invalid filemode `{:06o}`", u)))
    }

    pub fn from_metadata(metadata: &Metadata) -> Self {
        if metadata.file_type().is_symlink() {
            Self::Link
        } else if metadata.is_dir() {
            Self::Tree
        } else {
            let is_executable = metadata.permissions().mode() & 0o111;
            if is_executable != 0 { Self::Exec } else { Self::Reg }
        }
    }

    pub fn infer_obj_type(self) -> BitObjType {
        match self {
            Self::Tree => BitObjType::Tree,
            Self::Exec | Self::Reg | Self::Link => BitObjType::Blob,
            Self::Gitlink => BitObjType::Commit,
        }
    }
}

impl FromStr for FileMode {
    type Err = BitError;

    fn from_str(s: &str) -> BitResult<Self> {
        let n = u32::from_str_radix(s, 8)
            .map_err(|e| BitError::codec(format!("invalid filemode `{}`: {}", s, e)))?;
        Self::new(n)
    }
}

/// an ordered set of (mode, path, key) entries, serialized flat with no
/// separators between entries.
#[derive(PartialEq, Debug, Default, Clone)]
pub struct Tree {
    pub entries: BTreeSet<TreeEntry>,
}

impl Display for Tree {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for entry in &self.entries {
            writeln!(f, "{}", entry)?;
        }
        Ok(())
    }
}

impl Serialize for Tree {
    fn serialize(&self, writer: &mut dyn Write) -> BitResult<()> {
        for entry in &self.entries {
            entry.serialize(writer)?;
        }
        Ok(())
    }
}

impl DeserializeSized for Tree {
    fn deserialize_sized(r: &mut impl BufRead, size: u64) -> BitResult<Self> {
        let r = &mut r.take(size);
        let mut tree = Self::default();
        while !r.is_at_eof()? {
            tree.entries.insert(TreeEntry::deserialize(r)?);
        }
        Ok(tree)
    }
}

impl BitObj for Tree {
    fn obj_type(&self) -> BitObjType {
        BitObjType::Tree
    }
}

#[derive(PartialEq, Debug, Clone, Eq)]
pub struct TreeEntry {
    pub mode: FileMode,
    pub path: PathBuf,
    pub hash: Key,
}

impl TreeEntry {
    pub fn new(mode: FileMode, path: PathBuf, hash: Key) -> Self {
        Self { mode, path, hash }
    }

    /// directories sort as though their path ended in `/`: `foo.rs` before
    /// `foo/`, even though the trailing slash isn't stored on disk.
    fn sort_key(&self) -> Vec<u8> {
        let mut bytes = self.path.as_os_str().as_bytes().to_vec();
        if self.mode.is_tree() {
            bytes.push(b'/');
        }
        bytes
    }
}

impl PartialOrd for TreeEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TreeEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}

impl Display for TreeEntry {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {}\t{}",
            self.mode,
            self.mode.infer_obj_type(),
            self.hash,
            self.path.display()
        )
    }
}

impl Deserialize for TreeEntry {
    fn deserialize(r: &mut impl BufRead) -> BitResult<Self> {
        let mut mode_buf = vec![];
        r.read_until(0x20, &mut mode_buf)?;
        if mode_buf.last() != Some(&0x20) {
            return Err(BitError::corrupt("unterminated tree entry mode"));
        }
        mode_buf.pop();
        let mode_str = std::str::from_utf8(&mode_buf)
            .map_err(|e| BitError::codec(format!("tree entry mode is not utf8: {}", e)))?;
        let mode: FileMode = mode_str.parse()?;

        let mut path_buf = vec![];
        r.read_until(0x00, &mut path_buf)?;
        if path_buf.last() != Some(&0x00) {
            return Err(BitError::corrupt("unterminated tree entry path"));
        }
        path_buf.pop();
        let path = PathBuf::from(std::ffi::OsStr::from_bytes(&path_buf));

        let hash = r.read_key()?;
        Ok(Self { mode, path, hash })
    }
}

impl Serialize for TreeEntry {
    fn serialize(&self, writer: &mut dyn Write) -> BitResult<()> {
        write!(writer, "{:#} ", self.mode)?;
        writer.write_all(self.path.as_os_str().as_bytes())?;
        writer.write_all(b"\0")?;
        writer.write_all(self.hash.as_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serialize::DeserializeSized;

    fn entry(mode: FileMode, path: &str, byte: u8) -> TreeEntry {
        TreeEntry::new(mode, PathBuf::from(path), Key::new([byte; 20]))
    }

    #[test]
    fn files_sort_before_same_named_directories() {
        let mut tree = Tree::default();
        tree.entries.insert(entry(FileMode::Reg, "foo", 1));
        tree.entries.insert(entry(FileMode::Tree, "foo", 2));
        let ordered: Vec<_> = tree.entries.iter().map(|e| e.mode).collect();
        assert_eq!(ordered, vec![FileMode::Reg, FileMode::Tree]);
    }

    #[test]
    fn serialize_then_parse_roundtrips() {
        let mut tree = Tree::default();
        tree.entries.insert(entry(FileMode::Reg, "a.txt", 0xaa));
        tree.entries.insert(entry(FileMode::Exec, "run.sh", 0xbb));
        tree.entries.insert(entry(FileMode::Tree, "subdir", 0xcc));

        let mut bytes = vec![];
        tree.serialize(&mut bytes).unwrap();

        let parsed = Tree::deserialize_sized(&mut bytes.as_slice(), bytes.len() as u64).unwrap();
        assert_eq!(tree, parsed);
    }

    #[test]
    fn filemode_roundtrips_through_display_and_parse() {
        for mode in [FileMode::Reg, FileMode::Exec, FileMode::Link, FileMode::Tree] {
            let rendered = format!("{:#}", mode);
            assert_eq!(rendered.parse::<FileMode>().unwrap(), mode);
        }
    }

    #[test]
    fn rejects_invalid_filemode() {
        assert!(FileMode::new(0o123456).is_err());
    }
}
