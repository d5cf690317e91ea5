use super::{BitObj, BitObjType};
use crate::error::BitError;
use crate::hash::Key;
use crate::serialize::{DeserializeSized, Serialize};
use crate::signature::Signature;
use crate::BitResult;
use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};
use std::io::prelude::*;

#[derive(PartialEq, Clone, Debug)]
pub struct Commit {
    pub tree: Key,
    pub author: Signature,
    pub committer: Signature,
    pub message: String,
    /// zero or more, in the order they appear in the commit header; a
    /// merge commit has more than one.
    pub parent: Vec<Key>,
    pub gpgsig: Option<String>,
}

impl Commit {
    pub fn new(
        tree: Key,
        parent: Vec<Key>,
        author: Signature,
        committer: Signature,
        message: String,
        gpgsig: Option<String>,
    ) -> Self {
        Self { tree, parent, author, committer, message, gpgsig }
    }

    pub fn tree(&self) -> Key {
        self.tree
    }

    pub fn parents(&self) -> &[Key] {
        &self.parent
    }
}

impl Display for Commit {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let mut buf = vec![];
        self.serialize(&mut buf).map_err(|_| fmt::Error)?;
        write!(f, "{}", String::from_utf8_lossy(&buf))
    }
}

impl Serialize for Commit {
    fn serialize(&self, writer: &mut dyn Write) -> BitResult<()> {
        // continuation lines of a multiline field are prefixed with a space.
        macro_rules! w {
            ($s:expr) => {
                writeln!(writer, "{}", $s.replace('\n', "\n "))
            };
        }

        w!(format!("tree {}", self.tree))?;
        for parent in &self.parent {
            w!(format!("parent {}", parent))?;
        }
        w!(format!("author {}", self.author))?;
        w!(format!("committer {}", self.committer))?;
        if let Some(gpgsig) = &self.gpgsig {
            w!(format!("gpgsig {}", gpgsig))?;
        }

        writeln!(writer)?;
        write!(writer, "{}", self.message)?;
        Ok(())
    }
}

impl DeserializeSized for Commit {
    fn deserialize_sized(r: &mut impl BufRead, size: u64) -> BitResult<Self> {
        let mut lines = r.take(size).lines();
        let mut attrs: HashMap<String, String> = HashMap::new();
        let mut parents: Vec<String> = Vec::new();

        let mut key: Option<String> = None;
        let mut value: Option<String> = None;

        // `parent` may repeat (merge commits have one per parent); every
        // other header is single-valued, so only `parent` gets collected
        // into a list rather than folded into `attrs`.
        let mut flush = |key: &mut Option<String>, value: &mut Option<String>, attrs: &mut HashMap<String, String>, parents: &mut Vec<String>| {
            if let (Some(k), Some(v)) = (key.take(), value.take()) {
                if k == "parent" {
                    parents.push(v);
                } else {
                    attrs.insert(k, v);
                }
            }
        };

        for line in &mut lines {
            let line = line?;

            if let Some(v) = &mut value {
                if let Some(continuation) = line.strip_prefix(' ') {
                    v.push('\n');
                    v.push_str(continuation);
                    continue;
                } else {
                    flush(&mut key, &mut value, &mut attrs, &mut parents);
                }
            }

            if line.is_empty() {
                break;
            }

            let (k, v) = line
                .split_once(' ')
                .ok_or_else(|| BitError::corrupt(format!("malformed commit header line `{}`", line)))?;
            key = Some(k.to_owned());
            value = Some(v.to_owned());
        }
        flush(&mut key, &mut value, &mut attrs, &mut parents);

        let message = lines.collect::<Result<Vec<_>, _>>()?.join("\n");

        let get = |name: &str| -> BitResult<&String> {
            attrs.get(name).ok_or_else(|| BitError::corrupt(format!("commit missing `{}`", name)))
        };

        let tree = get("tree")?.parse()?;
        let parent = parents.into_iter().map(|p| p.parse()).collect::<Result<Vec<Key>, _>>()?;
        let author = get("author")?.parse()?;
        let committer = get("committer")?.parse()?;
        let gpgsig = attrs.get("gpgsig").cloned();
        Ok(Self { tree, parent, author, committer, message, gpgsig })
    }
}

impl BitObj for Commit {
    fn obj_type(&self) -> BitObjType {
        BitObjType::Commit
    }
}
