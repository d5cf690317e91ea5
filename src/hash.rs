use crate::error::BitError;
use rustc_hash::FxHasher;
use sha1::digest::Output;
use sha1::{Digest, Sha1};
use std::convert::TryInto;
use std::fmt::{self, Debug, Display, Formatter};
use std::hash::Hasher;
use std::ops::Index;
use std::slice::SliceIndex;
use std::str::FromStr;

pub const KEY_SIZE: usize = 20;

/// a 20-byte SHA-1 content key. equality is byte-wise; hex parsing is
/// case-insensitive, hex emission is lower-case. the all-zero value is a
/// reserved null sentinel.
#[derive(PartialEq, Eq, Hash, Clone, Ord, PartialOrd, Copy)]
#[repr(transparent)]
pub struct Key([u8; KEY_SIZE]);

impl From<Output<Sha1>> for Key {
    fn from(bytes: Output<Sha1>) -> Self {
        Self::new(bytes.try_into().unwrap())
    }
}

#[cfg(test)]
impl<'a> From<&'a str> for Key {
    fn from(s: &'a str) -> Self {
        Self::from_str(s).unwrap()
    }
}

impl Key {
    /// hash of an empty blob: e69de29bb2d1d6434b8b29ae775ad8c2e48c5391
    pub const EMPTY_BLOB: Self = Self([
        0xe6, 0x9d, 0xe2, 0x9b, 0xb2, 0xd1, 0xd6, 0x43, 0x4b, 0x8b, 0x29, 0xae, 0x77, 0x5a, 0xd8,
        0xc2, 0xe4, 0x8c, 0x53, 0x91,
    ]);
    /// hash of an empty tree: 4b825dc642cb6eb9a060e54bf8d69288fbee4904
    pub const EMPTY_TREE: Self = Self([
        0x4b, 0x82, 0x5d, 0xc6, 0x42, 0xcb, 0x6e, 0xb9, 0xa0, 0x60, 0xe5, 0x4b, 0xf8, 0xd6, 0x92,
        0x88, 0xfb, 0xee, 0x49, 0x04,
    ]);
    /// null sentinel
    pub const NULL: Self = Self([0; KEY_SIZE]);

    #[inline]
    pub fn new(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    #[inline]
    pub fn is_null(self) -> bool {
        self == Self::NULL
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn short(&self) -> String {
        self.to_hex()[0..7].to_owned()
    }
}

#[cfg(test)]
impl quickcheck::Arbitrary for Key {
    fn arbitrary(g: &mut quickcheck::Gen) -> Self {
        Self((0..20).map(|_| u8::arbitrary(g)).collect::<Vec<_>>().try_into().unwrap())
    }
}

impl FromStr for Key {
    type Err = BitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim_end();
        if s.len() != 40 {
            return Err(BitError::corrupt("invalid key hex string (incorrect length)"));
        }
        let bytes = hex::decode(s)
            .map_err(|e| BitError::corrupt(format!("invalid key hex string: {}", e)))?;
        let arr: [u8; KEY_SIZE] = bytes
            .try_into()
            .map_err(|_| BitError::corrupt("invalid key hex string (incorrect length)"))?;
        Ok(Self(arr))
    }
}

impl AsRef<[u8]> for Key {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl<I> Index<I> for Key
where
    I: SliceIndex<[u8]>,
{
    type Output = I::Output;

    fn index(&self, index: I) -> &Self::Output {
        &self.0[index]
    }
}

impl Debug for Key {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl Display for Key {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let hex = self.to_hex();
        if f.alternate() { write!(f, "{}", &hex[..7]) } else { write!(f, "{}", hex) }
    }
}

pub fn crc_of(bytes: impl AsRef<[u8]>) -> u32 {
    let mut crc = flate2::Crc::new();
    crc.update(bytes.as_ref());
    crc.sum()
}

pub fn hash_bytes(bytes: impl AsRef<[u8]>) -> Key {
    let mut hasher = Sha1::new();
    hasher.update(bytes);
    Key::new(hasher.finalize().into())
}

/// streaming SHA-1 digest, fed incrementally (e.g. header then object bytes)
/// rather than all at once.
#[derive(Default)]
pub struct HashGenerator {
    hasher: Sha1,
}

impl HashGenerator {
    pub fn new() -> Self {
        Self { hasher: Sha1::new() }
    }

    pub fn update(&mut self, bytes: impl AsRef<[u8]>) -> &mut Self {
        self.hasher.update(bytes);
        self
    }

    pub fn finalize(self) -> Key {
        Key::new(self.hasher.finalize().into())
    }
}

pub trait MakeHash {
    fn mk_fx_hash(&self) -> u64;
}

impl<H: std::hash::Hash + ?Sized> MakeHash for H {
    #[inline]
    fn mk_fx_hash(&self) -> u64 {
        let mut state = FxHasher::default();
        self.hash(&mut state);
        state.finish()
    }
}
