//! on-disk pack format: `.pack` entry data plus `.idx` lookup tables,
//! delta-chain resolution, and the directory-wide view over every pack.

pub mod cache;
pub mod file;
pub mod index;
pub mod store;

pub use cache::PackCache;
pub use file::{idx_path_for, is_pack_path, PackFile, VerifyReport, PACK_EXT, PACK_IDX_EXT, PACK_SIGNATURE};
pub use index::{IndexVersion, PackIndex};
pub use store::PackedStore;
