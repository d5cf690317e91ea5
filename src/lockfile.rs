use crate::error::BitError;
use crate::serialize::Deserialize;
use crate::serialize::Serialize;
use crate::BitResult;
use bitflags::bitflags;
use std::cell::Cell;
use std::fs::{File, OpenOptions};
use std::io::BufReader;
use std::io::{self, prelude::*};
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};

const LOCK_FILE_EXT: &str = "lock";

bitflags! {
    pub struct LockfileFlags: u8 {
        const SET_READONLY = 1;
    }
}

/// writes to `<path>.lock` and atomically renames onto `path` on commit. the
/// loose object store's write path (object content never changes once
/// named, so a collision just means someone else already wrote the same
/// bytes) and the packed-ref-style use cases both go through this.
#[derive(Debug)]
pub struct Lockfile {
    // the file being guarded, `None` if it doesn't exist yet
    file: Option<File>,
    lockfile: File,
    flags: LockfileFlags,
    path: PathBuf,
    lockfile_path: PathBuf,
    committed: Cell<bool>,
    rolled_back: Cell<bool>,
}

impl Write for Lockfile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.lockfile.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.lockfile.flush()
    }
}

impl Lockfile {
    /// consumers should go through the `with_*` apis rather than calling
    /// this directly: it leaves a lockfile on disk until commit/rollback.
    fn open(path: impl AsRef<Path>, flags: LockfileFlags) -> BitResult<Self> {
        let path = path.as_ref();
        assert!(!path.exists() || path.is_file(), "cannot create lock on symlinks or directories");
        let lockfile_path = path.with_extension(LOCK_FILE_EXT);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let lockfile = OpenOptions::new().create_new(true).write(true).open(&lockfile_path).map_err(
            |err| match err.kind() {
                io::ErrorKind::AlreadyExists => BitError::corrupt(format!(
                    "failed to lock file `{}` (`{}` already exists)",
                    path.display(),
                    lockfile_path.display()
                )),
                _ => BitError::Io(err),
            },
        )?;

        let file = path.exists().then(|| File::open(path)).transpose()?;

        Ok(Self {
            file,
            lockfile,
            flags,
            lockfile_path,
            path: path.to_path_buf(),
            committed: Cell::new(false),
            rolled_back: Cell::new(false),
        })
    }

    /// should never have mutable access to the guarded file: writes go
    /// through the lockfile only.
    pub fn file(&self) -> Option<&File> {
        self.file.as_ref()
    }

    pub fn with_readonly<R>(
        path: impl AsRef<Path>,
        flags: LockfileFlags,
        f: impl FnOnce(&Self) -> BitResult<R>,
    ) -> BitResult<R> {
        Self::open(path, flags)?.with_readonly_inner(f)
    }

    fn with_readonly_inner<R>(&self, f: impl FnOnce(&Self) -> BitResult<R>) -> BitResult<R> {
        let r = f(self);
        self.rollback();
        r
    }

    pub fn with_mut<R>(
        path: impl AsRef<Path>,
        flags: LockfileFlags,
        f: impl FnOnce(&mut Self) -> BitResult<R>,
    ) -> BitResult<R> {
        Self::open(path, flags)?.with_mut_inner(f)
    }

    /// commits to disk if `f` succeeds, rolls back otherwise.
    fn with_mut_inner<R>(mut self, f: impl FnOnce(&mut Self) -> BitResult<R>) -> BitResult<R> {
        match f(&mut self) {
            Ok(r) => {
                self.commit().map_err(|err| {
                    BitError::corrupt(format!(
                        "failed to write lockfile to `{}` ({}); the updated contents are stored in `{}`",
                        self.path.display(),
                        err,
                        self.lockfile_path.display()
                    ))
                })?;
                Ok(r)
            }
            Err(err) => {
                self.rollback();
                Err(err)
            }
        }
    }

    /// renames the lockfile onto the target path, replacing it if present.
    fn commit(&self) -> io::Result<()> {
        if self.rolled_back.get() {
            return Ok(());
        }
        let set_readonly = self.flags.contains(LockfileFlags::SET_READONLY);
        if set_readonly && self.path.exists() {
            let mut permissions = self.path.metadata()?.permissions();
            permissions.set_readonly(false);
            std::fs::set_permissions(&self.path, permissions)?;
        }

        std::fs::rename(&self.lockfile_path, &self.path)?;
        self.committed.set(true);

        if set_readonly {
            let mut permissions = self.path.metadata()?.permissions();
            permissions.set_readonly(true);
            std::fs::set_permissions(&self.path, permissions)?;
        }

        Ok(())
    }

    fn cleanup(&self) -> BitResult<()> {
        std::fs::remove_file(&self.lockfile_path).map_err(|err| {
            BitError::corrupt(format!(
                "failed to remove lockfile `{}`: {}",
                self.lockfile_path.display(),
                err
            ))
        })
    }

    pub fn rollback(&self) {
        self.rolled_back.set(true);
    }
}

impl Drop for Lockfile {
    fn drop(&mut self) {
        assert!(!self.rolled_back.get() || !self.committed.get());
        if self.rolled_back.get() || !self.committed.get() {
            self.cleanup().expect("failed to clean up lockfile");
        }
    }
}

/// the default is commit; rollback must be explicit. `T` must not have
/// interior mutability or changes made through it may go unnoticed.
pub struct Filelock<T: Serialize> {
    data: T,
    lockfile: Lockfile,
    has_changes: bool,
    rolled_back: bool,
}

impl<T: Serialize + Deserialize + Default> Filelock<T> {
    pub fn lock_with_flags(path: impl AsRef<Path>, flags: LockfileFlags) -> BitResult<Self> {
        let mut lockfile = Lockfile::open(path, flags)?;
        let data = match &mut lockfile.file {
            Some(file) => T::deserialize(&mut BufReader::new(file))?,
            None => T::default(),
        };
        Ok(Filelock { lockfile, data, has_changes: false, rolled_back: false })
    }

    pub fn lock(path: impl AsRef<Path>) -> BitResult<Self> {
        Self::lock_with_flags(path, LockfileFlags::empty())
    }
}

impl<T: Serialize> Filelock<T> {
    pub fn rollback(&mut self) {
        self.rolled_back = true;
        self.lockfile.rollback();
    }
}

impl<T: Serialize> Drop for Filelock<T> {
    fn drop(&mut self) {
        if self.rolled_back || !self.has_changes {
            return;
        }
        self.data.serialize(&mut self.lockfile).expect("failed to write data (in Filelock)");
        self.lockfile.commit().expect("failed to commit lockfile (in Filelock)");
    }
}

impl<T: Serialize> Deref for Filelock<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.data
    }
}

impl<T: Serialize> DerefMut for Filelock<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.has_changes = true;
        &mut self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn with_mut_commits_written_bytes_on_success() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("file");
        Lockfile::with_mut(&path, LockfileFlags::empty(), |lock| {
            lock.write_all(b"hello")?;
            Ok(())
        })
        .unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"hello");
    }

    #[test]
    fn with_mut_leaves_target_untouched_on_failure() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("file");
        std::fs::write(&path, b"original").unwrap();

        let result: BitResult<()> = Lockfile::with_mut(&path, LockfileFlags::empty(), |lock| {
            lock.write_all(b"new")?;
            Err(BitError::corrupt("deliberate failure"))
        });
        assert!(result.is_err());
        assert_eq!(std::fs::read(&path).unwrap(), b"original");
        assert!(!path.with_extension(LOCK_FILE_EXT).exists());
    }

    #[test]
    fn second_concurrent_lock_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("file");
        let _first = Lockfile::open(&path, LockfileFlags::empty()).unwrap();
        assert!(Lockfile::open(&path, LockfileFlags::empty()).is_err());
    }
}
