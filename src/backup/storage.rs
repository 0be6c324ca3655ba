//! The filesystem the backup engine writes images to, and the retry discipline around it.
//!
//! The SD card that holds backups is unreliable: it can drop off the bus in the middle of a
//! transfer, after which every open file is dead and the card has to be reinitialized and
//! remounted. [ResilientFile] hides that from the backup engine by recovering and retrying until
//! its [RetryPolicy] gives up.

use crate::error::{Error, Result};
use crate::util::{ReadExt, WriteExt};

use std::collections::HashMap;
use std::fs;
use std::io::{self, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use retry::delay::Fixed;
use retry::OperationResult;
use thiserror::Error;

/// Failures reported by the filesystem
#[derive(Error, Debug, Copy, Clone, Eq, PartialEq)]
pub enum FsError {
    #[error("storage not ready")]
    NotReady,

    #[error("no such file")]
    NoFile,

    #[error("access denied")]
    Denied,

    #[error("disk error")]
    DiskErr,

    #[error("invalid file object")]
    InvalidObject,

    /// The operation moved fewer bytes than asked
    #[error("short transfer")]
    ShortTransfer,
}

impl From<io::Error> for FsError {
    fn from(value: io::Error) -> Self {
        match value.kind() {
            io::ErrorKind::NotFound => FsError::NoFile,
            io::ErrorKind::PermissionDenied => FsError::Denied,
            io::ErrorKind::UnexpectedEof | io::ErrorKind::WriteZero => FsError::ShortTransfer,
            _ => FsError::DiskErr,
        }
    }
}

/// How to open a file
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum OpenMode {
    /// Create the file, truncating it if it exists
    CreateWrite,

    /// Write to an existing file without truncating it
    Write,

    Read,
}

/// An open file on a [Storage]
pub trait StorageFile: Sized {
    /// Read into `buf`, returning how many bytes were read (fewer only at the end of the file)
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, FsError>;

    /// Write `buf`, returning how many bytes were written
    fn write(&mut self, buf: &[u8]) -> Result<usize, FsError>;

    /// Move to an absolute offset
    fn seek(&mut self, offset: u64) -> Result<(), FsError>;

    /// Make everything written so far durable
    fn sync(&mut self) -> Result<(), FsError>;

    fn close(self) -> Result<(), FsError>;
}

/// A filesystem on a block device that may need to be brought back up after a fault
pub trait Storage {
    type File: StorageFile;

    /// Reinitialize the underlying block device
    fn reinit(&mut self) -> Result<(), FsError>;

    /// (Re)mount the filesystem
    fn mount(&mut self) -> Result<(), FsError>;

    fn open(&mut self, path: &Path, mode: OpenMode) -> Result<Self::File, FsError>;
}

/// A [Storage] backed by a directory on the host, standing in for the SD card
#[derive(Debug, Clone)]
pub struct HostStorage {
    root: PathBuf,
    mounted: bool,
}

impl HostStorage {
    /// Use `root` as the root of the filesystem. Nothing is checked until [Storage::mount].
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        HostStorage {
            root: root.into(),
            mounted: false,
        }
    }
}

impl Storage for HostStorage {
    type File = fs::File;

    fn reinit(&mut self) -> Result<(), FsError> {
        self.mounted = false;
        Ok(())
    }

    fn mount(&mut self) -> Result<(), FsError> {
        if !self.root.is_dir() {
            log::error!("{}: not a directory", self.root.display());
            return Err(FsError::NotReady);
        }
        self.mounted = true;
        Ok(())
    }

    fn open(&mut self, path: &Path, mode: OpenMode) -> Result<fs::File, FsError> {
        if !self.mounted {
            return Err(FsError::NotReady);
        }

        let path = self.root.join(path.strip_prefix("/").unwrap_or(path));
        let mut options = fs::OpenOptions::new();
        match mode {
            OpenMode::CreateWrite => options.write(true).create(true).truncate(true),
            OpenMode::Write => options.write(true),
            OpenMode::Read => options.read(true),
        };
        Ok(options.open(path)?)
    }
}

impl StorageFile for fs::File {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, FsError> {
        Ok(self.read_full(buf)?)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize, FsError> {
        Ok(self.write_full(buf)?)
    }

    fn seek(&mut self, offset: u64) -> Result<(), FsError> {
        Seek::seek(self, SeekFrom::Start(offset))?;
        Ok(())
    }

    fn sync(&mut self) -> Result<(), FsError> {
        Ok(self.sync_all()?)
    }

    fn close(self) -> Result<(), FsError> {
        self.sync_all()?;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct MemFs {
    files: HashMap<PathBuf, Vec<u8>>,
    mounted: bool,

    /// Bumped on every reinit; handles from an older generation are dead
    generation: u64,

    /// A fault has happened and the device must be reinitialized
    faulted: bool,

    failing_writes: usize,
    failing_reads: usize,

    /// Writes left to succeed before one is torn
    writes_before_fault: Option<usize>,
    reinits: usize,
}

impl MemFs {
    fn check(&self, generation: u64) -> Result<(), FsError> {
        if self.faulted || !self.mounted {
            Err(FsError::NotReady)
        } else if generation != self.generation {
            Err(FsError::InvalidObject)
        } else {
            Ok(())
        }
    }
}

/// An in-memory [Storage] that can be told to fail, for testing purposes.
///
/// Clones share the same filesystem. An injected fault leaves the filesystem unusable (every
/// operation fails with [FsError::NotReady]) until it is reinitialized and remounted, and files
/// opened before the reinit stay unusable afterwards.
#[derive(Debug, Clone)]
pub struct MemStorage {
    fs: Arc<Mutex<MemFs>>,
}

impl Default for MemStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MemStorage {
    /// An empty, mounted filesystem
    pub fn new() -> Self {
        let fs = MemFs {
            mounted: true,
            ..Default::default()
        };
        MemStorage {
            fs: Arc::new(Mutex::new(fs)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemFs> {
        self.fs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The next `count` writes only transfer half of their data, then fault the device
    pub fn fail_writes(&self, count: usize) {
        self.lock().failing_writes = count;
    }

    /// Let `count` writes go through, then tear the one after
    pub fn fail_write_after(&self, count: usize) {
        self.lock().writes_before_fault = Some(count);
    }

    /// The next `count` reads fail with a disk error and fault the device
    pub fn fail_reads(&self, count: usize) {
        self.lock().failing_reads = count;
    }

    /// How many times the device has been reinitialized
    pub fn reinits(&self) -> usize {
        self.lock().reinits
    }

    pub fn file(&self, path: impl AsRef<Path>) -> Option<Vec<u8>> {
        self.lock().files.get(path.as_ref()).cloned()
    }

    pub fn insert(&self, path: impl Into<PathBuf>, contents: Vec<u8>) {
        self.lock().files.insert(path.into(), contents);
    }
}

impl Storage for MemStorage {
    type File = MemFile;

    fn reinit(&mut self) -> Result<(), FsError> {
        let mut fs = self.lock();
        fs.reinits += 1;
        fs.generation += 1;
        fs.faulted = false;
        fs.mounted = false;
        Ok(())
    }

    fn mount(&mut self) -> Result<(), FsError> {
        let mut fs = self.lock();
        if fs.faulted {
            return Err(FsError::NotReady);
        }
        fs.mounted = true;
        Ok(())
    }

    fn open(&mut self, path: &Path, mode: OpenMode) -> Result<MemFile, FsError> {
        let mut fs = self.lock();
        let generation = fs.generation;
        fs.check(generation)?;

        match mode {
            OpenMode::CreateWrite => {
                fs.files.insert(path.to_owned(), Vec::new());
            }
            OpenMode::Write | OpenMode::Read => {
                if !fs.files.contains_key(path) {
                    return Err(FsError::NoFile);
                }
            }
        }

        Ok(MemFile {
            fs: self.fs.clone(),
            path: path.to_owned(),
            generation,
            pos: 0,
            writable: mode != OpenMode::Read,
        })
    }
}

/// A file on a [MemStorage]
#[derive(Debug)]
pub struct MemFile {
    fs: Arc<Mutex<MemFs>>,
    path: PathBuf,
    generation: u64,
    pos: usize,
    writable: bool,
}

impl MemFile {
    fn lock(&self) -> MutexGuard<'_, MemFs> {
        self.fs.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl StorageFile for MemFile {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, FsError> {
        let mut fs = self.lock();
        fs.check(self.generation)?;
        if fs.failing_reads > 0 {
            fs.failing_reads -= 1;
            fs.faulted = true;
            return Err(FsError::DiskErr);
        }

        let contents = fs.files.get(&self.path).ok_or(FsError::NoFile)?;
        let available = contents.len().saturating_sub(self.pos);
        let len = buf.len().min(available);
        buf[..len].copy_from_slice(&contents[self.pos..self.pos + len]);
        drop(fs);

        self.pos += len;
        Ok(len)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize, FsError> {
        if !self.writable {
            return Err(FsError::Denied);
        }

        let mut fs = self.lock();
        fs.check(self.generation)?;
        let torn = match fs.writes_before_fault {
            Some(0) => {
                fs.writes_before_fault = None;
                true
            }
            Some(left) => {
                fs.writes_before_fault = Some(left - 1);
                fs.failing_writes > 0
            }
            None => fs.failing_writes > 0,
        };
        let len = if torn {
            fs.failing_writes = fs.failing_writes.saturating_sub(1);
            fs.faulted = true;
            buf.len() / 2
        } else {
            buf.len()
        };

        let pos = self.pos;
        let contents = fs.files.get_mut(&self.path).ok_or(FsError::NoFile)?;
        if contents.len() < pos + len {
            contents.resize(pos + len, 0);
        }
        contents[pos..pos + len].copy_from_slice(&buf[..len]);
        drop(fs);

        self.pos += len;
        Ok(len)
    }

    fn seek(&mut self, offset: u64) -> Result<(), FsError> {
        self.lock().check(self.generation)?;
        self.pos = usize::try_from(offset).map_err(|_| FsError::InvalidObject)?;
        Ok(())
    }

    fn sync(&mut self) -> Result<(), FsError> {
        self.lock().check(self.generation)
    }

    fn close(self) -> Result<(), FsError> {
        self.lock().check(self.generation)
    }
}

/// How persistently to retry failed storage operations
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub struct RetryPolicy {
    /// Pause between attempts
    pub delay: Duration,

    /// Give up after this many retries; `None` retries forever
    pub max_retries: Option<usize>,
}

impl RetryPolicy {
    pub fn bounded(max_retries: usize) -> Self {
        RetryPolicy {
            max_retries: Some(max_retries),
            ..Default::default()
        }
    }

    fn delays(&self) -> Box<dyn Iterator<Item = Duration>> {
        let fixed = Fixed::from_millis(self.delay.as_millis() as u64);
        match self.max_retries {
            Some(max) => Box::new(fixed.take(max)),
            None => Box::new(fixed),
        }
    }
}

/// A file that survives storage faults.
///
/// Every operation that fails reinitializes the storage, remounts it, reopens the file, seeks
/// back to where the operation should (re)start, and tries again.
pub struct ResilientFile<'a, S: Storage> {
    storage: &'a mut S,
    path: PathBuf,
    mode: OpenMode,
    policy: RetryPolicy,
    file: Option<S::File>,
    pos: u64,
}

impl<'a, S: Storage> ResilientFile<'a, S> {
    /// Open `path`, retrying like any other operation. A missing file is reported immediately.
    pub fn open(
        storage: &'a mut S,
        path: &Path,
        mode: OpenMode,
        policy: RetryPolicy,
    ) -> Result<Self> {
        let file = retry::retry(policy.delays(), || match storage.open(path, mode) {
            Ok(file) => OperationResult::Ok(file),
            Err(FsError::NoFile) => OperationResult::Err(FsError::NoFile),
            Err(e) => {
                log::warn!("{}: open failed ({e}), retrying", path.display());
                if let Err(e) = storage.reinit().and_then(|_| storage.mount()) {
                    log::warn!("storage recovery failed: {e}");
                }
                OperationResult::Retry(e)
            }
        })
        .map_err(|e| match e.error {
            FsError::NoFile => Error::Storage(FsError::NoFile),
            error => Error::RetriesExhausted {
                tries: e.tries,
                source: error,
            },
        })?;

        Ok(ResilientFile {
            storage,
            path: path.to_owned(),
            // Reopens must never truncate what has been written already
            mode: match mode {
                OpenMode::CreateWrite => OpenMode::Write,
                other => other,
            },
            policy,
            file: Some(file),
            pos: 0,
        })
    }

    /// The offset at which the next transfer happens
    pub fn position(&self) -> u64 {
        self.pos
    }

    /// Write all of `buf` and sync it
    pub fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        self.attempt(self.pos, |file| {
            if file.write(buf)? != buf.len() {
                return Err(FsError::ShortTransfer);
            }
            file.sync()?;
            Ok(buf.len() as u64)
        })
    }

    /// Fill `buf` entirely
    pub fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        self.attempt(self.pos, |file| {
            if file.read(buf)? != buf.len() {
                return Err(FsError::ShortTransfer);
            }
            Ok(buf.len() as u64)
        })
    }

    pub fn seek(&mut self, offset: u64) -> Result<()> {
        self.attempt(offset, |_| Ok(0))
    }

    /// Run `op` against the file positioned at `restart_at`, recovering and retrying per the
    /// policy until it succeeds.
    ///
    /// `op` returns how many bytes it moved the file position by, so that later operations know
    /// where to restart. It may be run any number of times, and must redo all of its work each
    /// time.
    pub fn attempt(
        &mut self,
        restart_at: u64,
        mut op: impl FnMut(&mut S::File) -> Result<u64, FsError>,
    ) -> Result<()> {
        let delays = self.policy.delays();
        let result = retry::retry_with_index(delays, |index| {
            let result = self.prepare(restart_at).and_then(&mut op);
            match result {
                Ok(moved) => OperationResult::Ok(moved),
                Err(e) => {
                    log::warn!(
                        "{}: storage error at offset {restart_at} ({e}), attempt {index}",
                        self.path.display()
                    );
                    self.file = None;
                    OperationResult::Retry(e)
                }
            }
        });

        match result {
            Ok(moved) => {
                self.pos = restart_at + moved;
                Ok(())
            }
            Err(e) => Err(Error::RetriesExhausted {
                tries: e.tries,
                source: e.error,
            }),
        }
    }

    /// Get the file positioned at `offset`, bringing the storage back up first if the last
    /// operation failed
    fn prepare(&mut self, offset: u64) -> Result<&mut S::File, FsError> {
        let file = match &mut self.file {
            Some(file) => file,
            slot @ None => {
                self.storage.reinit()?;
                self.storage.mount()?;
                slot.insert(self.storage.open(&self.path, self.mode)?)
            }
        };
        file.seek(offset)?;
        Ok(file)
    }

    /// Sync and close the file
    pub fn close(mut self) -> Result<()> {
        self.attempt(self.pos, |file| file.sync().map(|_| 0))?;
        if let Some(file) = self.file.take() {
            file.close()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_resilient_write_recovers() -> anyhow::Result<()> {
        let mut storage = MemStorage::new();
        let handle = storage.clone();
        let path = Path::new("/image.bin");

        let mut file =
            ResilientFile::open(&mut storage, path, OpenMode::CreateWrite, Default::default())?;
        file.write_all(&[1; 100])?;

        handle.fail_writes(2);
        file.write_all(&[2; 100])?;
        file.close()?;

        assert_eq!(handle.reinits(), 2);
        let contents = handle.file(path).unwrap();
        assert_eq!(contents.len(), 200);
        assert!(contents[..100].iter().all(|&x| x == 1));
        assert!(contents[100..].iter().all(|&x| x == 2));
        Ok(())
    }

    #[test]
    fn test_delayed_write_fault() -> anyhow::Result<()> {
        let mut storage = MemStorage::new();
        let mut file = storage.open(Path::new("/a"), OpenMode::CreateWrite)?;
        storage.fail_write_after(1);

        assert_eq!(file.write(&[1; 8]), Ok(8));
        assert_eq!(file.write(&[2; 8]), Ok(4));
        assert_eq!(file.write(&[3; 8]), Err(FsError::NotReady));

        storage.reinit()?;
        storage.mount()?;
        let mut file = storage.open(Path::new("/a"), OpenMode::Write)?;
        assert_eq!(file.write(&[4; 8]), Ok(8));
        Ok(())
    }

    #[test]
    fn test_resilient_read_recovers() -> anyhow::Result<()> {
        let mut storage = MemStorage::new();
        let handle = storage.clone();
        let path = Path::new("/image.bin");
        handle.insert(path, (0..=255).collect());

        let mut file = ResilientFile::open(&mut storage, path, OpenMode::Read, Default::default())?;
        file.seek(16)?;
        handle.fail_reads(3);
        let mut buf = [0u8; 4];
        file.read_exact(&mut buf)?;
        assert_eq!(buf, [16, 17, 18, 19]);
        assert_eq!(file.position(), 20);
        assert_eq!(handle.reinits(), 3);

        // Running off the end is a failure too
        let mut storage = handle.clone();
        let mut file =
            ResilientFile::open(&mut storage, path, OpenMode::Read, RetryPolicy::bounded(1))?;
        file.seek(250)?;
        assert_eq!(
            file.read_exact(&mut [0u8; 16]),
            Err(Error::RetriesExhausted {
                tries: 2,
                source: FsError::ShortTransfer
            })
        );
        Ok(())
    }

    #[test]
    fn test_bounded_policy_gives_up() -> anyhow::Result<()> {
        let mut storage = MemStorage::new();
        let handle = storage.clone();
        let path = Path::new("/image.bin");

        let mut file = ResilientFile::open(
            &mut storage,
            path,
            OpenMode::CreateWrite,
            RetryPolicy::bounded(2),
        )?;
        handle.fail_writes(10);
        assert_eq!(
            file.write_all(&[0; 64]),
            Err(Error::RetriesExhausted {
                tries: 3,
                source: FsError::ShortTransfer
            })
        );
        Ok(())
    }

    #[test]
    fn test_missing_file() {
        let mut storage = MemStorage::new();
        assert_eq!(
            ResilientFile::open(
                &mut storage,
                Path::new("/nope"),
                OpenMode::Read,
                Default::default()
            )
            .err(),
            Some(Error::Storage(FsError::NoFile))
        );
    }

    #[test]
    fn test_host_storage() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut storage = HostStorage::new(dir.path());
        assert_eq!(
            storage.open(Path::new("x"), OpenMode::Read).err(),
            Some(FsError::NotReady)
        );

        storage.mount()?;
        let mut file = storage.open(Path::new("/x.bin"), OpenMode::CreateWrite)?;
        assert_eq!(StorageFile::write(&mut file, b"hello")?, 5);
        file.close()?;

        let mut file = storage.open(Path::new("x.bin"), OpenMode::Read)?;
        let mut buf = [0u8; 8];
        assert_eq!(StorageFile::read(&mut file, &mut buf)?, 5);
        assert_eq!(&buf[..5], b"hello");
        Ok(())
    }
}
