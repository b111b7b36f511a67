//! Block-aligned file storage for the transfer pipeline.
//!
//! All file I/O is positional and goes through `spawn_blocking`. Buffers are
//! moved into the blocking task and handed back when it completes, so a block
//! is never aliased by two in-flight operations.

use crate::error::{Result, StorageOp, TransferError};
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempPath;

/// Upper bound on buffer alignment. Block sizes above this only need page
/// alignment for unbuffered I/O.
pub const MAX_ALIGNMENT: usize = 4096;

/// Suffix of in-progress destination files.
pub const TEMP_SUFFIX: &str = ".ferry.tmp";

/// Options applied when opening files.
#[derive(Debug, Clone, Copy, Default)]
pub struct StorageOptions {
    /// Bypass the page cache (`O_DIRECT`). Linux only; ignored elsewhere.
    pub direct_io: bool,
}

// =============================================================================
// AlignedBlock
// =============================================================================

/// Fixed-capacity byte buffer whose start is aligned to its block size
/// (capped at [`MAX_ALIGNMENT`]).
///
/// `len` tracks how many leading bytes hold real data; the rest is padding.
#[derive(Default)]
pub struct AlignedBlock {
    storage: Vec<u8>,
    start: usize,
    capacity: usize,
    len: usize,
}

impl AlignedBlock {
    pub fn new(capacity: usize) -> Self {
        let align = capacity.clamp(1, MAX_ALIGNMENT).next_power_of_two();
        let storage = vec![0u8; capacity + align];
        // The heap allocation does not move with the Vec, so this stays valid.
        let start = storage.as_ptr().align_offset(align);
        Self {
            storage,
            start,
            capacity,
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len == self.capacity
    }

    /// The bytes holding real data.
    pub fn filled(&self) -> &[u8] {
        &self.block()[..self.len]
    }

    /// The whole block, padding included.
    pub fn block(&self) -> &[u8] {
        &self.storage[self.start..self.start + self.capacity]
    }

    pub fn block_mut(&mut self) -> &mut [u8] {
        &mut self.storage[self.start..self.start + self.capacity]
    }

    pub fn set_len(&mut self, len: usize) {
        assert!(len <= self.capacity, "len {len} exceeds block capacity");
        self.len = len;
    }

    /// Copy `data` into the block and zero the padding after it.
    pub fn fill_from(&mut self, data: &[u8]) {
        let block = self.block_mut();
        block[..data.len()].copy_from_slice(data);
        block[data.len()..].fill(0);
        self.len = data.len();
    }

    pub(crate) fn as_ptr(&self) -> *const u8 {
        self.block().as_ptr()
    }
}

impl std::fmt::Debug for AlignedBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlignedBlock")
            .field("capacity", &self.capacity)
            .field("len", &self.len)
            .finish()
    }
}

// =============================================================================
// Positional I/O
// =============================================================================

/// Positional access to an open file. Implemented for [`File`].
pub(crate) trait PositionalIo: Send + Sync + 'static {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize>;
    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize>;
    fn size(&self) -> io::Result<u64>;
    fn set_len(&self, len: u64) -> io::Result<()>;
    fn sync_all(&self) -> io::Result<()>;
}

impl PositionalIo for File {
    #[cfg(unix)]
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        std::os::unix::fs::FileExt::read_at(self, buf, offset)
    }

    #[cfg(unix)]
    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize> {
        std::os::unix::fs::FileExt::write_at(self, buf, offset)
    }

    #[cfg(windows)]
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        std::os::windows::fs::FileExt::seek_read(self, buf, offset)
    }

    #[cfg(windows)]
    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize> {
        std::os::windows::fs::FileExt::seek_write(self, buf, offset)
    }

    fn size(&self) -> io::Result<u64> {
        self.metadata().map(|m| m.len())
    }

    fn set_len(&self, len: u64) -> io::Result<()> {
        File::set_len(self, len)
    }

    fn sync_all(&self) -> io::Result<()> {
        File::sync_all(self)
    }
}

/// A write must land the whole block; anything less is fatal.
fn check_full_write(offset: u64, written: usize, expected: usize) -> Result<()> {
    if written != expected {
        return Err(TransferError::ShortWrite {
            offset,
            written,
            expected,
        });
    }
    Ok(())
}

fn apply_options(options: &mut OpenOptions, storage: StorageOptions) {
    #[cfg(target_os = "linux")]
    if storage.direct_io {
        use std::os::unix::fs::OpenOptionsExt;
        options.custom_flags(libc::O_DIRECT);
    }
    #[cfg(not(target_os = "linux"))]
    if storage.direct_io {
        tracing::debug!("direct I/O requested but unsupported on this platform");
    }
}

async fn blocking<T, F>(op: StorageOp, path: &Path, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f).await.map_err(|e| {
        TransferError::storage(op, path, io::Error::new(io::ErrorKind::Other, e))
    })?
}

// =============================================================================
// BlockFile
// =============================================================================

/// A file read or written one aligned block at a time.
#[derive(Clone)]
pub struct BlockFile {
    io: Arc<dyn PositionalIo>,
    path: PathBuf,
    direct: bool,
}

impl std::fmt::Debug for BlockFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockFile")
            .field("path", &self.path)
            .field("direct", &self.direct)
            .finish()
    }
}

impl BlockFile {
    pub(crate) fn from_io(io: impl PositionalIo, path: &Path, direct: bool) -> Self {
        Self {
            io: Arc::new(io),
            path: path.to_path_buf(),
            direct,
        }
    }

    /// Open an existing file for reading.
    pub async fn open(path: &Path, storage: StorageOptions) -> Result<Self> {
        let owned = path.to_path_buf();
        let file = blocking(StorageOp::Open, path, move || {
            let mut options = OpenOptions::new();
            options.read(true);
            apply_options(&mut options, storage);
            options
                .open(&owned)
                .map_err(|e| TransferError::storage(StorageOp::Open, &owned, e))
        })
        .await?;

        Ok(Self::from_io(file, path, storage.direct_io))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn size(&self) -> Result<u64> {
        let io = Arc::clone(&self.io);
        let path = self.path.clone();
        blocking(StorageOp::Read, &self.path, move || {
            io.size()
                .map_err(|e| TransferError::storage(StorageOp::Read, &path, e))
        })
        .await
    }

    /// Read up to one block at `offset`. The returned block's `len` is the
    /// number of bytes read; zero means end of file.
    pub async fn read_block(&self, offset: u64, mut block: AlignedBlock) -> Result<AlignedBlock> {
        let io = Arc::clone(&self.io);
        let path = self.path.clone();
        let direct = self.direct;
        blocking(StorageOp::Read, &self.path, move || {
            let capacity = block.capacity();
            let mut filled = 0;
            while filled < capacity {
                let want = capacity - filled;
                let at = offset + filled as u64;
                let n = match io.read_at(&mut block.block_mut()[filled..], at) {
                    Ok(n) => n,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(TransferError::storage(StorageOp::Read, &path, e)),
                };
                filled += n;
                // Unbuffered reads must stay aligned; a short one means EOF.
                if n == 0 || (direct && n < want) {
                    break;
                }
            }
            block.set_len(filled);
            Ok(block)
        })
        .await
    }

    /// Persist `block` at `offset`.
    ///
    /// The whole block (padding included) is written so unbuffered I/O stays
    /// aligned; [`BlockFile::finish`] trims the padding. A write that lands
    /// fewer bytes than requested is a fatal [`TransferError::ShortWrite`].
    pub async fn write_block(&self, offset: u64, block: AlignedBlock) -> Result<AlignedBlock> {
        if block.is_empty() {
            return Ok(block);
        }
        let io = Arc::clone(&self.io);
        let path = self.path.clone();
        blocking(StorageOp::Write, &self.path, move || {
            let written = io
                .write_at(block.block(), offset)
                .map_err(|e| TransferError::storage(StorageOp::Write, &path, e))?;
            check_full_write(offset, written, block.capacity())?;
            Ok(block)
        })
        .await
    }

    /// Truncate to the exact byte count and flush to stable storage.
    pub async fn finish(&self, len: u64) -> Result<()> {
        let io = Arc::clone(&self.io);
        let path = self.path.clone();
        blocking(StorageOp::Truncate, &self.path, move || {
            io.set_len(len)
                .map_err(|e| TransferError::storage(StorageOp::Truncate, &path, e))?;
            io.sync_all()
                .map_err(|e| TransferError::storage(StorageOp::Sync, &path, e))
        })
        .await
    }
}

// =============================================================================
// Staged destination
// =============================================================================

/// A destination written under a temporary name and renamed into place on
/// success. Dropping it without [`StagedFile::commit`] removes the temp file.
#[derive(Debug)]
pub struct StagedFile {
    temp: TempPath,
    dest: PathBuf,
}

impl StagedFile {
    /// Create a temp file next to `dest` and open it for block writes.
    pub async fn create(dest: &Path, storage: StorageOptions) -> Result<(BlockFile, Self)> {
        let dir = dest
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let name = dest
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let dest_owned = dest.to_path_buf();

        let (file, temp) = blocking(StorageOp::Create, dest, move || {
            let named = tempfile::Builder::new()
                .prefix(&format!(".{name}."))
                .suffix(TEMP_SUFFIX)
                .tempfile_in(&dir)
                .map_err(|e| TransferError::storage(StorageOp::Create, &dest_owned, e))?;
            let (file, temp) = named.into_parts();

            if !storage.direct_io {
                return Ok((file, temp));
            }
            drop(file);
            let mut options = OpenOptions::new();
            options.write(true);
            apply_options(&mut options, storage);
            let file = options
                .open(&temp)
                .map_err(|e| TransferError::storage(StorageOp::Create, &*temp, e))?;
            Ok((file, temp))
        })
        .await?;

        let block_file = BlockFile::from_io(file, &temp, storage.direct_io);
        Ok((
            block_file,
            Self {
                temp,
                dest: dest.to_path_buf(),
            },
        ))
    }

    pub fn temp_path(&self) -> &Path {
        &self.temp
    }

    /// Move the temp file over the destination.
    pub async fn commit(self) -> Result<()> {
        let Self { temp, dest } = self;
        let dest_for_err = dest.clone();
        blocking(StorageOp::Rename, &dest_for_err, move || {
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let perms = std::fs::Permissions::from_mode(0o644);
                if let Err(e) = std::fs::set_permissions(&temp, perms) {
                    tracing::warn!("Failed to set permissions on {}: {}", temp.display(), e);
                }
            }
            temp.persist(&dest)
                .map_err(|e| TransferError::storage(StorageOp::Rename, &dest, e.error))
        })
        .await
    }
}

// =============================================================================
// Tests
// =============================================================================
