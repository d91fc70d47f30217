use alloc::string::String;
use flint_core::storage::DeviceError;
use thiserror::Error;

pub mod fat;

#[derive(Debug, Error, Clone, Copy, Eq, PartialEq)]
pub enum FsError {
    /// Device-level failure, kind preserved from the layer below.
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error("file not found")]
    NotFound,
    #[error("not a directory")]
    NotADirectory,
    #[error("is a directory")]
    IsADirectory,
    #[error("invalid path")]
    InvalidPath,
    #[error("file already exists")]
    AlreadyExists,
    #[error("directory not empty")]
    DirectoryNotEmpty,
    #[error("file system is full")]
    Full,
    #[error("unexpected end of file")]
    UnexpectedEof,
    #[error("file system is corrupted")]
    Corrupted,
    #[error("no file system found")]
    NoFilesystem,
    #[error("file system is read-only")]
    ReadOnly,
    #[error("unsupported operation")]
    Unsupported,
}

pub type FsResult<T> = Result<T, FsError>;

/// A trait representing a file system interface.
///
/// This trait defines the operations a mounted volume must support,
/// allowing the VFS layer to interact uniformly with different engines.
/// Paths are absolute within the volume, already stripped of the mount
/// prefix and resolved against the working directory.
///
/// # Notes
///
/// Handle bookkeeping (open modes, cursors) lives in the VFS layer; engine
/// calls are stateless and addressed by path and offset.
pub trait FileSystem {
    /// Creates a new empty file at the given path.
    fn create(&mut self, path: Path) -> FsResult<()>;
    /// Removes the file at the given path. Directories are rejected with
    /// [`FsError::IsADirectory`].
    fn remove(&mut self, path: Path) -> FsResult<()>;
    /// Checks whether an entry exists at the given path.
    fn exists(&mut self, path: Path) -> FsResult<bool>;
    /// Creates a new empty directory at the given path.
    fn mkdir(&mut self, path: Path) -> FsResult<()>;
    /// Removes the directory at the given path if it is empty.
    fn rmdir(&mut self, path: Path) -> FsResult<()>;
    /// Moves an entry to a new path within the volume.
    ///
    /// This is a metadata operation, file contents are not copied. If the
    /// destination exists it is replaced only when `overwrite` is set,
    /// otherwise the call fails with [`FsError::AlreadyExists`].
    fn rename(&mut self, from: Path, to: Path, overwrite: bool) -> FsResult<()>;
    /// Returns information about the entry at the given path.
    fn metadata(&mut self, path: Path) -> FsResult<Metadata>;
    /// Returns the `index`-th entry of the directory at the given path, or
    /// `None` past the end.
    ///
    /// Indexing is stable while the directory is unmodified, which lets
    /// callers iterate lazily and restart at any position.
    fn read_dir(&mut self, path: Path, index: usize) -> FsResult<Option<DirEntryInfo>>;
    /// Reads from the file at the given byte offset into the buffer.
    ///
    /// This returns how many bytes were read.
    fn read(&mut self, path: Path, buffer: &mut [u8], offset: usize) -> FsResult<usize>;
    /// Writes the buffer to the file at the given byte offset, extending
    /// the file as needed.
    ///
    /// This returns how many bytes were written.
    fn write(&mut self, path: Path, buffer: &[u8], offset: usize) -> FsResult<usize>;
    /// Truncates or extends the file to exactly `size` bytes.
    fn truncate(&mut self, path: Path, size: usize) -> FsResult<()>;
    /// Returns allocation statistics for the volume.
    fn volume_stats(&mut self) -> FsResult<VolumeStats>;
    /// Flushes any cached state to the underlying device.
    fn sync(&mut self) -> FsResult<()>;
}

#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PathBuf(String);

#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd)]
pub struct Path<'a>(&'a str);

impl PathBuf {
    #[must_use]
    #[inline]
    /// Creates a new `PathBuf` from the given string.
    pub fn new(path: &str) -> Self {
        Self(String::from(path))
    }

    #[must_use]
    #[inline]
    pub fn as_path(&self) -> Path<'_> {
        Path(&self.0)
    }

    /// Appends a component, inserting a separator when needed.
    pub fn push(&mut self, component: &str) {
        if !self.0.ends_with('/') {
            self.0.push('/');
        }
        self.0.push_str(component.trim_start_matches('/'));
    }

    #[must_use]
    pub fn join(&self, component: &str) -> Self {
        let mut new_path = self.clone();
        new_path.push(component);
        new_path
    }

    /// Resolves `path` against `base`, yielding a normalized absolute path.
    ///
    /// Absolute `path`s ignore `base`. `.` components are dropped and `..`
    /// pops the previous component without escaping the root.
    #[must_use]
    pub fn resolved(base: Path, path: Path) -> Self {
        let mut parts: alloc::vec::Vec<&str> = if path.is_absolute() {
            alloc::vec::Vec::new()
        } else {
            base.components().collect()
        };
        for component in path.components() {
            if component == ".." {
                parts.pop();
            } else {
                parts.push(component);
            }
        }
        let mut out = String::from("/");
        for (i, part) in parts.iter().enumerate() {
            if i > 0 {
                out.push('/');
            }
            out.push_str(part);
        }
        Self(out)
    }
}

impl core::borrow::Borrow<str> for PathBuf {
    #[inline]
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl<'a> Path<'a> {
    #[must_use]
    #[inline]
    /// Creates a new `Path` from the given string slice.
    pub const fn new(path: &'a str) -> Self {
        Self(path)
    }

    /// Iterates over the path components, skipping separators and `.`.
    pub fn components(self) -> impl Iterator<Item = &'a str> {
        self.0.split('/').filter(|c| !c.is_empty() && *c != ".")
    }

    /// Splits into the parent path and the final component.
    ///
    /// Returns `None` for the root path.
    #[must_use]
    pub fn split_last(self) -> Option<(Path<'a>, &'a str)> {
        let trimmed = self.0.trim_end_matches('/');
        if trimmed.is_empty() {
            return None;
        }
        match trimmed.rfind('/') {
            Some(0) => Some((Path(&trimmed[..1]), &trimmed[1..])),
            Some(pos) => Some((Path(&trimmed[..pos]), &trimmed[pos + 1..])),
            None => Some((Path("/"), trimmed)),
        }
    }

    #[must_use]
    #[inline]
    pub fn is_absolute(self) -> bool {
        self.0.starts_with('/')
    }

    #[must_use]
    pub fn is_root(self) -> bool {
        self.components().next().is_none()
    }

    /// Returns the underlying string slice.
    ///
    /// The slice borrows from the path's source, not from the `Path`
    /// value itself, so it stays usable after the `Path` is gone.
    #[must_use]
    #[inline]
    pub const fn as_str(self) -> &'a str {
        self.0
    }
}

impl Path<'_> {
    #[must_use]
    #[inline]
    /// Allocates a new `PathBuf` from the current path.
    pub fn to_owned(&self) -> PathBuf {
        PathBuf::new(self.0)
    }
}

impl<'a> From<&'a str> for Path<'a> {
    #[inline]
    fn from(value: &'a str) -> Self {
        Self(value)
    }
}

impl core::ops::Deref for Path<'_> {
    type Target = str;

    #[inline]
    fn deref(&self) -> &Self::Target {
        self.0
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum FileType {
    File,
    Directory,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Metadata {
    size: usize,
    file_type: FileType,
    read_only: bool,
    /// Timestamps in seconds since the unix epoch.
    accessed: u64,
    modified: u64,
    created: u64,
}

impl Metadata {
    #[must_use]
    #[inline]
    pub const fn new(
        size: usize,
        file_type: FileType,
        read_only: bool,
        accessed: u64,
        modified: u64,
        created: u64,
    ) -> Self {
        Self {
            size,
            file_type,
            read_only,
            accessed,
            modified,
            created,
        }
    }

    #[must_use]
    #[inline]
    pub const fn size(&self) -> usize {
        self.size
    }

    #[must_use]
    #[inline]
    pub const fn file_type(&self) -> FileType {
        self.file_type
    }

    #[must_use]
    #[inline]
    pub const fn is_dir(&self) -> bool {
        matches!(self.file_type, FileType::Directory)
    }

    #[must_use]
    #[inline]
    pub const fn read_only(&self) -> bool {
        self.read_only
    }

    #[must_use]
    #[inline]
    pub const fn accessed(&self) -> u64 {
        self.accessed
    }

    #[must_use]
    #[inline]
    pub const fn modified(&self) -> u64 {
        self.modified
    }

    #[must_use]
    #[inline]
    pub const fn created(&self) -> u64 {
        self.created
    }
}

/// One directory listing entry.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct DirEntryInfo {
    name: String,
    file_type: FileType,
    size: usize,
}

impl DirEntryInfo {
    #[must_use]
    #[inline]
    pub const fn new(name: String, file_type: FileType, size: usize) -> Self {
        Self {
            name,
            file_type,
            size,
        }
    }

    #[must_use]
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    #[inline]
    pub const fn file_type(&self) -> FileType {
        self.file_type
    }

    #[must_use]
    #[inline]
    pub const fn size(&self) -> usize {
        self.size
    }
}

/// Allocation statistics reported by a volume.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct VolumeStats {
    block_size: usize,
    total_blocks: usize,
    free_blocks: usize,
    max_name_len: usize,
}

impl VolumeStats {
    #[must_use]
    #[inline]
    pub const fn new(
        block_size: usize,
        total_blocks: usize,
        free_blocks: usize,
        max_name_len: usize,
    ) -> Self {
        Self {
            block_size,
            total_blocks,
            free_blocks,
            max_name_len,
        }
    }

    #[must_use]
    #[inline]
    pub const fn block_size(&self) -> usize {
        self.block_size
    }

    #[must_use]
    #[inline]
    pub const fn total_blocks(&self) -> usize {
        self.total_blocks
    }

    #[must_use]
    #[inline]
    pub const fn free_blocks(&self) -> usize {
        self.free_blocks
    }

    #[must_use]
    #[inline]
    pub const fn free_bytes(&self) -> usize {
        self.free_blocks * self.block_size
    }

    #[must_use]
    #[inline]
    pub const fn max_name_len(&self) -> usize {
        self.max_name_len
    }
}
