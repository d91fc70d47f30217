//! VFS dispatch and mount registry.
//!
//! [`Vfs`] is the host-facing front of the storage stack. It owns the mount
//! table, the open-handle table and the process-wide working directory,
//! routes every path operation to the mounted [`FileSystem`] whose mount
//! path is the longest prefix of the target, and translates each failure
//! into a [`VfsError`] carrying a stable errno-style [`code`](VfsError::code).
//!
//! Volumes are serialized behind per-mount locks; engine calls need
//! exclusive device access, so even lookups take the volume's write lock.
//! The registry, handle table and working directory sit behind their own
//! locks and serve concurrent readers. Crash consistency is the business of
//! the layers below, the dispatcher never reorders anything.

use alloc::{boxed::Box, string::String, vec::Vec};
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

use hashbrown::HashMap;
use spin::RwLock;
use thiserror::Error;

use flint_core::storage::{BlockDevice, DeviceError};

use crate::fs::fat::FatFs;
use crate::fs::fat::date::EPOCH_2000;
use crate::fs::{
    DirEntryInfo, FileSystem, FileType, FsError, FsResult, Metadata, Path, PathBuf,
};

/// Directory flag in [`Stat::mode`] and [`DirEntry::entry_type`].
pub const MODE_DIRECTORY: u32 = 0x4000;
/// Regular-file flag in [`Stat::mode`] and [`DirEntry::entry_type`].
pub const MODE_FILE: u32 = 0x8000;

/// Failures surfaced at the dispatch boundary.
///
/// Engine and device failures arrive wrapped in [`VfsError::Fs`]; the other
/// variants only exist at this layer.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum VfsError {
    #[error(transparent)]
    Fs(#[from] FsError),
    /// The mount still has open handles.
    #[error("mount point is busy")]
    Busy,
    /// The handle was closed or never issued.
    #[error("invalid file handle")]
    InvalidHandle,
    /// A malformed mode string, a wrong-direction handle operation or a
    /// seek before the start of the file.
    #[error("invalid argument")]
    InvalidArgument,
    /// Rename endpoints live on different mounts.
    #[error("cannot rename across mounts")]
    CrossDevice,
}

pub type VfsResult<T> = Result<T, VfsError>;

impl VfsError {
    /// Stable errno-style code reported to the host binding.
    #[must_use]
    pub const fn code(&self) -> i32 {
        match self {
            Self::Fs(error) => match error {
                FsError::NotFound => 2,                                  // ENOENT
                FsError::Device(DeviceError::Full) | FsError::Full => 28, // ENOSPC
                FsError::Device(_) | FsError::UnexpectedEof | FsError::Corrupted => 5, // EIO
                FsError::AlreadyExists => 17,                            // EEXIST
                FsError::NoFilesystem => 19,                             // ENODEV
                FsError::NotADirectory => 20,                            // ENOTDIR
                FsError::IsADirectory => 21,                             // EISDIR
                FsError::InvalidPath | FsError::Unsupported => 22,       // EINVAL
                FsError::ReadOnly => 30,                                 // EROFS
                FsError::DirectoryNotEmpty => 39,                        // ENOTEMPTY
            },
            Self::InvalidHandle => 9,    // EBADF
            Self::Busy => 16,            // EBUSY
            Self::CrossDevice => 18,     // EXDEV
            Self::InvalidArgument => 22, // EINVAL
        }
    }
}

/// POSIX-shaped `stat` record. Fields the volume does not track are zero.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Stat {
    /// [`MODE_DIRECTORY`] or [`MODE_FILE`].
    pub mode: u32,
    pub inode: u64,
    pub device: u64,
    pub links: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub accessed: u64,
    pub modified: u64,
    pub created: u64,
}

impl Stat {
    /// Entry reported for the root and for mount points, which have no
    /// on-disk record of their own.
    const fn synthetic_root() -> Self {
        Self {
            mode: MODE_DIRECTORY,
            inode: 0,
            device: 0,
            links: 0,
            uid: 0,
            gid: 0,
            size: 0,
            accessed: EPOCH_2000,
            modified: EPOCH_2000,
            created: EPOCH_2000,
        }
    }

    fn from_metadata(meta: &Metadata) -> Self {
        Self {
            mode: if meta.is_dir() { MODE_DIRECTORY } else { MODE_FILE },
            size: u64::try_from(meta.size()).unwrap(),
            accessed: meta.accessed(),
            modified: meta.modified(),
            created: meta.created(),
            ..Self::default()
        }
    }
}

/// POSIX-shaped `statvfs` record.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StatVfs {
    pub block_size: u64,
    pub fragment_size: u64,
    pub blocks: u64,
    pub blocks_free: u64,
    pub blocks_available: u64,
    pub files: u64,
    pub files_free: u64,
    pub files_available: u64,
    pub flags: u64,
    pub name_max: u64,
}

/// One [`Vfs::ilistdir`] entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    /// [`MODE_DIRECTORY`] or [`MODE_FILE`].
    pub entry_type: u32,
    /// Always zero, the volume has no inode numbers.
    pub inode: u64,
    pub size: u64,
}

impl DirEntry {
    fn from_info(info: &DirEntryInfo) -> Self {
        Self {
            name: String::from(info.name()),
            entry_type: match info.file_type() {
                FileType::Directory => MODE_DIRECTORY,
                FileType::File => MODE_FILE,
            },
            inode: 0,
            size: u64::try_from(info.size()).unwrap(),
        }
    }
}

/// Options for [`Vfs::mount`].
#[derive(Debug, Clone, Copy, Default)]
pub struct MountOptions {
    /// Reject every mutating operation on this mount with
    /// [`FsError::ReadOnly`].
    pub read_only: bool,
    /// Format the device and retry once when no filesystem is found.
    pub format_if_unmountable: bool,
}

/// Options for [`Vfs::mkfs`].
#[derive(Debug, Clone, Copy, Default)]
pub struct FormatOptions {
    /// Volume serial number, derived from the geometry when `None`.
    pub volume_id: Option<u32>,
}

/// Parsed open-mode string.
///
/// The base letter is one of `r` (read), `w` (truncate or create), `a`
/// (append, create) and `x` (create new); `+` adds the other direction and
/// `b` is accepted and ignored since all I/O is in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenMode {
    read: bool,
    write: bool,
    append: bool,
    truncate: bool,
    create: bool,
    create_new: bool,
}

impl OpenMode {
    /// Parses a mode string, `None` when it is malformed.
    #[must_use]
    pub fn parse(mode: &str) -> Option<Self> {
        let mut base = None;
        let mut update = false;
        for ch in mode.chars() {
            match ch {
                'r' | 'w' | 'a' | 'x' => {
                    if base.replace(ch).is_some() {
                        return None;
                    }
                }
                '+' => update = true,
                'b' => {}
                _ => return None,
            }
        }
        let (read, write, append, truncate, create, create_new) = match base? {
            'r' => (true, false, false, false, false, false),
            'w' => (false, true, false, true, true, false),
            'a' => (false, true, true, false, true, false),
            'x' => (false, true, false, false, true, true),
            _ => return None,
        };
        Some(Self {
            read: read || update,
            write: write || update,
            append,
            truncate,
            create,
            create_new,
        })
    }

    #[must_use]
    #[inline]
    pub const fn reads(&self) -> bool {
        self.read
    }

    #[must_use]
    #[inline]
    pub const fn writes(&self) -> bool {
        self.write
    }
}

/// Identifier of an open file, unique for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(u64);

static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);

impl Handle {
    fn next() -> Self {
        // 64 bits of monotonically minted ids never wrap in practice.
        Self(NEXT_HANDLE.fetch_add(1, Ordering::Relaxed))
    }

    #[must_use]
    #[inline]
    pub const fn id(&self) -> u64 {
        self.0
    }
}

/// Position reference for [`Vfs::seek`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekFrom {
    Start(u64),
    Current(i64),
    End(i64),
}

type Volume = Box<dyn FileSystem + Send + Sync>;

struct MountEntry {
    volume: RwLock<Volume>,
    read_only: bool,
}

/// Mount table resolving paths by longest matching mount prefix.
#[derive(Default)]
struct MountIndex {
    /// Mount paths sorted by length, longest first.
    ordered: Vec<PathBuf>,
    entries: HashMap<PathBuf, MountEntry>,
}

impl MountIndex {
    /// Finds the mount covering `path`, returning its key and the path
    /// remainder relative to the mount root.
    fn resolve<'p>(&self, path: &'p str) -> Option<(&PathBuf, &'p str)> {
        for mount in &self.ordered {
            let prefix = mount.as_path();
            if let Some(rest) = path.strip_prefix(prefix.as_str()) {
                // Whole components only, "/fla" must not cover "/flash".
                if prefix.is_root() || rest.is_empty() || rest.starts_with('/') {
                    return Some((mount, rest));
                }
            }
        }
        None
    }

    fn insert(&mut self, path: PathBuf, entry: MountEntry) {
        let length = path.as_path().as_str().len();
        let position = self
            .ordered
            .iter()
            .position(|existing| existing.as_path().as_str().len() < length)
            .unwrap_or_else(|| self.ordered.len());
        self.ordered.insert(position, path.clone());
        self.entries.insert(path, entry);
    }

    fn remove(&mut self, path: &str) -> Option<MountEntry> {
        self.ordered.retain(|existing| existing.as_path().as_str() != path);
        self.entries.remove(path)
    }
}

struct OpenFile {
    /// Mount key, checked by `umount` before it tears the volume down.
    mount: PathBuf,
    /// Absolute path, re-resolved on every operation.
    path: PathBuf,
    mode: OpenMode,
    /// Cursor in bytes. Append mode starts it at the end of the file.
    position: usize,
}

/// Host-facing front of the storage stack.
///
/// Paths may be relative, in which case they resolve against the working
/// directory first. All operations take `&self`; see the module notes for
/// the locking rules.
pub struct Vfs {
    mounts: RwLock<MountIndex>,
    handles: RwLock<HashMap<Handle, OpenFile>>,
    cwd: RwLock<PathBuf>,
}

impl Default for Vfs {
    fn default() -> Self {
        Self::new()
    }
}

impl Vfs {
    /// Creates an empty registry with the working directory at `/`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            mounts: RwLock::new(MountIndex::default()),
            handles: RwLock::new(HashMap::new()),
            cwd: RwLock::new(PathBuf::new("/")),
        }
    }

    /// Resolves `path` against the working directory into a normalized
    /// absolute path.
    fn absolute(&self, path: &str) -> PathBuf {
        let cwd = self.cwd.read();
        PathBuf::resolved(cwd.as_path(), Path::new(path))
    }

    fn is_mount_point(&self, path: &str) -> bool {
        self.mounts.read().entries.contains_key(path)
    }

    /// Resolves `path` to its mount and runs `operation` on the locked
    /// volume with the mount-relative remainder.
    ///
    /// `mutating` operations are rejected up front on read-only mounts.
    fn with_volume<T>(
        &self,
        path: &str,
        mutating: bool,
        operation: impl FnOnce(&mut (dyn FileSystem + Send + Sync), Path) -> FsResult<T>,
    ) -> VfsResult<T> {
        let mounts = self.mounts.read();
        let (mount, rest) = mounts.resolve(path).ok_or(FsError::NotFound)?;
        let entry = mounts.entries.get(mount).ok_or(FsError::NotFound)?;
        if mutating && entry.read_only {
            return Err(FsError::ReadOnly.into());
        }
        let mut volume = entry.volume.write();
        Ok(operation(&mut **volume, Path::new(rest))?)
    }

    /// Mounts the filesystem on `device` at `path`.
    ///
    /// A device without a recognizable filesystem fails with
    /// [`FsError::NoFilesystem`] unless
    /// [`MountOptions::format_if_unmountable`] is set, in which case it is
    /// formatted and the mount retried once.
    pub fn mount<D>(&self, path: &str, mut device: D, options: MountOptions) -> VfsResult<()>
    where
        D: BlockDevice + Send + Sync + 'static,
    {
        let mount_path = self.absolute(path);
        let target = mount_path.as_path();
        if self.is_mount_point(target.as_str()) {
            return Err(FsError::AlreadyExists.into());
        }

        if let Err(error) = FatFs::probe(&mut device) {
            if error == FsError::NoFilesystem && options.format_if_unmountable {
                log::info!("no filesystem on {}, formatting", target.as_str());
                FatFs::mkfs(&mut device)?;
            } else {
                return Err(error.into());
            }
        }
        let volume = FatFs::mount(device)?;

        let mut mounts = self.mounts.write();
        // Racing mounts on the same path settle here.
        if mounts.entries.contains_key(target.as_str()) {
            return Err(FsError::AlreadyExists.into());
        }
        mounts.insert(
            mount_path.clone(),
            MountEntry {
                volume: RwLock::new(Box::new(volume)),
                read_only: options.read_only,
            },
        );
        log::info!("mounted filesystem at {}", target.as_str());
        Ok(())
    }

    /// Unmounts the volume at `path`.
    ///
    /// Fails with [`VfsError::Busy`] while handles into the mount remain
    /// open. On success pending state is flushed and the volume dropped.
    pub fn umount(&self, path: &str) -> VfsResult<()> {
        let mount_path = self.absolute(path);
        let target = mount_path.as_path();
        {
            let handles = self.handles.read();
            if handles.values().any(|file| file.mount == mount_path) {
                return Err(VfsError::Busy);
            }
        }
        let entry = {
            let mut mounts = self.mounts.write();
            mounts.remove(target.as_str()).ok_or(FsError::NotFound)?
        };
        let mut volume = entry.volume.into_inner();
        volume.sync()?;
        log::info!("unmounted {}", target.as_str());
        Ok(())
    }

    /// Writes a fresh filesystem onto `device`.
    ///
    /// Destructive and never implicit; the device is not mounted
    /// afterwards.
    pub fn mkfs<D: BlockDevice>(device: &mut D, options: FormatOptions) -> VfsResult<()> {
        FatFs::mkfs_with(device, options.volume_id)?;
        Ok(())
    }

    /// Opens a file and returns its handle.
    pub fn open(&self, path: &str, mode: &str) -> VfsResult<Handle> {
        let mode = OpenMode::parse(mode).ok_or(VfsError::InvalidArgument)?;
        let absolute = self.absolute(path);
        let target = absolute.as_path();

        let mount = {
            let mounts = self.mounts.read();
            let (mount, _) = mounts.resolve(target.as_str()).ok_or(FsError::NotFound)?;
            mount.clone()
        };

        let size = self.with_volume(target.as_str(), mode.writes(), |fs, rel| {
            let existing = match fs.metadata(rel) {
                Ok(meta) => Some(meta),
                Err(FsError::NotFound) => None,
                Err(error) => return Err(error),
            };
            match existing {
                Some(_) if mode.create_new => Err(FsError::AlreadyExists),
                Some(meta) if meta.is_dir() => Err(FsError::IsADirectory),
                Some(_) if mode.truncate => {
                    fs.truncate(rel, 0)?;
                    Ok(0)
                }
                Some(meta) => Ok(meta.size()),
                None if mode.create => {
                    fs.create(rel)?;
                    Ok(0)
                }
                None => Err(FsError::NotFound),
            }
        })?;

        let handle = Handle::next();
        let file = OpenFile {
            mount,
            path: absolute,
            mode,
            position: if mode.append { size } else { 0 },
        };
        self.handles.write().insert(handle, file);
        Ok(handle)
    }

    /// Closes the handle, flushing volume state if it was writable.
    pub fn close(&self, handle: Handle) -> VfsResult<()> {
        let file = self
            .handles
            .write()
            .remove(&handle)
            .ok_or(VfsError::InvalidHandle)?;
        if file.mode.writes() {
            let target = file.path.as_path();
            self.with_volume(target.as_str(), false, |fs, _| fs.sync())?;
        }
        Ok(())
    }

    /// Reads from the handle's cursor into `buffer` and advances it.
    ///
    /// Returns the byte count, zero at end of file.
    pub fn read(&self, handle: Handle, buffer: &mut [u8]) -> VfsResult<usize> {
        let (path, position) = {
            let handles = self.handles.read();
            let file = handles.get(&handle).ok_or(VfsError::InvalidHandle)?;
            if !file.mode.reads() {
                return Err(VfsError::InvalidArgument);
            }
            (file.path.clone(), file.position)
        };
        let target = path.as_path();
        let count = self.with_volume(target.as_str(), false, |fs, rel| {
            fs.read(rel, buffer, position)
        })?;
        if let Some(file) = self.handles.write().get_mut(&handle) {
            file.position = position + count;
        }
        Ok(count)
    }

    /// Writes `buffer` at the handle's cursor and advances it.
    pub fn write(&self, handle: Handle, buffer: &[u8]) -> VfsResult<usize> {
        let (path, position) = {
            let handles = self.handles.read();
            let file = handles.get(&handle).ok_or(VfsError::InvalidHandle)?;
            if !file.mode.writes() {
                return Err(VfsError::InvalidArgument);
            }
            (file.path.clone(), file.position)
        };
        let target = path.as_path();
        let count = self.with_volume(target.as_str(), true, |fs, rel| {
            fs.write(rel, buffer, position)
        })?;
        if let Some(file) = self.handles.write().get_mut(&handle) {
            file.position = position + count;
        }
        Ok(count)
    }

    /// Moves the handle's cursor, returning the new absolute position.
    ///
    /// Seeking past the end is allowed, a later write zero-fills the gap.
    /// Seeking before the start fails with [`VfsError::InvalidArgument`].
    pub fn seek(&self, handle: Handle, from: SeekFrom) -> VfsResult<usize> {
        let (path, position) = {
            let handles = self.handles.read();
            let file = handles.get(&handle).ok_or(VfsError::InvalidHandle)?;
            (file.path.clone(), file.position)
        };
        let target = match from {
            SeekFrom::Start(offset) => {
                usize::try_from(offset).map_err(|_| VfsError::InvalidArgument)?
            }
            SeekFrom::Current(delta) => shifted(position, delta)?,
            SeekFrom::End(delta) => {
                let at = path.as_path();
                let size = self.with_volume(at.as_str(), false, |fs, rel| {
                    Ok(fs.metadata(rel)?.size())
                })?;
                shifted(size, delta)?
            }
        };
        let mut handles = self.handles.write();
        let file = handles.get_mut(&handle).ok_or(VfsError::InvalidHandle)?;
        file.position = target;
        Ok(target)
    }

    /// Returns the POSIX-shaped description of `path`.
    ///
    /// The root and mount points are synthesized: directory mode, zero
    /// size, all timestamps at the 2000-01-01 epoch.
    pub fn stat(&self, path: &str) -> VfsResult<Stat> {
        let absolute = self.absolute(path);
        let target = absolute.as_path();
        if target.is_root() || self.is_mount_point(target.as_str()) {
            return Ok(Stat::synthetic_root());
        }
        let meta = self.with_volume(target.as_str(), false, |fs, rel| fs.metadata(rel))?;
        Ok(Stat::from_metadata(&meta))
    }

    /// Returns allocation statistics for the volume covering `path`.
    pub fn statvfs(&self, path: &str) -> VfsResult<StatVfs> {
        let absolute = self.absolute(path);
        let target = absolute.as_path();
        let stats = self.with_volume(target.as_str(), false, |fs, _| fs.volume_stats())?;
        let free = u64::try_from(stats.free_blocks()).unwrap();
        Ok(StatVfs {
            block_size: u64::try_from(stats.block_size()).unwrap(),
            fragment_size: u64::try_from(stats.block_size()).unwrap(),
            blocks: u64::try_from(stats.total_blocks()).unwrap(),
            blocks_free: free,
            blocks_available: free,
            name_max: u64::try_from(stats.max_name_len()).unwrap(),
            ..StatVfs::default()
        })
    }

    /// Starts a lazy directory listing.
    ///
    /// The iterator re-resolves the directory on every step, so it stays
    /// valid across interleaved operations and each entry is fetched under
    /// the volume lock, never torn. Without a volume mounted on `/` the
    /// root is virtual and lists the mount points themselves.
    pub fn ilistdir(&self, path: &str) -> VfsResult<DirIter<'_>> {
        let absolute = self.absolute(path);
        let target = absolute.as_path();

        if target.is_root() && !self.is_mount_point("/") {
            let mounts = self.mounts.read();
            let names = mounts
                .ordered
                .iter()
                .filter_map(|mount| {
                    let name = mount.as_path().as_str().trim_start_matches('/');
                    (!name.is_empty() && !name.contains('/')).then(|| String::from(name))
                })
                .collect();
            return Ok(DirIter {
                vfs: self,
                source: IterSource::MountRoots { names, index: 0 },
            });
        }

        let meta = self.with_volume(target.as_str(), false, |fs, rel| fs.metadata(rel))?;
        if !meta.is_dir() {
            return Err(FsError::NotADirectory.into());
        }
        Ok(DirIter {
            vfs: self,
            source: IterSource::Volume {
                path: absolute,
                index: 0,
            },
        })
    }

    /// Creates a directory.
    pub fn mkdir(&self, path: &str) -> VfsResult<()> {
        let absolute = self.absolute(path);
        let target = absolute.as_path();
        self.with_volume(target.as_str(), true, |fs, rel| fs.mkdir(rel))
    }

    /// Removes an empty directory.
    pub fn rmdir(&self, path: &str) -> VfsResult<()> {
        let absolute = self.absolute(path);
        let target = absolute.as_path();
        self.with_volume(target.as_str(), true, |fs, rel| fs.rmdir(rel))
    }

    /// Removes a file.
    pub fn remove(&self, path: &str) -> VfsResult<()> {
        let absolute = self.absolute(path);
        let target = absolute.as_path();
        self.with_volume(target.as_str(), true, |fs, rel| fs.remove(rel))
    }

    /// Renames `from` to `to` within one mount; an existing destination
    /// fails with [`FsError::AlreadyExists`].
    pub fn rename(&self, from: &str, to: &str) -> VfsResult<()> {
        self.rename_impl(from, to, false)
    }

    /// Renames `from` to `to`, replacing an existing destination file.
    pub fn rename_replace(&self, from: &str, to: &str) -> VfsResult<()> {
        self.rename_impl(from, to, true)
    }

    fn rename_impl(&self, from: &str, to: &str, overwrite: bool) -> VfsResult<()> {
        let from_abs = self.absolute(from);
        let to_abs = self.absolute(to);
        let from_path = from_abs.as_path();
        let to_path = to_abs.as_path();

        let mounts = self.mounts.read();
        let (from_mount, from_rest) = mounts
            .resolve(from_path.as_str())
            .ok_or(FsError::NotFound)?;
        let (to_mount, to_rest) = mounts.resolve(to_path.as_str()).ok_or(FsError::NotFound)?;
        if from_mount != to_mount {
            return Err(VfsError::CrossDevice);
        }
        let entry = mounts.entries.get(from_mount).ok_or(FsError::NotFound)?;
        if entry.read_only {
            return Err(FsError::ReadOnly.into());
        }
        let mut volume = entry.volume.write();
        volume.rename(Path::new(from_rest), Path::new(to_rest), overwrite)?;
        Ok(())
    }

    /// Changes the working directory.
    ///
    /// The target must be the root, a mount point or an existing directory.
    pub fn chdir(&self, path: &str) -> VfsResult<()> {
        let absolute = self.absolute(path);
        let target = absolute.as_path();
        if !target.is_root() && !self.is_mount_point(target.as_str()) {
            let meta = self.with_volume(target.as_str(), false, |fs, rel| fs.metadata(rel))?;
            if !meta.is_dir() {
                return Err(FsError::NotADirectory.into());
            }
        }
        *self.cwd.write() = absolute;
        Ok(())
    }

    /// Returns the working directory.
    #[must_use]
    pub fn getcwd(&self) -> PathBuf {
        self.cwd.read().clone()
    }
}

/// Applies a signed seek delta to a base position.
fn shifted(base: usize, delta: i64) -> VfsResult<usize> {
    let base = i64::try_from(base).map_err(|_| VfsError::InvalidArgument)?;
    let moved = base.checked_add(delta).ok_or(VfsError::InvalidArgument)?;
    usize::try_from(moved).map_err(|_| VfsError::InvalidArgument)
}

/// Lazy directory iterator, see [`Vfs::ilistdir`].
pub struct DirIter<'vfs> {
    vfs: &'vfs Vfs,
    source: IterSource,
}

impl fmt::Debug for DirIter<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirIter")
            .field("source", &self.source)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
enum IterSource {
    /// Entries of a mounted directory, fetched one index at a time.
    Volume { path: PathBuf, index: usize },
    /// Synthetic listing of the virtual root.
    MountRoots { names: Vec<String>, index: usize },
}

impl Iterator for DirIter<'_> {
    type Item = VfsResult<DirEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        match &mut self.source {
            IterSource::Volume { path, index } => {
                let at = *index;
                let target = path.as_path();
                let step = self
                    .vfs
                    .with_volume(target.as_str(), false, |fs, rel| fs.read_dir(rel, at));
                match step {
                    Ok(Some(info)) => {
                        *index = at + 1;
                        Some(Ok(DirEntry::from_info(&info)))
                    }
                    Ok(None) => None,
                    Err(error) => Some(Err(error)),
                }
            }
            IterSource::MountRoots { names, index } => {
                let name = names.get(*index)?.clone();
                *index += 1;
                Some(Ok(DirEntry {
                    name,
                    entry_type: MODE_DIRECTORY,
                    inode: 0,
                    size: 0,
                }))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MemDisk {
        data: Vec<u8>,
        block_size: usize,
    }

    impl MemDisk {
        fn new(blocks: usize) -> Self {
            Self {
                data: vec![0u8; blocks * 512],
                block_size: 512,
            }
        }
    }

    impl BlockDevice for MemDisk {
        fn block_size(&self) -> usize {
            self.block_size
        }

        fn block_count(&self) -> usize {
            self.data.len() / self.block_size
        }

        fn read_block(&mut self, block: usize, buf: &mut [u8]) -> Result<(), DeviceError> {
            if buf.len() != self.block_size {
                return Err(DeviceError::Unaligned);
            }
            let start = block * self.block_size;
            if start + self.block_size > self.data.len() {
                return Err(DeviceError::OutOfBounds);
            }
            buf.copy_from_slice(&self.data[start..start + self.block_size]);
            Ok(())
        }

        fn write_block(&mut self, block: usize, buf: &[u8]) -> Result<(), DeviceError> {
            if buf.len() != self.block_size {
                return Err(DeviceError::Unaligned);
            }
            let start = block * self.block_size;
            if start + self.block_size > self.data.len() {
                return Err(DeviceError::OutOfBounds);
            }
            self.data[start..start + self.block_size].copy_from_slice(buf);
            Ok(())
        }

        fn sync(&mut self) -> Result<(), DeviceError> {
            Ok(())
        }
    }

    fn formatted_disk(blocks: usize) -> MemDisk {
        let mut disk = MemDisk::new(blocks);
        Vfs::mkfs(&mut disk, FormatOptions::default()).unwrap();
        disk
    }

    fn fresh_vfs() -> Vfs {
        let vfs = Vfs::new();
        vfs.mount("/flash", formatted_disk(256), MountOptions::default())
            .unwrap();
        vfs
    }

    fn write_file(vfs: &Vfs, path: &str, contents: &[u8]) {
        let handle = vfs.open(path, "w").unwrap();
        assert_eq!(vfs.write(handle, contents).unwrap(), contents.len());
        vfs.close(handle).unwrap();
    }

    fn read_file(vfs: &Vfs, path: &str) -> Vec<u8> {
        let handle = vfs.open(path, "r").unwrap();
        let mut out = Vec::new();
        let mut buf = [0u8; 64];
        loop {
            let n = vfs.read(handle, &mut buf).unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        vfs.close(handle).unwrap();
        out
    }

    #[test]
    fn open_mode_strings_parse() {
        let read = OpenMode::parse("r").unwrap();
        assert!(read.reads() && !read.writes());

        let write = OpenMode::parse("wb").unwrap();
        assert!(write.writes() && !write.reads());
        assert!(write.truncate && write.create);

        let update = OpenMode::parse("r+").unwrap();
        assert!(update.reads() && update.writes());
        assert!(!update.create);

        let append = OpenMode::parse("ab+").unwrap();
        assert!(append.reads() && append.writes() && append.append);

        let exclusive = OpenMode::parse("x").unwrap();
        assert!(exclusive.create_new && exclusive.create);

        assert!(OpenMode::parse("").is_none());
        assert!(OpenMode::parse("rw").is_none());
        assert!(OpenMode::parse("q").is_none());
        assert!(OpenMode::parse("+").is_none());
    }

    #[test]
    fn mounting_requires_a_formatted_volume() {
        let vfs = Vfs::new();
        let blank = MemDisk::new(256);
        let error = vfs
            .mount("/flash", blank, MountOptions::default())
            .unwrap_err();
        assert_eq!(error, VfsError::Fs(FsError::NoFilesystem));
        assert_eq!(error.code(), 19);

        let blank = MemDisk::new(256);
        let options = MountOptions {
            format_if_unmountable: true,
            ..MountOptions::default()
        };
        vfs.mount("/flash", blank, options).unwrap();
        write_file(&vfs, "/flash/boot.py", b"print('hi')");
        assert_eq!(read_file(&vfs, "/flash/boot.py"), b"print('hi')");
    }

    #[test]
    fn mount_paths_are_unique() {
        let vfs = fresh_vfs();
        let error = vfs
            .mount("/flash", formatted_disk(256), MountOptions::default())
            .unwrap_err();
        assert_eq!(error, VfsError::Fs(FsError::AlreadyExists));
        assert_eq!(error.code(), 17);
    }

    #[test]
    fn files_roundtrip_through_handles() {
        let vfs = fresh_vfs();
        write_file(&vfs, "/flash/hello.txt", b"hello vfs");
        assert_eq!(read_file(&vfs, "/flash/hello.txt"), b"hello vfs");

        let handle = vfs.open("/flash/hello.txt", "r").unwrap();
        let mut buf = [0u8; 5];
        assert_eq!(vfs.read(handle, &mut buf).unwrap(), 5);
        assert_eq!(&buf, b"hello");
        assert_eq!(vfs.read(handle, &mut buf).unwrap(), 4);
        assert_eq!(&buf[..4], b" vfs");
        assert_eq!(vfs.read(handle, &mut buf).unwrap(), 0);
        vfs.close(handle).unwrap();

        assert_eq!(
            vfs.close(handle).unwrap_err(),
            VfsError::InvalidHandle
        );
    }

    #[test]
    fn the_mode_string_gates_handle_io() {
        let vfs = fresh_vfs();
        assert_eq!(vfs.open("/flash/missing", "r").unwrap_err().code(), 2);
        assert_eq!(vfs.open("/flash/f.txt", "bogus").unwrap_err().code(), 22);

        write_file(&vfs, "/flash/f.txt", b"data");
        assert_eq!(vfs.open("/flash/f.txt", "x").unwrap_err().code(), 17);

        let reader = vfs.open("/flash/f.txt", "r").unwrap();
        assert_eq!(vfs.write(reader, b"nope").unwrap_err().code(), 22);
        vfs.close(reader).unwrap();

        let writer = vfs.open("/flash/f.txt", "w").unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(vfs.read(writer, &mut buf).unwrap_err().code(), 22);
        vfs.close(writer).unwrap();

        vfs.mkdir("/flash/dir").unwrap();
        assert_eq!(vfs.open("/flash/dir", "r").unwrap_err().code(), 21);
    }

    #[test]
    fn append_mode_starts_at_the_end() {
        let vfs = fresh_vfs();
        write_file(&vfs, "/flash/log.txt", b"one\n");

        let handle = vfs.open("/flash/log.txt", "a").unwrap();
        assert_eq!(vfs.write(handle, b"two\n").unwrap(), 4);
        vfs.close(handle).unwrap();

        assert_eq!(read_file(&vfs, "/flash/log.txt"), b"one\ntwo\n");
    }

    #[test]
    fn seek_moves_the_cursor() {
        let vfs = fresh_vfs();
        write_file(&vfs, "/flash/digits", b"0123456789");

        let handle = vfs.open("/flash/digits", "r").unwrap();
        let mut buf = [0u8; 3];

        assert_eq!(vfs.seek(handle, SeekFrom::Start(4)).unwrap(), 4);
        assert_eq!(vfs.read(handle, &mut buf).unwrap(), 3);
        assert_eq!(&buf, b"456");

        assert_eq!(vfs.seek(handle, SeekFrom::Current(-3)).unwrap(), 4);
        assert_eq!(vfs.seek(handle, SeekFrom::End(-2)).unwrap(), 8);
        assert_eq!(vfs.read(handle, &mut buf[..2]).unwrap(), 2);
        assert_eq!(&buf[..2], b"89");

        let error = vfs.seek(handle, SeekFrom::Current(-100)).unwrap_err();
        assert_eq!(error, VfsError::InvalidArgument);
        vfs.close(handle).unwrap();
    }

    #[test]
    fn sparse_writes_zero_fill_the_gap() {
        let vfs = fresh_vfs();
        let handle = vfs.open("/flash/sparse", "w").unwrap();
        assert_eq!(vfs.seek(handle, SeekFrom::Start(4)).unwrap(), 4);
        assert_eq!(vfs.write(handle, b"end").unwrap(), 3);
        vfs.close(handle).unwrap();

        assert_eq!(read_file(&vfs, "/flash/sparse"), b"\0\0\0\0end");
    }

    #[test]
    fn stat_reports_types_and_sizes() {
        let vfs = fresh_vfs();
        write_file(&vfs, "/flash/data.bin", b"abcdef");
        vfs.mkdir("/flash/sub").unwrap();

        let file = vfs.stat("/flash/data.bin").unwrap();
        assert_eq!(file.mode, MODE_FILE);
        assert_eq!(file.size, 6);
        assert_eq!(file.modified, EPOCH_2000);

        let dir = vfs.stat("/flash/sub").unwrap();
        assert_eq!(dir.mode, MODE_DIRECTORY);
        assert_eq!(dir.size, 0);
    }

    #[test]
    fn the_root_and_mount_points_are_synthetic() {
        let vfs = fresh_vfs();
        for path in ["/", "/flash"] {
            let stat = vfs.stat(path).unwrap();
            assert_eq!(stat.mode, MODE_DIRECTORY);
            assert_eq!(stat.size, 0);
            assert_eq!(stat.accessed, EPOCH_2000);
            assert_eq!(stat.modified, EPOCH_2000);
            assert_eq!(stat.created, EPOCH_2000);
        }
        assert_eq!(vfs.stat("/nope").unwrap_err().code(), 2);
    }

    #[test]
    fn statvfs_tracks_free_space() {
        let vfs = fresh_vfs();
        let before = vfs.statvfs("/flash").unwrap();
        assert_eq!(before.block_size, 512);
        assert_eq!(before.name_max, 255);
        assert!(before.blocks_free > 0);
        assert_eq!(before.blocks_free, before.blocks_available);

        write_file(&vfs, "/flash/big", &[7u8; 2048]);
        let after = vfs.statvfs("/flash").unwrap();
        assert!(after.blocks_free < before.blocks_free);

        vfs.remove("/flash/big").unwrap();
        let freed = vfs.statvfs("/flash").unwrap();
        assert_eq!(freed.blocks_free, before.blocks_free);
    }

    #[test]
    fn ilistdir_yields_typed_entries() {
        let vfs = fresh_vfs();
        vfs.mkdir("/flash/sub").unwrap();
        write_file(&vfs, "/flash/a.txt", b"contents");

        let mut entries: Vec<DirEntry> = vfs
            .ilistdir("/flash")
            .unwrap()
            .map(Result::unwrap)
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "a.txt");
        assert_eq!(entries[0].entry_type, MODE_FILE);
        assert_eq!(entries[0].size, 8);
        assert_eq!(entries[1].name, "sub");
        assert_eq!(entries[1].entry_type, MODE_DIRECTORY);
        assert_eq!(entries[1].inode, 0);

        assert_eq!(vfs.ilistdir("/flash/a.txt").unwrap_err().code(), 20);
    }

    #[test]
    fn listing_the_virtual_root_shows_mounts() {
        let vfs = fresh_vfs();
        vfs.mount("/data", formatted_disk(128), MountOptions::default())
            .unwrap();

        let mut names: Vec<String> = vfs
            .ilistdir("/")
            .unwrap()
            .map(|entry| entry.unwrap().name)
            .collect();
        names.sort();
        assert_eq!(names, ["data", "flash"]);

        for entry in vfs.ilistdir("/").unwrap() {
            assert_eq!(entry.unwrap().entry_type, MODE_DIRECTORY);
        }
    }

    #[test]
    fn chdir_resolves_relative_paths() {
        let vfs = fresh_vfs();
        assert_eq!(vfs.getcwd().as_path().as_str(), "/");

        vfs.chdir("/flash").unwrap();
        assert_eq!(vfs.getcwd().as_path().as_str(), "/flash");

        write_file(&vfs, "notes.txt", b"relative");
        assert_eq!(read_file(&vfs, "/flash/notes.txt"), b"relative");

        vfs.mkdir("sub").unwrap();
        vfs.chdir("sub").unwrap();
        assert_eq!(vfs.getcwd().as_path().as_str(), "/flash/sub");
        vfs.chdir("..").unwrap();
        assert_eq!(vfs.getcwd().as_path().as_str(), "/flash");

        assert_eq!(vfs.chdir("notes.txt").unwrap_err().code(), 20);
        assert_eq!(vfs.chdir("/missing").unwrap_err().code(), 2);
    }

    #[test]
    fn umount_refuses_while_handles_are_open() {
        let vfs = fresh_vfs();
        let handle = vfs.open("/flash/f", "w").unwrap();

        let error = vfs.umount("/flash").unwrap_err();
        assert_eq!(error, VfsError::Busy);
        assert_eq!(error.code(), 16);

        vfs.close(handle).unwrap();
        vfs.umount("/flash").unwrap();
        assert_eq!(vfs.stat("/flash/f").unwrap_err().code(), 2);
        assert_eq!(vfs.umount("/flash").unwrap_err().code(), 2);
    }

    #[test]
    fn read_only_mounts_reject_mutation() {
        let mut disk = formatted_disk(256);
        {
            let mut fs = FatFs::mount(disk).unwrap();
            fs.create(Path::new("/keep.txt")).unwrap();
            fs.write(Path::new("/keep.txt"), b"frozen", 0).unwrap();
            disk = fs.into_inner();
        }

        let vfs = Vfs::new();
        let options = MountOptions {
            read_only: true,
            ..MountOptions::default()
        };
        vfs.mount("/rom", disk, options).unwrap();

        assert_eq!(read_file(&vfs, "/rom/keep.txt"), b"frozen");
        assert_eq!(vfs.open("/rom/keep.txt", "w").unwrap_err().code(), 30);
        assert_eq!(vfs.mkdir("/rom/dir").unwrap_err().code(), 30);
        assert_eq!(vfs.remove("/rom/keep.txt").unwrap_err().code(), 30);
        assert_eq!(
            vfs.rename("/rom/keep.txt", "/rom/other.txt").unwrap_err().code(),
            30
        );
    }

    #[test]
    fn renaming_stays_within_one_mount() {
        let vfs = fresh_vfs();
        vfs.mount("/data", formatted_disk(128), MountOptions::default())
            .unwrap();
        write_file(&vfs, "/flash/a.txt", b"payload");

        let error = vfs.rename("/flash/a.txt", "/data/a.txt").unwrap_err();
        assert_eq!(error, VfsError::CrossDevice);
        assert_eq!(error.code(), 18);

        vfs.rename("/flash/a.txt", "/flash/b.txt").unwrap();
        assert_eq!(read_file(&vfs, "/flash/b.txt"), b"payload");
        assert_eq!(vfs.stat("/flash/a.txt").unwrap_err().code(), 2);

        write_file(&vfs, "/flash/c.txt", b"new");
        assert_eq!(
            vfs.rename("/flash/c.txt", "/flash/b.txt").unwrap_err().code(),
            17
        );
        vfs.rename_replace("/flash/c.txt", "/flash/b.txt").unwrap();
        assert_eq!(read_file(&vfs, "/flash/b.txt"), b"new");
    }

    #[test]
    fn rename_round_trip_preserves_content() {
        let vfs = fresh_vfs();
        vfs.mkdir("/flash/a").unwrap();
        write_file(&vfs, "/flash/a/f.txt", b"round trip");

        vfs.rename("/flash/a/f.txt", "/flash/a/g.txt").unwrap();
        assert_eq!(read_file(&vfs, "/flash/a/g.txt"), b"round trip");
        assert_eq!(vfs.stat("/flash/a/f.txt").unwrap_err().code(), 2);

        vfs.remove("/flash/a/g.txt").unwrap();
        vfs.rmdir("/flash/a").unwrap();
        assert_eq!(vfs.stat("/flash/a").unwrap_err().code(), 2);
    }

    #[test]
    fn nested_mounts_resolve_by_longest_prefix() {
        let vfs = fresh_vfs();
        vfs.mount("/flash/sd", formatted_disk(128), MountOptions::default())
            .unwrap();

        write_file(&vfs, "/flash/sd/inner.txt", b"inner");
        write_file(&vfs, "/flash/outer.txt", b"outer");

        // The outer volume never sees a path under the nested mount.
        let outer: Vec<String> = vfs
            .ilistdir("/flash")
            .unwrap()
            .map(|entry| entry.unwrap().name)
            .collect();
        assert!(outer.contains(&String::from("outer.txt")));
        assert!(!outer.contains(&String::from("inner.txt")));
        assert_eq!(read_file(&vfs, "/flash/sd/inner.txt"), b"inner");
    }

    #[test]
    fn error_codes_are_stable() {
        let cases: &[(VfsError, i32)] = &[
            (VfsError::Fs(FsError::NotFound), 2),
            (VfsError::Fs(FsError::Device(DeviceError::Io)), 5),
            (VfsError::Fs(FsError::Corrupted), 5),
            (VfsError::InvalidHandle, 9),
            (VfsError::Busy, 16),
            (VfsError::Fs(FsError::AlreadyExists), 17),
            (VfsError::CrossDevice, 18),
            (VfsError::Fs(FsError::NoFilesystem), 19),
            (VfsError::Fs(FsError::NotADirectory), 20),
            (VfsError::Fs(FsError::IsADirectory), 21),
            (VfsError::InvalidArgument, 22),
            (VfsError::Fs(FsError::InvalidPath), 22),
            (VfsError::Fs(FsError::Full), 28),
            (VfsError::Fs(FsError::Device(DeviceError::Full)), 28),
            (VfsError::Fs(FsError::ReadOnly), 30),
            (VfsError::Fs(FsError::DirectoryNotEmpty), 39),
        ];
        for (error, code) in cases {
            assert_eq!(error.code(), *code);
        }
    }
}
