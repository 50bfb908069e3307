use std::{
    ffi::OsStr,
    path::Path,
    time::{Duration, SystemTime},
};

use fuser::{self, FileAttr, FileType};
use libc;

use crate::cache::{FetchError, TokenCache, TokenSource};

pub const TOKEN_FILE_NAME: &str = "token";

const ROOT_INO: u64 = 1;
const TOKEN_INO: u64 = 2;

const ROOT_PERM: u16 = 0o777;
const TOKEN_PERM: u16 = 0o777;

// The token rotates underneath the kernel, so nothing may be cached there.
const TTL: Duration = Duration::ZERO;

/// The only two entries that ever exist in the mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inode {
    Root,
    Token,
}

impl Inode {
    pub fn from_raw(ino: u64) -> Option<Self> {
        match ino {
            ROOT_INO => Some(Inode::Root),
            TOKEN_INO => Some(Inode::Token),
            _ => None,
        }
    }

    pub fn raw(self) -> u64 {
        match self {
            Inode::Root => ROOT_INO,
            Inode::Token => TOKEN_INO,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FsError {
    #[error("no such entry")]
    NotFound,
    #[error("is a directory")]
    IsDirectory,
    #[error("not a directory")]
    NotDirectory,
    #[error("unexpected directory offset {0}")]
    InvalidOffset(i64),
    #[error("listing does not fit in the reply buffer")]
    NoSpace,
    #[error("refresh failed: {0}")]
    Fetch(#[from] FetchError),
}

impl FsError {
    pub fn errno(&self) -> libc::c_int {
        match self {
            FsError::NotFound => libc::ENOENT,
            FsError::IsDirectory => libc::EISDIR,
            FsError::NotDirectory => libc::ENOTDIR,
            FsError::InvalidOffset(_) => libc::EINVAL,
            FsError::NoSpace => libc::ENOSPC,
            FsError::Fetch(_) => libc::EIO,
        }
    }
}

/// Ownership reported for both entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Owner {
    pub uid: u32,
    pub gid: u32,
}

impl Owner {
    /// Takes the owner of the mount point itself.
    pub fn of(path: &Path) -> std::io::Result<Self> {
        use std::os::unix::fs::MetadataExt;

        let meta = std::fs::metadata(path)?;
        Ok(Owner {
            uid: meta.uid(),
            gid: meta.gid(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub ino: Inode,
    pub offset: i64,
    pub kind: FileType,
    pub name: &'static str,
}

/// Read-only filesystem exposing the cached token as `/token`.
///
/// Every lookup, open, read and opendir refreshes the cache first; getattr
/// and readdir only look at what is already cached.
pub struct TokenFs<S> {
    cache: TokenCache<S>,
    owner: Owner,
    mounted_at: SystemTime,
}

impl<S: TokenSource> TokenFs<S> {
    pub fn new(cache: TokenCache<S>, owner: Owner) -> Self {
        TokenFs {
            cache,
            owner,
            mounted_at: SystemTime::now(),
        }
    }

    fn attrs(&self, ino: Inode, size: u64) -> FileAttr {
        let (kind, perm) = match ino {
            Inode::Root => (FileType::Directory, ROOT_PERM),
            Inode::Token => (FileType::RegularFile, TOKEN_PERM),
        };
        FileAttr {
            ino: ino.raw(),
            size,
            blocks: size.div_ceil(512),
            atime: self.mounted_at,
            mtime: self.mounted_at,
            ctime: self.mounted_at,
            crtime: self.mounted_at,
            kind,
            perm,
            nlink: 1,
            uid: self.owner.uid,
            gid: self.owner.gid,
            rdev: 0,
            flags: 0,
            blksize: 512,
        }
    }

    pub fn getattr(&self, ino: Inode) -> FileAttr {
        match ino {
            Inode::Root => self.attrs(ino, 0),
            Inode::Token => {
                let size = self.cache.current().len() as u64;
                self.attrs(ino, size)
            }
        }
    }

    /// Attribute changes are accepted and dropped.
    pub fn setattr(&self, ino: Inode) -> FileAttr {
        self.getattr(ino)
    }

    pub fn lookup(&self, parent: Inode, name: &OsStr) -> Result<FileAttr, FsError> {
        if parent != Inode::Root || name != TOKEN_FILE_NAME {
            return Err(FsError::NotFound);
        }
        let contents = self.cache.refresh()?;
        Ok(self.attrs(Inode::Token, contents.len() as u64))
    }

    pub fn open(&self, ino: Inode) -> Result<(), FsError> {
        match ino {
            Inode::Token => {
                drop(self.cache.refresh()?);
                Ok(())
            }
            Inode::Root => Err(FsError::IsDirectory),
        }
    }

    pub fn read(&self, ino: Inode, offset: i64, size: u32) -> Result<Vec<u8>, FsError> {
        if ino != Inode::Token {
            return Err(FsError::IsDirectory);
        }
        let offset = usize::try_from(offset).map_err(|_| FsError::InvalidOffset(offset))?;

        let contents = self.cache.refresh()?;
        if offset > contents.len() {
            return Ok(Vec::new());
        }
        let end = contents.len().min(offset.saturating_add(size as usize));
        Ok(contents[offset..end].to_vec())
    }

    pub fn opendir(&self, ino: Inode) -> Result<(), FsError> {
        match ino {
            // Refreshed here so a listing reports the right size before any lookup.
            Inode::Root => {
                drop(self.cache.refresh()?);
                Ok(())
            }
            Inode::Token => Err(FsError::NotDirectory),
        }
    }

    /// The listing is produced in one shot: offset 0 yields everything and
    /// the offset just past the last entry yields nothing.
    pub fn readdir(&self, ino: Inode, offset: i64) -> Result<Vec<DirEntry>, FsError> {
        if ino != Inode::Root {
            return Err(FsError::NotDirectory);
        }
        let entries = vec![DirEntry {
            ino: Inode::Token,
            offset: 1,
            kind: FileType::RegularFile,
            name: TOKEN_FILE_NAME,
        }];

        match offset {
            0 => Ok(entries),
            n if n == entries.len() as i64 => Ok(Vec::new()),
            n => Err(FsError::InvalidOffset(n)),
        }
    }

    fn resolve(ino: u64) -> Result<Inode, FsError> {
        Inode::from_raw(ino).ok_or(FsError::NotFound)
    }
}

fn log_failure(op: &str, ino: u64, err: &FsError) {
    match err {
        FsError::Fetch(_) => log::warn!("{op} ino={ino} failed: {err}"),
        _ => log::debug!("{op} ino={ino} failed: {err}"),
    }
}

impl<S: TokenSource> fuser::Filesystem for TokenFs<S> {
    fn lookup(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        reply: fuser::ReplyEntry,
    ) {
        log::debug!("lookup parent={parent} name={name:?}");
        match Self::resolve(parent).and_then(|parent| TokenFs::lookup(self, parent, name)) {
            Ok(attrs) => reply.entry(&TTL, &attrs, 0),
            Err(e) => {
                log_failure("lookup", parent, &e);
                reply.error(e.errno());
            }
        }
    }

    fn getattr(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        fh: Option<u64>,
        reply: fuser::ReplyAttr,
    ) {
        log::debug!("getattr ino={ino} fh={fh:?}");
        match Self::resolve(ino) {
            Ok(ino) => reply.attr(&TTL, &TokenFs::getattr(self, ino)),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn setattr(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<fuser::TimeOrNow>,
        _mtime: Option<fuser::TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: fuser::ReplyAttr,
    ) {
        log::debug!("setattr ino={ino} mode={mode:?} uid={uid:?} gid={gid:?} size={size:?} (ignored)");
        match Self::resolve(ino) {
            Ok(ino) => reply.attr(&TTL, &TokenFs::setattr(self, ino)),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn open(&mut self, _req: &fuser::Request<'_>, ino: u64, _flags: i32, reply: fuser::ReplyOpen) {
        log::debug!("open ino={ino}");
        match Self::resolve(ino).and_then(|ino| TokenFs::open(self, ino)) {
            // Direct I/O keeps the page cache out of the way so every read
            // reaches us and sees the refreshed token.
            Ok(()) => reply.opened(0, fuser::consts::FOPEN_DIRECT_IO),
            Err(e) => {
                log_failure("open", ino, &e);
                reply.error(e.errno());
            }
        }
    }

    fn read(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: fuser::ReplyData,
    ) {
        log::debug!("read ino={ino} offset={offset} size={size}");
        match Self::resolve(ino).and_then(|ino| TokenFs::read(self, ino, offset, size)) {
            Ok(data) => reply.data(&data),
            Err(e) => {
                log_failure("read", ino, &e);
                reply.error(e.errno());
            }
        }
    }

    fn opendir(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        _flags: i32,
        reply: fuser::ReplyOpen,
    ) {
        log::debug!("opendir ino={ino}");
        match Self::resolve(ino).and_then(|ino| TokenFs::opendir(self, ino)) {
            Ok(()) => reply.opened(0, 0),
            Err(e) => {
                log_failure("opendir", ino, &e);
                reply.error(e.errno());
            }
        }
    }

    fn readdir(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: fuser::ReplyDirectory,
    ) {
        log::debug!("readdir ino={ino} offset={offset}");
        let entries = match Self::resolve(ino).and_then(|ino| TokenFs::readdir(self, ino, offset)) {
            Ok(entries) => entries,
            Err(e) => {
                log_failure("readdir", ino, &e);
                reply.error(e.errno());
                return;
            }
        };

        for entry in entries {
            if reply.add(entry.ino.raw(), entry.offset, entry.kind, entry.name) {
                log_failure("readdir", ino, &FsError::NoSpace);
                reply.error(FsError::NoSpace.errno());
                return;
            }
        }
        reply.ok();
    }

    fn statfs(&mut self, _req: &fuser::Request<'_>, _ino: u64, reply: fuser::ReplyStatfs) {
        reply.statfs(0, 0, 0, 0, 0, 512, 255, 0);
    }
}
