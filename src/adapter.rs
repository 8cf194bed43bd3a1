//! Binds the virtual catalog and build coordinator to the `fuser` FUSE
//! protocol, translating `lookup`/`getattr`/`readdir`/`open`/`read`/`release`
//! into calls on the async engine underneath; every write-family callback
//! returns `EROFS`.
//!
//! `fuser::Filesystem` callbacks are synchronous and run on `fuser`'s own
//! session thread(s), never on a Tokio worker; this adapter holds a
//! `tokio::runtime::Handle` and bridges into the async engine with
//! `block_in_place` + `block_on`.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use fuser::{
    FileAttr, FileType, Filesystem, ReplyAttr, ReplyData, ReplyDirectory, ReplyEmpty, ReplyEntry,
    ReplyOpen, ReplyWrite, Request, FUSE_ROOT_ID,
};
use tracing::warn;

use crate::cache::CacheHandle;
use crate::catalog::{EntryKind, ProjectedEntry, VirtualAttr, VirtualCatalog};
use crate::coordinator::BuildCoordinator;
use crate::drivers::Driver;
use crate::error::AudioFsError;
use crate::fingerprint::Fingerprint;
use crate::source::SourceIdentity;

/// How long the kernel may cache a `lookup`/`getattr` reply before asking
/// again. Short rather than zero, so a `readdir` followed by the burst of
/// `getattr`s tools like `ls -l` issue doesn't re-run the size estimator or
/// re-stat the source for every entry; short enough that the
/// estimated-to-true-size transition on first build is visible to the next
/// caller within about a second, in lieu of a kernel-side `fuse_notify` push
/// (no stable `fuser::Notifier` API to depend on for this).
const ATTR_TTL: Duration = Duration::from_secs(1);

enum OpenFile {
    PassThrough(std::fs::File),
    Derived {
        file: std::fs::File,
        handle: Option<CacheHandle>,
    },
}

/// Assigns stable inode numbers to virtual paths as the kernel discovers
/// them via `lookup`/`readdir`. Entries are never forgotten: at the scale
/// this engine targets (one music library's worth of virtual entries) the
/// memory cost of keeping every seen path alive is negligible next to the
/// complexity of honoring `forget`.
struct InodeTable {
    next_ino: u64,
    paths: HashMap<u64, PathBuf>,
    inos: HashMap<PathBuf, u64>,
}

impl InodeTable {
    fn new() -> Self {
        let mut paths = HashMap::new();
        paths.insert(FUSE_ROOT_ID, PathBuf::new());
        let mut inos = HashMap::new();
        inos.insert(PathBuf::new(), FUSE_ROOT_ID);
        InodeTable {
            next_ino: FUSE_ROOT_ID + 1,
            paths,
            inos,
        }
    }

    fn path_for(&self, ino: u64) -> Option<PathBuf> {
        self.paths.get(&ino).cloned()
    }

    fn ino_for(&mut self, path: &Path) -> u64 {
        if let Some(&ino) = self.inos.get(path) {
            return ino;
        }
        let ino = self.next_ino;
        self.next_ino += 1;
        self.paths.insert(ino, path.to_path_buf());
        self.inos.insert(path.to_path_buf(), ino);
        ino
    }
}

/// The `fuser::Filesystem` implementation shared by all three mount
/// binaries; only the injected `driver` (and the catalog's `Projection`)
/// differs between `splittrackfs`, `mp3fs`, and `oggfs`.
pub struct AudioFsAdapter {
    catalog: Arc<VirtualCatalog>,
    coordinator: Arc<BuildCoordinator>,
    driver: Arc<dyn Driver>,
    runtime: tokio::runtime::Handle,
    inodes: Mutex<InodeTable>,
    open_files: Mutex<HashMap<u64, OpenFile>>,
    next_fh: AtomicU64,
}

impl AudioFsAdapter {
    pub fn new(
        catalog: Arc<VirtualCatalog>,
        coordinator: Arc<BuildCoordinator>,
        driver: Arc<dyn Driver>,
        runtime: tokio::runtime::Handle,
    ) -> Self {
        AudioFsAdapter {
            catalog,
            coordinator,
            driver,
            runtime,
            inodes: Mutex::new(InodeTable::new()),
            open_files: Mutex::new(HashMap::new()),
            next_fh: AtomicU64::new(1),
        }
    }

    fn block_on<F: std::future::Future>(&self, fut: F) -> F::Output {
        tokio::task::block_in_place(|| self.runtime.block_on(fut))
    }

    fn path_for(&self, ino: u64) -> Option<PathBuf> {
        self.inodes.lock().unwrap().path_for(ino)
    }

    fn ino_for(&self, path: &Path) -> u64 {
        self.inodes.lock().unwrap().ino_for(path)
    }

    fn file_attr(&self, ino: u64, attr: &VirtualAttr) -> FileAttr {
        FileAttr {
            ino,
            size: attr.size,
            blocks: attr.size.div_ceil(512),
            atime: attr.atime,
            mtime: attr.mtime,
            ctime: attr.ctime,
            crtime: attr.mtime,
            kind: match attr.kind {
                EntryKind::Directory => FileType::Directory,
                EntryKind::File => FileType::RegularFile,
            },
            perm: attr.mode as u16,
            nlink: if attr.kind == EntryKind::Directory { 2 } else { 1 },
            uid: unsafe { libc::getuid() },
            gid: unsafe { libc::getgid() },
            rdev: 0,
            blksize: 4096,
            flags: 0,
        }
    }

    fn next_fh(&self) -> u64 {
        self.next_fh.fetch_add(1, Ordering::Relaxed)
    }

    fn errno_of<E: Into<AudioFsError>>(e: E) -> i32 {
        e.into().to_errno()
    }
}

impl Filesystem for AudioFsAdapter {
    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(parent_path) = self.path_for(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let child_path = parent_path.join(name);

        match self.block_on(self.catalog.getattr(&child_path)) {
            Ok(attr) => {
                let ino = self.ino_for(&child_path);
                reply.entry(&ATTR_TTL, &self.file_attr(ino, &attr), 0);
            }
            Err(e) => reply.error(Self::errno_of(e)),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        let Some(path) = self.path_for(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.block_on(self.catalog.getattr(&path)) {
            Ok(attr) => reply.attr(&ATTR_TTL, &self.file_attr(ino, &attr)),
            Err(e) => reply.error(Self::errno_of(e)),
        }
    }

    fn readdir(&mut self, _req: &Request<'_>, ino: u64, _fh: u64, offset: i64, mut reply: ReplyDirectory) {
        let Some(path) = self.path_for(ino) else {
            reply.error(libc::ENOENT);
            return;
        };

        let listing = match self.block_on(self.catalog.readdir(&path)) {
            Ok(listing) => listing,
            Err(e) => {
                reply.error(Self::errno_of(e));
                return;
            }
        };

        let mut entries: Vec<(u64, FileType, String)> = vec![
            (ino, FileType::Directory, ".".to_string()),
            (ino, FileType::Directory, "..".to_string()),
        ];
        for entry in &listing {
            let child_path = path.join(&entry.name);
            let child_ino = self.ino_for(&child_path);
            let kind = match entry.kind {
                EntryKind::Directory => FileType::Directory,
                EntryKind::File => FileType::RegularFile,
            };
            entries.push((child_ino, kind, entry.name.clone()));
        }

        for (i, (entry_ino, kind, name)) in entries.into_iter().enumerate().skip(offset as usize) {
            // `add` returns true once the reply buffer is full; stop and
            // let the kernel re-call `readdir` with this `offset`.
            if reply.add(entry_ino, (i + 1) as i64, kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        if flags & (libc::O_WRONLY | libc::O_RDWR) != 0 {
            reply.error(libc::EROFS);
            return;
        }

        let Some(path) = self.path_for(ino) else {
            reply.error(libc::ENOENT);
            return;
        };

        let entry = match self.block_on(self.catalog.lookup(&path)) {
            Ok(entry) => entry,
            Err(e) => {
                reply.error(Self::errno_of(e));
                return;
            }
        };

        match entry {
            ProjectedEntry::Directory => reply.error(libc::EISDIR),
            ProjectedEntry::PassThrough(source_path) => match std::fs::File::open(&source_path) {
                Ok(file) => {
                    let fh = self.next_fh();
                    self.open_files.lock().unwrap().insert(fh, OpenFile::PassThrough(file));
                    reply.opened(fh, 0);
                }
                Err(e) => {
                    warn!(path = %source_path.display(), error = %e, "adapter: failed to open pass-through source");
                    reply.error(libc::EIO);
                }
            },
            ProjectedEntry::Derived(source) => self.open_derived(&path, source, reply),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let read_result = {
            let open_files = self.open_files.lock().unwrap();
            open_files.get(&fh).map(|open_file| {
                let file = match open_file {
                    OpenFile::PassThrough(file) => file,
                    OpenFile::Derived { file, .. } => file,
                };
                let mut buf = vec![0u8; size as usize];
                file.read_at(&mut buf, offset as u64).map(|n| {
                    buf.truncate(n);
                    buf
                })
            })
        };

        match read_result {
            None => reply.error(libc::EBADF),
            Some(Ok(buf)) => reply.data(&buf),
            Some(Err(e)) => {
                warn!(error = %e, "adapter: read failed");
                reply.error(libc::EIO);
            }
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        let removed = self.open_files.lock().unwrap().remove(&fh);
        if let Some(OpenFile::Derived { handle: Some(handle), .. }) = removed {
            self.block_on(self.coordinator.cache().release(handle));
        }
        reply.ok();
    }

    fn opendir(&mut self, _req: &Request<'_>, _ino: u64, _flags: i32, reply: ReplyOpen) {
        reply.opened(0, 0);
    }

    fn releasedir(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _flags: i32, reply: ReplyEmpty) {
        reply.ok();
    }

    // Write-family operations all return EROFS; this engine never accepts
    // a mutation through the derived view.

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        _size: Option<u64>,
        _atime: Option<fuser::TimeOrNow>,
        _mtime: Option<fuser::TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        reply.error(libc::EROFS);
    }

    fn mknod(
        &mut self,
        _req: &Request<'_>,
        _parent: u64,
        _name: &OsStr,
        _mode: u32,
        _umask: u32,
        _rdev: u32,
        reply: ReplyEntry,
    ) {
        reply.error(libc::EROFS);
    }

    fn mkdir(&mut self, _req: &Request<'_>, _parent: u64, _name: &OsStr, _mode: u32, _umask: u32, reply: ReplyEntry) {
        reply.error(libc::EROFS);
    }

    fn unlink(&mut self, _req: &Request<'_>, _parent: u64, _name: &OsStr, reply: ReplyEmpty) {
        reply.error(libc::EROFS);
    }

    fn rmdir(&mut self, _req: &Request<'_>, _parent: u64, _name: &OsStr, reply: ReplyEmpty) {
        reply.error(libc::EROFS);
    }

    fn symlink(
        &mut self,
        _req: &Request<'_>,
        _parent: u64,
        _name: &OsStr,
        _link: &Path,
        reply: ReplyEntry,
    ) {
        reply.error(libc::EROFS);
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        _parent: u64,
        _name: &OsStr,
        _newparent: u64,
        _newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        reply.error(libc::EROFS);
    }

    fn link(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _newparent: u64,
        _newname: &OsStr,
        reply: ReplyEntry,
    ) {
        reply.error(libc::EROFS);
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _offset: i64,
        _data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        reply.error(libc::EROFS);
    }
}

impl AudioFsAdapter {
    fn open_derived(&self, virtual_path: &Path, source: crate::drivers::BuildSource, reply: ReplyOpen) {
        let identity = match SourceIdentity::for_path(source.flac_path()) {
            Ok(identity) => identity,
            Err(_) => {
                reply.error(libc::EIO);
                return;
            }
        };
        let fp = Fingerprint::compute(
            self.driver.id(),
            self.driver.version_tag(),
            &self.driver.fingerprint_parameters(&source),
            identity,
        );

        match self.block_on(self.coordinator.get_or_build(fp, &source, self.driver.as_ref())) {
            Ok(cache_handle) => match std::fs::File::open(&cache_handle.path) {
                Ok(file) => {
                    self.block_on(self.catalog.note_built(virtual_path, cache_handle.len));
                    let fh = self.next_fh();
                    self.open_files
                        .lock()
                        .unwrap()
                        .insert(fh, OpenFile::Derived { file, handle: Some(cache_handle) });
                    reply.opened(fh, 0);
                }
                Err(e) => {
                    warn!(error = %e, "adapter: failed to open ready cache file");
                    reply.error(libc::EIO);
                }
            },
            Err(e) => reply.error(Self::errno_of(e)),
        }
    }
}
