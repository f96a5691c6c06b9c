//! FUSE adapter: maps [`fuser::Filesystem`] callbacks to [`CloudFs`].

use std::ffi::OsStr;
use std::future::Future;
use std::sync::Arc;
use std::time::SystemTime;

use rm_cloud::CloudClient;
use tracing::{Instrument as _, debug, error, instrument, trace};

use super::cloud_fs::CloudFs;
use super::error::FsError;
use super::{INode, INodeType, OpenFlags, ROOT_INODE};

/// Trait abstracting the `.error(errno)` method common to all fuser reply types.
trait FuseReply {
    fn error(self, errno: i32);
}

macro_rules! impl_fuse_reply {
    ($($ty:ty),* $(,)?) => {
        $(impl FuseReply for $ty {
            fn error(self, errno: i32) {
                // Calls the inherent fuser method (not this trait method).
                self.error(errno);
            }
        })*
    };
}

impl_fuse_reply!(
    fuser::ReplyEntry,
    fuser::ReplyAttr,
    fuser::ReplyDirectory,
    fuser::ReplyOpen,
    fuser::ReplyData,
    fuser::ReplyWrite,
    fuser::ReplyEmpty,
    fuser::ReplyCreate,
);

/// Extension trait on `Result<T, FsError>` for FUSE reply handling.
///
/// Centralizes the error-logging + errno-reply path so each FUSE callback
/// only has to express its success path.
trait FuseResultExt<T> {
    fn fuse_reply<R: FuseReply>(self, reply: R, on_ok: impl FnOnce(T, R));
}

impl<T> FuseResultExt<T> for Result<T, FsError> {
    fn fuse_reply<R: FuseReply>(self, reply: R, on_ok: impl FnOnce(T, R)) {
        match self {
            Ok(val) => on_ok(val, reply),
            Err(e) => {
                debug!(error = %e, "replying error");
                reply.error(e.to_errno());
            }
        }
    }
}

/// Run `op` on `runtime` and answer `reply` from the spawned task, so the session thread moves on
/// to the next request while the store or the renderer is busy.
fn spawn_reply<T, R, F>(
    runtime: &tokio::runtime::Handle,
    reply: R,
    op: F,
    on_ok: impl FnOnce(T, R) + Send + 'static,
) where
    T: Send + 'static,
    R: FuseReply + Send + 'static,
    F: Future<Output = Result<T, FsError>> + Send + 'static,
{
    let span = tracing::Span::current();
    runtime.spawn(async move { op.await.fuse_reply(reply, on_ok) }.instrument(span));
}

/// Convert an `INode` to the fuser-specific `FileAttr`.
fn inode_to_fuser_attr(inode: &INode, block_size: u32) -> fuser::FileAttr {
    let size = inode.size.bytes();
    fuser::FileAttr {
        ino: inode.addr,
        size,
        blocks: size.div_ceil(512),
        atime: inode.last_modified_at,
        mtime: inode.last_modified_at,
        ctime: inode.last_modified_at,
        crtime: inode.last_modified_at,
        kind: inode_type_to_fuser(inode.itype),
        perm: inode.permissions.bits(),
        nlink: if inode.itype == INodeType::Directory { 2 } else { 1 },
        uid: inode.uid,
        gid: inode.gid,
        rdev: 0,
        blksize: block_size,
        flags: 0,
    }
}

fn inode_type_to_fuser(itype: INodeType) -> fuser::FileType {
    match itype {
        INodeType::Directory => fuser::FileType::Directory,
        INodeType::File => fuser::FileType::RegularFile,
    }
}

const BLOCK_SIZE: u32 = 4096;

/// Bridges a [`CloudFs`] to the [`fuser::Filesystem`] trait. Operations that may reach the store
/// or the renderer are spawned onto a tokio runtime; the rest answer inline.
pub struct FuserAdapter<C> {
    fs: Arc<CloudFs<C>>,
    runtime: tokio::runtime::Handle,
}

impl<C: CloudClient> FuserAdapter<C> {
    // TODO: a low TTL makes the kernel ask us for every lookup. Invalidating entries with
    // notify_inval_entry after each refresh would allow a much higher one.
    const SHAMEFUL_TTL: std::time::Duration = std::time::Duration::from_secs(1);

    /// Create a new adapter around an already refreshed filesystem.
    pub fn new(fs: Arc<CloudFs<C>>, runtime: tokio::runtime::Handle) -> Self {
        Self { fs, runtime }
    }
}

impl<C: CloudClient> fuser::Filesystem for FuserAdapter<C> {
    #[instrument(name = "FuserAdapter::lookup", skip(self, _req, reply))]
    fn lookup(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        reply: fuser::ReplyEntry,
    ) {
        self.fs.lookup(parent, name).fuse_reply(reply, |inode, reply| {
            let f_attr = inode_to_fuser_attr(&inode, BLOCK_SIZE);
            debug!(?f_attr, "replying...");
            reply.entry(&Self::SHAMEFUL_TTL, &f_attr, 0);
        });
    }

    #[instrument(name = "FuserAdapter::forget", skip(self, _req))]
    fn forget(&mut self, _req: &fuser::Request<'_>, ino: u64, nlookup: u64) {
        self.fs.forget(ino, nlookup);
    }

    #[instrument(name = "FuserAdapter::getattr", skip(self, _req, _fh, reply))]
    fn getattr(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        _fh: Option<u64>,
        reply: fuser::ReplyAttr,
    ) {
        self.fs.getattr(ino).fuse_reply(reply, |inode, reply| {
            let attr = inode_to_fuser_attr(&inode, BLOCK_SIZE);
            debug!(?attr, "replying...");
            reply.attr(&Self::SHAMEFUL_TTL, &attr);
        });
    }

    #[instrument(
        name = "FuserAdapter::setattr",
        skip(
            self, _req, _mode, _uid, _gid, _atime, _mtime, _ctime, _fh, _crtime, _chgtime,
            _bkuptime, _flags, reply
        )
    )]
    fn setattr(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
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
        self.fs.setattr(ino, size).fuse_reply(reply, |inode, reply| {
            reply.attr(&Self::SHAMEFUL_TTL, &inode_to_fuser_attr(&inode, BLOCK_SIZE));
        });
    }

    #[instrument(name = "FuserAdapter::readdir", skip(self, _req, _fh, offset, reply))]
    fn readdir(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: fuser::ReplyDirectory,
    ) {
        let listed = self.fs.getattr(ino).and_then(|dir| {
            let mut entries = vec![
                (ino, ".".into(), INodeType::Directory),
                (
                    dir.parent.unwrap_or(ROOT_INODE),
                    "..".into(),
                    INodeType::Directory,
                ),
            ];
            entries.extend(
                self.fs
                    .readdir(ino)?
                    .into_iter()
                    .map(|de| (de.inode.addr, de.name, de.inode.itype)),
            );
            Ok(entries)
        });

        let entries = match listed {
            Ok(entries) => entries,
            Err(e) => {
                debug!(error = %e, "replying error");
                reply.error(e.to_errno());
                return;
            }
        };

        let skip = usize::try_from(offset).unwrap_or(0);
        for (i, (entry_ino, entry_name, entry_itype)) in entries.iter().enumerate().skip(skip) {
            let Ok(idx): Result<i64, _> = (i + 1).try_into() else {
                error!("Directory entry index {} too large for fuser", i + 1);
                reply.error(libc::EIO);
                return;
            };

            trace!(?entry_name, ino = entry_ino, "adding entry to reply...");
            if reply.add(*entry_ino, idx, inode_type_to_fuser(*entry_itype), entry_name) {
                debug!("buffer full for now, stopping readdir");
                break;
            }
        }

        debug!("finalizing reply...");
        reply.ok();
    }

    #[instrument(name = "FuserAdapter::open", skip(self, _req, flags, reply))]
    fn open(&mut self, _req: &fuser::Request<'_>, ino: u64, flags: i32, reply: fuser::ReplyOpen) {
        let flags = OpenFlags::from_bits_truncate(flags);
        let fs = Arc::clone(&self.fs);
        spawn_reply(
            &self.runtime,
            reply,
            async move { fs.open(ino, flags).await },
            |fh, reply| {
                debug!(handle = fh, "replying...");
                // Sizes may be estimates; make the kernel honor short reads.
                reply.opened(fh, fuser::consts::FOPEN_DIRECT_IO);
            },
        );
    }

    #[instrument(
        name = "FuserAdapter::read",
        skip(self, _req, _ino, fh, offset, size, _flags, _lock_owner, reply)
    )]
    fn read(
        &mut self,
        _req: &fuser::Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: fuser::ReplyData,
    ) {
        self.fs
            .read(fh, offset.cast_unsigned(), size)
            .fuse_reply(reply, |data, reply| {
                debug!(read_bytes = data.len(), "replying...");
                reply.data(&data);
            });
    }

    #[instrument(
        name = "FuserAdapter::write",
        skip(self, _req, _ino, offset, data, _write_flags, _flags, _lock_owner, reply)
    )]
    fn write(
        &mut self,
        _req: &fuser::Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: fuser::ReplyWrite,
    ) {
        let fs = Arc::clone(&self.fs);
        let data = data.to_vec();
        spawn_reply(
            &self.runtime,
            reply,
            async move { fs.write(fh, offset.cast_unsigned(), &data).await },
            |written, reply| reply.written(written),
        );
    }

    #[instrument(name = "FuserAdapter::flush", skip(self, _req, _ino, _lock_owner, reply))]
    fn flush(
        &mut self,
        _req: &fuser::Request<'_>,
        _ino: u64,
        fh: u64,
        _lock_owner: u64,
        reply: fuser::ReplyEmpty,
    ) {
        let fs = Arc::clone(&self.fs);
        spawn_reply(
            &self.runtime,
            reply,
            async move { fs.flush(fh).await },
            |(), reply| reply.ok(),
        );
    }

    #[instrument(
        name = "FuserAdapter::release",
        skip(self, _req, _ino, _flags, _lock_owner, _flush, reply)
    )]
    fn release(
        &mut self,
        _req: &fuser::Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: fuser::ReplyEmpty,
    ) {
        let fs = Arc::clone(&self.fs);
        spawn_reply(
            &self.runtime,
            reply,
            async move { fs.release(fh).await },
            |(), reply| reply.ok(),
        );
    }

    #[instrument(name = "FuserAdapter::create", skip(self, _req, _mode, _umask, _flags, reply))]
    fn create(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        _flags: i32,
        reply: fuser::ReplyCreate,
    ) {
        self.fs
            .create(parent, name)
            .fuse_reply(reply, |(inode, fh), reply| {
                let attr = inode_to_fuser_attr(&inode, BLOCK_SIZE);
                debug!(handle = fh, ?attr, "replying...");
                reply.created(
                    &Self::SHAMEFUL_TTL,
                    &attr,
                    0,
                    fh,
                    fuser::consts::FOPEN_DIRECT_IO,
                );
            });
    }

    #[instrument(name = "FuserAdapter::mkdir", skip(self, _req, _mode, _umask, reply))]
    fn mkdir(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        reply: fuser::ReplyEntry,
    ) {
        let fs = Arc::clone(&self.fs);
        let name = name.to_owned();
        spawn_reply(
            &self.runtime,
            reply,
            async move { fs.mkdir(parent, &name).await },
            |inode, reply| {
                reply.entry(
                    &Self::SHAMEFUL_TTL,
                    &inode_to_fuser_attr(&inode, BLOCK_SIZE),
                    0,
                );
            },
        );
    }

    #[instrument(name = "FuserAdapter::unlink", skip(self, _req, reply))]
    fn unlink(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        reply: fuser::ReplyEmpty,
    ) {
        let fs = Arc::clone(&self.fs);
        let name = name.to_owned();
        spawn_reply(
            &self.runtime,
            reply,
            async move { fs.unlink(parent, &name).await },
            |(), reply| reply.ok(),
        );
    }

    #[instrument(name = "FuserAdapter::rmdir", skip(self, _req, reply))]
    fn rmdir(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        reply: fuser::ReplyEmpty,
    ) {
        let fs = Arc::clone(&self.fs);
        let name = name.to_owned();
        spawn_reply(
            &self.runtime,
            reply,
            async move { fs.rmdir(parent, &name).await },
            |(), reply| reply.ok(),
        );
    }

    #[instrument(name = "FuserAdapter::rename", skip(self, _req, _flags, reply))]
    fn rename(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: fuser::ReplyEmpty,
    ) {
        let fs = Arc::clone(&self.fs);
        let (name, newname) = (name.to_owned(), newname.to_owned());
        spawn_reply(
            &self.runtime,
            reply,
            async move { fs.rename(parent, &name, newparent, &newname).await },
            |(), reply| reply.ok(),
        );
    }

    #[instrument(name = "FuserAdapter::statfs", skip(self, _req, _ino, reply))]
    fn statfs(&mut self, _req: &fuser::Request<'_>, _ino: u64, reply: fuser::ReplyStatfs) {
        let stats = self.fs.statfs();
        debug!(?stats, "replying...");
        reply.statfs(
            stats.total_blocks,
            stats.free_blocks,
            stats.available_blocks,
            stats.total_inodes,
            stats.free_inodes,
            stats.block_size,
            stats.max_filename_length,
            0,
        );
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use tokio::sync::{mpsc, oneshot};

    use super::*;

    struct ChannelReply(mpsc::UnboundedSender<Result<u32, i32>>);

    impl FuseReply for ChannelReply {
        fn error(self, errno: i32) {
            let _ = self.0.send(Err(errno));
        }
    }

    fn answer(value: u32, reply: ChannelReply) {
        let _ = reply.0.send(Ok(value));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn slow_operation_does_not_hold_back_later_ones() {
        let runtime = tokio::runtime::Handle::current();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (release, gate) = oneshot::channel::<()>();

        spawn_reply(
            &runtime,
            ChannelReply(tx.clone()),
            async move {
                gate.await.unwrap();
                Ok(7)
            },
            answer,
        );
        spawn_reply(
            &runtime,
            ChannelReply(tx),
            async { Err(FsError::NotFound) },
            answer,
        );

        assert_eq!(rx.recv().await, Some(Err(libc::ENOENT)));
        release.send(()).unwrap();
        assert_eq!(rx.recv().await, Some(Ok(7)));
    }
}
