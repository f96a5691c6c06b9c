//! Filesystem core types.
/// The driver-facing façade composing every cache and mapper.
pub mod cloud_fs;
/// Rendered content cache.
pub mod content;
/// Error taxonomy and errno mapping.
pub mod error;
/// FUSE adapter: maps [`fuser::Filesystem`] callbacks to [`cloud_fs::CloudFs`].
pub mod fuser;
/// Stable inode numbering for remote nodes.
pub mod inode_table;
/// Turning bundles into presented bytes.
pub mod materialize;
/// Snapshot of the remote tree.
pub mod metadata;
/// Presentation mode and display names.
pub mod mode;
/// Write-class operations against the remote store.
pub mod mutation;
/// Size estimation.
pub mod size;

pub use cloud_fs::{CloudFs, FsOptions, MAX_UPLOAD_SIZE};
pub use error::FsError;
pub use mode::Mode;
pub use size::SizeInfo;

use std::ffi::OsString;
use std::time::SystemTime;

use bitflags::bitflags;

/// Type representing an inode identifier.
pub type InodeAddr = u64;

/// Type representing a file handle.
pub type FileHandle = u64;

/// The root directory.
pub const ROOT_INODE: InodeAddr = 1;
/// The `.mode` control file.
pub const MODE_INODE: InodeAddr = 2;
/// The `.trash` folder.
pub const TRASH_INODE: InodeAddr = 3;

bitflags! {
    /// Permission bits for an inode, similar to Unix file permissions.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct InodePerms: u16 {
        /// Other: execute permission.
        const OTHER_EXECUTE = 1 << 0;
        /// Other: write permission.
        const OTHER_WRITE   = 1 << 1;
        /// Other: read permission.
        const OTHER_READ    = 1 << 2;

        /// Group: execute permission.
        const GROUP_EXECUTE = 1 << 3;
        /// Group: write permission.
        const GROUP_WRITE   = 1 << 4;
        /// Group: read permission.
        const GROUP_READ    = 1 << 5;

        /// Owner: execute permission.
        const OWNER_EXECUTE = 1 << 6;
        /// Owner: write permission.
        const OWNER_WRITE   = 1 << 7;
        /// Owner: read permission.
        const OWNER_READ    = 1 << 8;

        /// `rwxr-xr-x`, used for folders.
        const DIRECTORY = Self::OWNER_READ.bits()
            | Self::OWNER_WRITE.bits()
            | Self::OWNER_EXECUTE.bits()
            | Self::GROUP_READ.bits()
            | Self::GROUP_EXECUTE.bits()
            | Self::OTHER_READ.bits()
            | Self::OTHER_EXECUTE.bits();
        /// `r--r--r--`, used for documents.
        const READ_ONLY = Self::OWNER_READ.bits()
            | Self::GROUP_READ.bits()
            | Self::OTHER_READ.bits();
        /// `rw-r--r--`, used for the control file and pending uploads.
        const READ_WRITE = Self::READ_ONLY.bits() | Self::OWNER_WRITE.bits();
    }
}

bitflags! {
    /// Flags for opening a file, similar to Unix open(2) flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct OpenFlags: i32 {
        /// Open for reading only.
        const RDONLY = libc::O_RDONLY;
        /// Open for writing only.
        const WRONLY = libc::O_WRONLY;
        /// Open for reading and writing.
        const RDWR = libc::O_RDWR;

        /// Append on each write.
        const APPEND = libc::O_APPEND;
        /// Truncate to zero length.
        const TRUNC = libc::O_TRUNC;
        /// Create file if it does not exist.
        const CREAT = libc::O_CREAT;
        /// Error if file already exists (with `CREAT`).
        const EXCL = libc::O_EXCL;
    }
}

impl OpenFlags {
    /// Whether the flags request any kind of write access.
    #[must_use]
    pub fn wants_write(self) -> bool {
        self.intersects(Self::WRONLY | Self::RDWR | Self::APPEND | Self::TRUNC)
    }
}

/// The type of an inode entry in the filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum INodeType {
    /// A regular file.
    File,
    /// A directory.
    Directory,
}

/// Representation of an inode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct INode {
    /// The address of this inode, which serves as its unique identifier.
    pub addr: InodeAddr,
    /// The permissions associated with this inode, represented as a bitfield.
    pub permissions: InodePerms,
    /// The user ID of the owner of this inode.
    pub uid: u32,
    /// The group ID of the owner of this inode.
    pub gid: u32,
    /// The time this inode was last modified at. Every other timestamp mirrors it.
    pub last_modified_at: SystemTime,
    /// The parent inode address, if any. This is `None` for the root inode.
    pub parent: Option<InodeAddr>,
    /// The presented size of the file, exact or estimated.
    pub size: SizeInfo,
    /// Whether this is a file or a directory.
    pub itype: INodeType,
}

impl INode {
    /// Check if this inode is the root inode (i.e., has no parent).
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }
}

/// A directory entry yielded by [`CloudFs::readdir`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// The name of this entry within its parent directory.
    pub name: OsString,
    /// The full inode data for this entry.
    pub inode: INode,
}

/// Filesystem statistics returned by [`CloudFs::statfs`].
///
/// Block-related sizes are in units of `block_size` bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FsStats {
    /// Filesystem block size (bytes).
    pub block_size: u32,
    /// Total number of data blocks.
    pub total_blocks: u64,
    /// Number of free blocks.
    pub free_blocks: u64,
    /// Number of blocks available to unprivileged users.
    pub available_blocks: u64,
    /// Total number of file nodes (inodes).
    pub total_inodes: u64,
    /// Number of free file nodes.
    pub free_inodes: u64,
    /// Maximum filename length (bytes).
    pub max_filename_length: u32,
}
