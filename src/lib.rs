//! Composite root-filesystem projection over single-client NFSv3.
//!
//! A workstation runs interactive workloads on a remote, often
//! resource-constrained host by projecting a root filesystem to it: a
//! flattened container image (a CPIO "newc" archive) unioned with selected
//! host directories, served over NFSv3 through a tunneled loopback port.
//!
//! The pieces, leaf first:
//!
//! - [`archive::ArchiveIndex`]: the immutable archive, fully indexed in
//!   memory, read positionally from an mmap.
//! - [`local::LocalFs`]: a writable passthrough to a host directory, the
//!   only write path.
//! - [`vfs::CompositeFs`]: the union, routing per path with the archive
//!   as the default and mounts as overrides.
//! - [`nfs`]: the contract with the NFSv3 dispatch layer: the one-shot
//!   nonce-gated mount admission, the read-only wrapper, and the handle
//!   cache.
//! - [`serve::Export`]: glue from a pre-bound listener to a served
//!   export plus the fstab line the remote mounts it with.
//! - [`extract`]: unpack the archive into a writable filesystem instead
//!   of serving it.
//!
//! Mount admission is deliberately unusual: the export answers exactly one
//! MOUNT call, and only when the request's dirpath equals a UUID nonce
//! minted at export time. The nonce travels to the remote inside the
//! `CPU_FSTAB` environment variable; anyone else racing the port gets one
//! refusal and the door stays shut.

pub mod archive;
pub mod attr;
pub mod error;
pub mod extract;
pub mod local;
pub mod nfs;
pub mod serve;
pub mod vfs;

pub use archive::ArchiveIndex;
pub use attr::{DirEntry, FileAttr, FileKind};
pub use error::FsError;
pub use local::LocalFs;
pub use serve::Export;
pub use vfs::{Capability, CompositeFs, Filesystem, MountPoint};
