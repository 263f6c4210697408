//! Anvil CAS - content-addressable storage
//!
//! Objects are opaque byte payloads plus an ordered list of references to
//! other objects, addressed by the hash of both. On top of the object store
//! sits an action cache mapping a key object's id to a result object's id.
//! This crate provides:
//! - The [`ContentStore`] trait with on-disk and in-memory implementations
//! - A [`RemoteCache`] mirror that can be queried for keys and objects
//! - File and directory tree import/export ([`CasFsNode`])
//! - [`CasOptions`] with size limiting, and the once-per-build [`CasPruner`]

pub mod disk;
pub mod error;
pub mod fs_node;
pub mod memory;
pub mod object;
pub mod options;
pub mod pruner;
pub mod remote;
pub mod store;

pub use disk::OnDiskCas;
pub use error::{CasError, Result};
pub use fs_node::{remove_existing, CasFsNode};
pub use memory::InMemoryCas;
pub use object::{CasObject, DataId};
pub use options::{compute_size_limit, CasOptions, SizeLimitingStrategy};
pub use pruner::{CasPruner, PruneReport};
pub use remote::{copy_object_tree, fetch_object_tree, DirectoryRemoteCache, RemoteCache};
pub use store::{format_size, CasStats, ContentStore};
