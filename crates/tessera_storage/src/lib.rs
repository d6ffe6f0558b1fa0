//! # Tessera Storage
//!
//! Byte-store backends for Tessera volumes.
//!
//! Every segment of a volume, and the volume's changelog, sits on top of one
//! [`StorageBackend`]. Backends are **opaque, append-only byte stores**: they
//! know nothing about packed entries, segment capacity or versionstamps.
//!
//! ## Contract
//!
//! - `append` writes at the current end and returns the offset it wrote at
//! - bytes at an offset, once appended, never change (only `truncate` can
//!   drop a torn tail during recovery)
//! - all methods take `&self`; readers may run concurrently with the single
//!   appender of a segment
//!
//! ## Available Backends
//!
//! - [`InMemoryBackend`] - tests and volumes without a data directory
//! - [`FileBackend`] - one OS file per segment
//!
//! ## Example
//!
//! ```rust
//! use tessera_storage::{StorageBackend, InMemoryBackend};
//!
//! let backend = InMemoryBackend::new();
//! let offset = backend.append(b"hello world").unwrap();
//! let data = backend.read_at(offset, 5).unwrap();
//! assert_eq!(&data, b"hello");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use memory::InMemoryBackend;
