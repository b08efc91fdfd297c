//! # stratus-blob: streaming blob storage for the stratus sync server
//!
//! `stratus-blob` is the storage seam of the content transfer engine. It
//! exposes opaque-key blob access as two streaming capabilities:
//!
//! - a **write sink** (`open_put`) that accepts deflated bytes as they
//!   arrive from a client and is only considered stored after an explicit,
//!   durable `close()`;
//! - a **read source** (`open_get`) that produces the stored bytes as a
//!   pull-based stream, so transport backpressure pauses the read
//!   naturally.
//!
//! Keys are minted by the metadata layer; this crate never invents them.
//! Writes may reopen an existing key at a byte offset, which is what makes
//! interrupted uploads resumable.
//!
//! Two backends ship with the crate: [`FsBlobStore`] for on-disk storage
//! and [`MemoryBlobStore`] for tests and development.

mod error;
mod fs;
mod memory;
mod store;
mod types;

pub use error::{BlobError, BlobResult};
pub use fs::FsBlobStore;
pub use memory::MemoryBlobStore;
pub use store::{BlobStore, WriteSink};
pub use types::{ByteStream, ReadSource};
