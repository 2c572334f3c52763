//! Cache-through performers, one per resource kind

pub mod metadata;
pub mod resolved;
pub mod upload;

pub use metadata::MetadataPerformer;
pub use resolved::{ResolvedVersionPerformer, parse_version_key, version_key};
pub use upload::UploadedFilePerformer;

use crate::engine::pool::DedupPool;

pub type MetadataPool = DedupPool<MetadataPerformer>;
pub type ResolvedVersionPool = DedupPool<ResolvedVersionPerformer>;
pub type UploadedFilePool = DedupPool<UploadedFilePerformer>;
