//! Storage layer: durable tracking of upload lifecycle state
//! (`registry`) and the durable blob store contract (`object_store`).

pub mod object_store;
pub mod registry;

pub use object_store::{BoxedBlob, FilesystemObjectStore, InMemoryObjectStore, ObjectStore};
pub use registry::{FileUploadLineHash, UploadRegistry};
