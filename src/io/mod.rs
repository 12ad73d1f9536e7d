pub mod gcs;
pub mod results;
pub mod safetensors;
pub mod store;
#[cfg(test)]
pub(crate) mod testing;
pub mod uri;

pub use gcs::GcsClient;
pub use store::{ArtifactStore, CloudStore, Fetched, LocalStore, TransferMode, fetch, put_file, read_text, remove_path};
pub use uri::StorageUri;
