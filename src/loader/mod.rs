/*!
 * Loader
 * DLL-style module resolution, image parsing and the module cache
 */

pub mod blob;
pub mod image;
pub mod loader;
pub mod search;
pub mod storage;
pub mod types;

// Re-exports
pub use blob::BlobStore;
pub use image::{encode_image, parse_image};
pub use loader::Loader;
pub use search::{candidate_paths, module_file_name, normalize_path, SearchContext};
pub use storage::{MemStorage, Storage, StorageFile};
pub use types::{
    ImageSubsystem, LoadedModule, LoaderError, LoaderResult, ModuleDescriptor, ModuleInfo, ModuleKind,
};
