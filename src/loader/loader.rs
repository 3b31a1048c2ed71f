/*!
 * Loader
 * Resolves module names to cached, reference-counted images
 *
 * A module is cached once globally by normalized file name. Every load by any
 * process duplicates its handle and records the reference in that process's
 * private map; the process releases those references when it is torn down.
 */

use super::blob::BlobStore;
use super::image::parse_image;
use super::search::{candidate_paths, module_file_name, parent_dir, SearchContext};
use super::storage::Storage;
use super::types::{LoaderError, LoaderResult, LoadedModule, ModuleInfo};
use crate::core::config::KernelConfig;
use crate::core::limits::MAX_MODULE_SIZE;
use crate::core::types::Handle;
use crate::monitoring::KernelMetrics;
use crate::object::{ObjectManager, ObjectResult, ObjectType};
use crate::process::{ModuleRef, Process};
use ahash::RandomState;
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashSet;
use std::io::Read;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
struct CacheEntry {
    handle: Handle,
    module: Arc<LoadedModule>,
}

/// Module loader and global module cache
#[derive(Clone)]
pub struct Loader {
    storage: Arc<dyn Storage>,
    objects: ObjectManager,
    blobs: BlobStore,
    cache: Arc<DashMap<String, CacheEntry, RandomState>>,
    config: Arc<KernelConfig>,
    metrics: Arc<KernelMetrics>,
}

impl Loader {
    pub fn new(
        storage: Arc<dyn Storage>,
        objects: ObjectManager,
        config: Arc<KernelConfig>,
        metrics: Arc<KernelMetrics>,
    ) -> Self {
        Self {
            storage,
            objects,
            blobs: BlobStore::new(),
            cache: Arc::new(DashMap::with_hasher(RandomState::new())),
            config,
            metrics,
        }
    }

    pub fn blobs(&self) -> &BlobStore {
        &self.blobs
    }

    /// Handle of a globally cached module
    pub fn cached(&self, name: &str) -> Option<Handle> {
        self.cache.get(&module_file_name(name)).map(|entry| entry.handle)
    }

    pub fn cached_count(&self) -> usize {
        self.cache.len()
    }

    /// Load `name` on behalf of `process`
    ///
    /// Returns `None` when no candidate path yields a valid image or when a
    /// dependency fails to load.
    pub fn load_library(&self, process: &Process, name: &str) -> Option<ModuleInfo> {
        let mut loading = HashSet::new();
        self.load(process, name, &mut loading)
    }

    fn load(&self, process: &Process, name: &str, loading: &mut HashSet<String>) -> Option<ModuleInfo> {
        let file = module_file_name(name);

        if let Some(existing) = process.module(&file) {
            if let Some(info) = self.attach(process, &file, existing.handle) {
                return Some(info);
            }
            process.modules().lock().remove(&file);
        }

        // First use of a cached module by this process: it needs its own
        // references to the dependencies too
        if let Some(handle) = self.cached(&file) {
            if let Some(module) = self.objects.get_object::<LoadedModule>(handle) {
                loading.insert(file.clone());
                let dependencies = self.load_dependencies(process, &file, &module.descriptor.dependencies, loading);
                loading.remove(&file);
                let dependencies = dependencies?;
                if let Some(info) = self.attach(process, &file, handle) {
                    return Some(info);
                }
                self.release_dependencies(process, &dependencies);
            }
        }

        loading.insert(file.clone());
        let found = self.search(process, name);
        let Some((path, image)) = found else {
            debug!(pid = process.id(), module = %file, "Module not found");
            loading.remove(&file);
            return None;
        };

        let (descriptor, body) = match parse_image(&image) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(pid = process.id(), path = %path, error = %e, "Rejecting module image");
                loading.remove(&file);
                return None;
            }
        };

        // Dependencies resolve before the module itself is registered
        let dependencies = self.load_dependencies(process, &file, &descriptor.dependencies, loading);
        loading.remove(&file);
        dependencies?;

        let info = match self.cache.entry(file.clone()) {
            // Another load won the race while this one was reading
            Entry::Occupied(occupied) => {
                let handle = occupied.get().handle;
                drop(occupied);
                return self.attach(process, &file, handle);
            }
            Entry::Vacant(vacant) => {
                let module = Arc::new(LoadedModule {
                    name: file.clone(),
                    path: path.clone(),
                    descriptor,
                    entry_url: self.blobs.publish(body),
                    bytes: image,
                });
                let handle = self.register(&module);
                vacant.insert(CacheEntry {
                    handle,
                    module: Arc::clone(&module),
                });
                ModuleInfo::new(handle, module)
            }
        };

        process.modules().lock().insert(
            file.clone(),
            ModuleRef {
                handle: info.handle,
                refs: 1,
            },
        );
        self.metrics.module_loaded();
        info!(pid = process.id(), module = %file, path = %path, handle = %info.handle, "Module loaded");
        Some(info)
    }

    /// Load each dependency of `file` for `process`
    ///
    /// Names already on the `loading` stack are skipped (cycles). On failure
    /// every dependency taken so far is released again.
    fn load_dependencies(
        &self,
        process: &Process,
        file: &str,
        dependencies: &[String],
        loading: &mut HashSet<String>,
    ) -> Option<Vec<String>> {
        let mut loaded: Vec<String> = Vec::new();
        for dependency in dependencies {
            let dependency_file = module_file_name(dependency);
            if loading.contains(&dependency_file) {
                continue;
            }
            if self.load(process, dependency, loading).is_none() {
                let err = LoaderError::Dependency {
                    module: file.to_string(),
                    dependency: dependency.clone(),
                };
                warn!(pid = process.id(), error = %err, "Module load failed");
                self.release_dependencies(process, &loaded);
                return None;
            }
            loaded.push(dependency_file);
        }
        Some(loaded)
    }

    fn release_dependencies(&self, process: &Process, loaded: &[String]) {
        for dependency in loaded.iter().rev() {
            self.free_library(process, dependency);
        }
    }

    fn register(&self, module: &Arc<LoadedModule>) -> Handle {
        let cache = Arc::clone(&self.cache);
        let blobs = self.blobs.clone();
        self.objects.set_object_with_destructor(
            Arc::clone(module),
            ObjectType::MODULE,
            Handle::NULL,
            move |module: Arc<LoadedModule>| {
                cache.remove_if(&module.name, |_, entry| Arc::ptr_eq(&entry.module, &module));
                blobs.revoke(&module.entry_url);
                info!(module = %module.name, "Module unloaded");
                Ok(())
            },
        )
    }

    /// Take one more reference to a live module for `process`
    fn attach(&self, process: &Process, file: &str, handle: Handle) -> Option<ModuleInfo> {
        let module = self.objects.get_object::<LoadedModule>(handle)?;
        self.objects.duplicate_handle(handle)?;
        process
            .modules()
            .lock()
            .entry(file.to_string())
            .and_modify(|r| r.refs += 1)
            .or_insert(ModuleRef { handle, refs: 1 });
        debug!(pid = process.id(), module = %file, %handle, "Module reference taken");
        Some(ModuleInfo::new(handle, module))
    }

    fn search(&self, process: &Process, name: &str) -> Option<(String, Bytes)> {
        let image = process.image();
        let ctx = SearchContext {
            process_dir: parent_dir(&image.executable_path),
            current_dir: Some(image.current_directory).filter(|dir| !dir.is_empty()),
            path_var: process.env_var(&self.config.path_variable),
        };

        for candidate in candidate_paths(name, &ctx, &self.config) {
            match self.read(&candidate) {
                Ok(bytes) => return Some((candidate, bytes)),
                Err(LoaderError::NotFound(_)) => {}
                Err(e) => debug!(candidate = %candidate, error = %e, "Candidate unreadable"),
            }
        }
        None
    }

    fn read(&self, path: &str) -> LoaderResult<Bytes> {
        let mut file = self.storage.open(path)?;
        let size = file.size()?;
        if size > MAX_MODULE_SIZE {
            return Err(LoaderError::TooLarge {
                size,
                limit: MAX_MODULE_SIZE,
            });
        }
        let mut buf = Vec::with_capacity(size as usize);
        file.read_to_end(&mut buf)?;
        Ok(Bytes::from(buf))
    }

    /// Drop one of `process`'s references to `name`
    pub fn free_library(&self, process: &Process, name: &str) -> bool {
        let file = module_file_name(name);
        let handle = {
            let mut modules = process.modules().lock();
            let Some(entry) = modules.get_mut(&file) else {
                return false;
            };
            let handle = entry.handle;
            entry.refs -= 1;
            if entry.refs == 0 {
                modules.remove(&file);
            }
            handle
        };
        if let Err(e) = self.objects.close_handle(handle) {
            warn!(pid = process.id(), module = %file, error = %e, "Module release failed");
        }
        true
    }

    /// `free_library` by module handle
    pub fn free_handle(&self, process: &Process, handle: Handle) -> bool {
        let name = process
            .modules()
            .lock()
            .iter()
            .find(|(_, r)| r.handle == handle)
            .map(|(name, _)| name.clone());
        match name {
            Some(name) => self.free_library(process, &name),
            None => false,
        }
    }

    /// Release every module reference `process` holds
    pub(crate) fn release_process(&self, process: &Process) -> ObjectResult<()> {
        let modules: Vec<(String, ModuleRef)> = process.modules().lock().drain().collect();
        for (name, module) in modules {
            for _ in 0..module.refs {
                self.objects.close_handle(module.handle)?;
            }
            debug!(pid = process.id(), module = %name, refs = module.refs, "Module references released");
        }
        Ok(())
    }
}

impl std::fmt::Debug for Loader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Loader")
            .field("storage", &self.storage.name())
            .field("cached", &self.cache.len())
            .finish()
    }
}
