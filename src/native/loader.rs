//! Module loader.
//!
//! Loads the Integration Hub module and the libraries it links against, in
//! dependency order, from an ordered list of search directories. The first
//! directory holding a loadable copy of a module wins.

use libloading::Library;
use std::path::{Path, PathBuf};
use tracing::{debug, warn, Level};

use crate::config::NativeConfig;
use crate::error::HubError;

/// Ordered module names plus which one exports the hub API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleSet {
    modules: Vec<String>,
    primary: usize,
}

impl ModuleSet {
    pub fn new(modules: Vec<String>, primary: &str) -> Result<Self, HubError> {
        let primary = modules
            .iter()
            .position(|m| m == primary)
            .ok_or_else(|| {
                HubError::Config(format!("primary module '{primary}' is not in the module set"))
            })?;
        Ok(Self { modules, primary })
    }

    pub fn from_config(config: &NativeConfig) -> Result<Self, HubError> {
        Self::new(config.modules.clone(), &config.primary_module)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.modules.iter().map(String::as_str)
    }

    pub fn primary(&self) -> &str {
        &self.modules[self.primary]
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

#[derive(Debug)]
pub struct LoadedModule<M> {
    pub name: String,
    pub path: PathBuf,
    pub module: M,
}

/// Every module of a [`ModuleSet`], kept loaded together.
///
/// Dropping unloads in reverse load order, so dependents go before the
/// libraries they link against.
#[derive(Debug)]
pub struct LoadedModules<M = Library> {
    modules: Vec<LoadedModule<M>>,
    primary: usize,
}

impl<M> LoadedModules<M> {
    pub fn primary(&self) -> &M {
        &self.modules[self.primary].module
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &LoadedModule<M>> {
        self.modules.iter()
    }
}

impl<M> Drop for LoadedModules<M> {
    fn drop(&mut self) {
        while let Some(m) = self.modules.pop() {
            debug!(module = %m.name, "Unloading module");
            drop(m);
        }
    }
}

/// Load every module of `set` as a dynamic library.
pub fn load(
    set: &ModuleSet,
    search_paths: &[PathBuf],
    log: &mut dyn FnMut(Level, String),
) -> Result<LoadedModules<Library>, HubError> {
    load_with(set, search_paths, log, |path| {
        // SAFETY: loading runs the module's initialisers. The module set is
        // the vendor-supplied Integration Hub bundle, loaded in the order its
        // dependencies require.
        unsafe { Library::new(path) }.map_err(|e| e.to_string())
    })
}

/// Same as [`load`], with the actual open step supplied by the caller.
pub fn load_with<M, F>(
    set: &ModuleSet,
    search_paths: &[PathBuf],
    log: &mut dyn FnMut(Level, String),
    mut open: F,
) -> Result<LoadedModules<M>, HubError>
where
    F: FnMut(&Path) -> Result<M, String>,
{
    let mut loaded = LoadedModules {
        modules: Vec::with_capacity(set.len()),
        primary: set.primary,
    };

    for name in set.iter() {
        let mut found = None;

        for dir in search_paths {
            let path = dir.join(name);
            if !path.exists() {
                continue;
            }

            log(Level::INFO, format!("Loading {name} from {}...", dir.display()));
            match open(&path) {
                Ok(module) => {
                    log(Level::INFO, format!("Successfully loaded {name}"));
                    found = Some(LoadedModule {
                        name: name.to_string(),
                        path,
                        module,
                    });
                    break;
                }
                Err(e) => {
                    warn!(module = %name, path = %path.display(), error = %e, "Module load failed");
                    log(Level::WARN, format!("Failed to load {name}: {e}"));
                }
            }
        }

        match found {
            Some(module) => loaded.modules.push(module),
            None => {
                log(Level::WARN, format!("Failed to load required DLL: {name}"));
                return Err(HubError::LibraryLoadFailure {
                    module: name.to_string(),
                });
            }
        }
    }

    log(Level::INFO, format!("Successfully loaded {} DLLs", loaded.len()));
    Ok(loaded)
}
