//! Resource loading for schema files and manifests.
//!
//! Resource paths are slash-separated and rooted, e.g.
//! `/schema/test-command.avsc`. The loader is injected into the agent so
//! tests and embeddings never depend on process-wide filesystem state.

use std::collections::HashMap;
use std::io;
use std::path::{Component, Path, PathBuf};

/// Source of resource bytes.
pub trait ResourceLoader: Send + Sync {
    /// Read the full contents of the resource at `path`.
    ///
    /// # Errors
    ///
    /// Returns `io::Error` with kind `NotFound` if the resource does not
    /// exist, or `InvalidInput` if the path is not acceptable.
    fn load(&self, path: &str) -> io::Result<Vec<u8>>;
}

/// Resources read from a directory on disk.
#[derive(Debug, Clone)]
pub struct DirResources {
    root: PathBuf,
}

impl DirResources {
    /// Serve resources from under `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a resource path onto the filesystem, refusing anything that
    /// would leave the root.
    fn resolve(&self, path: &str) -> io::Result<PathBuf> {
        let relative = Path::new(path.trim_start_matches('/'));
        let mut resolved = self.root.clone();
        for component in relative.components() {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::CurDir => {}
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("resource path '{path}' escapes the resource root"),
                    ));
                }
            }
        }
        if resolved == self.root {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("resource path '{path}' names no file"),
            ));
        }
        Ok(resolved)
    }
}

impl ResourceLoader for DirResources {
    fn load(&self, path: &str) -> io::Result<Vec<u8>> {
        let file = self.resolve(path)?;
        tracing::debug!(path = %path, file = %file.display(), "loading resource");
        std::fs::read(file)
    }
}

/// Resources held in memory, keyed by path.
///
/// # Examples
///
/// ```
/// use schema_agent::{MemoryResources, ResourceLoader};
///
/// let resources = MemoryResources::new().with("/schema/a.avsc", b"{}".to_vec());
/// assert_eq!(resources.load("/schema/a.avsc").unwrap(), b"{}");
/// assert!(resources.load("/schema/b.avsc").is_err());
/// ```
#[derive(Debug, Clone, Default)]
pub struct MemoryResources {
    entries: HashMap<String, Vec<u8>>,
}

impl MemoryResources {
    /// An empty set of resources.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a resource.
    pub fn with(mut self, path: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        self.insert(path, bytes);
        self
    }

    /// Add or replace a resource.
    pub fn insert(&mut self, path: impl Into<String>, bytes: impl Into<Vec<u8>>) {
        self.entries.insert(normalize(&path.into()), bytes.into());
    }
}

fn normalize(path: &str) -> String {
    format!("/{}", path.trim_start_matches('/'))
}

impl ResourceLoader for MemoryResources {
    fn load(&self, path: &str) -> io::Result<Vec<u8>> {
        self.entries.get(&normalize(path)).cloned().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no resource at '{path}'"),
            )
        })
    }
}
