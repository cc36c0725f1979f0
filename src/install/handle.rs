//! On-disk installation handles

use crate::cache::clock::duration_ms;
use crate::error::{ServiceError, ServiceResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// What the installer put on disk, keyed by package name
pub type Manifest = BTreeMap<String, InstalledPackage>;

/// One installed package
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledPackage {
    /// Resolved exact version
    pub version: String,
    /// Package directory, relative to the installation root
    pub path: PathBuf,
    /// Files in the package, relative to the package directory
    pub files: Vec<PathBuf>,
    /// Where the package was installed from
    pub source: String,
    /// Declared JS entry point
    pub main: Option<String>,
    /// Declared stylesheet entry point
    pub style: Option<String>,
}

/// Shared handle to an installation directory.
///
/// Clones refer to the same directory. [`destroy`](Self::destroy) removes it
/// once; later calls are no-ops.
#[derive(Debug, Clone)]
pub struct InstallationHandle {
    inner: Arc<HandleInner>,
}

#[derive(Debug)]
struct HandleInner {
    id: String,
    directory: PathBuf,
    manifest: Manifest,
    created_time: u64,
    ttl: Duration,
    destroyed: AtomicBool,
}

impl InstallationHandle {
    pub fn new(
        id: impl Into<String>,
        directory: PathBuf,
        manifest: Manifest,
        created_time: u64,
        ttl: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                id: id.into(),
                directory,
                manifest,
                created_time,
                ttl,
                destroyed: AtomicBool::new(false),
            }),
        }
    }

    /// Dependency identity this installation was built for
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn directory(&self) -> &Path {
        &self.inner.directory
    }

    pub fn manifest(&self) -> &Manifest {
        &self.inner.manifest
    }

    /// Absolute directory of an installed package
    pub fn package_dir(&self, name: &str) -> Option<PathBuf> {
        self.inner
            .manifest
            .get(name)
            .map(|pkg| self.inner.directory.join(&pkg.path))
    }

    pub fn created_time(&self) -> u64 {
        self.inner.created_time
    }

    /// Total lifetime granted at creation
    pub fn ttl(&self) -> Duration {
        self.inner.ttl
    }

    pub fn expiry_time(&self) -> u64 {
        self.inner
            .created_time
            .saturating_add(duration_ms(self.inner.ttl))
    }

    /// Lifetime left at `now_ms`; zero once expired
    pub fn remaining_ttl(&self, now_ms: u64) -> Duration {
        Duration::from_millis(self.expiry_time().saturating_sub(now_ms))
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::SeqCst)
    }

    /// Delete the installation directory. Idempotent, and an already-missing
    /// directory counts as success.
    pub async fn destroy(&self) -> ServiceResult<()> {
        if self.inner.destroyed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        debug!("Removing installation {}", self.inner.directory.display());
        match tokio::fs::remove_dir_all(&self.inner.directory).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ServiceError::io(
                format!("removing installation {}", self.inner.directory.display()),
                e,
            )),
        }
    }
}
