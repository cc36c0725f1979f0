//! Installation cache
//!
//! Coalesces installs of the same dependency set and keeps the resulting
//! directory around for a TTL that depends on how pinned the request is.
//! Directories are deleted when their entry is evicted or replaced.

use crate::cache::{AsyncResultCache, Clock, Created, GetMetaOptions, MetricsSink};
use crate::error::{ServiceError, ServiceResult};
use crate::identity::dependency_identity;
use crate::install::handle::InstallationHandle;
use crate::install::installer::Installer;
use crate::request::DependencySpec;
use rand::Rng;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Lifetimes for installation entries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstallationTtl {
    /// Every dependency is an exact version; the result cannot change
    pub pinned: Duration,
    /// At least one dependency is a range; a newer release may match later
    pub range: Duration,
    /// Upper bound of the random amount subtracted from each TTL
    pub jitter: Duration,
    pub error: Duration,
}

impl Default for InstallationTtl {
    fn default() -> Self {
        Self {
            pinned: Duration::from_secs(7 * 24 * 60 * 60),
            range: Duration::from_secs(60 * 60),
            jitter: Duration::from_secs(5 * 60),
            error: Duration::from_secs(5),
        }
    }
}

impl InstallationTtl {
    /// TTL for `spec` with a random jitter in `[0, jitter]` subtracted
    pub fn ttl_for(&self, spec: &DependencySpec) -> Duration {
        let base = if spec.is_pinned() { self.pinned } else { self.range };
        let jitter_ms = u64::try_from(self.jitter.as_millis()).unwrap_or(u64::MAX);
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        };
        base.saturating_sub(jitter)
    }
}

/// Per-request installation options
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InstallOptions {
    /// Epoch-ms freshness floor
    pub newer_than: Option<u64>,
}

/// Cache of on-disk installations keyed by dependency identity
pub struct InstallationCache {
    cache: AsyncResultCache<InstallationHandle>,
    installer: Arc<dyn Installer>,
    work_dir: PathBuf,
    ttl: InstallationTtl,
    clock: Arc<dyn Clock>,
}

impl InstallationCache {
    pub fn new(
        work_dir: PathBuf,
        capacity: NonZeroUsize,
        ttl: InstallationTtl,
        installer: Arc<dyn Installer>,
        clock: Arc<dyn Clock>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        let cache = AsyncResultCache::builder("installations", capacity)
            .clock(Arc::clone(&clock))
            .metrics(metrics)
            .dispose(|key, handle: InstallationHandle| async move {
                debug!("Disposing installation {} at {}", key, handle.directory().display());
                handle.destroy().await
            })
            .build();

        Self {
            cache,
            installer,
            work_dir,
            ttl,
            clock,
        }
    }

    /// Install `spec` or reuse a cached installation of the same set
    pub async fn create_installation(
        &self,
        spec: &DependencySpec,
        options: InstallOptions,
    ) -> ServiceResult<InstallationHandle> {
        let id = dependency_identity(spec);
        let ttl = self.ttl_for(spec);

        let meta_options = GetMetaOptions::new(id.clone(), ttl)
            .newer_than(options.newer_than)
            .error_time_to_live(self.ttl.error);

        let installer = Arc::clone(&self.installer);
        let clock = Arc::clone(&self.clock);
        let work_dir = self.work_dir.clone();
        let spec = spec.clone();

        let meta = self
            .cache
            .get_meta(meta_options, move || async move {
                let directory = work_dir.join(format!("install-{}", Uuid::new_v4()));
                tokio::fs::create_dir_all(&directory).await.map_err(|e| {
                    ServiceError::io(
                        format!("creating installation directory {}", directory.display()),
                        e,
                    )
                })?;

                let created_time = clock.now_ms();
                info!(
                    "Installing {} with {} into {}",
                    spec,
                    installer.installer_name(),
                    directory.display()
                );

                match installer.install(&spec, &directory).await {
                    Ok(manifest) => Ok(Created::new(InstallationHandle::new(
                        id,
                        directory,
                        manifest,
                        created_time,
                        ttl,
                    ))),
                    Err(e) => {
                        if let Err(cleanup) = tokio::fs::remove_dir_all(&directory).await {
                            warn!(
                                "Failed to remove incomplete installation {}: {}",
                                directory.display(),
                                cleanup
                            );
                        }
                        Err(e)
                    }
                }
            })
            .await?;

        Ok(meta.result)
    }

    /// TTL for `spec` including jitter
    pub fn ttl_for(&self, spec: &DependencySpec) -> Duration {
        self.ttl.ttl_for(spec)
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    /// Drop every cached installation and delete its directory
    pub async fn teardown(&self) {
        self.cache.clear().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{ManualClock, TracingMetrics};
    use crate::install::handle::Manifest;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Installer that writes a marker file and counts calls
    struct CountingInstaller {
        calls: AtomicUsize,
        delay: Duration,
        fail: bool,
    }

    impl CountingInstaller {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                delay: Duration::ZERO,
                fail: false,
            }
        }
    }

    #[async_trait]
    impl Installer for CountingInstaller {
        async fn install(&self, spec: &DependencySpec, directory: &Path) -> ServiceResult<Manifest> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::fs::write(directory.join("marker"), spec.to_string())
                .await
                .unwrap();
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.fail {
                return Err(ServiceError::PackageNotFound {
                    name: "o-missing".to_string(),
                    range: "^1".to_string(),
                });
            }
            Ok(Manifest::new())
        }

        fn installer_name(&self) -> &'static str {
            "counting"
        }
    }

    fn no_jitter() -> InstallationTtl {
        InstallationTtl {
            pinned: Duration::from_secs(600),
            range: Duration::from_secs(60),
            jitter: Duration::ZERO,
            error: Duration::from_secs(5),
        }
    }

    fn cache_with(
        work_dir: &Path,
        capacity: usize,
        installer: Arc<CountingInstaller>,
        clock: ManualClock,
    ) -> InstallationCache {
        InstallationCache::new(
            work_dir.to_path_buf(),
            NonZeroUsize::new(capacity).unwrap(),
            no_jitter(),
            installer,
            Arc::new(clock),
            Arc::new(TracingMetrics),
        )
    }

    fn spec(modules: &str) -> DependencySpec {
        DependencySpec::parse(modules).unwrap()
    }

    #[test]
    fn pinned_requests_live_longer() {
        let ttl = no_jitter();
        assert_eq!(ttl.ttl_for(&spec("a@1.0.0,b@2.0.0")), Duration::from_secs(600));
        assert_eq!(ttl.ttl_for(&spec("a@1.0.0,b@^2.0.0")), Duration::from_secs(60));
    }

    #[test]
    fn jitter_only_shortens() {
        let ttl = InstallationTtl {
            jitter: Duration::from_secs(10),
            ..no_jitter()
        };
        for _ in 0..100 {
            let value = ttl.ttl_for(&spec("a@^1"));
            assert!(value <= Duration::from_secs(60));
            assert!(value >= Duration::from_secs(50));
        }
    }

    #[test]
    fn jitter_larger_than_ttl_saturates() {
        let ttl = InstallationTtl {
            range: Duration::from_secs(1),
            jitter: Duration::from_secs(3600),
            ..no_jitter()
        };
        assert!(ttl.ttl_for(&spec("a@^1")) <= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_requests_install_once() {
        let work = TempDir::new().unwrap();
        let installer = Arc::new(CountingInstaller {
            delay: Duration::from_millis(100),
            ..CountingInstaller::new()
        });
        let cache = Arc::new(cache_with(work.path(), 4, installer.clone(), ManualClock::new(0)));

        let mut handles = Vec::new();
        for modules in ["a@^1,b@^2", "b@^2,a@^1", "a@^1, b@^2"] {
            let cache = Arc::clone(&cache);
            handles.push(tokio::spawn(async move {
                cache
                    .create_installation(&spec(modules), InstallOptions::default())
                    .await
            }));
        }

        let mut dirs = Vec::new();
        for handle in handles {
            dirs.push(handle.await.unwrap().unwrap().directory().to_path_buf());
        }
        assert_eq!(installer.calls.load(Ordering::SeqCst), 1);
        assert!(dirs.windows(2).all(|w| w[0] == w[1]));
        assert!(dirs[0].join("marker").exists());
    }

    #[tokio::test]
    async fn handle_ttl_matches_policy() {
        let work = TempDir::new().unwrap();
        let clock = ManualClock::new(1_000_000);
        let cache = cache_with(work.path(), 4, Arc::new(CountingInstaller::new()), clock.clone());

        let pinned = cache
            .create_installation(&spec("a@1.0.0"), InstallOptions::default())
            .await
            .unwrap();
        assert_eq!(pinned.ttl(), Duration::from_secs(600));

        clock.advance(Duration::from_secs(100));
        assert_eq!(pinned.remaining_ttl(clock.now_ms()), Duration::from_secs(500));
    }

    #[tokio::test]
    async fn eviction_deletes_directory() {
        let work = TempDir::new().unwrap();
        let cache = cache_with(work.path(), 1, Arc::new(CountingInstaller::new()), ManualClock::new(0));

        let first = cache
            .create_installation(&spec("a@^1"), InstallOptions::default())
            .await
            .unwrap();
        assert!(first.directory().exists());

        cache
            .create_installation(&spec("b@^1"), InstallOptions::default())
            .await
            .unwrap();

        for _ in 0..50 {
            if first.is_destroyed() && !first.directory().exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(first.is_destroyed());
        assert!(!first.directory().exists());
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn installing_entry_survives_capacity_pressure() {
        let work = TempDir::new().unwrap();
        let installer = Arc::new(CountingInstaller {
            delay: Duration::from_millis(100),
            ..CountingInstaller::new()
        });
        let cache = Arc::new(cache_with(work.path(), 1, installer.clone(), ManualClock::new(0)));

        let mut handles = Vec::new();
        for modules in ["a@^1", "b@^1"] {
            let cache = Arc::clone(&cache);
            handles.push(tokio::spawn(async move {
                cache
                    .create_installation(&spec(modules), InstallOptions::default())
                    .await
            }));
            tokio::task::yield_now().await;
        }

        let mut installed = Vec::new();
        for handle in handles {
            installed.push(handle.await.unwrap().unwrap());
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        for handle in &installed {
            assert!(!handle.is_destroyed());
            assert!(handle.directory().join("marker").exists());
        }
        assert_eq!(installer.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failed_install_is_cleaned_up_and_cached() {
        let work = TempDir::new().unwrap();
        let installer = Arc::new(CountingInstaller {
            fail: true,
            ..CountingInstaller::new()
        });
        let cache = cache_with(work.path(), 4, installer.clone(), ManualClock::new(0));

        for _ in 0..3 {
            let err = cache
                .create_installation(&spec("o-missing@^1"), InstallOptions::default())
                .await
                .unwrap_err();
            assert!(matches!(err, ServiceError::PackageNotFound { .. }));
        }

        assert_eq!(installer.calls.load(Ordering::SeqCst), 1);
        let leftovers = std::fs::read_dir(work.path()).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn newer_than_reinstalls_into_fresh_directory() {
        let work = TempDir::new().unwrap();
        let clock = ManualClock::new(0);
        let installer = Arc::new(CountingInstaller::new());
        let cache = cache_with(work.path(), 4, installer.clone(), clock.clone());

        let old = cache
            .create_installation(&spec("a@^1"), InstallOptions::default())
            .await
            .unwrap();
        clock.set(5_000);
        let new = cache
            .create_installation(&spec("a@^1"), InstallOptions { newer_than: Some(5_000) })
            .await
            .unwrap();

        assert_ne!(old.directory(), new.directory());
        assert_eq!(installer.calls.load(Ordering::SeqCst), 2);

        for _ in 0..50 {
            if old.is_destroyed() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(old.is_destroyed());
        assert!(new.directory().exists());
    }

    #[tokio::test]
    async fn teardown_removes_all_directories() {
        let work = TempDir::new().unwrap();
        let cache = cache_with(work.path(), 4, Arc::new(CountingInstaller::new()), ManualClock::new(0));

        cache
            .create_installation(&spec("a@^1"), InstallOptions::default())
            .await
            .unwrap();
        cache
            .create_installation(&spec("b@^1"), InstallOptions::default())
            .await
            .unwrap();

        cache.teardown().await;
        assert!(cache.is_empty());
        assert_eq!(std::fs::read_dir(work.path()).unwrap().count(), 0);
    }
}
