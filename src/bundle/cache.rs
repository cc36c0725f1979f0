//! Bundle cache
//!
//! Keyed by the full bundle identity (dependencies, entry overrides, build
//! options). Each miss obtains an installation from the installation cache
//! and compiles it. An output never outlives the installation it came from.

use crate::bundle::compiler::Compiler;
use crate::bundle::output::Output;
use crate::cache::{AsyncResultCache, Clock, Created, GetMetaOptions, Meta, MetricsSink};
use crate::error::ServiceResult;
use crate::identity::bundle_identity;
use crate::install::{InstallOptions, InstallationCache};
use crate::request::BundleRequest;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Lifetimes for bundle entries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BundleTtl {
    /// Upper bound for any bundle
    pub max: Duration,
    /// Subtracted from the installation's remaining lifetime
    pub safety_margin: Duration,
    pub error: Duration,
}

impl Default for BundleTtl {
    fn default() -> Self {
        Self {
            max: Duration::from_secs(24 * 60 * 60),
            safety_margin: Duration::from_secs(60),
            error: Duration::from_secs(5),
        }
    }
}

/// Cache of compiled outputs keyed by bundle identity
pub struct BundleCache {
    cache: AsyncResultCache<Output>,
    installations: Arc<InstallationCache>,
    compiler: Arc<dyn Compiler>,
    ttl: BundleTtl,
    clock: Arc<dyn Clock>,
}

impl BundleCache {
    pub fn new(
        capacity: NonZeroUsize,
        ttl: BundleTtl,
        installations: Arc<InstallationCache>,
        compiler: Arc<dyn Compiler>,
        clock: Arc<dyn Clock>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        let cache = AsyncResultCache::builder("bundles", capacity)
            .clock(Arc::clone(&clock))
            .metrics(metrics)
            .build();

        Self {
            cache,
            installations,
            compiler,
            ttl,
            clock,
        }
    }

    /// Compiled output for `request`, built at most once per identity
    pub async fn get_bundle(&self, request: &BundleRequest) -> ServiceResult<Meta<Output>> {
        let id = bundle_identity(request);
        let options = GetMetaOptions::new(id.clone(), self.ttl.max)
            .newer_than(request.newer_than)
            .error_time_to_live(self.ttl.error);

        let installations = Arc::clone(&self.installations);
        let compiler = Arc::clone(&self.compiler);
        let clock = Arc::clone(&self.clock);
        let ttl = self.ttl;
        let request = request.clone();

        self.cache
            .get_meta(options, move || async move {
                let installation = installations
                    .create_installation(
                        &request.dependencies,
                        InstallOptions {
                            newer_than: request.newer_than,
                        },
                    )
                    .await?;

                debug!(
                    "Compiling {} ({}) with {}",
                    id,
                    request.options.kind,
                    compiler.compiler_name()
                );
                let body = compiler.compile(&installation, &request).await?;

                let now = clock.now_ms();
                let lifetime = installation
                    .remaining_ttl(now)
                    .saturating_sub(ttl.safety_margin)
                    .min(ttl.max);
                info!(
                    "Compiled {} bytes for {}, valid for {}s",
                    body.len(),
                    request.dependencies,
                    lifetime.as_secs()
                );

                let output = Output::new(body, request.options.kind.mime_type(), now, lifetime);
                Ok(Created::new(output).with_ttl(lifetime))
            })
            .await
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    pub fn installations(&self) -> &Arc<InstallationCache> {
        &self.installations
    }

    /// Drop every cached bundle and every installation behind them
    pub async fn teardown(&self) {
        self.cache.clear().await;
        self.installations.teardown().await;
    }
}
