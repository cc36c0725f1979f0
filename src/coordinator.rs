//! Bounded-wait build coordination
//!
//! A request races the bundle lookup against a wait budget. When the budget
//! runs out first the client is redirected to retry the same request with an
//! incremented `retry` counter, so no single request is held open longer than
//! the budget. Once the accumulated wait reaches the ceiling the request
//! fails with a build timeout. The build itself keeps running either way.
//!
//! ```text
//! Waiting ──lookup──▶ Served      200 (or 307 to the canonical URL)
//!    │
//!    ├──budget──▶ Redirected      307 ?retry=n+1
//!    ├──budget──▶ Exhausted       504 once (n+1) × budget ≥ ceiling
//!    └──error───▶ Failed          error status
//! ```

use crate::bundle::{BundleCache, Output};
use crate::cache::{Clock, Meta};
use crate::error::{ServiceError, ServiceResult};
use crate::request::BundleRequest;
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Query parameter carrying the redirect counter
pub const RETRY_PARAM: &str = "retry";

const TEXT_PLAIN: &str = "text/plain; charset=utf-8";
const NO_STORE: &str = "no-store";

/// Wait limits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinatorSettings {
    /// How long one request waits before being redirected
    pub wait_budget: Duration,
    /// Total wait across redirects before giving up
    pub ceiling: Duration,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            wait_budget: Duration::from_secs(20),
            ceiling: Duration::from_secs(60),
        }
    }
}

/// An incoming build request: path plus decoded query pairs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildRequest {
    pub path: String,
    pub query: Vec<(String, String)>,
}

impl BuildRequest {
    pub fn new(path: impl Into<String>, query: Vec<(String, String)>) -> Self {
        Self {
            path: path.into(),
            query,
        }
    }

    /// Parse `path?key=value&...`, percent-decoding the query
    pub fn parse(uri: &str) -> ServiceResult<Self> {
        let (path, query) = uri.split_once('?').unwrap_or((uri, ""));
        let query = query
            .split('&')
            .filter(|pair| !pair.is_empty())
            .map(|pair| {
                let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
                Ok((decode_component(key)?, decode_component(value)?))
            })
            .collect::<ServiceResult<Vec<_>>>()?;
        Ok(Self::new(path, query))
    }

    /// Redirect counter carried by the request, if any
    pub fn retry_count(&self) -> ServiceResult<Option<u32>> {
        self.query
            .iter()
            .rev()
            .find(|(key, _)| key == RETRY_PARAM)
            .map(|(_, value)| {
                value.parse::<u32>().map_err(|_| {
                    ServiceError::InvalidRequest(format!(
                        "{} must be a non-negative integer, got '{}'",
                        RETRY_PARAM, value
                    ))
                })
            })
            .transpose()
    }

    /// The same request without a retry counter
    pub fn canonical(&self) -> Self {
        Self {
            path: self.path.clone(),
            query: self
                .query
                .iter()
                .filter(|(key, _)| key != RETRY_PARAM)
                .cloned()
                .collect(),
        }
    }

    /// The same request carrying `retry`
    pub fn with_retry(&self, retry: u32) -> Self {
        let mut next = self.canonical();
        next.query.push((RETRY_PARAM.to_string(), retry.to_string()));
        next
    }

    /// Path and encoded query, suitable for a `Location` header
    pub fn uri(&self) -> String {
        if self.query.is_empty() {
            return self.path.clone();
        }
        let query: Vec<String> = self
            .query
            .iter()
            .map(|(key, value)| format!("{}={}", encode_component(key), encode_component(value)))
            .collect();
        format!("{}?{}", self.path, query.join("&"))
    }
}

impl fmt::Display for BuildRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.uri())
    }
}

/// Terminal state of one request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Served,
    Redirected,
    Exhausted,
    Failed,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Served => write!(f, "served"),
            Self::Redirected => write!(f, "redirected"),
            Self::Exhausted => write!(f, "exhausted"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Response handed back to the transport layer
#[derive(Debug, Clone)]
pub struct BuildResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Arc<[u8]>,
    pub outcome: Outcome,
    /// Error behind a non-2xx, non-redirect response
    pub error: Option<ServiceError>,
}

impl BuildResponse {
    /// First header with `name`, case-insensitive
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn location(&self) -> Option<&str> {
        self.header("Location")
    }

    pub fn is_redirect(&self) -> bool {
        self.status == 307
    }

    fn redirect(location: &BuildRequest, outcome: Outcome) -> Self {
        Self {
            status: 307,
            headers: vec![
                ("Location".to_string(), location.uri()),
                ("Cache-Control".to_string(), NO_STORE.to_string()),
            ],
            body: Arc::from(Vec::new()),
            outcome,
            error: None,
        }
    }

    fn error(err: &ServiceError, outcome: Outcome) -> Self {
        let mut message = err.to_string();
        if let Some(hint) = err.hint() {
            message.push('\n');
            message.push_str(hint);
        }
        message.push('\n');

        Self {
            status: err.status_code(),
            headers: vec![
                ("Content-Type".to_string(), TEXT_PLAIN.to_string()),
                ("Cache-Control".to_string(), NO_STORE.to_string()),
            ],
            body: Arc::from(message.into_bytes()),
            outcome,
            error: Some(err.clone()),
        }
    }
}

/// Races bundle lookups against the wait budget
pub struct BuildCoordinator {
    bundles: Arc<BundleCache>,
    settings: CoordinatorSettings,
    clock: Arc<dyn Clock>,
}

impl BuildCoordinator {
    pub fn new(bundles: Arc<BundleCache>, settings: CoordinatorSettings, clock: Arc<dyn Clock>) -> Self {
        Self {
            bundles,
            settings,
            clock,
        }
    }

    pub fn settings(&self) -> CoordinatorSettings {
        self.settings
    }

    pub fn bundles(&self) -> &Arc<BundleCache> {
        &self.bundles
    }

    pub async fn handle(&self, request: &BuildRequest) -> BuildResponse {
        let parsed = request
            .retry_count()
            .and_then(|retry| Ok((retry, BundleRequest::from_query(&request.query)?)));
        let (retry, bundle_request) = match parsed {
            Ok(parsed) => parsed,
            Err(e) => return self.failed(request, e),
        };

        // Dropping the lookup on timeout only stops waiting; the build runs
        // in its own task and lands in the cache.
        let lookup = self.bundles.get_bundle(&bundle_request);
        match tokio::time::timeout(self.settings.wait_budget, lookup).await {
            Ok(Ok(meta)) => self.served(request, retry, meta),
            Ok(Err(e)) => self.failed(request, e),
            Err(_) => self.timed_out(request, retry.unwrap_or(0)),
        }
    }

    fn served(&self, request: &BuildRequest, retry: Option<u32>, meta: Meta<Output>) -> BuildResponse {
        if retry.is_some() {
            debug!("Build for {} ready, redirecting to canonical URL", request.path);
            return BuildResponse::redirect(&request.canonical(), Outcome::Served);
        }

        let output = meta.result;
        let max_age = output.remaining_ttl(self.clock.now_ms()).as_secs();
        debug!(
            "Serving {} ({} bytes, max-age {}, hits {})",
            request.path,
            output.len(),
            max_age,
            meta.hit_count
        );

        BuildResponse {
            status: 200,
            headers: vec![
                ("Content-Type".to_string(), output.mime_type().to_string()),
                ("Content-Length".to_string(), output.len().to_string()),
                ("Last-Modified".to_string(), http_date(output.created_time())),
                ("Cache-Control".to_string(), format!("public, max-age={}", max_age)),
            ],
            body: output.shared_body(),
            outcome: Outcome::Served,
            error: None,
        }
    }

    fn timed_out(&self, request: &BuildRequest, retry: u32) -> BuildResponse {
        let attempt = retry.saturating_add(1);
        let waited = self.settings.wait_budget.saturating_mul(attempt);

        if waited >= self.settings.ceiling {
            warn!("Build for {} still running after {}s, giving up", request.path, waited.as_secs());
            let err = ServiceError::BuildTimeout {
                waited_secs: waited.as_secs(),
            };
            return BuildResponse::error(&err, Outcome::Exhausted);
        }

        info!(
            "Build for {} still running after {}s, redirecting (attempt {})",
            request.path,
            waited.as_secs(),
            attempt
        );
        BuildResponse::redirect(&request.with_retry(attempt), Outcome::Redirected)
    }

    fn failed(&self, request: &BuildRequest, err: ServiceError) -> BuildResponse {
        match &err {
            ServiceError::Programmer { .. } => error!("{}: {}", request.path, err),
            _ => warn!("{}: {}", request.path, err),
        }
        BuildResponse::error(&err, Outcome::Failed)
    }
}

/// IMF-fixdate for an epoch-ms timestamp
fn http_date(epoch_ms: u64) -> String {
    let time = i64::try_from(epoch_ms)
        .ok()
        .and_then(DateTime::<Utc>::from_timestamp_millis)
        .unwrap_or_default();
    time.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

fn encode_component(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' => out.push(byte as char),
            b'-' | b'_' | b'.' | b'~' | b'@' | b':' | b',' | b'/' => out.push(byte as char),
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

fn decode_component(input: &str) -> ServiceResult<String> {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => out.push(b' '),
            b'%' => {
                let hex = bytes
                    .get(i + 1..i + 3)
                    .filter(|h| h.iter().all(u8::is_ascii_hexdigit))
                    .and_then(|h| std::str::from_utf8(h).ok())
                    .and_then(|h| u8::from_str_radix(h, 16).ok())
                    .ok_or_else(|| {
                        ServiceError::InvalidRequest(format!("Malformed escape in '{}'", input))
                    })?;
                out.push(hex);
                i += 2;
            }
            b => out.push(b),
        }
        i += 1;
    }
    String::from_utf8(out)
        .map_err(|_| ServiceError::InvalidRequest(format!("Query is not valid UTF-8: '{}'", input)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::{BundleTtl, Compiler};
    use crate::cache::{ManualClock, TracingMetrics};
    use crate::install::{InstallationCache, InstallationHandle, InstallationTtl, Installer, Manifest};
    use crate::request::DependencySpec;
    use async_trait::async_trait;
    use std::num::NonZeroUsize;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;
    use tokio::time::Instant;

    const NOW_MS: u64 = 1_000_000;

    struct SlowInstaller {
        delay: Duration,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Installer for SlowInstaller {
        async fn install(&self, spec: &DependencySpec, _directory: &Path) -> ServiceResult<Manifest> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if spec.get("o-missing").is_some() {
                return Err(ServiceError::PackageNotFound {
                    name: "o-missing".to_string(),
                    range: "^1".to_string(),
                });
            }
            Ok(Manifest::new())
        }

        fn installer_name(&self) -> &'static str {
            "slow"
        }
    }

    struct FixedCompiler;

    #[async_trait]
    impl Compiler for FixedCompiler {
        async fn compile(
            &self,
            _installation: &InstallationHandle,
            _request: &BundleRequest,
        ) -> ServiceResult<Vec<u8>> {
            Ok(b"console.log(1);".to_vec())
        }

        fn compiler_name(&self) -> &'static str {
            "fixed"
        }
    }

    struct Harness {
        _work: TempDir,
        installer: Arc<SlowInstaller>,
        coordinator: BuildCoordinator,
    }

    fn harness(build_time: Duration) -> Harness {
        let work = TempDir::new().unwrap();
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(NOW_MS));
        let installer = Arc::new(SlowInstaller {
            delay: build_time,
            calls: AtomicUsize::new(0),
        });

        let installations = Arc::new(InstallationCache::new(
            work.path().to_path_buf(),
            NonZeroUsize::new(4).unwrap(),
            InstallationTtl {
                jitter: Duration::ZERO,
                ..InstallationTtl::default()
            },
            installer.clone(),
            Arc::clone(&clock),
            Arc::new(TracingMetrics),
        ));
        let bundles = Arc::new(BundleCache::new(
            NonZeroUsize::new(4).unwrap(),
            BundleTtl::default(),
            installations,
            Arc::new(FixedCompiler),
            Arc::clone(&clock),
            Arc::new(TracingMetrics),
        ));

        Harness {
            _work: work,
            installer,
            coordinator: BuildCoordinator::new(bundles, CoordinatorSettings::default(), clock),
        }
    }

    fn bundle_uri() -> &'static str {
        "/v2/bundles/js?modules=o-grid%40%5E5,o-fonts@^1"
    }

    #[tokio::test(start_paused = true)]
    async fn redirects_until_ceiling_then_times_out() {
        let h = harness(Duration::from_secs(100));
        let start = Instant::now();

        let first = h.coordinator.handle(&BuildRequest::parse(bundle_uri()).unwrap()).await;
        assert_eq!(first.status, 307);
        assert_eq!(first.outcome, Outcome::Redirected);
        assert_eq!(first.header("cache-control"), Some("no-store"));
        assert_eq!(start.elapsed(), Duration::from_secs(20));

        let second_req = BuildRequest::parse(first.location().unwrap()).unwrap();
        assert_eq!(second_req.retry_count().unwrap(), Some(1));
        let second = h.coordinator.handle(&second_req).await;
        assert_eq!(second.outcome, Outcome::Redirected);
        assert_eq!(start.elapsed(), Duration::from_secs(40));

        let third_req = BuildRequest::parse(second.location().unwrap()).unwrap();
        assert_eq!(third_req.retry_count().unwrap(), Some(2));
        let third = h.coordinator.handle(&third_req).await;
        assert_eq!(third.status, 504);
        assert_eq!(third.outcome, Outcome::Exhausted);
        assert!(third.error.as_ref().is_some_and(ServiceError::is_timeout));
        assert_eq!(start.elapsed(), Duration::from_secs(60));
        assert!(String::from_utf8_lossy(&third.body).contains("60s"));

        // One build for the whole chain
        assert_eq!(h.installer.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn follow_up_is_served_after_canonical_redirect() {
        let h = harness(Duration::from_secs(22));
        let start = Instant::now();

        let first = h.coordinator.handle(&BuildRequest::parse(bundle_uri()).unwrap()).await;
        assert_eq!(first.outcome, Outcome::Redirected);

        let retry = BuildRequest::parse(first.location().unwrap()).unwrap();
        let second = h.coordinator.handle(&retry).await;
        assert_eq!(second.status, 307);
        assert_eq!(second.outcome, Outcome::Served);
        assert_eq!(start.elapsed(), Duration::from_secs(22));

        let canonical = BuildRequest::parse(second.location().unwrap()).unwrap();
        assert_eq!(canonical.retry_count().unwrap(), None);
        assert_eq!(canonical, BuildRequest::parse(bundle_uri()).unwrap());

        let served = h.coordinator.handle(&canonical).await;
        assert_eq!(served.status, 200);
        assert_eq!(&*served.body, b"console.log(1);");
        assert_eq!(
            served.header("Content-Type"),
            Some("application/javascript; charset=utf-8")
        );
        assert_eq!(served.header("Last-Modified"), Some("Thu, 01 Jan 1970 00:16:40 GMT"));
        // One-hour range installation minus the 60s margin
        assert_eq!(served.header("Cache-Control"), Some("public, max-age=3540"));
        assert_eq!(start.elapsed(), Duration::from_secs(22));
        assert_eq!(h.installer.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn fast_build_is_served_directly() {
        let h = harness(Duration::from_secs(1));
        let response = h.coordinator.handle(&BuildRequest::parse(bundle_uri()).unwrap()).await;
        assert_eq!(response.status, 200);
        assert_eq!(response.outcome, Outcome::Served);
        assert!(response.location().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn build_errors_surface_immediately() {
        let h = harness(Duration::from_secs(1));
        let start = Instant::now();
        let response = h
            .coordinator
            .handle(&BuildRequest::parse("/bundle?modules=o-missing@^1").unwrap())
            .await;

        assert_eq!(response.status, 404);
        assert_eq!(response.outcome, Outcome::Failed);
        assert_eq!(start.elapsed(), Duration::from_secs(1));
        assert!(String::from_utf8_lossy(&response.body).starts_with("Package not found: o-missing@^1"));
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_requests_are_rejected() {
        let h = harness(Duration::from_secs(1));

        for uri in [
            "/bundle",
            "/bundle?modules=",
            "/bundle?modules=o-grid@^5&type=wasm",
            "/bundle?modules=o-grid@^5&retry=abc",
            "/bundle?modules=o-grid@^5,o-grid@^6",
        ] {
            let response = h.coordinator.handle(&BuildRequest::parse(uri).unwrap()).await;
            assert_eq!(response.outcome, Outcome::Failed, "{}", uri);
            assert!(matches!(response.status, 400 | 409), "{}: {}", uri, response.status);
        }
        assert_eq!(h.installer.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn request_uri_round_trip() {
        let request = BuildRequest::parse("/b?modules=@ft/o-icons@%5E2:main.css&brand=core").unwrap();
        assert_eq!(request.query[0].1, "@ft/o-icons@^2:main.css");
        assert_eq!(request.uri(), "/b?modules=@ft/o-icons@%5E2:main.css&brand=core");

        let retried = request.with_retry(3);
        assert_eq!(retried.retry_count().unwrap(), Some(3));
        assert_eq!(retried.with_retry(4).retry_count().unwrap(), Some(4));
        assert_eq!(retried.canonical(), request);
    }

    #[test]
    fn malformed_escapes_are_invalid() {
        assert!(BuildRequest::parse("/b?modules=%ZZ").is_err());
        assert!(BuildRequest::parse("/b?modules=%E").is_err());
        assert!(BuildRequest::parse("/b?modules=%+1").is_err());
        assert!(BuildRequest::parse("/b?modules=%-1").is_err());
    }

    #[test]
    fn http_date_format() {
        assert_eq!(http_date(0), "Thu, 01 Jan 1970 00:00:00 GMT");
        assert_eq!(http_date(1_700_000_000_000), "Tue, 14 Nov 2023 22:13:20 GMT");
    }
}
