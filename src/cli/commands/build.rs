//! Build command - compile a bundle through the coordinator

use crate::bundle::{BundleCache, ConcatCompiler};
use crate::cache::{Clock, CountingMetrics, SystemClock};
use crate::cli::args::BuildArgs;
use crate::config::Config;
use crate::coordinator::{BuildCoordinator, BuildRequest, BuildResponse, Outcome};
use crate::error::{ServiceError, ServiceResult};
use crate::install::{InstallationCache, LocalRegistryInstaller};
use crate::ui::{self, BuildSpinner, UiContext};
use std::path::Path;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

const BUNDLE_PATH: &str = "/bundle";

/// More hops than a full redirect chain can produce
const MAX_REDIRECTS: usize = 16;

/// Execute the build command
pub async fn execute(args: BuildArgs, config: &Config) -> ServiceResult<()> {
    let ctx = UiContext::detect();
    let registry = args
        .registry
        .clone()
        .unwrap_or_else(|| config.installation.registry.clone());
    let metrics = Arc::new(CountingMetrics::new());
    let coordinator = create_coordinator(config, &registry, Arc::clone(&metrics));

    let request = BuildRequest::new(BUNDLE_PATH, args.query());
    let spinner = BuildSpinner::start(&ctx, &args.modules);
    let result = follow(&coordinator, request, &spinner).await;
    spinner.finish();

    // One-shot process: nothing outlives the command
    coordinator.bundles().teardown().await;
    for (cache, event, count) in metrics.snapshot() {
        info!("{} {}: {}", cache, event, count);
    }

    let response = result?;
    write_output(&ctx, &response, args.output.as_deref()).await
}

/// Wire the caches and coordinator from configuration
fn create_coordinator(
    config: &Config,
    registry: &Path,
    metrics: Arc<CountingMetrics>,
) -> BuildCoordinator {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let installations = Arc::new(InstallationCache::new(
        config.installation.work_dir.clone(),
        config.installation.capacity(),
        config.installation.ttl(),
        Arc::new(LocalRegistryInstaller::new(registry.to_path_buf())),
        Arc::clone(&clock),
        metrics.clone(),
    ));
    let bundles = Arc::new(BundleCache::new(
        config.bundle.capacity(),
        config.bundle.ttl(),
        installations,
        Arc::new(ConcatCompiler),
        Arc::clone(&clock),
        metrics,
    ));

    BuildCoordinator::new(bundles, config.coordinator.settings(), clock)
}

/// Issue `request`, following redirects like an HTTP client
async fn follow(
    coordinator: &BuildCoordinator,
    mut request: BuildRequest,
    spinner: &BuildSpinner,
) -> ServiceResult<BuildResponse> {
    for _ in 0..MAX_REDIRECTS {
        let response = coordinator.handle(&request).await;
        debug!("{} -> {} ({})", request, response.status, response.outcome);

        match response.outcome {
            Outcome::Served if !response.is_redirect() => return Ok(response),
            Outcome::Served | Outcome::Redirected => {
                let location = response.location().ok_or_else(|| {
                    ServiceError::Internal(format!("{} redirect without Location", response.status))
                })?;
                request = BuildRequest::parse(location)?;
                if let Some(attempt) = request.retry_count()? {
                    spinner.redirected(attempt);
                }
            }
            Outcome::Exhausted | Outcome::Failed => {
                return Err(response.error.unwrap_or_else(|| {
                    ServiceError::Internal(format!("build failed with status {}", response.status))
                }))
            }
        }
    }

    Err(ServiceError::Internal(format!(
        "gave up after {} redirects",
        MAX_REDIRECTS
    )))
}

async fn write_output(ctx: &UiContext, response: &BuildResponse, output: Option<&Path>) -> ServiceResult<()> {
    match output {
        Some(path) => {
            tokio::fs::write(path, &response.body)
                .await
                .map_err(|e| ServiceError::io(format!("writing bundle to {}", path.display()), e))?;
            ui::step_ok_detail(
                ctx,
                &format!("Wrote {} bytes", response.body.len()),
                &path.display().to_string(),
            );
            if let Some(cache_control) = response.header("Cache-Control") {
                ui::key_value(ctx, "Cache-Control", cache_control);
            }
        }
        None => {
            let mut stdout = tokio::io::stdout();
            stdout
                .write_all(&response.body)
                .await
                .map_err(|e| ServiceError::io("writing bundle to stdout", e))?;
            stdout
                .flush()
                .await
                .map_err(|e| ServiceError::io("flushing stdout", e))?;
        }
    }
    Ok(())
}
