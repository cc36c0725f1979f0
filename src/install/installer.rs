//! Package installer abstraction
//!
//! The cache only needs "put these packages in this directory and tell me
//! what you installed". [`LocalRegistryInstaller`] does that from a
//! directory registry laid out as `<registry>/<name>/<version>/`.

use crate::error::{ServiceError, ServiceResult};
use crate::install::handle::{InstalledPackage, Manifest};
use crate::request::{Dependency, DependencySpec};
use async_trait::async_trait;
use semver::Version;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

/// Installs a dependency set into a directory
#[async_trait]
pub trait Installer: Send + Sync {
    /// Install every package in `spec` under `directory`.
    ///
    /// Errors (not found, conflicts, IO) are returned unmodified so the
    /// cache can store and replay them.
    async fn install(&self, spec: &DependencySpec, directory: &Path) -> ServiceResult<Manifest>;

    /// Human-readable installer name for logs
    fn installer_name(&self) -> &'static str;
}

/// Subset of `package.json` the installer records
#[derive(Debug, Default, Deserialize)]
struct PackageJson {
    main: Option<String>,
    style: Option<String>,
}

/// Installer backed by a local directory of unpacked package versions
#[derive(Debug, Clone)]
pub struct LocalRegistryInstaller {
    registry: PathBuf,
}

impl LocalRegistryInstaller {
    pub fn new(registry: PathBuf) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Path {
        &self.registry
    }

    /// Highest version in the registry satisfying the dependency's range
    async fn resolve(&self, dep: &Dependency) -> ServiceResult<(Version, PathBuf)> {
        let requirement = dep.requirement()?;
        let package_dir = self.registry.join(&dep.name);

        let mut entries = match fs::read_dir(&package_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ServiceError::PackageNotFound {
                    name: dep.name.clone(),
                    range: dep.range.clone(),
                })
            }
            Err(e) => {
                return Err(ServiceError::io(
                    format!("reading registry {}", package_dir.display()),
                    e,
                ))
            }
        };

        let mut best: Option<(Version, PathBuf)> = None;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| ServiceError::io("reading registry entry", e))?
        {
            let Some(version) = entry
                .file_name()
                .to_str()
                .and_then(|name| Version::parse(name).ok())
            else {
                continue;
            };
            if !requirement.matches(&version) {
                continue;
            }
            if best.as_ref().map_or(true, |(current, _)| version > *current) {
                best = Some((version, entry.path()));
            }
        }

        best.ok_or_else(|| ServiceError::PackageNotFound {
            name: dep.name.clone(),
            range: dep.range.clone(),
        })
    }
}

#[async_trait]
impl Installer for LocalRegistryInstaller {
    async fn install(&self, spec: &DependencySpec, directory: &Path) -> ServiceResult<Manifest> {
        let mut manifest = Manifest::new();

        for dep in spec.dependencies() {
            let (version, source) = self.resolve(dep).await?;
            debug!("Resolved {} to {}", dep.install_key(), version);

            let relative = PathBuf::from("packages").join(&dep.name);
            let target = directory.join(&relative);
            let files = copy_tree(&source, &target).await.map_err(|e| match e {
                ServiceError::Io { context, source } => ServiceError::Install {
                    name: dep.name.clone(),
                    reason: format!("{}: {}", context, source),
                },
                other => other,
            })?;

            let package_json = read_package_json(&target).await?;
            manifest.insert(
                dep.name.clone(),
                InstalledPackage {
                    version: version.to_string(),
                    path: relative,
                    files,
                    source: source.display().to_string(),
                    main: package_json.main,
                    style: package_json.style,
                },
            );
        }

        info!(
            "Installed {} package(s) into {}",
            manifest.len(),
            directory.display()
        );
        Ok(manifest)
    }

    fn installer_name(&self) -> &'static str {
        "local-registry"
    }
}

async fn read_package_json(package_dir: &Path) -> ServiceResult<PackageJson> {
    let path = package_dir.join("package.json");
    match fs::read_to_string(&path).await {
        Ok(content) => serde_json::from_str(&content).map_err(|e| ServiceError::Install {
            name: package_dir.display().to_string(),
            reason: format!("invalid package.json: {}", e),
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(PackageJson::default()),
        Err(e) => Err(ServiceError::io(format!("reading {}", path.display()), e)),
    }
}

/// Copy `from` into `to` recursively, returning copied file paths relative
/// to `to`, sorted
async fn copy_tree(from: &Path, to: &Path) -> ServiceResult<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut pending = vec![PathBuf::new()];

    while let Some(relative) = pending.pop() {
        let source_dir = from.join(&relative);
        let target_dir = to.join(&relative);
        fs::create_dir_all(&target_dir)
            .await
            .map_err(|e| ServiceError::io(format!("creating {}", target_dir.display()), e))?;

        let mut entries = fs::read_dir(&source_dir)
            .await
            .map_err(|e| ServiceError::io(format!("reading {}", source_dir.display()), e))?;

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| ServiceError::io(format!("reading {}", source_dir.display()), e))?
        {
            let file_type = entry
                .file_type()
                .await
                .map_err(|e| ServiceError::io(format!("inspecting {}", entry.path().display()), e))?;
            let child = relative.join(entry.file_name());

            if file_type.is_dir() {
                pending.push(child);
            } else if file_type.is_file() {
                fs::copy(entry.path(), to.join(&child))
                    .await
                    .map_err(|e| ServiceError::io(format!("copying {}", entry.path().display()), e))?;
                files.push(child);
            }
            // Symlinks are skipped so a package cannot reach outside itself
        }
    }

    files.sort();
    Ok(files)
}
