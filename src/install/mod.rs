//! Dependency installations
//!
//! Installing a dependency set is slow and its result is a directory on
//! disk, so installations are cached by dependency identity and deleted
//! when they leave the cache.

pub mod cache;
pub mod handle;
pub mod installer;

pub use cache::{InstallOptions, InstallationCache, InstallationTtl};
pub use handle::{InstallationHandle, InstalledPackage, Manifest};
pub use installer::{Installer, LocalRegistryInstaller};
