//! Content-addressed cache keys
//!
//! Keys are derived from the semantic content of a request, never from its
//! spelling: the dependency set is canonicalized (sorted, deduplicated)
//! before hashing, so `a,b` and `b,a` coalesce into one build. Every key is
//! lowercase hex of a truncated SHA-256 digest, which keeps it bounded in
//! length and safe as a file name.

use crate::request::{BuildOptions, BundleRequest, DependencySpec};
use sha2::{Digest, Sha256};

/// Hex characters kept from each digest (16 bytes)
pub const KEY_HEX_LEN: usize = 32;

/// Override identity used when no dependency overrides its entry file
pub const NO_OVERRIDES: &str = "none";

/// Hash canonical text, returning the first `KEY_HEX_LEN` hex chars
fn digest(canonical: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    let result = hasher.finalize();
    hex::encode(&result[..KEY_HEX_LEN / 2])
}

/// Identity of what gets installed: the sorted `name@range` pairs.
///
/// Entry-file overrides are excluded: requests that differ only in
/// overrides share one installation.
pub fn dependency_identity(spec: &DependencySpec) -> String {
    let canonical: Vec<String> = spec
        .dependencies()
        .iter()
        .map(|dep| dep.install_key())
        .collect();
    digest(&canonical.join("\n"))
}

/// Identity of the per-package entry-file overrides
pub fn override_identity(spec: &DependencySpec) -> String {
    let overrides: Vec<String> = spec
        .dependencies()
        .iter()
        .filter_map(|dep| dep.entry.as_ref().map(|entry| format!("{}:{}", dep.name, entry)))
        .collect();

    if overrides.is_empty() {
        NO_OVERRIDES.to_string()
    } else {
        digest(&overrides.join("\n"))
    }
}

/// Fingerprint of every option that affects output bytes
pub fn options_fingerprint(options: &BuildOptions) -> String {
    let canonical = format!(
        "kind={}\nminify={}\npolyfill={}\nexport={}\nbrand={}",
        options.kind,
        options.minify,
        options.polyfill,
        options.export_name,
        options.brand.as_deref().unwrap_or(""),
    );
    digest(&canonical)
}

/// Full bundle cache key: dependencies, overrides, and options
pub fn bundle_identity(request: &BundleRequest) -> String {
    format!(
        "{}-{}-{}",
        dependency_identity(&request.dependencies),
        override_identity(&request.dependencies),
        options_fingerprint(&request.options)
    )
}
