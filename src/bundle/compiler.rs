//! Compiler abstraction
//!
//! Compilation is an external concern; the cache only needs bytes back or a
//! [`ServiceError::Compile`]. [`ConcatCompiler`] is a minimal stand-in that
//! stitches each package's entry file into one bundle.

use crate::error::{ServiceError, ServiceResult};
use crate::install::handle::{InstallationHandle, InstalledPackage};
use crate::request::{BundleKind, BundleRequest, Dependency};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Turns an installation into a bundle
#[async_trait]
pub trait Compiler: Send + Sync {
    async fn compile(
        &self,
        installation: &InstallationHandle,
        request: &BundleRequest,
    ) -> ServiceResult<Vec<u8>>;

    /// Human-readable compiler name for logs
    fn compiler_name(&self) -> &'static str;
}

const GLOBAL_THIS_POLYFILL: &str =
    "if (typeof globalThis === \"undefined\") { window.globalThis = window; }";

/// Concatenates package entry files, wrapping JS modules under an export name
#[derive(Debug, Default, Clone, Copy)]
pub struct ConcatCompiler;

impl ConcatCompiler {
    /// Entry file for `dep` in this bundle kind, if the package has one
    fn entry_for(
        installation: &InstallationHandle,
        dep: &Dependency,
        package: &InstalledPackage,
        kind: BundleKind,
    ) -> ServiceResult<Option<PathBuf>> {
        let package_dir = installation
            .package_dir(&dep.name)
            .unwrap_or_else(|| installation.directory().join(&package.path));

        if let Some(entry) = &dep.entry {
            let has_kind = kind
                .source_extensions()
                .iter()
                .any(|ext| entry.ends_with(&format!(".{}", ext)));
            if !has_kind {
                return Ok(None);
            }
            if !package.files.iter().any(|f| f.as_path() == Path::new(entry)) {
                return Err(ServiceError::compile(format!(
                    "{}: entry file '{}' does not exist",
                    dep.name, entry
                )));
            }
            return Ok(Some(package_dir.join(entry)));
        }

        let declared = match kind {
            BundleKind::Js => package.main.as_deref(),
            BundleKind::Css => package.style.as_deref(),
        };
        let defaults: &[&str] = match kind {
            BundleKind::Js => &["main.js", "index.js"],
            BundleKind::Css => &["main.css", "main.scss"],
        };

        Ok(declared
            .into_iter()
            .chain(defaults.iter().copied())
            .find(|candidate| package.files.iter().any(|f| f.as_path() == Path::new(candidate)))
            .map(|found| package_dir.join(found)))
    }
}

#[async_trait]
impl Compiler for ConcatCompiler {
    async fn compile(
        &self,
        installation: &InstallationHandle,
        request: &BundleRequest,
    ) -> ServiceResult<Vec<u8>> {
        let options = &request.options;
        let mut out = String::new();

        if options.kind == BundleKind::Js {
            if options.polyfill {
                out.push_str(GLOBAL_THIS_POLYFILL);
                out.push('\n');
            }
            out.push_str(&format!(
                "var {0} = typeof {0} === \"undefined\" ? {{}} : {0};\n",
                options.export_name
            ));
        }
        if let (BundleKind::Css, Some(brand)) = (options.kind, &options.brand) {
            out.push_str(&format!(":root {{ --o-brand: \"{}\"; }}\n", brand));
        }

        for dep in request.dependencies.dependencies() {
            let package = installation.manifest().get(&dep.name).ok_or_else(|| {
                ServiceError::compile(format!("{} is not part of the installation", dep.name))
            })?;

            let Some(entry) = Self::entry_for(installation, dep, package, options.kind)? else {
                debug!("{} has no {} entry, skipping", dep.name, options.kind);
                continue;
            };

            let source = tokio::fs::read_to_string(&entry).await.map_err(|e| {
                ServiceError::compile(format!("{}: cannot read {}: {}", dep.name, entry.display(), e))
            })?;
            check_balanced(&dep.name, &source)?;

            if !options.minify {
                out.push_str(&format!("/* {}@{} */\n", dep.name, package.version));
            }
            match options.kind {
                BundleKind::Js => out.push_str(&format!(
                    "{}[\"{}\"] = (function () {{\n{}\n}})();\n",
                    options.export_name, dep.name, source.trim_end()
                )),
                BundleKind::Css => {
                    out.push_str(source.trim_end());
                    out.push('\n');
                }
            }
        }

        let out = if options.minify { minify(&out) } else { out };
        Ok(out.into_bytes())
    }

    fn compiler_name(&self) -> &'static str {
        "concat"
    }
}

/// Reject sources whose braces or parentheses do not pair up
fn check_balanced(name: &str, source: &str) -> ServiceResult<()> {
    let mut stack = Vec::new();
    for (line_no, line) in source.lines().enumerate() {
        for c in line.chars() {
            match c {
                '{' | '(' | '[' => stack.push(c),
                '}' | ')' | ']' => {
                    let expected = match c {
                        '}' => '{',
                        ')' => '(',
                        _ => '[',
                    };
                    if stack.pop() != Some(expected) {
                        return Err(ServiceError::compile(format!(
                            "{}: unexpected '{}' on line {}",
                            name,
                            c,
                            line_no + 1
                        )));
                    }
                }
                _ => {}
            }
        }
    }
    match stack.last() {
        Some(open) => Err(ServiceError::compile(format!("{}: unclosed '{}'", name, open))),
        None => Ok(()),
    }
}

/// Trim lines and drop blank and line-comment lines
fn minify(source: &str) -> String {
    source
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with("//"))
        .collect::<Vec<_>>()
        .join("\n")
}
