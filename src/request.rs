//! Typed build requests
//!
//! A request names a set of packages (`name@range`, optionally with a
//! `:path` override of the entry file) and the options that shape the
//! compiled output. Query parameters are parsed here into a
//! [`BundleRequest`]; anything malformed is an `InvalidRequest`.

use crate::error::{ServiceError, ServiceResult};
use semver::{Version, VersionReq};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Query parameter carrying the module list
pub const MODULES_PARAM: &str = "modules";

/// Default global name a JS bundle is exported under
pub const DEFAULT_EXPORT_NAME: &str = "Origami";

/// One requested package
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Dependency {
    pub name: String,
    /// Semver range or exact version, as requested
    pub range: String,
    /// File inside the package to use instead of its declared entry point
    pub entry: Option<String>,
}

impl Dependency {
    /// Parse `name@range` or `name@range:path/to/file`
    pub fn parse(input: &str) -> ServiceResult<Self> {
        let input = input.trim();
        // Scoped names start with '@', so the version separator is the next one
        let at = if let Some(rest) = input.strip_prefix('@') {
            rest.find('@').map(|i| i + 1)
        } else {
            input.find('@')
        };

        let (name, rest) = match at {
            Some(i) => (&input[..i], &input[i + 1..]),
            None => (input, "*"),
        };

        let (range, entry) = match rest.split_once(':') {
            Some((range, entry)) => (range, Some(entry)),
            None => (rest, None),
        };

        validate_package_name(name)?;
        let range = if range.is_empty() { "*" } else { range };
        VersionReq::parse(range).map_err(|e| {
            ServiceError::InvalidRequest(format!("Invalid version '{}' for {}: {}", range, name, e))
        })?;
        if let Some(entry) = entry {
            validate_entry_path(entry)?;
        }

        Ok(Self {
            name: name.to_string(),
            range: range.to_string(),
            entry: entry.map(str::to_string),
        })
    }

    /// Whether the range names exactly one version
    pub fn is_pinned(&self) -> bool {
        let exact = self.range.strip_prefix('=').unwrap_or(&self.range);
        Version::parse(exact.trim()).is_ok()
    }

    /// Parsed version requirement. A bare version matches only itself.
    pub fn requirement(&self) -> ServiceResult<VersionReq> {
        let range = if self.is_pinned() && !self.range.starts_with('=') {
            format!("={}", self.range.trim())
        } else {
            self.range.clone()
        };
        VersionReq::parse(&range).map_err(|e| {
            ServiceError::InvalidRequest(format!(
                "Invalid version '{}' for {}: {}",
                self.range, self.name, e
            ))
        })
    }

    /// `name@range`, the part that determines what gets installed
    pub fn install_key(&self) -> String {
        format!("{}@{}", self.name, self.range)
    }
}

impl fmt::Display for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.entry {
            Some(entry) => write!(f, "{}@{}:{}", self.name, self.range, entry),
            None => write!(f, "{}@{}", self.name, self.range),
        }
    }
}

fn validate_package_name(name: &str) -> ServiceResult<()> {
    if name.is_empty() {
        return Err(ServiceError::InvalidRequest(
            "Package name cannot be empty".to_string(),
        ));
    }
    if name.len() > 214 {
        return Err(ServiceError::InvalidRequest(format!(
            "Package name '{}...' is too long",
            name.chars().take(32).collect::<String>()
        )));
    }
    if name.contains("..") || name.contains('\\') {
        return Err(ServiceError::InvalidRequest(format!(
            "Invalid package name '{}': must not contain '..' or '\\'",
            name
        )));
    }

    let bare = match name.strip_prefix('@') {
        Some(scoped) => match scoped.split_once('/') {
            Some((scope, bare)) if !scope.is_empty() && !bare.contains('/') => {
                check_name_chars(name, scope)?;
                bare
            }
            _ => {
                return Err(ServiceError::InvalidRequest(format!(
                    "Invalid scoped package name '{}'",
                    name
                )))
            }
        },
        None => name,
    };
    check_name_chars(name, bare)
}

fn check_name_chars(full: &str, part: &str) -> ServiceResult<()> {
    let valid = !part.is_empty()
        && !part.starts_with('.')
        && part
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(ServiceError::InvalidRequest(format!(
            "Invalid package name '{}': must contain only lowercase letters, digits, '-', '_' or '.'",
            full
        )))
    }
}

fn validate_entry_path(entry: &str) -> ServiceResult<()> {
    if entry.is_empty()
        || entry.starts_with('/')
        || entry.contains('\\')
        || entry.split('/').any(|segment| segment == ".." || segment.is_empty())
    {
        return Err(ServiceError::InvalidRequest(format!(
            "Invalid entry path '{}': must be a relative path inside the package",
            entry
        )));
    }
    Ok(())
}

/// Canonical, order-independent set of requested packages
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DependencySpec {
    dependencies: Vec<Dependency>,
}

impl DependencySpec {
    /// Build a spec, sorting by name and rejecting conflicting duplicates
    pub fn new(dependencies: Vec<Dependency>) -> ServiceResult<Self> {
        if dependencies.is_empty() {
            return Err(ServiceError::InvalidRequest(
                "At least one module is required".to_string(),
            ));
        }

        let mut by_name: BTreeMap<String, Dependency> = BTreeMap::new();
        for dep in dependencies {
            match by_name.get(&dep.name) {
                Some(existing) if existing == &dep => {}
                Some(existing) => {
                    return Err(ServiceError::VersionConflict {
                        name: dep.name.clone(),
                        reason: format!("requested as both '{}' and '{}'", existing, dep),
                    })
                }
                None => {
                    by_name.insert(dep.name.clone(), dep);
                }
            }
        }

        Ok(Self {
            dependencies: by_name.into_values().collect(),
        })
    }

    /// Parse a comma-separated module list
    pub fn parse(modules: &str) -> ServiceResult<Self> {
        let dependencies = modules
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(Dependency::parse)
            .collect::<ServiceResult<Vec<_>>>()?;
        Self::new(dependencies)
    }

    /// Dependencies sorted by name
    pub fn dependencies(&self) -> &[Dependency] {
        &self.dependencies
    }

    /// Whether every dependency is an exact version
    pub fn is_pinned(&self) -> bool {
        self.dependencies.iter().all(Dependency::is_pinned)
    }

    pub fn get(&self, name: &str) -> Option<&Dependency> {
        self.dependencies.iter().find(|d| d.name == name)
    }
}

impl fmt::Display for DependencySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.dependencies.iter().map(ToString::to_string).collect();
        write!(f, "{}", parts.join(","))
    }
}

/// Kind of artifact to compile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BundleKind {
    Js,
    Css,
}

impl BundleKind {
    pub fn mime_type(&self) -> &'static str {
        match self {
            Self::Js => "application/javascript; charset=utf-8",
            Self::Css => "text/css; charset=utf-8",
        }
    }

    /// Source file extensions the compiler collects for this kind
    pub fn source_extensions(&self) -> &'static [&'static str] {
        match self {
            Self::Js => &["js", "mjs"],
            Self::Css => &["css", "scss"],
        }
    }
}

impl fmt::Display for BundleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Js => write!(f, "js"),
            Self::Css => write!(f, "css"),
        }
    }
}

impl FromStr for BundleKind {
    type Err = ServiceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "js" => Ok(Self::Js),
            "css" => Ok(Self::Css),
            other => Err(ServiceError::InvalidRequest(format!(
                "Unknown bundle type '{}': expected js or css",
                other
            ))),
        }
    }
}

/// Options that change the bytes of the compiled output
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BuildOptions {
    pub kind: BundleKind,
    pub minify: bool,
    /// Ask the compiler to include feature polyfills (JS only)
    pub polyfill: bool,
    /// Global name for the JS bundle
    pub export_name: String,
    /// Brand variant for CSS bundles
    pub brand: Option<String>,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            kind: BundleKind::Js,
            minify: true,
            polyfill: false,
            export_name: DEFAULT_EXPORT_NAME.to_string(),
            brand: None,
        }
    }
}

/// A fully validated request for one bundle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleRequest {
    pub dependencies: DependencySpec,
    pub options: BuildOptions,
    /// Epoch-ms freshness floor for both installation and bundle
    pub newer_than: Option<u64>,
}

impl BundleRequest {
    pub fn new(dependencies: DependencySpec, options: BuildOptions) -> Self {
        Self {
            dependencies,
            options,
            newer_than: None,
        }
    }

    /// Parse decoded query parameters. Unknown keys are ignored.
    pub fn from_query(query: &[(String, String)]) -> ServiceResult<Self> {
        let mut modules = None;
        let mut options = BuildOptions::default();
        let mut newer_than = None;

        for (key, value) in query {
            match key.as_str() {
                MODULES_PARAM => modules = Some(value.as_str()),
                "type" => options.kind = value.parse()?,
                "minify" => options.minify = parse_switch(key, value)?,
                "polyfill" => options.polyfill = parse_switch(key, value)?,
                "export" => {
                    validate_export_name(value)?;
                    options.export_name = value.clone();
                }
                "brand" => {
                    validate_brand(value)?;
                    options.brand = Some(value.clone());
                }
                "newerThan" => {
                    newer_than = Some(value.parse::<u64>().map_err(|_| {
                        ServiceError::InvalidRequest(format!(
                            "newerThan must be an epoch timestamp in milliseconds, got '{}'",
                            value
                        ))
                    })?)
                }
                _ => {}
            }
        }

        let modules = modules.ok_or_else(|| {
            ServiceError::InvalidRequest(format!("The {} parameter is required", MODULES_PARAM))
        })?;

        Ok(Self {
            dependencies: DependencySpec::parse(modules)?,
            options,
            newer_than,
        })
    }
}

fn parse_switch(key: &str, value: &str) -> ServiceResult<bool> {
    match value {
        "on" | "true" | "1" => Ok(true),
        "off" | "false" | "0" => Ok(false),
        _ => Err(ServiceError::InvalidRequest(format!(
            "{} must be 'on' or 'off', got '{}'",
            key, value
        ))),
    }
}

fn validate_export_name(name: &str) -> ServiceResult<()> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_' || c == '$');
    if valid_start && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$') {
        Ok(())
    } else {
        Err(ServiceError::InvalidRequest(format!(
            "Invalid export name '{}': must be a JavaScript identifier",
            name
        )))
    }
}

fn validate_brand(brand: &str) -> ServiceResult<()> {
    if !brand.is_empty() && brand.chars().all(|c| c.is_ascii_lowercase() || c == '-') {
        Ok(())
    } else {
        Err(ServiceError::InvalidRequest(format!(
            "Invalid brand '{}': must contain only lowercase letters or '-'",
            brand
        )))
    }
}
