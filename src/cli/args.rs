//! CLI argument definitions using clap derive

use crate::request::BundleKind;
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// bundle-service - coalescing build cache for front-end bundles
///
/// Installs dependency sets from a local registry, compiles them into a
/// single bundle, and caches both steps.
#[derive(Parser, Debug)]
#[command(name = "bundle-service")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Configuration file path
    #[arg(short, long, global = true, env = "BUNDLE_SERVICE_CONFIG")]
    pub config: Option<PathBuf>,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Build a bundle
    Build(BuildArgs),

    /// Show or initialize configuration
    Config(ConfigArgs),
}

/// Bundle type accepted on the command line
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum KindArg {
    Js,
    Css,
}

impl From<KindArg> for BundleKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Js => BundleKind::Js,
            KindArg::Css => BundleKind::Css,
        }
    }
}

/// Arguments for the build command
#[derive(Parser, Debug)]
pub struct BuildArgs {
    /// Comma-separated dependencies, e.g. "o-grid@^5,o-fonts@1.2.3:main.scss"
    #[arg(short, long)]
    pub modules: String,

    /// Bundle type
    #[arg(short = 't', long = "type", value_enum, default_value = "js")]
    pub kind: KindArg,

    /// Keep comments and blank lines
    #[arg(long)]
    pub no_minify: bool,

    /// Include feature polyfills (JS only)
    #[arg(long)]
    pub polyfill: bool,

    /// Global name for the JS bundle
    #[arg(long, value_name = "NAME")]
    pub export: Option<String>,

    /// Brand variant (CSS only)
    #[arg(long, value_name = "NAME")]
    pub brand: Option<String>,

    /// Reject cached results created before this epoch-ms timestamp
    #[arg(long, value_name = "MS")]
    pub newer_than: Option<u64>,

    /// Package registry directory (default: from config)
    #[arg(long, value_name = "DIR")]
    pub registry: Option<PathBuf>,

    /// Write the bundle to a file instead of stdout
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,
}

impl BuildArgs {
    /// Query pairs equivalent to these arguments
    pub fn query(&self) -> Vec<(String, String)> {
        let kind = BundleKind::from(self.kind);
        let mut query = vec![
            ("modules".to_string(), self.modules.clone()),
            ("type".to_string(), kind.to_string()),
            ("minify".to_string(), if self.no_minify { "off" } else { "on" }.to_string()),
        ];
        if self.polyfill {
            query.push(("polyfill".to_string(), "on".to_string()));
        }
        if let Some(export) = &self.export {
            query.push(("export".to_string(), export.clone()));
        }
        if let Some(brand) = &self.brand {
            query.push(("brand".to_string(), brand.clone()));
        }
        if let Some(newer_than) = self.newer_than {
            query.push(("newerThan".to_string(), newer_than.to_string()));
        }
        query
    }
}

/// Arguments for the config command
#[derive(Parser, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub action: Option<ConfigAction>,
}

/// Config subcommands
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show current configuration
    Show,

    /// Show configuration file path
    Path,

    /// Initialize default configuration
    Init {
        /// Overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },
}
