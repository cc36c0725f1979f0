//! Compiled bundles
//!
//! A bundle is one compiled artifact for a dependency set plus build
//! options. Compilation reuses installations from [`crate::install`].

pub mod cache;
pub mod compiler;
pub mod output;

pub use cache::{BundleCache, BundleTtl};
pub use compiler::{Compiler, ConcatCompiler};
pub use output::Output;
