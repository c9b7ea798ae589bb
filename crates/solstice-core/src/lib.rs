//! Solstice core library: incremental Solidity builds.
//!
//! The crate tracks the `.sol` sources of a project, groups them into build
//! units by their import graph, and recompiles only the units holding a
//! changed source. Compiler binaries are downloaded on demand into a shared
//! cache; compiled contracts land in an in-memory store that is persisted
//! as a JSON snapshot between runs.
//!
//! ```no_run
//! use solstice_core::{Project, ProjectConfig};
//!
//! let config = ProjectConfig::load(std::path::Path::new("solstice.toml"))?;
//! let report = Project::open(config)?.compile()?;
//! for failure in &report.errors {
//!     eprintln!("{failure}");
//! }
//! # Ok::<(), solstice_core::SolsticeError>(())
//! ```

pub mod artifacts;
pub mod config;
pub mod errors;
pub mod indexer;
pub mod models;
pub mod stdlib;
pub mod store;
pub mod toolchain;

pub use config::ProjectConfig;
pub use errors::{SolsticeError, SolsticeResult};
pub use indexer::pipeline::{BuildReport, CompiledUnit, ComponentError, Project};
pub use models::{Contract, Source};
