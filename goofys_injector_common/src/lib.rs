//! Code shared between the goofys injector webhook and its tools.

#![warn(missing_docs)]

pub use json_patch;
pub use k8s_openapi;
pub use kube;
pub use serde_json;
pub use tracing;

pub mod config;
pub mod errors;
pub mod instances;
pub mod mutate;
pub mod patch;
pub mod policy;
pub mod tracing_support;
pub mod vault;

/// Common imports used by many modules.
pub mod prelude {
    pub use anyhow::{format_err, Context as _};
    pub use serde::{Deserialize, Serialize};
    pub use std::{
        collections::BTreeMap,
        fmt,
        path::{Path, PathBuf},
        sync::Arc,
    };
    pub use tracing::{debug, error, info, trace, warn};

    pub use super::config::{Config, MountMode};
    pub use super::instances::{Instance, InstanceRegistry};
    pub use super::{Error, Result};
}

/// Error type for this crate's functions.
pub use anyhow::Error;

/// Result type for this crate's functions.
pub use anyhow::Result;

/// The version of `goofys_injector_common` in use.
pub fn goofys_injector_common_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
