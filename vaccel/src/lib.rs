//! Acceleration-dispatch runtime with pluggable backends.
//!
//! `vaccel` connects client code submitting named compute operations (image
//! inference, BLAS kernels, arbitrary dynamically loaded functions) to
//! registered backend plugins: CPU software, GPU, FPGA, or a remote host
//! behind a VirtIO transport. The runtime is not the accelerator; it is the
//! dispatch, lifecycle, and resource-sharing fabric in between.
//!
//! # Quick start
//!
//! ```no_run
//! use vaccel::{Resource, ResourceType, Session, ops, plugin};
//!
//! vaccel::bootstrap().expect("runtime init failed");
//!
//! let sess = Session::new(plugin::hint::DEBUG).expect("session init failed");
//! let model = Resource::new("/models/saved_model", ResourceType::Model)
//!     .expect("resource init failed");
//! model.register(&sess).expect("resource registration failed");
//!
//! ops::noop::noop(&sess).expect("dispatch failed");
//!
//! model.unregister(&sess).expect("unregister failed");
//! model.release().expect("release failed");
//! ```
//!
//! Plugins are shared libraries exporting the frozen `vaccel_plugin`
//! descriptor symbol; they are loaded explicitly ([`plugin::load`]) or at
//! bootstrap through the `VACCEL_PLUGINS` environment variable.

pub mod arg;
pub mod blob;
pub mod config;
mod error;
pub mod fs;
pub mod id_pool;
pub mod net;
pub mod ops;
pub mod plugin;
pub mod profiling;
pub mod resource;
mod runtime;
pub mod session;

pub use arg::{Arg, ArgArray, ArgType};
pub use blob::{Blob, BlobKind};
pub use config::{Config, LogLevel};
pub use error::{Error, Result};
pub use id_pool::{Id, IdPool};
pub use ops::{OpType, genop};
pub use resource::{Resource, ResourceType};
pub use runtime::{
    active_config, bootstrap, bootstrap_with_config, cleanup, is_initialized, rundir,
};
pub use session::Session;
