//! Host side of the hookbridge boundary.
//!
//! Sandboxed hook modules reach privileged capabilities through a single
//! `host_invoke(op, ptr, len)` import.  This crate serves those calls:
//!
//! - **[`runtime`]** -- [`HookRuntime`], the wasmtime engine, per-invocation stores and the
//!   `env` imports.
//! - **[`metrics`]** -- [`InvocationMetrics`], outcome counts and latency per module.
//! - **[`modules`]** / **[`loader`]** -- compiled module registry and directory loader.
//! - **[`registry`]** -- [`OpHandler`], [`HandlerRegistry`] and the total [`Dispatcher`].
//! - **[`handlers`]** -- the standard handler for every op.
//! - **[`host`]** -- the [`Host`] facade tying services, dispatcher and sessions together.
//! - **[`tx`]** -- transaction ownership, staging, commit and rollback.
//! - **[`records`]**, **[`kv`]**, **[`jobs`]**, **[`files`]**, **[`secrets`]**,
//!   **[`fetch`]**, **[`vector`]**, **[`utils`]** -- the capability services.
//! - **[`config`]** -- TOML-backed [`HostConfig`].
//! - **[`error`]** -- [`HostError`] and the per-call [`Fault`].

pub mod config;
pub mod error;
pub mod fetch;
pub mod files;
pub mod filter;
pub mod handlers;
pub mod host;
pub mod jobs;
pub mod kv;
pub mod loader;
pub mod metrics;
pub mod modules;
pub mod records;
pub mod registry;
pub mod runtime;
pub mod secrets;
pub mod services;
pub mod session;
pub mod trigger;
pub mod tx;
pub mod utils;
pub mod vector;

pub use config::HostConfig;
pub use error::{Fault, HostError, Result};
pub use host::Host;
pub use loader::ModuleLoader;
pub use metrics::{InvocationMetrics, MetricsSnapshot, Outcome, RuntimeMetrics};
pub use modules::ModuleInfo;
pub use registry::{CallContext, Dispatcher, HandlerRegistry, OpHandler, handler_fn};
pub use runtime::{HookOutput, HookRuntime, PreparedHook};
pub use session::Session;
pub use trigger::{RecordEvent, Trigger};
