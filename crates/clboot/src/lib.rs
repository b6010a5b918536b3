//! # clboot
//!
//! Host-side bootstrap for a compute-accelerator runtime.
//!
//! clboot discovers a platform and device, creates an execution context and
//! an in-order command queue, turns kernel source modules into one executable
//! program, launches a single kernel, waits for it, and releases everything in
//! reverse order of acquisition. Every step can fail on its own; a failure at
//! any point releases exactly what was acquired before it.
//!
//! ## Example
//!
//! ```rust
//! use clboot::{BootConfig, SimulatedDevice, SourceModules};
//!
//! let sources = SourceModules::new()
//!     .with_module("main.cl", "__kernel void cl_main(__global char* p) { p[0] = 1; }");
//! let api = SimulatedDevice::new(sources);
//!
//! let report = clboot::run(&api, &BootConfig::default()).expect("bootstrap");
//! assert_eq!(report.kernel, "cl_main");
//! assert_eq!(api.live_objects(), 0);
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │            bootstrap::run / clboot CLI       │
//! └──────────────────────┬───────────────────────┘
//!                        │
//! ┌──────────────────────▼───────────────────────┐
//! │                 lifecycle                    │
//! │  Bootstrap → Platform → Device → Context →   │
//! │  Queue → Session (kernel, buffer, dispatch)  │
//! │  ┌──────────────┐  ┌───────────────────────┐ │
//! │  │   compiler   │  │ diagnostics / status  │ │
//! │  └──────────────┘  └───────────────────────┘ │
//! └──────────────────────┬───────────────────────┘
//!                        │  DeviceApi
//!          ┌─────────────┴─────────────┐
//!          ▼                           ▼
//!   SimulatedDevice            vendor runtime binding
//! ```

#![warn(missing_docs)]

pub mod bootstrap;
pub mod compiler;
pub mod config;
pub mod device;
pub mod diagnostics;
pub mod error;
pub mod lifecycle;
pub mod simulated;
pub mod sources;
pub mod status;

// Re-exports
pub use bootstrap::{RunReport, run};
pub use compiler::{ModuleLinker, compile_and_link, include_directive};
pub use config::BootConfig;
pub use device::{
    ApiResult, ContextHandle, DeviceApi, DeviceId, DeviceType, KernelHandle, LinkFailure, MemAccess, MemHandle,
    Operation, PlatformId, ProgramHandle, QueueHandle, QueueProperties, Resource,
};
pub use diagnostics::{LOG_CAPACITY, report_build_log, truncate_log};
pub use error::{BootError, Result};
pub use lifecycle::{
    Bootstrap, ContextStage, DeviceBuffer, DeviceStage, Kernel, LifecycleState, PlatformStage, ProgramOrigin,
    QueueStage, Session,
};
pub use simulated::{SimulatedDevice, SimulatedDeviceBuilder};
pub use sources::SourceModules;
pub use status::{StatusCode, translate};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
