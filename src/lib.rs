//! Frame-accurate timing for live video renderers.
//!
//! Framelock keeps several independent renderer processes in lock-step and
//! turns irregular render callbacks into a steady, timestamped output cadence.
//!
//! # Features
//!
//! - **Genlock**: one worker broadcasts a UDP timing reference, the others
//!   align their clocks to it and land on identical frame boundaries
//! - **Frame pump**: double-buffered, fixed-cadence delivery to any
//!   [`FrameSink`] with explicit send/drop/hold accounting
//! - **Watchdog**: a hung control loop terminates its process
//! - **Supervision**: a managing process restarts crashed workers with
//!   bounded exponential backoff and flags stalled ones
//!
//! ## Example (worker)
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use framelock::{NullSink, WorkerConfig, WorkerRuntime};
//!
//! #[tokio::main]
//! async fn main() -> framelock::Result<()> {
//!     let config = WorkerConfig::from_yaml_str("fps: 60\ngenlock: {mode: follower}")?;
//!     let runtime = WorkerRuntime::start(config, Arc::new(NullSink)).await?;
//!
//!     let frame = vec![0u8; 1920 * 1080 * 4];
//!     loop {
//!         runtime.submit_frame(&frame, 1920, 1080);
//!         runtime.heartbeat();
//!         tokio::time::sleep(std::time::Duration::from_millis(16)).await;
//!     }
//! }
//! ```
//!
//! ## Example (manager)
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use framelock::supervisor::{ProcessLauncher, StreamManager};
//! use framelock::SupervisorConfig;
//!
//! # #[tokio::main]
//! # async fn main() -> framelock::Result<()> {
//! let mut manager = StreamManager::new(Arc::new(ProcessLauncher), SupervisorConfig::default());
//! manager.add("program", None)?;
//! manager.start("program", "/usr/local/bin/renderer", vec!["--fps".into(), "60".into()]).await?;
//! # Ok(())
//! # }
//! ```

// Core types and error handling
pub mod config;
mod error;
#[cfg(any(test, feature = "benchmark"))]
pub mod test_utils;
pub mod types;

// Timing subsystem
pub mod genlock;
pub mod pump;
pub mod sink;
pub mod watchdog;
pub mod worker;

// Managing process
pub mod supervisor;

// Core exports
pub use config::{GenlockConfig, PumpConfig, SupervisorConfig, WatchdogConfig, WorkerConfig};
pub use error::*;
pub use types::*;

// Component exports
pub use genlock::GenlockClock;
pub use pump::{FramePump, FrameSubmitter};
pub use sink::{FrameSink, NullSink};
pub use supervisor::{StreamManager, WorkerStatus, WorkerSupervisor};
pub use watchdog::{Watchdog, WatchdogAction, WatchdogState};
pub use worker::WorkerRuntime;
