//! Tether — agent run streaming and resumption engine.
//!
//! A client-side engine for long-running agent runs: it consumes a run's
//! typed event stream, coalesces token chunks into bounded UI updates,
//! checkpoints progress durably so a reload can pick up mid-run, gates on
//! human approval interrupts, and reconciles local state with authoritative
//! server status when a stream ends.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use tether::prelude::*;
//! use tether::engine::registry::FileRegistryStore;
//! use tether::transport::http::HttpTransport;
//!
//! # async fn example() -> Result<(), TetherError> {
//! let transport = Arc::new(HttpTransport::new("http://localhost:8080"));
//! let engine = StreamEngine::new(
//!     transport.clone(),
//!     transport,
//!     Arc::new(FileRegistryStore::new_default()),
//!     EngineConfig::from_env(),
//! );
//! engine.start()?;
//!
//! engine
//!     .send_prompt("conv-1", "ws-1", "analyst", "Summarize @report.pdf")
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod prelude;
pub mod transport;
pub mod types;
