//! topicscope-core: Core library for topicscope
//!
//! Consumes Kafka topics in the background into a local SQLite cache that
//! front ends page through while consumption continues.
//!
//! # Architecture
//!
//! ```text
//! Engine ──start/stop/status──► ConsumerRegistry ──spawns──► ConsumerJob
//!   │                                                         │      │
//!   │                                            BrokerAdapter ◄┘      └► Decoder
//!   │                                                                    │
//!   └──fetch/count──► QueryFacade ──────► RecordStore (SQLite) ◄─────────┘
//! ```
//!
//! # Modules
//!
//! - `engine`: External control and query surface
//! - `registry`: One active consumer job per (cluster, topic)
//! - `job`: Consumer job state machine and offset resolution
//! - `policy`: Where a run starts and stops
//! - `broker`: Broker adapter traits, scripted adapter, Kafka adapter (feature-gated: `kafka`)
//! - `decoder`: Record decoders
//! - `store`: SQLite record store
//! - `query`: Paginated reads against the store
//! - `config`: Configuration management
//! - `logging`: Structured logging setup
//! - `error`: Error types with remediation hints
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod broker;
pub mod config;
pub mod decoder;
pub mod engine;
pub mod error;
pub mod job;
pub mod logging;
pub mod policy;
pub mod query;
pub mod registry;
pub mod store;

pub use config::Config;
pub use engine::Engine;
pub use error::{Error, Result};
pub use policy::ConsumptionPolicy;
pub use registry::{JobKey, JobProgress};

/// Version of topicscope-core
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
