//! # Gantry Event Pipeline
//!
//! Everything between the operating system and the event log:
//!
//! ```text
//! ┌──────────────┐   ┌─────────────────┐   ┌───────────────┐   ┌──────────┐
//! │  AdapterSet  │──▶│   Conditioner   │──▶│ Bounded queue │──▶│ EventLog │
//! │ (devfs/poll/ │   │ (dedup, flap    │   │ (drop-oldest, │   │ (core)   │
//! │  channel)    │   │  suppression,   │   │  counted)     │   │          │
//! └──────────────┘   │  rate ceiling)  │   └───────────────┘   └──────────┘
//! ```
//!
//! Sources normalize heterogeneous OS notifications into canonical
//! [`DeviceEvent`](gantry_core::DeviceEvent)s and never filter; the
//! conditioner owns dedup, flap suppression, batching, and the rate ceiling;
//! the publisher retries the log with backoff while the bounded queue absorbs
//! and, past capacity, drops with a counter. Memory stays bounded under any
//! overload.

pub mod adapter;
pub mod batcher;
pub mod conditioner;
pub mod error;
pub mod pipeline;
pub mod queue;
pub mod ratelimit;
pub mod sources;
pub mod traits;

pub use adapter::{AdapterHandle, AdapterSet, SourceHealth};
pub use batcher::EventBatcher;
pub use conditioner::{Conditioner, ConditionerStats};
pub use error::{Error, Result};
pub use pipeline::{EventPipeline, PipelineHandle, PipelineStats};
pub use queue::{EventQueue, QueueStats};
pub use ratelimit::TokenBucket;
pub use sources::{ChannelSource, DeviceInjector, DevfsSource, PollSource};
pub use traits::DeviceSource;
