//! # Single-producer broadcast transports over shared memory
//!
//! Ultra-low-latency, **single-producer / multi-consumer** transports
//! that move opaque byte payloads between cooperating processes on one
//! host through named POSIX shared-memory regions. Consumers observe
//! the most recently published payload ("latest-wins"); end-to-end
//! latency is dominated by memory bandwidth, not synchronization.
//!
//! # Features
//!
//! * **Lock-free** publish and consume paths: one release store per
//!   frame, one acquire load per read
//! * **Zero-copy** on both ends: in-place fill for writers, borrowed
//!   payload views for readers
//! * **Cache-discipline** throughout: every writer-hot atomic owns its
//!   own 64-byte line, verified at compile time
//! * **Huge pages**, `mlock`, `MAP_POPULATE`, and `madvise` applied
//!   automatically, with graceful fallback
//! * **Liveness** via a writer heartbeat and reader-side timeout
//!   predicate
//! * **Drop accounting** through monotonic per-frame sequence numbers
//!
//! # Transports
//!
//! Four variants share the same conceptual model:
//!
//! * [`dbuf::nt`]: double buffer, non-temporal stores. Large payloads
//!   bypass the cache entirely; minimum writer disturbance.
//! * [`dbuf::prefetch`]: double buffer, software prefetch and cache
//!   tuning driven by a [`topology::ChannelConfig`]; copying and timed
//!   reads included.
//! * [`dbuf::simple`]: the minimal double-buffer baseline.
//! * [`ring`]: one ring buffer per consumer, fanned out by the
//!   producer; keeps a bounded history of recent frames instead of
//!   only the latest one.
//!
//! # Quick Example
//!
//! ```ignore
//! use shmcast::dbuf::nt;
//!
//! // Producer process
//! let mut writer = nt::Writer::new("/sensor", 4096, true)?;
//! writer.init()?;
//! writer.write(&payload)?;
//!
//! // Consumer process
//! let mut reader = nt::Reader::new("/sensor", 4096)?;
//! reader.init()?; // loop on NotFound until the writer appears
//! if let Some(frame) = reader.latest()? {
//!     process(frame.data, frame.seq, frame.timestamp_ns);
//! }
//! ```
//!
//! # Delivery semantics
//!
//! This is a "shoot and forget" transport family: the writer never
//! waits, and a reader that falls behind loses frames (observable
//! through its `dropped` counter). A reader racing the writer across
//! two publishes of the same slot can observe a torn payload; consume
//! promptly or use the [`ring`] transport's history if you need slack.
//! There is no backpressure, no multi-producer mode, and no delivery
//! guarantee stronger than "latest available".

#[cfg(not(unix))]
compile_error!("This crate only supports Unix-like operating systems.");

pub mod dbuf;
mod error;
pub mod region;
pub mod ring;
pub mod topology;
mod utils;

pub use error::{ShmError, ShmResult};
pub use region::SharedRegion;
pub use topology::ChannelConfig;
pub use utils::{MAX_NAME_LEN, mono_time_ns};
