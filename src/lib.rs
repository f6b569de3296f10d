//! A lock-free priority queue for the pending event set of a parallel discrete-event simulator.
//!
//! Events are kept in a calendar queue: a table of buckets, each covering a fixed slice of
//! simulated time and holding its events in a sorted lock-free list. The table grows without
//! stopping anyone, and events beyond its current reach wait in a staging list until it does.
//!
//! # Threads
//!
//! Every thread registers with the queue once and operates through the returned [`Handle`].
//!
//! ```
//! use crossbeam_utils::thread;
//! use nbqueue::Queue;
//!
//! let queue = Queue::new(64, 1.0, false);
//!
//! thread::scope(|s| {
//!     for lid in 0..4 {
//!         let queue = &queue;
//!         s.spawn(move |_| {
//!             let handle = queue.register(lid);
//!             for i in 0..100 {
//!                 handle.enqueue(f64::from(i) * 0.5, lid);
//!             }
//!         });
//!     }
//! })
//! .unwrap();
//!
//! let handle = queue.register(0);
//! let mut last = 0.0;
//! while let Some(event) = handle.dequeue() {
//!     assert!(event.timestamp() >= last);
//!     last = event.timestamp();
//! }
//! ```
//!
//! # Memory
//!
//! Dequeued events are unlinked lazily and their nodes are only freed by [`Handle::prune`],
//! whose caller vouches that no thread still works below a given timestamp. A queue that is
//! never pruned frees everything when dropped.
//!
//! [`Handle`]: struct.Handle.html
//! [`Handle::prune`]: struct.Handle.html#method.prune

mod atomic;
mod bucket;
mod config;
mod cursor;
mod error;
mod handle;
mod node;
mod prune;
mod queue;
mod registry;
mod scope;
mod table;

pub use crate::config::Config;
pub use crate::cursor::CursorPolicy;
pub use crate::error::ConfigError;
pub use crate::handle::Handle;
pub use crate::queue::{Event, Queue};
pub use crate::table::MAX_CAPACITY;
