//! # gengc - Generational Moving Garbage Collector
//!
//! gengc is a stop-the-world, generational, moving collector core for
//! managed-object runtimes: new objects are bump-allocated in a nursery,
//! survivors are evacuated into a pluggable old generation, and old→young
//! pointers are tracked by mutator write barriers so minor collections
//! never scan the old heap.
//!
//! ## Overview
//!
//! - **Nursery**: one contiguous, self-aligned section with per-thread
//!   allocation buffers and a scan-start table for interior-pointer lookup
//! - **Pinning**: conservative sources (thread stacks, registered pinned
//!   ranges) pin objects in place for one collection instead of moving them
//! - **Old generation**: block-structured mark-sweep or section-based
//!   copying, selected at initialization behind one backend contract
//! - **Write barriers**: sequential store buffers or a card table
//! - **Weak semantics**: ephemerons, disappearing links, togglerefs,
//!   ordinary and critical finalization, bridge handoff
//! - **Parallel marking**: a worker pool with a section-based distribute
//!   queue for rebalancing
//!
//! ## Quick Start
//!
//! ```no_run
//! use gengc::{Collector, GcConfig, RuntimeCallbacks};
//!
//! fn object_size(_obj: usize, _vtable: usize) -> usize {
//!     16
//! }
//!
//! fn main() -> Result<(), gengc::GcError> {
//!     let callbacks = RuntimeCallbacks {
//!         object_size,
//!         ..Default::default()
//!     };
//!     let gc = Collector::new(GcConfig::default(), callbacks)?;
//!
//!     // Threads register before touching the allocator.
//!     gc.register_thread(gengc::approximate_stack_base(), None);
//!
//!     let vtable = 0x1000; // supplied by the host runtime
//!     let obj = gc.alloc(16, vtable)?;
//!     gc.register_root(obj, 16, None);
//!
//!     gc.collect(0);
//!     gc.deregister_root(obj);
//!     gc.unregister_thread();
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration
//!
//! `GENGC_PARAMS` (for example `major=marksweep-par,nursery-size=8m`) and
//! `GENGC_DEBUG` (for example `check-at-minor-collections,print-pinning`)
//! configure a collector built through [`GcConfig::from_env`]; see
//! [`config`] for the full option tables.
//!
//! ## Safety
//!
//! The collector manages raw object memory on behalf of a runtime; the
//! host must uphold the callback contracts (`object_size`, reference
//! bitmaps) and route every reference store through the write barriers.
//! Everything `unsafe` in the public surface is marked as such.

pub mod config;
pub mod error;
pub mod stats;

pub mod memory;
pub mod object;

pub mod gray;
pub mod nursery;
pub mod pin;
pub mod roots;

pub mod alloc;
pub mod los;
pub mod major;
pub mod remset;

pub mod collect;
pub mod collector;
pub mod finalize;
pub mod stw;
pub mod threads;
pub mod verify;
pub mod weak;
pub mod workers;

pub use collector::{global, init_global, Collector};
pub use config::{GcConfig, MajorKind, StackMark, WriteBarrierKind};
pub use error::{GcError, Result};
pub use finalize::{run_finalizers, FinalizerThread};
pub use object::{Descriptor, RuntimeCallbacks, ToggleRefStatus};
pub use threads::{approximate_stack_base, ThreadInfo, ThreadMarkFn};

/// Crate version from Cargo.toml.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the process-wide collector from the environment
/// (`GENGC_PARAMS` / `GENGC_DEBUG`).
pub fn init(callbacks: RuntimeCallbacks) -> Result<std::sync::Arc<Collector>> {
    init_global(GcConfig::from_env(), callbacks)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_not_empty() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_collector_construction() {
        let config = GcConfig {
            nursery_size: 1 << 20,
            max_heap_size: 32 * 1024 * 1024,
            soft_heap_limit: 32 * 1024 * 1024,
            workers: 1,
            ..Default::default()
        };
        let gc = Collector::new(config, RuntimeCallbacks::default()).unwrap();
        assert_eq!(gc.max_generation(), 1);
        assert_eq!(gc.collection_count(0), 0);
        let (base, bits) = gc.nursery_base_and_bits();
        assert_eq!(base >> bits << bits, base);
    }
}
