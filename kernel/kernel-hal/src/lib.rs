//! # Hardware Abstraction for the Memory Core
//!
//! The narrow slice of architecture support the memory subsystem consumes:
//! processor identity and topology, TLB maintenance instructions, memory
//! fences, and the address-space root register (CR3 with PCID).
//!
//! ## Host builds
//!
//! Everything here compiles for the bare-metal target (`target_os = "none"`)
//! and for hosted builds. On the host the privileged instructions are
//! replaced by recording stand-ins: TLB operations count invocations, the
//! address-space register is a process-global cell, and the current processor
//! identity is a thread-local that tests can set. The point is that all
//! ordering-sensitive code in the allocators (rings, CAS loops, shoot-down
//! bitmaps) runs unmodified on the host, where it can be driven by real
//! threads.

#![cfg_attr(target_os = "none", no_std)]
#![allow(unsafe_code)]

mod cr3;
mod fence;
mod processor;
mod tlb;

pub use cr3::Cr3;
pub use fence::{compiler_fence, memory_fence};
pub use processor::{
    MAX_PROCESSOR_COUNT, ProcessorId, current_processor_id, init_processor_topology,
    processor_count,
};
pub use tlb::{invlpcid, invlpg, invltlb};

#[cfg(not(target_os = "none"))]
pub use processor::set_current_processor;
#[cfg(not(target_os = "none"))]
pub use tlb::{invlpcid_count, invlpg_count, invltlb_count, reset_tlb_counters};

/// Cache line size of the reference target, in bytes.
pub const CACHE_LINE_SIZE: usize = 64;
