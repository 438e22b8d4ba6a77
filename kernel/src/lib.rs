//! Demand-paged virtual memory for user processes.
//!
//! Runs on bare metal (`target_os = "none"`) and on the host, where the tests
//! drive it against RAM disks and in-memory files.

#![cfg_attr(target_os = "none", no_std)]

extern crate alloc;

pub mod block;
pub mod drivers;
pub mod mem;
pub mod paging;
pub mod sync;
pub mod system;
pub mod user_program;
pub mod vfs;
