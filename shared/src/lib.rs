#![cfg_attr(not(test), no_std)]

pub mod logger;
pub mod mem;
pub mod paging;
pub mod sizes;
