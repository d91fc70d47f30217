//! Wear-leveled flash storage stack.
//!
//! The crate stacks three layers over a raw [`FlashDevice`]:
//! [`wear::WearLevel`] turns erase-constrained flash sectors into a stable,
//! rewritable [`BlockDevice`]; [`fs::fat::FatFs`] implements a FAT filesystem
//! on that block space; and [`vfs::Vfs`] dispatches path operations across
//! mounted volumes and owns the process-wide working directory.
#![cfg_attr(not(test), no_std)]
#![forbid(unsafe_op_in_unsafe_fn)]
#![warn(clippy::pedantic, clippy::nursery)]
#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc)]

extern crate alloc;
pub use flint_core::storage::{BlockDevice, DeviceError, FlashDevice};

pub mod fs;
pub mod vfs;
pub mod wear;
