//! Core functionality for flintfs.
//!
//! This crate defines the device-level contract of the storage stack: the
//! error taxonomy for flash operations, the `FlashDevice` trait for raw
//! NOR-style flash, the `BlockDevice` trait for the logical sector space
//! exposed above wear leveling, and a RAM-backed flash simulator used
//! throughout the tests.
#![cfg_attr(not(test), no_std)]
#![forbid(unsafe_op_in_unsafe_fn)]
#![warn(clippy::pedantic, clippy::nursery)]
#![allow(
    clippy::missing_panics_doc,
    clippy::missing_errors_doc,
    clippy::missing_safety_doc,
    clippy::doc_markdown
)]

extern crate alloc;

pub mod storage;

#[macro_export]
macro_rules! static_assert {
    ($condition:expr $(, $($arg:tt)+)?) => {
        const _: () = assert!($condition $(, $($arg)+)?);
    };
}
