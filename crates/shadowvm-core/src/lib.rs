//! # shadowvm-core
//!
//! Core value model for the shadowvm emulator. This crate defines the
//! shadow-tracked scalar types that every register and guest memory byte is
//! made of, the segmented guest address type, and the diagnostic reporting
//! sink shared by the whole tool.

pub mod address;
pub mod report;
pub mod shadow;

pub use address::{Address, DATA_SELECTOR, TLS_SELECTOR};
pub use shadow::ShadowValue;
