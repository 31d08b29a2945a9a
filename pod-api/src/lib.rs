//! PoD API - Core types and interfaces for the guest-physical translation layer
//!
//! This crate provides the vocabulary shared by the translation table, the
//! populate-on-demand engine and the collaborators that sit around them
//! (frame allocator, physical memory access, dirty logging).
//!
//! # Architecture
//!
//! The API is organized into a few key modules:
//!
//! - **Core**: frame numbers, page orders and VM identifiers
//! - **Error**: the common error type and result alias
//! - **Memory**: translation entries, access rights and collaborator traits
//!
//! # Usage
//!
//! ```rust
//! use pod_api::{Access, Entry, EntryType, Gfn, Mfn, Resolution};
//!
//! let entry = Entry::lazy(Resolution::Unresolved, Access::RWX);
//! assert_eq!(entry.entry_type(), EntryType::Lazy);
//!
//! let ram = Entry::ram(Mfn::new(0x1234), Access::RW);
//! assert_eq!(ram.mfn(), Some(Mfn::new(0x1234)));
//! assert!(Gfn::new(5) < Gfn::new(6));
//! ```

#![no_std]

// Core modules
pub mod core;
pub mod error;
pub mod memory;

// Re-export commonly used types
pub use crate::core::types::*;
pub use crate::error::{Error, FatalReason, Result};
pub use crate::memory::interface::{DirtyLog, FrameAccess, FrameAllocator, PhysicalMemory};
pub use crate::memory::types::{Access, Entry, EntryType, FaultKind, Mapping, Resolution};
