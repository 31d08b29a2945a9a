//! Core module containing frame numbers, page orders and identifiers

pub mod types;

// Re-export commonly used items
pub use types::*;
