//! Internal utilities.
//!
//! - [`arena`]: generation-checked slot arena backing task records
//! - [`det_hash`]: fixed-seed hashing for reproducible map layout

pub mod arena;
pub mod det_hash;

pub use arena::{Arena, ArenaIndex};
pub use det_hash::{DetHashBuilder, DetHasher};
