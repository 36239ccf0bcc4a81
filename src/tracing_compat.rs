//! Logging macros that forward to `tracing` when the feature is enabled.
//!
//! The core logs phase transitions, parks/unparks, and transactional map
//! events through these macros. With the `tracing` cargo feature off they
//! compile to nothing, so embedding hosts pay for observability only when
//! they ask for it.

#[cfg(feature = "tracing")]
pub(crate) use tracing::{debug, trace};

#[cfg(not(feature = "tracing"))]
mod noop {
    macro_rules! trace {
        ($($arg:tt)*) => {};
    }
    macro_rules! debug {
        ($($arg:tt)*) => {};
    }

    pub(crate) use {debug, trace};
}

#[cfg(not(feature = "tracing"))]
pub(crate) use noop::{debug, trace};
