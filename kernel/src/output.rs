//! Log output for lumOS.
//!
//! Everything goes over the serial port; the level macros in `macros`
//! compile down to nothing when their `log-*` feature is disabled.

pub mod macros;
