//! Logging macros used throughout the stack.
//!
//! All messages funnel through `log_at!`, which takes the level as a token. With the `log`
//! feature enabled it forwards to the `log` crate's macro of that name; without the feature the
//! format arguments are still type-checked but nothing is emitted, so log lines cost nothing in
//! feature-less builds.

#[cfg(feature = "log")]
macro_rules! log_at {
    ($level:ident, $($t:tt)*) => {{ log::$level!($($t)*); }};
}

#[cfg(not(feature = "log"))]
macro_rules! log_at {
    ($level:ident, $($t:tt)*) => {{ format_args!($($t)*); }};
}

macro_rules! error {
    ($($t:tt)*) => { log_at!(error, $($t)*) };
}

macro_rules! warn {
    ($($t:tt)*) => { log_at!(warn, $($t)*) };
}

macro_rules! info {
    ($($t:tt)*) => { log_at!(info, $($t)*) };
}

macro_rules! debug {
    ($($t:tt)*) => { log_at!(debug, $($t)*) };
}

macro_rules! trace {
    ($($t:tt)*) => { log_at!(trace, $($t)*) };
}
