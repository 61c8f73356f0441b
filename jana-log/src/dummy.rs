//! No-op replacements for the `tracing` macros jana uses, swapped in when
//! the `enable_log` feature is off so that log formatting never reaches the
//! scheduler hot path.

#[macro_export]
macro_rules! trace {
    ($($args:tt)*) => {};
}

#[macro_export]
macro_rules! debug {
    ($($args:tt)*) => {};
}

#[macro_export]
macro_rules! info {
    ($($args:tt)*) => {};
}

#[macro_export]
macro_rules! warn {
    ($($args:tt)*) => {};
}

#[macro_export]
macro_rules! error {
    ($($args:tt)*) => {};
}

#[macro_export]
macro_rules! span {
    ($($args:tt)*) => {
        $crate::Span::none()
    };
}
