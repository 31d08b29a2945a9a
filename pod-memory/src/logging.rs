//! Unified logging support for pod-memory
//!
//! This module provides a unified logging interface that compiles away when
//! the `log` feature is disabled, without repetitive #[cfg] attributes
//! throughout the codebase. Arguments are still referenced when logging is
//! off, so values only used by log lines do not trigger warnings.

/// Unified trace-level logging
#[macro_export]
macro_rules! pod_trace {
    ($($arg:tt)*) => {
        #[cfg(feature = "log")]
        log::trace!($($arg)*);
        #[cfg(not(feature = "log"))]
        { let _ = ($($arg)*); }
    }
}

/// Unified debug-level logging
#[macro_export]
macro_rules! pod_debug {
    ($($arg:tt)*) => {
        #[cfg(feature = "log")]
        log::debug!($($arg)*);
        #[cfg(not(feature = "log"))]
        { let _ = ($($arg)*); }
    }
}

/// Unified info-level logging
#[macro_export]
macro_rules! pod_info {
    ($($arg:tt)*) => {
        #[cfg(feature = "log")]
        log::info!($($arg)*);
        #[cfg(not(feature = "log"))]
        { let _ = ($($arg)*); }
    }
}

/// Unified warn-level logging
#[macro_export]
macro_rules! pod_warn {
    ($($arg:tt)*) => {
        #[cfg(feature = "log")]
        log::warn!($($arg)*);
        #[cfg(not(feature = "log"))]
        { let _ = ($($arg)*); }
    }
}

/// Unified error-level logging
#[macro_export]
macro_rules! pod_error {
    ($($arg:tt)*) => {
        #[cfg(feature = "log")]
        log::error!($($arg)*);
        #[cfg(not(feature = "log"))]
        { let _ = ($($arg)*); }
    }
}

#[cfg(test)]
mod tests {
    use pod_api::Gfn;

    #[test]
    fn test_log_macros_expand() {
        let gfn = Gfn::new(5);
        pod_trace!("trace {}", gfn);
        pod_debug!("debug {}", gfn);
        pod_info!("info {}", gfn);
        pod_warn!("warn {}", gfn);
        pod_error!("error {}", gfn);
    }
}
