//! Logging macros.

/// Wraps an expression with a paired `trace!` entry/exit log recording how
/// long it took, mirroring `impact_log`'s `with_trace_logging!`.
macro_rules! with_trace_logging {
    ($message:expr $(,$arg:expr)*; $expression:expr) => {{
        log::trace!(concat!("begin: ", $message) $(,$arg)*);
        let _start_time = ::std::time::Instant::now();
        let _result = $expression;
        let _duration = _start_time.elapsed();
        log::trace!(
            concat!("({:.2} ms) done: ", $message),
            _duration.as_secs_f64() * 1e3
            $(,$arg)*
        );
        _result
    }};
}

pub(crate) use with_trace_logging;
