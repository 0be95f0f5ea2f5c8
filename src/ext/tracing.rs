//! Extensions to the `tracing` library.

/// Record the provided value in the currently active span context,
/// in the form `span_record!(field, value)`.
///
/// By default, `value` is expected to implement [`tracing::field::Value`]:
/// ```ignore
/// span_record!(result, true);
/// ```
///
/// If desired, one may alternately use the `Display` or `Debug` implementations:
/// ```ignore
/// span_record!(result, display result);
/// span_record!(result, debug result);
/// ```
macro_rules! span_record {
    ($field:expr, $value:expr) => {{
        tracing::Span::current().record(stringify!($field), $value);
    }};
    ($field:expr, display $value:expr) => {{
        tracing::Span::current().record(stringify!($field), format!("{}", $value));
    }};
    ($field:expr, debug $value:expr) => {{
        tracing::Span::current().record(stringify!($field), format!("{:?}", $value));
    }};
}

pub(crate) use span_record;
