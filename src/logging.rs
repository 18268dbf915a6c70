// macros only; no direct imports needed

/// Log at info level from workflow code; silent while the activation is replaying.
#[macro_export]
macro_rules! durable_info {
    ($ctx:expr, $($arg:tt)+) => {{
        if $ctx.is_logging_enabled() {
            ::tracing::info!(workflow_id = %$ctx.workflow_id(), activation = $ctx.activation_index(), $($arg)+);
        }
    }};
}

#[macro_export]
macro_rules! durable_warn {
    ($ctx:expr, $($arg:tt)+) => {{
        if $ctx.is_logging_enabled() {
            ::tracing::warn!(workflow_id = %$ctx.workflow_id(), activation = $ctx.activation_index(), $($arg)+);
        }
    }};
}

#[macro_export]
macro_rules! durable_error {
    ($ctx:expr, $($arg:tt)+) => {{
        if $ctx.is_logging_enabled() {
            ::tracing::error!(workflow_id = %$ctx.workflow_id(), activation = $ctx.activation_index(), $($arg)+);
        }
    }};
}
