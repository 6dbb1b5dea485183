//! Metrics and observability infrastructure.
//!
//! Queue internals emit [`events::InternalEvent`] structs through the
//! [`emit!`] macro; the host process installs whatever `metrics` recorder it
//! wants (Prometheus exporter, test snapshotter, nothing).

pub mod events;

/// Macro for emitting metric events.
///
/// Calls `InternalEvent::emit()` on the given event, which records the
/// corresponding metric through the `metrics` facade.
///
/// # Example
///
/// ```ignore
/// use skua::metrics::events::RowsProcessed;
///
/// emit!(RowsProcessed { rows: 100, target: target.clone() });
/// ```
#[macro_export]
macro_rules! emit {
    ($event:expr) => {
        $crate::metrics::events::InternalEvent::emit($event)
    };
}

pub use emit;
