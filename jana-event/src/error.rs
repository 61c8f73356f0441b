use std::backtrace::Backtrace;

/// Convenience alias used throughout the framework and by user components.
pub type Result<T> = std::result::Result<T, Error>;

/// The framework error type.
///
/// User callbacks return this directly; the factory and arrow layers
/// annotate errors that cross them with the originating plugin, component,
/// factory, and tag so a failure deep inside a factory chain still names
/// its source. Backtraces are captured as text at the wrap site.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Startup problem: missing source, empty topology, bad wiring. Aborts
    /// initialization; never produced while running.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// An error raised by user code, annotated with its origin.
    #[error("{message}\n  plugin: {plugin}\n  component: {component}\n  factory: {factory}\n  tag: {tag}")]
    User {
        /// The underlying error, stringified.
        message: String,
        /// Plugin that registered the failing component.
        plugin: String,
        /// Component (source/processor/unfolder) name.
        component: String,
        /// Factory name, when the error came from a factory.
        factory: String,
        /// Collection tag, when applicable.
        tag: String,
        /// Backtrace captured where the error was wrapped.
        backtrace: String,
    },

    /// `get` was called for a `(type, tag)` pair nobody registered.
    #[error("no factory registered for object type '{object_type}' with tag '{tag}'")]
    FactoryNotFound {
        /// Requested object type name.
        object_type: &'static str,
        /// Requested tag.
        tag: String,
    },

    /// The factory's `init` failed earlier; the factory is permanently
    /// unusable and every subsequent `get` raises this.
    #[error("factory '{factory}' (tag '{tag}') is broken: init failed: {message}")]
    FactoryBroken {
        /// Factory name.
        factory: String,
        /// Collection tag.
        tag: String,
        /// The original init failure.
        message: String,
    },

    /// A worker missed its heartbeat deadline.
    #[error("timeout in worker thread {worker_id} while executing arrow '{arrow}'")]
    Timeout {
        /// The stalled worker.
        worker_id: usize,
        /// Arrow the worker was executing.
        arrow: String,
        /// Backtrace captured from the stalled thread, possibly empty.
        backtrace: String,
    },

    /// A component requested a clean shutdown with the given exit code.
    #[error("quit requested with exit code {0}")]
    Quit(i32),
}

impl Error {
    /// Wraps an arbitrary error message as a user error with origin
    /// context. If `self` is already a [`Error::User`], only empty context
    /// fields are filled in, so the innermost annotation wins.
    pub fn annotate(self, plugin: &str, component: &str, factory: &str, tag: &str) -> Error {
        fn fill(field: String, value: &str) -> String {
            if field.is_empty() {
                value.to_owned()
            } else {
                field
            }
        }
        match self {
            Error::User {
                message,
                plugin: p,
                component: c,
                factory: f,
                tag: t,
                backtrace,
            } => Error::User {
                message,
                plugin: fill(p, plugin),
                component: fill(c, component),
                factory: fill(f, factory),
                tag: fill(t, tag),
                backtrace,
            },
            Error::Configuration(_) | Error::Quit(_) => self,
            other => Error::User {
                message: other.to_string(),
                plugin: plugin.to_owned(),
                component: component.to_owned(),
                factory: factory.to_owned(),
                tag: tag.to_owned(),
                backtrace: Backtrace::force_capture().to_string(),
            },
        }
    }

    /// Shorthand for a user error with just a message; context is added by
    /// the framework as the error propagates.
    pub fn user(message: impl Into<String>) -> Error {
        Error::User {
            message: message.into(),
            plugin: String::new(),
            component: String::new(),
            factory: String::new(),
            tag: String::new(),
            backtrace: Backtrace::force_capture().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Error;

    #[test]
    fn annotate_fills_only_empty_fields() {
        let err = Error::user("boom").annotate("trackers", "TrackFitter", "", "");
        let err = err.annotate("other_plugin", "other", "HitFactory", "raw");
        match err {
            Error::User {
                plugin,
                component,
                factory,
                tag,
                ..
            } => {
                assert_eq!(plugin, "trackers");
                assert_eq!(component, "TrackFitter");
                assert_eq!(factory, "HitFactory");
                assert_eq!(tag, "raw");
            }
            other => panic!("unexpected variant: {other}"),
        }
    }

    #[test]
    fn user_errors_carry_backtraces() {
        match Error::user("boom") {
            Error::User { backtrace, .. } => assert!(!backtrace.is_empty()),
            other => panic!("unexpected variant: {other}"),
        }
    }
}
