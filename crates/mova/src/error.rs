use thiserror::Error;

/// All failures the crate can produce.
///
/// Every error is fatal for the `compile` or `run` call that raised it:
/// nothing in the language catches errors, and partial state is discarded.
/// Runtime errors pick up the name of the executing function and its
/// instruction pointer as they propagate out of the dispatch loop.
#[derive(Debug, Error)]
pub enum Error {
    #[error("lexical error at {line}:{column}: {message}")]
    Lexical {
        message: String,
        line: u32,
        column: u32,
    },

    #[error("parse error at {line}:{column}: {message}")]
    Parse {
        message: String,
        line: u32,
        column: u32,
    },

    #[error("link error: {0}")]
    Link(String),

    #[error("runtime error in {function} at instruction {ip}: {message}")]
    Runtime {
        message: String,
        function: String,
        ip: usize,
    },
}

impl Error {
    /// Shorthand for a runtime error that has not yet been located.
    ///
    /// Helpers below the VM (operators, builtins, attribute access) raise
    /// errors without knowing which frame is executing; the dispatch loop
    /// fills in the blanks via [`Error::with_frame`].
    pub fn runtime(message: impl Into<String>) -> Self {
        Error::Runtime {
            message: message.into(),
            function: String::new(),
            ip: 0,
        }
    }

    /// Attach frame context to a bare runtime error.
    ///
    /// Errors that already carry a function name keep it: the innermost
    /// frame is the one worth reporting.
    pub fn with_frame(self, function: &str, at: usize) -> Self {
        match self {
            Error::Runtime {
                message,
                function: f,
                ip,
            } if f.is_empty() => Error::Runtime {
                message,
                function: function.to_string(),
                ip: at,
            },
            other => other,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
