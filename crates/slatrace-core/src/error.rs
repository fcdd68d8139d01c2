use crate::Va;

/// An error raised by the tracing engine or one of its drivers.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// An error surfaced by the hypervisor driver.
    #[error(transparent)]
    Driver(Box<dyn std::error::Error + Send + Sync>),

    /// An I/O error occurred.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The engine cannot be brought up against this guest.
    #[error("configuration error: {0}")]
    Config(String),

    /// A shadow frame could not be provisioned.
    #[error("allocation failed: {0}")]
    Allocation(&'static str),

    /// A guest address could not be translated.
    #[error("failed to translate {0}")]
    Translation(Va),

    /// A kernel symbol is unknown to the OS adapter.
    #[error("unknown kernel symbol `{0}`")]
    Symbol(String),

    /// The view was not found.
    #[error("the view was not found")]
    ViewNotFound,

    /// Operation not supported.
    #[error("operation not supported")]
    NotSupported,

    /// Waiting for events timed out.
    #[error("operation timed out")]
    Timeout,

    /// The given timeout is invalid.
    #[error("the given timeout is invalid")]
    InvalidTimeout,

    /// Out of bounds.
    #[error("out of bounds")]
    OutOfBounds,

    /// The event wait was interrupted by a signal.
    #[error("interrupted")]
    Interrupted,

    /// Teardown completed, but some restoration steps failed.
    #[error("{0} teardown step(s) failed")]
    Teardown(usize),
}

impl Error {
    /// Wraps a driver-specific error.
    pub fn driver(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Driver(Box::new(err))
    }
}
