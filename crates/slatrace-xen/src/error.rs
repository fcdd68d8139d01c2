/// Error type for the Xen driver.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// An error reported by the Xen control interface.
    #[error(transparent)]
    Xen(#[from] xen::XenError),

    /// An I/O error occurred.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The given timeout is invalid.
    #[error("the given timeout is invalid")]
    InvalidTimeout,

    /// Operation not supported.
    #[error("operation not supported")]
    NotSupported,

    /// Out of bounds.
    #[error("out of bounds")]
    OutOfBounds,

    /// Waiting for events timed out.
    #[error("operation timed out")]
    Timeout,

    /// The view was not found.
    #[error("the view was not found")]
    ViewNotFound,
}

impl From<Error> for slatrace_core::Error {
    fn from(value: Error) -> Self {
        match value {
            Error::Xen(value) => Self::Driver(Box::new(value)),
            Error::Io(value) => Self::Io(value),
            Error::InvalidTimeout => Self::InvalidTimeout,
            Error::NotSupported => Self::NotSupported,
            Error::OutOfBounds => Self::OutOfBounds,
            Error::Timeout => Self::Timeout,
            Error::ViewNotFound => Self::ViewNotFound,
        }
    }
}
