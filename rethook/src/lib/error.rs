use thiserror::Error;

/// Everything that can go wrong while handing out thunks. None of it is
/// retryable: a failed page mapping means profiling must stop.
#[derive(Error, Debug)]
pub enum ThunkError {
    #[error("could not map a page of return thunks: {0}")]
    PageMap(#[source] std::io::Error),
    #[error("this thread is already bound to a thunk factory")]
    AlreadyBound,
    #[error("this thread is not bound to a thunk factory")]
    NotBound,
}
