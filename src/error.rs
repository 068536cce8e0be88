/// Usage errors raised synchronously by the promise API and the event loop
/// drivers. Rejections never travel through this type: they are plain
/// [`Value`](crate::Value)s flowing along a promise chain.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum PromiseError {
    #[error("{argument} should be a function")]
    NotCallable { argument: &'static str },

    #[error("event loop stalled while promise #{id} is still pending")]
    Stalled { id: usize },

    #[error("event loop is already running on this thread")]
    Reentrant,
}

impl From<PromiseError> for std::io::Error {
    fn from(err: PromiseError) -> std::io::Error {
        std::io::Error::other(err.to_string())
    }
}
