use thiserror::Error;

/// An allocator returned no memory for a request
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
#[error("memory allocation of {size} bytes failed")]
pub struct AllocError {
    /// Number of bytes requested. `usize::MAX` if the size itself overflowed
    pub size: usize
}

impl AllocError {
    pub(crate) fn overflow() -> Self {
        Self {
            size: usize::MAX
        }
    }
}

/// An error raised by a directory operation
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum Error {
    /// The underlying allocator could not satisfy a request
    #[error(transparent)]
    Alloc(#[from] AllocError),

    /// The operation would grow the directory past `MAX_CONTAINERS` slots
    #[error("directory cannot hold {requested} containers")]
    TooManyContainers {
        /// The slot count the operation needed
        requested: usize
    }
}

/// An error that occured while deserializing a directory
#[derive(Debug, Error)]
pub enum DeserializeError {
    /// An invalid cookie was detected. This is likely not a bitmap. Contains the found value
    #[error("invalid cookie: {0}")]
    InvalidCookie(u32),

    /// An invalid container count was detected. Contains the value found
    #[error("invalid container count: {0}")]
    InvalidContainerCount(u32),

    /// The buffer ends before the data its header describes
    #[error("truncated input: need {needed} bytes, have {available}")]
    Truncated {
        /// Bytes implied by the header read so far
        needed: usize,

        /// Bytes supplied by the caller
        available: usize
    },

    /// Keys are not strictly increasing. Contains the first offending index
    #[error("keys are not strictly increasing at index {index}")]
    UnsortedKeys {
        /// Index of the first key that is not greater than its predecessor
        index: usize
    },

    /// A container payload is inconsistent with its header entry
    #[error("invalid container for key {key}: {reason}")]
    InvalidContainer {
        /// The key of the offending container
        key: u16,

        /// What was wrong with it
        reason: &'static str
    },

    /// Memory for the decoded containers could not be allocated
    #[error(transparent)]
    Alloc(#[from] AllocError)
}

impl From<Error> for DeserializeError {
    fn from(error: Error) -> Self {
        match error {
            Error::Alloc(error) => DeserializeError::Alloc(error),
            Error::TooManyContainers { requested } => {
                DeserializeError::InvalidContainerCount(requested as u32)
            }
        }
    }
}
