use thiserror::Error;

#[derive(Error, Debug)]
pub enum HsaError {
    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("KFD Driver Error: {0}")]
    Driver(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(&'static str),

    #[error("Out of memory or virtual address space")]
    OutOfMemory,

    #[error("Memory is already registered with a different set of nodes")]
    MemoryAlreadyRegistered,

    #[error("Memory is not registered")]
    MemoryNotRegistered,

    #[error("Address has no backing memory handle")]
    InvalidHandle,

    #[error("Invalid node ID: {0}")]
    InvalidNodeId(u32),

    #[error("Not supported: {0}")]
    NotSupported(&'static str),

    #[error("General Thunk Error: {0}")]
    General(String),
}

// A convenient alias
pub type HsaResult<T> = Result<T, HsaError>;
