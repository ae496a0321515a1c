//! Error kinds shared by the VSS I/O capability layer and the store engine.

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("bad argument: {0}")]
    BadArgument(&'static str),
    #[error("bad format: {0}")]
    BadFormat(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt: {0}")]
    Corrupt(String),
    #[error("out of space")]
    OutOfSpace,
    #[error("internal: {0}")]
    Internal(&'static str),
}

pub type Result<T> = core::result::Result<T, Error>;
