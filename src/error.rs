// Copyright (c) 2025-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

/// Errors that may occur in the storage engine
#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// I/O error on the backing device
    Io(std::io::Error),

    /// On-disk state failed validation (bad signature, out-of-range
    /// pointers, impossible reverse-map entries)
    Corrupt(&'static str),

    /// The segment allocator could not find a free segment
    NoSpace,

    /// Invalid user request (unaligned length, block address out of range)
    InvalidArgument(&'static str),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "Io({e})"),
            Self::Corrupt(msg) => write!(f, "Corrupt({msg})"),
            Self::NoSpace => write!(f, "NoSpace"),
            Self::InvalidArgument(msg) => write!(f, "InvalidArgument({msg})"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

/// Storage engine result
pub type Result<T> = std::result::Result<T, Error>;
