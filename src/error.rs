use std::io;

use thiserror::Error;

/// The set of all possible errors
#[derive(Debug, Error)]
pub enum Error {
    #[error("no such file or directory")]
    NotFound,
    #[error("not a directory")]
    NotADirectory,
    #[error("not a file")]
    NotAFile,
    #[error("name already exists")]
    AlreadyExists,
    #[error("name longer than {0} bytes")]
    NameTooLong(usize),
    #[error("no space left in container")]
    NoSpace,
    #[error("cannot unlock volume: bad passphrase")]
    BadPassphrase,
    #[error("corrupt volume: {0}")]
    CorruptVolume(&'static str),
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("invariant violation: {0}")]
    Invariant(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// True for the errors that abort a mount rather than a single
    /// operation.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::BadPassphrase | Error::CorruptVolume(_) | Error::Invariant(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_conversion() {
        fn read_fails() -> Result<()> {
            let short: io::Result<()> =
                Err(io::Error::new(io::ErrorKind::UnexpectedEof, "short read"));
            short?;
            Ok(())
        }
        assert!(matches!(read_fails(), Err(Error::Io(_))));
    }

    #[test]
    fn fatality() {
        assert!(Error::BadPassphrase.is_fatal());
        assert!(Error::CorruptVolume("bad magic").is_fatal());
        assert!(!Error::NotFound.is_fatal());
        assert!(!Error::NoSpace.is_fatal());
    }
}
