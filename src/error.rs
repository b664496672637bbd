//! Binary Error Types

use derive_more::{Display, Error};

pub type Error = exn::Exn<ErrorKind>;
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    #[display("could not load configuration")]
    Config,
    #[display("could not open the file record store")]
    Store,
    #[display("could not set up the copy mechanism")]
    Copier,
    #[display("sync daemon stopped")]
    Daemon,
    #[display("I/O error")]
    Io,
}
