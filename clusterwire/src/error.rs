use std::io;

use chainerror::*;

#[derive(Clone, PartialEq, Eq, Debug, thiserror::Error)]
pub enum ErrorKind {
    #[error("IO error: {0:?}")]
    Io(io::ErrorKind),
    #[error("invalid connection string: {0}")]
    InvalidConnectionString(String),
    #[error("invalid connection option: {0}")]
    InvalidOption(String),
    #[error("{0}")]
    ConnectionFailed(String),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("connection not open")]
    NotConnected,
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("invalid parameter: '{0}'")]
    InvalidParameter(String),
    #[error("out of memory")]
    OutOfMemory,
    #[error("timeout expired")]
    Timeout,
    #[error("authentication failed: {0}")]
    Authentication(String),
    #[error("agent error: {0}")]
    Remote(String),
    #[error("invalid agent address")]
    InvalidAddress,
}

impl ChainErrorFrom<io::Error> for ErrorKind {
    fn chain_error_from(
        e: io::Error,
        line_filename: Option<(u32, &'static str)>,
    ) -> ChainError<Self> {
        match e.kind() {
            io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset => ChainError::<_>::new(
                ErrorKind::ConnectionClosed,
                Some(Box::from(e)),
                line_filename,
            ),
            kind => ChainError::<_>::new(ErrorKind::Io(kind), Some(Box::from(e)), line_filename),
        }
    }
}

pub type Result<T> = ChainResult<T, ErrorKind>;
pub type Error = ChainError<ErrorKind>;

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn io_errors_map_to_kinds() {
        let reset = io::Error::from(io::ErrorKind::ConnectionReset);
        let e = ErrorKind::chain_error_from(reset, Some((line!(), file!())));
        assert_eq!(e.kind(), &ErrorKind::ConnectionClosed);

        let e = ErrorKind::chain_error_from(io::Error::from(io::ErrorKind::NotFound), None);
        assert_eq!(e.kind(), &ErrorKind::Io(io::ErrorKind::NotFound));

        let r: Result<()> = Err::<(), _>(io::Error::from(io::ErrorKind::BrokenPipe))
            .map_err(minto_cherr!());
        assert_eq!(r.unwrap_err().kind(), &ErrorKind::ConnectionClosed);

        let e: Error = cherr!(ErrorKind::Timeout);
        assert_eq!(e.to_string(), "timeout expired");
    }
}
