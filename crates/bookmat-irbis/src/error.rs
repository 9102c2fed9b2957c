//! Protocol and workflow errors.

use thiserror::Error;

/// Return code the server uses for "unavailable"; timeouts are folded
/// into it.
pub const CODE_UNAVAILABLE: i32 = -3;
/// Record is logically deleted.
pub const CODE_DELETED: i32 = -140;
/// Unknown user name.
pub const CODE_UNKNOWN_USER: i32 = -600;
/// Wrong password.
pub const CODE_BAD_PASSWORD: i32 = -601;

/// Errors from the library server client.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum IrbisError {
    /// TCP connect failed or timed out; equivalent to return code `-3`.
    #[error("library server unavailable: {0}")]
    Unavailable(String),

    /// The read deadline elapsed mid-response.
    #[error("library server read timed out")]
    ReadTimeout,

    /// The record addressed by the request is logically deleted.
    #[error("record is logically deleted")]
    RecordDeleted,

    /// Registration rejected: unknown user.
    #[error("library server rejected user name")]
    UnknownUser,

    /// Registration rejected: bad password.
    #[error("library server rejected password")]
    BadPassword,

    /// Any other negative return code.
    #[error("library server returned {code}")]
    Server { code: i32 },

    /// The response did not parse as `[code]\r\n[body]`.
    #[error("malformed server response: {0}")]
    Malformed(String),

    /// A search found nothing where the workflow requires a record.
    #[error("no record found for {what}")]
    NotFound { what: String },

    /// The exemplar exists but cannot be issued in its current status.
    #[error("exemplar status {status:?} does not allow issue")]
    ExemplarUnavailable { status: String },

    /// The book is not on loan to anyone.
    #[error("book is not registered as issued")]
    NotOnLoan,

    #[error("socket: {0}")]
    Io(#[from] std::io::Error),
}

impl IrbisError {
    /// Maps a negative server return code to its error.
    #[must_use]
    pub fn from_return_code(code: i32) -> Self {
        match code {
            CODE_UNAVAILABLE => Self::Unavailable("server reported -3".into()),
            CODE_DELETED => Self::RecordDeleted,
            CODE_UNKNOWN_USER => Self::UnknownUser,
            CODE_BAD_PASSWORD => Self::BadPassword,
            code => Self::Server { code },
        }
    }
}
