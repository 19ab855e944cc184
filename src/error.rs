use std::io;

use failure::Fail;

/// Failures surfaced by host and group operations.
#[derive(Debug, Fail)]
pub enum Error {
    /// One or more drones did not reply within the retransmission budget.
    #[fail(display = "drone(s) not reachable: {:?}", _0)]
    Unreachable(Vec<String>),

    /// No or not enough idle drones, or the group is empty.
    #[fail(display = "{}", _0)]
    NotFound(String),

    /// A drone reported a non-zero status code or an unusable reply.
    #[fail(display = "drone {} failed with code {}", drone, code)]
    Runtime {
        code: i64,
        errstr: Option<String>,
        drone: String,
    },

    /// A drone outside the member set answered a group call.
    #[fail(display = "unexpected drone(s) answered: {:?}", _0)]
    Conflict(Vec<String>),

    /// Local protocol misuse, e.g. an oversize datagram or group id.
    #[fail(display = "{}", _0)]
    Protocol(String),

    /// Socket or interface lookup failure.
    #[fail(display = "{}", _0)]
    Io(#[cause] io::Error),

    /// The owning host has been released.
    #[fail(display = "host has been released")]
    HostGone,
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
