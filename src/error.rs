use std::error::Error;
use std::fmt;
use std::fmt::Display;

use crate::Frame;

/// This enum contains all error messages this library can return. Most API functions will generally return a [`Result<(),RollnetError>`].
///
/// [`Result<(),RollnetError>`]: std::result::Result
#[derive(Debug, Clone, PartialEq, Hash)]
pub enum RollnetError {
    /// When the prediction threshold has been reached, we cannot accept more inputs from the local player.
    PredictionThreshold,
    /// The player handle you provided does not refer to an existing player.
    InvalidHandle,
    /// The player handle you provided is too big for the number of players in this session.
    PlayerOutOfRange,
    /// You made an invalid request, usually by using wrong parameters for function calls.
    InvalidRequest {
        /// Further specifies why the request was invalid.
        info: String,
    },
    /// The session is not synchronized yet. Please start the session and wait a few ms to let the clients synchronize.
    NotSynchronized,
    /// The player you are trying to disconnect has already been disconnected.
    PlayerDisconnected,
    /// The maximum number of spectators has been reached, no further spectators can be added.
    TooManySpectators,
    /// In a [`SyncTestSession`], this error is returned if checksums of resimulated frames do not match up with the original checksum.
    ///
    /// [`SyncTestSession`]: crate::SyncTestSession
    MismatchedChecksum {
        /// The frame at which the mismatch occurred.
        frame: Frame,
    },
    /// The spectator got so far behind the host that catching up is impossible.
    SpectatorTooFarBehind,
    /// The UDP socket could not be created.
    SocketCreationFailed,
}

impl Display for RollnetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RollnetError::PredictionThreshold => {
                write!(
                    f,
                    "Prediction threshold is reached, cannot proceed without catching up."
                )
            }
            RollnetError::InvalidHandle => {
                write!(f, "The player handle you provided is invalid.")
            }
            RollnetError::PlayerOutOfRange => {
                write!(
                    f,
                    "The player handle you provided is too big for the number of players."
                )
            }
            RollnetError::InvalidRequest { info } => {
                write!(f, "Invalid Request: {}", info)
            }
            RollnetError::NotSynchronized => {
                write!(
                    f,
                    "The session is not yet synchronized with all remote sessions."
                )
            }
            RollnetError::PlayerDisconnected => {
                write!(
                    f,
                    "The player you are trying to disconnect is already disconnected."
                )
            }
            RollnetError::TooManySpectators => {
                write!(f, "The maximum number of spectators has been reached.")
            }
            RollnetError::MismatchedChecksum { frame } => {
                write!(
                    f,
                    "Detected checksum mismatch during rollback on frame {}.",
                    frame
                )
            }
            RollnetError::SpectatorTooFarBehind => {
                write!(
                    f,
                    "The spectator got so far behind the host that catching up is impossible."
                )
            }
            RollnetError::SocketCreationFailed => {
                write!(f, "UDP socket could not be created.")
            }
        }
    }
}

impl Error for RollnetError {}
