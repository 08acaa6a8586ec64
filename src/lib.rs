//! # Rollnet
//! Rollnet keeps two to four peers running the same deterministic simulation in lockstep
//! over UDP. It speculatively advances the simulation with predicted remote inputs and
//! rolls back whenever a confirmed input disagrees with the prediction.
//! Instead of registering callback functions, rollnet returns a list of requests for the
//! user to fulfill every frame.

#![forbid(unsafe_code)]

pub use error::RollnetError;
pub use frame_info::{GameInput, GameState};
pub use network::network_stats::NetworkStats;
pub use sessions::p2p_session::P2PSession;
pub use sessions::p2p_spectator_session::P2PSpectatorSession;
pub use sessions::sync_test_session::SyncTestSession;
pub use sync_layer::GameStateCell;

pub(crate) mod error;
pub(crate) mod frame_info;
pub(crate) mod input_queue;
pub(crate) mod sync_layer;
pub(crate) mod time_sync;
pub(crate) mod sessions {
    pub(crate) mod p2p_session;
    pub(crate) mod p2p_spectator_session;
    pub(crate) mod sync_test_session;
}
pub(crate) mod network {
    pub(crate) mod bitvector;
    pub(crate) mod compression;
    pub(crate) mod network_stats;
    pub(crate) mod udp_msg;
    pub(crate) mod udp_protocol;
    pub(crate) mod udp_socket;
}

// #############
// # CONSTANTS #
// #############

/// Internally, -1 represents no frame / invalid frame.
pub const NULL_FRAME: i32 = -1;
/// The maximum number of frames the session will advance past the last confirmed frame.
pub const MAX_PREDICTION_FRAMES: usize = 8;
/// The maximum number of bytes a single player's input may occupy.
pub const MAX_INPUT_BYTES: usize = 8;
/// The maximum number of players in a session.
pub const MAX_PLAYERS: usize = 4;
/// The maximum number of spectators attached to a session.
pub const MAX_SPECTATORS: usize = 16;

pub type Frame = i32;
pub type PlayerHandle = usize;

// #############
// #   ENUMS   #
// #############

/// Defines the three types of players that rollnet considers:
/// - local players, who play on the local device,
/// - remote players, who play on other devices and
/// - spectators, who receive all confirmed inputs, but do not contribute any.
#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq)]
pub enum PlayerType {
    /// This player plays on the local device.
    Local,
    /// This player plays on a remote device identified by the socket address.
    Remote(std::net::SocketAddr),
    /// This player spectates on a remote device identified by the socket address. They do not contribute to the game input.
    Spectator(std::net::SocketAddr),
}

impl Default for PlayerType {
    fn default() -> Self {
        Self::Local
    }
}

/// A session is always in one of these states. You can query the current state of a session via `current_state()`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// When initializing, you must add all necessary players and start the session to continue.
    Initializing,
    /// When synchronizing, the session attempts to establish a connection to the remote clients.
    Synchronizing,
    /// When running, the session has synchronized and is ready to take and transmit player input.
    Running,
}

/// Notifications that you can receive from the session. Handling them is up to the user.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RollnetEvent {
    /// The session received its first valid reply from the remote client.
    Connected { player_handle: PlayerHandle },
    /// The session made progress in synchronizing. After `total` roundtrips, the clients are synchronized.
    Synchronizing {
        player_handle: PlayerHandle,
        total: u32,
        count: u32,
    },
    /// The session is now synchronized with the remote client.
    Synchronized { player_handle: PlayerHandle },
    /// All remote clients are synchronized, the session is ready to accept and transmit input.
    Running,
    /// The remote client has disconnected.
    Disconnected { player_handle: PlayerHandle },
    /// The session has not received packets from the remote client for a while and will disconnect the remote in `disconnect_timeout` ms.
    NetworkInterrupted {
        player_handle: PlayerHandle,
        disconnect_timeout: u128,
    },
    /// Sent only after a `NetworkInterrupted` event, if communication with that player has resumed.
    NetworkResumed { player_handle: PlayerHandle },
    /// The session is ahead of the remote clients. Consider waiting `frames_ahead` frames to let them catch up.
    TimeSync { frames_ahead: u32 },
}

/// Requests that you can receive from the session. Handling them is mandatory.
#[derive(Debug)]
pub enum RollnetRequest {
    /// You should save the current gamestate in the `cell` provided to you. The given `frame` is a sanity check: The gamestate you save should be from that frame.
    SaveGameState { cell: GameStateCell, frame: Frame },
    /// You should load the gamestate in the `cell` provided to you. The given `frame` is a sanity check: The gamestate you load should be from that frame.
    LoadGameState { cell: GameStateCell, frame: Frame },
    /// You should advance the gamestate with the `inputs` provided to you.
    /// Disconnected players are indicated by having `NULL_FRAME` instead of the correct current frame in their input.
    AdvanceFrame { inputs: Vec<GameInput> },
}

// ####################
// # PUBLIC FUNCTIONS #
// ####################

/// Starts a new [`P2PSession`] listening for remote clients on the given port. After creation,
/// add players with [`P2PSession::add_player`] and then call [`P2PSession::start_session`]
/// to begin the synchronization process.
///
/// # Errors
/// - Returns [`RollnetError::InvalidRequest`] if the player count or input size is out of range.
/// - Returns [`RollnetError::SocketCreationFailed`] if the UDP socket could not be bound.
pub fn start_p2p_session(
    num_players: u32,
    input_size: usize,
    local_port: u16,
) -> Result<P2PSession, RollnetError> {
    if num_players as usize > MAX_PLAYERS {
        return Err(RollnetError::InvalidRequest {
            info: "Too many players.".to_owned(),
        });
    }
    if input_size == 0 || input_size > MAX_INPUT_BYTES {
        return Err(RollnetError::InvalidRequest {
            info: "Input size does not fit the input buffer.".to_owned(),
        });
    }
    P2PSession::new(num_players, input_size, local_port)
        .map_err(|_| RollnetError::SocketCreationFailed)
}

/// Starts a new [`P2PSpectatorSession`] that receives all confirmed inputs from the host
/// at `host_addr` and never contributes inputs of its own.
///
/// # Errors
/// - Returns [`RollnetError::InvalidRequest`] if the player count or input size is out of range.
/// - Returns [`RollnetError::SocketCreationFailed`] if the UDP socket could not be bound.
pub fn start_p2p_spectator_session(
    num_players: u32,
    input_size: usize,
    local_port: u16,
    host_addr: std::net::SocketAddr,
) -> Result<P2PSpectatorSession, RollnetError> {
    if num_players as usize > MAX_PLAYERS {
        return Err(RollnetError::InvalidRequest {
            info: "Too many players.".to_owned(),
        });
    }
    if input_size == 0 || input_size > MAX_INPUT_BYTES {
        return Err(RollnetError::InvalidRequest {
            info: "Input size does not fit the input buffer.".to_owned(),
        });
    }
    P2PSpectatorSession::new(num_players, input_size, local_port, host_addr)
        .map_err(|_| RollnetError::SocketCreationFailed)
}

/// Starts a new [`SyncTestSession`] that runs the simulation locally, but rolls back and
/// resimulates the last `check_distance` frames on every tick, comparing checksums along
/// the way. Useful to verify that your save/load/advance implementation is deterministic.
///
/// # Errors
/// - Returns [`RollnetError::InvalidRequest`] if the player count, input size or check
///   distance is out of range.
pub fn start_synctest_session(
    num_players: u32,
    input_size: usize,
    check_distance: u32,
) -> Result<SyncTestSession, RollnetError> {
    if num_players as usize > MAX_PLAYERS {
        return Err(RollnetError::InvalidRequest {
            info: "Too many players.".to_owned(),
        });
    }
    if input_size == 0 || input_size > MAX_INPUT_BYTES {
        return Err(RollnetError::InvalidRequest {
            info: "Input size does not fit the input buffer.".to_owned(),
        });
    }
    if check_distance as usize >= MAX_PREDICTION_FRAMES {
        return Err(RollnetError::InvalidRequest {
            info: "Check distance too big.".to_owned(),
        });
    }
    Ok(SyncTestSession::new(num_players, input_size, check_distance))
}
