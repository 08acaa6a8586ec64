use std::collections::HashMap;

use crate::error::RollnetError;
use crate::frame_info::GameInput;
use crate::network::udp_msg::ConnectionStatus;
use crate::sync_layer::SyncLayer;
use crate::{Frame, PlayerHandle, PlayerType, RollnetRequest, SessionState};

/// During a `SyncTestSession`, rollnet will simulate a rollback every frame and resimulate the last n states, where n is the given check distance.
/// The resimulated checksums will be compared with the original checksums and report if there was a mismatch, usually a sign that your
/// gamestate is not deterministic or that save/load is incomplete.
#[derive(Debug)]
pub struct SyncTestSession {
    num_players: u32,
    input_size: usize,
    check_distance: u32,
    running: bool,
    sync_layer: SyncLayer,
    dummy_connect_status: Vec<ConnectionStatus>,
    /// The checksum of every frame when it was saved for the first time.
    checksum_history: HashMap<Frame, usize>,
}

impl SyncTestSession {
    /// Creates a new `SyncTestSession` instance with given values.
    pub(crate) fn new(num_players: u32, input_size: usize, check_distance: u32) -> Self {
        let mut dummy_connect_status = Vec::new();
        for _ in 0..num_players {
            dummy_connect_status.push(ConnectionStatus::default());
        }
        Self {
            num_players,
            input_size,
            check_distance,
            running: false,
            sync_layer: SyncLayer::new(num_players, input_size),
            dummy_connect_status,
            checksum_history: HashMap::new(),
        }
    }

    /// Must be called for each player in the session (e.g. in a 3 player session, must be called 3 times).
    /// # Errors
    /// - Returns [`RollnetError::PlayerOutOfRange`] when the provided player handle is too big for the number of players.
    /// - Returns [`RollnetError::InvalidRequest`] for any player type other than [`PlayerType::Local`].
    ///   `SyncTestSession` does not support remote players.
    pub fn add_player(
        &mut self,
        player_type: PlayerType,
        player_handle: PlayerHandle,
    ) -> Result<(), RollnetError> {
        if player_handle >= self.num_players as PlayerHandle {
            return Err(RollnetError::PlayerOutOfRange);
        }
        if player_type != PlayerType::Local {
            return Err(RollnetError::InvalidRequest {
                info: "There are no remote players in a sync test.".to_owned(),
            });
        }
        Ok(())
    }

    /// After you are done defining and adding all players, you should start the session.
    ///
    /// # Errors
    /// - Returns [`RollnetError::InvalidRequest`] if the session is already running.
    pub fn start_session(&mut self) -> Result<(), RollnetError> {
        if self.running {
            return Err(RollnetError::InvalidRequest {
                info: "Session already started.".to_owned(),
            });
        }

        self.running = true;
        Ok(())
    }

    /// In a sync test, this will advance the state by a single frame and afterwards rollback `check_distance` amount of frames,
    /// resimulate and compare checksums with the original states. Returns an order-sensitive `Vec<RollnetRequest>`.
    /// You should fulfill all requests in the exact order they are provided. Failure to do so will cause panics later.
    ///
    /// # Errors
    /// - Returns [`RollnetError::InvalidHandle`] if the provided player handle is higher than the number of players.
    /// - Returns [`RollnetError::MismatchedChecksum`] if checksums don't match after resimulation.
    /// - Returns [`RollnetError::NotSynchronized`] if the session has not been started yet.
    pub fn advance_frame(
        &mut self,
        player_handle: PlayerHandle,
        input: &[u8],
    ) -> Result<Vec<RollnetRequest>, RollnetError> {
        // player handle is invalid
        if player_handle > self.num_players as PlayerHandle {
            return Err(RollnetError::InvalidHandle);
        }
        // session has not been started
        if !self.running {
            return Err(RollnetError::NotSynchronized);
        }

        // compare the checksums of the frames the previous call resimulated with the
        // checksums from when those frames were saved originally
        self.check_resimulated_checksums()?;

        let mut requests = Vec::new();

        // create an input struct for current frame
        let mut current_input: GameInput =
            GameInput::new(self.sync_layer.current_frame(), self.input_size);
        current_input.copy_input(input);

        // send the input into the sync layer
        self.sync_layer
            .add_local_input(player_handle, current_input)?;

        // save the current frame in the synchronization layer
        requests.push(self.sync_layer.save_current_state());

        // get the correct inputs for all players from the sync layer
        let inputs = self
            .sync_layer
            .synchronized_inputs(&self.dummy_connect_status);
        for input in &inputs {
            assert_eq!(input.frame, self.sync_layer.current_frame());
        }

        // advance the frame
        requests.push(RollnetRequest::AdvanceFrame { inputs });
        self.sync_layer.advance_frame();

        // manual simulated rollbacks without using the sync layer, but only if we have enough frames in the past
        if self.check_distance > 0 && self.sync_layer.current_frame() > self.check_distance as i32 {
            let start_frame = self.sync_layer.current_frame();
            // load the frame that lies `check_distance` frames in the past
            let frame_to_load = self.sync_layer.current_frame() - self.check_distance as i32;
            requests.push(self.sync_layer.load_frame(frame_to_load));

            // resimulate the last frames
            for _ in 0..self.check_distance {
                // let the sync layer save
                requests.push(self.sync_layer.save_current_state());

                let inputs = self
                    .sync_layer
                    .synchronized_inputs(&self.dummy_connect_status);
                self.sync_layer.advance_frame();
                requests.push(RollnetRequest::AdvanceFrame { inputs });
            }
            // we should have arrived back at the current frame
            assert_eq!(self.sync_layer.current_frame(), start_frame);

            // since this is a sync test, we "cheat" by setting the last confirmed state to the current state minus the check distance,
            // so the sync layer won't complain about missing inputs from other players
            let safe_frame = self.sync_layer.current_frame() - self.check_distance as i32;
            self.sync_layer.set_last_confirmed_frame(safe_frame);

            // also, we update the dummy connect status to pretend that we received inputs from all players
            for con_stat in &mut self.dummy_connect_status {
                con_stat.last_frame = self.sync_layer.current_frame();
            }
        }

        Ok(requests)
    }

    /// Change the amount of frames rollnet will delay the inputs for a player.
    /// # Errors
    /// - Returns [`RollnetError::InvalidHandle`] if the provided player handle is higher than the number of players.
    pub fn set_frame_delay(
        &mut self,
        frame_delay: u32,
        player_handle: PlayerHandle,
    ) -> Result<(), RollnetError> {
        // player handle is invalid
        if player_handle > self.num_players as PlayerHandle {
            return Err(RollnetError::InvalidHandle);
        }
        self.sync_layer.set_frame_delay(player_handle, frame_delay);
        Ok(())
    }

    /// Returns the current [`SessionState`] of a session.
    pub const fn current_state(&self) -> SessionState {
        if self.running {
            SessionState::Running
        } else {
            SessionState::Initializing
        }
    }

    /// Returns the number of players this session was constructed with.
    pub const fn num_players(&self) -> u32 {
        self.num_players
    }

    /// Compares the checksums the host wrote into the cells resimulated by the previous
    /// call against the checksums recorded when those frames were saved for the first time.
    fn check_resimulated_checksums(&mut self) -> Result<(), RollnetError> {
        let current = self.sync_layer.current_frame();
        for offset in 1..=self.check_distance as i32 {
            let frame = current - offset;
            if frame < 0 {
                continue;
            }
            let cell = match self.sync_layer.saved_state_by_frame(frame) {
                Some(cell) => cell,
                None => continue,
            };
            let checksum = cell.checksum();
            match self.checksum_history.get(&frame) {
                // the frame was resimulated, it must produce the same checksum as before
                Some(&expected) => {
                    if expected != checksum {
                        return Err(RollnetError::MismatchedChecksum { frame });
                    }
                }
                // first time we see this frame saved, remember its checksum
                None => {
                    self.checksum_history.insert(frame, checksum);
                }
            }
        }

        // only keep the checksums the upcoming rollbacks can still reach
        let oldest_relevant = current - 2 * self.check_distance as i32;
        self.checksum_history.retain(|&frame, _| frame >= oldest_relevant);
        Ok(())
    }
}
