use parking_lot::Mutex;
use std::cmp;
use std::sync::Arc;
use tracing::trace;

use crate::error::RollnetError;
use crate::frame_info::{GameInput, GameState};
use crate::input_queue::InputQueue;
use crate::network::udp_msg::ConnectionStatus;
use crate::{Frame, PlayerHandle, RollnetRequest, MAX_PREDICTION_FRAMES, NULL_FRAME};

/// An [`Arc<Mutex>`] that you can [`save()`]/[`load()`] a [`GameState`] to/from. These will be handed to the user as part of a [`RollnetRequest`].
///
/// [`save()`]: GameStateCell#method.save
/// [`load()`]: GameStateCell#method.load
/// [`RollnetRequest`]: crate::RollnetRequest
pub struct GameStateCell(Arc<Mutex<GameState>>);

impl GameStateCell {
    /// Saves a `GameState` the user creates into the cell. The previously saved state is dropped.
    pub fn save(&self, state: GameState) {
        assert!(state.frame != NULL_FRAME);
        *self.0.lock() = state;
    }

    /// Loads the `GameState` that the user previously saved into the cell.
    pub fn load(&self) -> GameState {
        self.0.lock().clone()
    }

    pub(crate) fn frame(&self) -> Frame {
        self.0.lock().frame
    }

    pub(crate) fn checksum(&self) -> usize {
        self.0.lock().checksum
    }
}

impl Default for GameStateCell {
    fn default() -> Self {
        Self(Arc::new(Mutex::new(GameState::default())))
    }
}

impl Clone for GameStateCell {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl std::fmt::Debug for GameStateCell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.0.lock();
        f.debug_struct("GameStateCell")
            .field("frame", &state.frame)
            .field("checksum", &state.checksum)
            .finish()
    }
}

/// The saved states ring. Each slot exclusively owns the host-supplied buffer saved into
/// it; overwriting a slot drops the previous buffer.
#[derive(Debug, Clone)]
struct SavedStates {
    states: Vec<GameStateCell>,
}

impl SavedStates {
    fn new() -> Self {
        // the states are two cells bigger than the max prediction frames in order to account
        // for the next frame needing a space and still being able to rollback the max distance
        let mut states = Vec::with_capacity(MAX_PREDICTION_FRAMES + 2);
        for _ in 0..MAX_PREDICTION_FRAMES + 2 {
            states.push(GameStateCell::default());
        }

        Self { states }
    }

    fn get_cell(&self, frame: Frame) -> GameStateCell {
        assert!(frame >= 0);
        let pos = frame as usize % self.states.len();
        self.states[pos].clone()
    }
}

/// The `SyncLayer` aggregates all input queues and the saved states, detects mispredictions
/// and drives the rollback.
#[derive(Debug)]
pub(crate) struct SyncLayer {
    num_players: u32,
    input_size: usize,
    saved_states: SavedStates,
    last_confirmed_frame: Frame,
    current_frame: Frame,
    input_queues: Vec<InputQueue>,
}

impl SyncLayer {
    /// Creates a new `SyncLayer` instance with given values.
    pub(crate) fn new(num_players: u32, input_size: usize) -> Self {
        // initialize input_queues
        let mut input_queues = Vec::new();
        for i in 0..num_players {
            input_queues.push(InputQueue::new(i as PlayerHandle, input_size));
        }
        Self {
            num_players,
            input_size,
            last_confirmed_frame: NULL_FRAME,
            current_frame: 0,
            saved_states: SavedStates::new(),
            input_queues,
        }
    }

    pub(crate) const fn current_frame(&self) -> Frame {
        self.current_frame
    }

    pub(crate) fn advance_frame(&mut self) {
        self.current_frame += 1;
    }

    pub(crate) fn save_current_state(&mut self) -> RollnetRequest {
        let cell = self.saved_states.get_cell(self.current_frame);
        RollnetRequest::SaveGameState {
            cell,
            frame: self.current_frame,
        }
    }

    pub(crate) fn set_frame_delay(&mut self, player_handle: PlayerHandle, delay: u32) {
        assert!(player_handle < self.num_players as PlayerHandle);
        self.input_queues[player_handle].set_frame_delay(delay);
    }

    pub(crate) fn reset_prediction(&mut self, frame: Frame) {
        for i in 0..self.num_players as usize {
            self.input_queues[i].reset_prediction(frame);
        }
    }

    /// Loads the gamestate indicated by `frame_to_load`.
    pub(crate) fn load_frame(&mut self, frame_to_load: Frame) -> RollnetRequest {
        // The state should not be the current state or the state should not be in the future or too far away in the past
        assert!(
            frame_to_load != NULL_FRAME
                && frame_to_load < self.current_frame
                && frame_to_load >= self.current_frame - MAX_PREDICTION_FRAMES as i32
        );

        let cell = self.saved_states.get_cell(frame_to_load);
        // the saved states ring is sized so that a frame this close in the past must still reside in it
        assert_eq!(cell.frame(), frame_to_load);
        self.current_frame = frame_to_load;

        RollnetRequest::LoadGameState {
            cell,
            frame: frame_to_load,
        }
    }

    /// Adds local input to the corresponding input queue. Checks if the prediction threshold has been reached. Returns the frame number where the input is actually added to.
    /// This number will only be different if the input delay was set to a number higher than 0.
    pub(crate) fn add_local_input(
        &mut self,
        player_handle: PlayerHandle,
        input: GameInput,
    ) -> Result<Frame, RollnetError> {
        let frames_ahead = self.current_frame - self.last_confirmed_frame;
        if self.current_frame >= MAX_PREDICTION_FRAMES as i32
            && frames_ahead >= MAX_PREDICTION_FRAMES as i32
        {
            trace!("rejecting input: reached prediction barrier");
            return Err(RollnetError::PredictionThreshold);
        }

        // The input provided should match the current frame, we account for input delay later
        assert_eq!(input.frame, self.current_frame);
        Ok(self.input_queues[player_handle].add_input(input))
    }

    /// Adds remote input to the corresponding input queue.
    /// Unlike `add_local_input`, this will not check for the prediction barrier, as remote inputs have already been checked on another device.
    pub(crate) fn add_remote_input(&mut self, player_handle: PlayerHandle, input: GameInput) {
        self.input_queues[player_handle].add_input(input);
    }

    /// Returns inputs for all players for the current frame of the sync layer. If there are none for a specific player, return predictions.
    /// Disconnected players are represented by an input with `NULL_FRAME` and zeroed bits.
    pub(crate) fn synchronized_inputs(
        &mut self,
        connect_status: &[ConnectionStatus],
    ) -> Vec<GameInput> {
        let mut inputs = Vec::new();
        for (i, con_stat) in connect_status.iter().enumerate() {
            if con_stat.disconnected && con_stat.last_frame < self.current_frame {
                inputs.push(GameInput::new(NULL_FRAME, self.input_size));
            } else {
                inputs.push(self.input_queues[i].input(self.current_frame));
            }
        }
        inputs
    }

    /// Returns confirmed inputs for all players for the given frame of the sync layer.
    pub(crate) fn confirmed_inputs(
        &self,
        frame: Frame,
        connect_status: &[ConnectionStatus],
    ) -> Vec<GameInput> {
        let mut inputs = Vec::new();
        for (i, con_stat) in connect_status.iter().enumerate() {
            if con_stat.disconnected && con_stat.last_frame < frame {
                inputs.push(GameInput::new(NULL_FRAME, self.input_size));
            } else {
                inputs.push(self.input_queues[i].confirmed_input(frame));
            }
        }
        inputs
    }

    /// Sets the last confirmed frame to a given frame. By raising the last confirmed frame, we can discard all previous frames, as they are no longer necessary.
    pub(crate) fn set_last_confirmed_frame(&mut self, frame: Frame) {
        // dropping inputs at or past the first incorrect frame would discard data the upcoming rollback still needs
        let mut first_incorrect: Frame = NULL_FRAME;
        for handle in 0..self.num_players as usize {
            first_incorrect = cmp::max(
                first_incorrect,
                self.input_queues[handle].first_incorrect_frame(),
            );
        }
        assert!(first_incorrect == NULL_FRAME || first_incorrect >= frame);

        self.last_confirmed_frame = frame;
        if self.last_confirmed_frame > 0 {
            for i in 0..self.num_players as usize {
                self.input_queues[i].discard_confirmed_frames(frame - 1);
            }
        }
    }

    /// Finds the earliest incorrect frame detected by the individual input queues, or
    /// `disconnect_frame`, if that is earlier still.
    pub(crate) fn check_simulation_consistency(&self, mut first_incorrect: Frame) -> Frame {
        for handle in 0..self.num_players as usize {
            let incorrect = self.input_queues[handle].first_incorrect_frame();
            if incorrect != NULL_FRAME
                && (first_incorrect == NULL_FRAME || incorrect < first_incorrect)
            {
                first_incorrect = incorrect;
            }
        }
        first_incorrect
    }

    /// Returns the gamestate cell for the given frame, if the cell still holds that frame.
    pub(crate) fn saved_state_by_frame(&self, frame: Frame) -> Option<GameStateCell> {
        let cell = self.saved_states.get_cell(frame);

        if cell.frame() == frame {
            Some(cell)
        } else {
            None
        }
    }
}

// #########
// # TESTS #
// #########

#[cfg(test)]
mod sync_layer_tests {

    use super::*;

    #[test]
    fn test_reach_prediction_threshold() {
        let input_size = std::mem::size_of::<u32>();
        let mut sync_layer = SyncLayer::new(2, input_size);
        for i in 0..20 {
            let game_input = GameInput::new(i, input_size);
            let result = sync_layer.add_local_input(0, game_input);
            // the prediction barrier stops local input once we are a full prediction window ahead
            if i < MAX_PREDICTION_FRAMES as i32 {
                assert!(result.is_ok());
                sync_layer.advance_frame();
            } else {
                assert_eq!(result, Err(RollnetError::PredictionThreshold));
                return;
            }
        }
    }

    #[test]
    fn test_different_delays() {
        let input_size = std::mem::size_of::<u32>();
        let mut sync_layer = SyncLayer::new(2, input_size);
        let p1_delay = 2;
        let p2_delay = 0;
        sync_layer.set_frame_delay(0, p1_delay);
        sync_layer.set_frame_delay(1, p2_delay);

        let mut dummy_connect_status = Vec::new();
        dummy_connect_status.push(ConnectionStatus::default());
        dummy_connect_status.push(ConnectionStatus::default());

        for i in 0..20 {
            let mut game_input = GameInput::new(i, input_size);
            game_input.copy_input(&(i as u32).to_le_bytes());
            // adding input as remote to avoid the prediction barrier
            sync_layer.add_remote_input(0, game_input);
            sync_layer.add_remote_input(1, game_input);
            // update the dummy connect status
            dummy_connect_status[0].last_frame = i;
            dummy_connect_status[1].last_frame = i;

            if i >= 3 {
                let sync_inputs = sync_layer.synchronized_inputs(&dummy_connect_status);
                let player0_inputs =
                    u32::from_le_bytes(sync_inputs[0].input().try_into().unwrap());
                let player1_inputs =
                    u32::from_le_bytes(sync_inputs[1].input().try_into().unwrap());
                assert_eq!(player0_inputs, i as u32 - p1_delay);
                assert_eq!(player1_inputs, i as u32 - p2_delay);
            }

            sync_layer.advance_frame();
        }
    }

    #[test]
    fn test_disconnected_players_get_null_inputs() {
        let input_size = std::mem::size_of::<u32>();
        let mut sync_layer = SyncLayer::new(2, input_size);

        let mut dummy_connect_status = vec![ConnectionStatus::default(); 2];
        dummy_connect_status[1].disconnected = true;
        dummy_connect_status[1].last_frame = NULL_FRAME;

        sync_layer.add_remote_input(0, GameInput::new(0, input_size));
        dummy_connect_status[0].last_frame = 0;

        let inputs = sync_layer.synchronized_inputs(&dummy_connect_status);
        assert_eq!(inputs[0].frame, 0);
        assert_eq!(inputs[1].frame, NULL_FRAME);
    }
}
