use crate::frame_info::GameInput;
use tracing::trace;

/// Number of frame-advantage samples to average over.
const FRAME_WINDOW_SIZE: usize = 40;
/// Number of recent inputs that must be identical for the input to count as idle.
const MIN_UNIQUE_FRAMES: usize = 10;
/// Recommendations below this are not worth interrupting the game for.
const MIN_FRAME_ADVANTAGE: i32 = 3;
/// Never recommend sleeping for more than this amount of frames at once.
const MAX_FRAME_ADVANTAGE: i32 = 9;

/// Estimates the frame advantage between the local and the remote client and recommends
/// how many frames the local client should sleep to let the remote client catch up.
#[derive(Debug)]
pub(crate) struct TimeSync {
    local: [i32; FRAME_WINDOW_SIZE],
    remote: [i32; FRAME_WINDOW_SIZE],
    last_inputs: [GameInput; MIN_UNIQUE_FRAMES],
}

impl Default for TimeSync {
    fn default() -> Self {
        Self {
            local: [0; FRAME_WINDOW_SIZE],
            remote: [0; FRAME_WINDOW_SIZE],
            last_inputs: [GameInput::default(); MIN_UNIQUE_FRAMES],
        }
    }
}

impl TimeSync {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn advance_frame(&mut self, input: &GameInput, local_adv: i32, remote_adv: i32) {
        // remember the last input and the frame advantages
        self.last_inputs[input.frame as usize % self.last_inputs.len()] = *input;
        self.local[input.frame as usize % self.local.len()] = local_adv;
        self.remote[input.frame as usize % self.remote.len()] = remote_adv;
    }

    pub(crate) fn recommend_frame_wait_duration(&self, require_idle_input: bool) -> u32 {
        // average our local and remote frame advantages
        let local_sum: i32 = self.local.iter().sum();
        let local_avg = local_sum as f32 / self.local.len() as f32;
        let remote_sum: i32 = self.remote.iter().sum();
        let remote_avg = remote_sum as f32 / self.remote.len() as f32;

        // See if someone should take action. The person furthest ahead needs to slow down,
        // so the other user can catch up. Only do this if both clients agree on who's ahead.
        if local_avg >= remote_avg {
            return 0;
        }

        // Both clients agree that we're the one ahead. Split the difference between the two
        // to figure out how long to sleep for.
        let sleep_frames = (((remote_avg - local_avg) / 2.0) + 0.5) as i32;
        trace!("recommended sleep frames: {}", sleep_frames);

        // Some things just aren't worth correcting for. Make sure the difference is relevant before proceeding.
        if sleep_frames < MIN_FRAME_ADVANTAGE {
            return 0;
        }

        // Make sure our input had been "idle enough" before recommending a sleep. This tries
        // to make sure the user's input isn't sweeping in arcs (e.g. fireball motions in
        // Street Fighter), which could cause the player to miss moves.
        if require_idle_input {
            for (i, input) in self.last_inputs.iter().enumerate().skip(1) {
                if !input.equal(&self.last_inputs[0], true) {
                    trace!("rejecting sleep due to non-idle input at position {}", i);
                    return 0;
                }
            }
        }

        std::cmp::min(sleep_frames, MAX_FRAME_ADVANTAGE) as u32
    }
}

// #########
// # TESTS #
// #########

#[cfg(test)]
mod time_sync_tests {

    use super::*;

    fn input_at(frame: i32, bits: u32) -> GameInput {
        let mut input = GameInput::new(frame, std::mem::size_of::<u32>());
        input.copy_input(&bits.to_le_bytes());
        input
    }

    #[test]
    fn test_no_advantage() {
        let mut time_sync = TimeSync::default();
        for i in 0..60 {
            time_sync.advance_frame(&input_at(i, 0), 0, 0);
        }
        assert_eq!(time_sync.recommend_frame_wait_duration(false), 0);
    }

    #[test]
    fn test_local_advantage_recommends_no_wait() {
        let mut time_sync = TimeSync::default();
        for i in 0..60 {
            time_sync.advance_frame(&input_at(i, 0), 5, -5);
        }
        assert_eq!(time_sync.recommend_frame_wait_duration(false), 0);
    }

    #[test]
    fn test_small_remote_advantage_is_ignored() {
        let mut time_sync = TimeSync::default();
        for i in 0..60 {
            time_sync.advance_frame(&input_at(i, 0), -1, 1);
        }
        // the difference of a single frame is below the correction threshold
        assert_eq!(time_sync.recommend_frame_wait_duration(false), 0);
    }

    #[test]
    fn test_remote_advantage() {
        let mut time_sync = TimeSync::default();
        for i in 0..60 {
            time_sync.advance_frame(&input_at(i, 0), -4, 4);
        }
        assert_eq!(time_sync.recommend_frame_wait_duration(false), 4);
    }

    #[test]
    fn test_big_remote_advantage_is_capped() {
        let mut time_sync = TimeSync::default();
        for i in 0..60 {
            time_sync.advance_frame(&input_at(i, 0), -40, 40);
        }
        assert_eq!(
            time_sync.recommend_frame_wait_duration(false),
            MAX_FRAME_ADVANTAGE as u32
        );
    }

    #[test]
    fn test_sweeping_input_suppresses_recommendation() {
        let mut time_sync = TimeSync::default();
        for i in 0..60 {
            // the player is mid-motion, every frame has different input
            time_sync.advance_frame(&input_at(i, i as u32), -4, 4);
        }
        assert_eq!(time_sync.recommend_frame_wait_duration(true), 0);
        assert_eq!(time_sync.recommend_frame_wait_duration(false), 4);
    }

    #[test]
    fn test_idle_input_allows_recommendation() {
        let mut time_sync = TimeSync::default();
        for i in 0..60 {
            time_sync.advance_frame(&input_at(i, 7), -4, 4);
        }
        assert_eq!(time_sync.recommend_frame_wait_duration(true), 4);
    }
}
