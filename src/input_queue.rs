use crate::frame_info::GameInput;
use crate::{Frame, PlayerHandle, NULL_FRAME};
use std::cmp;
use tracing::trace;

/// The length of the input queue. This describes the number of inputs rollnet can hold at the same time per player.
const INPUT_QUEUE_LENGTH: usize = 128;

/// `InputQueue` handles inputs for a single player and saves them in a circular array. Valid inputs are between `tail` and `head`.
#[derive(Debug, Clone)]
pub(crate) struct InputQueue {
    /// Identifies the player this InputQueue belongs to
    id: PlayerHandle,
    /// The head of the queue. The newest `GameInput` is saved here
    head: usize,
    /// The tail of the queue. The oldest `GameInput` still valid is saved here.
    tail: usize,
    /// The current length of the queue.
    length: usize,
    /// Denotes if we still are in the first frame, an edge case to be considered by some methods.
    first_frame: bool,

    /// The last frame the user passed to `add_input`, before frame delay is applied. Users must pass frames in strictly sequentially.
    last_user_added_frame: Frame,
    /// The last frame stored in the queue, after frame delay is applied.
    last_added_frame: Frame,
    /// The first frame in the queue that is known to be an incorrect prediction
    first_incorrect_frame: Frame,
    /// The last frame that has been requested. We make sure to never delete anything after this, as we would throw away important data.
    last_requested_frame: Frame,

    /// The delay in frames by which inputs are sent back to the user. This can be set during initialization.
    frame_delay: u32,

    /// Our cyclic input queue
    inputs: [GameInput; INPUT_QUEUE_LENGTH],
    /// A pre-allocated prediction we are going to use to return predictions from.
    prediction: GameInput,
}

impl InputQueue {
    pub(crate) fn new(id: PlayerHandle, input_size: usize) -> Self {
        Self {
            id,
            head: 0,
            tail: 0,
            length: 0,
            frame_delay: 0,
            first_frame: true,
            last_user_added_frame: NULL_FRAME,
            last_added_frame: NULL_FRAME,
            first_incorrect_frame: NULL_FRAME,
            last_requested_frame: NULL_FRAME,

            prediction: GameInput::new(NULL_FRAME, input_size),
            inputs: [GameInput::new(NULL_FRAME, input_size); INPUT_QUEUE_LENGTH],
        }
    }

    pub(crate) const fn first_incorrect_frame(&self) -> Frame {
        self.first_incorrect_frame
    }

    pub(crate) fn set_frame_delay(&mut self, delay: u32) {
        self.frame_delay = delay;
    }

    /// Resets the prediction state after a rollback to `frame`. The rollback must not reach
    /// past the first mispredicted frame, otherwise inputs needed for resimulation are gone.
    pub(crate) fn reset_prediction(&mut self, frame: Frame) {
        assert!(self.first_incorrect_frame == NULL_FRAME || frame <= self.first_incorrect_frame);

        trace!("queue {}: resetting prediction errors back to frame {}", self.id, frame);

        self.prediction.frame = NULL_FRAME;
        self.first_incorrect_frame = NULL_FRAME;
        self.last_requested_frame = NULL_FRAME;
    }

    /// Returns a `GameInput`, but only if the input for the requested frame is confirmed.
    /// In contrast to `input()`, this will not return a prediction if there is no confirmed input for the frame, but panic instead.
    pub(crate) fn confirmed_input(&self, requested_frame: Frame) -> GameInput {
        // a known incorrect frame and anything after it cannot be confirmed
        assert!(
            self.first_incorrect_frame == NULL_FRAME
                || requested_frame < self.first_incorrect_frame
        );

        let offset = requested_frame as usize % INPUT_QUEUE_LENGTH;
        if self.inputs[offset].frame == requested_frame {
            return self.inputs[offset];
        }

        panic!("SyncLayer::confirmed_input(): There is no confirmed input for the requested frame");
    }

    /// Discards confirmed frames up to given `frame` from the queue. All confirmed frames are guaranteed to be synchronized between players, so there is no need to save the inputs anymore.
    pub(crate) fn discard_confirmed_frames(&mut self, mut frame: Frame) {
        assert!(frame >= 0);

        // we only drop frames until the last frame that was requested, otherwise we might delete data still needed
        if self.last_requested_frame != NULL_FRAME {
            frame = cmp::min(frame, self.last_requested_frame);
        }

        trace!(
            "queue {}: discarding confirmed frames up to {} (last_added: {}, length: {})",
            self.id,
            frame,
            self.last_added_frame,
            self.length
        );

        // move the tail to delete inputs, wrap around if necessary
        if frame >= self.last_added_frame {
            self.tail = self.head;
            self.length = 0;
        } else if frame < self.inputs[self.tail].frame {
            // we don't need to delete anything
        } else {
            let offset = (frame - self.inputs[self.tail].frame + 1) as usize;
            assert!(offset <= self.length);
            self.tail = (self.tail + offset) % INPUT_QUEUE_LENGTH;
            self.length -= offset;
        }
    }

    /// Returns the game input of a single player for a given frame, if that input does not exist, we return a prediction instead.
    pub(crate) fn input(&mut self, requested_frame: Frame) -> GameInput {
        // No one should ever try to grab any input when we have a prediction error.
        // Doing so means that we're just going further down the wrong path. Assert this to verify that it's true.
        assert!(self.first_incorrect_frame == NULL_FRAME);

        // Remember the last requested frame number for later. We'll need this in add_input() to drop out of prediction mode.
        self.last_requested_frame = requested_frame;

        // assert that we request a frame that still exists
        assert!(requested_frame >= self.inputs[self.tail].frame);

        // We currently don't have a prediction frame
        if self.prediction.frame < 0 {
            //  If the frame requested is in our range, fetch it out of the queue and return it.
            let mut offset: usize = (requested_frame - self.inputs[self.tail].frame) as usize;

            if offset < self.length {
                offset = (offset + self.tail) % INPUT_QUEUE_LENGTH;
                assert!(self.inputs[offset].frame == requested_frame);
                return self.inputs[offset]; // GameInput has copy semantics
            }

            // The requested frame isn't in the queue. This means we need to return a prediction frame. Predict that the user will do the same thing they did last time.
            if requested_frame == 0 || self.last_added_frame == NULL_FRAME {
                // basing new prediction frame from nothing, since we are on frame 0 or we have no frames yet
                self.prediction.erase_bits();
            } else {
                // basing new prediction frame from previously added frame
                let previous_position = match self.head {
                    0 => INPUT_QUEUE_LENGTH - 1,
                    _ => self.head - 1,
                };
                self.prediction = self.inputs[previous_position];
            }
            // update the prediction's frame
            self.prediction.frame += 1;
            trace!(
                "queue {}: starting prediction from frame {}",
                self.id,
                self.prediction.frame
            );
        }

        // We must be predicting, so we return the prediction frame contents. We are adjusting the prediction to have the requested frame.
        assert!(self.prediction.frame != NULL_FRAME);
        let mut prediction_to_return = self.prediction; // GameInput has copy semantics
        prediction_to_return.frame = requested_frame;
        prediction_to_return
    }

    /// Adds an input frame to the queue. Will consider the set frame delay.
    pub(crate) fn add_input(&mut self, input: GameInput) -> Frame {
        // Verify that inputs are passed in sequentially by the user, regardless of frame delay.
        assert!(
            self.last_user_added_frame == NULL_FRAME
                || input.frame == self.last_user_added_frame + 1
        );
        self.last_user_added_frame = input.frame;

        // Move the queue head to the correct point in preparation to input the frame into the queue.
        let new_frame = self.advance_queue_head(input.frame);
        // if the frame is valid, then add the input
        if new_frame != NULL_FRAME {
            self.add_input_by_frame(input, new_frame);
        }
        new_frame
    }

    /// Adds an input frame to the queue at the given frame number. If there are predicted inputs, we will check those and mark them as incorrect, if necessary.
    fn add_input_by_frame(&mut self, input: GameInput, frame_number: Frame) {
        let previous_position = match self.head {
            0 => INPUT_QUEUE_LENGTH - 1,
            _ => self.head - 1,
        };

        assert!(input.size == self.prediction.size);
        assert!(self.last_added_frame == NULL_FRAME || frame_number == self.last_added_frame + 1);
        assert!(frame_number == 0 || self.inputs[previous_position].frame == frame_number - 1);

        // Add the frame to the back of the queue
        self.inputs[self.head] = input;
        self.inputs[self.head].frame = frame_number;
        self.head = (self.head + 1) % INPUT_QUEUE_LENGTH;
        self.length += 1;
        assert!(self.length <= INPUT_QUEUE_LENGTH);
        self.first_frame = false;
        self.last_added_frame = frame_number;

        // We have been predicting. See if the inputs we've gotten match what we've been predicting. If so, don't worry about it.
        if self.prediction.frame != NULL_FRAME {
            assert!(frame_number == self.prediction.frame);

            // Remember the first input which was incorrect so we can report it
            if self.first_incorrect_frame == NULL_FRAME && !self.prediction.equal(&input, true) {
                trace!("queue {}: misprediction at frame {}", self.id, frame_number);
                self.first_incorrect_frame = frame_number;
            }

            // If this input is the same frame as the last one requested and we still haven't found any mispredicted inputs, we can exit prediction mode.
            // Otherwise, advance the prediction frame count up.
            if self.prediction.frame == self.last_requested_frame
                && self.first_incorrect_frame == NULL_FRAME
            {
                self.prediction.frame = NULL_FRAME;
            } else {
                self.prediction.frame += 1;
            }
        }
    }

    /// Advances the queue head to the next frame and either drops inputs or fills the queue if the input delay has changed since the last frame.
    fn advance_queue_head(&mut self, mut input_frame: Frame) -> Frame {
        let mut previous_position = match self.head {
            0 => INPUT_QUEUE_LENGTH - 1,
            _ => self.head - 1,
        };

        let mut expected_frame = if self.first_frame {
            0
        } else {
            self.inputs[previous_position].frame + 1
        };

        input_frame += self.frame_delay as i32;
        //  This can occur when the frame delay has dropped since the last time we shoved a frame into the system. In this case, there's no room on the queue. Toss it.
        if expected_frame > input_frame {
            trace!(
                "queue {}: dropping input frame {} (expected next frame to be {})",
                self.id,
                input_frame,
                expected_frame
            );
            return NULL_FRAME;
        }

        // This can occur when the frame delay has been increased since the last time we shoved a frame into the system.
        // We need to replicate the last frame in the queue several times in order to fill the space left.
        while expected_frame < input_frame {
            let input_to_replicate = self.inputs[previous_position];
            self.add_input_by_frame(input_to_replicate, expected_frame);
            expected_frame += 1;
        }

        previous_position = match self.head {
            0 => INPUT_QUEUE_LENGTH - 1,
            _ => self.head - 1,
        };
        assert!(input_frame == 0 || input_frame == self.inputs[previous_position].frame + 1);
        input_frame
    }
}

// #########
// # TESTS #
// #########

#[cfg(test)]
mod input_queue_tests {

    use super::*;

    #[test]
    #[should_panic]
    fn test_add_input_wrong_frame() {
        let mut queue = InputQueue::new(0, std::mem::size_of::<u32>());
        let input = GameInput::new(0, std::mem::size_of::<u32>());
        queue.add_input(input); // fine
        let input_wrong_frame = GameInput::new(3, std::mem::size_of::<u32>());
        queue.add_input(input_wrong_frame); // not fine
    }

    #[test]
    #[should_panic]
    fn test_add_input_twice() {
        let mut queue = InputQueue::new(0, std::mem::size_of::<u32>());
        let input = GameInput::new(0, std::mem::size_of::<u32>());
        queue.add_input(input); // fine
        queue.add_input(input); // not fine
    }

    #[test]
    fn test_add_input_sequentially() {
        let mut queue = InputQueue::new(0, std::mem::size_of::<u32>());
        for i in 0..10 {
            let input = GameInput::new(i, std::mem::size_of::<u32>());
            queue.add_input(input);
            assert_eq!(queue.last_added_frame, i);
            assert_eq!(queue.length, (i + 1) as usize);
        }
    }

    #[test]
    fn test_input_sequentially() {
        let mut queue = InputQueue::new(0, std::mem::size_of::<u32>());
        for i in 0..10 {
            let mut input = GameInput::new(i, std::mem::size_of::<u32>());
            let fake_inputs: u32 = i as u32;
            let serialized_inputs = bincode::serialize(&fake_inputs).unwrap();
            input.copy_input(&serialized_inputs);
            queue.add_input(input);
            assert_eq!(queue.last_added_frame, i);
            assert_eq!(queue.length, (i + 1) as usize);
            let input_in_queue = queue.input(i);
            assert!(input_in_queue.equal(&input, false));
        }
    }

    #[test]
    fn test_delayed_inputs() {
        let mut queue = InputQueue::new(0, std::mem::size_of::<u32>());
        let delay: i32 = 2;
        queue.set_frame_delay(delay as u32);
        for i in 0..10 {
            let mut input = GameInput::new(i, std::mem::size_of::<u32>());
            let fake_inputs: u32 = i as u32;
            let serialized_inputs = bincode::serialize(&fake_inputs).unwrap();
            input.copy_input(&serialized_inputs);
            queue.add_input(input);
            assert_eq!(queue.last_added_frame, i + delay);
            assert_eq!(queue.length, (i + delay + 1) as usize);
            let input_in_queue = queue.input(i + delay);
            assert!(input_in_queue.equal(&input, true));
        }
    }

    #[test]
    fn test_frame_delay_increase_pads_with_copies() {
        let mut queue = InputQueue::new(0, std::mem::size_of::<u32>());
        for i in 0..10 {
            let mut input = GameInput::new(i, std::mem::size_of::<u32>());
            let fake_inputs: u32 = i as u32;
            let serialized_inputs = bincode::serialize(&fake_inputs).unwrap();
            input.copy_input(&serialized_inputs);
            queue.add_input(input);
        }

        // raising the delay mid-game leaves a gap that is filled with copies of frame 9
        queue.set_frame_delay(2);
        let mut input = GameInput::new(10, std::mem::size_of::<u32>());
        let fake_inputs: u32 = 10;
        let serialized_inputs = bincode::serialize(&fake_inputs).unwrap();
        input.copy_input(&serialized_inputs);
        let added_frame = queue.add_input(input);

        assert_eq!(added_frame, 12);
        assert_eq!(queue.last_added_frame, 12);
        assert_eq!(queue.length, 13);

        let padding_bits = bincode::serialize(&9u32).unwrap();
        for frame in 10..12 {
            let padded = queue.input(frame);
            assert_eq!(padded.frame, frame);
            assert_eq!(padded.input(), &padding_bits[..]);
        }
        assert_eq!(queue.input(12).input(), &serialized_inputs[..]);
    }

    #[test]
    fn test_frame_delay_decrease_drops_inputs() {
        let mut queue = InputQueue::new(0, std::mem::size_of::<u32>());
        queue.set_frame_delay(2);
        for i in 0..5 {
            let input = GameInput::new(i, std::mem::size_of::<u32>());
            queue.add_input(input);
        }
        assert_eq!(queue.last_added_frame, 6);

        // with the delay gone, the next inputs land on frames that already exist and are tossed
        queue.set_frame_delay(0);
        let dropped = queue.add_input(GameInput::new(5, std::mem::size_of::<u32>()));
        assert_eq!(dropped, NULL_FRAME);
        assert_eq!(queue.last_added_frame, 6);
        let dropped = queue.add_input(GameInput::new(6, std::mem::size_of::<u32>()));
        assert_eq!(dropped, NULL_FRAME);
        // this one lands just past the end of the queue again
        let added = queue.add_input(GameInput::new(7, std::mem::size_of::<u32>()));
        assert_eq!(added, 7);
    }

    #[test]
    fn test_prediction_ends_on_matching_input() {
        let input_size = std::mem::size_of::<u32>();
        let mut queue = InputQueue::new(0, input_size);

        let mut input = GameInput::new(0, input_size);
        input.copy_input(&bincode::serialize(&42u32).unwrap());
        queue.add_input(input);

        // frame 1 is not in the queue, so this latches a prediction with frame 0's bits
        let predicted = queue.input(1);
        assert_eq!(predicted.frame, 1);
        assert!(predicted.equal(&input, true));

        // the confirmed input matches the prediction at the last requested frame, prediction mode ends
        let mut confirmed = GameInput::new(1, input_size);
        confirmed.copy_input(&bincode::serialize(&42u32).unwrap());
        queue.add_input(confirmed);
        assert_eq!(queue.prediction.frame, NULL_FRAME);
        assert_eq!(queue.first_incorrect_frame, NULL_FRAME);
    }

    #[test]
    fn test_misprediction_is_detected() {
        let input_size = std::mem::size_of::<u32>();
        let mut queue = InputQueue::new(0, input_size);

        let mut input = GameInput::new(0, input_size);
        input.copy_input(&bincode::serialize(&0u32).unwrap());
        queue.add_input(input);

        queue.input(1); // predicts frame 0's bits

        let mut confirmed = GameInput::new(1, input_size);
        confirmed.copy_input(&bincode::serialize(&4u32).unwrap());
        queue.add_input(confirmed);
        assert_eq!(queue.first_incorrect_frame, 1);

        // after the rollback, the queue serves the confirmed input again
        queue.reset_prediction(1);
        assert_eq!(queue.first_incorrect_frame, NULL_FRAME);
        let requeried = queue.input(1);
        assert!(requeried.equal(&confirmed, false));
    }
}
