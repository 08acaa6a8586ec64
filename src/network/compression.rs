//! Delta compression for input packets. Every pending input is encoded as the set of
//! buttons that changed relative to the previous frame in the stream, each change being a
//! `(1, on, button_index)` triplet followed by a `0` terminator bit per frame. The first
//! frame is relative to the last input the remote side acknowledged.

use std::error::Error;
use std::fmt;
use std::fmt::Display;

use crate::frame_info::GameInput;
use crate::network::bitvector;
use crate::Frame;

/// The maximum size of the compressed bitstream of a single input packet.
pub(crate) const MAX_COMPRESSED_BITS: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DecodeError {
    /// The bitstream ended in the middle of a triplet.
    OutOfBounds,
    /// The bitstream addressed a button outside the input buffer.
    BadButtonIndex,
}

impl Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::OutOfBounds => write!(f, "Input bitstream ended unexpectedly."),
            DecodeError::BadButtonIndex => {
                write!(f, "Input bitstream addressed a button outside the input buffer.")
            }
        }
    }
}

impl Error for DecodeError {}

/// Encodes all pending inputs as deltas, starting from the last acked input.
/// Returns the bitstream and the number of valid bits within it.
pub(crate) fn encode<'a>(
    last_acked: &GameInput,
    pending: impl Iterator<Item = &'a GameInput>,
) -> (Vec<u8>, u16) {
    let mut bits = vec![0u8; MAX_COMPRESSED_BITS / 8];
    let mut offset = 0;

    let mut last = *last_acked;
    for current in pending {
        if current.buffer != last.buffer {
            for i in 0..current.size * 8 {
                if current.bit(i) != last.bit(i) {
                    bitvector::set_bit(&mut bits, &mut offset);
                    if current.bit(i) {
                        bitvector::set_bit(&mut bits, &mut offset);
                    } else {
                        bitvector::clear_bit(&mut bits, &mut offset);
                    }
                    bitvector::write_nibblet(&mut bits, i, &mut offset);
                }
            }
        }
        bitvector::clear_bit(&mut bits, &mut offset);
        last = *current;
    }

    assert!(offset < MAX_COMPRESSED_BITS);
    bits.truncate((offset + 7) / 8);
    (bits, offset as u16)
}

/// Decodes a received bitstream on top of `last_received`, which afterwards holds the most
/// recent confirmed input. Frames at or before `last_received.frame` are walked but not
/// applied, since their toggles are already part of the accumulated input. Returns one
/// input per newly confirmed frame.
pub(crate) fn decode(
    last_received: &mut GameInput,
    start_frame: Frame,
    input_size: usize,
    num_bits: u16,
    bits: &[u8],
) -> Result<Vec<GameInput>, DecodeError> {
    let mut recv_inputs = Vec::new();
    if num_bits == 0 {
        return Ok(recv_inputs);
    }

    let num_bits = num_bits as usize;
    let mut offset = 0;
    let mut current_frame = start_frame;

    last_received.size = input_size;
    if last_received.frame < 0 {
        last_received.frame = start_frame - 1;
    }

    while offset < num_bits {
        // Keep walking through the frames (parsing bits) until we reach the inputs for the
        // frame right after the one we're on.
        assert!(current_frame <= last_received.frame + 1);
        let use_inputs = current_frame == last_received.frame + 1;

        while bitvector::read_bit(bits, &mut offset).ok_or(DecodeError::OutOfBounds)? {
            let on = bitvector::read_bit(bits, &mut offset).ok_or(DecodeError::OutOfBounds)?;
            let button =
                bitvector::read_nibblet(bits, &mut offset).ok_or(DecodeError::OutOfBounds)?;
            if button >= last_received.buffer.len() * 8 {
                return Err(DecodeError::BadButtonIndex);
            }
            if use_inputs {
                if on {
                    last_received.set_bit(button);
                } else {
                    last_received.clear_bit(button);
                }
            }
        }
        if offset > num_bits {
            return Err(DecodeError::OutOfBounds);
        }

        // now if we know the inputs of this frame, hand them out
        if use_inputs {
            assert!(current_frame == last_received.frame + 1);
            last_received.frame = current_frame;
            recv_inputs.push(*last_received);
        }
        current_frame += 1;
    }

    Ok(recv_inputs)
}

// #########
// # TESTS #
// #########
