//! Netplay input frames and the input-channel messages that carry them.

use bitflags::bitflags;

use crate::error::ProtoError;

bitflags! {
    /// The handheld's 12 buttons. Bit semantics follow the hardware key
    /// register: a **set** bit means the button is *released*.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DsKeys: u16 {
        const A      = 0x001;
        const B      = 0x002;
        const SELECT = 0x004;
        const START  = 0x008;
        const RIGHT  = 0x010;
        const LEFT   = 0x020;
        const UP     = 0x040;
        const DOWN   = 0x080;
        const R      = 0x100;
        const L      = 0x200;
        const X      = 0x400;
        const Y      = 0x800;
    }
}

impl DsKeys {
    /// Neutral state: every button released.
    pub const RELEASED: DsKeys = DsKeys::all();
}

/// Wire size of one packed input frame.
pub const INPUT_FRAME_WIRE_LEN: usize = 18;

/// One frame of player input.
///
/// Wire layout (18 bytes, little-endian):
/// - 0..4   frame number
/// - 4..8   key mask (low 12 bits used, 1 = released)
/// - 8      touching flag
/// - 9..11  touch x
/// - 11..13 touch y
/// - 13     lid closed flag
/// - 14..18 checksum over bytes 0..14
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputFrame {
    pub frame: u32,
    pub keys: DsKeys,
    pub touching: bool,
    pub touch_x: u16,
    pub touch_y: u16,
    pub lid_closed: bool,
}

impl InputFrame {
    /// Neutral input for the given frame: all buttons released, no touch,
    /// lid open. Used to pre-fill the first `delay` ring slots.
    pub fn neutral(frame: u32) -> Self {
        Self {
            frame,
            keys: DsKeys::RELEASED,
            touching: false,
            touch_x: 0,
            touch_y: 0,
            lid_closed: false,
        }
    }

    pub fn encode_into(&self, out: &mut [u8; INPUT_FRAME_WIRE_LEN]) {
        out[0..4].copy_from_slice(&self.frame.to_le_bytes());
        out[4..8].copy_from_slice(&u32::from(self.keys.bits()).to_le_bytes());
        out[8] = self.touching as u8;
        out[9..11].copy_from_slice(&self.touch_x.to_le_bytes());
        out[11..13].copy_from_slice(&self.touch_y.to_le_bytes());
        out[13] = self.lid_closed as u8;
        let checksum = byte_sum(&out[..14]);
        out[14..18].copy_from_slice(&checksum.to_le_bytes());
    }

    /// Decode and verify one frame from the first 18 bytes of `buf`.
    pub fn decode(buf: &[u8]) -> Result<Self, ProtoError> {
        if buf.len() < INPUT_FRAME_WIRE_LEN {
            return Err(ProtoError::TooShort);
        }
        let expected = u32::from_le_bytes(buf[14..18].try_into().expect("slice length is 4"));
        let got = byte_sum(&buf[..14]);
        if expected != got {
            return Err(ProtoError::BadChecksum { expected, got });
        }
        let frame = u32::from_le_bytes(buf[0..4].try_into().expect("slice length is 4"));
        let raw_keys = u32::from_le_bytes(buf[4..8].try_into().expect("slice length is 4"));
        let keys = DsKeys::from_bits_truncate(raw_keys as u16);
        Ok(Self {
            frame,
            keys,
            touching: buf[8] != 0,
            touch_x: u16::from_le_bytes(buf[9..11].try_into().expect("slice length is 2")),
            touch_y: u16::from_le_bytes(buf[11..13].try_into().expect("slice length is 2")),
            lid_closed: buf[13] != 0,
        })
    }
}

fn byte_sum(bytes: &[u8]) -> u32 {
    bytes.iter().fold(0u32, |acc, &b| acc.wrapping_add(u32::from(b)))
}

/// Messages exchanged on the input channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputMsg {
    /// `0x30`: one input frame from the sender.
    Frame(InputFrame),
    /// `0x31`: `count` consecutive input frames from the sender.
    Batch(Vec<InputFrame>),
    /// `0x32`: host-relayed input of another participant.
    Relay { player_id: u8, input: InputFrame },
}

const TAG_FRAME: u8 = 0x30;
const TAG_BATCH: u8 = 0x31;
const TAG_RELAY: u8 = 0x32;

impl InputMsg {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            InputMsg::Frame(input) => {
                let mut out = vec![TAG_FRAME];
                let mut frame = [0u8; INPUT_FRAME_WIRE_LEN];
                input.encode_into(&mut frame);
                out.extend_from_slice(&frame);
                out
            }
            InputMsg::Batch(inputs) => {
                debug_assert!(inputs.len() <= u8::MAX as usize);
                let mut out = vec![TAG_BATCH, inputs.len() as u8];
                let mut frame = [0u8; INPUT_FRAME_WIRE_LEN];
                for input in inputs {
                    input.encode_into(&mut frame);
                    out.extend_from_slice(&frame);
                }
                out
            }
            InputMsg::Relay { player_id, input } => {
                let mut out = vec![TAG_RELAY, *player_id];
                let mut frame = [0u8; INPUT_FRAME_WIRE_LEN];
                input.encode_into(&mut frame);
                out.extend_from_slice(&frame);
                out
            }
        }
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ProtoError> {
        let (&tag, rest) = buf.split_first().ok_or(ProtoError::TooShort)?;
        match tag {
            TAG_FRAME => {
                expect_len(rest, INPUT_FRAME_WIRE_LEN)?;
                Ok(InputMsg::Frame(InputFrame::decode(rest)?))
            }
            TAG_BATCH => {
                let (&count, frames) = rest.split_first().ok_or(ProtoError::TooShort)?;
                expect_len(frames, count as usize * INPUT_FRAME_WIRE_LEN)?;
                let inputs = frames
                    .chunks_exact(INPUT_FRAME_WIRE_LEN)
                    .map(InputFrame::decode)
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(InputMsg::Batch(inputs))
            }
            TAG_RELAY => {
                let (&player_id, frame) = rest.split_first().ok_or(ProtoError::TooShort)?;
                expect_len(frame, INPUT_FRAME_WIRE_LEN)?;
                Ok(InputMsg::Relay {
                    player_id,
                    input: InputFrame::decode(frame)?,
                })
            }
            other => Err(ProtoError::UnknownTag(other)),
        }
    }
}

fn expect_len(buf: &[u8], expected: usize) -> Result<(), ProtoError> {
    if buf.len() != expected {
        return Err(ProtoError::LengthMismatch {
            expected,
            got: buf.len(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pressed_a(frame: u32) -> InputFrame {
        InputFrame {
            keys: DsKeys::RELEASED - DsKeys::A,
            ..InputFrame::neutral(frame)
        }
    }

    #[test]
    fn input_frame_is_18_bytes_and_checksummed() {
        let input = InputFrame {
            frame: 41,
            keys: DsKeys::RELEASED - DsKeys::START,
            touching: true,
            touch_x: 128,
            touch_y: 96,
            lid_closed: false,
        };
        let mut buf = [0u8; INPUT_FRAME_WIRE_LEN];
        input.encode_into(&mut buf);

        assert_eq!(u32::from_le_bytes(buf[0..4].try_into().unwrap()), 41);
        assert_eq!(
            u32::from_le_bytes(buf[4..8].try_into().unwrap()),
            u32::from((DsKeys::RELEASED - DsKeys::START).bits())
        );
        assert_eq!(buf[8], 1);
        assert_eq!(InputFrame::decode(&buf).unwrap(), input);

        // flip a payload byte: checksum must catch it
        buf[9] ^= 0x40;
        assert!(matches!(
            InputFrame::decode(&buf),
            Err(ProtoError::BadChecksum { .. })
        ));
    }

    #[test]
    fn batch_round_trip() {
        let msg = InputMsg::Batch(vec![pressed_a(5), pressed_a(6), InputFrame::neutral(7)]);
        let bytes = msg.encode();
        assert_eq!(bytes.len(), 2 + 3 * INPUT_FRAME_WIRE_LEN);
        assert_eq!(InputMsg::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn relay_carries_player_id() {
        let msg = InputMsg::Relay {
            player_id: 2,
            input: pressed_a(9),
        };
        let bytes = msg.encode();
        assert_eq!(bytes[0], 0x32);
        assert_eq!(bytes[1], 2);
        assert_eq!(InputMsg::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn truncated_batch_rejected() {
        let msg = InputMsg::Batch(vec![pressed_a(1), pressed_a(2)]);
        let bytes = msg.encode();
        assert!(InputMsg::decode(&bytes[..bytes.len() - 1]).is_err());
    }
}
