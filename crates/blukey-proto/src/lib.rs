//! BluKey wire model.
//!
//! The dongle speaks a minimal binary framing over BLE notifications:
//! `[op(1)][len_le16(2)][payload]`. Notifications are delivered as
//! arbitrarily sized chunks, so frames may be split across deliveries
//! or preceded by non-protocol text (firmware boot banners). This
//! crate owns the frame layout, the opcode registry, and the [`Framer`]
//! accumulator that turns a chunk stream back into whole frames.

pub mod frame;
pub mod opcode;

pub use frame::{FRAME_HEADER_LEN, Frame, FrameError, Framer, MAX_FRAME_LEN, encode_frame};
