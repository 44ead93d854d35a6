use tracing::debug;

use crate::pes::{PES_HEADER_LEN, is_video_stream, payload_offset};

/// Appends an empty video PES packet carrying a sequence end code, so that decoders
/// display a single frame immediately instead of waiting for the next one.
///
/// Frames that don't start with a video PES packet are left untouched.
pub fn append_sequence_end(frame: &mut Vec<u8>) {
    if frame.len() <= 6 || frame[..3] != [0x00, 0x00, 0x01] || !is_video_stream(frame[3]) {
        return;
    }

    let stream_id = frame[3];
    frame.extend_from_slice(&[0x00, 0x00, 0x01, stream_id]);

    if frame[6] & 0x80 != 0 {
        // MPEG-2
        frame.extend_from_slice(&[0x00, 0x07, 0x80, 0x00, 0x00]);
    } else {
        // MPEG-1
        frame.extend_from_slice(&[0x00, 0x05, 0x0F]);
    }

    frame.extend_from_slice(&[0x00, 0x00, 0x01, 0xB7]);
}

/// Marks the first GOP of a video frame as having a broken link, unless the GOP is closed,
/// so that decoders drop the B-frames referring to pictures they never received.
pub fn set_broken_link(frame: &mut [u8]) -> bool {
    if frame.len() <= 9 || frame[..3] != [0x00, 0x00, 0x01] || !is_video_stream(frame[3]) {
        debug!("No video packet in frame, can't set the broken link flag");
        return false;
    }

    let start = if frame[6] & 0xC0 == 0x80 {
        payload_offset(frame).unwrap_or(9)
    } else {
        PES_HEADER_LEN
    };

    let gop = (start..frame.len().saturating_sub(7))
        .find(|&i| frame[i..i + 4] == [0x00, 0x00, 0x01, 0xB8]);

    match gop {
        Some(i) => {
            if frame[i + 7] & 0x40 == 0 {
                frame[i + 7] |= 0x20;
            }
            true
        }
        None => {
            debug!("No GOP header found in video packet");
            false
        }
    }
}
