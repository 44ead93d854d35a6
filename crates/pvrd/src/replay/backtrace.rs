/// An assumption about the average frame size.
const AVG_FRAME_SIZE: usize = 15_000;

/// An assumption about how much a decoder buffers.
const DECODER_BUFFER_SIZE: usize = 256 * 1024;

pub const BACKTRACE_ENTRIES: usize = DECODER_BUFFER_SIZE / AVG_FRAME_SIZE + 20;

/// The most recently played frames, used to estimate which frame is actually on screen
/// while the decoder still buffers the ones after it.
#[derive(Debug)]
pub struct BackTrace {
    entries: [(usize, usize); BACKTRACE_ENTRIES],
    pos: usize,
    len: usize,
}

impl Default for BackTrace {
    fn default() -> Self {
        Self {
            entries: [(0, 0); BACKTRACE_ENTRIES],
            pos: 0,
            len: 0,
        }
    }
}

impl BackTrace {
    pub fn clear(&mut self) {
        self.pos = 0;
        self.len = 0;
    }

    pub fn add(&mut self, index: usize, length: usize) {
        self.entries[self.pos] = (index, length);
        self.pos = (self.pos + 1) % BACKTRACE_ENTRIES;
        self.len = (self.len + 1).min(BACKTRACE_ENTRIES);
    }

    /// The frame to continue from when the direction changes, walking back over as many
    /// frames as the decoder may still hold. Going backward skips twice as far.
    pub fn get(&self, forward: bool) -> Option<usize> {
        let mut budget = DECODER_BUFFER_SIZE as isize;
        if !forward {
            budget += 256 * 1024;
        }

        let mut p = self.pos;
        let mut found = None;

        for _ in 0..self.len {
            if budget <= 0 {
                break;
            }

            p = p.checked_sub(1).unwrap_or(BACKTRACE_ENTRIES - 1);

            let (index, length) = self.entries[p];
            found = Some(index);
            budget -= length as isize;
        }

        found.and_then(|index| index.checked_sub(1))
    }
}
