use super::REPLAY_WINDOW_SIZE;

const WORDS: usize = REPLAY_WINDOW_SIZE / 64;

/// Sliding-window replay filter over packet counters.
///
/// Tracks the highest counter accepted and a bitmap of the
/// `REPLAY_WINDOW_SIZE` counters below it. Bits are addressed by
/// `counter % REPLAY_WINDOW_SIZE`, so advancing the window only clears the
/// slots that were skipped over.
///
/// `check` is cheap and side-effect free; it runs before decryption.
/// `accept` records the counter and must only be called once the packet
/// authenticated.
#[derive(Clone)]
pub struct ReplayWindow {
    highest: u64,
    bitmap: [u64; WORDS],
}

impl ReplayWindow {
    pub fn new() -> Self {
        Self {
            highest: 0,
            bitmap: [0; WORDS],
        }
    }

    /// Highest counter accepted so far.
    pub fn highest(&self) -> u64 {
        self.highest
    }

    /// Whether `counter` would be accepted.
    pub fn check(&self, counter: u64) -> bool {
        if counter > self.highest {
            return true;
        }
        if self.highest - counter >= REPLAY_WINDOW_SIZE as u64 {
            return false;
        }
        !self.is_set(counter)
    }

    /// Record `counter`. Returns false if it was a replay or too old.
    pub fn accept(&mut self, counter: u64) -> bool {
        if counter > self.highest {
            let gap = counter - self.highest;
            if gap >= REPLAY_WINDOW_SIZE as u64 {
                self.bitmap = [0; WORDS];
            } else {
                for skipped in self.highest + 1..counter {
                    self.clear(skipped);
                }
            }
            self.highest = counter;
            self.set(counter);
            return true;
        }

        if !self.check(counter) {
            return false;
        }
        self.set(counter);
        true
    }

    /// Forget everything.
    pub fn reset(&mut self) {
        self.highest = 0;
        self.bitmap = [0; WORDS];
    }

    fn slot(counter: u64) -> (usize, u64) {
        let bit = (counter % REPLAY_WINDOW_SIZE as u64) as usize;
        (bit / 64, 1u64 << (bit % 64))
    }

    fn is_set(&self, counter: u64) -> bool {
        let (word, mask) = Self::slot(counter);
        self.bitmap[word] & mask != 0
    }

    fn set(&mut self, counter: u64) {
        let (word, mask) = Self::slot(counter);
        self.bitmap[word] |= mask;
    }

    fn clear(&mut self, counter: u64) {
        let (word, mask) = Self::slot(counter);
        self.bitmap[word] &= !mask;
    }
}

impl Default for ReplayWindow {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ReplayWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplayWindow")
            .field("highest", &self.highest)
            .finish()
    }
}
