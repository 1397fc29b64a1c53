//! Fixed-resolution timer wheel.
//!
//! Items are bucketed into tick slots so insertion is O(1) regardless of
//! delay. Resolution is one tick: an item added with delay `d` becomes
//! due once `ceil(d / tick)` ticks have elapsed, never early relative to
//! the last tick. The slot count covers the maximum delay; longer requests
//! are clamped to it.
//!
//! [`advance`](TimerWheel::advance) moves the wheel to `now` and collects
//! every item whose slot was passed. [`purge`](TimerWheel::purge) then hands
//! them out one at a time in the order they became due.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Timer wheel keyed by an opaque item type.
#[derive(Debug)]
pub struct TimerWheel<T> {
    slots: Vec<Vec<T>>,
    current: usize,
    tick: Duration,
    wheel_duration: Duration,
    last_tick: Option<Instant>,
    expired: VecDeque<T>,
}

impl<T> TimerWheel<T> {
    /// Create a wheel with `tick` resolution able to hold delays up to `max`.
    pub fn new(tick: Duration, max: Duration) -> Self {
        let tick = tick.max(Duration::from_millis(1));
        let ticks = max.as_nanos().div_ceil(tick.as_nanos()) as usize;
        // Two spare slots so a max-length delay never lands on the current slot.
        let len = ticks + 2;

        let mut slots = Vec::with_capacity(len);
        slots.resize_with(len, Vec::new);

        Self {
            slots,
            current: 0,
            tick,
            wheel_duration: tick * ticks as u32,
            last_tick: None,
            expired: VecDeque::new(),
        }
    }

    /// Tick resolution.
    pub fn tick_duration(&self) -> Duration {
        self.tick
    }

    /// Schedule `item` to become due after `delay`. Returns the delay that
    /// was actually applied after clamping.
    pub fn add(&mut self, item: T, delay: Duration) -> Duration {
        let delay = delay.clamp(self.tick, self.wheel_duration.max(self.tick));
        // Round up; the clamp keeps this within the spare slots.
        let ticks = delay.as_nanos().div_ceil(self.tick.as_nanos()) as usize;
        let slot = (self.current + ticks) % self.slots.len();
        self.slots[slot].push(item);
        delay
    }

    /// Advance the wheel to `now`, moving every passed slot into the
    /// expired queue. The first call only anchors the clock.
    pub fn advance(&mut self, now: Instant) {
        let last = match self.last_tick {
            Some(last) => last,
            None => {
                self.last_tick = Some(now);
                return;
            }
        };

        if now <= last {
            return;
        }

        let elapsed = (now - last).as_nanos() / self.tick.as_nanos();
        let ticks = elapsed.min(self.slots.len() as u128) as usize;

        for _ in 0..ticks {
            self.current = (self.current + 1) % self.slots.len();
            let due = std::mem::take(&mut self.slots[self.current]);
            self.expired.extend(due);
        }

        self.last_tick = Some(last + self.tick * elapsed as u32);
    }

    /// Next expired item, or `None` once everything due has been handed out.
    pub fn purge(&mut self) -> Option<T> {
        self.expired.pop_front()
    }

    /// Number of items still waiting in the wheel (not yet expired).
    pub fn scheduled(&self) -> usize {
        self.slots.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.expired.is_empty() && self.slots.iter().all(Vec::is_empty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    fn drain<T>(wheel: &mut TimerWheel<T>) -> Vec<T> {
        std::iter::from_fn(|| wheel.purge()).collect()
    }

    #[test]
    fn test_slot_count_covers_max_delay() {
        let wheel: TimerWheel<u32> = TimerWheel::new(ms(10), ms(100));
        assert_eq!(wheel.slots.len(), 12);
        assert_eq!(wheel.wheel_duration, ms(100));
    }

    #[test]
    fn test_item_not_due_before_delay() {
        let start = Instant::now();
        let mut wheel = TimerWheel::new(ms(10), ms(1000));
        wheel.advance(start);
        wheel.add(1u32, ms(50));

        wheel.advance(start + ms(40));
        assert_eq!(wheel.purge(), None);

        wheel.advance(start + ms(50));
        assert_eq!(wheel.purge(), Some(1));
        assert_eq!(wheel.purge(), None);
    }

    #[test]
    fn test_staggered_delays_purge_in_order_once() {
        let start = Instant::now();
        let mut wheel = TimerWheel::new(ms(10), ms(1000));
        wheel.advance(start);

        // Insert out of order; delays are distinct multiples of the tick.
        for d in [70u64, 10, 450, 30, 990, 200] {
            wheel.add(d, ms(d));
        }

        let mut seen = Vec::new();
        let mut now = start;
        while now < start + ms(1200) {
            now += ms(7);
            wheel.advance(now);
            seen.extend(drain(&mut wheel));
        }

        assert_eq!(seen, vec![10, 30, 70, 200, 450, 990]);
        assert!(wheel.is_empty());
    }

    #[test]
    fn test_delay_between_ticks_rounds_up() {
        let start = Instant::now();
        let mut wheel = TimerWheel::new(ms(90), Duration::from_secs(5));
        wheel.advance(start);
        wheel.add(1u32, ms(1000));

        // 1000ms is 11.1 ticks; the 11th tick at 990ms is too early.
        wheel.advance(start + ms(990));
        assert_eq!(wheel.purge(), None);

        wheel.advance(start + ms(1080));
        assert_eq!(wheel.purge(), Some(1));
    }

    #[test]
    fn test_duplicate_items_are_independent() {
        let start = Instant::now();
        let mut wheel = TimerWheel::new(ms(10), ms(500));
        wheel.advance(start);
        wheel.add("peer", ms(20));
        wheel.add("peer", ms(20));
        wheel.add("other", ms(40));

        wheel.advance(start + ms(20));
        assert_eq!(drain(&mut wheel), vec!["peer", "peer"]);
        wheel.advance(start + ms(40));
        assert_eq!(drain(&mut wheel), vec!["other"]);
    }

    #[test]
    fn test_delay_clamped_to_bounds() {
        let start = Instant::now();
        let mut wheel = TimerWheel::new(ms(10), ms(100));
        wheel.advance(start);

        assert_eq!(wheel.add(1u8, ms(1)), ms(10));
        assert_eq!(wheel.add(2u8, ms(10_000)), ms(100));

        wheel.advance(start + ms(10));
        assert_eq!(drain(&mut wheel), vec![1]);
        wheel.advance(start + ms(100));
        assert_eq!(drain(&mut wheel), vec![2]);
    }

    #[test]
    fn test_large_jump_expires_everything() {
        let start = Instant::now();
        let mut wheel = TimerWheel::new(ms(10), ms(100));
        wheel.advance(start);
        for i in 0..5u32 {
            wheel.add(i, ms(10 * (i as u64 + 1)));
        }
        wheel.advance(start + Duration::from_secs(60));
        assert_eq!(drain(&mut wheel), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_first_advance_anchors_clock() {
        let start = Instant::now();
        let mut wheel = TimerWheel::new(ms(10), ms(100));
        wheel.add(7u8, ms(30));
        wheel.advance(start + ms(500));
        assert_eq!(wheel.purge(), None);
        wheel.advance(start + ms(530));
        assert_eq!(wheel.purge(), Some(7));
    }
}
