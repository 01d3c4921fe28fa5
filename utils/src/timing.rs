// Helpers to handle budgeting subsystems based on time
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub fn get_current_time() -> Duration {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
}

// Helper to get the current time in milliseconds
pub fn get_current_millis() -> u32 {
    get_current_time().as_millis() as u32
}

// Manages subsystem timings
//
// Keeps track of how much time is remaining in a fixed period,
// such as a frame, so callers can pace themselves against it.
pub struct TimingManager {
    // length of time we are counting down from
    tm_period: Duration,
    // the last time we reset this manager
    tm_start: Duration,
}

impl TimingManager {
    // create a new manager to track time
    // periods of length `period` ms
    pub fn new(period: u32) -> TimingManager {
        TimingManager {
            tm_period: Duration::from_millis(period as u64),
            tm_start: get_current_time(),
        }
    }

    // Reset the manager to the current time
    pub fn reset(&mut self) {
        self.tm_start = get_current_time();
    }

    // Returns true if period ms have passed
    // since this manager was reset
    pub fn is_overdue(&self) -> bool {
        get_current_time().saturating_sub(self.tm_start) >= self.tm_period
    }

    // Returns the number of ms remaining in this
    // tracker
    //
    // If 0 is returned, it is overdue and we
    // should reset it.
    pub fn time_remaining(&self) -> usize {
        let elapsed = get_current_time().saturating_sub(self.tm_start);
        self.tm_period.saturating_sub(elapsed).as_millis() as usize
    }
}

// A stopclock for measuring time intervals
//
// The order of use MUST be `new`, `start`, `end`
// after that the recorded duration can be
// got with `get_duration`
pub struct StopWatch {
    sw_start: Duration,
    sw_end: Duration,
}

impl StopWatch {
    // Create an empty stopwatch
    pub fn new() -> StopWatch {
        StopWatch {
            sw_start: Duration::from_millis(0),
            sw_end: Duration::from_millis(0),
        }
    }

    pub fn start(&mut self) {
        self.sw_start = get_current_time();
    }

    pub fn end(&mut self) {
        self.sw_end = get_current_time();
    }

    pub fn get_duration(&self) -> Duration {
        self.sw_end.saturating_sub(self.sw_start)
    }
}
