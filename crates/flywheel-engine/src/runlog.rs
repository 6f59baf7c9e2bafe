//! Bounded in-memory console logs for live streaming of active runs.

use std::collections::VecDeque;
use std::time::Duration;
use std::time::Instant;

use serde::Serialize;

/// A page of console lines returned to a polling client.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct LogTail {
    /// The line index of the first returned line.
    ///
    /// When this is greater than the requested offset, the lines in between
    /// were dropped from the ring; clients treat the difference as a gap
    /// rather than silent truncation.
    pub offset: u64,
    /// The total number of lines ever appended to the run's log.
    pub total_size: u64,
    /// The returned lines.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub lines: Vec<String>,
}

/// A bounded ring of console lines for one active run.
///
/// Memory stays `O(concurrent runs x capacity)`: the ring drops its oldest
/// line on overflow while `total_size` keeps counting, so clients can always
/// detect what they missed.
#[derive(Debug)]
pub struct RunLog {
    /// Maximum number of retained lines.
    capacity: usize,
    /// The retained tail of the console.
    lines: VecDeque<String>,
    /// Total lines ever appended; monotonic.
    total: u64,
    /// When a client last polled this ring; drives LRU eviction.
    last_poll: Instant,
}

impl RunLog {
    /// Creates an empty ring with the given line capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            lines: VecDeque::with_capacity(capacity.max(1)),
            total: 0,
            last_poll: Instant::now(),
        }
    }

    /// Appends one console line, dropping the oldest on overflow.
    pub fn append(&mut self, line: String) {
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }

        self.lines.push_back(line);
        self.total += 1;
    }

    /// Total lines ever appended.
    pub fn total_size(&self) -> u64 {
        self.total
    }

    /// Returns up to `size` lines starting at line index `offset`, clamped to
    /// what the ring still holds.
    pub fn tail(&mut self, offset: u64, size: usize) -> LogTail {
        self.last_poll = Instant::now();

        let first_kept = self.total - self.lines.len() as u64;
        let start = offset.clamp(first_kept, self.total);
        let skip = (start - first_kept) as usize;

        let lines: Vec<String> = self
            .lines
            .iter()
            .skip(skip)
            .take(size)
            .cloned()
            .collect();

        LogTail {
            offset: start,
            total_size: self.total,
            lines,
        }
    }

    /// Returns `true` when no client has polled for at least `idle`.
    pub fn is_idle(&self, idle: Duration) -> bool {
        self.last_poll.elapsed() >= idle
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn tail_from_offset() {
        let mut log = RunLog::new(10);
        for i in 0..5 {
            log.append(format!("line {i}"));
        }

        let tail = log.tail(2, 100);
        assert_eq!(tail.offset, 2);
        assert_eq!(tail.total_size, 5);
        assert_eq!(tail.lines, ["line 2", "line 3", "line 4"]);
    }

    #[test]
    fn overflow_reports_gap() {
        let mut log = RunLog::new(3);
        for i in 0..10 {
            log.append(format!("line {i}"));
        }

        // lines 0..7 were dropped; polling from 0 must reveal the gap
        let tail = log.tail(0, 100);
        assert_eq!(tail.total_size, 10);
        assert_eq!(tail.offset, 7, "dropped lines surface as an advanced offset");
        assert_eq!(tail.lines, ["line 7", "line 8", "line 9"]);
    }

    #[test]
    fn continuity_between_polls() {
        let mut log = RunLog::new(100);
        log.append("a".into());
        let first = log.tail(0, 100);

        log.append("b".into());
        log.append("c".into());
        let second = log.tail(first.total_size, 100);

        // everything appended since the last poll is returned, no gap
        assert_eq!(second.offset, first.total_size);
        assert_eq!(
            second.lines.len() as u64,
            second.total_size - first.total_size
        );
    }

    #[test]
    fn offset_past_end_returns_empty() {
        let mut log = RunLog::new(10);
        log.append("a".into());

        let tail = log.tail(50, 10);
        assert_eq!(tail.offset, 1);
        assert_eq!(tail.lines, Vec::<String>::new());
    }

    #[test]
    fn idle_tracking() {
        let mut log = RunLog::new(10);
        assert!(log.is_idle(Duration::ZERO));
        assert!(!log.is_idle(Duration::from_secs(3600)));
        let _ = log.tail(0, 1);
        assert!(!log.is_idle(Duration::from_secs(3600)));
    }
}
