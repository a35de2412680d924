use std::{
    collections::{HashMap, VecDeque},
    sync::Mutex,
    time::Duration,
};

/// Tracks the recent probe durations of every host and serves their medians.
///
/// Samples are kept in a bounded window per host index; the median is
/// memoized and recomputed lazily after an insertion invalidates it.
#[derive(Debug)]
pub(crate) struct Stopwatch {
    window_size: usize,
    state: Mutex<StopwatchState>,
}

#[derive(Debug, Default)]
struct StopwatchState {
    times: HashMap<usize, VecDeque<Duration>>,
    cache: HashMap<usize, Option<Duration>>,
}

impl Stopwatch {
    pub(crate) fn new(window_size: usize) -> Self {
        Self {
            window_size: window_size.max(1),
            state: Mutex::new(StopwatchState::default()),
        }
    }

    /// Records one probe duration for the host at `index`.
    pub(crate) fn record(&self, index: usize, elapsed: Duration) {
        let mut state = self.state.lock().unwrap();
        let times = state.times.entry(index).or_default();
        if times.len() == self.window_size {
            times.pop_front();
        }
        times.push_back(elapsed);
        state.cache.insert(index, None);
    }

    /// Returns the median of the recorded window for the host at `index`, or
    /// `None` when no samples exist.
    pub(crate) fn get_time(&self, index: usize) -> Option<Duration> {
        let mut state = self.state.lock().unwrap();
        if let Some(Some(cached)) = state.cache.get(&index) {
            return Some(*cached);
        }
        let median = median(state.times.get(&index)?)?;
        state.cache.insert(index, Some(median));
        Some(median)
    }

    #[cfg(test)]
    fn sample_count(&self, index: usize) -> usize {
        let state = self.state.lock().unwrap();
        state.times.get(&index).map_or(0, VecDeque::len)
    }
}

fn median(samples: &VecDeque<Duration>) -> Option<Duration> {
    if samples.is_empty() {
        return None;
    }
    let mut sorted: Vec<Duration> = samples.iter().copied().collect();
    sorted.sort_unstable();
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 1 {
        Some(sorted[mid])
    } else {
        Some((sorted[mid - 1] + sorted[mid]) / 2)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use approx::assert_abs_diff_eq;

    #[test]
    fn empty_window_has_no_time() {
        let stopwatch = Stopwatch::new(4);
        assert_eq!(stopwatch.get_time(0), None);
    }

    #[test]
    fn median_of_odd_and_even_windows() {
        let stopwatch = Stopwatch::new(8);
        for millis in [30, 10, 20] {
            stopwatch.record(0, Duration::from_millis(millis));
        }
        assert_eq!(stopwatch.get_time(0), Some(Duration::from_millis(20)));

        stopwatch.record(0, Duration::from_millis(40));
        assert_abs_diff_eq!(
            stopwatch.get_time(0).unwrap().as_secs_f64(),
            0.025,
            epsilon = 1e-9
        );
    }

    #[test]
    fn window_is_bounded() {
        let stopwatch = Stopwatch::new(3);
        for millis in 1..=10 {
            stopwatch.record(0, Duration::from_millis(millis));
        }
        assert_eq!(stopwatch.sample_count(0), 3);
        // only 8, 9, 10 remain
        assert_eq!(stopwatch.get_time(0), Some(Duration::from_millis(9)));
    }

    #[test]
    fn insertion_invalidates_memoized_median() {
        let stopwatch = Stopwatch::new(8);
        stopwatch.record(0, Duration::from_millis(10));
        assert_eq!(stopwatch.get_time(0), Some(Duration::from_millis(10)));
        stopwatch.record(0, Duration::from_millis(30));
        assert_eq!(stopwatch.get_time(0), Some(Duration::from_millis(20)));
    }

    #[test]
    fn hosts_are_independent() {
        let stopwatch = Stopwatch::new(8);
        stopwatch.record(0, Duration::from_millis(10));
        stopwatch.record(1, Duration::from_millis(50));
        assert_eq!(stopwatch.get_time(0), Some(Duration::from_millis(10)));
        assert_eq!(stopwatch.get_time(1), Some(Duration::from_millis(50)));
        assert_eq!(stopwatch.get_time(2), None);
    }
}
