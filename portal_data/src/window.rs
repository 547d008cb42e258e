use std::ops::Range;

use chrono::{DateTime, Duration, Utc};

/// Upper bound for samples per series on open-ended windows. Prometheus refuses anything
/// above 11 000.
pub const MAX_POINTS: i64 = 1000;

/// Lookback window and resolution of a graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Window {
    /// Last 6 hours, 1 minute resolution. Filesystem and power graphs.
    Recent,
    /// Last 14 days, 5 minute resolution. Allocated/used/wasted graphs.
    Short,
    /// Last 60 days, hourly. Priority over time.
    Long,
    /// A fixed range, e.g. the runtime of one job.
    Between { start: DateTime<Utc>, end: DateTime<Utc> },
}

impl Window {
    pub fn span(&self) -> Duration {
        match *self {
            Window::Recent => Duration::hours(6),
            Window::Short => Duration::days(14),
            Window::Long => Duration::days(60),
            Window::Between { start, end } => end - start,
        }
    }

    pub fn range(&self, now: DateTime<Utc>) -> Range<DateTime<Utc>> {
        match *self {
            Window::Between { start, end } => start..end,
            _ => now - self.span()..now,
        }
    }

    pub fn step(&self) -> Duration {
        match *self {
            Window::Recent => Duration::minutes(1),
            Window::Short => Duration::minutes(5),
            Window::Long => Duration::hours(1),
            Window::Between { .. } => {
                let secs = self.span().num_seconds().max(0);
                // ceil(secs / MAX_POINTS), never finer than a minute
                Duration::seconds(((secs + MAX_POINTS - 1) / MAX_POINTS).max(60))
            }
        }
    }
}

#[allow(non_snake_case)]
#[cfg(test)]
mod tests {
    use chrono::TimeZone as _;

    use super::*;

    #[test]
    fn Window__range__relative_to_now() {
        let now = Utc.with_ymd_and_hms(2024, 12, 16, 12, 0, 0).unwrap();
        let range = Window::Short.range(now);
        assert_eq!(range.end, now);
        assert_eq!(range.start, Utc.with_ymd_and_hms(2024, 12, 2, 12, 0, 0).unwrap());
        assert_eq!(Window::Recent.range(now).start, Utc.with_ymd_and_hms(2024, 12, 16, 6, 0, 0).unwrap());
    }

    #[test]
    fn Window__step__stays_under_point_limit() {
        for window in [Window::Recent, Window::Short, Window::Long] {
            assert!(window.span().num_seconds() / window.step().num_seconds() <= 11_000, "{window:?}");
        }
        assert_eq!(Window::Long.step(), Duration::hours(1));
    }

    #[test]
    fn Window__step__between() {
        let start = Utc.with_ymd_and_hms(2024, 12, 1, 0, 0, 0).unwrap();
        let short = Window::Between { start, end: start + Duration::minutes(10) };
        assert_eq!(short.step(), Duration::minutes(1));

        let long = Window::Between { start, end: start + Duration::days(7) };
        assert_eq!(long.step(), Duration::seconds(605));
        assert!(long.span().num_seconds() / long.step().num_seconds() <= MAX_POINTS);
    }
}
