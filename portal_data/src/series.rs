use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};

/// One time series as returned by a range query: its label set and the samples in
/// timestamp order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Series {
    pub labels: BTreeMap<String, String>,
    pub points: Vec<(DateTime<Utc>, f64)>,
}

impl Series {
    pub fn new<K: Into<String>, V: Into<String>>(labels: impl IntoIterator<Item = (K, V)>, points: Vec<(DateTime<Utc>, f64)>) -> Self {
        Self {
            labels: labels.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
            points,
        }
    }

    /// A label the caller grouped by. Missing means the store answered something else than
    /// what was asked for.
    pub fn label(&self, key: &str) -> Result<&str> {
        self.labels
            .get(key)
            .map(String::as_str)
            .ok_or_else(|| eyre!("series {:?} has no `{key}` label", self.labels))
    }

    pub fn timestamps(&self) -> impl Iterator<Item = DateTime<Utc>> + '_ {
        self.points.iter().map(|(time, _)| *time)
    }

    pub fn values(&self) -> impl Iterator<Item = f64> + '_ {
        self.points.iter().map(|(_, value)| *value)
    }

    /// Largest sample, but at least 0 (axis ranges start at 0 anyway).
    pub fn max_value(&self) -> f64 {
        self.values().filter(|v| v.is_finite()).fold(0.0, f64::max)
    }
}

#[allow(non_snake_case)]
#[cfg(test)]
mod tests {
    use chrono::TimeZone as _;

    use super::*;

    #[test]
    fn Series__label__missing_is_error() {
        let series = Series::new([("user", "alice")], vec![]);
        assert_eq!(series.label("user").unwrap(), "alice");
        assert!(series.label("fs").is_err());
    }

    #[test]
    fn Series__max_value() {
        let t = Utc.with_ymd_and_hms(2024, 12, 16, 0, 0, 0).unwrap();
        let series = Series::new([("user", "alice")], vec![(t, 3.0), (t, f64::NAN), (t, 7.5), (t, -2.0)]);
        assert_eq!(series.max_value(), 7.5);
        assert_eq!(Series::default().max_value(), 0.0);
    }
}
