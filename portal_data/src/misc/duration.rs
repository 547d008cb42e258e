use std::ops::Deref;

use chrono::Duration;
use color_eyre::{
    eyre::{bail, eyre, Context as _},
    Result,
};
use itertools::Itertools as _;
use serde::Deserialize;

/// Duration written the way config files and Prometheus spell it: `500ms`, `30s`, `5m`, `1h`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize)]
#[serde(try_from = "String")]
pub struct HumanDuration(pub Duration);

impl TryFrom<&str> for HumanDuration {
    type Error = color_eyre::Report;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        let chars = value.trim().chars().collect_vec();
        let (time, unit) = match chars.as_slice() {
            [milliseconds @ .., 'm', 's'] => (milliseconds, "milliseconds"),
            [seconds @ .., 's'] => (seconds, "seconds"),
            [minutes @ .., 'm'] => (minutes, "minutes"),
            [hours @ .., 'h'] => (hours, "hours"),
            [days @ .., 'd'] => (days, "days"),
            x => bail!(
                "parsing duration: {x}: invalid suffix (only d, h, m, s, ms)",
                x = x.iter().collect::<String>()
            ),
        };
        let time = time.iter().collect::<String>();
        let amount = time.parse::<i64>().wrap_err_with(|| format!("parsing {unit} from {value:?}"))?;
        let duration = match unit {
            "milliseconds" => Duration::try_milliseconds(amount),
            "seconds" => Duration::try_seconds(amount),
            "minutes" => Duration::try_minutes(amount),
            "hours" => Duration::try_hours(amount),
            _ => Duration::try_days(amount),
        }
        .ok_or_else(|| eyre!("{time} {unit} is out of range"))?;
        Ok(HumanDuration(duration))
    }
}

impl TryFrom<String> for HumanDuration {
    type Error = color_eyre::Report;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::try_from(value.as_str())
    }
}

impl Deref for HumanDuration {
    type Target = Duration;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<Duration> for HumanDuration {
    fn from(value: Duration) -> Self {
        Self(value)
    }
}

/// Prometheus `step` parameter. Sub-second precision is dropped, Prometheus rejects steps < 1s anyway.
pub fn prometheus_step(step: Duration) -> String {
    format!("{}s", step.num_seconds().max(1))
}
