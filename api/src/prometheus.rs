use std::{collections::BTreeMap, ops::Range, str::FromStr};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use color_eyre::{
    eyre::{bail, ensure, eyre, Context as _},
    Result, Section as _, SectionExt as _,
};
use portal_data::{misc::duration::prometheus_step, series::Series};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::Deserialize;
use tracing::{debug, instrument};

use crate::config::PrometheusSettings;

/// Range queries against a Prometheus-compatible store.
#[async_trait]
pub trait MetricsSource: Send + Sync {
    async fn query_range(&self, query: &str, range: Range<DateTime<Utc>>, step: Duration) -> Result<Vec<Series>>;
}

/// Client for the Prometheus HTTP API (`/api/v1/query_range`).
#[derive(Debug, Clone)]
pub struct Prometheus {
    base_url: String,
    client: reqwest::Client,
}

impl Prometheus {
    pub fn new(settings: &PrometheusSettings) -> Result<Self> {
        let mut headers = HeaderMap::new();
        for (name, value) in &settings.headers {
            headers.insert(
                HeaderName::from_str(name).wrap_err_with(|| format!("invalid header name {name:?}"))?,
                HeaderValue::from_str(value).wrap_err_with(|| format!("invalid value for header {name:?}"))?,
            );
        }
        let client = reqwest::Client::builder()
            .timeout(settings.timeout.to_std()?)
            .default_headers(headers)
            .build()
            .wrap_err("creating HTTP client for prometheus")?;

        Ok(Self {
            base_url: settings.url.trim_end_matches('/').to_owned(),
            client,
        })
    }
}

#[async_trait]
impl MetricsSource for Prometheus {
    #[instrument(skip(self, range), fields(start = %range.start, end = %range.end))]
    async fn query_range(&self, query: &str, range: Range<DateTime<Utc>>, step: Duration) -> Result<Vec<Series>> {
        let url = format!("{}/api/v1/query_range", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[
                ("query", query.to_owned()),
                ("start", range.start.timestamp().to_string()),
                ("end", range.end.timestamp().to_string()),
                ("step", prometheus_step(step)),
            ])
            .send()
            .await
            .wrap_err_with(|| format!("requesting {url}"))?;
        let status = response.status();
        let body = response.text().await.wrap_err("reading prometheus response")?;
        debug!(%status, len = body.len(), "prometheus answered");

        // prometheus sends its JSON error envelope with 4xx/5xx too, prefer that message
        parse_matrix(&body).map_err(|e| {
            if status.is_success() {
                e
            } else {
                e.wrap_err(format!("prometheus answered {status}"))
            }
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
enum Envelope {
    Success {
        data: QueryData,
    },
    Error {
        #[serde(rename = "errorType")]
        error_type: String,
        error: String,
    },
}

#[derive(Debug, Deserialize)]
struct QueryData {
    #[serde(rename = "resultType")]
    result_type: String,
    result: Vec<MatrixEntry>,
}

#[derive(Debug, Deserialize)]
struct MatrixEntry {
    metric: BTreeMap<String, String>,
    values: Vec<(f64, String)>,
}

/// Parses a `query_range` response body. Anything unexpected fails the whole response.
pub fn parse_matrix(body: &str) -> Result<Vec<Series>> {
    let envelope: Envelope = serde_json::from_str(body)
        .wrap_err("malformed prometheus response")
        .with_section(|| truncate(body).to_owned().header("Body:"))?;
    let data = match envelope {
        Envelope::Success { data } => data,
        Envelope::Error { error_type, error } => bail!("prometheus query failed ({error_type}): {error}"),
    };
    ensure!(data.result_type == "matrix", "expected a matrix result, got `{}`", data.result_type);

    data.result
        .into_iter()
        .map(|entry| {
            let points = entry
                .values
                .into_iter()
                .map(|(timestamp, value)| {
                    let time = timestamp_from_secs(timestamp)?;
                    let value = value
                        .parse::<f64>()
                        .wrap_err_with(|| format!("sample value {value:?} of {:?}", entry.metric))?;
                    Ok((time, value))
                })
                .collect::<Result<Vec<_>>>()?;
            Ok(Series {
                labels: entry.metric,
                points,
            })
        })
        .collect()
}

fn timestamp_from_secs(secs: f64) -> Result<DateTime<Utc>> {
    let whole = secs.floor();
    let nanos = ((secs - whole) * 1e9).round() as u32;
    DateTime::from_timestamp(whole as i64, nanos.min(999_999_999)).ok_or_else(|| eyre!("timestamp {secs} out of range"))
}

fn truncate(body: &str) -> &str {
    match body.char_indices().nth(500) {
        Some((idx, _)) => &body[..idx],
        None => body,
    }
}
