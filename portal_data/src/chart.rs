//! Plotly payloads: `{lines: [{x, y, type, name, stackgroup?, yaxis?}], layout: {...}}`.

use color_eyre::Result;
use itertools::Itertools as _;
use serde::Serialize;

use crate::{series::Series, TIMESTAMP_FMT};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Line {
    pub x: Vec<String>,
    pub y: Vec<f64>,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stackgroup: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub yaxis: Option<&'static str>,
}

impl Line {
    pub fn from_series(series: &Series, name: impl Into<String>) -> Self {
        Self {
            x: series.timestamps().map(|t| t.format(TIMESTAMP_FMT).to_string()).collect(),
            y: series.values().collect(),
            kind: "scatter",
            name: name.into(),
            stackgroup: None,
            yaxis: None,
        }
    }

    pub fn stacked(mut self) -> Self {
        self.stackgroup = Some("one");
        self
    }

    pub fn on_axis(mut self, yaxis: &'static str) -> Self {
        self.yaxis = Some(yaxis);
        self
    }

    /// Mirrors the line below the x axis (write traffic under read traffic).
    pub fn negated(mut self) -> Self {
        self.y.iter_mut().for_each(|y| *y = -*y);
        self
    }
}

/// How to name the line built from a series: an optional fixed prefix followed by the
/// values of some of its labels, space separated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineName {
    prefix: Option<String>,
    labels: &'static [&'static str],
}

impl LineName {
    pub fn labels(labels: &'static [&'static str]) -> Self {
        Self { prefix: None, labels }
    }

    pub fn fixed(name: impl Into<String>) -> Self {
        Self {
            prefix: Some(name.into()),
            labels: &[],
        }
    }

    pub fn prefixed(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    pub fn for_series(&self, series: &Series) -> Result<String> {
        let labels = self.labels.iter().map(|key| series.label(key)).collect::<Result<Vec<_>>>()?;
        Ok(self.prefix.iter().map(String::as_str).chain(labels).join(" "))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Axis {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ticksuffix: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub range: Option<[f64; 2]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub overlaying: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub side: Option<&'static str>,
}

impl Axis {
    pub fn suffix(suffix: &str) -> Self {
        Self {
            ticksuffix: Some(suffix.to_owned()),
            ..Default::default()
        }
    }
}

/// Text pinned above the plot area.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Annotation {
    pub text: String,
    pub showarrow: bool,
    pub xref: &'static str,
    pub yref: &'static str,
    pub x: f64,
    pub y: f64,
}

impl Annotation {
    pub fn caption(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            showarrow: false,
            xref: "paper",
            yref: "paper",
            x: 0.0,
            y: 1.1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Layout {
    pub showlegend: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub yaxis: Option<Axis>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub yaxis2: Option<Axis>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub annotations: Vec<Annotation>,
}

impl Default for Layout {
    fn default() -> Self {
        Self {
            showlegend: true,
            yaxis: None,
            yaxis2: None,
            annotations: Vec::new(),
        }
    }
}

impl Layout {
    pub fn with_suffix(suffix: &str) -> Self {
        Self {
            yaxis: Some(Axis::suffix(suffix)),
            ..Default::default()
        }
    }

    pub fn annotate(mut self, text: impl Into<String>) -> Self {
        self.annotations.push(Annotation::caption(text));
        self
    }
}

/// What every `graph/*.json` endpoint returns.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Chart {
    pub lines: Vec<Line>,
    pub layout: Layout,
}
