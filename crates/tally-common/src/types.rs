use crate::error::MetricError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Metric kind, deciding how an update merges into stored state.
///
/// # Examples
///
/// ```
/// use tally_common::types::MetricKind;
///
/// let kind: MetricKind = "counter".parse().unwrap();
/// assert_eq!(kind, MetricKind::Counter);
/// assert_eq!(kind.to_string(), "counter");
/// assert!("histogram".parse::<MetricKind>().is_err());
/// ```
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, utoipa::ToSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    /// Replaced on every update.
    Gauge,
    /// Accumulated: the reported value is a delta.
    Counter,
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricKind::Gauge => write!(f, "gauge"),
            MetricKind::Counter => write!(f, "counter"),
        }
    }
}

impl std::str::FromStr for MetricKind {
    type Err = MetricError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gauge" => Ok(MetricKind::Gauge),
            "counter" => Ok(MetricKind::Counter),
            _ => Err(MetricError::UnknownKind(s.to_string())),
        }
    }
}

/// A typed metric value. For counters this is a delta on the way in and the
/// accumulated total on the way out.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MetricValue {
    Gauge(f64),
    Counter(i64),
}

impl MetricValue {
    pub fn kind(&self) -> MetricKind {
        match self {
            MetricValue::Gauge(_) => MetricKind::Gauge,
            MetricValue::Counter(_) => MetricKind::Counter,
        }
    }

    /// Strictly parses `raw` as a value of `kind`: `i64` for counters and a
    /// finite `f64` for gauges.
    pub fn parse(kind: MetricKind, raw: &str) -> Result<Self, MetricError> {
        let invalid = || MetricError::InvalidValue {
            kind,
            raw: raw.to_string(),
        };
        match kind {
            MetricKind::Counter => raw.parse::<i64>().map(MetricValue::Counter).map_err(|_| invalid()),
            MetricKind::Gauge => match raw.parse::<f64>() {
                Ok(v) if v.is_finite() => Ok(MetricValue::Gauge(v)),
                _ => Err(invalid()),
            },
        }
    }
}

impl fmt::Display for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricValue::Gauge(v) => write!(f, "{v}"),
            MetricValue::Counter(d) => write!(f, "{d}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Metric {
    pub name: String,
    pub value: MetricValue,
}

impl Metric {
    pub fn gauge(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            value: MetricValue::Gauge(value),
        }
    }

    pub fn counter(name: impl Into<String>, delta: i64) -> Self {
        Self {
            name: name.into(),
            value: MetricValue::Counter(delta),
        }
    }

    pub fn kind(&self) -> MetricKind {
        self.value.kind()
    }

    /// Rejects empty names and non-finite gauges.
    pub fn validate(&self) -> Result<(), MetricError> {
        if self.name.is_empty() {
            return Err(MetricError::MissingName);
        }
        if let MetricValue::Gauge(v) = self.value {
            if !v.is_finite() {
                return Err(MetricError::NonFinite {
                    name: self.name.clone(),
                });
            }
        }
        Ok(())
    }
}

/// JSON wire form of a metric report: `{id, type, delta?, value?, hash?}`.
///
/// Also used as the read query for `POST /value/`, where only `id` and
/// `type` are set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, utoipa::ToSchema)]
pub struct MetricRecord {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type")]
    pub kind: MetricKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

impl MetricRecord {
    pub fn from_metric(metric: &Metric) -> Self {
        let (delta, value) = match metric.value {
            MetricValue::Gauge(v) => (None, Some(v)),
            MetricValue::Counter(d) => (Some(d), None),
        };
        Self {
            id: metric.name.clone(),
            kind: metric.kind(),
            delta,
            value,
            hash: None,
        }
    }

    pub fn with_hash(mut self, hash: Option<String>) -> Self {
        self.hash = hash;
        self
    }

    /// Converts to a validated [`Metric`]. The field matching the kind must
    /// be present; the other one is ignored.
    pub fn to_metric(&self) -> Result<Metric, MetricError> {
        if self.id.is_empty() {
            return Err(MetricError::MissingName);
        }
        let value = match self.kind {
            MetricKind::Gauge => MetricValue::Gauge(self.value.ok_or_else(|| {
                MetricError::MissingValue {
                    name: self.id.clone(),
                    kind: self.kind,
                    field: "value",
                }
            })?),
            MetricKind::Counter => MetricValue::Counter(self.delta.ok_or_else(|| {
                MetricError::MissingValue {
                    name: self.id.clone(),
                    kind: self.kind,
                    field: "delta",
                }
            })?),
        };
        let metric = Metric {
            name: self.id.clone(),
            value,
        };
        metric.validate()?;
        Ok(metric)
    }

    /// The hash as sent, treating an empty string as absent.
    pub fn tag(&self) -> Option<&str> {
        self.hash.as_deref().filter(|h| !h.is_empty())
    }
}

/// Full metric table keyed by kind. This is both the `GET /` payload and the
/// on-disk snapshot format:
///
/// ```json
/// { "gauge": { "Alloc": 3.2 }, "counter": { "PollCount": 29 } }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, utoipa::ToSchema)]
pub struct MetricTable {
    #[serde(default)]
    pub gauge: BTreeMap<String, f64>,
    #[serde(default)]
    pub counter: BTreeMap<String, i64>,
}

impl MetricTable {
    pub fn get(&self, name: &str, kind: MetricKind) -> Option<MetricValue> {
        match kind {
            MetricKind::Gauge => self.gauge.get(name).copied().map(MetricValue::Gauge),
            MetricKind::Counter => self.counter.get(name).copied().map(MetricValue::Counter),
        }
    }

    /// The kind a name is currently stored under, if any.
    pub fn kind_of(&self, name: &str) -> Option<MetricKind> {
        if self.gauge.contains_key(name) {
            Some(MetricKind::Gauge)
        } else if self.counter.contains_key(name) {
            Some(MetricKind::Counter)
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        self.gauge.len() + self.counter.len()
    }

    pub fn is_empty(&self) -> bool {
        self.gauge.is_empty() && self.counter.is_empty()
    }

    /// Every entry as a metric, gauges first, each group in name order.
    pub fn metrics(&self) -> Vec<Metric> {
        self.gauge
            .iter()
            .map(|(name, v)| Metric::gauge(name.clone(), *v))
            .chain(
                self.counter
                    .iter()
                    .map(|(name, d)| Metric::counter(name.clone(), *d)),
            )
            .collect()
    }
}

impl From<&MetricRecord> for crate::proto::MetricProto {
    fn from(record: &MetricRecord) -> Self {
        Self {
            id: record.id.clone(),
            kind: record.kind.to_string(),
            delta: record.delta,
            value: record.value,
            hash: record.hash.clone().unwrap_or_default(),
        }
    }
}

impl TryFrom<&crate::proto::MetricProto> for MetricRecord {
    type Error = MetricError;

    fn try_from(proto: &crate::proto::MetricProto) -> Result<Self, Self::Error> {
        Ok(Self {
            id: proto.id.clone(),
            kind: proto.kind.parse()?,
            delta: proto.delta,
            value: proto.value,
            hash: (!proto.hash.is_empty()).then(|| proto.hash.clone()),
        })
    }
}
