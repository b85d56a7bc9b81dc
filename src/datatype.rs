// used for timestamps carried by values and series indexes
use chrono::{Duration, NaiveDateTime};
// used at the ingestion boundary so adapters can hand over parsed payloads
use serde::{Deserialize, Serialize};

// used to print out readable forms of a value
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

// our own stuff that we need
use crate::error::{EntwineError, Result};
use crate::timeline::{strip_year, IntervalField, Period, PeriodCollection};

// ------------- Scalar -------------
/// A single plain value. Database strings become symbols; everything that
/// carries a calendar meaning keeps its own variant.
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    Bool(bool),
    Int(i64),
    Real(f64),
    Symbol(String),
    Timestamp(NaiveDateTime),
    Period(Period),
}

impl Scalar {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Scalar::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Scalar::Int(i) => Some(*i as f64),
            Scalar::Real(r) => Some(*r),
            _ => None,
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Scalar::Bool(b) => write!(f, "{b}"),
            Scalar::Int(i) => write!(f, "{i}"),
            Scalar::Real(r) => write!(f, "{r}"),
            Scalar::Symbol(s) => write!(f, "{s}"),
            Scalar::Timestamp(t) => write!(f, "{t}"),
            Scalar::Period(p) => write!(f, "{p}"),
        }
    }
}

// ------------- Map keys -------------
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MapKey {
    Symbol(String),
    Timestamp(NaiveDateTime),
    Real(f64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapKeyKind {
    Symbol,
    Timestamp,
    Real,
}

impl MapKey {
    pub fn kind(&self) -> MapKeyKind {
        match self {
            MapKey::Symbol(_) => MapKeyKind::Symbol,
            MapKey::Timestamp(_) => MapKeyKind::Timestamp,
            MapKey::Real(_) => MapKeyKind::Real,
        }
    }
    // Ordering within one kind; the keys of a map are homogeneous.
    fn cmp_same(&self, other: &MapKey) -> Ordering {
        match (self, other) {
            (MapKey::Symbol(a), MapKey::Symbol(b)) => a.cmp(b),
            (MapKey::Timestamp(a), MapKey::Timestamp(b)) => a.cmp(b),
            (MapKey::Real(a), MapKey::Real(b)) => a.partial_cmp(b).unwrap_or(Ordering::Equal),
            _ => Ordering::Equal,
        }
    }
}

impl fmt::Display for MapKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            MapKey::Symbol(s) => write!(f, "{s}"),
            MapKey::Timestamp(t) => write!(f, "{t}"),
            MapKey::Real(r) => write!(f, "{r}"),
        }
    }
}

// ------------- Map -------------
/// A recursive indexed value: sorted keys of one kind, parallel
/// [`ParameterValue`] entries.
#[derive(Debug, Clone, PartialEq)]
pub struct MapValue {
    keys: Vec<MapKey>,
    values: Vec<ParameterValue>,
}

impl MapValue {
    pub fn new(pairs: Vec<(MapKey, ParameterValue)>) -> Result<MapValue> {
        if let Some(first) = pairs.first() {
            let kind = first.0.kind();
            if pairs.iter().any(|(k, _)| k.kind() != kind) {
                return Err(EntwineError::Invariant(
                    "map keys must all be of one kind".into(),
                ));
            }
        }
        if pairs
            .iter()
            .any(|(k, _)| matches!(k, MapKey::Real(r) if r.is_nan()))
        {
            return Err(EntwineError::Invariant("map keys must not be NaN".into()));
        }
        let mut pairs = pairs;
        pairs.sort_by(|a, b| a.0.cmp_same(&b.0));
        let (keys, values): (Vec<MapKey>, Vec<ParameterValue>) = pairs.into_iter().unzip();
        Ok(MapValue { keys, values })
    }

    pub fn keys(&self) -> &[MapKey] {
        &self.keys
    }
    pub fn values(&self) -> &[ParameterValue] {
        &self.values
    }
    pub fn len(&self) -> usize {
        self.keys.len()
    }
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
    pub fn kind(&self) -> Option<MapKeyKind> {
        self.keys.first().map(|k| k.kind())
    }
    pub fn pairs(&self) -> impl Iterator<Item = (&MapKey, &ParameterValue)> {
        self.keys.iter().zip(self.values.iter())
    }

    /// Exact-match position, used for symbol keys.
    pub(crate) fn position_exact(&self, key: &MapKey) -> Option<usize> {
        if self.kind() != Some(key.kind()) {
            return None;
        }
        self.keys
            .binary_search_by(|probe| probe.cmp_same(key))
            .ok()
            .filter(|&i| self.keys[i] == *key)
    }

    /// Nearest-or-last position, floored to the first entry; used for
    /// timestamp and real keys.
    pub(crate) fn position_last(&self, key: &MapKey) -> Option<usize> {
        if self.is_empty() || self.kind() != Some(key.kind()) {
            return None;
        }
        let below_or_equal = self
            .keys
            .partition_point(|probe| probe.cmp_same(key) != Ordering::Greater);
        Some(below_or_equal.max(1) - 1)
    }
}

// ------------- Time pattern -------------
#[derive(Debug, Clone, PartialEq)]
pub struct TimePatternValue {
    pub pattern: Vec<(PeriodCollection, f64)>,
    /// The finest calendar field appearing anywhere in the pattern, frozen at
    /// construction; bounds how long a slice answer stays fresh.
    pub precision: IntervalField,
}

impl TimePatternValue {
    pub fn new(pattern: Vec<(PeriodCollection, f64)>) -> Result<TimePatternValue> {
        if pattern.is_empty() {
            return Err(EntwineError::Invariant("empty time pattern".into()));
        }
        let precision = pattern
            .iter()
            .map(|(pc, _)| pc.precision())
            .max()
            .unwrap_or(IntervalField::Year);
        Ok(TimePatternValue { pattern, precision })
    }
}

// ------------- Time series -------------
#[derive(Debug, Clone, PartialEq)]
pub struct TimeSeriesValue {
    pub indexes: Vec<NaiveDateTime>,
    pub values: Vec<f64>,
    pub ignore_year: bool,
}

impl TimeSeriesValue {
    /// With `ignore_year` the indexes are re-anchored to year zero up front,
    /// so lookups only normalize the query side.
    pub fn new(
        indexes: Vec<NaiveDateTime>,
        values: Vec<f64>,
        ignore_year: bool,
    ) -> Result<TimeSeriesValue> {
        if indexes.len() != values.len() {
            return Err(EntwineError::Invariant(format!(
                "time series has {} indexes but {} values",
                indexes.len(),
                values.len()
            )));
        }
        if indexes.is_empty() {
            return Err(EntwineError::Invariant("empty time series".into()));
        }
        let indexes: Vec<NaiveDateTime> = if ignore_year {
            indexes.into_iter().map(strip_year).collect()
        } else {
            indexes
        };
        if indexes.windows(2).any(|w| w[0] >= w[1]) {
            return Err(EntwineError::Invariant(
                "time series indexes must be strictly ascending".into(),
            ));
        }
        Ok(TimeSeriesValue {
            indexes,
            values,
            ignore_year,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RepeatingTimeSeriesValue {
    pub series: TimeSeriesValue,
    /// Distance from the first to the last index; the repetition length.
    pub span: Duration,
    /// Sum of the non-NaN values, precomputed for the repeating slice mean.
    pub valsum: f64,
    /// Count of the non-NaN values.
    pub len: usize,
}

impl RepeatingTimeSeriesValue {
    pub fn new(series: TimeSeriesValue) -> Result<RepeatingTimeSeriesValue> {
        let first = series.indexes[0];
        let last = *series.indexes.last().unwrap();
        let span = last - first;
        if span <= Duration::zero() {
            return Err(EntwineError::Invariant(
                "repeating time series span must be positive".into(),
            ));
        }
        let valsum = series.values.iter().filter(|v| !v.is_nan()).sum();
        let len = series.values.iter().filter(|v| !v.is_nan()).count();
        Ok(RepeatingTimeSeriesValue {
            series,
            span,
            valsum,
            len,
        })
    }
}

// ------------- ParameterValue -------------
/// The tagged union every parameter evaluates to. Container payloads sit
/// behind `Arc` so evaluation results can alias the stored value.
#[derive(Debug, Clone, PartialEq)]
pub enum ParameterValue {
    Nothing,
    Scalar(Scalar),
    Array(Arc<Vec<Scalar>>),
    TimePattern(Arc<TimePatternValue>),
    TimeSeries(Arc<TimeSeriesValue>),
    RepeatingTimeSeries(Arc<RepeatingTimeSeriesValue>),
    Map(Arc<MapValue>),
}

impl ParameterValue {
    pub fn is_nothing(&self) -> bool {
        matches!(self, ParameterValue::Nothing)
    }
    pub fn real(value: f64) -> ParameterValue {
        ParameterValue::Scalar(Scalar::Real(value))
    }
    pub fn symbol(name: &str) -> ParameterValue {
        ParameterValue::Scalar(Scalar::Symbol(name.to_string()))
    }
}

impl fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ParameterValue::Nothing => write!(f, "nothing"),
            ParameterValue::Scalar(s) => write!(f, "{s}"),
            ParameterValue::Array(a) => {
                let items: Vec<String> = a.iter().map(|s| s.to_string()).collect();
                write!(f, "[{}]", items.join(", "))
            }
            ParameterValue::TimePattern(p) => {
                write!(f, "time_pattern({} entries)", p.pattern.len())
            }
            ParameterValue::TimeSeries(ts) => write!(f, "time_series({} points)", ts.indexes.len()),
            ParameterValue::RepeatingTimeSeries(r) => {
                write!(f, "repeating_time_series({} points)", r.series.indexes.len())
            }
            ParameterValue::Map(m) => write!(f, "map({} entries)", m.len()),
        }
    }
}

// ------------- Ingestion boundary -------------
/// The parsed database payloads a persistence adapter may hand over. One
/// variant per upstream value-type tag; [`parameter_value`] wraps each into
/// its in-memory form, computing derived metadata eagerly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DbValue {
    Null,
    Bool(bool),
    Int(i64),
    Real(f64),
    Text(String),
    Timestamp(NaiveDateTime),
    Period(Period),
    List(Vec<DbValue>),
    TimePattern(Vec<(String, f64)>),
    TimeSeries {
        indexes: Vec<NaiveDateTime>,
        values: Vec<f64>,
        ignore_year: bool,
        repeat: bool,
    },
    Map(Vec<(MapKey, DbValue)>),
}

fn scalar_of(value: DbValue) -> Result<Scalar> {
    match value {
        DbValue::Bool(b) => Ok(Scalar::Bool(b)),
        DbValue::Int(i) => Ok(Scalar::Int(i)),
        DbValue::Real(r) => Ok(Scalar::Real(r)),
        DbValue::Text(s) => Ok(Scalar::Symbol(s)),
        DbValue::Timestamp(t) => Ok(Scalar::Timestamp(t)),
        DbValue::Period(p) => Ok(Scalar::Period(p)),
        other => Err(EntwineError::Invariant(format!(
            "array element is not a scalar: {other:?}"
        ))),
    }
}

/// Wraps a parsed database value into its [`ParameterValue`] form. Repeating
/// series metadata and pattern precision are computed here, once.
pub fn parameter_value(value: DbValue) -> Result<ParameterValue> {
    match value {
        DbValue::Null => Ok(ParameterValue::Nothing),
        DbValue::Bool(_)
        | DbValue::Int(_)
        | DbValue::Real(_)
        | DbValue::Text(_)
        | DbValue::Timestamp(_)
        | DbValue::Period(_) => Ok(ParameterValue::Scalar(scalar_of(value)?)),
        DbValue::List(items) => {
            let scalars: Result<Vec<Scalar>> = items.into_iter().map(scalar_of).collect();
            Ok(ParameterValue::Array(Arc::new(scalars?)))
        }
        DbValue::TimePattern(entries) => {
            let mut pattern = Vec::with_capacity(entries.len());
            for (spec, value) in entries {
                pattern.push((PeriodCollection::parse(&spec)?, value));
            }
            Ok(ParameterValue::TimePattern(Arc::new(TimePatternValue::new(
                pattern,
            )?)))
        }
        DbValue::TimeSeries {
            indexes,
            values,
            ignore_year,
            repeat,
        } => {
            let series = TimeSeriesValue::new(indexes, values, ignore_year)?;
            if repeat {
                Ok(ParameterValue::RepeatingTimeSeries(Arc::new(
                    RepeatingTimeSeriesValue::new(series)?,
                )))
            } else {
                Ok(ParameterValue::TimeSeries(Arc::new(series)))
            }
        }
        DbValue::Map(entries) => {
            let mut pairs = Vec::with_capacity(entries.len());
            for (key, value) in entries {
                pairs.push((key, parameter_value(value)?));
            }
            Ok(ParameterValue::Map(Arc::new(MapValue::new(pairs)?)))
        }
    }
}

/// Merges `new` over `old`. Two maps of the same key kind merge per key,
/// recursively; anything else is a shallow overwrite by `new`.
pub fn merge_values(old: &ParameterValue, new: ParameterValue) -> Result<ParameterValue> {
    match (old, new) {
        (ParameterValue::Map(a), ParameterValue::Map(b)) if a.kind() == b.kind() => {
            let mut pairs: Vec<(MapKey, ParameterValue)> =
                a.pairs().map(|(k, v)| (k.clone(), v.clone())).collect();
            for (key, value) in b.pairs() {
                match pairs.iter_mut().find(|(existing, _)| existing == key) {
                    Some(slot) => slot.1 = merge_values(&slot.1, value.clone())?,
                    None => pairs.push((key.clone(), value.clone())),
                }
            }
            Ok(ParameterValue::Map(Arc::new(MapValue::new(pairs)?)))
        }
        (_, new) => Ok(new),
    }
}
