//! Evaluation of parameter values against keyword arguments.
//!
//! Every [`ParameterValue`] variant is callable through
//! [`ParameterValue::call`] with an optional index `i`, an optional time
//! query `t` (a point or a [`TimeSlice`]) and a chain of map keys `inds`.
//! The return value is again a `ParameterValue`: scalar results come back as
//! [`Scalar`] and misses come back as `Nothing`, so filtering queries never
//! fail on absent data.
//!
//! # Slice aggregation
//! Time-series lookups over a slice take the NaN-skipping mean of the window
//! `indexes[a..=b]` where `a` is `searchsortedlast(start)` clamped into the
//! series and `b` is `searchsortedfirst(end) - 1`. Repeating series first
//! normalize both anchors by whole spans; windows wider than one span use
//! the precomputed `valsum`/`len` metadata for the repetitions in between.
//! Year-agnostic series re-anchor the query to year zero, matching their
//! indexes, and lose the after-the-last-index cutoff.
//!
//! # Freshness
//! Whenever a lookup resolves at a time slice, the distance from each slice
//! anchor to its next transition (the next series index, wrapped for
//! repeating series; the next precision boundary for patterns; the next key
//! for timestamp maps) becomes the timeout under which the supplied
//! [`Observer`] is registered on the slice. Rolling the slice past the
//! timeout fires the observer.

use std::fmt;
use std::sync::Arc;

use chrono::{Duration, NaiveDateTime};
use tracing::debug;

use crate::datatype::{
    MapKey, MapKeyKind, MapValue, ParameterValue, RepeatingTimeSeriesValue, Scalar,
    TimePatternValue, TimeSeriesValue,
};
use crate::timeline::{next_boundary, strip_year, IntervalField, Observer, TimeSlice};

// ------------- Query arguments -------------
#[derive(Debug, Clone)]
pub enum TimeQuery {
    At(NaiveDateTime),
    Over(TimeSlice),
}

/// The keyword arguments of a value invocation.
#[derive(Debug, Clone, Default)]
pub struct CallArgs {
    pub i: Option<i64>,
    pub t: Option<TimeQuery>,
    pub inds: Vec<MapKey>,
}

impl CallArgs {
    pub fn new() -> CallArgs {
        CallArgs::default()
    }
    pub fn with_i(mut self, i: i64) -> CallArgs {
        self.i = Some(i);
        self
    }
    pub fn at(mut self, t: NaiveDateTime) -> CallArgs {
        self.t = Some(TimeQuery::At(t));
        self
    }
    pub fn over(mut self, slice: &TimeSlice) -> CallArgs {
        self.t = Some(TimeQuery::Over(slice.clone()));
        self
    }
    pub fn with_ind(mut self, key: MapKey) -> CallArgs {
        self.inds.push(key);
        self
    }
    pub fn with_inds(mut self, keys: Vec<MapKey>) -> CallArgs {
        self.inds = keys;
        self
    }
}

impl fmt::Display for CallArgs {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut parts = Vec::new();
        if let Some(i) = self.i {
            parts.push(format!("i={i}"));
        }
        match &self.t {
            Some(TimeQuery::At(t)) => parts.push(format!("t={t}")),
            Some(TimeQuery::Over(slice)) => parts.push(format!("t={slice}")),
            None => (),
        }
        if !self.inds.is_empty() {
            let keys: Vec<String> = self.inds.iter().map(|k| k.to_string()).collect();
            parts.push(format!("inds=({})", keys.join(", ")));
        }
        write!(f, "{}", parts.join(", "))
    }
}

// ------------- Sorted-vector search -------------
// Count of elements <= t, i.e. the one-based position of the last element
// not above t (0 when every element is above).
pub(crate) fn rank_last<T: PartialOrd>(xs: &[T], t: &T) -> usize {
    xs.partition_point(|x| x <= t)
}

// One-based position of the first element >= t (len + 1 when none is).
pub(crate) fn rank_first<T: PartialOrd>(xs: &[T], t: &T) -> usize {
    xs.partition_point(|x| x < t) + 1
}

fn nan_sum(values: &[f64]) -> (f64, usize) {
    let mut sum = 0.0;
    let mut count = 0;
    for v in values {
        if !v.is_nan() {
            sum += v;
            count += 1;
        }
    }
    (sum, count)
}

fn nan_mean(values: &[f64]) -> Option<f64> {
    let (sum, count) = nan_sum(values);
    if count == 0 {
        None
    } else {
        Some(sum / count as f64)
    }
}

fn whole_spans(elapsed: Duration, span: Duration) -> i64 {
    elapsed.num_seconds().div_euclid(span.num_seconds())
}

fn min_option(a: Option<Duration>, b: Option<Duration>) -> Option<Duration> {
    match (a, b) {
        (Some(x), Some(y)) => Some(x.min(y)),
        (Some(x), None) | (None, Some(x)) => Some(x),
        (None, None) => None,
    }
}

// ------------- Time pattern lookup -------------
fn pattern_at(pattern: &TimePatternValue, t: NaiveDateTime) -> ParameterValue {
    let matched: Vec<f64> = pattern
        .pattern
        .iter()
        .filter(|(pc, _)| pc.matches_point(t))
        .map(|(_, v)| *v)
        .collect();
    match nan_mean(&matched) {
        Some(mean) => ParameterValue::real(mean),
        None => ParameterValue::Nothing,
    }
}

fn pattern_over(
    pattern: &TimePatternValue,
    start: NaiveDateTime,
    end: NaiveDateTime,
) -> ParameterValue {
    let matched: Vec<f64> = pattern
        .pattern
        .iter()
        .filter(|(pc, _)| pc.overlaps_slice(start, end))
        .map(|(_, v)| *v)
        .collect();
    match nan_mean(&matched) {
        Some(mean) => ParameterValue::real(mean),
        None => ParameterValue::Nothing,
    }
}

fn pattern_timeout(precision: IntervalField, slice: &TimeSlice) -> Duration {
    let granularity = precision.granularity();
    let start = slice.start();
    let end = slice.end();
    let from_start = next_boundary(start, granularity) - start;
    let from_end = next_boundary(end, granularity) - end;
    from_start.min(from_end)
}

// ------------- Time series lookup -------------
fn series_at(ts: &TimeSeriesValue, t: NaiveDateTime) -> ParameterValue {
    let t = if ts.ignore_year { strip_year(t) } else { t };
    let i = rank_last(&ts.indexes, &t);
    if i == 0 {
        return ParameterValue::Nothing;
    }
    if !ts.ignore_year && t > *ts.indexes.last().unwrap() {
        return ParameterValue::Nothing;
    }
    ParameterValue::real(ts.values[i - 1])
}

// Anchors adjusted for year-agnostic series: the start is re-anchored and
// the end keeps the slice duration.
fn normalize_window(
    ts: &TimeSeriesValue,
    start: NaiveDateTime,
    end: NaiveDateTime,
) -> (NaiveDateTime, NaiveDateTime) {
    if ts.ignore_year {
        let s = strip_year(start);
        (s, s + (end - start))
    } else {
        (start, end)
    }
}

fn series_over(ts: &TimeSeriesValue, start: NaiveDateTime, end: NaiveDateTime) -> ParameterValue {
    let (t_start, t_end) = normalize_window(ts, start, end);
    if !ts.ignore_year && t_start > *ts.indexes.last().unwrap() {
        return ParameterValue::Nothing;
    }
    let a = rank_last(&ts.indexes, &t_start).max(1);
    let b = rank_first(&ts.indexes, &t_end) - 1;
    if b == 0 || a > b {
        return ParameterValue::Nothing;
    }
    match nan_mean(&ts.values[a - 1..b]) {
        Some(mean) => ParameterValue::real(mean),
        None => ParameterValue::Nothing,
    }
}

fn repeating_at(repeating: &RepeatingTimeSeriesValue, t: NaiveDateTime) -> ParameterValue {
    let ts = &repeating.series;
    let t = if ts.ignore_year { strip_year(t) } else { t };
    let first = ts.indexes[0];
    let reps = whole_spans(t - first, repeating.span);
    let t = t - Duration::seconds(reps * repeating.span.num_seconds());
    let i = rank_last(&ts.indexes, &t);
    if i == 0 {
        return ParameterValue::Nothing;
    }
    ParameterValue::real(ts.values[i - 1])
}

fn repeating_over(
    repeating: &RepeatingTimeSeriesValue,
    start: NaiveDateTime,
    end: NaiveDateTime,
) -> ParameterValue {
    let ts = &repeating.series;
    let first = ts.indexes[0];
    let span_seconds = repeating.span.num_seconds();
    let (mut t_start, mut t_end) = normalize_window(ts, start, end);
    let reps_start = whole_spans(t_start - first, repeating.span);
    t_start = t_start - Duration::seconds(reps_start * span_seconds);
    let reps_end = whole_spans(t_end - first, repeating.span);
    t_end = t_end - Duration::seconds(reps_end * span_seconds);
    let mut reps = reps_end - reps_start;
    let a = rank_last(&ts.indexes, &t_start).max(1);
    let mut b = rank_first(&ts.indexes, &t_end) - 1;
    if b == 0 {
        // The window's head wraps the whole series; discount one repetition.
        b = ts.indexes.len();
        reps -= 1;
    }
    if reps <= 0 {
        if a > b {
            return ParameterValue::Nothing;
        }
        return match nan_mean(&ts.values[a - 1..b]) {
            Some(mean) => ParameterValue::real(mean),
            None => ParameterValue::Nothing,
        };
    }
    let (asum, alen) = nan_sum(&ts.values[a - 1..]);
    let (bsum, blen) = nan_sum(&ts.values[..b]);
    let middle = (reps - 1) as f64;
    let denominator = (alen + blen) as f64 + middle * repeating.len as f64;
    if denominator == 0.0 {
        return ParameterValue::Nothing;
    }
    ParameterValue::real((asum + bsum + middle * repeating.valsum) / denominator)
}

// Distance from an (already normalized) anchor to the next index transition.
fn next_transition(
    indexes: &[NaiveDateTime],
    anchor: NaiveDateTime,
    wrap: Option<Duration>,
) -> Option<Duration> {
    let anchor = match wrap {
        Some(span) => {
            let first = indexes[0];
            let reps = whole_spans(anchor - first, span);
            anchor - Duration::seconds(reps * span.num_seconds())
        }
        None => anchor,
    };
    match indexes.get(rank_last(indexes, &anchor)) {
        Some(next) => Some(*next - anchor),
        None => wrap.map(|span| indexes[0] + span - anchor),
    }
}

fn series_timeout(
    ts: &TimeSeriesValue,
    wrap: Option<Duration>,
    slice: &TimeSlice,
) -> Option<Duration> {
    let (t_start, t_end) = normalize_window(ts, slice.start(), slice.end());
    min_option(
        next_transition(&ts.indexes, t_start, wrap),
        next_transition(&ts.indexes, t_end, wrap),
    )
}

// ------------- Map lookup -------------
fn map_timeout(map: &MapValue, anchor: NaiveDateTime) -> Option<Duration> {
    for key in map.keys() {
        if let MapKey::Timestamp(t) = key {
            if *t > anchor {
                return Some(*t - anchor);
            }
        }
    }
    None
}

fn map_call(
    map: &Arc<MapValue>,
    whole: &ParameterValue,
    args: &CallArgs,
    observer: Option<&Observer>,
) -> ParameterValue {
    if let Some(first) = args.inds.first() {
        let position = match first.kind() {
            MapKeyKind::Symbol => map.position_exact(first),
            MapKeyKind::Timestamp | MapKeyKind::Real => map.position_last(first),
        };
        return match position {
            Some(pos) => {
                let rest = CallArgs {
                    i: args.i,
                    t: args.t.clone(),
                    inds: args.inds[1..].to_vec(),
                };
                map.values()[pos].call(&rest, observer)
            }
            // A miss falls back to the no-key behaviour: the map itself.
            None => whole.clone(),
        };
    }
    if map.kind() == Some(MapKeyKind::Timestamp) {
        if let Some(query) = &args.t {
            let anchor = match query {
                TimeQuery::At(t) => *t,
                TimeQuery::Over(slice) => slice.start(),
            };
            if let Some(pos) = map.position_last(&MapKey::Timestamp(anchor)) {
                if let TimeQuery::Over(slice) = query {
                    register(slice, observer, map_timeout(map, anchor));
                }
                // The time query descends and is forwarded to the entry.
                return map.values()[pos].call(args, observer);
            }
        }
    }
    whole.clone()
}

fn register(slice: &TimeSlice, observer: Option<&Observer>, timeout: Option<Duration>) {
    if let (Some(observer), Some(timeout)) = (observer, timeout) {
        let timeout = timeout.max(Duration::zero());
        debug!(slice = %slice, timeout_s = timeout.num_seconds(), "registering observer");
        slice.add_observer(timeout, observer.clone());
    }
}

// ------------- The evaluation contract -------------
impl ParameterValue {
    /// Evaluates the value under the given arguments. Misses produce
    /// `Nothing`, never an error. When the query carries a [`TimeSlice`] and
    /// an observer, the observer is registered on the slice under the
    /// computed freshness timeout.
    pub fn call(&self, args: &CallArgs, observer: Option<&Observer>) -> ParameterValue {
        match self {
            ParameterValue::Nothing => ParameterValue::Nothing,
            ParameterValue::Scalar(s) => ParameterValue::Scalar(s.clone()),
            ParameterValue::Array(values) => match args.i {
                Some(i) if i >= 1 && (i as usize) <= values.len() => {
                    ParameterValue::Scalar(values[i as usize - 1].clone())
                }
                Some(_) => ParameterValue::Nothing,
                None => ParameterValue::Array(Arc::clone(values)),
            },
            ParameterValue::TimePattern(pattern) => match &args.t {
                None => self.clone(),
                Some(TimeQuery::At(t)) => pattern_at(pattern, *t),
                Some(TimeQuery::Over(slice)) => {
                    register(slice, observer, Some(pattern_timeout(pattern.precision, slice)));
                    pattern_over(pattern, slice.start(), slice.end())
                }
            },
            ParameterValue::TimeSeries(ts) => match &args.t {
                None => self.clone(),
                Some(TimeQuery::At(t)) => series_at(ts, *t),
                Some(TimeQuery::Over(slice)) => {
                    register(slice, observer, series_timeout(ts, None, slice));
                    series_over(ts, slice.start(), slice.end())
                }
            },
            ParameterValue::RepeatingTimeSeries(repeating) => match &args.t {
                None => self.clone(),
                Some(TimeQuery::At(t)) => repeating_at(repeating, *t),
                Some(TimeQuery::Over(slice)) => {
                    register(
                        slice,
                        observer,
                        series_timeout(&repeating.series, Some(repeating.span), slice),
                    );
                    repeating_over(repeating, slice.start(), slice.end())
                }
            },
            ParameterValue::Map(map) => map_call(map, self, args, observer),
        }
    }
}

// ------------- Maximum ranking -------------
// Ranks a scalar for maximum comparisons: numerics by value, periods by
// their upper bound in minutes; symbols and timestamps are not ranked
// against numerics.
pub(crate) fn scalar_rank(scalar: &Scalar) -> Option<f64> {
    match scalar {
        Scalar::Period(p) => Some(p.upper_bound().num_seconds() as f64 / 60.0),
        Scalar::Symbol(_) | Scalar::Timestamp(_) => None,
        other => match other.as_f64() {
            Some(rank) if !rank.is_nan() => Some(rank),
            _ => None,
        },
    }
}

fn consider(scalar: &Scalar, best: &mut Option<(f64, Scalar)>) {
    if let Some(rank) = scalar_rank(scalar) {
        let better = match best {
            Some((current, _)) => rank > *current,
            None => true,
        };
        if better {
            *best = Some((rank, scalar.clone()));
        }
    }
}

/// Recursively folds the maximum rankable scalar inside a value into `best`,
/// skipping NaN entries.
pub(crate) fn fold_maximum(value: &ParameterValue, best: &mut Option<(f64, Scalar)>) {
    match value {
        ParameterValue::Nothing => (),
        ParameterValue::Scalar(s) => consider(s, best),
        ParameterValue::Array(values) => {
            for s in values.iter() {
                consider(s, best);
            }
        }
        ParameterValue::TimePattern(pattern) => {
            for (_, v) in &pattern.pattern {
                consider(&Scalar::Real(*v), best);
            }
        }
        ParameterValue::TimeSeries(ts) => {
            for v in &ts.values {
                consider(&Scalar::Real(*v), best);
            }
        }
        ParameterValue::RepeatingTimeSeries(repeating) => {
            for v in &repeating.series.values {
                consider(&Scalar::Real(*v), best);
            }
        }
        ParameterValue::Map(map) => {
            for v in map.values() {
                fold_maximum(v, best);
            }
        }
    }
}
