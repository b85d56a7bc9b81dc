//! The time model: rollable time slices, calendar period collections and
//! duration arithmetic.
//!
//! A [`TimeSlice`] is a half-open interval `[start, end)` whose position can
//! be shifted with [`TimeSlice::roll`] while its identity, duration and
//! temporal blocks stay frozen. Slices own buckets of [`Observer`] handles
//! keyed by the remaining time until the answer they cached goes stale;
//! rolling drains the buckets that have become due and fires them.
//!
//! A [`PeriodCollection`] is a union of intersections of calendar intervals
//! (`Y`, `M`, `D`, `WD`, `h`, `m`, `s`), parsed from strings such as
//! `"M1-4,M9-12"` (union on `,`) and `"M1-4;WD1-5"` (intersection on `;`).
//! Matching a slice against a collection uses the slice footprint: the start
//! floored and the end ceiled at the interval's granularity, compared per
//! parent calendar unit.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};

use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, Timelike};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::construct::{next_thing, Object, OtherHasher, Thing};
use crate::error::{EntwineError, Result};

// ------------- Granularity -------------
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Granularity {
    Year,
    Month,
    Day,
    Hour,
    Minute,
    Second,
}

fn ymd(year: i32, month: u32, day: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(year, month, day)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .unwrap()
}

pub(crate) fn floor_to(t: NaiveDateTime, granularity: Granularity) -> NaiveDateTime {
    let date = t.date();
    match granularity {
        Granularity::Year => ymd(date.year(), 1, 1),
        Granularity::Month => ymd(date.year(), date.month(), 1),
        Granularity::Day => ymd(date.year(), date.month(), date.day()),
        Granularity::Hour => date.and_hms_opt(t.hour(), 0, 0).unwrap(),
        Granularity::Minute => date.and_hms_opt(t.hour(), t.minute(), 0).unwrap(),
        Granularity::Second => date.and_hms_opt(t.hour(), t.minute(), t.second()).unwrap(),
    }
}

// Advances a value already on a granularity boundary by one unit.
fn bump(floored: NaiveDateTime, granularity: Granularity) -> NaiveDateTime {
    let date = floored.date();
    match granularity {
        Granularity::Year => ymd(date.year() + 1, 1, 1),
        Granularity::Month => {
            if date.month() == 12 {
                ymd(date.year() + 1, 1, 1)
            } else {
                ymd(date.year(), date.month() + 1, 1)
            }
        }
        Granularity::Day => floored + Duration::days(1),
        Granularity::Hour => floored + Duration::hours(1),
        Granularity::Minute => floored + Duration::minutes(1),
        Granularity::Second => floored + Duration::seconds(1),
    }
}

pub(crate) fn ceil_to(t: NaiveDateTime, granularity: Granularity) -> NaiveDateTime {
    let floored = floor_to(t, granularity);
    if floored == t {
        t
    } else {
        bump(floored, granularity)
    }
}

/// The first granularity boundary strictly greater than `t`.
pub(crate) fn next_boundary(t: NaiveDateTime, granularity: Granularity) -> NaiveDateTime {
    bump(floor_to(t, granularity), granularity)
}

/// Replaces the year component with year zero, the anchor used by
/// year-agnostic time series. Year zero is a leap year in the proleptic
/// Gregorian calendar, so every month/day combination stays valid.
pub(crate) fn strip_year(t: NaiveDateTime) -> NaiveDateTime {
    t.with_year(0).unwrap_or(t)
}

fn monday_of(date: NaiveDate) -> NaiveDate {
    date - Duration::days(date.weekday().number_from_monday() as i64 - 1)
}

// ------------- PeriodCollection -------------
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum IntervalField {
    Year,
    Month,
    Day,
    WeekDay,
    Hour,
    Minute,
    Second,
}

impl IntervalField {
    pub fn granularity(&self) -> Granularity {
        match self {
            IntervalField::Year => Granularity::Year,
            IntervalField::Month => Granularity::Month,
            IntervalField::Day | IntervalField::WeekDay => Granularity::Day,
            IntervalField::Hour => Granularity::Hour,
            IntervalField::Minute => Granularity::Minute,
            IntervalField::Second => Granularity::Second,
        }
    }
    // Hours, minutes and seconds are 1-based; the rest as produced by the calendar.
    fn component(&self, t: NaiveDateTime) -> i64 {
        match self {
            IntervalField::Year => t.year() as i64,
            IntervalField::Month => t.month() as i64,
            IntervalField::Day => t.day() as i64,
            IntervalField::WeekDay => t.weekday().number_from_monday() as i64,
            IntervalField::Hour => t.hour() as i64 + 1,
            IntervalField::Minute => t.minute() as i64 + 1,
            IntervalField::Second => t.second() as i64 + 1,
        }
    }
    // Distance between the enclosing parent calendar units of two boundary
    // values (Y has no parent, M sits in Y, D in M, WD in the week, h in D,
    // m in h, s in m).
    fn parent_units(&self, s: NaiveDateTime, e: NaiveDateTime) -> i64 {
        match self {
            IntervalField::Year => 0,
            IntervalField::Month => e.year() as i64 - s.year() as i64,
            IntervalField::Day => {
                (e.year() as i64 * 12 + e.month() as i64) - (s.year() as i64 * 12 + s.month() as i64)
            }
            IntervalField::WeekDay => (monday_of(e.date()) - monday_of(s.date())).num_days() / 7,
            IntervalField::Hour => (e.date() - s.date()).num_days(),
            IntervalField::Minute => {
                (floor_to(e, Granularity::Hour) - floor_to(s, Granularity::Hour)).num_hours()
            }
            IntervalField::Second => {
                (floor_to(e, Granularity::Minute) - floor_to(s, Granularity::Minute)).num_minutes()
            }
        }
    }
    fn tag(&self) -> &'static str {
        match self {
            IntervalField::Year => "Y",
            IntervalField::Month => "M",
            IntervalField::Day => "D",
            IntervalField::WeekDay => "WD",
            IntervalField::Hour => "h",
            IntervalField::Minute => "m",
            IntervalField::Second => "s",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimeInterval {
    pub field: IntervalField,
    pub lower: i64,
    pub upper: i64,
}

impl TimeInterval {
    pub fn contains(&self, value: i64) -> bool {
        self.lower <= value && value <= self.upper
    }
    /// Whether the interval overlaps the footprint of `[start, end)` at the
    /// field's granularity: same parent unit means plain range intersection,
    /// one parent apart means the slice wraps the parent boundary and only
    /// misses if the interval falls entirely in the uncovered gap, further
    /// apart means the slice spans a whole field cycle.
    pub fn overlaps_slice(&self, start: NaiveDateTime, end: NaiveDateTime) -> bool {
        let granularity = self.field.granularity();
        let s = floor_to(start, granularity);
        let e = ceil_to(end, granularity);
        let fs = self.field.component(s);
        let fe = self.field.component(e);
        match self.field.parent_units(s, e) {
            0 => fs <= self.upper && fe >= self.lower,
            1 => !(self.lower > fe && self.upper < fs),
            _ => true,
        }
    }
}

impl fmt::Display for TimeInterval {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.lower == self.upper {
            write!(f, "{}{}", self.field.tag(), self.lower)
        } else {
            write!(f, "{}{}-{}", self.field.tag(), self.lower, self.upper)
        }
    }
}

/// A union of intersections of calendar intervals.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeriodCollection {
    intersections: Vec<Vec<TimeInterval>>,
}

lazy_static! {
    static ref RE_INTERVAL: Regex = Regex::new(r"^(WD|Y|M|D|h|m|s)([0-9]+)(?:-([0-9]+))?$").unwrap();
}

impl PeriodCollection {
    /// Parses a specification such as `"Y2000-2005;M1-3,M7-9"`: `,` separates
    /// union branches, `;` separates intervals within an intersection.
    pub fn parse(spec: &str) -> Result<PeriodCollection> {
        let mut intersections = Vec::new();
        for branch in spec.split(',') {
            let mut intervals = Vec::new();
            for part in branch.split(';') {
                let part = part.trim();
                let caps = RE_INTERVAL.captures(part).ok_or_else(|| EntwineError::Parse {
                    message: format!("malformed period interval {part:?} in {spec:?}"),
                })?;
                let field = match &caps[1] {
                    "Y" => IntervalField::Year,
                    "M" => IntervalField::Month,
                    "D" => IntervalField::Day,
                    "WD" => IntervalField::WeekDay,
                    "h" => IntervalField::Hour,
                    "m" => IntervalField::Minute,
                    _ => IntervalField::Second,
                };
                let lower: i64 = caps[2].parse().map_err(|_| EntwineError::Parse {
                    message: format!("bad lower bound in {part:?}"),
                })?;
                let upper: i64 = match caps.get(3) {
                    Some(m) => m.as_str().parse().map_err(|_| EntwineError::Parse {
                        message: format!("bad upper bound in {part:?}"),
                    })?,
                    None => lower,
                };
                if upper < lower {
                    return Err(EntwineError::Parse {
                        message: format!("inverted interval {part:?} in {spec:?}"),
                    });
                }
                intervals.push(TimeInterval { field, lower, upper });
            }
            intersections.push(intervals);
        }
        if intersections.iter().any(|i| i.is_empty()) {
            return Err(EntwineError::Parse {
                message: format!("empty intersection in {spec:?}"),
            });
        }
        Ok(PeriodCollection { intersections })
    }

    pub fn intersections(&self) -> &[Vec<TimeInterval>] {
        &self.intersections
    }

    /// A point matches if some intersection has every interval containing the
    /// corresponding calendar component.
    pub fn matches_point(&self, t: NaiveDateTime) -> bool {
        self.intersections
            .iter()
            .any(|intervals| intervals.iter().all(|i| i.contains(i.field.component(t))))
    }

    /// A slice matches if some intersection has every interval overlapping
    /// the slice footprint.
    pub fn overlaps_slice(&self, start: NaiveDateTime, end: NaiveDateTime) -> bool {
        self.intersections
            .iter()
            .any(|intervals| intervals.iter().all(|i| i.overlaps_slice(start, end)))
    }

    /// The finest field present across all intervals.
    pub fn precision(&self) -> IntervalField {
        self.intersections
            .iter()
            .flatten()
            .map(|i| i.field)
            .max()
            .unwrap_or(IntervalField::Year)
    }
}

impl fmt::Display for PeriodCollection {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let branches: Vec<String> = self
            .intersections
            .iter()
            .map(|intervals| {
                intervals
                    .iter()
                    .map(|i| i.to_string())
                    .collect::<Vec<_>>()
                    .join(";")
            })
            .collect();
        write!(f, "{}", branches.join(","))
    }
}

// ------------- Period -------------
/// A calendar duration, used for parameter values of the period kind and for
/// comparing resolutions. Months and years have no fixed length; their upper
/// bounds (31 and 366 days) are used whenever a concrete extent is needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Period {
    Seconds(i64),
    Minutes(i64),
    Hours(i64),
    Days(i64),
    Months(i64),
    Years(i64),
}

lazy_static! {
    static ref RE_PERIOD: Regex = Regex::new(
        r"^([0-9]+)\s*(years?|months?|minutes?|seconds?|hours?|days?|Y|M|D|h|m|s)$"
    )
    .unwrap();
}

impl Period {
    pub fn parse(text: &str) -> Result<Period> {
        let caps = RE_PERIOD
            .captures(text.trim())
            .ok_or_else(|| EntwineError::Parse {
                message: format!("malformed duration {text:?}"),
            })?;
        let count: i64 = caps[1].parse().map_err(|_| EntwineError::Parse {
            message: format!("bad duration count in {text:?}"),
        })?;
        let period = match &caps[2] {
            "Y" | "year" | "years" => Period::Years(count),
            "M" | "month" | "months" => Period::Months(count),
            "D" | "day" | "days" => Period::Days(count),
            "h" | "hour" | "hours" => Period::Hours(count),
            "m" | "minute" | "minutes" => Period::Minutes(count),
            _ => Period::Seconds(count),
        };
        Ok(period)
    }
    /// The longest concrete extent the period can denote.
    pub fn upper_bound(&self) -> Duration {
        match self {
            Period::Seconds(n) => Duration::seconds(*n),
            Period::Minutes(n) => Duration::minutes(*n),
            Period::Hours(n) => Duration::hours(*n),
            Period::Days(n) => Duration::days(*n),
            Period::Months(n) => Duration::days(31 * n),
            Period::Years(n) => Duration::days(366 * n),
        }
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Period::Seconds(n) => write!(f, "{n}s"),
            Period::Minutes(n) => write!(f, "{n}m"),
            Period::Hours(n) => write!(f, "{n}h"),
            Period::Days(n) => write!(f, "{n}D"),
            Period::Months(n) => write!(f, "{n}M"),
            Period::Years(n) => write!(f, "{n}Y"),
        }
    }
}

// ------------- Observer -------------
static NEXT_OBSERVER: AtomicU64 = AtomicU64::new(1);

/// A generational handle around a refresh callback. Handles are compared and
/// hashed by id, so the same observer registered under several timeouts is
/// still one observer. Callbacks must not hold a strong reference to the
/// slice they watch and must not roll it.
#[derive(Clone)]
pub struct Observer {
    id: u64,
    callback: Arc<dyn Fn() + Send + Sync>,
}

impl Observer {
    pub fn new(callback: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            id: NEXT_OBSERVER.fetch_add(1, AtomicOrdering::Relaxed),
            callback: Arc::new(callback),
        }
    }
    pub fn id(&self) -> u64 {
        self.id
    }
    pub fn fire(&self) {
        (self.callback)();
    }
}

impl PartialEq for Observer {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
impl Eq for Observer {}

impl fmt::Debug for Observer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Observer({})", self.id)
    }
}

// ------------- TimeSlice -------------
type ObserverBuckets = BTreeMap<i64, HashMap<u64, Observer, OtherHasher>>;

#[derive(Debug)]
struct SliceInner {
    id: Thing,
    duration: Duration,
    blocks: Vec<Arc<Object>>,
    bounds: Mutex<(NaiveDateTime, NaiveDateTime)>,
    observers: Mutex<ObserverBuckets>,
}

/// A half-open interval `[start, end)` with a frozen identity and duration
/// and a rollable position. Cheap to clone; clones share the same slice.
#[derive(Debug, Clone)]
pub struct TimeSlice {
    inner: Arc<SliceInner>,
}

impl TimeSlice {
    pub fn new(
        start: NaiveDateTime,
        end: NaiveDateTime,
        blocks: Vec<Arc<Object>>,
    ) -> Result<TimeSlice> {
        if start > end {
            return Err(EntwineError::Invariant(format!(
                "time slice starts at {start} after its end {end}"
            )));
        }
        Ok(TimeSlice {
            inner: Arc::new(SliceInner {
                id: next_thing(),
                duration: end - start,
                blocks,
                bounds: Mutex::new((start, end)),
                observers: Mutex::new(BTreeMap::new()),
            }),
        })
    }

    pub fn id(&self) -> Thing {
        self.inner.id
    }
    pub fn start(&self) -> NaiveDateTime {
        self.inner.bounds.lock().unwrap().0
    }
    pub fn end(&self) -> NaiveDateTime {
        self.inner.bounds.lock().unwrap().1
    }
    pub fn duration(&self) -> Duration {
        self.inner.duration
    }
    pub fn duration_minutes(&self) -> f64 {
        self.inner.duration.num_seconds() as f64 / 60.0
    }
    pub fn blocks(&self) -> &[Arc<Object>] {
        &self.inner.blocks
    }

    /// Registers `observer` to fire once `timeout` has elapsed under rolling.
    pub fn add_observer(&self, timeout: Duration, observer: Observer) {
        let seconds = timeout.num_seconds().max(0);
        let mut buckets = self.inner.observers.lock().unwrap();
        buckets
            .entry(seconds)
            .or_default()
            .insert(observer.id(), observer);
    }

    pub fn observer_count(&self) -> usize {
        self.inner
            .observers
            .lock()
            .unwrap()
            .values()
            .map(|b| b.len())
            .sum()
    }

    /// Rolls the slice by `delta` and fires the observers that became due.
    pub fn roll(&self, delta: Duration) {
        self.roll_with(delta, true)
    }

    /// Rolls the slice by `delta`. With `update` unset the position moves but
    /// no observer bookkeeping happens, which is how a rolled-forward slice
    /// is restored without refreshing. A backward updating roll fires every
    /// observer: timeouts only track forward expiry.
    pub fn roll_with(&self, delta: Duration, update: bool) {
        {
            let mut bounds = self.inner.bounds.lock().unwrap();
            bounds.0 = bounds.0 + delta;
            bounds.1 = bounds.1 + delta;
        }
        if !update {
            return;
        }
        let delta_seconds = delta.num_seconds();
        let due: Vec<Observer> = {
            let mut buckets = self.inner.observers.lock().unwrap();
            let drained = std::mem::take(&mut *buckets);
            let mut due = Vec::new();
            for (timeout, observers) in drained {
                let remaining = timeout - delta_seconds;
                if delta_seconds < 0 || remaining <= 0 {
                    due.extend(observers.into_values());
                } else {
                    buckets.entry(remaining).or_default().extend(observers);
                }
            }
            due
        };
        if !due.is_empty() {
            debug!(slice = %self, fired = due.len(), "observers due after roll");
        }
        // Fired outside the locks so callbacks may re-register.
        for observer in due {
            observer.fire();
        }
    }

    pub fn before(&self, other: &TimeSlice) -> bool {
        other.start() >= self.end()
    }
    pub fn contains(&self, other: &TimeSlice) -> bool {
        self.start() <= other.start() && other.end() <= self.end()
    }
    pub fn iscontained(&self, other: &TimeSlice) -> bool {
        other.contains(self)
    }
    pub fn contains_point(&self, t: NaiveDateTime) -> bool {
        self.start() <= t && t < self.end()
    }
    pub fn overlaps(&self, other: &TimeSlice) -> bool {
        let (a0, a1) = (self.start(), self.end());
        let (b0, b1) = (other.start(), other.end());
        (a0 <= b0 && b0 < a1) || (b0 <= a0 && a0 < b1)
    }
    pub fn overlap_duration(&self, other: &TimeSlice) -> Duration {
        let from = self.start().max(other.start());
        let until = self.end().min(other.end());
        if until > from {
            until - from
        } else {
            Duration::zero()
        }
    }
}

impl PartialEq for TimeSlice {
    fn eq(&self, other: &Self) -> bool {
        self.start() == other.start()
            && self.end() == other.end()
            && self.inner.duration == other.inner.duration
            && self.inner.blocks.len() == other.inner.blocks.len()
            && self
                .inner
                .blocks
                .iter()
                .zip(other.inner.blocks.iter())
                .all(|(a, b)| a.object() == b.object())
    }
}

impl PartialOrd for TimeSlice {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some((self.start(), self.end()).cmp(&(other.start(), other.end())))
    }
}

impl fmt::Display for TimeSlice {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}~>{}", self.start(), self.end())
    }
}

fn same_interval(a: &TimeSlice, b: &TimeSlice) -> bool {
    a.start() == b.start() && a.end() == b.end()
}

/// Keeps the slices not contained in any other (the coarsest cover).
/// Interval duplicates keep their first occurrence.
pub fn t_lowest_resolution(slices: &[TimeSlice]) -> Vec<TimeSlice> {
    let mut kept = Vec::new();
    for (i, t) in slices.iter().enumerate() {
        let dominated = slices
            .iter()
            .enumerate()
            .any(|(j, u)| j != i && u.contains(t) && (!same_interval(u, t) || j < i));
        if !dominated {
            kept.push(t.clone());
        }
    }
    kept
}

/// Keeps the slices that contain no other (the finest cover).
pub fn t_highest_resolution(slices: &[TimeSlice]) -> Vec<TimeSlice> {
    let mut kept = Vec::new();
    for (i, t) in slices.iter().enumerate() {
        let dominated = slices
            .iter()
            .enumerate()
            .any(|(j, u)| j != i && t.contains(u) && (!same_interval(t, u) || j < i));
        if !dominated {
            kept.push(t.clone());
        }
    }
    kept
}

pub fn t_lowest_resolution_in_place(slices: &mut Vec<TimeSlice>) {
    *slices = t_lowest_resolution(slices);
}

pub fn t_highest_resolution_in_place(slices: &mut Vec<TimeSlice>) {
    *slices = t_highest_resolution(slices);
}
