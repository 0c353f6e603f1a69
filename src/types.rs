use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

/// One OHLCV observation. Produced by ingestion, never mutated here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub ts_ns: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Price fields readable directly from a [`Bar`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RawField {
    Open,
    High,
    Low,
    Close,
    Volume,
}

impl RawField {
    pub const ALL: [RawField; 5] = [
        RawField::Open,
        RawField::High,
        RawField::Low,
        RawField::Close,
        RawField::Volume,
    ];

    /// Accepts canonical names and the `*_price` column aliases.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "open" | "open_price" => Some(Self::Open),
            "high" | "high_price" => Some(Self::High),
            "low" | "low_price" => Some(Self::Low),
            "close" | "close_price" => Some(Self::Close),
            "volume" => Some(Self::Volume),
            _ => None,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::High => "high",
            Self::Low => "low",
            Self::Close => "close",
            Self::Volume => "volume",
        }
    }

    #[inline]
    pub fn read(self, bar: &Bar) -> f64 {
        match self {
            Self::Open => bar.open,
            Self::High => bar.high,
            Self::Low => bar.low,
            Self::Close => bar.close,
            Self::Volume => bar.volume,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TimeframeUnit {
    Minute,
    Hour,
    Day,
    Week,
    Month,
}

impl TimeframeUnit {
    const fn suffix(self) -> char {
        match self {
            Self::Minute => 'm',
            Self::Hour => 'h',
            Self::Day => 'd',
            Self::Week => 'w',
            Self::Month => 'M',
        }
    }
}

/// Bar interval such as `1m`, `4h`, `1d`, `1w` or `1M`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Timeframe {
    pub count: u32,
    pub unit: TimeframeUnit,
}

impl Timeframe {
    pub const fn new(count: u32, unit: TimeframeUnit) -> Self {
        Self { count, unit }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid timeframe `{0}`")]
pub struct InvalidTimeframe(pub String);

impl FromStr for Timeframe {
    type Err = InvalidTimeframe;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let invalid = || InvalidTimeframe(raw.to_string());
        let mut chars = raw.chars();
        let unit = match chars.next_back().ok_or_else(invalid)? {
            'm' => TimeframeUnit::Minute,
            'h' => TimeframeUnit::Hour,
            'd' => TimeframeUnit::Day,
            'w' => TimeframeUnit::Week,
            'M' => TimeframeUnit::Month,
            _ => return Err(invalid()),
        };
        let digits = chars.as_str();
        if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
            return Err(invalid());
        }
        let count = digits.parse::<u32>().map_err(|_| invalid())?;
        if count == 0 {
            return Err(invalid());
        }
        Ok(Self { count, unit })
    }
}

impl TryFrom<String> for Timeframe {
    type Error = InvalidTimeframe;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Timeframe> for String {
    fn from(value: Timeframe) -> Self {
        value.to_string()
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.count, self.unit.suffix())
    }
}

/// Inclusive event-time range in nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeRange {
    pub start_ns: i64,
    pub end_ns: i64,
}

impl TimeRange {
    pub const fn new(start_ns: i64, end_ns: i64) -> Self {
        Self { start_ns, end_ns }
    }

    pub const fn all() -> Self {
        Self {
            start_ns: i64::MIN,
            end_ns: i64::MAX,
        }
    }

    #[inline]
    pub const fn contains(&self, ts_ns: i64) -> bool {
        ts_ns >= self.start_ns && ts_ns <= self.end_ns
    }
}

/// How many bars before a range start must also be loaded or computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Preceding {
    Bars(usize),
    All,
}

impl Preceding {
    pub const NONE: Preceding = Preceding::Bars(0);

    pub fn max(self, other: Preceding) -> Preceding {
        match (self, other) {
            (Self::Bars(a), Self::Bars(b)) => Self::Bars(a.max(b)),
            _ => Self::All,
        }
    }
}

/// Deterministic hash of a bound parameter snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ParamHash(pub u64);

impl fmt::Display for ParamHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Concrete parameter values bound at request time, plus the versions of the
/// indicators the formula references. Both feed the hash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSnapshot {
    values: BTreeMap<String, f64>,
    dependency_versions: BTreeMap<String, u32>,
    hash: ParamHash,
}

impl ParameterSnapshot {
    pub fn new(values: BTreeMap<String, f64>, dependency_versions: BTreeMap<String, u32>) -> Self {
        let hash = hash_snapshot(&values, &dependency_versions);
        Self {
            values,
            dependency_versions,
            hash,
        }
    }

    #[inline]
    pub fn get(&self, name: &str) -> Option<f64> {
        self.values.get(name).copied()
    }

    pub fn values(&self) -> &BTreeMap<String, f64> {
        &self.values
    }

    pub fn dependency_versions(&self) -> &BTreeMap<String, u32> {
        &self.dependency_versions
    }

    #[inline]
    pub fn hash(&self) -> ParamHash {
        self.hash
    }
}

fn hash_snapshot(values: &BTreeMap<String, f64>, deps: &BTreeMap<String, u32>) -> ParamHash {
    // BTreeMap keeps key order stable, so the JSON text is canonical.
    let canonical = serde_json::json!({ "params": values, "deps": deps });
    let digest = blake3::hash(canonical.to_string().as_bytes());
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest.as_bytes()[..8]);
    ParamHash(u64::from_le_bytes(head))
}

/// Identity of one output series: everything in a computation key but the timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SeriesKey {
    pub symbol: Arc<str>,
    pub timeframe: Timeframe,
    pub indicator: Arc<str>,
    pub version: u32,
    pub params: ParamHash,
}

impl SeriesKey {
    #[inline]
    pub fn at(&self, ts_ns: i64) -> ComputationKey {
        ComputationKey {
            series: self.clone(),
            ts_ns,
        }
    }
}

impl fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{}/{}@v{}#{}",
            self.symbol, self.timeframe, self.indicator, self.version, self.params
        )
    }
}

/// Unique identity of one output value; also the persisted row key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ComputationKey {
    pub series: SeriesKey,
    pub ts_ns: i64,
}

impl fmt::Display for ComputationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.series, self.ts_ns)
    }
}

/// Why a point was emitted as null.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    InsufficientLookback,
    NullInput,
    DivisionByZero,
    NonFinite,
    DomainError,
}

/// Outcome of evaluating one timestamp: a value, or an explicit skip.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Evaluated {
    pub value: Option<f64>,
    pub skip: Option<SkipReason>,
}

impl Evaluated {
    #[inline]
    pub const fn value(value: f64) -> Self {
        Self {
            value: Some(value),
            skip: None,
        }
    }

    #[inline]
    pub const fn skipped(reason: SkipReason) -> Self {
        Self {
            value: None,
            skip: Some(reason),
        }
    }

    /// Null-aware bitwise equality used for idempotent writes.
    pub fn same_value(&self, other: &Evaluated) -> bool {
        match (self.value, other.value) {
            (None, None) => true,
            (Some(a), Some(b)) => a.to_bits() == b.to_bits(),
            _ => false,
        }
    }
}

impl From<Result<f64, SkipReason>> for Evaluated {
    fn from(slot: Result<f64, SkipReason>) -> Self {
        match slot {
            Ok(v) => Self::value(v),
            Err(reason) => Self::skipped(reason),
        }
    }
}

/// A persisted output row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorValue {
    pub key: ComputationKey,
    pub value: Option<f64>,
    pub skip: Option<SkipReason>,
    pub computed_at: DateTime<Utc>,
}

impl IndicatorValue {
    pub fn new(key: ComputationKey, evaluated: Evaluated) -> Self {
        Self {
            key,
            value: evaluated.value,
            skip: evaluated.skip,
            computed_at: Utc::now(),
        }
    }

    #[inline]
    pub fn evaluated(&self) -> Evaluated {
        Evaluated {
            value: self.value,
            skip: self.skip,
        }
    }
}
