//! # Statmetrics Engine - Incremental Statement Metrics for Database Checks
//!
//! The reusable core of a database monitoring check. Every collection cycle a
//! check receives the full result set of a statistics view (one row per
//! statement, procedure or object, each carrying monotonically increasing
//! counters) and turns it into per-interval metrics.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                          STATMETRICS ENGINE                               │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │  ROW SOURCE → NORMALIZER → DERIVATIVE STORE → ROW LIMITS → EMITTER        │
//! │                                   ▲                          │            │
//! │                        previous snapshot          TAG MANAGER + SUBMITTER │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Features
//!
//! - **Derivative rows**: deltas between consecutive snapshots, with counter
//!   reset detection and first-seen suppression
//! - **Row limits**: ranked truncation of emitted rows and `TOP N` / `LIMIT N`
//!   capping of the fetched result set
//! - **Statement fingerprints**: literal obfuscation and stable query signatures
//! - **Tag management**: keyed and keyless tags with a cached flat list
//! - **Document extraction**: dotted paths, enumerations and group-bys over JSON
//!
//! ## Author
//!
//! AIOps Team

// ============================================================================
// SECTION 1: IMPORTS & DEPENDENCIES
// ============================================================================
// External crate imports organized by functionality.
// ============================================================================

#![allow(dead_code)]
#![warn(rust_2018_idioms)]
#![warn(missing_debug_implementations)]

// ----------------------------------------------------------------------------
// Standard Library Imports
// ----------------------------------------------------------------------------
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::error::Error as StdError;
use std::fmt::{self, Debug, Display, Formatter};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};

// ----------------------------------------------------------------------------
// Async Runtime - Tokio
// ----------------------------------------------------------------------------
use tokio::signal;
use tokio::sync::Notify;
use tokio::time::{interval, MissedTickBehavior};

// ----------------------------------------------------------------------------
// Concurrency Primitives & Shared State
// ----------------------------------------------------------------------------
use arc_swap::ArcSwap;
use dashmap::DashMap;
use once_cell::unsync::OnceCell;
use parking_lot::Mutex;

// ----------------------------------------------------------------------------
// Serialization
// ----------------------------------------------------------------------------
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};

// ----------------------------------------------------------------------------
// String & Memory Optimization
// ----------------------------------------------------------------------------
use compact_str::{CompactString, ToCompactString};
use smallvec::SmallVec;

// ----------------------------------------------------------------------------
// Hashing
// ----------------------------------------------------------------------------
use ahash::{AHashMap, AHashSet};
use xxhash_rust::xxh3::xxh3_64;

// ----------------------------------------------------------------------------
// Error Handling
// ----------------------------------------------------------------------------
use anyhow::{Context as AnyhowContext, Result as AnyhowResult};
use thiserror::Error;

// ----------------------------------------------------------------------------
// Logging & Tracing
// ----------------------------------------------------------------------------
use tracing::{debug, error, info, trace, warn, Level};
use tracing_subscriber::{fmt as tracing_fmt, layer::SubscriberExt, EnvFilter, Layer};

// ----------------------------------------------------------------------------
// Time & Timestamps
// ----------------------------------------------------------------------------
use chrono::{DateTime, Utc};

// ----------------------------------------------------------------------------
// Statistics & Math
// ----------------------------------------------------------------------------
use ordered_float::OrderedFloat;

// ----------------------------------------------------------------------------
// Async Traits
// ----------------------------------------------------------------------------
use async_trait::async_trait;

// ----------------------------------------------------------------------------
// Regex & Pattern Matching
// ----------------------------------------------------------------------------
use regex::Regex;

// ----------------------------------------------------------------------------
// UUID & Identifiers
// ----------------------------------------------------------------------------
use uuid::Uuid;

// ----------------------------------------------------------------------------
// Configuration & Validation
// ----------------------------------------------------------------------------
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use validator::{Validate, ValidationError, ValidationErrors};

// ----------------------------------------------------------------------------
// CLI
// ----------------------------------------------------------------------------
use clap::{Parser, Subcommand, ValueEnum};

// ----------------------------------------------------------------------------
// Prometheus
// ----------------------------------------------------------------------------
use prometheus::{CounterVec, Encoder, GaugeVec, IntGaugeVec, Opts, Registry as PrometheusRegistry, TextEncoder};

// ============================================================================
// SECTION 2: CONSTANTS & VERSION INFORMATION
// ============================================================================
// Global constants that define the defaults and limits of the engine.
// ============================================================================

/// Engine version - follows semantic versioning
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const ENGINE_NAME: &str = "statmetrics-engine";
pub const ENGINE_FULL_NAME: &str = "Statmetrics Engine";

// ----------------------------------------------------------------------------
// Timing & Intervals
// ----------------------------------------------------------------------------

/// Default collection interval for statement checks (seconds)
pub const DEFAULT_COLLECTION_INTERVAL_SECS: u64 = 10;

/// Minimum allowed collection interval (milliseconds)
pub const MIN_COLLECTION_INTERVAL_MS: u64 = 100;

/// Grace period for shutdown (seconds)
pub const SHUTDOWN_GRACE_PERIOD_SECS: u64 = 30;

/// Cycles slower than this are logged at warn level (milliseconds)
pub const SLOW_CYCLE_THRESHOLD_MS: u64 = 1_000;

// ----------------------------------------------------------------------------
// Row Limits
// ----------------------------------------------------------------------------

/// Default cap on rows fetched from the statistics view per cycle
pub const DEFAULT_FETCH_ROW_LIMIT: usize = 10_000;

/// Default cap on derivative rows emitted as metrics per cycle
pub const DEFAULT_MAX_EMITTED_ROWS: usize = 250;

/// Hard ceiling for any configured row limit
pub const MAX_ROW_LIMIT: usize = 1_000_000;

/// Default ranking column for row truncation
pub const DEFAULT_TIEBREAKER_COLUMN: &str = "total_elapsed_time";

// ----------------------------------------------------------------------------
// Statement Fingerprints
// ----------------------------------------------------------------------------

/// Column that receives the computed statement signature
pub const QUERY_SIGNATURE_COLUMN: &str = "query_signature";

/// Placeholder substituted for obfuscated literals
pub const OBFUSCATION_PLACEHOLDER: &str = "?";

/// Statements longer than this are truncated before fingerprinting (bytes)
pub const MAX_STATEMENT_LENGTH: usize = 4096;

// ----------------------------------------------------------------------------
// Tags & Metric Names
// ----------------------------------------------------------------------------

/// Maximum number of tags carried on a single submission
pub const MAX_TAGS_PER_METRIC: usize = 64;

/// Maximum metric name length
pub const MAX_METRIC_NAME_LENGTH: usize = 256;

/// Default metric prefix for statement metrics
pub const DEFAULT_METRIC_PREFIX: &str = "db.queries";

/// Service check submitted after every statement cycle
pub const SERVICE_CHECK_SUFFIX: &str = "can_connect";

/// Environment variable prefix for configuration overrides
pub const CONFIG_ENV_PREFIX: &str = "STATMETRICS_";

// ============================================================================
// SECTION 3: CORE TYPE SYSTEM
// ============================================================================
// Rows, identity keys and metric kinds shared by every subsystem.
// ============================================================================

// ----------------------------------------------------------------------------
// 3.1 Column Values
// ----------------------------------------------------------------------------

/// A single cell of a statistics view row.
///
/// Deserializes from any JSON scalar. Arrays and objects are kept verbatim in
/// [`ColumnValue::Json`] so that a row never fails to load because of one
/// exotic column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(untagged)]
pub enum ColumnValue {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(CompactString),
    Json(JsonValue),
}

impl ColumnValue {
    /// Numeric view of the value.
    ///
    /// Drivers frequently hand back `numeric`/`decimal` columns as text, so
    /// text that parses as a number is accepted too.
    pub fn as_numeric(&self) -> Option<Numeric> {
        match self {
            Self::Int(v) => Some(Numeric::Int(*v)),
            Self::Float(v) if v.is_finite() => Some(Numeric::Float(*v)),
            Self::Text(s) => {
                let s = s.trim();
                if let Ok(v) = s.parse::<i64>() {
                    Some(Numeric::Int(v))
                } else {
                    s.parse::<f64>().ok().filter(|v| v.is_finite()).map(Numeric::Float)
                }
            }
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Rendering used for identity keys and tag values. Null has none.
    pub fn to_tag_value(&self) -> Option<CompactString> {
        match self {
            Self::Null => None,
            Self::Bool(b) => Some(b.to_compact_string()),
            Self::Int(v) => Some(v.to_compact_string()),
            Self::Float(v) => Some(v.to_compact_string()),
            Self::Text(s) => Some(s.clone()),
            Self::Json(v) => Some(v.to_compact_string()),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Text(_) => "text",
            Self::Json(_) => "json",
        }
    }
}

impl Display for ColumnValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Bool(b) => write!(f, "{}", b),
            Self::Int(v) => write!(f, "{}", v),
            Self::Float(v) => write!(f, "{}", v),
            Self::Text(s) => write!(f, "{}", s),
            Self::Json(v) => write!(f, "{}", v),
        }
    }
}

impl From<i64> for ColumnValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for ColumnValue {
    fn from(v: i32) -> Self {
        Self::Int(v as i64)
    }
}

impl From<u64> for ColumnValue {
    fn from(v: u64) -> Self {
        i64::try_from(v).map(Self::Int).unwrap_or(Self::Float(v as f64))
    }
}

impl From<f64> for ColumnValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<bool> for ColumnValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<&str> for ColumnValue {
    fn from(v: &str) -> Self {
        Self::Text(CompactString::from(v))
    }
}

impl From<String> for ColumnValue {
    fn from(v: String) -> Self {
        Self::Text(CompactString::from(v))
    }
}

impl From<CompactString> for ColumnValue {
    fn from(v: CompactString) -> Self {
        Self::Text(v)
    }
}

impl From<Numeric> for ColumnValue {
    fn from(v: Numeric) -> Self {
        match v {
            Numeric::Int(i) => Self::Int(i),
            Numeric::Float(f) => Self::Float(f),
        }
    }
}

// ----------------------------------------------------------------------------
// 3.2 Numeric Counters
// ----------------------------------------------------------------------------

/// Numeric cell value. Integer arithmetic is kept integral; mixing in a float
/// operand promotes the result to float.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Numeric {
    Int(i64),
    Float(f64),
}

impl Numeric {
    pub fn as_f64(self) -> f64 {
        match self {
            Self::Int(v) => v as f64,
            Self::Float(v) => v,
        }
    }

    /// `self - previous`, `None` on integer overflow.
    pub fn checked_sub(self, previous: Numeric) -> Option<Numeric> {
        match (self, previous) {
            (Self::Int(a), Self::Int(b)) => a.checked_sub(b).map(Self::Int),
            (a, b) => Some(Self::Float(a.as_f64() - b.as_f64())),
        }
    }

    pub fn checked_add(self, other: Numeric) -> Option<Numeric> {
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => a.checked_add(b).map(Self::Int),
            (a, b) => Some(Self::Float(a.as_f64() + b.as_f64())),
        }
    }

    pub fn is_negative(self) -> bool {
        match self {
            Self::Int(v) => v < 0,
            Self::Float(v) => v < 0.0,
        }
    }

    pub fn is_zero(self) -> bool {
        match self {
            Self::Int(v) => v == 0,
            Self::Float(v) => v == 0.0,
        }
    }
}

impl Display for Numeric {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{}", v),
            Self::Float(v) => write!(f, "{}", v),
        }
    }
}

// ----------------------------------------------------------------------------
// 3.3 Rows
// ----------------------------------------------------------------------------

/// One row of a statistics view, column name to value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Row {
    columns: BTreeMap<CompactString, ColumnValue>,
}

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    pub fn with_column(mut self, name: impl Into<CompactString>, value: impl Into<ColumnValue>) -> Self {
        self.columns.insert(name.into(), value.into());
        self
    }

    pub fn insert(&mut self, name: impl Into<CompactString>, value: impl Into<ColumnValue>) -> Option<ColumnValue> {
        self.columns.insert(name.into(), value.into())
    }

    pub fn remove(&mut self, name: &str) -> Option<ColumnValue> {
        self.columns.remove(name)
    }

    pub fn get(&self, name: &str) -> Option<&ColumnValue> {
        self.columns.get(name)
    }

    pub fn numeric(&self, name: &str) -> Option<Numeric> {
        self.get(name).and_then(ColumnValue::as_numeric)
    }

    pub fn text(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(ColumnValue::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.columns.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> + '_ {
        self.columns.keys().map(CompactString::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ColumnValue)> + '_ {
        self.columns.iter().map(|(k, v)| (k.as_str(), v))
    }
}

impl<K: Into<CompactString>, V: Into<ColumnValue>> FromIterator<(K, V)> for Row {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            columns: iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }
}

/// Build a [`Row`] from `column => value` pairs.
#[macro_export]
macro_rules! row {
    () => {
        $crate::Row::new()
    };
    ($($name:expr => $value:expr),+ $(,)?) => {
        $crate::Row::new()$(.with_column($name, $value))+
    };
}

// ----------------------------------------------------------------------------
// 3.4 Column Sets
// ----------------------------------------------------------------------------

/// Ordered set of distinct column names.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ColumnSet(Vec<CompactString>);

impl ColumnSet {
    pub fn new<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<CompactString>,
    {
        let mut seen = AHashSet::new();
        let mut out = Vec::new();
        for column in columns {
            let column = column.into();
            if seen.insert(column.clone()) {
                out.push(column);
            }
        }
        Self(out)
    }

    pub fn contains(&self, column: &str) -> bool {
        self.0.iter().any(|c| *c == column)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> + '_ {
        self.0.iter().map(CompactString::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Split into (columns present in `available`, columns missing from it),
    /// both in the original order.
    pub fn partition_available(&self, available: &AHashSet<CompactString>) -> (ColumnSet, ColumnSet) {
        let (present, missing): (Vec<_>, Vec<_>) =
            self.0.iter().cloned().partition(|c| available.contains(c));
        (Self(present), Self(missing))
    }
}

impl<'a> FromIterator<&'a str> for ColumnSet {
    fn from_iter<I: IntoIterator<Item = &'a str>>(iter: I) -> Self {
        Self::new(iter)
    }
}

impl Display for ColumnSet {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let joined: Vec<&str> = self.iter().collect();
        write!(f, "{}", joined.join(", "))
    }
}

// ----------------------------------------------------------------------------
// 3.5 Row Identity Keys
// ----------------------------------------------------------------------------

/// Stable identity of a statistics row across snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RowKey(SmallVec<[CompactString; 4]>);

impl RowKey {
    pub fn new<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<CompactString>,
    {
        Self(parts.into_iter().map(Into::into).collect())
    }

    pub fn parts(&self) -> &[CompactString] {
        &self.0
    }

    /// 64-bit fingerprint, used where a compact identifier is enough.
    pub fn fingerprint(&self) -> u64 {
        let mut buf = Vec::with_capacity(64);
        for part in &self.0 {
            buf.extend_from_slice(part.as_bytes());
            buf.push(0x1f);
        }
        xxh3_64(&buf)
    }
}

impl Display for RowKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let parts: Vec<&str> = self.0.iter().map(CompactString::as_str).collect();
        write!(f, "{}", parts.join("|"))
    }
}

/// Which columns make up a [`RowKey`].
///
/// Required columns must be present and non-null; optional columns (for
/// example the database name on servers that do not expose it) contribute an
/// empty component when missing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowKeySpec {
    pub required: Vec<CompactString>,
    #[serde(default)]
    pub optional: Vec<CompactString>,
}

impl RowKeySpec {
    pub fn new<I, S>(required: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<CompactString>,
    {
        Self {
            required: required.into_iter().map(Into::into).collect(),
            optional: Vec::new(),
        }
    }

    pub fn with_optional<I, S>(mut self, optional: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<CompactString>,
    {
        self.optional = optional.into_iter().map(Into::into).collect();
        self
    }

    pub fn key_for(&self, row: &Row) -> Option<RowKey> {
        let mut parts: SmallVec<[CompactString; 4]> = SmallVec::new();
        for column in &self.required {
            parts.push(row.get(column)?.to_tag_value()?);
        }
        for column in &self.optional {
            parts.push(row.get(column).and_then(ColumnValue::to_tag_value).unwrap_or_default());
        }
        Some(RowKey(parts))
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> + '_ {
        self.required.iter().chain(self.optional.iter()).map(CompactString::as_str)
    }
}

// ----------------------------------------------------------------------------
// 3.6 Metric Kinds
// ----------------------------------------------------------------------------

/// Submission type of a metric
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    Gauge,
    Rate,
    MonotonicCount,
    Count,
}

impl MetricType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Gauge => "gauge",
            Self::Rate => "rate",
            Self::MonotonicCount => "monotonic_count",
            Self::Count => "count",
        }
    }
}

impl Display for MetricType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Service check status, numeric values match the agent protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ServiceCheckStatus {
    Ok = 0,
    Warning = 1,
    Critical = 2,
    Unknown = 3,
}

impl ServiceCheckStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Warning => "WARNING",
            Self::Critical => "CRITICAL",
            Self::Unknown => "UNKNOWN",
        }
    }

    pub fn code(&self) -> u8 {
        *self as u8
    }
}

impl Display for ServiceCheckStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Flat `key:value` / `value` tag list as submitted with a metric.
pub type Tags = SmallVec<[CompactString; 8]>;

// ============================================================================
// SECTION 4: ERROR HANDLING FRAMEWORK
// ============================================================================
// Hierarchical errors with recovery hints:
// - CheckError is the top level returned by checks and the engine
// - Each subsystem owns its own enum
// - Counter resets and missing columns are NOT errors, they are counted
// ============================================================================

// ----------------------------------------------------------------------------
// 4.1 Top-Level Error
// ----------------------------------------------------------------------------

#[derive(Error, Debug)]
pub enum CheckError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    #[error("Extraction error: {0}")]
    Extraction(#[from] ExtractionError),

    #[error("Output error: {0}")]
    Output(#[from] OutputError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl CheckError {
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Config(_) => false,
            Self::Source(e) => e.is_recoverable(),
            Self::Extraction(_) => true,
            Self::Output(e) => e.is_recoverable(),
            Self::Io(_) => true,
            Self::Internal(_) => false,
            Self::ShuttingDown => false,
        }
    }

    pub fn category(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::Source(_) => "source",
            Self::Extraction(_) => "extraction",
            Self::Output(_) => "output",
            Self::Io(_) => "io",
            Self::Internal(_) => "internal",
            Self::ShuttingDown => "shutdown",
        }
    }

    pub fn recovery_hint(&self) -> RecoveryHint {
        match self {
            Self::Config(_) => RecoveryHint::FixConfiguration,
            Self::Source(e) => e.recovery_hint(),
            Self::Extraction(_) => RecoveryHint::Skip,
            Self::Output(e) => e.recovery_hint(),
            Self::Io(_) => RecoveryHint::RetryWithBackoff,
            Self::Internal(_) => RecoveryHint::AlertOperator,
            Self::ShuttingDown => RecoveryHint::None,
        }
    }
}

/// Suggested recovery strategy for an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryHint {
    /// No recovery possible
    None,
    /// Retry on the next cycle with backoff
    RetryWithBackoff,
    /// Reconnect and re-resolve the available columns
    Reconnect,
    /// Fix configuration and restart
    FixConfiguration,
    /// Skip this item and continue
    Skip,
    /// Alert operator for manual intervention
    AlertOperator,
}

// ----------------------------------------------------------------------------
// 4.2 Configuration Errors
// ----------------------------------------------------------------------------

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Failed to parse configuration: {message}")]
    ParseError { message: String, source: Option<Box<dyn StdError + Send + Sync>> },

    #[error("Invalid configuration value for '{field}': {message}")]
    InvalidValue { field: String, message: String },

    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

impl From<ValidationErrors> for ConfigError {
    fn from(errors: ValidationErrors) -> Self {
        Self::ValidationFailed(errors.to_string())
    }
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::ParseError { message: err.to_string(), source: None }
    }
}

// ----------------------------------------------------------------------------
// 4.3 Source Errors
// ----------------------------------------------------------------------------

/// Failures fetching a snapshot. A failed fetch leaves the derivative state
/// untouched.
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Connection to '{name}' failed: {message}")]
    ConnectionFailed { name: String, message: String },

    #[error("Fetch from '{name}' timed out after {timeout_ms}ms")]
    Timeout { name: String, timeout_ms: u64 },

    #[error("Invalid response from '{name}': {message}")]
    InvalidResponse { name: String, message: String },

    #[error("Failed to read {path}: {message}")]
    Io { path: PathBuf, message: String },

    #[error("Source '{name}' has no more snapshots")]
    Exhausted { name: String },
}

impl SourceError {
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::Exhausted { .. })
    }

    pub fn recovery_hint(&self) -> RecoveryHint {
        match self {
            Self::ConnectionFailed { .. } => RecoveryHint::Reconnect,
            Self::Timeout { .. } | Self::Io { .. } => RecoveryHint::RetryWithBackoff,
            Self::InvalidResponse { .. } => RecoveryHint::Skip,
            Self::Exhausted { .. } => RecoveryHint::None,
        }
    }
}

// ----------------------------------------------------------------------------
// 4.4 Extraction Errors
// ----------------------------------------------------------------------------

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExtractionError {
    #[error("Key '{segment}' not found while resolving '{path}'")]
    KeyNotFound { path: String, segment: String },

    #[error("Cannot resolve '{segment}' in '{path}': parent is {found}, not a mapping")]
    NotAMapping { path: String, segment: String, found: &'static str },

    #[error("Value at '{path}' is {found}, expected an array")]
    NotAnArray { path: String, found: &'static str },

    #[error("Value at '{path}' is {found}, expected an object")]
    NotAnObject { path: String, found: &'static str },

    #[error("Value at '{path}' is {found}, expected a number")]
    NotNumeric { path: String, found: &'static str },

    #[error("Value at '{path}' is not an RFC 3339 timestamp: {value}")]
    InvalidTimestamp { path: String, value: String },
}

// ----------------------------------------------------------------------------
// 4.5 Output Errors
// ----------------------------------------------------------------------------

#[derive(Error, Debug)]
pub enum OutputError {
    #[error("Serialization failed: {0}")]
    Serialization(String),

    #[error("Write failed: {0}")]
    Write(String),

    #[error("Metric registry error: {0}")]
    Registry(String),

    #[error("Metric '{name}' cannot take value {value}")]
    InvalidValue { name: String, value: f64 },
}

impl OutputError {
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::Registry(_))
    }

    pub fn recovery_hint(&self) -> RecoveryHint {
        match self {
            Self::Serialization(_) => RecoveryHint::Skip,
            Self::Write(_) => RecoveryHint::RetryWithBackoff,
            Self::Registry(_) => RecoveryHint::FixConfiguration,
            Self::InvalidValue { .. } => RecoveryHint::Skip,
        }
    }
}

impl From<serde_json::Error> for OutputError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<io::Error> for OutputError {
    fn from(err: io::Error) -> Self {
        Self::Write(err.to_string())
    }
}

impl From<prometheus::Error> for OutputError {
    fn from(err: prometheus::Error) -> Self {
        Self::Registry(err.to_string())
    }
}

// ----------------------------------------------------------------------------
// 4.6 Result Type Aliases
// ----------------------------------------------------------------------------

pub type CheckResult<T> = std::result::Result<T, CheckError>;
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;
pub type SourceResult<T> = std::result::Result<T, SourceError>;
pub type ExtractionResult<T> = std::result::Result<T, ExtractionError>;
pub type OutputResult<T> = std::result::Result<T, OutputError>;

// ----------------------------------------------------------------------------
// 4.7 Error Statistics
// ----------------------------------------------------------------------------

/// Per-category error counters for self-monitoring
#[derive(Debug, Default)]
pub struct ErrorStats {
    by_category: DashMap<&'static str, AtomicU64>,
    total: AtomicU64,
    recoverable: AtomicU64,
    last_error: Mutex<Option<(DateTime<Utc>, String)>>,
}

impl ErrorStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, error: &CheckError) {
        self.total.fetch_add(1, AtomicOrdering::Relaxed);
        if error.is_recoverable() {
            self.recoverable.fetch_add(1, AtomicOrdering::Relaxed);
        }
        self.by_category
            .entry(error.category())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, AtomicOrdering::Relaxed);
        *self.last_error.lock() = Some((Utc::now(), error.to_string()));
    }

    pub fn total(&self) -> u64 {
        self.total.load(AtomicOrdering::Relaxed)
    }

    pub fn recoverable(&self) -> u64 {
        self.recoverable.load(AtomicOrdering::Relaxed)
    }

    pub fn count(&self, category: &str) -> u64 {
        self.by_category
            .get(category)
            .map(|c| c.load(AtomicOrdering::Relaxed))
            .unwrap_or(0)
    }

    pub fn last_error(&self) -> Option<(DateTime<Utc>, String)> {
        self.last_error.lock().clone()
    }

    pub fn snapshot(&self) -> BTreeMap<&'static str, u64> {
        self.by_category
            .iter()
            .map(|entry| (*entry.key(), entry.value().load(AtomicOrdering::Relaxed)))
            .collect()
    }
}

// ============================================================================
// SECTION 5: CONFIGURATION SYSTEM
// ============================================================================
// Hierarchical configuration with:
// - TOML file as the base layer
// - STATMETRICS_ prefixed environment overrides (`__` separates nesting)
// - Field validation through `validator`, cross-field checks in code
// - Live handle through ArcSwap for lock-free reads
// ============================================================================

// ----------------------------------------------------------------------------
// 5.1 Root Configuration
// ----------------------------------------------------------------------------

/// Root configuration structure for the engine
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct EngineConfig {
    #[serde(default)]
    #[validate]
    pub engine: GeneralConfig,

    /// Incremental statement metrics checks
    #[serde(default)]
    #[validate]
    pub checks: Vec<StatementCheckConfig>,

    /// Document metric checks
    #[serde(default)]
    #[validate]
    pub documents: Vec<DocumentCheckConfig>,

    #[serde(default)]
    pub output: OutputConfig,

    #[serde(default)]
    #[validate]
    pub logging: LoggingConfig,
}

impl EngineConfig {
    /// Load from a TOML file, then apply environment overrides.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound { path: path.to_path_buf() });
        }

        let config: EngineConfig = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed(CONFIG_ENV_PREFIX).split("__"))
            .extract()?;

        config.validate_all()?;
        Ok(config)
    }

    /// Parse from a TOML string. Environment overrides are not applied.
    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        let config: EngineConfig = Figment::new().merge(Toml::string(content)).extract()?;
        config.validate_all()?;
        Ok(config)
    }

    /// Field rules followed by the checks that span several fields.
    pub fn validate_all(&self) -> ConfigResult<()> {
        self.validate()?;

        let mut names = BTreeSet::new();
        for name in self.checks.iter().map(|c| &c.name).chain(self.documents.iter().map(|d| &d.name)) {
            if !names.insert(name.as_str()) {
                return Err(ConfigError::InvalidValue {
                    field: "checks.name".into(),
                    message: format!("duplicate check name '{}'", name),
                });
            }
        }

        for check in &self.checks {
            check.validate_columns()?;
        }
        for document in &self.documents {
            document.validate_queries()?;
        }
        Ok(())
    }

    pub fn to_toml(&self) -> ConfigResult<String> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
            source: Some(Box::new(e)),
        })
    }

    /// A complete configuration showing one check of each kind.
    pub fn example() -> Self {
        let statements = StatementCheckConfig {
            name: "pg_statements".into(),
            source: "snapshots/pg_stat_statements-*.json".into(),
            key_columns: vec!["queryid".into(), "datname".into(), "rolname".into()],
            counter_columns: vec![
                "calls".into(),
                "total_exec_time".into(),
                "rows".into(),
                "shared_blks_hit".into(),
                "shared_blks_read".into(),
            ],
            statement_column: Some("query".into()),
            tiebreaker_column: "total_exec_time".into(),
            query_template: Some(
                "SELECT queryid, datname, rolname, query, {columns} FROM pg_stat_statements \
                 JOIN pg_database ON dbid = pg_database.oid JOIN pg_roles ON userid = pg_roles.oid \
                 LIMIT {limit}"
                    .into(),
            ),
            tag_columns: [("datname".to_string(), "db".to_string()), ("rolname".to_string(), "user".to_string())]
                .into_iter()
                .collect(),
            tags: vec!["env:dev".into()],
            ..StatementCheckConfig::default()
        };

        let document = DocumentCheckConfig {
            name: "server_status".into(),
            source: "snapshots/server_status-*.json".into(),
            tags: vec!["service:docdb".into()],
            queries: vec![DocumentQuery {
                name: "status".into(),
                metrics: vec![
                    MetricSpec::new("connections.current", "connections.current", MetricType::Gauge),
                    MetricSpec::new("opcounters.query", "opcounters.query", MetricType::MonotonicCount),
                ],
                enumerations: vec![EnumerationSpec {
                    path: "replica_set.members".into(),
                    index_tag: "member".into(),
                    metrics: vec![MetricSpec::new("health", "replica_set.member.health", MetricType::Gauge)],
                }],
                groups: vec![GroupSpec {
                    path: "locks".into(),
                    key_tag: "lock_type".into(),
                    metrics: vec![MetricSpec::new("acquire_count", "locks.acquire_count", MetricType::Rate)],
                }],
                tags: Vec::new(),
            }],
        };

        Self {
            checks: vec![statements],
            documents: vec![document],
            ..Self::default()
        }
    }
}

/// Write an example configuration to `output`.
pub fn generate_default_config(output: &Path) -> ConfigResult<()> {
    let content = EngineConfig::example().to_toml()?;
    fs::write(output, content).map_err(|e| ConfigError::InvalidValue {
        field: "output".into(),
        message: format!("cannot write {}: {}", output.display(), e),
    })
}

// ----------------------------------------------------------------------------
// 5.2 General Engine Settings
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct GeneralConfig {
    #[serde(default = "default_instance_name")]
    #[validate(length(min = 1, max = 128))]
    pub instance_name: String,

    /// Reported as the `host` tag when set
    #[serde(default)]
    pub hostname: Option<String>,

    #[serde(default = "default_collection_interval", with = "humantime_serde")]
    #[validate(custom = "validate_collection_interval")]
    pub collection_interval: Duration,

    #[serde(default = "default_shutdown_timeout", with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            instance_name: default_instance_name(),
            hostname: None,
            collection_interval: default_collection_interval(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

fn default_instance_name() -> String {
    ENGINE_NAME.into()
}

fn default_collection_interval() -> Duration {
    Duration::from_secs(DEFAULT_COLLECTION_INTERVAL_SECS)
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(SHUTDOWN_GRACE_PERIOD_SECS)
}

fn validate_collection_interval(interval: &Duration) -> std::result::Result<(), ValidationError> {
    if interval.as_millis() < MIN_COLLECTION_INTERVAL_MS as u128 {
        return Err(ValidationError::new("collection_interval_too_short"));
    }
    Ok(())
}

fn default_true() -> bool {
    true
}

// ----------------------------------------------------------------------------
// 5.3 Statement Check Settings
// ----------------------------------------------------------------------------

/// One incremental statement metrics check
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct StatementCheckConfig {
    #[validate(length(min = 1, max = 128))]
    pub name: String,

    /// Glob matching the JSON snapshot files replayed one per cycle
    #[validate(length(min = 1))]
    pub source: String,

    /// Columns forming the row identity key
    #[validate(length(min = 1))]
    pub key_columns: Vec<String>,

    /// Key columns that contribute an empty component when absent
    #[serde(default)]
    pub optional_key_columns: Vec<String>,

    /// Monotonic counters turned into deltas
    #[validate(length(min = 1))]
    pub counter_columns: Vec<String>,

    /// Rows whose deltas over these columns are all zero are suppressed
    #[serde(default)]
    pub execution_indicators: Vec<String>,

    #[serde(default)]
    pub skip_unchanged: bool,

    /// Column carrying statement text to fingerprint
    #[serde(default)]
    pub statement_column: Option<String>,

    #[serde(default = "default_true")]
    pub obfuscate_statements: bool,

    #[serde(default = "default_tiebreaker_column")]
    pub tiebreaker_column: String,

    #[serde(default = "default_true")]
    pub sort_descending: bool,

    #[serde(default = "default_max_emitted_rows")]
    #[validate(range(min = 1, max = 1_000_000))]
    pub max_emitted_rows: usize,

    /// Additional named limits; the smallest `max_rows` wins
    #[serde(default)]
    pub limits: BTreeMap<String, RowLimit>,

    #[serde(default = "default_fetch_row_limit")]
    #[validate(range(min = 1, max = 1_000_000))]
    pub fetch_row_limit: usize,

    /// Source query with `{columns}`, `{column_sums}` and `{limit}` placeholders
    #[serde(default)]
    pub query_template: Option<String>,

    #[serde(default = "default_metric_prefix")]
    #[validate(length(min = 1, max = 128))]
    pub metric_prefix: String,

    /// Metric type per counter column (default: count)
    #[serde(default)]
    pub metric_types: BTreeMap<String, MetricType>,

    /// Row column to tag key, e.g. `datname = "db"`
    #[serde(default)]
    pub tag_columns: BTreeMap<String, String>,

    /// Instance tags, `key:value` or bare values
    #[serde(default)]
    pub tags: Vec<String>,

    #[serde(default)]
    pub normalize_tags: bool,
}

impl Default for StatementCheckConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            source: String::new(),
            key_columns: Vec::new(),
            optional_key_columns: Vec::new(),
            counter_columns: Vec::new(),
            execution_indicators: Vec::new(),
            skip_unchanged: false,
            statement_column: None,
            obfuscate_statements: true,
            tiebreaker_column: default_tiebreaker_column(),
            sort_descending: true,
            max_emitted_rows: default_max_emitted_rows(),
            limits: BTreeMap::new(),
            fetch_row_limit: default_fetch_row_limit(),
            query_template: None,
            metric_prefix: default_metric_prefix(),
            metric_types: BTreeMap::new(),
            tag_columns: BTreeMap::new(),
            tags: Vec::new(),
            normalize_tags: false,
        }
    }
}

impl StatementCheckConfig {
    pub fn key_spec(&self) -> RowKeySpec {
        RowKeySpec::new(self.key_columns.iter().map(String::as_str))
            .with_optional(self.optional_key_columns.iter().map(String::as_str))
    }

    pub fn counter_set(&self) -> ColumnSet {
        self.counter_columns.iter().map(String::as_str).collect()
    }

    /// Configured limits plus the default cap under the tiebreaker's name.
    pub fn row_limits(&self) -> RowLimits {
        let mut limits: RowLimits = self
            .limits
            .iter()
            .map(|(name, limit)| (CompactString::from(name.as_str()), *limit))
            .collect();
        limits
            .entry(CompactString::from(self.tiebreaker_column.as_str()))
            .or_insert(RowLimit::new(self.max_emitted_rows));
        limits
    }

    pub fn derivative_options(&self) -> DerivativeOptions {
        DerivativeOptions {
            execution_indicators: self.execution_indicators.iter().map(String::as_str).collect(),
            skip_unchanged: self.skip_unchanged,
        }
    }

    fn validate_columns(&self) -> ConfigResult<()> {
        let field = |name: &str| format!("checks.{}.{}", self.name, name);

        if let Some(overlap) = self.counter_columns.iter().find(|c| self.key_columns.contains(c)) {
            return Err(ConfigError::InvalidValue {
                field: field("counter_columns"),
                message: format!("'{}' is also a key column", overlap),
            });
        }
        if !self.counter_columns.contains(&self.tiebreaker_column) {
            return Err(ConfigError::InvalidValue {
                field: field("tiebreaker_column"),
                message: format!("'{}' is not a counter column", self.tiebreaker_column),
            });
        }
        if let Some(stray) = self.execution_indicators.iter().find(|c| !self.counter_columns.contains(c)) {
            return Err(ConfigError::InvalidValue {
                field: field("execution_indicators"),
                message: format!("'{}' is not a counter column", stray),
            });
        }
        if let Some(stray) = self.metric_types.keys().find(|c| !self.counter_columns.contains(c)) {
            return Err(ConfigError::InvalidValue {
                field: field("metric_types"),
                message: format!("'{}' is not a counter column", stray),
            });
        }
        if let Some((name, _)) = self.limits.iter().find(|(_, l)| l.max_rows == 0 || l.max_rows > MAX_ROW_LIMIT) {
            return Err(ConfigError::InvalidValue {
                field: field("limits"),
                message: format!("limit '{}' must allow between 1 and {} rows", name, MAX_ROW_LIMIT),
            });
        }
        if let Some(template) = &self.query_template {
            QueryTemplate::parse(template).map_err(|message| ConfigError::InvalidValue {
                field: field("query_template"),
                message,
            })?;
        }
        Ok(())
    }
}

fn default_tiebreaker_column() -> String {
    DEFAULT_TIEBREAKER_COLUMN.into()
}

fn default_max_emitted_rows() -> usize {
    DEFAULT_MAX_EMITTED_ROWS
}

fn default_fetch_row_limit() -> usize {
    DEFAULT_FETCH_ROW_LIMIT
}

fn default_metric_prefix() -> String {
    DEFAULT_METRIC_PREFIX.into()
}

// ----------------------------------------------------------------------------
// 5.4 Document Check Settings
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct DocumentCheckConfig {
    #[validate(length(min = 1, max = 128))]
    pub name: String,

    /// Glob matching JSON documents replayed one per cycle
    #[validate(length(min = 1))]
    pub source: String,

    #[serde(default)]
    pub tags: Vec<String>,

    #[serde(default)]
    pub queries: Vec<DocumentQuery>,
}

impl DocumentCheckConfig {
    fn validate_queries(&self) -> ConfigResult<()> {
        if self.queries.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: format!("documents.{}.queries", self.name),
                message: "at least one query is required".into(),
            });
        }
        if let Some(query) = self.queries.iter().find(|q| q.is_empty()) {
            return Err(ConfigError::InvalidValue {
                field: format!("documents.{}.queries.{}", self.name, query.name),
                message: "query declares no metrics".into(),
            });
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// 5.5 Output Settings
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    /// One JSON object per submission
    #[default]
    JsonLines,
    /// Prometheus text exposition, rewritten after every cycle
    Prometheus,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutputConfig {
    #[serde(default)]
    pub format: OutputFormat,

    /// Output file; stdout when unset
    #[serde(default)]
    pub path: Option<PathBuf>,
}

// ----------------------------------------------------------------------------
// 5.6 Logging Settings
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Compact,
    #[default]
    Pretty,
}

impl Display for LogFormat {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Json => write!(f, "json"),
            Self::Compact => write!(f, "compact"),
            Self::Pretty => write!(f, "pretty"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    #[validate(custom = "validate_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,

    /// Log to this file instead of stderr
    #[serde(default)]
    pub file: Option<PathBuf>,

    #[serde(default = "default_true")]
    pub colors: bool,

    #[serde(default)]
    pub source_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
            file: None,
            colors: true,
            source_location: false,
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

fn validate_log_level(level: &str) -> std::result::Result<(), ValidationError> {
    match level.to_lowercase().as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ValidationError::new("unknown_log_level")),
    }
}

// ----------------------------------------------------------------------------
// 5.7 Live Configuration Handle
// ----------------------------------------------------------------------------

/// Lock-free access to the current configuration, reloadable from disk
#[derive(Debug)]
pub struct ConfigManager {
    current: ArcSwap<EngineConfig>,
    path: Option<PathBuf>,
}

impl ConfigManager {
    pub fn new(config: EngineConfig) -> Self {
        Self { current: ArcSwap::from_pointee(config), path: None }
    }

    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let config = EngineConfig::load(path)?;
        Ok(Self { current: ArcSwap::from_pointee(config), path: Some(path.to_path_buf()) })
    }

    pub fn get(&self) -> Arc<EngineConfig> {
        self.current.load_full()
    }

    pub fn update(&self, config: EngineConfig) -> ConfigResult<()> {
        config.validate_all()?;
        self.current.store(Arc::new(config));
        Ok(())
    }

    /// Re-read the backing file. The current configuration stays in place
    /// when the new one fails to load.
    pub fn reload(&self) -> ConfigResult<bool> {
        let Some(path) = &self.path else {
            return Ok(false);
        };
        let config = EngineConfig::load(path)?;
        self.current.store(Arc::new(config));
        info!(target: "statmetrics::config", path = %path.display(), "Configuration reloaded");
        Ok(true)
    }
}

// ============================================================================
// SECTION 6: LOGGING & TRACING INFRASTRUCTURE
// ============================================================================
// Structured logging with tracing:
// - Per-subsystem targets (statmetrics::check, statmetrics::derivative, ...)
// - JSON output for log shippers, compact/pretty for terminals
// - Optional file output through a non-blocking appender
// ============================================================================

// ----------------------------------------------------------------------------
// 6.1 Subscriber Initialization
// ----------------------------------------------------------------------------

/// Keeps the non-blocking file writer flushing. Drop it last.
pub type LogGuard = Option<tracing_appender::non_blocking::WorkerGuard>;

fn parse_level(level: &str) -> Level {
    match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Initialize the global tracing subscriber from the `[logging]` section.
pub fn init_logging(config: &LoggingConfig) -> CheckResult<LogGuard> {
    let level_filter = tracing::level_filters::LevelFilter::from_level(parse_level(&config.level));
    let env_filter = EnvFilter::builder()
        .with_default_directive(level_filter.into())
        .from_env_lossy();

    let (writer, guard) = match &config.file {
        Some(path) => {
            let directory = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let file_name = path
                .file_name()
                .ok_or_else(|| CheckError::Internal(format!("invalid log file path: {}", path.display())))?;
            let appender = tracing_appender::rolling::never(directory, file_name);
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            (tracing_fmt::writer::BoxMakeWriter::new(non_blocking), Some(guard))
        }
        None => (tracing_fmt::writer::BoxMakeWriter::new(io::stderr), None),
    };
    let ansi = config.colors && guard.is_none();

    let layer = match config.format {
        LogFormat::Json => tracing_fmt::layer()
            .json()
            .with_writer(writer)
            .with_timer(tracing_fmt::time::UtcTime::rfc_3339())
            .with_target(true)
            .with_file(config.source_location)
            .with_line_number(config.source_location)
            .with_thread_names(true)
            .boxed(),
        LogFormat::Compact => tracing_fmt::layer()
            .compact()
            .with_writer(writer)
            .with_ansi(ansi)
            .with_target(true)
            .boxed(),
        LogFormat::Pretty => tracing_fmt::layer()
            .pretty()
            .with_writer(writer)
            .with_ansi(ansi)
            .with_target(true)
            .with_file(config.source_location)
            .with_line_number(config.source_location)
            .with_thread_names(true)
            .boxed(),
    };

    let subscriber = tracing_subscriber::registry().with(layer).with(env_filter);
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| CheckError::Internal(format!("Failed to set logger: {}", e)))?;

    info!(
        target: "statmetrics::init",
        level = %config.level,
        format = %config.format,
        file = ?config.file,
        "Logging initialized"
    );

    Ok(guard)
}

// ----------------------------------------------------------------------------
// 6.2 Structured Logging Macros
// ----------------------------------------------------------------------------

/// Log a metric submission
#[macro_export]
macro_rules! log_submission {
    ($kind:expr, $name:expr, $value:expr) => {
        tracing::trace!(
            target: "statmetrics::submit",
            kind = %$kind,
            metric_name = %$name,
            metric_value = $value,
            "Metric submitted"
        )
    };
}

/// Log the outcome of one check cycle
#[macro_export]
macro_rules! log_cycle {
    ($check:expr, $report:expr) => {
        tracing::debug!(
            target: "statmetrics::check",
            check = %$check,
            rows_fetched = $report.rows_fetched,
            rows_emitted = $report.rows_emitted,
            metrics_submitted = $report.metrics_submitted,
            elapsed_ms = $report.elapsed_ms,
            "Check cycle complete"
        )
    };
}

// ----------------------------------------------------------------------------
// 6.3 Performance Timer
// ----------------------------------------------------------------------------

/// Measures an operation and warns when it exceeds a threshold
#[derive(Debug)]
pub struct PerfTimer {
    name: &'static str,
    start: Instant,
    threshold_ms: Option<u64>,
}

impl PerfTimer {
    pub fn new(name: &'static str) -> Self {
        Self { name, start: Instant::now(), threshold_ms: None }
    }

    pub fn with_threshold(name: &'static str, threshold_ms: u64) -> Self {
        Self { name, start: Instant::now(), threshold_ms: Some(threshold_ms) }
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    /// Stop the timer and log if above threshold
    pub fn stop(self) -> u64 {
        let elapsed = self.elapsed_ms();

        if let Some(threshold) = self.threshold_ms {
            if elapsed > threshold {
                warn!(
                    target: "statmetrics::perf",
                    operation = self.name,
                    elapsed_ms = elapsed,
                    threshold_ms = threshold,
                    "Operation exceeded threshold"
                );
            }
        }

        elapsed
    }
}

// ============================================================================
// SECTION 7: TAG MANAGER
// ============================================================================
// Keyed (`key:value`) and keyless (`value`) tags for one check instance.
// The flat list handed to submitters is built lazily and cached until the
// next mutation.
// ============================================================================

// ----------------------------------------------------------------------------
// 7.1 Tag Keys
// ----------------------------------------------------------------------------

/// Key of a tag bucket. `Keyless` sorts after every named key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TagKey {
    Named(CompactString),
    Keyless,
}

impl TagKey {
    pub fn from_option(key: Option<&str>) -> Self {
        match key {
            Some(k) => Self::Named(CompactString::from(k)),
            None => Self::Keyless,
        }
    }

    fn render(&self, value: &str) -> CompactString {
        match self {
            Self::Named(key) => {
                let mut tag = CompactString::with_capacity(key.len() + value.len() + 1);
                tag.push_str(key);
                tag.push(':');
                tag.push_str(value);
                tag
            }
            Self::Keyless => CompactString::from(value),
        }
    }
}

/// Split a `key:value` list entry. Anything else, including entries with an
/// empty key or value, is a keyless tag carrying the whole string.
pub fn parse_tag(entry: &str) -> (TagKey, CompactString) {
    match entry.split_once(':') {
        Some((key, value)) if !key.is_empty() && !value.is_empty() => {
            (TagKey::Named(CompactString::from(key)), CompactString::from(value))
        }
        _ => (TagKey::Keyless, CompactString::from(entry)),
    }
}

// ----------------------------------------------------------------------------
// 7.2 Tag Normalization
// ----------------------------------------------------------------------------

pub type TagNormalizer = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// Default agent tag normalization: separator characters become `_`, runs of
/// `_` collapse, underscores around dots are dropped, the result is trimmed of
/// `_` and lowercased.
pub fn normalize_tag(tag: &str) -> String {
    let mut replaced = String::with_capacity(tag.len());
    for c in tag.chars() {
        let separator = c.is_whitespace() || matches!(c, ',' | '+' | '*' | '-' | '/' | '(' | ')' | '[' | ']' | '{' | '}');
        replaced.push(if separator { '_' } else { c });
    }

    let mut collapsed = String::with_capacity(replaced.len());
    for c in replaced.chars() {
        match c {
            '_' if collapsed.ends_with('_') || collapsed.ends_with('.') => {}
            '.' => {
                while collapsed.ends_with('_') {
                    collapsed.pop();
                }
                collapsed.push('.');
            }
            _ => collapsed.push(c),
        }
    }

    collapsed.trim_matches('_').to_lowercase()
}

pub fn default_tag_normalizer() -> TagNormalizer {
    Arc::new(normalize_tag)
}

// ----------------------------------------------------------------------------
// 7.3 Tag Manager
// ----------------------------------------------------------------------------

/// Tag map of one check instance.
///
/// Values under a key keep insertion order and are distinct. The flat list
/// renders named keys in ascending order followed by keyless values, so equal
/// mappings always produce equal lists.
pub struct TagManager {
    tags: BTreeMap<TagKey, SmallVec<[CompactString; 2]>>,
    cached: OnceCell<Tags>,
    normalizer: Option<TagNormalizer>,
}

impl Debug for TagManager {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("TagManager")
            .field("tags", &self.tags)
            .field("cache_valid", &self.is_cache_valid())
            .field("normalizer", &self.normalizer.is_some())
            .finish()
    }
}

impl Default for TagManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for TagManager {
    fn clone(&self) -> Self {
        Self {
            tags: self.tags.clone(),
            cached: OnceCell::new(),
            normalizer: self.normalizer.clone(),
        }
    }
}

impl TagManager {
    pub fn new() -> Self {
        Self { tags: BTreeMap::new(), cached: OnceCell::new(), normalizer: None }
    }

    pub fn with_normalizer(normalizer: TagNormalizer) -> Self {
        Self { normalizer: Some(normalizer), ..Self::new() }
    }

    /// Manager seeded from a `key:value` / `value` list.
    pub fn from_tag_list<I, S>(tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut manager = Self::new();
        manager.set_tags_from_list(tags, false);
        manager
    }

    // ------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------

    /// Add `value` under `key` (`None` for keyless). With `replace`, existing
    /// values under that key are dropped first.
    pub fn set_tag(&mut self, key: Option<&str>, value: &str, replace: bool) {
        self.insert(TagKey::from_option(key), CompactString::from(value), replace);
    }

    /// [`set_tag`](Self::set_tag) with the value passed through the normalizer.
    pub fn set_tag_normalized(&mut self, key: Option<&str>, value: &str, replace: bool) {
        let value = self.normalize(value);
        self.insert(TagKey::from_option(key), value, replace);
    }

    /// Remove one value, or the whole key when `value` is `None`.
    /// Returns whether anything was removed; the cache survives a miss.
    pub fn delete_tag(&mut self, key: Option<&str>, value: Option<&str>) -> bool {
        let key = TagKey::from_option(key);
        let removed = match value {
            None => self.tags.remove(&key).is_some(),
            Some(value) => match self.tags.get_mut(&key) {
                Some(values) => {
                    let before = values.len();
                    values.retain(|v| *v != value);
                    let removed = values.len() != before;
                    if values.is_empty() {
                        self.tags.remove(&key);
                    }
                    removed
                }
                None => false,
            },
        };
        if removed {
            self.invalidate();
        }
        removed
    }

    /// [`delete_tag`](Self::delete_tag) matching the normalized value.
    pub fn delete_tag_normalized(&mut self, key: Option<&str>, value: Option<&str>) -> bool {
        let value = value.map(|v| self.normalize(v));
        self.delete_tag(key, value.as_deref())
    }

    /// Parse and add each entry. With `replace`, every key present in `tags`
    /// is cleared before the new values go in; other keys are kept.
    pub fn set_tags_from_list<I, S>(&mut self, tags: I, replace: bool)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let parsed: Vec<_> = tags.into_iter().map(|t| parse_tag(t.as_ref())).collect();
        self.apply_list(parsed, replace);
    }

    /// [`set_tags_from_list`](Self::set_tags_from_list) with each whole entry
    /// normalized before parsing.
    pub fn set_tags_from_list_normalized<I, S>(&mut self, tags: I, replace: bool)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let parsed: Vec<_> = tags
            .into_iter()
            .map(|t| parse_tag(self.normalize(t.as_ref()).as_str()))
            .collect();
        self.apply_list(parsed, replace);
    }

    pub fn clear(&mut self) {
        self.tags.clear();
        self.invalidate();
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Flat tag list. The caller owns the returned copy.
    pub fn get_tags(&self) -> Tags {
        self.cached.get_or_init(|| self.render()).clone()
    }

    pub fn is_cache_valid(&self) -> bool {
        self.cached.get().is_some()
    }

    pub fn values(&self, key: Option<&str>) -> &[CompactString] {
        self.tags
            .get(&TagKey::from_option(key))
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    /// Number of rendered tags
    pub fn len(&self) -> usize {
        self.tags.values().map(|v| v.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn insert(&mut self, key: TagKey, value: CompactString, replace: bool) {
        let values = self.tags.entry(key).or_default();
        if replace {
            values.clear();
        }
        if !values.contains(&value) {
            values.push(value);
        }
        self.invalidate();
    }

    fn apply_list(&mut self, parsed: Vec<(TagKey, CompactString)>, replace: bool) {
        if replace {
            for (key, _) in &parsed {
                self.tags.remove(key);
            }
        }
        for (key, value) in parsed {
            let values = self.tags.entry(key).or_default();
            if !values.contains(&value) {
                values.push(value);
            }
        }
        self.invalidate();
    }

    fn normalize(&self, value: &str) -> CompactString {
        match &self.normalizer {
            Some(normalizer) => CompactString::from(normalizer(value)),
            None => CompactString::from(value),
        }
    }

    fn render(&self) -> Tags {
        let mut out = Tags::new();
        for (key, values) in &self.tags {
            out.extend(values.iter().map(|v| key.render(v)));
        }
        out
    }

    fn invalidate(&mut self) {
        self.cached.take();
    }
}

// ============================================================================
// SECTION 8: ROW NORMALIZER
// ============================================================================
// Prepares raw statistics rows for differencing:
// - resolves which counter columns the source actually exposes
// - obfuscates statement text and derives a stable query signature
// ============================================================================

// ----------------------------------------------------------------------------
// 8.1 Column Resolution
// ----------------------------------------------------------------------------

/// Outcome of intersecting the desired counters with a source's columns
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedColumns {
    pub available: ColumnSet,
    pub missing: ColumnSet,
}

/// Caches the desired ∩ available counter columns for one connection.
#[derive(Debug, Clone)]
pub struct ColumnResolver {
    desired: ColumnSet,
    resolved: Option<ResolvedColumns>,
}

impl ColumnResolver {
    pub fn new(desired: ColumnSet) -> Self {
        Self { desired, resolved: None }
    }

    pub fn desired(&self) -> &ColumnSet {
        &self.desired
    }

    pub fn cached(&self) -> Option<&ResolvedColumns> {
        self.resolved.as_ref()
    }

    /// Intersect with `available` unless a cached result exists.
    pub fn resolve(&mut self, available: &AHashSet<CompactString>) -> &ResolvedColumns {
        let desired = &self.desired;
        self.resolved.get_or_insert_with(|| {
            let (available, missing) = desired.partition_available(available);
            if !missing.is_empty() {
                warn!(
                    target: "statmetrics::normalize",
                    missing = %missing,
                    "Counter columns not exposed by source, skipping them"
                );
            }
            ResolvedColumns { available, missing }
        })
    }

    /// Forget the cached intersection, e.g. after a reconnect.
    pub fn invalidate(&mut self) {
        self.resolved = None;
    }
}

// ----------------------------------------------------------------------------
// 8.2 Statement Obfuscation
// ----------------------------------------------------------------------------

/// Replaces SQL literals with `?` so that statements differing only in their
/// parameters share one signature.
#[derive(Debug, Clone)]
pub struct SqlObfuscator {
    string_literal: Regex,
    numeric_literal: Regex,
    in_list: Regex,
    whitespace: Regex,
}

impl SqlObfuscator {
    pub fn new() -> CheckResult<Self> {
        let compile = |pattern: &str| {
            Regex::new(pattern).map_err(|e| CheckError::Internal(format!("invalid obfuscation pattern: {}", e)))
        };
        Ok(Self {
            string_literal: compile(r"'(?:[^']|'')*'")?,
            numeric_literal: compile(r"\b\d+(?:\.\d+)?(?:[eE][+-]?\d+)?\b")?,
            in_list: compile(r"(?i)\bIN\s*\(\s*\?(?:\s*,\s*\?)*\s*\)")?,
            whitespace: compile(r"\s+")?,
        })
    }

    pub fn obfuscate(&self, statement: &str) -> String {
        let statement = truncate_statement(statement);
        let text = self.string_literal.replace_all(statement, OBFUSCATION_PLACEHOLDER);
        let text = self.numeric_literal.replace_all(&text, OBFUSCATION_PLACEHOLDER);
        let text = self.in_list.replace_all(&text, "IN (?)");
        self.whitespace.replace_all(text.trim(), " ").into_owned()
    }
}

fn truncate_statement(statement: &str) -> &str {
    if statement.len() <= MAX_STATEMENT_LENGTH {
        return statement;
    }
    let mut end = MAX_STATEMENT_LENGTH;
    while !statement.is_char_boundary(end) {
        end -= 1;
    }
    &statement[..end]
}

/// Hex xxh3 of the statement text
pub fn compute_query_signature(statement: &str) -> CompactString {
    format!("{:016x}", xxh3_64(statement.as_bytes())).into()
}

// ----------------------------------------------------------------------------
// 8.3 Row Normalizer
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct NormalizeStats {
    pub rows_in: usize,
    pub rows_out: usize,
    pub unreadable_statements: usize,
}

/// Writes `query_signature` (and obfuscated text) into each row.
///
/// Without a statement column rows pass through untouched.
#[derive(Debug, Clone)]
pub struct RowNormalizer {
    statement_column: Option<CompactString>,
    obfuscator: Option<SqlObfuscator>,
}

impl RowNormalizer {
    pub fn new(statement_column: Option<&str>, obfuscate: bool) -> CheckResult<Self> {
        Ok(Self {
            statement_column: statement_column.map(CompactString::from),
            obfuscator: if obfuscate { Some(SqlObfuscator::new()?) } else { None },
        })
    }

    pub fn passthrough() -> Self {
        Self { statement_column: None, obfuscator: None }
    }

    pub fn normalize(&self, rows: Vec<Row>) -> (Vec<Row>, NormalizeStats) {
        let mut stats = NormalizeStats { rows_in: rows.len(), ..NormalizeStats::default() };
        let mut out = Vec::with_capacity(rows.len());

        for row in rows {
            match self.normalize_row(row) {
                Some(row) => out.push(row),
                None => stats.unreadable_statements += 1,
            }
        }

        if stats.unreadable_statements > 0 {
            debug!(
                target: "statmetrics::normalize",
                skipped = stats.unreadable_statements,
                "Skipped rows without readable statement text"
            );
        }
        stats.rows_out = out.len();
        (out, stats)
    }

    /// `None` when the statement text is missing or not text.
    pub fn normalize_row(&self, mut row: Row) -> Option<Row> {
        let Some(column) = &self.statement_column else {
            return Some(row);
        };
        let text = row.text(column)?;

        let statement = match &self.obfuscator {
            Some(obfuscator) => obfuscator.obfuscate(text),
            None => text.to_string(),
        };
        let signature = compute_query_signature(&statement);

        row.insert(column.clone(), statement);
        row.insert(QUERY_SIGNATURE_COLUMN, signature);
        Some(row)
    }
}

// ============================================================================
// SECTION 9: DERIVATIVE STATE STORE
// ============================================================================
// Turns consecutive snapshots of monotonic counters into per-interval deltas.
//
// Per key:
//   first seen            -> baseline stored, nothing emitted
//   any delta negative    -> counter reset, re-baselined, nothing emitted
//   otherwise             -> row emitted with counters replaced by deltas
//
// The baseline map is replaced wholesale by every call, so keys absent from
// the latest snapshot are forgotten.
// ============================================================================

// ----------------------------------------------------------------------------
// 9.1 Options & Statistics
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DerivativeOptions {
    /// Suppress rows whose deltas over these columns are all zero
    pub execution_indicators: ColumnSet,
    /// Suppress rows whose counter deltas are all zero
    pub skip_unchanged: bool,
}

/// What happened to the rows of one `compute_derivative_rows` call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DerivativeStats {
    pub rows_in: usize,
    pub merged_duplicates: usize,
    pub merge_overflows: usize,
    pub unkeyed: usize,
    pub first_seen: usize,
    pub resets: usize,
    pub unchanged: usize,
    pub missing_columns: usize,
    pub no_counters: usize,
    pub emitted: usize,
}

// ----------------------------------------------------------------------------
// 9.2 Row Differencing
// ----------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Baseline {
    row: Row,
    observed_at: Instant,
}

enum RowDelta {
    Reset { column: CompactString },
    Derived { row: Row, deltas: SmallVec<[(CompactString, Numeric); 8]>, missing: usize },
}

fn diff_row(current: &Row, previous: &Row, counters: &ColumnSet) -> RowDelta {
    let mut derived = current.clone();
    let mut deltas = SmallVec::new();
    let mut missing = 0;

    for column in counters.iter() {
        let (Some(now), Some(before)) = (current.numeric(column), previous.numeric(column)) else {
            derived.remove(column);
            missing += 1;
            continue;
        };
        match now.checked_sub(before) {
            Some(delta) if !delta.is_negative() => {
                derived.insert(column, delta);
                deltas.push((CompactString::from(column), delta));
            }
            _ => return RowDelta::Reset { column: CompactString::from(column) },
        }
    }

    RowDelta::Derived { row: derived, deltas, missing }
}

/// Sum counters of a duplicate row into `into`. Descriptive columns of the
/// first row win. Returns the columns whose sum overflowed; those keep the
/// value already in `into`.
fn merge_counters(into: &mut Row, duplicate: &Row, counters: &ColumnSet) -> SmallVec<[CompactString; 2]> {
    let mut overflowed = SmallVec::new();
    for column in counters.iter() {
        let summed = match (into.numeric(column), duplicate.numeric(column)) {
            (Some(a), Some(b)) => match a.checked_add(b) {
                Some(sum) => Some(sum),
                None => {
                    overflowed.push(CompactString::from(column));
                    None
                }
            },
            (None, Some(b)) => Some(b),
            _ => None,
        };
        if let Some(value) = summed {
            into.insert(column, value);
        }
    }
    overflowed
}

// ----------------------------------------------------------------------------
// 9.3 Statement Metrics Store
// ----------------------------------------------------------------------------

/// Previous-snapshot state of one check instance.
#[derive(Debug, Clone, Default)]
pub struct StatementMetrics {
    previous: AHashMap<RowKey, Baseline>,
    options: DerivativeOptions,
    last_stats: DerivativeStats,
}

impl StatementMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: DerivativeOptions) -> Self {
        Self { options, ..Self::default() }
    }

    /// Difference `rows` against the previous snapshot.
    ///
    /// Rows for which `key_fn` returns `None` are skipped. Rows sharing a key
    /// are merged by summing their counters before differencing.
    pub fn compute_derivative_rows<F>(&mut self, rows: Vec<Row>, counter_columns: &ColumnSet, key_fn: F) -> Vec<Row>
    where
        F: Fn(&Row) -> Option<RowKey>,
    {
        let now = Instant::now();
        let mut stats = DerivativeStats { rows_in: rows.len(), ..DerivativeStats::default() };

        let mut positions: AHashMap<RowKey, usize> = AHashMap::with_capacity(rows.len());
        let mut snapshot: Vec<(RowKey, Row)> = Vec::with_capacity(rows.len());
        for row in rows {
            let Some(key) = key_fn(&row) else {
                stats.unkeyed += 1;
                continue;
            };
            match positions.get(&key) {
                Some(&pos) => {
                    let overflowed = merge_counters(&mut snapshot[pos].1, &row, counter_columns);
                    for column in &overflowed {
                        warn!(
                            target: "statmetrics::derivative",
                            key = %key,
                            column = %column,
                            "Summing duplicate rows overflowed, keeping the first value"
                        );
                    }
                    stats.merge_overflows += overflowed.len();
                    stats.merged_duplicates += 1;
                }
                None => {
                    positions.insert(key.clone(), snapshot.len());
                    snapshot.push((key, row));
                }
            }
        }

        let mut derived_rows = Vec::new();
        for (key, row) in &snapshot {
            let Some(baseline) = self.previous.get(key) else {
                stats.first_seen += 1;
                continue;
            };
            match diff_row(row, &baseline.row, counter_columns) {
                RowDelta::Reset { column } => {
                    trace!(
                        target: "statmetrics::derivative",
                        key = %key,
                        column = %column,
                        "Counter reset, re-baselining"
                    );
                    stats.resets += 1;
                }
                RowDelta::Derived { row, deltas, missing } => {
                    stats.missing_columns += missing;
                    if deltas.is_empty() {
                        stats.no_counters += 1;
                    } else if self.is_idle(&deltas) {
                        stats.unchanged += 1;
                    } else {
                        derived_rows.push(row);
                    }
                }
            }
        }

        if stats.missing_columns > 0 {
            debug!(
                target: "statmetrics::derivative",
                missing_columns = stats.missing_columns,
                "Counter columns missing or non-numeric, skipped"
            );
        }

        self.previous = snapshot
            .into_iter()
            .map(|(key, row)| (key, Baseline { row, observed_at: now }))
            .collect();

        stats.emitted = derived_rows.len();
        debug!(
            target: "statmetrics::derivative",
            rows_in = stats.rows_in,
            first_seen = stats.first_seen,
            resets = stats.resets,
            unkeyed = stats.unkeyed,
            emitted = stats.emitted,
            "Derivative rows computed"
        );
        self.last_stats = stats;
        derived_rows
    }

    fn is_idle(&self, deltas: &[(CompactString, Numeric)]) -> bool {
        let indicators = &self.options.execution_indicators;
        if !indicators.is_empty() {
            let mut observed = deltas.iter().filter(|(c, _)| indicators.contains(c)).peekable();
            return observed.peek().is_some() && observed.all(|(_, d)| d.is_zero());
        }
        self.options.skip_unchanged && deltas.iter().all(|(_, d)| d.is_zero())
    }

    pub fn last_stats(&self) -> DerivativeStats {
        self.last_stats
    }

    pub fn options(&self) -> &DerivativeOptions {
        &self.options
    }

    /// Number of keys in the previous snapshot
    pub fn len(&self) -> usize {
        self.previous.len()
    }

    pub fn is_empty(&self) -> bool {
        self.previous.is_empty()
    }

    pub fn baseline(&self, key: &RowKey) -> Option<&Row> {
        self.previous.get(key).map(|b| &b.row)
    }

    /// Time since `key` was last observed
    pub fn baseline_age(&self, key: &RowKey) -> Option<Duration> {
        self.previous.get(key).map(|b| b.observed_at.elapsed())
    }

    /// Forget every baseline; the next snapshot is treated as first-seen.
    pub fn clear(&mut self) {
        self.previous.clear();
    }
}

// ============================================================================
// SECTION 10: ROW LIMITS & QUERY TEMPLATES
// ============================================================================
// Two caps keep a check's output bounded:
// - the fetch limit, rendered into the source query as TOP N / LIMIT N
// - the emit limit, applied to derivative rows ranked by a weight column
// ============================================================================

// ----------------------------------------------------------------------------
// 10.1 Row Limits
// ----------------------------------------------------------------------------

/// A named cap on emitted rows. `max_value` is reported, not enforced.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RowLimit {
    pub max_rows: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_value: Option<f64>,
}

impl RowLimit {
    pub fn new(max_rows: usize) -> Self {
        Self { max_rows, max_value: None }
    }

    pub fn with_max_value(mut self, max_value: f64) -> Self {
        self.max_value = Some(max_value);
        self
    }
}

pub type RowLimits = BTreeMap<CompactString, RowLimit>;

/// Smallest `max_rows` across all limits, `None` without limits.
pub fn effective_row_cap(limits: &RowLimits) -> Option<usize> {
    limits.values().map(|l| l.max_rows).min()
}

type RankedRow = (Option<OrderedFloat<f64>>, Option<RowKey>, Row);

fn compare_ranked(a: &RankedRow, b: &RankedRow, descending: bool) -> Ordering {
    let by_weight = match (a.0, b.0) {
        (Some(x), Some(y)) if descending => y.cmp(&x),
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    };
    by_weight.then_with(|| a.1.cmp(&b.1))
}

/// Rank `rows` by `tiebreaker_column` and keep the top rows allowed by the
/// tightest limit.
///
/// Rows without a numeric tiebreaker rank last in either direction. Equal
/// weights are ordered by `key_fn`, so the same input always yields the same
/// output. Without limits every row is kept (still ranked).
pub fn apply_row_limits<F>(
    rows: Vec<Row>,
    limits: &RowLimits,
    tiebreaker_column: &str,
    sort_descending: bool,
    key_fn: F,
) -> Vec<Row>
where
    F: Fn(&Row) -> Option<RowKey>,
{
    let cap = effective_row_cap(limits).unwrap_or(rows.len());

    let mut ranked: Vec<RankedRow> = rows
        .into_iter()
        .map(|row| {
            let weight = row.numeric(tiebreaker_column).map(|n| OrderedFloat(n.as_f64()));
            let key = key_fn(&row);
            (weight, key, row)
        })
        .collect();
    ranked.sort_by(|a, b| compare_ranked(a, b, sort_descending));

    if ranked.len() > cap {
        trace!(
            target: "statmetrics::limits",
            rows = ranked.len(),
            cap,
            tiebreaker = tiebreaker_column,
            "Truncating derivative rows"
        );
        ranked.truncate(cap);
    }

    ranked.into_iter().map(|(_, _, row)| row).collect()
}

// ----------------------------------------------------------------------------
// 10.2 Query Templates
// ----------------------------------------------------------------------------

const PLACEHOLDER_COLUMNS: &str = "columns";
const PLACEHOLDER_COLUMN_SUMS: &str = "column_sums";
const PLACEHOLDER_LIMIT: &str = "limit";

#[derive(Debug, Clone, PartialEq, Eq)]
enum TemplatePart {
    Literal(String),
    Columns,
    ColumnSums,
    Limit,
}

/// Source query with `{columns}`, `{column_sums}` and `{limit}` placeholders.
///
/// The rendered text is cached per limit; call [`invalidate`](Self::invalidate)
/// when the resolved column set changes.
#[derive(Debug, Clone)]
pub struct QueryTemplate {
    parts: Vec<TemplatePart>,
    rendered: Option<(usize, String)>,
}

impl QueryTemplate {
    pub fn parse(template: &str) -> std::result::Result<Self, String> {
        let mut parts = Vec::new();
        let mut rest = template;

        while let Some(open) = rest.find('{') {
            let literal = &rest[..open];
            if literal.contains('}') {
                return Err("unmatched '}'".into());
            }
            if !literal.is_empty() {
                parts.push(TemplatePart::Literal(literal.to_string()));
            }
            let after = &rest[open + 1..];
            let close = after
                .find('}')
                .ok_or_else(|| format!("unclosed placeholder at byte {}", template.len() - rest.len() + open))?;
            parts.push(match &after[..close] {
                PLACEHOLDER_COLUMNS => TemplatePart::Columns,
                PLACEHOLDER_COLUMN_SUMS => TemplatePart::ColumnSums,
                PLACEHOLDER_LIMIT => TemplatePart::Limit,
                other => return Err(format!("unknown placeholder '{{{}}}'", other)),
            });
            rest = &after[close + 1..];
        }
        if rest.contains('}') {
            return Err("unmatched '}'".into());
        }
        if !rest.is_empty() {
            parts.push(TemplatePart::Literal(rest.to_string()));
        }

        Ok(Self { parts, rendered: None })
    }

    pub fn has_limit(&self) -> bool {
        self.parts.contains(&TemplatePart::Limit)
    }

    pub fn render(&mut self, columns: &ColumnSet, limit: usize) -> &str {
        if self.rendered.as_ref().is_some_and(|(cached_limit, _)| *cached_limit != limit) {
            self.rendered = None;
        }
        let parts = &self.parts;
        let (_, query) = self.rendered.get_or_insert_with(|| {
            let mut query = String::new();
            for part in parts {
                match part {
                    TemplatePart::Literal(text) => query.push_str(text),
                    TemplatePart::Columns => {
                        query.push_str(&columns.iter().collect::<Vec<_>>().join(", "));
                    }
                    TemplatePart::ColumnSums => {
                        let sums: Vec<String> = columns.iter().map(|c| format!("SUM({c}) AS {c}")).collect();
                        query.push_str(&sums.join(", "));
                    }
                    TemplatePart::Limit => query.push_str(&limit.to_string()),
                }
            }
            (limit, query)
        });
        query
    }

    pub fn is_rendered(&self) -> bool {
        self.rendered.is_some()
    }

    pub fn invalidate(&mut self) {
        self.rendered = None;
    }
}

// ============================================================================
// SECTION 11: METRIC SUBMISSION
// ============================================================================
// Submitters receive named, typed, tagged values. Three are provided:
// - AggregatorStub      in-memory, for tests and dry runs
// - JsonLinesSubmitter  one JSON object per line to any writer
// - PrometheusSubmitter registry rendered as text exposition
// ============================================================================

// ----------------------------------------------------------------------------
// 11.1 Submitter Trait
// ----------------------------------------------------------------------------

/// Sink for metrics and service checks
pub trait MetricSubmitter: Send {
    fn submit_metric(&mut self, metric_type: MetricType, name: &str, value: f64, tags: &[CompactString]) -> OutputResult<()>;

    fn service_check(
        &mut self,
        name: &str,
        status: ServiceCheckStatus,
        tags: &[CompactString],
        message: Option<&str>,
    ) -> OutputResult<()>;

    fn gauge(&mut self, name: &str, value: f64, tags: &[CompactString]) -> OutputResult<()> {
        self.submit_metric(MetricType::Gauge, name, value, tags)
    }

    fn rate(&mut self, name: &str, value: f64, tags: &[CompactString]) -> OutputResult<()> {
        self.submit_metric(MetricType::Rate, name, value, tags)
    }

    fn monotonic_count(&mut self, name: &str, value: f64, tags: &[CompactString]) -> OutputResult<()> {
        self.submit_metric(MetricType::MonotonicCount, name, value, tags)
    }

    fn count(&mut self, name: &str, value: f64, tags: &[CompactString]) -> OutputResult<()> {
        self.submit_metric(MetricType::Count, name, value, tags)
    }

    /// Called once at the end of every cycle
    fn flush(&mut self) -> OutputResult<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricSubmission {
    pub metric_type: MetricType,
    pub name: CompactString,
    pub value: f64,
    pub tags: Tags,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceCheckSubmission {
    pub name: CompactString,
    pub status: ServiceCheckStatus,
    pub tags: Tags,
    pub message: Option<String>,
}

// ----------------------------------------------------------------------------
// 11.2 In-Memory Aggregator
// ----------------------------------------------------------------------------

/// Records every submission in order.
#[derive(Debug, Clone, Default)]
pub struct AggregatorStub {
    metrics: Vec<MetricSubmission>,
    service_checks: Vec<ServiceCheckSubmission>,
}

impl AggregatorStub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all_metrics(&self) -> &[MetricSubmission] {
        &self.metrics
    }

    pub fn metrics(&self, name: &str) -> Vec<&MetricSubmission> {
        self.metrics.iter().filter(|m| m.name == name).collect()
    }

    /// First submission of `name` carrying every tag in `tags`
    pub fn find_metric(&self, name: &str, tags: &[&str]) -> Option<&MetricSubmission> {
        self.metrics
            .iter()
            .find(|m| m.name == name && tags.iter().all(|t| m.tags.iter().any(|mt| mt == t)))
    }

    pub fn metric_names(&self) -> BTreeSet<&str> {
        self.metrics.iter().map(|m| m.name.as_str()).collect()
    }

    pub fn service_checks(&self, name: &str) -> Vec<&ServiceCheckSubmission> {
        self.service_checks.iter().filter(|s| s.name == name).collect()
    }

    pub fn metric_count(&self) -> usize {
        self.metrics.len()
    }

    pub fn reset(&mut self) {
        self.metrics.clear();
        self.service_checks.clear();
    }
}

impl MetricSubmitter for AggregatorStub {
    fn submit_metric(&mut self, metric_type: MetricType, name: &str, value: f64, tags: &[CompactString]) -> OutputResult<()> {
        self.metrics.push(MetricSubmission {
            metric_type,
            name: CompactString::from(name),
            value,
            tags: tags.iter().cloned().collect(),
        });
        Ok(())
    }

    fn service_check(
        &mut self,
        name: &str,
        status: ServiceCheckStatus,
        tags: &[CompactString],
        message: Option<&str>,
    ) -> OutputResult<()> {
        self.service_checks.push(ServiceCheckSubmission {
            name: CompactString::from(name),
            status,
            tags: tags.iter().cloned().collect(),
            message: message.map(str::to_string),
        });
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// 11.3 JSON Lines Output
// ----------------------------------------------------------------------------

/// Writes `{"timestamp", "type", "name", "value", "tags"}` objects, one per line.
pub struct JsonLinesSubmitter<W: Write + Send> {
    writer: W,
    written: u64,
}

impl<W: Write + Send> Debug for JsonLinesSubmitter<W> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("JsonLinesSubmitter").field("written", &self.written).finish()
    }
}

impl<W: Write + Send> JsonLinesSubmitter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer, written: 0 }
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn into_inner(self) -> W {
        self.writer
    }

    fn write_line(&mut self, line: &JsonValue) -> OutputResult<()> {
        serde_json::to_writer(&mut self.writer, line)?;
        self.writer.write_all(b"\n")?;
        self.written += 1;
        Ok(())
    }
}

impl<W: Write + Send> MetricSubmitter for JsonLinesSubmitter<W> {
    fn submit_metric(&mut self, metric_type: MetricType, name: &str, value: f64, tags: &[CompactString]) -> OutputResult<()> {
        crate::log_submission!(metric_type, name, value);
        self.write_line(&json!({
            "timestamp": Utc::now().to_rfc3339(),
            "type": metric_type,
            "name": name,
            "value": value,
            "tags": tags,
        }))
    }

    fn service_check(
        &mut self,
        name: &str,
        status: ServiceCheckStatus,
        tags: &[CompactString],
        message: Option<&str>,
    ) -> OutputResult<()> {
        self.write_line(&json!({
            "timestamp": Utc::now().to_rfc3339(),
            "type": "service_check",
            "name": name,
            "status": status,
            "tags": tags,
            "message": message,
        }))
    }

    fn flush(&mut self) -> OutputResult<()> {
        self.writer.flush()?;
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// 11.4 Prometheus Exposition
// ----------------------------------------------------------------------------

fn sanitize_prometheus_name(name: &str) -> String {
    let mut out: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == ':' { c } else { '_' })
        .collect();
    if out.starts_with(|c: char| c.is_ascii_digit()) {
        out.insert(0, '_');
    }
    out
}

/// Tags as Prometheus labels. Keyless tags are joined under `tag`.
fn tags_to_labels(tags: &[CompactString]) -> BTreeMap<String, String> {
    let mut labels: BTreeMap<String, String> = BTreeMap::new();
    for tag in tags {
        let (key, value) = match parse_tag(tag) {
            (TagKey::Named(key), value) => (sanitize_prometheus_name(&key), value),
            (TagKey::Keyless, value) => ("tag".to_string(), value),
        };
        labels
            .entry(key)
            .and_modify(|existing| {
                existing.push(',');
                existing.push_str(&value);
            })
            .or_insert_with(|| value.to_string());
    }
    labels
}

const SERVICE_CHECK_FAMILY: &str = "service_check_status";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FamilyKind {
    Gauge,
    Counter,
    Status,
}

impl FamilyKind {
    fn of(metric_type: MetricType) -> Self {
        match metric_type {
            MetricType::Gauge | MetricType::Rate => Self::Gauge,
            MetricType::Count | MetricType::MonotonicCount => Self::Counter,
        }
    }
}

enum Collector {
    Gauge(GaugeVec),
    Counter(CounterVec),
    Status(IntGaugeVec),
}

impl Collector {
    fn kind(&self) -> FamilyKind {
        match self {
            Self::Gauge(_) => FamilyKind::Gauge,
            Self::Counter(_) => FamilyKind::Counter,
            Self::Status(_) => FamilyKind::Status,
        }
    }
}

struct Family {
    collector: Collector,
    label_names: Vec<String>,
}

impl Family {
    fn label_values<'a>(&'a self, labels: &'a BTreeMap<String, String>) -> Vec<&'a str> {
        self.label_names
            .iter()
            .map(|n| labels.get(n).map(String::as_str).unwrap_or(""))
            .collect()
    }
}

/// Exports submissions into a private registry.
///
/// Gauges and rates become gauges. Counts are added to a counter and
/// monotonic counts are mirrored by one. Service checks share one
/// `service_check_status` gauge labelled by `check` plus their tags.
///
/// The first submission of a family fixes its label names; later submissions
/// fill absent labels with "" and drop labels the family does not have.
pub struct PrometheusSubmitter {
    registry: PrometheusRegistry,
    families: HashMap<String, Family>,
    output: Option<PathBuf>,
}

impl Debug for PrometheusSubmitter {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrometheusSubmitter")
            .field("families", &self.families.len())
            .field("output", &self.output)
            .finish()
    }
}

impl PrometheusSubmitter {
    pub fn new() -> OutputResult<Self> {
        Ok(Self { registry: PrometheusRegistry::new(), families: HashMap::new(), output: None })
    }

    /// Rewrite `path` with the exposition text on every flush.
    pub fn with_output(mut self, path: PathBuf) -> Self {
        self.output = Some(path);
        self
    }

    pub fn render(&self) -> OutputResult<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| OutputError::Serialization(e.to_string()))
    }

    fn family(&mut self, metric_name: String, help: String, kind: FamilyKind, labels: &BTreeMap<String, String>) -> OutputResult<&Family> {
        if !self.families.contains_key(&metric_name) {
            let label_names: Vec<String> = labels.keys().cloned().collect();
            let label_refs: Vec<&str> = label_names.iter().map(String::as_str).collect();
            let opts = Opts::new(metric_name.clone(), help);
            let collector = match kind {
                FamilyKind::Gauge => {
                    let gauge = GaugeVec::new(opts, &label_refs)?;
                    self.registry.register(Box::new(gauge.clone()))?;
                    Collector::Gauge(gauge)
                }
                FamilyKind::Counter => {
                    let counter = CounterVec::new(opts, &label_refs)?;
                    self.registry.register(Box::new(counter.clone()))?;
                    Collector::Counter(counter)
                }
                FamilyKind::Status => {
                    let status = IntGaugeVec::new(opts, &label_refs)?;
                    self.registry.register(Box::new(status.clone()))?;
                    Collector::Status(status)
                }
            };
            self.families.insert(metric_name.clone(), Family { collector, label_names });
        }

        let family = self
            .families
            .get(&metric_name)
            .ok_or_else(|| OutputError::Registry(format!("metric family '{}' missing", metric_name)))?;
        if family.collector.kind() != kind {
            return Err(OutputError::Registry(format!(
                "metric '{}' already exported as {:?}, not {:?}",
                metric_name,
                family.collector.kind(),
                kind
            )));
        }
        Ok(family)
    }
}

impl MetricSubmitter for PrometheusSubmitter {
    fn submit_metric(&mut self, metric_type: MetricType, name: &str, value: f64, tags: &[CompactString]) -> OutputResult<()> {
        crate::log_submission!(metric_type, name, value);
        let kind = FamilyKind::of(metric_type);
        if kind == FamilyKind::Counter && !(value.is_finite() && value >= 0.0) {
            return Err(OutputError::InvalidValue { name: name.to_string(), value });
        }

        let labels = tags_to_labels(tags);
        let family = self.family(sanitize_prometheus_name(name), format!("{} ({})", name, metric_type), kind, &labels)?;
        let values = family.label_values(&labels);
        match &family.collector {
            Collector::Gauge(gauge) => gauge.get_metric_with_label_values(&values)?.set(value),
            Collector::Counter(counter) => {
                let counter = counter.get_metric_with_label_values(&values)?;
                if metric_type == MetricType::MonotonicCount {
                    let current = counter.get();
                    if value < current {
                        counter.reset();
                        counter.inc_by(value);
                    } else {
                        counter.inc_by(value - current);
                    }
                } else {
                    counter.inc_by(value);
                }
            }
            Collector::Status(_) => {
                return Err(OutputError::Registry(format!("'{}' is reserved for service checks", name)));
            }
        }
        Ok(())
    }

    fn service_check(
        &mut self,
        name: &str,
        status: ServiceCheckStatus,
        tags: &[CompactString],
        _message: Option<&str>,
    ) -> OutputResult<()> {
        let mut labels = tags_to_labels(tags);
        labels.insert("check".to_string(), name.to_string());
        let family = self.family(
            SERVICE_CHECK_FAMILY.to_string(),
            "Service check status (0 ok, 1 warning, 2 critical, 3 unknown)".to_string(),
            FamilyKind::Status,
            &labels,
        )?;
        let values = family.label_values(&labels);
        if let Collector::Status(gauge) = &family.collector {
            gauge.get_metric_with_label_values(&values)?.set(status.code() as i64);
        }
        Ok(())
    }

    fn flush(&mut self) -> OutputResult<()> {
        let Some(path) = &self.output else {
            return Ok(());
        };
        let text = self.render()?;
        let staging = path.with_extension("prom.tmp");
        fs::write(&staging, text)?;
        fs::rename(&staging, path)?;
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// 11.5 Statement Metric Emitter
// ----------------------------------------------------------------------------

/// Maps one derived counter column to a metric
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnMapping {
    pub column: CompactString,
    pub metric: CompactString,
    pub metric_type: MetricType,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EmitStats {
    pub rows: usize,
    pub metrics: usize,
    pub missing_values: usize,
    /// Tags cut from rows over the per-metric tag limit
    pub dropped_tags: usize,
}

/// Submits each derived row as one metric per mapped column, tagged with the
/// instance tags plus the row's tag columns.
#[derive(Debug, Clone)]
pub struct StatementMetricEmitter {
    prefix: CompactString,
    mappings: Vec<ColumnMapping>,
    tag_columns: Vec<(CompactString, CompactString)>,
}

impl StatementMetricEmitter {
    pub fn new(prefix: &str) -> Self {
        Self { prefix: CompactString::from(prefix.trim_end_matches('.')), mappings: Vec::new(), tag_columns: Vec::new() }
    }

    /// Map `column` to `<prefix>.<column>`. Names over the length limit are
    /// rejected with a warning.
    pub fn with_mapping(mut self, column: &str, metric_type: MetricType) -> Self {
        let metric = if self.prefix.is_empty() {
            CompactString::from(column)
        } else {
            let mut name = self.prefix.clone();
            name.push('.');
            name.push_str(column);
            name
        };
        if metric.len() > MAX_METRIC_NAME_LENGTH {
            warn!(target: "statmetrics::emit", metric = %metric, "Metric name too long, column not emitted");
            return self;
        }
        self.mappings.push(ColumnMapping { column: CompactString::from(column), metric, metric_type });
        self
    }

    pub fn with_tag_column(mut self, column: &str, tag_key: &str) -> Self {
        self.tag_columns.push((CompactString::from(column), CompactString::from(tag_key)));
        self
    }

    pub fn from_config(config: &StatementCheckConfig) -> Self {
        let mut emitter = Self::new(&config.metric_prefix);
        for column in &config.counter_columns {
            let metric_type = config.metric_types.get(column).copied().unwrap_or(MetricType::Count);
            emitter = emitter.with_mapping(column, metric_type);
        }
        for (column, tag_key) in &config.tag_columns {
            emitter = emitter.with_tag_column(column, tag_key);
        }
        emitter
    }

    pub fn mappings(&self) -> &[ColumnMapping] {
        &self.mappings
    }

    /// Instance tags followed by `tag_key:value` for each tag column present,
    /// capped at `MAX_TAGS_PER_METRIC`.
    pub fn row_tags(&self, row: &Row, base: &Tags) -> Tags {
        self.capped_row_tags(row, base).0
    }

    fn capped_row_tags(&self, row: &Row, base: &Tags) -> (Tags, usize) {
        let mut tags = base.clone();
        for (column, key) in &self.tag_columns {
            if let Some(value) = row.get(column).and_then(ColumnValue::to_tag_value) {
                tags.push(TagKey::Named(key.clone()).render(&value));
            }
        }
        let dropped = tags.len().saturating_sub(MAX_TAGS_PER_METRIC);
        if dropped > 0 {
            debug!(
                target: "statmetrics::emit",
                dropped,
                limit = MAX_TAGS_PER_METRIC,
                first_dropped = %tags[MAX_TAGS_PER_METRIC],
                "Row has too many tags, truncating"
            );
            tags.truncate(MAX_TAGS_PER_METRIC);
        }
        (tags, dropped)
    }

    pub fn emit(&self, rows: &[Row], tags: &TagManager, submitter: &mut dyn MetricSubmitter) -> OutputResult<EmitStats> {
        let base = tags.get_tags();
        let mut stats = EmitStats { rows: rows.len(), ..EmitStats::default() };

        for row in rows {
            let (row_tags, dropped) = self.capped_row_tags(row, &base);
            stats.dropped_tags += dropped;
            for mapping in &self.mappings {
                match row.numeric(&mapping.column) {
                    Some(value) => {
                        submitter.submit_metric(mapping.metric_type, &mapping.metric, value.as_f64(), &row_tags)?;
                        stats.metrics += 1;
                    }
                    None => stats.missing_values += 1,
                }
            }
        }
        if stats.dropped_tags > 0 {
            warn!(
                target: "statmetrics::emit",
                dropped_tags = stats.dropped_tags,
                limit = MAX_TAGS_PER_METRIC,
                "Tags dropped over the per-metric limit"
            );
        }
        Ok(stats)
    }
}

// ============================================================================
// SECTION 12: DOCUMENT METRIC EXTRACTOR
// ============================================================================
// Declarative extraction from nested JSON status documents:
// - simple metrics at a dotted path
// - enumerations: one metric set per array element, tagged with its index
// - groups: one metric set per object member, tagged with its key
// ============================================================================

// ----------------------------------------------------------------------------
// 12.1 Dotted Path Lookup
// ----------------------------------------------------------------------------

fn json_type_name(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "a boolean",
        JsonValue::Number(_) => "a number",
        JsonValue::String(_) => "a string",
        JsonValue::Array(_) => "an array",
        JsonValue::Object(_) => "an object",
    }
}

/// Resolve `path` ("a.b.c") through nested objects. An empty path is the
/// document itself.
pub fn lookup_dotted<'a>(document: &'a JsonValue, path: &str) -> ExtractionResult<&'a JsonValue> {
    if path.is_empty() {
        return Ok(document);
    }

    let mut node = document;
    for segment in path.split('.') {
        let JsonValue::Object(map) = node else {
            return Err(ExtractionError::NotAMapping {
                path: path.to_string(),
                segment: segment.to_string(),
                found: json_type_name(node),
            });
        };
        node = map.get(segment).ok_or_else(|| ExtractionError::KeyNotFound {
            path: path.to_string(),
            segment: segment.to_string(),
        })?;
    }
    Ok(node)
}

// ----------------------------------------------------------------------------
// 12.2 Value Modifiers
// ----------------------------------------------------------------------------

/// Conversion applied to a raw value before submission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueModifier {
    /// Number of elements of an array or members of an object
    Total,
    /// true -> 1, false -> 0
    Boolean,
    /// true -> 0 (ok), false -> 1 (warning)
    OkWarning,
    /// Seconds elapsed since an RFC 3339 timestamp
    ElapsedSecs,
}

fn numeric_value(value: &JsonValue, path: &str) -> ExtractionResult<f64> {
    let not_numeric = || ExtractionError::NotNumeric { path: path.to_string(), found: json_type_name(value) };
    match value {
        JsonValue::Number(n) => n.as_f64().ok_or_else(not_numeric),
        JsonValue::String(s) => s.trim().parse::<f64>().map_err(|_| not_numeric()),
        _ => Err(not_numeric()),
    }
}

impl ValueModifier {
    pub fn apply(&self, value: &JsonValue, path: &str) -> ExtractionResult<f64> {
        match self {
            Self::Total => match value {
                JsonValue::Array(items) => Ok(items.len() as f64),
                JsonValue::Object(map) => Ok(map.len() as f64),
                other => Err(ExtractionError::NotAnArray { path: path.to_string(), found: json_type_name(other) }),
            },
            Self::Boolean | Self::OkWarning => {
                let JsonValue::Bool(flag) = value else {
                    return Err(ExtractionError::NotNumeric { path: path.to_string(), found: json_type_name(value) });
                };
                let truthy = if *self == Self::Boolean { *flag } else { !*flag };
                Ok(if truthy { 1.0 } else { 0.0 })
            }
            Self::ElapsedSecs => {
                let invalid = || ExtractionError::InvalidTimestamp { path: path.to_string(), value: value.to_string() };
                let text = value.as_str().ok_or_else(invalid)?;
                let at = DateTime::parse_from_rfc3339(text).map_err(|_| invalid())?;
                let elapsed = Utc::now().signed_duration_since(at.with_timezone(&Utc));
                Ok(elapsed.num_milliseconds() as f64 / 1000.0)
            }
        }
    }
}

// ----------------------------------------------------------------------------
// 12.3 Metric Specifications
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSpec {
    /// Dotted path, relative to the enclosing document, element or member
    #[serde(default)]
    pub path: String,
    pub name: String,
    pub metric_type: MetricType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modifier: Option<ValueModifier>,
}

impl MetricSpec {
    pub fn new(path: &str, name: &str, metric_type: MetricType) -> Self {
        Self { path: path.to_string(), name: name.to_string(), metric_type, modifier: None }
    }

    pub fn with_modifier(mut self, modifier: ValueModifier) -> Self {
        self.modifier = Some(modifier);
        self
    }

    pub fn extract(&self, node: &JsonValue) -> ExtractionResult<f64> {
        let value = lookup_dotted(node, &self.path)?;
        match &self.modifier {
            Some(modifier) => modifier.apply(value, &self.path),
            None => numeric_value(value, &self.path),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnumerationSpec {
    /// Path to an array
    pub path: String,
    /// Tag key receiving the element index
    pub index_tag: String,
    pub metrics: Vec<MetricSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupSpec {
    /// Path to an object
    pub path: String,
    /// Tag key receiving the member name
    pub key_tag: String,
    pub metrics: Vec<MetricSpec>,
}

// ----------------------------------------------------------------------------
// 12.4 Document Queries
// ----------------------------------------------------------------------------

/// Result of running a [`DocumentQuery`] over one document
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DocumentRun {
    pub metrics: Vec<MetricSubmission>,
    pub skipped: Vec<ExtractionError>,
}

impl DocumentRun {
    pub fn submit(&self, submitter: &mut dyn MetricSubmitter) -> OutputResult<usize> {
        for metric in &self.metrics {
            submitter.submit_metric(metric.metric_type, &metric.name, metric.value, &metric.tags)?;
        }
        Ok(self.metrics.len())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentQuery {
    pub name: String,
    #[serde(default)]
    pub metrics: Vec<MetricSpec>,
    #[serde(default)]
    pub enumerations: Vec<EnumerationSpec>,
    #[serde(default)]
    pub groups: Vec<GroupSpec>,
    /// Extra tags for every emission of this query
    #[serde(default)]
    pub tags: Vec<String>,
}

impl DocumentQuery {
    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty() && self.enumerations.is_empty() && self.groups.is_empty()
    }

    /// Simple metrics, then enumerations, then groups. A failing metric is
    /// recorded in `skipped` and the rest of the run continues.
    pub fn run(&self, document: &JsonValue, base_tags: &Tags) -> DocumentRun {
        let mut tags = base_tags.clone();
        tags.extend(self.tags.iter().map(|t| CompactString::from(t.as_str())));

        let mut run = DocumentRun::default();
        self.extract_all(&self.metrics, document, &tags, &mut run);

        for enumeration in &self.enumerations {
            match lookup_dotted(document, &enumeration.path) {
                Ok(JsonValue::Array(items)) => {
                    for (index, item) in items.iter().enumerate() {
                        let mut item_tags = tags.clone();
                        item_tags.push(format!("{}:{}", enumeration.index_tag, index).into());
                        self.extract_all(&enumeration.metrics, item, &item_tags, &mut run);
                    }
                }
                Ok(other) => run.skipped.push(ExtractionError::NotAnArray {
                    path: enumeration.path.clone(),
                    found: json_type_name(other),
                }),
                Err(e) => run.skipped.push(e),
            }
        }

        for group in &self.groups {
            match lookup_dotted(document, &group.path) {
                Ok(JsonValue::Object(members)) => {
                    for (key, member) in members {
                        let mut member_tags = tags.clone();
                        member_tags.push(format!("{}:{}", group.key_tag, key).into());
                        self.extract_all(&group.metrics, member, &member_tags, &mut run);
                    }
                }
                Ok(other) => run.skipped.push(ExtractionError::NotAnObject {
                    path: group.path.clone(),
                    found: json_type_name(other),
                }),
                Err(e) => run.skipped.push(e),
            }
        }

        if !run.skipped.is_empty() {
            debug!(
                target: "statmetrics::document",
                query = %self.name,
                skipped = run.skipped.len(),
                first = %run.skipped[0],
                "Document metrics skipped"
            );
        }
        run
    }

    fn extract_all(&self, specs: &[MetricSpec], node: &JsonValue, tags: &Tags, run: &mut DocumentRun) {
        for spec in specs {
            match spec.extract(node) {
                Ok(value) => run.metrics.push(MetricSubmission {
                    metric_type: spec.metric_type,
                    name: CompactString::from(spec.name.as_str()),
                    value,
                    tags: tags.clone(),
                }),
                Err(e) => run.skipped.push(e),
            }
        }
    }
}

// ============================================================================
// SECTION 13: ROW & DOCUMENT SOURCES
// ============================================================================
// Database drivers and HTTP clients live outside this crate. A source hands
// the engine one complete snapshot per call; the file replay source stands in
// for a live connection by reading recorded JSON snapshots in order.
// ============================================================================

// ----------------------------------------------------------------------------
// 13.1 Source Traits
// ----------------------------------------------------------------------------

/// What a check asks a row source for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    /// Rendered query text, when the check has a template
    pub query: Option<String>,
    /// Counter columns the check will difference
    pub columns: ColumnSet,
    /// Maximum rows the source may return
    pub row_limit: usize,
}

/// Supplies full statistics-view snapshots
#[async_trait]
pub trait RowSource: Send + Sync + Debug {
    fn name(&self) -> &str;

    /// Columns the source exposes. Called once per connection.
    async fn available_columns(&self) -> SourceResult<AHashSet<CompactString>>;

    async fn fetch_rows(&self, request: &FetchRequest) -> SourceResult<Vec<Row>>;
}

/// Supplies parsed status documents
#[async_trait]
pub trait DocumentSource: Send + Sync + Debug {
    fn name(&self) -> &str;

    async fn fetch_document(&self) -> SourceResult<JsonValue>;
}

// ----------------------------------------------------------------------------
// 13.2 File Replay Source
// ----------------------------------------------------------------------------

/// Replays JSON files matched by a glob pattern, one file per fetch, in
/// lexical path order.
///
/// Row snapshots are a JSON array of objects, or an object with a `rows`
/// array. Once every file has been served the source reports
/// [`SourceError::Exhausted`] unless it was built with `looping(true)`.
#[derive(Debug)]
pub struct FileReplaySource {
    name: String,
    files: Vec<PathBuf>,
    cursor: AtomicU64,
    looping: bool,
}

impl FileReplaySource {
    pub fn from_glob(name: &str, pattern: &str) -> SourceResult<Self> {
        let entries = glob::glob(pattern).map_err(|e| SourceError::ConnectionFailed {
            name: name.to_string(),
            message: format!("invalid pattern '{}': {}", pattern, e),
        })?;

        let mut files: Vec<PathBuf> = entries.filter_map(|entry| entry.ok()).filter(|p| p.is_file()).collect();
        files.sort();

        if files.is_empty() {
            return Err(SourceError::ConnectionFailed {
                name: name.to_string(),
                message: format!("no snapshot files match '{}'", pattern),
            });
        }

        debug!(target: "statmetrics::source", source = name, files = files.len(), "Replay source opened");
        Ok(Self::from_files(name, files))
    }

    pub fn from_files(name: &str, files: Vec<PathBuf>) -> Self {
        Self { name: name.to_string(), files, cursor: AtomicU64::new(0), looping: false }
    }

    /// Start over from the first file instead of reporting exhaustion.
    pub fn looping(mut self, looping: bool) -> Self {
        self.looping = looping;
        self
    }

    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    pub fn remaining(&self) -> usize {
        let served = self.cursor.load(AtomicOrdering::Relaxed) as usize;
        self.files.len().saturating_sub(served)
    }

    fn path_at(&self, position: u64) -> SourceResult<&PathBuf> {
        let position = position as usize;
        if self.files.is_empty() || (position >= self.files.len() && !self.looping) {
            return Err(SourceError::Exhausted { name: self.name.clone() });
        }
        Ok(&self.files[position % self.files.len()])
    }

    fn next_path(&self) -> SourceResult<&PathBuf> {
        let position = self.cursor.fetch_add(1, AtomicOrdering::Relaxed);
        self.path_at(position)
    }

    async fn read_json(&self, path: &Path) -> SourceResult<JsonValue> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| SourceError::Io { path: path.to_path_buf(), message: e.to_string() })?;
        serde_json::from_str(&content).map_err(|e| SourceError::InvalidResponse {
            name: self.name.clone(),
            message: format!("{}: {}", path.display(), e),
        })
    }

    fn parse_rows(&self, path: &Path, document: JsonValue) -> SourceResult<Vec<Row>> {
        let rows = match document {
            JsonValue::Object(mut map) => map.remove("rows").unwrap_or(JsonValue::Null),
            other => other,
        };
        serde_json::from_value(rows).map_err(|e| SourceError::InvalidResponse {
            name: self.name.clone(),
            message: format!("{}: expected an array of row objects: {}", path.display(), e),
        })
    }
}

#[async_trait]
impl RowSource for FileReplaySource {
    fn name(&self) -> &str {
        &self.name
    }

    /// Union of the columns in the snapshot that the next fetch will return.
    async fn available_columns(&self) -> SourceResult<AHashSet<CompactString>> {
        let path = self.path_at(self.cursor.load(AtomicOrdering::Relaxed))?;
        let rows = self.parse_rows(path, self.read_json(path).await?)?;
        Ok(rows
            .iter()
            .flat_map(|row| row.column_names().map(CompactString::from))
            .collect())
    }

    async fn fetch_rows(&self, request: &FetchRequest) -> SourceResult<Vec<Row>> {
        let path = self.next_path()?;
        if let Some(query) = &request.query {
            trace!(target: "statmetrics::source", source = %self.name, query = %query, "Replaying query");
        }
        let mut rows = self.parse_rows(path, self.read_json(path).await?)?;
        rows.truncate(request.row_limit);
        Ok(rows)
    }
}

#[async_trait]
impl DocumentSource for FileReplaySource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch_document(&self) -> SourceResult<JsonValue> {
        let path = self.next_path()?;
        self.read_json(path).await
    }
}

// ============================================================================
// SECTION 14: CHECKS & ENGINE
// ============================================================================
// A check owns all per-instance state and runs one cycle at a time:
//
//   fetch -> normalize -> derivative -> truncate -> emit -> service check
//
// The engine drives every configured check from a single task on a fixed
// interval, so a check's state is never touched concurrently.
// ============================================================================

// ----------------------------------------------------------------------------
// 14.1 Cycle Reports
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub rows_fetched: usize,
    pub normalize: NormalizeStats,
    pub derivative: DerivativeStats,
    pub rows_emitted: usize,
    pub metrics_submitted: usize,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DocumentReport {
    pub metrics_submitted: usize,
    pub skipped: usize,
}

// ----------------------------------------------------------------------------
// 14.2 Statement Check
// ----------------------------------------------------------------------------

/// Incremental statement metrics for one database instance.
#[derive(Debug)]
pub struct StatementCheck {
    id: Uuid,
    config: StatementCheckConfig,
    key_spec: RowKeySpec,
    limits: RowLimits,
    resolver: ColumnResolver,
    template: Option<QueryTemplate>,
    normalizer: RowNormalizer,
    state: StatementMetrics,
    tags: TagManager,
    emitter: StatementMetricEmitter,
    service_check_name: String,
    cycles: u64,
}

impl StatementCheck {
    pub fn new(config: StatementCheckConfig, hostname: Option<&str>) -> CheckResult<Self> {
        let template = config
            .query_template
            .as_deref()
            .map(QueryTemplate::parse)
            .transpose()
            .map_err(|message| ConfigError::InvalidValue { field: format!("checks.{}.query_template", config.name), message })?;

        let mut tags = if config.normalize_tags {
            TagManager::with_normalizer(default_tag_normalizer())
        } else {
            TagManager::new()
        };
        tags.set_tags_from_list_normalized(&config.tags, false);
        if let Some(host) = hostname {
            tags.set_tag(Some("host"), host, true);
        }

        let service_check_name = format!("{}.{}", config.metric_prefix.trim_end_matches('.'), SERVICE_CHECK_SUFFIX);

        Ok(Self {
            id: Uuid::new_v4(),
            key_spec: config.key_spec(),
            limits: config.row_limits(),
            resolver: ColumnResolver::new(config.counter_set()),
            template,
            normalizer: RowNormalizer::new(config.statement_column.as_deref(), config.obfuscate_statements)?,
            state: StatementMetrics::with_options(config.derivative_options()),
            emitter: StatementMetricEmitter::from_config(&config),
            tags,
            service_check_name,
            cycles: 0,
            config,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &StatementCheckConfig {
        &self.config
    }

    pub fn tags(&self) -> &TagManager {
        &self.tags
    }

    pub fn tags_mut(&mut self) -> &mut TagManager {
        &mut self.tags
    }

    pub fn state(&self) -> &StatementMetrics {
        &self.state
    }

    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    /// Counters being differenced: the resolved intersection once known,
    /// otherwise everything configured.
    pub fn counter_columns(&self) -> ColumnSet {
        match self.resolver.cached() {
            Some(resolved) => resolved.available.clone(),
            None => self.resolver.desired().clone(),
        }
    }

    /// Drop connection-scoped caches. Derivative state is kept.
    pub fn reconnect(&mut self) {
        self.resolver.invalidate();
        if let Some(template) = &mut self.template {
            template.invalidate();
        }
    }

    /// Run the pipeline over an already fetched snapshot.
    pub fn run_cycle(&mut self, rows: Vec<Row>, submitter: &mut dyn MetricSubmitter) -> CheckResult<CycleReport> {
        let timer = PerfTimer::with_threshold("statement_cycle", SLOW_CYCLE_THRESHOLD_MS);
        let rows_fetched = rows.len();
        let counters = self.counter_columns();

        let (rows, normalize) = self.normalizer.normalize(rows);

        let key_spec = &self.key_spec;
        let derived = self.state.compute_derivative_rows(rows, &counters, |row| key_spec.key_for(row));
        let limited = apply_row_limits(
            derived,
            &self.limits,
            &self.config.tiebreaker_column,
            self.config.sort_descending,
            |row| key_spec.key_for(row),
        );

        let emitted = self.emitter.emit(&limited, &self.tags, submitter)?;
        self.cycles += 1;

        let report = CycleReport {
            rows_fetched,
            normalize,
            derivative: self.state.last_stats(),
            rows_emitted: limited.len(),
            metrics_submitted: emitted.metrics,
            elapsed_ms: timer.stop(),
        };
        crate::log_cycle!(self.config.name, report);
        Ok(report)
    }

    /// Fetch a snapshot from `source` and run a cycle.
    ///
    /// A failed fetch submits a CRITICAL service check and leaves the
    /// derivative state untouched.
    pub async fn check(&mut self, source: &dyn RowSource, submitter: &mut dyn MetricSubmitter) -> CheckResult<CycleReport> {
        let rows = match self.fetch(source).await {
            Ok(rows) => rows,
            Err(e) => {
                if e.recovery_hint() == RecoveryHint::Reconnect {
                    self.reconnect();
                }
                if !matches!(e, SourceError::Exhausted { .. }) {
                    let tags = self.tags.get_tags();
                    let message = e.to_string();
                    submitter.service_check(&self.service_check_name, ServiceCheckStatus::Critical, &tags, Some(message.as_str()))?;
                    submitter.flush()?;
                }
                return Err(e.into());
            }
        };

        let report = self.run_cycle(rows, submitter)?;
        let tags = self.tags.get_tags();
        submitter.service_check(&self.service_check_name, ServiceCheckStatus::Ok, &tags, None)?;
        submitter.flush()?;
        Ok(report)
    }

    async fn fetch(&mut self, source: &dyn RowSource) -> SourceResult<Vec<Row>> {
        if self.resolver.cached().is_none() {
            let available = source.available_columns().await?;
            self.resolver.resolve(&available);
            if let Some(template) = &mut self.template {
                template.invalidate();
            }
        }

        let columns = self.counter_columns();
        let row_limit = self.config.fetch_row_limit;
        let query = self.template.as_mut().map(|t| t.render(&columns, row_limit).to_string());
        let request = FetchRequest { query, columns, row_limit };
        source.fetch_rows(&request).await
    }
}

// ----------------------------------------------------------------------------
// 14.3 Document Check
// ----------------------------------------------------------------------------

/// Runs configured document queries over each fetched document.
#[derive(Debug)]
pub struct DocumentCheck {
    id: Uuid,
    config: DocumentCheckConfig,
    tags: TagManager,
    service_check_name: String,
}

impl DocumentCheck {
    pub fn new(config: DocumentCheckConfig, hostname: Option<&str>) -> Self {
        let mut tags = TagManager::from_tag_list(&config.tags);
        if let Some(host) = hostname {
            tags.set_tag(Some("host"), host, true);
        }
        Self {
            id: Uuid::new_v4(),
            service_check_name: format!("{}.{}", config.name, SERVICE_CHECK_SUFFIX),
            config,
            tags,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn tags_mut(&mut self) -> &mut TagManager {
        &mut self.tags
    }

    /// All queries over one document, concatenated.
    pub fn run_document(&self, document: &JsonValue) -> DocumentRun {
        let base = self.tags.get_tags();
        let mut combined = DocumentRun::default();
        for query in &self.config.queries {
            let run = query.run(document, &base);
            combined.metrics.extend(run.metrics);
            combined.skipped.extend(run.skipped);
        }
        combined
    }

    pub async fn check(&self, source: &dyn DocumentSource, submitter: &mut dyn MetricSubmitter) -> CheckResult<DocumentReport> {
        let tags = self.tags.get_tags();
        let document = match source.fetch_document().await {
            Ok(document) => document,
            Err(e) => {
                if !matches!(e, SourceError::Exhausted { .. }) {
                    let message = e.to_string();
                    submitter.service_check(&self.service_check_name, ServiceCheckStatus::Critical, &tags, Some(message.as_str()))?;
                    submitter.flush()?;
                }
                return Err(e.into());
            }
        };

        let run = self.run_document(&document);
        let submitted = run.submit(submitter)?;
        submitter.service_check(&self.service_check_name, ServiceCheckStatus::Ok, &tags, None)?;
        submitter.flush()?;
        Ok(DocumentReport { metrics_submitted: submitted, skipped: run.skipped.len() })
    }
}

// ----------------------------------------------------------------------------
// 14.4 Engine
// ----------------------------------------------------------------------------

#[derive(Debug)]
struct ScheduledStatementCheck {
    check: StatementCheck,
    source: Box<dyn RowSource>,
    exhausted: bool,
}

#[derive(Debug)]
struct ScheduledDocumentCheck {
    check: DocumentCheck,
    source: Box<dyn DocumentSource>,
    exhausted: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EngineCycleReport {
    pub checks_ok: usize,
    pub checks_failed: usize,
    pub checks_exhausted: usize,
    pub metrics_submitted: usize,
}

/// Clonable handle that stops a running engine
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    notify: Arc<Notify>,
    running: Arc<AtomicBool>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        info!(target: "statmetrics::engine", "Shutdown requested");
        self.running.store(false, AtomicOrdering::Release);
        self.notify.notify_one();
    }
}

/// Schedules every configured check on the collection interval
pub struct Engine {
    config: Arc<ConfigManager>,
    statement_checks: Vec<ScheduledStatementCheck>,
    document_checks: Vec<ScheduledDocumentCheck>,
    submitter: Box<dyn MetricSubmitter>,
    error_stats: Arc<ErrorStats>,
    shutdown: Arc<Notify>,
    running: Arc<AtomicBool>,
    cycles: u64,
    start_time: Instant,
}

impl Debug for Engine {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("statement_checks", &self.statement_checks.len())
            .field("document_checks", &self.document_checks.len())
            .field("cycles", &self.cycles)
            .field("running", &self.is_running())
            .finish()
    }
}

/// Submitter selected by the `[output]` section
pub fn build_submitter(output: &OutputConfig) -> CheckResult<Box<dyn MetricSubmitter>> {
    match output.format {
        OutputFormat::JsonLines => {
            let writer: Box<dyn Write + Send> = match &output.path {
                Some(path) => Box::new(fs::OpenOptions::new().create(true).append(true).open(path)?),
                None => Box::new(io::stdout()),
            };
            Ok(Box::new(JsonLinesSubmitter::new(writer)))
        }
        OutputFormat::Prometheus => {
            let submitter = PrometheusSubmitter::new()?;
            Ok(Box::new(match &output.path {
                Some(path) => submitter.with_output(path.clone()),
                None => submitter,
            }))
        }
    }
}

impl Engine {
    /// Build checks and replay sources from the current configuration.
    pub fn new(config: Arc<ConfigManager>) -> CheckResult<Self> {
        let current = config.get();
        let submitter = build_submitter(&current.output)?;
        Self::with_submitter(config, submitter)
    }

    pub fn with_submitter(config: Arc<ConfigManager>, submitter: Box<dyn MetricSubmitter>) -> CheckResult<Self> {
        let current = config.get();
        let hostname = current.engine.hostname.as_deref();

        let mut statement_checks = Vec::with_capacity(current.checks.len());
        for check_config in &current.checks {
            let source = FileReplaySource::from_glob(&check_config.name, &check_config.source)?;
            statement_checks.push(ScheduledStatementCheck {
                check: StatementCheck::new(check_config.clone(), hostname)?,
                source: Box::new(source),
                exhausted: false,
            });
        }

        let mut document_checks = Vec::with_capacity(current.documents.len());
        for document_config in &current.documents {
            let source = FileReplaySource::from_glob(&document_config.name, &document_config.source)?;
            document_checks.push(ScheduledDocumentCheck {
                check: DocumentCheck::new(document_config.clone(), hostname),
                source: Box::new(source),
                exhausted: false,
            });
        }

        Ok(Self {
            config,
            statement_checks,
            document_checks,
            submitter,
            error_stats: Arc::new(ErrorStats::new()),
            shutdown: Arc::new(Notify::new()),
            running: Arc::new(AtomicBool::new(false)),
            cycles: 0,
            start_time: Instant::now(),
        })
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle { notify: self.shutdown.clone(), running: self.running.clone() }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(AtomicOrdering::Acquire)
    }

    pub fn error_stats(&self) -> Arc<ErrorStats> {
        self.error_stats.clone()
    }

    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    fn all_exhausted(&self) -> bool {
        self.statement_checks.iter().all(|c| c.exhausted) && self.document_checks.iter().all(|c| c.exhausted)
    }

    fn record_failure(&self, check: &str, error: CheckError) {
        self.error_stats.record(&error);
        warn!(
            target: "statmetrics::engine",
            check,
            category = error.category(),
            recoverable = error.is_recoverable(),
            hint = ?error.recovery_hint(),
            error = %error,
            "Check cycle failed"
        );
    }

    /// Run every check that still has data once.
    pub async fn run_once(&mut self) -> EngineCycleReport {
        let mut report = EngineCycleReport::default();
        let mut failures = Vec::new();

        for scheduled in self.statement_checks.iter_mut().filter(|c| !c.exhausted) {
            match scheduled.check.check(scheduled.source.as_ref(), self.submitter.as_mut()).await {
                Ok(cycle) => {
                    report.checks_ok += 1;
                    report.metrics_submitted += cycle.metrics_submitted;
                }
                Err(CheckError::Source(SourceError::Exhausted { .. })) => {
                    info!(target: "statmetrics::engine", check = scheduled.check.name(), "Source exhausted");
                    scheduled.exhausted = true;
                    report.checks_exhausted += 1;
                }
                Err(e) => {
                    report.checks_failed += 1;
                    failures.push((scheduled.check.name().to_string(), e));
                }
            }
        }

        for scheduled in self.document_checks.iter_mut().filter(|c| !c.exhausted) {
            match scheduled.check.check(scheduled.source.as_ref(), self.submitter.as_mut()).await {
                Ok(document) => {
                    report.checks_ok += 1;
                    report.metrics_submitted += document.metrics_submitted;
                }
                Err(CheckError::Source(SourceError::Exhausted { .. })) => {
                    info!(target: "statmetrics::engine", check = scheduled.check.name(), "Source exhausted");
                    scheduled.exhausted = true;
                    report.checks_exhausted += 1;
                }
                Err(e) => {
                    report.checks_failed += 1;
                    failures.push((scheduled.check.name().to_string(), e));
                }
            }
        }

        for (check, error) in failures {
            self.record_failure(&check, error);
        }
        self.cycles += 1;
        report
    }

    /// Run until shutdown, ctrl-c, `max_cycles`, or every source is exhausted.
    pub async fn run(&mut self, max_cycles: Option<u64>) -> CheckResult<()> {
        let config = self.config.get();
        info!(
            target: "statmetrics::engine",
            version = ENGINE_VERSION,
            instance = %config.engine.instance_name,
            statement_checks = self.statement_checks.len(),
            document_checks = self.document_checks.len(),
            interval = ?config.engine.collection_interval,
            "Starting engine"
        );

        self.running.store(true, AtomicOrdering::Release);
        let shutdown = self.shutdown.clone();
        let mut ticker = interval(config.engine.collection_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        while self.is_running() {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.run_once().await;
                    debug!(
                        target: "statmetrics::engine",
                        cycle = self.cycles,
                        ok = report.checks_ok,
                        failed = report.checks_failed,
                        metrics = report.metrics_submitted,
                        "Engine cycle complete"
                    );
                    if max_cycles.is_some_and(|max| self.cycles >= max) {
                        info!(target: "statmetrics::engine", cycles = self.cycles, "Cycle limit reached");
                        break;
                    }
                    if self.all_exhausted() {
                        info!(target: "statmetrics::engine", "All sources exhausted");
                        break;
                    }
                }
                _ = signal::ctrl_c() => {
                    info!(target: "statmetrics::engine", "Received interrupt");
                    break;
                }
                _ = shutdown.notified() => {
                    break;
                }
            }
        }

        self.running.store(false, AtomicOrdering::Release);
        info!(
            target: "statmetrics::engine",
            cycles = self.cycles,
            errors = self.error_stats.total(),
            uptime_secs = self.uptime().as_secs(),
            "Engine stopped"
        );
        Ok(())
    }
}

// ============================================================================
// SECTION 15: CLI & COMMAND LINE INTERFACE
// ============================================================================

// ----------------------------------------------------------------------------
// 15.1 CLI Argument Parser
// ----------------------------------------------------------------------------

/// Statmetrics Engine CLI
#[derive(Parser, Debug)]
#[command(
    name = "statmetrics",
    author = "AIOps Team",
    version,
    about = "Incremental statement metrics for database checks",
    long_about = "Statmetrics turns consecutive snapshots of database statistics views \
                  into per-interval metrics: deltas with counter reset detection, ranked \
                  row limits, tag management and declarative document extraction."
)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "statmetrics.toml", env = "STATMETRICS_CONFIG")]
    pub config: PathBuf,

    /// Log level override
    #[arg(short, long, env = "STATMETRICS_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Log format override
    #[arg(long, value_enum)]
    pub log_format: Option<LogFormat>,

    /// Enable debug mode (equivalent to --log-level debug)
    #[arg(short, long)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run all configured checks on the collection interval (default)
    Run {
        /// Stop after this many cycles
        #[arg(long)]
        max_cycles: Option<u64>,

        /// Output format override
        #[arg(long, value_enum)]
        output: Option<OutputFormat>,
    },

    /// Run the configured document queries against one JSON file
    Extract {
        /// JSON document to extract from
        document: PathBuf,

        /// Only run this document check
        #[arg(long)]
        check: Option<String>,
    },

    /// Validate configuration file
    Validate {
        /// Show the parsed configuration
        #[arg(short, long)]
        verbose: bool,
    },

    /// Generate an example configuration file
    GenerateConfig {
        /// Output file path (stdout if not specified)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show version information
    Version,
}

// ----------------------------------------------------------------------------
// 15.2 Command Handlers
// ----------------------------------------------------------------------------

/// Handle the validate subcommand
fn handle_validate(config_path: &Path, verbose: bool) -> CheckResult<()> {
    println!("Validating configuration file: {}", config_path.display());

    match EngineConfig::load(config_path) {
        Ok(config) => {
            println!("✅ Configuration is valid!");

            if verbose {
                println!("\n📋 Parsed configuration:");
                println!("{}", "=".repeat(60));
                match config.to_toml() {
                    Ok(s) => println!("{}", s),
                    Err(e) => println!("Failed to serialize: {}", e),
                }
            }

            println!("\n📊 Configuration Summary:");
            println!("  • Instance name: {}", config.engine.instance_name);
            println!("  • Collection interval: {:?}", config.engine.collection_interval);
            println!("  • Output: {:?}", config.output.format);
            println!("  • Statement checks: {}", config.checks.len());
            for check in &config.checks {
                let cap = effective_row_cap(&check.row_limits()).unwrap_or(check.max_emitted_rows);
                println!(
                    "    - {} (key: {}, counters: {}, top {} by {})",
                    check.name,
                    check.key_columns.join("+"),
                    check.counter_columns.len(),
                    cap,
                    check.tiebreaker_column
                );
            }
            println!("  • Document checks: {}", config.documents.len());
            for document in &config.documents {
                println!("    - {} ({} queries)", document.name, document.queries.len());
            }

            Ok(())
        }
        Err(e) => {
            println!("❌ Configuration validation failed!");
            println!("Error: {}", e);
            Err(CheckError::Config(e))
        }
    }
}

/// Handle the generate-config subcommand
fn handle_generate_config(output: Option<&Path>) -> CheckResult<()> {
    match output {
        Some(path) => {
            generate_default_config(path)?;
            println!("✅ Example configuration written to: {}", path.display());
        }
        None => {
            println!("{}", EngineConfig::example().to_toml()?);
        }
    }
    Ok(())
}

/// Handle the extract subcommand; returns the number of metrics written
async fn handle_extract(config: &EngineConfig, document_path: &Path, only: Option<&str>) -> CheckResult<usize> {
    let content = tokio::fs::read_to_string(document_path).await.map_err(|e| SourceError::Io {
        path: document_path.to_path_buf(),
        message: e.to_string(),
    })?;
    let document: JsonValue = serde_json::from_str(&content).map_err(|e| SourceError::InvalidResponse {
        name: document_path.display().to_string(),
        message: e.to_string(),
    })?;

    let mut submitter = JsonLinesSubmitter::new(io::stdout());
    let mut written = 0;
    for document_config in config.documents.iter().filter(|d| only.map_or(true, |name| d.name == name)) {
        let check = DocumentCheck::new(document_config.clone(), config.engine.hostname.as_deref());
        let run = check.run_document(&document);
        for skipped in &run.skipped {
            warn!(target: "statmetrics::document", check = check.name(), error = %skipped, "Metric skipped");
        }
        written += run.submit(&mut submitter)?;
    }
    submitter.flush()?;
    Ok(written)
}

/// Handle the version subcommand
fn handle_version() {
    println!("📊 {} v{}", ENGINE_FULL_NAME, ENGINE_VERSION);
    println!();
    println!("Build Information:");
    println!("  • Target: {}", std::env::consts::ARCH);
    println!("  • OS: {}", std::env::consts::OS);
    println!();
    println!("Features:");
    println!("  • Derivative rows with counter reset detection");
    println!("  • Ranked row limits and TOP/LIMIT query rendering");
    println!("  • Statement obfuscation and query signatures");
    println!("  • Keyed/keyless tag management");
    println!("  • Document metric extraction");
    println!("  • Outputs: JSON lines, Prometheus text exposition");
}

// ============================================================================
// SECTION 16: MAIN ENTRY POINT
// ============================================================================

/// Main entry point for the statmetrics binary
#[tokio::main]
async fn main() -> AnyhowResult<()> {
    let cli = Cli::parse();

    // Subcommands that don't need full initialization
    match &cli.command {
        Some(Commands::Version) => {
            handle_version();
            return Ok(());
        }
        Some(Commands::GenerateConfig { output }) => {
            handle_generate_config(output.as_deref())?;
            return Ok(());
        }
        Some(Commands::Validate { verbose }) => {
            handle_validate(&cli.config, *verbose)?;
            return Ok(());
        }
        _ => {}
    }

    let manager = ConfigManager::from_file(&cli.config)
        .with_context(|| format!("Failed to load config from {}", cli.config.display()))?;
    let config = manager.get();

    let mut logging_config = config.logging.clone();
    if let Some(level) = &cli.log_level {
        logging_config.level = level.clone();
    }
    if let Some(format) = cli.log_format {
        logging_config.format = format;
    }
    if cli.debug {
        logging_config.level = "debug".into();
    }
    let _log_guard = init_logging(&logging_config)?;

    info!("📊 {} v{}", ENGINE_FULL_NAME, ENGINE_VERSION);

    let (max_cycles, output) = match cli.command {
        Some(Commands::Extract { document, check }) => {
            let written = handle_extract(&config, &document, check.as_deref())
                .await
                .with_context(|| format!("Failed to extract metrics from {}", document.display()))?;
            info!(target: "statmetrics::document", metrics = written, "Extraction complete");
            return Ok(());
        }
        Some(Commands::Run { max_cycles, output }) => (max_cycles, output),
        _ => (None, None),
    };

    if let Some(format) = output {
        let mut overridden = (*config).clone();
        overridden.output.format = format;
        manager.update(overridden)?;
    }

    let mut engine = Engine::new(Arc::new(manager)).context("Failed to build checks")?;
    if let Err(e) = engine.run(max_cycles).await {
        error!(target: "statmetrics::engine", error = %e, "Engine failed");
        return Err(e.into());
    }

    let stats = engine.error_stats();
    if stats.total() > 0 {
        warn!(
            target: "statmetrics::engine",
            total = stats.total(),
            by_category = ?stats.snapshot(),
            "Completed with check errors"
        );
    }

    Ok(())
}

// ============================================================================
// SECTION 17: TESTS
// ============================================================================


#[cfg(test)]
mod config_tests {
    use super::*;
    use std::io::Write as _;

    const BASIC: &str = r#"
[engine]
instance_name = "test"
collection_interval = "5s"

[[checks]]
name = "pg"
source = "snapshots/*.json"
key_columns = ["queryid"]
counter_columns = ["calls", "total_exec_time"]
tiebreaker_column = "total_exec_time"
tags = ["env:test"]

[checks.limits.calls]
max_rows = 50

[checks.metric_types]
calls = "monotonic_count"

[output]
format = "prometheus"
"#;

    #[test]
    fn test_config_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.engine.collection_interval, Duration::from_secs(DEFAULT_COLLECTION_INTERVAL_SECS));
        assert_eq!(config.output.format, OutputFormat::JsonLines);
        assert_eq!(config.logging.format, LogFormat::Pretty);
        assert!(config.validate_all().is_ok());
    }

    #[test]
    fn test_parse_statement_check() {
        let config = EngineConfig::from_toml_str(BASIC).unwrap();
        let check = &config.checks[0];

        assert_eq!(config.engine.collection_interval, Duration::from_secs(5));
        assert_eq!(config.output.format, OutputFormat::Prometheus);
        assert_eq!(check.fetch_row_limit, DEFAULT_FETCH_ROW_LIMIT);
        assert_eq!(check.max_emitted_rows, DEFAULT_MAX_EMITTED_ROWS);
        assert!(check.obfuscate_statements);
        assert_eq!(check.metric_types.get("calls"), Some(&MetricType::MonotonicCount));

        let limits = check.row_limits();
        assert_eq!(limits.len(), 2);
        assert_eq!(effective_row_cap(&limits), Some(50));
        assert_eq!(check.key_spec(), RowKeySpec::new(["queryid"]));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(BASIC.as_bytes()).unwrap();

        let config = EngineConfig::load(file.path()).unwrap();
        assert_eq!(config.engine.instance_name, "test");

        let manager = ConfigManager::from_file(file.path()).unwrap();
        assert_eq!(manager.get().checks.len(), 1);
        assert!(manager.reload().unwrap());
    }

    #[test]
    fn test_missing_file() {
        let err = EngineConfig::load(Path::new("/nonexistent/statmetrics.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound { .. }));
    }

    #[test]
    fn test_interval_too_short_rejected() {
        let toml = "[engine]\ncollection_interval = \"50ms\"\n";
        assert!(matches!(EngineConfig::from_toml_str(toml), Err(ConfigError::ValidationFailed(_))));
    }

    #[test]
    fn test_duplicate_check_names_rejected() {
        let duplicated = format!("{}\n{}", BASIC, BASIC.split("[[checks]]").nth(1).map(|c| format!("[[checks]]{}", c.split("[output]").next().unwrap_or(""))).unwrap());
        let err = EngineConfig::from_toml_str(&duplicated).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref message, .. } if message.contains("duplicate")));
    }

    #[test]
    fn test_cross_field_rules() {
        let with = |extra: &str| BASIC.replace("tags = [\"env:test\"]", &format!("tags = [\"env:test\"]\n{}", extra));

        let indicators = EngineConfig::from_toml_str(&with("execution_indicators = [\"rows\"]"));
        assert!(matches!(indicators, Err(ConfigError::InvalidValue { ref field, .. }) if field.ends_with("execution_indicators")));

        let template = EngineConfig::from_toml_str(&with("query_template = \"SELECT TOP {top} {columns}\""));
        assert!(matches!(template, Err(ConfigError::InvalidValue { ref field, .. }) if field.ends_with("query_template")));

        let overlap = BASIC.replace("key_columns = [\"queryid\"]", "key_columns = [\"queryid\", \"calls\"]");
        assert!(matches!(EngineConfig::from_toml_str(&overlap), Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_tiebreaker_must_be_a_counter() {
        let uncounted = BASIC.replace("tiebreaker_column = \"total_exec_time\"\n", "");
        let err = EngineConfig::from_toml_str(&uncounted).unwrap_err();
        assert!(
            matches!(err, ConfigError::InvalidValue { ref field, ref message } if field == "checks.pg.tiebreaker_column" && message.contains(DEFAULT_TIEBREAKER_COLUMN)),
            "{}",
            err
        );

        let renamed = BASIC.replace("tiebreaker_column = \"total_exec_time\"", "tiebreaker_column = \"calls\"");
        assert!(EngineConfig::from_toml_str(&renamed).is_ok());
    }

    #[test]
    fn test_example_config_round_trips() {
        let text = EngineConfig::example().to_toml().unwrap();
        let parsed = EngineConfig::from_toml_str(&text).unwrap();

        assert_eq!(parsed.checks.len(), 1);
        assert_eq!(parsed.documents.len(), 1);
        assert_eq!(parsed.documents[0].queries[0].groups[0].key_tag, "lock_type");
        assert_eq!(parsed.checks[0].tag_columns.get("datname").map(String::as_str), Some("db"));
    }

    #[test]
    fn test_generate_default_config_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("statmetrics.toml");
        generate_default_config(&path).unwrap();
        assert!(EngineConfig::load(&path).is_ok());
    }
}

#[cfg(test)]
mod tag_manager_tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    fn tags(manager: &TagManager) -> Vec<String> {
        manager.get_tags().iter().map(|t| t.to_string()).collect()
    }

    #[test]
    fn test_set_and_delete_single_value() {
        let mut manager = TagManager::new();
        manager.set_tag(Some("host"), "a", false);
        manager.set_tag(Some("host"), "b", false);
        assert_eq!(tags(&manager), vec!["host:a", "host:b"]);

        assert!(manager.delete_tag(Some("host"), Some("a")));
        assert_eq!(tags(&manager), vec!["host:b"]);
    }

    #[test]
    fn test_keyless_and_keyed_same_literal_coexist() {
        let mut manager = TagManager::new();
        manager.set_tag(None, "x", false);
        manager.set_tag(Some("k"), "x", false);
        assert_eq!(tags(&manager), vec!["k:x", "x"]);

        assert!(manager.delete_tag(None, Some("x")));
        assert_eq!(tags(&manager), vec!["k:x"]);
    }

    #[test]
    fn test_keyed_tags_sorted_before_keyless() {
        let mut manager = TagManager::new();
        manager.set_tag(None, "standalone", false);
        manager.set_tag(Some("zone"), "b", false);
        manager.set_tag(Some("env"), "prod", false);
        manager.set_tag(Some("zone"), "a", false);
        assert_eq!(tags(&manager), vec!["env:prod", "zone:b", "zone:a", "standalone"]);
    }

    #[test]
    fn test_replace_and_idempotence() {
        let mut manager = TagManager::new();
        manager.set_tag(Some("env"), "dev", false);
        manager.set_tag(Some("env"), "dev", false);
        assert_eq!(tags(&manager), vec!["env:dev"]);

        manager.set_tag(Some("env"), "prod", true);
        assert_eq!(tags(&manager), vec!["env:prod"]);
    }

    #[test]
    fn test_delete_whole_key_and_misses() {
        let mut manager = TagManager::from_tag_list(["role:primary", "role:replica", "db:main"]);
        assert!(manager.delete_tag(Some("role"), None));
        assert_eq!(tags(&manager), vec!["db:main"]);

        assert!(!manager.delete_tag(Some("role"), None));
        assert!(!manager.delete_tag(Some("db"), Some("other")));
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn test_cache_lifecycle() {
        let mut manager = TagManager::new();
        assert!(!manager.is_cache_valid());

        manager.set_tag(Some("a"), "1", false);
        assert!(!manager.is_cache_valid());
        manager.get_tags();
        assert!(manager.is_cache_valid());

        // A miss changes nothing and keeps the cache.
        assert!(!manager.delete_tag(Some("missing"), None));
        assert!(manager.is_cache_valid());

        manager.set_tags_from_list(["b:2"], false);
        assert!(!manager.is_cache_valid());
        manager.get_tags();
        assert!(manager.delete_tag(Some("b"), Some("2")));
        assert!(!manager.is_cache_valid());
    }

    #[test]
    fn test_returned_list_is_a_copy() {
        let mut manager = TagManager::from_tag_list(["env:prod"]);
        let mut copy = manager.get_tags();
        copy.push(CompactString::from("injected"));
        copy[0] = CompactString::from("env:dev");

        assert_eq!(tags(&manager), vec!["env:prod"]);
        manager.set_tag(None, "x", false);
        assert_eq!(copy.len(), 2);
    }

    #[test]
    fn test_set_tags_from_list_replace_only_touches_listed_keys() {
        let mut manager = TagManager::from_tag_list(["env:dev", "team:a", "x"]);
        manager.set_tags_from_list(["env:prod", "env:staging"], true);
        assert_eq!(tags(&manager), vec!["env:prod", "env:staging", "team:a", "x"]);

        manager.set_tags_from_list(["y"], true);
        assert_eq!(tags(&manager), vec!["env:prod", "env:staging", "team:a", "y"]);
    }

    #[test]
    fn test_malformed_entries_are_keyless() {
        let manager = TagManager::from_tag_list([":value", "key:", "a:b:c"]);
        assert_eq!(manager.values(None), &[CompactString::from(":value"), CompactString::from("key:")]);
        assert_eq!(manager.values(Some("a")), &[CompactString::from("b:c")]);
    }

    #[test]
    fn test_normalized_variants() {
        let mut manager = TagManager::with_normalizer(default_tag_normalizer());
        manager.set_tag_normalized(Some("Service"), "My Service-Name", false);
        manager.set_tags_from_list_normalized(["Env:Prod Value"], false);
        assert_eq!(tags(&manager), vec!["Service:my_service_name", "env:prod_value"]);

        assert!(manager.delete_tag_normalized(Some("Service"), Some("MY SERVICE NAME")));
        assert_eq!(tags(&manager), vec!["env:prod_value"]);
    }

    #[test]
    fn test_normalized_variants_without_normalizer() {
        let mut manager = TagManager::new();
        manager.set_tag_normalized(Some("k"), "Mixed Case", false);
        assert_eq!(tags(&manager), vec!["k:Mixed Case"]);
    }

    #[rstest]
    #[case("Foo Bar", "foo_bar")]
    #[case("a - b", "a_b")]
    #[case("__x__", "x")]
    #[case("metric_._name", "metric.name")]
    #[case("A/B(C)", "a_b_c")]
    #[case("env:Prod", "env:prod")]
    fn test_normalize_tag(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(normalize_tag(input), expected);
    }
}

#[cfg(test)]
mod derivative_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn statement(id: &str, calls: i64, total_time: i64) -> Row {
        row! { "query_signature" => id, "calls" => calls, "total_time" => total_time, "query" => "SELECT ?" }
    }

    fn counters() -> ColumnSet {
        ColumnSet::new(["calls", "total_time"])
    }

    fn key(row: &Row) -> Option<RowKey> {
        RowKeySpec::new(["query_signature"]).key_for(row)
    }

    #[test]
    fn test_first_seen_then_delta_then_reset() {
        let mut metrics = StatementMetrics::new();

        let out = metrics.compute_derivative_rows(vec![statement("Q1", 10, 100)], &counters(), key);
        assert!(out.is_empty());
        assert_eq!(metrics.last_stats().first_seen, 1);

        let out = metrics.compute_derivative_rows(vec![statement("Q1", 15, 160)], &counters(), key);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].numeric("calls"), Some(Numeric::Int(5)));
        assert_eq!(out[0].numeric("total_time"), Some(Numeric::Int(60)));
        assert_eq!(out[0].text("query"), Some("SELECT ?"));

        let out = metrics.compute_derivative_rows(vec![statement("Q1", 3, 20)], &counters(), key);
        assert!(out.is_empty());
        assert_eq!(metrics.last_stats().resets, 1);
        let baseline = metrics.baseline(&RowKey::new(["Q1"])).unwrap();
        assert_eq!(baseline.numeric("calls"), Some(Numeric::Int(3)));

        let out = metrics.compute_derivative_rows(vec![statement("Q1", 4, 25)], &counters(), key);
        assert_eq!(out[0].numeric("calls"), Some(Numeric::Int(1)));
        assert_eq!(out[0].numeric("total_time"), Some(Numeric::Int(5)));
    }

    #[test]
    fn test_state_is_replaced_wholesale() {
        let mut metrics = StatementMetrics::new();
        metrics.compute_derivative_rows(vec![statement("A", 1, 1), statement("B", 1, 1)], &counters(), key);
        assert_eq!(metrics.len(), 2);

        let out = metrics.compute_derivative_rows(vec![statement("A", 2, 2)], &counters(), key);
        assert_eq!(out.len(), 1);
        assert_eq!(metrics.len(), 1);
        assert!(metrics.baseline(&RowKey::new(["B"])).is_none());

        // B comes back and is first-seen again.
        let out = metrics.compute_derivative_rows(vec![statement("A", 3, 3), statement("B", 9, 9)], &counters(), key);
        assert_eq!(out.len(), 1);
        assert_eq!(metrics.last_stats().first_seen, 1);
    }

    #[test]
    fn test_duplicate_keys_are_summed() {
        let mut metrics = StatementMetrics::new();
        metrics.compute_derivative_rows(vec![statement("Q", 1, 10), statement("Q", 2, 20)], &counters(), key);
        assert_eq!(metrics.last_stats().merged_duplicates, 1);

        let out = metrics.compute_derivative_rows(vec![statement("Q", 2, 15), statement("Q", 4, 30)], &counters(), key);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].numeric("calls"), Some(Numeric::Int(3)));
        assert_eq!(out[0].numeric("total_time"), Some(Numeric::Int(15)));
    }

    #[test]
    fn test_duplicate_sum_overflow_is_counted() {
        let mut metrics = StatementMetrics::new();
        metrics.compute_derivative_rows(vec![statement("Q", i64::MAX, 10), statement("Q", 1, 20)], &counters(), key);

        let stats = metrics.last_stats();
        assert_eq!(stats.merged_duplicates, 1);
        assert_eq!(stats.merge_overflows, 1);

        let baseline = metrics.baseline(&RowKey::new(["Q"])).unwrap();
        assert_eq!(baseline.numeric("calls"), Some(Numeric::Int(i64::MAX)));
        assert_eq!(baseline.numeric("total_time"), Some(Numeric::Int(30)));
    }

    #[test]
    fn test_missing_counter_column_is_dropped_and_counted() {
        let mut metrics = StatementMetrics::new();
        metrics.compute_derivative_rows(vec![statement("Q", 10, 100)], &counters(), key);

        let partial = row! { "query_signature" => "Q", "calls" => 12i64, "total_time" => "n/a" };
        let out = metrics.compute_derivative_rows(vec![partial], &counters(), key);

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].numeric("calls"), Some(Numeric::Int(2)));
        assert!(!out[0].contains("total_time"));
        assert_eq!(metrics.last_stats().missing_columns, 1);
    }

    #[test]
    fn test_unkeyed_rows_are_skipped() {
        let mut metrics = StatementMetrics::new();
        let unkeyed = row! { "calls" => 1i64, "total_time" => 1i64 };
        let out = metrics.compute_derivative_rows(vec![unkeyed, statement("Q", 1, 1)], &counters(), key);

        assert!(out.is_empty());
        assert_eq!(metrics.last_stats().unkeyed, 1);
        assert_eq!(metrics.len(), 1);
    }

    #[test]
    fn test_float_counters_produce_float_deltas() {
        let mut metrics = StatementMetrics::new();
        let row = |t: f64| row! { "query_signature" => "Q", "calls" => 1i64, "total_time" => t };
        metrics.compute_derivative_rows(vec![row(1.5)], &counters(), key);
        let out = metrics.compute_derivative_rows(vec![row(2.25)], &counters(), key);

        assert_eq!(out[0].numeric("total_time"), Some(Numeric::Float(0.75)));
        assert_eq!(out[0].numeric("calls"), Some(Numeric::Int(0)));
    }

    #[test]
    fn test_unchanged_rows_are_emitted_by_default() {
        let mut metrics = StatementMetrics::new();
        metrics.compute_derivative_rows(vec![statement("Q", 5, 50)], &counters(), key);
        let out = metrics.compute_derivative_rows(vec![statement("Q", 5, 50)], &counters(), key);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn test_execution_indicators_suppress_idle_rows() {
        let options = DerivativeOptions { execution_indicators: ColumnSet::new(["calls"]), skip_unchanged: false };
        let mut metrics = StatementMetrics::with_options(options);
        metrics.compute_derivative_rows(vec![statement("idle", 5, 50), statement("busy", 1, 1)], &counters(), key);

        let out = metrics.compute_derivative_rows(vec![statement("idle", 5, 70), statement("busy", 2, 2)], &counters(), key);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].text("query_signature"), Some("busy"));
        assert_eq!(metrics.last_stats().unchanged, 1);
    }

    #[test]
    fn test_skip_unchanged() {
        let options = DerivativeOptions { skip_unchanged: true, ..DerivativeOptions::default() };
        let mut metrics = StatementMetrics::with_options(options);
        metrics.compute_derivative_rows(vec![statement("Q", 5, 50)], &counters(), key);
        assert!(metrics.compute_derivative_rows(vec![statement("Q", 5, 50)], &counters(), key).is_empty());
        assert_eq!(metrics.compute_derivative_rows(vec![statement("Q", 5, 51)], &counters(), key).len(), 1);
    }

    #[test]
    fn test_clear_forgets_baselines() {
        let mut metrics = StatementMetrics::new();
        metrics.compute_derivative_rows(vec![statement("Q", 1, 1)], &counters(), key);
        metrics.clear();
        assert!(metrics.is_empty());
        assert!(metrics.compute_derivative_rows(vec![statement("Q", 2, 2)], &counters(), key).is_empty());
    }
}


#[cfg(test)]
mod normalizer_tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    #[rstest]
    #[case("SELECT * FROM users WHERE id = 42 AND name = 'bob'", "SELECT * FROM users WHERE id = ? AND name = ?")]
    #[case("select a from t where id in (1, 2, 3)", "select a from t where id IN (?)")]
    #[case("UPDATE t\n   SET x = 'it''s'\n WHERE y > 1.5", "UPDATE t SET x = ? WHERE y > ?")]
    #[case("SELECT col1 FROM table_2", "SELECT col1 FROM table_2")]
    fn test_obfuscation(#[case] input: &str, #[case] expected: &str) {
        let obfuscator = SqlObfuscator::new().unwrap();
        assert_eq!(obfuscator.obfuscate(input), expected);
    }

    #[test]
    fn test_signature_ignores_literals() {
        let obfuscator = SqlObfuscator::new().unwrap();
        let a = compute_query_signature(&obfuscator.obfuscate("SELECT * FROM t WHERE id = 1"));
        let b = compute_query_signature(&obfuscator.obfuscate("SELECT *  FROM t WHERE id = 2"));
        let c = compute_query_signature(&obfuscator.obfuscate("SELECT * FROM u WHERE id = 1"));

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 16);
    }

    #[test]
    fn test_normalizer_writes_signature_and_skips_unreadable() {
        let normalizer = RowNormalizer::new(Some("query"), true).unwrap();
        let rows = vec![
            row! { "query" => "SELECT 1", "calls" => 1i64 },
            row! { "query" => ColumnValue::Null, "calls" => 1i64 },
            row! { "calls" => 1i64 },
        ];

        let (out, stats) = normalizer.normalize(rows);
        assert_eq!(stats, NormalizeStats { rows_in: 3, rows_out: 1, unreadable_statements: 2 });
        assert_eq!(out[0].text("query"), Some("SELECT ?"));
        assert_eq!(out[0].text(QUERY_SIGNATURE_COLUMN), Some(compute_query_signature("SELECT ?").as_str()));
    }

    #[test]
    fn test_passthrough_keeps_rows() {
        let (out, stats) = RowNormalizer::passthrough().normalize(vec![row! { "calls" => 1i64 }]);
        assert_eq!(out.len(), 1);
        assert_eq!(stats.unreadable_statements, 0);
        assert!(!out[0].contains(QUERY_SIGNATURE_COLUMN));
    }

    #[test]
    fn test_long_statements_are_truncated() {
        let obfuscator = SqlObfuscator::new().unwrap();
        let long = format!("SELECT '{}' FROM t", "é".repeat(MAX_STATEMENT_LENGTH));
        assert!(obfuscator.obfuscate(&long).len() <= MAX_STATEMENT_LENGTH);
    }

    #[test]
    fn test_column_resolver_caches_until_invalidated() {
        let mut resolver = ColumnResolver::new(ColumnSet::new(["calls", "total_time", "rows"]));
        assert!(resolver.cached().is_none());

        let available: AHashSet<CompactString> = ["calls", "rows", "other"].into_iter().map(CompactString::from).collect();
        let resolved = resolver.resolve(&available).clone();
        assert_eq!(resolved.available, ColumnSet::new(["calls", "rows"]));
        assert_eq!(resolved.missing, ColumnSet::new(["total_time"]));

        let everything: AHashSet<CompactString> = ["calls", "rows", "total_time"].into_iter().map(CompactString::from).collect();
        assert_eq!(resolver.resolve(&everything), &resolved);

        resolver.invalidate();
        assert_eq!(resolver.resolve(&everything).available.len(), 3);
    }
}


#[cfg(test)]
mod submitter_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn tags(values: &[&str]) -> Tags {
        values.iter().map(|v| CompactString::from(*v)).collect()
    }

    #[test]
    fn test_aggregator_stub_records_everything() {
        let mut stub = AggregatorStub::new();
        stub.gauge("a", 1.0, &tags(&["env:prod"])).unwrap();
        stub.rate("b", 2.0, &[]).unwrap();
        stub.monotonic_count("c", 3.0, &[]).unwrap();
        stub.count("a", 4.0, &tags(&["env:dev"])).unwrap();
        stub.service_check("db.can_connect", ServiceCheckStatus::Ok, &[], None).unwrap();

        assert_eq!(stub.metric_count(), 4);
        assert_eq!(stub.metrics("a").len(), 2);
        assert_eq!(stub.find_metric("a", &["env:dev"]).map(|m| m.value), Some(4.0));
        assert_eq!(stub.find_metric("b", &[]).map(|m| m.metric_type), Some(MetricType::Rate));
        assert_eq!(stub.metric_names().into_iter().collect::<Vec<_>>(), vec!["a", "b", "c"]);
        assert_eq!(stub.service_checks("db.can_connect")[0].status, ServiceCheckStatus::Ok);

        stub.reset();
        assert_eq!(stub.metric_count(), 0);
    }

    #[test]
    fn test_json_lines_output() {
        let mut submitter = JsonLinesSubmitter::new(Vec::new());
        submitter.monotonic_count("db.queries.calls", 5.0, &tags(&["db:main"])).unwrap();
        submitter
            .service_check("db.queries.can_connect", ServiceCheckStatus::Critical, &[], Some("refused"))
            .unwrap();
        assert_eq!(submitter.written(), 2);

        let output = String::from_utf8(submitter.into_inner()).unwrap();
        let lines: Vec<JsonValue> = output.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(lines[0]["type"], "monotonic_count");
        assert_eq!(lines[0]["name"], "db.queries.calls");
        assert_eq!(lines[0]["value"], 5.0);
        assert_eq!(lines[0]["tags"], json!(["db:main"]));
        assert!(lines[0]["timestamp"].as_str().is_some());
        assert_eq!(lines[1]["status"], "CRITICAL");
        assert_eq!(lines[1]["message"], "refused");
    }

    #[test]
    fn test_prometheus_exposition() {
        let mut submitter = PrometheusSubmitter::new().unwrap();
        submitter.count("db.queries.calls", 5.0, &tags(&["db:main", "primary"])).unwrap();
        submitter.count("db.queries.calls", 2.0, &tags(&["db:other"])).unwrap();
        submitter
            .service_check("db.queries.can_connect", ServiceCheckStatus::Critical, &[], None)
            .unwrap();

        let text = submitter.render().unwrap();
        assert!(text.contains(r#"db_queries_calls{db="main",tag="primary"}"#), "{}", text);
        assert!(text.contains(r#"db_queries_calls{db="other",tag=""}"#), "{}", text);
        assert!(text.contains(r#"service_check_status{check="db.queries.can_connect"} 2"#), "{}", text);
    }

    #[test]
    fn test_prometheus_counters_and_tagged_service_checks() {
        let mut submitter = PrometheusSubmitter::new().unwrap();
        submitter.count("db.queries.calls", 5.0, &tags(&["db:main"])).unwrap();
        submitter.count("db.queries.calls", 2.0, &tags(&["db:main"])).unwrap();
        submitter.monotonic_count("docdb.opcounters", 40.0, &tags(&["op:query"])).unwrap();
        submitter.monotonic_count("docdb.opcounters", 55.0, &tags(&["op:query"])).unwrap();
        submitter.rate("docdb.locks.acquire_count", 1.5, &[]).unwrap();
        submitter
            .service_check("db.queries.can_connect", ServiceCheckStatus::Warning, &tags(&["db:main", "env:prod"]), None)
            .unwrap();

        let text = submitter.render().unwrap();
        assert!(text.contains("# TYPE db_queries_calls counter"), "{}", text);
        assert!(text.contains(r#"db_queries_calls{db="main"} 7"#), "{}", text);
        assert!(text.contains(r#"docdb_opcounters{op="query"} 55"#), "{}", text);
        assert!(text.contains("# TYPE docdb_locks_acquire_count gauge"), "{}", text);
        assert!(
            text.contains(r#"service_check_status{check="db.queries.can_connect",db="main",env="prod"} 1"#),
            "{}",
            text
        );

        let negative = submitter.count("db.queries.calls", -1.0, &tags(&["db:main"]));
        assert!(matches!(negative, Err(OutputError::InvalidValue { .. })));
        let retyped = submitter.gauge("db.queries.calls", 1.0, &tags(&["db:main"]));
        assert!(matches!(retyped, Err(OutputError::Registry(_))));
    }

    #[test]
    fn test_prometheus_flush_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("statmetrics.prom");
        let mut submitter = PrometheusSubmitter::new().unwrap().with_output(path.clone());
        submitter.gauge("up", 1.0, &[]).unwrap();
        submitter.flush().unwrap();

        assert!(fs::read_to_string(&path).unwrap().contains("up"));
    }

    #[test]
    fn test_emitter_maps_columns_and_tags() {
        let emitter = StatementMetricEmitter::new("db.queries.")
            .with_mapping("calls", MetricType::MonotonicCount)
            .with_mapping("rows", MetricType::Count)
            .with_tag_column("datname", "db");
        let manager = TagManager::from_tag_list(["env:test"]);
        let rows = vec![
            row! { "calls" => 3i64, "rows" => 30i64, "datname" => "main" },
            row! { "calls" => 1i64 },
        ];

        let mut stub = AggregatorStub::new();
        let stats = emitter.emit(&rows, &manager, &mut stub).unwrap();

        assert_eq!(stats, EmitStats { rows: 2, metrics: 3, missing_values: 1, dropped_tags: 0 });
        let calls = stub.find_metric("db.queries.calls", &["env:test", "db:main"]).unwrap();
        assert_eq!(calls.value, 3.0);
        assert_eq!(calls.metric_type, MetricType::MonotonicCount);
        assert_eq!(stub.metrics("db.queries.calls")[1].tags.as_slice(), &[CompactString::from("env:test")]);
    }

    #[test]
    fn test_emitter_caps_tags_per_metric() {
        let emitter = StatementMetricEmitter::new("db.queries")
            .with_mapping("calls", MetricType::Count)
            .with_tag_column("datname", "db")
            .with_tag_column("rolname", "user");
        let manager = TagManager::from_tag_list((0..MAX_TAGS_PER_METRIC - 1).map(|i| format!("k{}:v", i)));
        let rows = vec![row! { "calls" => 1i64, "datname" => "main", "rolname" => "app" }];

        let mut stub = AggregatorStub::new();
        let stats = emitter.emit(&rows, &manager, &mut stub).unwrap();

        assert_eq!(stats.dropped_tags, 1);
        let submitted = &stub.metrics("db.queries.calls")[0].tags;
        assert_eq!(submitted.len(), MAX_TAGS_PER_METRIC);
        assert!(submitted.iter().any(|t| t.as_str() == "db:main"));
        assert!(!submitted.iter().any(|t| t.as_str() == "user:app"));
    }
}

#[cfg(test)]
mod pipeline_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const SNAPSHOTS: [&str; 3] = [
        r#"[
            {"query": "SELECT * FROM t WHERE id = 1", "db": "main", "calls": 10, "total_elapsed_time": 100},
            {"query": "SELECT * FROM t WHERE id = 2", "db": "main", "calls": 5, "total_elapsed_time": 50},
            {"query": "UPDATE t SET x = 'a'", "db": "main", "calls": 1, "total_elapsed_time": 10}
        ]"#,
        r#"{"rows": [
            {"query": "SELECT * FROM t WHERE id = 1", "db": "main", "calls": 12, "total_elapsed_time": 130},
            {"query": "SELECT * FROM t WHERE id = 2", "db": "main", "calls": 6, "total_elapsed_time": 60},
            {"query": "UPDATE t SET x = 'b'", "db": "main", "calls": 4, "total_elapsed_time": 400}
        ]}"#,
        r#"[
            {"query": "SELECT * FROM t WHERE id = 1", "db": "main", "calls": 13, "total_elapsed_time": 131},
            {"query": "SELECT * FROM t WHERE id = 2", "db": "main", "calls": 6, "total_elapsed_time": 60},
            {"query": "UPDATE t SET x = 'c'", "db": "main", "calls": 2, "total_elapsed_time": 20}
        ]"#,
    ];

    fn write_snapshots(dir: &Path, prefix: &str, contents: &[&str]) -> String {
        for (i, content) in contents.iter().enumerate() {
            fs::write(dir.join(format!("{}-{:03}.json", prefix, i + 1)), content).unwrap();
        }
        dir.join(format!("{}-*.json", prefix)).display().to_string()
    }

    fn check_config(source: String) -> StatementCheckConfig {
        StatementCheckConfig {
            name: "sqlserver".into(),
            source,
            key_columns: vec!["query_signature".into()],
            optional_key_columns: vec!["db".into()],
            counter_columns: vec!["calls".into(), "total_elapsed_time".into(), "rows".into()],
            statement_column: Some("query".into()),
            max_emitted_rows: 1,
            tag_columns: [("db".to_string(), "db".to_string())].into_iter().collect(),
            tags: vec!["env:test".into()],
            query_template: Some("SELECT TOP {limit} {column_sums} FROM sys.dm_exec_query_stats".into()),
            ..StatementCheckConfig::default()
        }
    }

    #[derive(Debug)]
    struct FailingSource;

    #[async_trait]
    impl RowSource for FailingSource {
        fn name(&self) -> &str {
            "failing"
        }

        async fn available_columns(&self) -> SourceResult<AHashSet<CompactString>> {
            Err(SourceError::ConnectionFailed { name: "failing".into(), message: "connection refused".into() })
        }

        async fn fetch_rows(&self, _request: &FetchRequest) -> SourceResult<Vec<Row>> {
            Err(SourceError::ConnectionFailed { name: "failing".into(), message: "connection refused".into() })
        }
    }

    #[tokio::test]
    async fn test_replayed_snapshots_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let pattern = write_snapshots(dir.path(), "stats", &SNAPSHOTS);
        let source = FileReplaySource::from_glob("sqlserver", &pattern).unwrap();
        let mut check = StatementCheck::new(check_config(pattern), Some("db1")).unwrap();
        let mut stub = AggregatorStub::new();

        // First snapshot only establishes baselines.
        let first = check.check(&source, &mut stub).await.unwrap();
        assert_eq!(first.rows_fetched, 3);
        assert_eq!(first.derivative.merged_duplicates, 1);
        assert_eq!(first.derivative.first_seen, 2);
        assert_eq!(stub.metric_count(), 0);
        assert_eq!(check.counter_columns(), ColumnSet::new(["calls", "total_elapsed_time"]));

        // The heavier UPDATE wins the single emitted slot.
        let second = check.check(&source, &mut stub).await.unwrap();
        assert_eq!(second.rows_emitted, 1);
        let calls = stub.find_metric("db.queries.calls", &["env:test", "host:db1", "db:main"]).unwrap();
        assert_eq!(calls.value, 3.0);
        assert_eq!(calls.metric_type, MetricType::Count);
        assert_eq!(stub.metrics("db.queries.total_elapsed_time")[0].value, 390.0);

        // UPDATE resets; the merged SELECT moves by one call.
        stub.reset();
        let third = check.check(&source, &mut stub).await.unwrap();
        assert_eq!(third.derivative.resets, 1);
        assert_eq!(stub.metrics("db.queries.calls")[0].value, 1.0);
        assert_eq!(stub.metrics("db.queries.total_elapsed_time")[0].value, 1.0);

        let exhausted = check.check(&source, &mut stub).await.unwrap_err();
        assert!(matches!(exhausted, CheckError::Source(SourceError::Exhausted { .. })));

        let service_checks = stub.service_checks("db.queries.can_connect");
        assert_eq!(service_checks.len(), 1);
        assert_eq!(service_checks[0].status, ServiceCheckStatus::Ok);
        assert_eq!(check.cycles(), 3);
    }

    #[tokio::test]
    async fn test_source_failure_leaves_state_untouched() {
        let mut config = check_config(String::new());
        config.statement_column = None;
        config.key_columns = vec!["query".into()];
        let mut check = StatementCheck::new(config, None).unwrap();
        let mut stub = AggregatorStub::new();

        let rows = vec![row! { "query" => "SELECT 1", "calls" => 1i64, "total_elapsed_time" => 1i64 }];
        check.run_cycle(rows, &mut stub).unwrap();
        assert_eq!(check.state().len(), 1);

        let err = check.check(&FailingSource, &mut stub).await.unwrap_err();
        assert_eq!(err.recovery_hint(), RecoveryHint::Reconnect);
        assert_eq!(check.state().len(), 1);

        let service_checks = stub.service_checks("db.queries.can_connect");
        let critical = service_checks[0];
        assert_eq!(critical.status, ServiceCheckStatus::Critical);
        assert!(critical.message.as_deref().unwrap().contains("connection refused"));
    }

    #[tokio::test]
    async fn test_fetch_limit_caps_replayed_rows() {
        let dir = tempfile::tempdir().unwrap();
        let pattern = write_snapshots(dir.path(), "cap", &SNAPSHOTS[..1]);
        let source = FileReplaySource::from_glob("cap", &pattern).unwrap();
        let request = FetchRequest { query: None, columns: ColumnSet::new(["calls"]), row_limit: 2 };

        assert_eq!(source.fetch_rows(&request).await.unwrap().len(), 2);
        assert_eq!(source.remaining(), 0);
        assert!(matches!(source.fetch_rows(&request).await, Err(SourceError::Exhausted { .. })));
    }

    #[tokio::test]
    async fn test_looping_replay_and_documents() {
        let dir = tempfile::tempdir().unwrap();
        let pattern = write_snapshots(dir.path(), "doc", &[r#"{"connections": {"current": 3}}"#]);
        let source = FileReplaySource::from_glob("doc", &pattern).unwrap().looping(true);

        for _ in 0..3 {
            let document = source.fetch_document().await.unwrap();
            assert_eq!(document["connections"]["current"], 3);
        }
    }

    #[test]
    fn test_replay_without_matches_fails() {
        let dir = tempfile::tempdir().unwrap();
        let pattern = dir.path().join("none-*.json").display().to_string();
        assert!(matches!(
            FileReplaySource::from_glob("empty", &pattern),
            Err(SourceError::ConnectionFailed { .. })
        ));
    }

    #[tokio::test]
    async fn test_engine_runs_until_sources_are_exhausted() {
        let dir = tempfile::tempdir().unwrap();
        let statements = write_snapshots(dir.path(), "stats", &SNAPSHOTS);
        let documents = write_snapshots(
            dir.path(),
            "status",
            &[r#"{"connections": {"current": 3}}"#, r#"{"connections": {"current": 4}}"#],
        );

        let config = EngineConfig {
            engine: GeneralConfig { collection_interval: Duration::from_millis(100), ..GeneralConfig::default() },
            checks: vec![check_config(statements)],
            documents: vec![DocumentCheckConfig {
                name: "status".into(),
                source: documents,
                tags: vec!["service:docdb".into()],
                queries: vec![DocumentQuery {
                    name: "conn".into(),
                    metrics: vec![MetricSpec::new("connections.current", "conn.current", MetricType::Gauge)],
                    ..DocumentQuery::default()
                }],
            }],
            ..EngineConfig::default()
        };
        config.validate_all().unwrap();

        let manager = Arc::new(ConfigManager::new(config));
        let mut engine = Engine::with_submitter(manager, Box::new(AggregatorStub::new())).unwrap();
        engine.run(Some(10)).await.unwrap();

        // Three statement snapshots, then one cycle to observe exhaustion.
        assert_eq!(engine.cycles(), 4);
        assert_eq!(engine.error_stats().total(), 0);
        assert!(!engine.is_running());
    }

    #[tokio::test]
    async fn test_engine_stops_on_shutdown_handle() {
        let dir = tempfile::tempdir().unwrap();
        let statements = write_snapshots(dir.path(), "stats", &SNAPSHOTS);
        let mut check = check_config(statements);
        check.name = "looping".into();

        let config = EngineConfig {
            engine: GeneralConfig { collection_interval: Duration::from_secs(60), ..GeneralConfig::default() },
            checks: vec![check],
            ..EngineConfig::default()
        };
        let mut engine = Engine::with_submitter(Arc::new(ConfigManager::new(config)), Box::new(AggregatorStub::new())).unwrap();
        let handle = engine.shutdown_handle();
        handle.shutdown();

        engine.run(None).await.unwrap();
        assert!(engine.cycles() <= 1);
    }
}

#[cfg(test)]
mod property_tests {
    use super::*;
    use proptest::prelude::*;

    fn id_key(row: &Row) -> Option<RowKey> {
        RowKeySpec::new(["id"]).key_for(row)
    }

    proptest! {
        #[test]
        fn row_limits_keep_the_heaviest_rows(
            weights in proptest::collection::vec(0i64..1000, 0..40),
            caps in proptest::collection::vec(1usize..30, 1..4),
        ) {
            let rows: Vec<Row> = weights
                .iter()
                .enumerate()
                .map(|(i, w)| row! { "id" => format!("q{:03}", i), "total_elapsed_time" => *w })
                .collect();
            let limits: RowLimits = caps
                .iter()
                .enumerate()
                .map(|(i, c)| (CompactString::from(format!("limit{}", i)), RowLimit::new(*c)))
                .collect();

            let out = apply_row_limits(rows, &limits, "total_elapsed_time", true, id_key);
            let cap = caps.iter().copied().min().unwrap();
            prop_assert_eq!(out.len(), weights.len().min(cap));

            let kept: Vec<f64> = out
                .iter()
                .filter_map(|r| r.numeric("total_elapsed_time"))
                .map(Numeric::as_f64)
                .collect();
            let mut expected: Vec<f64> = weights.iter().map(|w| *w as f64).collect();
            expected.sort_by(|a, b| b.total_cmp(a));
            expected.truncate(out.len());
            prop_assert_eq!(kept, expected);
        }

        #[test]
        fn set_tag_is_idempotent(key in "[a-z]{1,8}", value in "[a-z0-9]{1,8}", keyless in any::<bool>()) {
            let key = if keyless { None } else { Some(key.as_str()) };
            let mut once = TagManager::new();
            once.set_tag(key, &value, false);
            let mut twice = TagManager::new();
            twice.set_tag(key, &value, false);
            twice.set_tag(key, &value, false);
            prop_assert_eq!(once.get_tags(), twice.get_tags());
        }

        #[test]
        fn monotonic_counters_yield_their_difference(start in 0i64..1_000_000, step in 0i64..1_000_000) {
            let counters = ColumnSet::new(["calls"]);
            let mut metrics = StatementMetrics::new();
            metrics.compute_derivative_rows(vec![row! { "id" => "a", "calls" => start }], &counters, id_key);
            let out = metrics.compute_derivative_rows(vec![row! { "id" => "a", "calls" => start + step }], &counters, id_key);
            prop_assert_eq!(out.len(), 1);
            prop_assert_eq!(out[0].numeric("calls"), Some(Numeric::Int(step)));
        }
    }
}
