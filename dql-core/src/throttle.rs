/// Throughput throttling
///
/// Ceilings are configured per table, per global index, as a process-wide
/// default and as a total across all tables. A statement can override the
/// persistent ceiling for its own calls with a `THROTTLE (read, write)`
/// clause. The controller keeps a leaky bucket per (scope, dimension) that
/// fills with the consumed capacity each call reports and drains at the
/// ceiling rate; while a bucket holds more than one second worth of
/// capacity the next call is delayed until it drains back under.

use crate::schema::TableMeta;
use crate::{Error, Result};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::ops::{Add, AddAssign};
use std::str::FromStr;
use std::time::{Duration, Instant};
use tracing::debug;

/// One throughput ceiling
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum Limit {
    Unlimited,
    /// Capacity units per second
    Units(f64),
    /// Percentage of the provisioned capacity of the scope
    Percent(f64),
}

impl Limit {
    /// Units per second this limit allows against `provisioned` capacity.
    /// `None` means no ceiling. Percentages of on-demand capacity are unlimited.
    pub fn resolve(&self, provisioned: u64) -> Option<f64> {
        match *self {
            Limit::Unlimited => None,
            Limit::Units(units) => Some(units),
            Limit::Percent(_) if provisioned == 0 => None,
            Limit::Percent(pct) => Some(provisioned as f64 * pct / 100.0),
        }
    }

    pub fn is_unlimited(&self) -> bool {
        *self == Limit::Unlimited
    }
}

impl FromStr for Limit {
    type Err = Error;

    /// Parses `*`, `0` (no limit), `N` or `N%`.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() || s == "*" {
            return Ok(Limit::Unlimited);
        }
        let (number, percent) = match s.strip_suffix('%') {
            Some(n) => (n.trim(), true),
            None => (s, false),
        };
        let value: f64 = number
            .parse()
            .map_err(|_| Error::InvalidArgument(format!("invalid throughput limit '{}'", s)))?;
        if !value.is_finite() || value < 0.0 {
            return Err(Error::InvalidArgument(format!(
                "throughput limit must be a non-negative number, got '{}'",
                s
            )));
        }
        if value == 0.0 {
            Ok(Limit::Unlimited)
        } else if percent {
            Ok(Limit::Percent(value))
        } else {
            Ok(Limit::Units(value))
        }
    }
}

impl fmt::Display for Limit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Limit::Unlimited => f.write_str("*"),
            Limit::Units(units) => write!(f, "{}", units),
            Limit::Percent(pct) => write!(f, "{}%", pct),
        }
    }
}

impl From<Limit> for String {
    fn from(limit: Limit) -> Self {
        limit.to_string()
    }
}

impl TryFrom<String> for Limit {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

/// Read and write ceilings of one scope
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Ceiling {
    pub read: Limit,
    pub write: Limit,
}

impl Ceiling {
    pub fn new(read: Limit, write: Limit) -> Self {
        Self { read, write }
    }

    pub fn unlimited() -> Self {
        Self::new(Limit::Unlimited, Limit::Unlimited)
    }

    /// Parses a pair such as `("10", "50%")`.
    pub fn parse(read: &str, write: &str) -> Result<Self> {
        Ok(Self::new(read.parse()?, write.parse()?))
    }

    pub fn is_unlimited(&self) -> bool {
        self.read.is_unlimited() && self.write.is_unlimited()
    }
}

impl fmt::Display for Ceiling {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, {}", self.read, self.write)
    }
}

/// Consumed (or allowed) capacity units
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Capacity {
    pub read: f64,
    pub write: f64,
}

impl Capacity {
    pub fn new(read: f64, write: f64) -> Self {
        Self { read, write }
    }

    pub fn read(units: f64) -> Self {
        Self::new(units, 0.0)
    }

    pub fn write(units: f64) -> Self {
        Self::new(0.0, units)
    }

    pub fn is_zero(&self) -> bool {
        self.read == 0.0 && self.write == 0.0
    }
}

impl Add for Capacity {
    type Output = Capacity;

    fn add(self, rhs: Capacity) -> Capacity {
        Capacity::new(self.read + rhs.read, self.write + rhs.write)
    }
}

impl AddAssign for Capacity {
    fn add_assign(&mut self, rhs: Capacity) {
        *self = *self + rhs;
    }
}

/// Persistent throttle settings, as managed by throttle/unthrottle commands
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ThrottleConfig {
    /// Absolute ceiling across every table and index
    #[serde(default)]
    pub total: Option<Ceiling>,
    /// Ceiling for any table or global index without its own setting
    #[serde(default)]
    pub default: Option<Ceiling>,
    #[serde(default)]
    pub tables: BTreeMap<String, Ceiling>,
    /// table -> global index -> ceiling
    #[serde(default)]
    pub indexes: BTreeMap<String, BTreeMap<String, Ceiling>>,
}

impl ThrottleConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the total ceiling. Percentages are rejected because the total
    /// spans tables with different provisioning.
    pub fn set_total(&mut self, ceiling: Ceiling) -> Result<()> {
        if matches!(ceiling.read, Limit::Percent(_)) || matches!(ceiling.write, Limit::Percent(_)) {
            return Err(Error::InvalidArgument(
                "total read/write limits must be absolute values".to_string(),
            ));
        }
        self.total = if ceiling.is_unlimited() { None } else { Some(ceiling) };
        Ok(())
    }

    pub fn set_default(&mut self, ceiling: Ceiling) {
        self.default = if ceiling.is_unlimited() { None } else { Some(ceiling) };
    }

    /// Sets or, for an unlimited ceiling, removes a table setting.
    pub fn set_table(&mut self, table: &str, ceiling: Ceiling) {
        if ceiling.is_unlimited() {
            self.tables.remove(table);
        } else {
            self.tables.insert(table.to_string(), ceiling);
        }
    }

    /// Sets or, for an unlimited ceiling, removes a global index setting.
    pub fn set_index(&mut self, table: &str, index: &str, ceiling: Ceiling) {
        if ceiling.is_unlimited() {
            if let Some(indexes) = self.indexes.get_mut(table) {
                indexes.remove(index);
                if indexes.is_empty() {
                    self.indexes.remove(table);
                }
            }
        } else {
            self.indexes
                .entry(table.to_string())
                .or_default()
                .insert(index.to_string(), ceiling);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.total.is_none()
            && self.default.is_none()
            && self.tables.is_empty()
            && self.indexes.is_empty()
    }

    /// Persistent ceiling for a table or one of its global indexes.
    pub fn persistent(&self, table: &str, index: Option<&str>) -> Option<&Ceiling> {
        let scoped = match index {
            Some(index) => self.indexes.get(table).and_then(|i| i.get(index)),
            None => self.tables.get(table),
        };
        scoped.or(self.default.as_ref())
    }
}

impl fmt::Display for ThrottleConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("No throttle");
        }
        let mut lines = Vec::new();
        if let Some(total) = &self.total {
            lines.push(format!("Total: {}", total));
        }
        if let Some(default) = &self.default {
            lines.push(format!("Default: {}", default));
        }
        for (table, ceiling) in &self.tables {
            lines.push(format!("{}: {}", table, ceiling));
        }
        for (table, indexes) in &self.indexes {
            for (index, ceiling) in indexes {
                lines.push(format!("{}:{}: {}", table, index, ceiling));
            }
        }
        f.write_str(&lines.join("\n"))
    }
}

/// The target of one store call, as seen by the throttle
#[derive(Debug, Clone, Copy)]
pub struct ThrottleScope<'a> {
    pub meta: &'a TableMeta,
    /// Global index the call targets; local index calls count against the table
    pub index: Option<&'a str>,
    /// Statement-level `THROTTLE` clause
    pub clause: Option<&'a Ceiling>,
}

impl<'a> ThrottleScope<'a> {
    pub fn new(meta: &'a TableMeta, index: Option<&'a str>, clause: Option<&'a Ceiling>) -> Self {
        let index = index.filter(|name| meta.global_index(name).is_some());
        Self { meta, index, clause }
    }

    pub fn table(meta: &'a TableMeta, clause: Option<&'a Ceiling>) -> Self {
        Self::new(meta, None, clause)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct BucketKey {
    /// `None` for the total bucket
    table: Option<String>,
    index: Option<String>,
    write: bool,
}

#[derive(Debug)]
struct Bucket {
    level: f64,
    updated: Instant,
}

impl Bucket {
    fn new(now: Instant) -> Self {
        Self { level: 0.0, updated: now }
    }

    fn drain(&mut self, rate: Option<f64>, now: Instant) {
        let elapsed = now.saturating_duration_since(self.updated).as_secs_f64();
        self.level = match rate {
            Some(rate) => (self.level - elapsed * rate).max(0.0),
            None => 0.0,
        };
        self.updated = now;
    }

    /// Seconds until the level is back to one second worth of capacity.
    fn overage(&self, rate: Option<f64>) -> f64 {
        match rate {
            Some(rate) if rate > 0.0 && self.level > rate => (self.level - rate) / rate,
            _ => 0.0,
        }
    }
}

/// Resolved per-second ceilings for one scope, plus the total ceiling
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct EffectiveCeilings {
    pub read: Option<f64>,
    pub write: Option<f64>,
    pub total_read: Option<f64>,
    pub total_write: Option<f64>,
}

/// Shared throttling state. Safe to share across concurrently executing
/// statements; configuration reads take a read lock per call.
pub struct ThrottleController {
    config: RwLock<ThrottleConfig>,
    buckets: Mutex<HashMap<BucketKey, Bucket>>,
}

impl Default for ThrottleController {
    fn default() -> Self {
        Self::new(ThrottleConfig::default())
    }
}

impl ThrottleController {
    pub fn new(config: ThrottleConfig) -> Self {
        Self {
            config: RwLock::new(config),
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Snapshot of the current settings
    pub fn config(&self) -> ThrottleConfig {
        self.config.read().clone()
    }

    /// Mutates the settings under the write lock.
    pub fn update<R>(&self, f: impl FnOnce(&mut ThrottleConfig) -> R) -> R {
        f(&mut self.config.write())
    }

    /// Resolves ceilings by precedence: statement clause, then the table or
    /// index setting, then the default, then unlimited.
    pub fn ceilings(&self, scope: &ThrottleScope<'_>) -> EffectiveCeilings {
        let config = self.config.read();
        let provisioned = scope.meta.throughput_for(scope.index);
        let source = scope
            .clause
            .copied()
            .or_else(|| config.persistent(&scope.meta.name, scope.index).copied());
        let (read, write) = match source {
            Some(ceiling) => (
                ceiling.read.resolve(provisioned.read),
                ceiling.write.resolve(provisioned.write),
            ),
            None => (None, None),
        };
        let (total_read, total_write) = match &config.total {
            Some(total) => (total.read.resolve(0), total.write.resolve(0)),
            None => (None, None),
        };
        EffectiveCeilings {
            read,
            write,
            total_read,
            total_write,
        }
    }

    fn keyed(scope: &ThrottleScope<'_>, ceilings: &EffectiveCeilings) -> [(BucketKey, Option<f64>); 4] {
        let scoped = |write| BucketKey {
            table: Some(scope.meta.name.clone()),
            index: scope.index.map(str::to_string),
            write,
        };
        let total = |write| BucketKey {
            table: None,
            index: None,
            write,
        };
        [
            (scoped(false), ceilings.read),
            (scoped(true), ceilings.write),
            (total(false), ceilings.total_read),
            (total(true), ceilings.total_write),
        ]
    }

    /// Delay to observe before the next call against `scope`, if any.
    pub fn before(&self, scope: &ThrottleScope<'_>) -> Option<Duration> {
        let ceilings = self.ceilings(scope);
        let now = Instant::now();
        let mut buckets = self.buckets.lock();

        let mut delay: f64 = 0.0;
        for (key, rate) in Self::keyed(scope, &ceilings) {
            if let Some(bucket) = buckets.get_mut(&key) {
                bucket.drain(rate, now);
                delay = delay.max(bucket.overage(rate));
            }
        }

        if delay > 0.0 {
            debug!(
                table = %scope.meta.name,
                index = scope.index.unwrap_or("TABLE"),
                delay_ms = (delay * 1000.0) as u64,
                "throttling before next call"
            );
            Some(Duration::from_secs_f64(delay))
        } else {
            None
        }
    }

    /// Records the capacity a call against `scope` consumed.
    pub fn after(&self, scope: &ThrottleScope<'_>, consumed: Capacity) {
        if consumed.is_zero() {
            return;
        }
        let ceilings = self.ceilings(scope);
        let now = Instant::now();
        let mut buckets = self.buckets.lock();

        for (key, rate) in Self::keyed(scope, &ceilings) {
            let units = if key.write { consumed.write } else { consumed.read };
            if units == 0.0 {
                continue;
            }
            let bucket = buckets.entry(key).or_insert_with(|| Bucket::new(now));
            bucket.drain(rate, now);
            if rate.is_some() {
                bucket.level += units;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{GlobalIndex, KeyAttribute, KeyType, Throughput};

    fn table() -> TableMeta {
        TableMeta::new("forum", KeyAttribute::new("id", KeyType::S))
            .with_global_index(
                GlobalIndex::new("author-index", KeyAttribute::new("author", KeyType::S))
                    .with_throughput(Throughput::new(4, 2)),
            )
            .with_throughput(Throughput::new(10, 20))
    }

    #[test]
    fn test_limit_parsing() {
        assert_eq!("*".parse::<Limit>().unwrap(), Limit::Unlimited);
        assert_eq!("0".parse::<Limit>().unwrap(), Limit::Unlimited);
        assert_eq!("25".parse::<Limit>().unwrap(), Limit::Units(25.0));
        assert_eq!("50%".parse::<Limit>().unwrap(), Limit::Percent(50.0));
        assert!("-1".parse::<Limit>().is_err());
        assert!("abc".parse::<Limit>().is_err());
    }

    #[test]
    fn test_percent_resolves_against_provisioned() {
        assert_eq!(Limit::Percent(50.0).resolve(10), Some(5.0));
        assert_eq!(Limit::Percent(50.0).resolve(0), None);
        assert_eq!(Limit::Units(3.0).resolve(0), Some(3.0));
    }

    #[test]
    fn test_precedence_clause_over_table_over_default() {
        let meta = table();
        let controller = ThrottleController::default();
        controller.update(|c| {
            c.set_default(Ceiling::parse("1", "1").unwrap());
            c.set_table("forum", Ceiling::parse("50%", "*").unwrap());
        });

        let scope = ThrottleScope::table(&meta, None);
        let ceilings = controller.ceilings(&scope);
        assert_eq!(ceilings.read, Some(5.0));
        assert_eq!(ceilings.write, None);

        let clause = Ceiling::parse("7", "8").unwrap();
        let scope = ThrottleScope::table(&meta, Some(&clause));
        let ceilings = controller.ceilings(&scope);
        assert_eq!(ceilings.read, Some(7.0));
        assert_eq!(ceilings.write, Some(8.0));

        // A global index without its own setting falls back to the default
        let scope = ThrottleScope::new(&meta, Some("author-index"), None);
        assert_eq!(controller.ceilings(&scope).read, Some(1.0));
    }

    #[test]
    fn test_index_setting_uses_index_throughput() {
        let meta = table();
        let controller = ThrottleController::default();
        controller.update(|c| c.set_index("forum", "author-index", Ceiling::parse("50%", "50%").unwrap()));

        let scope = ThrottleScope::new(&meta, Some("author-index"), None);
        let ceilings = controller.ceilings(&scope);
        assert_eq!(ceilings.read, Some(2.0));
        assert_eq!(ceilings.write, Some(1.0));
    }

    #[test]
    fn test_unknown_index_scope_counts_against_table() {
        let meta = table();
        let scope = ThrottleScope::new(&meta, Some("score-index"), None);
        assert_eq!(scope.index, None);
    }

    #[test]
    fn test_consuming_the_ceiling_inserts_a_delay() {
        let meta = table();
        let clause = Ceiling::parse("10", "*").unwrap();
        let scope = ThrottleScope::table(&meta, Some(&clause));
        let controller = ThrottleController::default();

        let mut delays = Vec::new();
        for _ in 0..4 {
            delays.push(controller.before(&scope));
            controller.after(&scope, Capacity::read(10.0));
        }
        assert!(delays.iter().flatten().any(|d| *d > Duration::ZERO));
    }

    #[test]
    fn test_unlimited_never_delays() {
        let meta = table();
        let clause = Ceiling::parse("*", "*").unwrap();
        let scope = ThrottleScope::table(&meta, Some(&clause));
        let controller = ThrottleController::default();

        for _ in 0..50 {
            assert_eq!(controller.before(&scope), None);
            controller.after(&scope, Capacity::new(1000.0, 1000.0));
        }
    }

    #[test]
    fn test_read_and_write_are_independent() {
        let meta = table();
        let clause = Ceiling::parse("*", "5").unwrap();
        let scope = ThrottleScope::table(&meta, Some(&clause));
        let controller = ThrottleController::default();

        for _ in 0..10 {
            controller.after(&scope, Capacity::read(100.0));
        }
        assert_eq!(controller.before(&scope), None);

        controller.after(&scope, Capacity::write(20.0));
        assert!(controller.before(&scope).is_some());
    }

    #[test]
    fn test_total_ceiling_applies_across_tables() {
        let meta = table();
        let other = TableMeta::new("other", KeyAttribute::new("id", KeyType::S));
        let controller = ThrottleController::default();
        controller
            .update(|c| c.set_total(Ceiling::parse("10", "*").unwrap()))
            .unwrap();

        controller.after(&ThrottleScope::table(&meta, None), Capacity::read(15.0));
        controller.after(&ThrottleScope::table(&other, None), Capacity::read(15.0));
        assert!(controller.before(&ThrottleScope::table(&other, None)).is_some());
    }

    #[test]
    fn test_total_rejects_percentages() {
        let mut config = ThrottleConfig::new();
        assert!(config.set_total(Ceiling::parse("10%", "1").unwrap()).is_err());
    }

    #[test]
    fn test_unthrottle_removes_settings() {
        let mut config = ThrottleConfig::new();
        config.set_table("forum", Ceiling::parse("5", "5").unwrap());
        config.set_index("forum", "author-index", Ceiling::parse("5", "5").unwrap());
        assert!(!config.is_empty());

        config.set_table("forum", Ceiling::unlimited());
        config.set_index("forum", "author-index", Ceiling::unlimited());
        assert!(config.is_empty());
        assert_eq!(config.to_string(), "No throttle");
    }

    #[test]
    fn test_config_round_trips_through_json() {
        let mut config = ThrottleConfig::new();
        config.set_default(Ceiling::parse("50%", "*").unwrap());
        config.set_table("forum", Ceiling::parse("10", "4").unwrap());

        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"50%\""));
        let restored: ThrottleConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, config);
    }
}
