//! Per-category quota tracking.
//!
//! Every action category owns one fixed-window bucket. Buckets refresh lazily
//! at the point of use: once `now >= reset_at` the bucket is treated as full
//! again and a new window starts. There is no background timer.
//!
//! Limits are advisory. Upstream remains the authority, so
//! [`QuotaTracker::resync_from_server`] overwrites local bookkeeping with
//! whatever the response headers report.
//!
//! Two calls straddling a window boundary can both observe a freshly reset
//! bucket; the tracker tolerates that one-window overshoot.

use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use crate::clock::{SharedClock, SystemClock};
use crate::error::{Error, ErrorCode, ErrorInfo, Result};

/// Named class of actions sharing one bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Category(Cow<'static, str>);

impl Category {
    /// Reads of any kind.
    pub const READ: Category = Category(Cow::Borrowed("read"));
    /// Generic writes (comments, edits, deletes).
    pub const WRITE: Category = Category(Cow::Borrowed("write"));
    /// Feed posts.
    pub const CONTENT_PUBLISH: Category = Category(Cow::Borrowed("content_publish"));
    /// Stories.
    pub const STORY_PUBLISH: Category = Category(Cow::Borrowed("story_publish"));
    /// Direct messages.
    pub const DIRECT_MESSAGE: Category = Category(Cow::Borrowed("direct_message"));
    /// Follow and unfollow.
    pub const FOLLOW: Category = Category(Cow::Borrowed("follow"));
    /// Likes.
    pub const LIKE: Category = Category(Cow::Borrowed("like"));

    /// Category from an arbitrary tag.
    pub fn new(tag: impl Into<String>) -> Self {
        Category(Cow::Owned(tag.into()))
    }

    /// Tag string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Static capacity and window of one category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketConfig {
    /// Permits per window.
    pub capacity: u32,
    /// Window length in seconds.
    pub window_secs: u64,
}

impl BucketConfig {
    /// Create a bucket configuration.
    pub const fn new(capacity: u32, window_secs: u64) -> Self {
        Self {
            capacity,
            window_secs,
        }
    }
}

/// Default table for the Instagram categories.
///
/// These numbers are conservative estimates, not published upstream limits.
/// Override them with `--quota`.
pub fn default_buckets() -> Vec<(Category, BucketConfig)> {
    vec![
        (Category::READ, BucketConfig::new(200, 3600)),
        (Category::WRITE, BucketConfig::new(25, 3600)),
        (Category::CONTENT_PUBLISH, BucketConfig::new(25, 86_400)),
        (Category::STORY_PUBLISH, BucketConfig::new(50, 86_400)),
        (Category::DIRECT_MESSAGE, BucketConfig::new(100, 86_400)),
        (Category::FOLLOW, BucketConfig::new(60, 3600)),
        (Category::LIKE, BucketConfig::new(120, 3600)),
    ]
}

/// Parse a `category=capacity/window_secs` override.
pub fn parse_override(raw: &str) -> Result<(Category, BucketConfig)> {
    let invalid = || {
        Error::Config(format!(
            "invalid quota override '{}', expected CATEGORY=CAPACITY/SECONDS",
            raw
        ))
    };

    let (name, limits) = raw.split_once('=').ok_or_else(invalid)?;
    let (capacity, window) = limits.split_once('/').ok_or_else(invalid)?;
    let name = name.trim();
    if name.is_empty() {
        return Err(invalid());
    }
    let capacity: u32 = capacity.trim().parse().map_err(|_| invalid())?;
    let window_secs: u64 = window.trim().parse().map_err(|_| invalid())?;
    if window_secs == 0 {
        return Err(invalid());
    }

    Ok((Category::new(name), BucketConfig::new(capacity, window_secs)))
}

/// Merge overrides into a bucket table, replacing or appending by category.
pub fn apply_overrides(
    mut table: Vec<(Category, BucketConfig)>,
    overrides: impl IntoIterator<Item = (Category, BucketConfig)>,
) -> Vec<(Category, BucketConfig)> {
    for (category, config) in overrides {
        match table.iter_mut().find(|(c, _)| *c == category) {
            Some(entry) => entry.1 = config,
            None => table.push((category, config)),
        }
    }
    table
}

/// Mutable allowance of one category.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaBucket {
    /// Permits per window.
    pub capacity: u32,
    /// Permits left in the current window.
    pub remaining: u32,
    /// Window length in seconds.
    pub window_secs: u64,
    /// When `remaining` goes back to `capacity`.
    pub reset_at: DateTime<Utc>,
}

impl QuotaBucket {
    fn new(config: BucketConfig, now: DateTime<Utc>) -> Self {
        Self {
            capacity: config.capacity,
            remaining: config.capacity,
            window_secs: config.window_secs,
            reset_at: now + window(config.window_secs),
        }
    }

    fn refresh(&mut self, now: DateTime<Utc>) {
        if now >= self.reset_at {
            self.remaining = self.capacity;
            self.reset_at = now + window(self.window_secs);
        }
    }

    /// Remaining permits as seen at `now`, without mutating.
    fn effective_remaining(&self, now: DateTime<Utc>) -> u32 {
        if now >= self.reset_at {
            self.capacity
        } else {
            self.remaining
        }
    }
}

/// Longest window accepted; keeps `reset_at` arithmetic in range.
const MAX_WINDOW_SECS: u64 = 10 * 365 * 86_400;

fn window(secs: u64) -> chrono::Duration {
    chrono::Duration::seconds(secs.min(MAX_WINDOW_SECS) as i64)
}

/// Snapshot of one bucket.
#[derive(Debug, Clone, Serialize)]
pub struct BucketReport {
    /// Category tag.
    pub category: Category,
    /// Permits per window.
    pub capacity: u32,
    /// Permits left.
    pub remaining: u32,
    /// Share of the window already consumed.
    pub used_percent: f64,
    /// Window length.
    pub window_secs: u64,
    /// Next reset.
    pub reset_at: DateTime<Utc>,
}

/// Snapshot of the whole tracker.
#[derive(Debug, Clone, Serialize)]
pub struct QuotaReport {
    /// Local enforcement on/off.
    pub enabled: bool,
    /// One entry per category, sorted by tag.
    pub buckets: Vec<BucketReport>,
}

impl fmt::Display for QuotaReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Rate limiting: {}",
            if self.enabled { "enabled" } else { "disabled" }
        )?;
        for b in &self.buckets {
            writeln!(
                f,
                "  {:<16} {:>5}/{:<5} ({:.1}% used, window {}s)",
                b.category.as_str(),
                b.remaining,
                b.capacity,
                b.used_percent,
                b.window_secs
            )?;
        }
        Ok(())
    }
}

/// Tracks one bucket per category for a single wrapped account.
pub struct QuotaTracker {
    buckets: HashMap<Category, Mutex<QuotaBucket>>,
    enabled: AtomicBool,
    clock: SharedClock,
}

impl QuotaTracker {
    /// Create a tracker with one full bucket per category.
    pub fn new(categories: impl IntoIterator<Item = (Category, BucketConfig)>) -> Self {
        Self::with_clock(categories, Arc::new(SystemClock))
    }

    /// Create a tracker reading time from `clock`.
    pub fn with_clock(
        categories: impl IntoIterator<Item = (Category, BucketConfig)>,
        clock: SharedClock,
    ) -> Self {
        let now = clock.now();
        let buckets = categories
            .into_iter()
            .map(|(category, config)| (category, Mutex::new(QuotaBucket::new(config, now))))
            .collect();
        Self {
            buckets,
            enabled: AtomicBool::new(true),
            clock,
        }
    }

    /// Whether a call in `category` may go out now.
    ///
    /// Categories without a bucket are untracked and always proceed.
    pub fn can_proceed(&self, category: &Category) -> bool {
        if !self.is_enabled() {
            return true;
        }
        let Some(bucket) = self.buckets.get(category) else {
            return true;
        };
        let mut bucket = bucket.lock();
        bucket.refresh(self.clock.now());
        bucket.remaining > 0
    }

    /// Gate a call in `category`, describing the wait when the bucket is
    /// empty.
    pub fn check(&self, category: &Category) -> std::result::Result<(), ErrorInfo> {
        if self.can_proceed(category) {
            return Ok(());
        }
        let wait = self.time_until_reset(category);
        tracing::warn!(%category, wait_secs = wait.as_secs(), "Local rate limit reached");
        Err(ErrorInfo::new(
            ErrorCode::RateLimitLocal,
            format!("local {} limit reached, resets in {}", category, format_wait(wait)),
        )
        .with_category(category.as_str())
        .with_retry_after(Some(wait.as_secs() + u64::from(wait.subsec_nanos() > 0))))
    }

    /// Record one permitted call. Returns false, without mutating, when the
    /// bucket is empty and enforcement is on.
    pub fn consume(&self, category: &Category) -> bool {
        let Some(bucket) = self.buckets.get(category) else {
            tracing::debug!(%category, "Consume on untracked category");
            return true;
        };
        let mut bucket = bucket.lock();
        bucket.refresh(self.clock.now());
        if bucket.remaining == 0 {
            return !self.is_enabled();
        }
        bucket.remaining -= 1;
        true
    }

    /// Zero while permits remain; otherwise time until the window resets.
    pub fn time_until_reset(&self, category: &Category) -> Duration {
        let Some(bucket) = self.buckets.get(category) else {
            return Duration::ZERO;
        };
        let now = self.clock.now();
        let mut bucket = bucket.lock();
        bucket.refresh(now);
        if bucket.remaining > 0 {
            return Duration::ZERO;
        }
        (bucket.reset_at - now).to_std().unwrap_or(Duration::ZERO)
    }

    /// Overwrite local values with server-reported ones.
    ///
    /// Every provided field wins unconditionally. If the reported remaining
    /// exceeds the capacity, capacity is widened to match.
    pub fn resync_from_server(
        &self,
        category: &Category,
        remaining: Option<u32>,
        reset_at: Option<DateTime<Utc>>,
        capacity: Option<u32>,
    ) {
        let Some(bucket) = self.buckets.get(category) else {
            tracing::debug!(%category, "Ignoring resync for untracked category");
            return;
        };
        let mut bucket = bucket.lock();
        if let Some(capacity) = capacity {
            bucket.capacity = capacity;
        }
        if let Some(remaining) = remaining {
            bucket.remaining = remaining;
        }
        if let Some(reset_at) = reset_at {
            bucket.reset_at = reset_at;
        }
        if bucket.remaining > bucket.capacity {
            bucket.capacity = bucket.remaining;
        }
        tracing::debug!(
            %category,
            remaining = bucket.remaining,
            capacity = bucket.capacity,
            "Quota resynced from server"
        );
    }

    /// Current state of a bucket, refreshed for the current time.
    pub fn bucket(&self, category: &Category) -> Option<QuotaBucket> {
        let bucket = self.buckets.get(category)?;
        let mut bucket = bucket.lock();
        bucket.refresh(self.clock.now());
        Some(bucket.clone())
    }

    /// Snapshot of all buckets.
    pub fn report(&self) -> QuotaReport {
        let now = self.clock.now();
        let mut buckets: Vec<BucketReport> = self
            .buckets
            .iter()
            .map(|(category, bucket)| {
                let bucket = bucket.lock();
                let remaining = bucket.effective_remaining(now);
                let used_percent = if bucket.capacity == 0 {
                    100.0
                } else {
                    f64::from(bucket.capacity.saturating_sub(remaining)) * 100.0
                        / f64::from(bucket.capacity)
                };
                BucketReport {
                    category: category.clone(),
                    capacity: bucket.capacity,
                    remaining,
                    used_percent,
                    window_secs: bucket.window_secs,
                    reset_at: if now >= bucket.reset_at {
                        now + window(bucket.window_secs)
                    } else {
                        bucket.reset_at
                    },
                }
            })
            .collect();
        buckets.sort_by(|a, b| a.category.cmp(&b.category));

        QuotaReport {
            enabled: self.is_enabled(),
            buckets,
        }
    }

    /// Turn local enforcement on or off.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
        tracing::info!(enabled, "Local rate limiting toggled");
    }

    /// Whether local enforcement is on.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }
}

/// Render a wait as `1h 2m 3s`, dropping leading zero units.
pub fn format_wait(wait: Duration) -> String {
    let total = wait.as_secs() + u64::from(wait.subsec_nanos() > 0);
    let (h, m, s) = (total / 3600, (total % 3600) / 60, total % 60);
    match (h, m) {
        (0, 0) => format!("{}s", s),
        (0, _) => format!("{}m {}s", m, s),
        _ => format!("{}h {}m {}s", h, m, s),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};

    fn tracker_with(
        table: Vec<(Category, BucketConfig)>,
    ) -> (QuotaTracker, ManualClock) {
        let clock = ManualClock::starting_now();
        let tracker = QuotaTracker::with_clock(table, Arc::new(clock.clone()));
        (tracker, clock)
    }

    #[test]
    fn fresh_buckets_are_full() {
        let (tracker, _) = tracker_with(default_buckets());
        for (category, config) in default_buckets() {
            let bucket = tracker.bucket(&category).unwrap();
            assert_eq!(bucket.remaining, config.capacity);
            assert!(tracker.can_proceed(&category));
        }
    }

    #[test]
    fn consume_exactly_capacity_times() {
        let (tracker, _) = tracker_with(vec![(Category::LIKE, BucketConfig::new(3, 3600))]);

        for _ in 0..3 {
            assert!(tracker.can_proceed(&Category::LIKE));
            assert!(tracker.consume(&Category::LIKE));
        }
        assert!(!tracker.can_proceed(&Category::LIKE));
        assert!(!tracker.consume(&Category::LIKE));
        assert_eq!(tracker.bucket(&Category::LIKE).unwrap().remaining, 0);
    }

    #[test]
    fn window_refreshes_lazily() {
        let (tracker, clock) = tracker_with(vec![(Category::FOLLOW, BucketConfig::new(2, 60))]);
        assert!(tracker.consume(&Category::FOLLOW));
        assert!(tracker.consume(&Category::FOLLOW));
        assert!(!tracker.can_proceed(&Category::FOLLOW));

        clock.advance(chrono::Duration::seconds(61));

        assert!(tracker.can_proceed(&Category::FOLLOW));
        assert_eq!(tracker.bucket(&Category::FOLLOW).unwrap().remaining, 2);
    }

    #[test]
    fn one_per_second_scenario() {
        let (tracker, clock) =
            tracker_with(vec![(Category::DIRECT_MESSAGE, BucketConfig::new(1, 1))]);

        assert!(tracker.consume(&Category::DIRECT_MESSAGE));
        assert!(!tracker.consume(&Category::DIRECT_MESSAGE));

        clock.advance(chrono::Duration::milliseconds(1100));

        assert!(tracker.consume(&Category::DIRECT_MESSAGE));
    }

    #[test]
    fn check_describes_the_wait() {
        let (tracker, clock) = tracker_with(vec![(Category::FOLLOW, BucketConfig::new(1, 120))]);
        assert!(tracker.check(&Category::FOLLOW).is_ok());
        tracker.consume(&Category::FOLLOW);
        clock.advance(chrono::Duration::milliseconds(500));

        let err = tracker.check(&Category::FOLLOW).unwrap_err();

        assert_eq!(err.code, ErrorCode::RateLimitLocal);
        assert_eq!(err.details.category.as_deref(), Some("follow"));
        assert_eq!(err.details.retry_after_secs, Some(120));
        assert!(err.message.contains("resets in 2m 0s"));
    }

    #[test]
    fn time_until_reset_is_zero_while_permits_remain() {
        let (tracker, clock) = tracker_with(vec![(Category::WRITE, BucketConfig::new(1, 100))]);
        assert_eq!(tracker.time_until_reset(&Category::WRITE), Duration::ZERO);

        tracker.consume(&Category::WRITE);
        clock.advance(chrono::Duration::seconds(40));
        assert_eq!(
            tracker.time_until_reset(&Category::WRITE),
            Duration::from_secs(60)
        );
    }

    #[test]
    fn server_values_always_win() {
        let (tracker, clock) = tracker_with(vec![(Category::READ, BucketConfig::new(10, 3600))]);
        for _ in 0..10 {
            tracker.consume(&Category::READ);
        }
        assert!(!tracker.can_proceed(&Category::READ));

        tracker.resync_from_server(&Category::READ, Some(7), None, None);
        assert_eq!(tracker.bucket(&Category::READ).unwrap().remaining, 7);

        let reset = clock.now() + chrono::Duration::seconds(5);
        tracker.resync_from_server(&Category::READ, Some(0), Some(reset), Some(4));
        let bucket = tracker.bucket(&Category::READ).unwrap();
        assert_eq!((bucket.remaining, bucket.capacity), (0, 4));
        assert_eq!(tracker.time_until_reset(&Category::READ), Duration::from_secs(5));

        tracker.resync_from_server(&Category::READ, Some(50), None, None);
        let bucket = tracker.bucket(&Category::READ).unwrap();
        assert_eq!((bucket.remaining, bucket.capacity), (50, 50));
    }

    #[test]
    fn disabled_tracker_always_proceeds() {
        let (tracker, _) = tracker_with(vec![(Category::LIKE, BucketConfig::new(0, 3600))]);
        assert!(!tracker.can_proceed(&Category::LIKE));

        tracker.set_enabled(false);
        assert!(!tracker.is_enabled());
        assert!(tracker.can_proceed(&Category::LIKE));
        assert!(tracker.consume(&Category::LIKE));
    }

    #[test]
    fn untracked_categories_proceed() {
        let (tracker, _) = tracker_with(Vec::new());
        let custom = Category::new("reels");
        assert!(tracker.can_proceed(&custom));
        assert!(tracker.consume(&custom));
    }

    #[test]
    fn report_lists_usage() {
        let (tracker, _) = tracker_with(vec![
            (Category::WRITE, BucketConfig::new(4, 3600)),
            (Category::READ, BucketConfig::new(10, 3600)),
        ]);
        tracker.consume(&Category::WRITE);

        let report = tracker.report();
        assert!(report.enabled);
        assert_eq!(report.buckets[0].category, Category::READ);
        assert_eq!(report.buckets[1].remaining, 3);
        assert!((report.buckets[1].used_percent - 25.0).abs() < f64::EPSILON);
        assert!(report.to_string().contains("write"));
    }

    #[test]
    fn overrides_parse_and_merge() {
        let (category, config) = parse_override("like=10/60").unwrap();
        assert_eq!(category, Category::LIKE);
        assert_eq!(config, BucketConfig::new(10, 60));

        assert!(parse_override("like=10").is_err());
        assert!(parse_override("=1/1").is_err());
        assert!(parse_override("like=x/60").is_err());
        assert!(parse_override("like=1/0").is_err());

        let table = apply_overrides(
            default_buckets(),
            vec![(category, config), parse_override("reels=5/600").unwrap()],
        );
        assert!(table.contains(&(Category::LIKE, BucketConfig::new(10, 60))));
        assert_eq!(table.last().unwrap().0.as_str(), "reels");
    }

    #[test]
    fn wait_formatting() {
        assert_eq!(format_wait(Duration::from_secs(37)), "37s");
        assert_eq!(format_wait(Duration::from_millis(1500)), "2s");
        assert_eq!(format_wait(Duration::from_secs(125)), "2m 5s");
        assert_eq!(format_wait(Duration::from_secs(3725)), "1h 2m 5s");
    }
}
