//! One cached data product.

use std::path::PathBuf;
use std::time::{Duration, SystemTime};

/// Whether something produced at `time` is still usable at `now`.
///
/// Timestamps in the future count as brand new; a zero threshold makes
/// nothing fresh.
pub(crate) fn is_fresh(time: SystemTime, now: SystemTime, stale_after: Duration) -> bool {
    now.duration_since(time).unwrap_or(Duration::ZERO) < stale_after
}

/// In-memory value plus the bookkeeping for its cache file.
#[derive(Debug)]
pub(crate) struct CacheEntry<T> {
    value: Option<T>,
    /// When the snapshot this value derives from was taken.
    value_time: Option<SystemTime>,
    /// Cache file, when the cache has a directory.
    pub(crate) path: Option<PathBuf>,
    /// Modification time of the cache file this value was written to or
    /// loaded from.
    pub(crate) file_time: Option<SystemTime>,
}

impl<T: Clone> CacheEntry<T> {
    pub(crate) fn new(path: Option<PathBuf>) -> Self {
        Self {
            value: None,
            value_time: None,
            path,
            file_time: None,
        }
    }

    /// The value, if it is present and fresh.
    pub(crate) fn fresh(&self, now: SystemTime, stale_after: Duration) -> Option<T> {
        match (&self.value, self.value_time) {
            (Some(value), Some(time)) if is_fresh(time, now, stale_after) => Some(value.clone()),
            _ => None,
        }
    }

    pub(crate) fn store(&mut self, value: T, value_time: SystemTime) {
        self.value = Some(value);
        self.value_time = Some(value_time);
    }

    pub(crate) fn clear(&mut self) {
        self.value = None;
        self.value_time = None;
        self.file_time = None;
    }

    pub(crate) fn value_time(&self) -> Option<SystemTime> {
        self.value_time
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_fresh() {
        let now = SystemTime::now();
        let minute = Duration::from_secs(60);
        assert!(is_fresh(now, now, minute));
        assert!(is_fresh(now - Duration::from_secs(59), now, minute));
        assert!(!is_fresh(now - minute, now, minute));
        assert!(is_fresh(now + minute, now, minute));
        assert!(!is_fresh(now, now, Duration::ZERO));
        assert!(!is_fresh(now + minute, now, Duration::ZERO));
    }

    #[test]
    fn test_entry_freshness_and_clear() {
        let now = SystemTime::now();
        let mut entry: CacheEntry<u32> = CacheEntry::new(None);
        assert!(entry.fresh(now, Duration::from_secs(60)).is_none());

        entry.store(7, now - Duration::from_secs(30));
        entry.file_time = Some(now);
        assert_eq!(entry.fresh(now, Duration::from_secs(60)), Some(7));
        assert!(entry.fresh(now, Duration::from_secs(10)).is_none());

        entry.clear();
        assert!(entry.fresh(now, Duration::from_secs(60)).is_none());
        assert!(entry.value_time().is_none());
        assert!(entry.file_time.is_none());
    }
}
