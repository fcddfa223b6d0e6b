//! The authoritative camera set, grouped by refresh interval.
//!
//! The roster is replaced wholesale when the API reports a different camera
//! list; readers copy per-interval buckets out under the read lock so the
//! lock is never held across queue sends.

use std::collections::{BTreeMap, HashSet};
use std::sync::{PoisonError, RwLock};

use serde::Deserialize;

/// One camera as reported by the API, plus derived upload endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct CameraDescriptor {
    pub id: String,
    pub rtsp_url: String,
    /// Desired seconds between successive snapshots; must be positive.
    #[serde(rename = "update_interval")]
    pub refresh_interval_s: u64,
    /// `<api>/cameras/<id>/snapshots`, attached after deserialization.
    #[serde(default)]
    pub snapshot_url: String,
}

#[derive(Debug, Default)]
struct Buckets {
    by_interval: BTreeMap<u64, Vec<CameraDescriptor>>,
    ids: HashSet<String>,
}

/// Immutable-on-read camera grouping behind a single reader-writer lock.
#[derive(Debug, Default)]
pub struct Roster {
    inner: RwLock<Buckets>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically rebuild the grouping from a fresh API list. Duplicate ids
    /// are ignored; the first occurrence wins.
    pub fn replace(&self, cameras: Vec<CameraDescriptor>) {
        let mut buckets = Buckets::default();
        for camera in cameras {
            if !buckets.ids.insert(camera.id.clone()) {
                continue;
            }
            buckets
                .by_interval
                .entry(camera.refresh_interval_s)
                .or_default()
                .push(camera);
        }

        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        *inner = buckets;
    }

    /// True iff the `(id, refresh_interval)` pairs match the current roster
    /// exactly, regardless of input order. Duplicate ids in the candidate
    /// list are ignored after their first occurrence.
    pub fn equals(&self, cameras: &[CameraDescriptor]) -> bool {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);

        let mut candidate: HashSet<(&str, u64)> = HashSet::new();
        let mut seen: HashSet<&str> = HashSet::new();
        for camera in cameras {
            if seen.insert(camera.id.as_str()) {
                candidate.insert((camera.id.as_str(), camera.refresh_interval_s));
            }
        }

        if candidate.len() != inner.ids.len() {
            return false;
        }
        inner.by_interval.iter().all(|(interval, bucket)| {
            bucket
                .iter()
                .all(|camera| candidate.contains(&(camera.id.as_str(), *interval)))
        })
    }

    /// Distinct refresh intervals currently present, ascending.
    pub fn intervals(&self) -> Vec<u64> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.by_interval.keys().copied().collect()
    }

    /// Copy of one interval's cameras, in API insertion order.
    pub fn bucket(&self, interval_s: u64) -> Vec<CameraDescriptor> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner
            .by_interval
            .get(&interval_s)
            .cloned()
            .unwrap_or_default()
    }

    /// Consistent copy of every bucket for lock-free iteration.
    pub fn snapshot_buckets(&self) -> BTreeMap<u64, Vec<CameraDescriptor>> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.by_interval.clone()
    }

    /// Number of unique cameras.
    pub fn len(&self) -> usize {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
pub(crate) fn camera(id: &str, interval_s: u64) -> CameraDescriptor {
    CameraDescriptor {
        id: id.to_string(),
        rtsp_url: format!("rtsp://camera-{id}/stream"),
        refresh_interval_s: interval_s,
        snapshot_url: format!("https://api.test/cameras/{id}/snapshots"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replace_groups_by_interval_and_deduplicates() {
        let roster = Roster::new();
        roster.replace(vec![
            camera("a", 10),
            camera("b", 5),
            camera("a", 20), // duplicate id, first occurrence wins
            camera("c", 10),
        ]);

        assert_eq!(roster.len(), 3);
        assert_eq!(roster.intervals(), vec![5, 10]);

        let ten = roster.bucket(10);
        let ids: Vec<&str> = ten.iter().map(|camera| camera.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"], "insertion order is kept");
    }

    #[test]
    fn equals_ignores_order_but_not_interval() {
        let roster = Roster::new();
        roster.replace(vec![camera("a", 10), camera("b", 5)]);

        assert!(roster.equals(&[camera("b", 5), camera("a", 10)]));
        assert!(!roster.equals(&[camera("a", 10), camera("b", 10)]));
        assert!(!roster.equals(&[camera("a", 10)]));
        assert!(!roster.equals(&[camera("a", 10), camera("b", 5), camera("c", 5)]));
    }

    #[test]
    fn equals_is_case_sensitive_and_dedup_aware() {
        let roster = Roster::new();
        roster.replace(vec![camera("cam", 10)]);

        assert!(!roster.equals(&[camera("CAM", 10)]));
        assert!(roster.equals(&[camera("cam", 10), camera("cam", 99)]));
    }

    #[test]
    fn empty_roster_has_no_buckets() {
        let roster = Roster::new();
        assert!(roster.is_empty());
        assert!(roster.intervals().is_empty());
        assert!(roster.bucket(10).is_empty());
        assert!(roster.equals(&[]));
    }
}
