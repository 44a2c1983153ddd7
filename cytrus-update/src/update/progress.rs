//! Per-fragment and overall progress bookkeeping.

use std::collections::BTreeMap;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::broadcast;

use super::speed::SpeedMeter;
use super::{UpdateEvent, UpdateProgress};

/// Progress of one fragment's downloads.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FragmentProgress {
    pub downloaded: u64,
    pub total: u64,
}

struct Inner {
    fragments: BTreeMap<String, FragmentProgress>,
    /// Bytes downloaded by earlier runs of this update, carried over so a
    /// resumed update does not restart the progress bar.
    already_downloaded: u64,
    speed: SpeedMeter,
}

/// Shared progress state of one sequencer run.
///
/// Download actions record received chunks; the tracker maintains the
/// per-fragment and overall figures and emits one
/// [`UpdateEvent::Progress`] per recorded chunk.
pub struct ProgressTracker {
    inner: Mutex<Inner>,
    events: broadcast::Sender<UpdateEvent>,
}

impl ProgressTracker {
    pub fn new(events: broadcast::Sender<UpdateEvent>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                fragments: BTreeMap::new(),
                already_downloaded: 0,
                speed: SpeedMeter::new(),
            }),
            events,
        }
    }

    /// Re-initializes the per-fragment totals.
    ///
    /// Called on each diff: fragment byte counts come from the release meta
    /// summary when available, from the diff itself otherwise. Bytes already
    /// counted for finished fragments move into the carry-over so the
    /// overall figure never goes backwards.
    pub fn reset_fragments(&self, totals: &BTreeMap<String, u64>) {
        let mut inner = self.inner.lock();
        let consumed: u64 = inner.fragments.values().map(|f| f.downloaded).sum();
        inner.already_downloaded += consumed;
        inner.fragments = totals
            .iter()
            .map(|(name, total)| {
                (
                    name.clone(),
                    FragmentProgress {
                        downloaded: 0,
                        total: *total,
                    },
                )
            })
            .collect();
    }

    /// Seeds the carry-over byte count from a previous run.
    pub fn set_already_downloaded(&self, bytes: u64) {
        self.inner.lock().already_downloaded = bytes;
    }

    /// Records a received chunk for a fragment and emits progress.
    pub fn record(&self, fragment: &str, chunk_size: u64) {
        let snapshot = {
            let mut inner = self.inner.lock();
            let entry = inner
                .fragments
                .entry(fragment.to_string())
                .or_default();
            entry.downloaded += chunk_size;
            if entry.downloaded > entry.total {
                // The meta summary undercounted; stretch the total so the
                // downloaded-never-exceeds-total invariant holds.
                entry.total = entry.downloaded;
            }
            let now = Instant::now();
            inner.speed.record(now, chunk_size);
            Self::overall_locked(&mut inner, now)
        };
        let _ = self.events.send(UpdateEvent::Progress(snapshot));
    }

    /// Current overall progress.
    pub fn overall(&self) -> UpdateProgress {
        let mut inner = self.inner.lock();
        Self::overall_locked(&mut inner, Instant::now())
    }

    /// Progress of one fragment, if tracked.
    pub fn fragment(&self, name: &str) -> Option<FragmentProgress> {
        self.inner.lock().fragments.get(name).copied()
    }

    fn overall_locked(inner: &mut Inner, now: Instant) -> UpdateProgress {
        let downloaded: u64 = inner.fragments.values().map(|f| f.downloaded).sum();
        let total: u64 = inner.fragments.values().map(|f| f.total).sum();
        UpdateProgress {
            downloaded: inner.already_downloaded + downloaded,
            total: inner.already_downloaded + total,
            speed_bps: inner.speed.rate(now),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> (ProgressTracker, broadcast::Receiver<UpdateEvent>) {
        let (tx, rx) = broadcast::channel(64);
        (ProgressTracker::new(tx), rx)
    }

    fn totals(pairs: &[(&str, u64)]) -> BTreeMap<String, u64> {
        pairs.iter().map(|(n, t)| (n.to_string(), *t)).collect()
    }

    #[test]
    fn test_overall_sums_fragments() {
        let (tracker, _rx) = tracker();
        tracker.reset_fragments(&totals(&[("main", 100), ("en", 50)]));

        tracker.record("main", 30);
        tracker.record("en", 20);

        let overall = tracker.overall();
        assert_eq!(overall.downloaded, 50);
        assert_eq!(overall.total, 150);
        assert_eq!(tracker.fragment("main").unwrap().downloaded, 30);
    }

    #[test]
    fn test_downloaded_never_exceeds_total() {
        let (tracker, _rx) = tracker();
        tracker.reset_fragments(&totals(&[("main", 10)]));

        tracker.record("main", 25);

        let fragment = tracker.fragment("main").unwrap();
        assert!(fragment.downloaded <= fragment.total);
        let overall = tracker.overall();
        assert!(overall.downloaded <= overall.total);
    }

    #[test]
    fn test_reset_carries_consumed_bytes_forward() {
        let (tracker, _rx) = tracker();
        tracker.reset_fragments(&totals(&[("main", 100)]));
        tracker.record("main", 60);

        // A mid-run re-diff replaces the fragment set.
        tracker.reset_fragments(&totals(&[("en", 40)]));

        let overall = tracker.overall();
        assert_eq!(overall.downloaded, 60);
        assert_eq!(overall.total, 100);
    }

    #[test]
    fn test_already_downloaded_seed() {
        let (tracker, _rx) = tracker();
        tracker.set_already_downloaded(500);
        tracker.reset_fragments(&totals(&[("main", 100)]));

        let overall = tracker.overall();
        assert_eq!(overall.downloaded, 500);
        assert_eq!(overall.total, 600);
    }

    #[test]
    fn test_record_emits_progress_event() {
        let (tracker, mut rx) = tracker();
        tracker.reset_fragments(&totals(&[("main", 100)]));
        tracker.record("main", 10);

        match rx.try_recv().unwrap() {
            UpdateEvent::Progress(p) => {
                assert_eq!(p.downloaded, 10);
                assert_eq!(p.total, 100);
            }
            other => panic!("expected progress event, got {other:?}"),
        }
    }
}
