//! Background expiry of idle sessions and stale uploads.
//!
//! A single task wakes on a fixed interval, snapshots the expired
//! identifiers from both stores, and removes them. Sessions mid-exchange
//! hold their own lock and are skipped by the snapshot, so an in-flight
//! request is never reaped out from under itself.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::image::ImageCache;
use crate::session::SessionStore;

#[derive(Debug, Clone, Copy)]
pub struct ReaperConfig {
    /// Idle time after which a session or upload is eligible for removal.
    pub ttl: Duration,
    /// Time between sweeps.
    pub sweep_interval: Duration,
}

/// Outcome of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub sessions_removed: usize,
    pub images_removed: usize,
}

/// Periodic expiry task over the session store and image cache.
pub struct Reaper {
    sessions: Arc<SessionStore>,
    images: Arc<ImageCache>,
    config: ReaperConfig,
}

/// Handle to a running reaper task. Dropping it does not stop the task;
/// call [`ReaperHandle::shutdown`] for an orderly stop.
pub struct ReaperHandle {
    stop: watch::Sender<bool>,
    task: tokio::task::JoinHandle<()>,
}

impl ReaperHandle {
    /// Signal the task to stop and wait for it to finish.
    pub async fn shutdown(self) {
        let _ = self.stop.send(true);
        let _ = self.task.await;
    }
}

impl Reaper {
    pub fn new(sessions: Arc<SessionStore>, images: Arc<ImageCache>, config: ReaperConfig) -> Self {
        Self {
            sessions,
            images,
            config,
        }
    }

    /// Remove every expired session and upload. Identifiers are
    /// snapshotted first so no store lock is held across removals.
    pub async fn sweep(&self) -> SweepStats {
        let mut stats = SweepStats::default();

        for id in self.sessions.expired_ids(self.config.ttl).await {
            if self.sessions.destroy(&id).await {
                stats.sessions_removed += 1;
            }
        }
        for id in self.images.expired_ids(self.config.ttl).await {
            if self.images.remove(&id).await {
                stats.images_removed += 1;
            }
        }

        if stats != SweepStats::default() {
            tracing::info!(
                sessions_removed = stats.sessions_removed,
                images_removed = stats.images_removed,
                "Reaped expired entries"
            );
        }
        stats
    }

    /// Spawn the periodic sweep loop.
    pub fn start(self) -> ReaperHandle {
        let (stop, mut stopped) = watch::channel(false);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.sweep_interval);
            // The first tick fires immediately; skip it so a fresh start
            // does not sweep an empty store.
            ticker.tick().await;
            tracing::info!(
                interval_secs = self.config.sweep_interval.as_secs(),
                ttl_secs = self.config.ttl.as_secs(),
                "Reaper started"
            );
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.sweep().await;
                    }
                    _ = stopped.changed() => {
                        if *stopped.borrow() {
                            tracing::info!("Reaper stopped");
                            break;
                        }
                    }
                }
            }
        });
        ReaperHandle { stop, task }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, Utc};
    use parley_common::config::ImageConfig;

    fn stores() -> (Arc<SessionStore>, Arc<ImageCache>) {
        (
            Arc::new(SessionStore::new("system")),
            Arc::new(ImageCache::new(ImageConfig {
                max_bytes: 1024 * 1024,
                consume_on_use: false,
            })),
        )
    }

    fn reaper(sessions: Arc<SessionStore>, images: Arc<ImageCache>) -> Reaper {
        Reaper::new(
            sessions,
            images,
            ReaperConfig {
                ttl: Duration::from_secs(3600),
                sweep_interval: Duration::from_secs(60),
            },
        )
    }

    fn png_bytes() -> Vec<u8> {
        let img = image::RgbImage::from_pixel(2, 2, image::Rgb([0, 0, 0]));
        let mut out = Vec::new();
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut std::io::Cursor::new(&mut out), image::ImageFormat::Png)
            .unwrap();
        out
    }

    #[tokio::test]
    async fn test_sweep_removes_only_expired_entries() {
        let (sessions, images) = stores();
        let stale = sessions.resolve_or_create(None).await;
        let fresh = sessions.resolve_or_create(None).await;
        stale.handle.lock().await.last_activity = Utc::now() - ChronoDuration::seconds(7200);

        let stale_img = images.store(png_bytes(), "image/png").await.unwrap();
        let fresh_img = images.store(png_bytes(), "image/png").await.unwrap();
        images
            .backdate(&stale_img, Utc::now() - ChronoDuration::seconds(7200))
            .await;

        let stats = reaper(Arc::clone(&sessions), Arc::clone(&images))
            .sweep()
            .await;
        assert_eq!(
            stats,
            SweepStats {
                sessions_removed: 1,
                images_removed: 1,
            }
        );
        assert!(sessions.get(&stale.id).await.is_none());
        assert!(sessions.get(&fresh.id).await.is_some());
        assert!(images.fetch(&stale_img).await.is_none());
        assert!(images.fetch(&fresh_img).await.is_some());
    }

    #[tokio::test]
    async fn test_sweep_on_empty_stores_is_a_noop() {
        let (sessions, images) = stores();
        let stats = reaper(sessions, images).sweep().await;
        assert_eq!(stats, SweepStats::default());
    }

    #[tokio::test]
    async fn test_in_flight_session_survives_sweep() {
        let (sessions, images) = stores();
        let resolved = sessions.resolve_or_create(None).await;
        resolved.handle.lock().await.last_activity = Utc::now() - ChronoDuration::seconds(7200);

        // Lock held: the session is mid-exchange from the reaper's view.
        let guard = resolved.handle.lock().await;
        let r = reaper(Arc::clone(&sessions), images);
        let stats = r.sweep().await;
        assert_eq!(stats.sessions_removed, 0);
        drop(guard);

        let stats = r.sweep().await;
        assert_eq!(stats.sessions_removed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_loop_sweeps_and_stops() {
        let (sessions, images) = stores();
        let resolved = sessions.resolve_or_create(None).await;
        resolved.handle.lock().await.last_activity = Utc::now() - ChronoDuration::seconds(7200);

        let handle = reaper(Arc::clone(&sessions), images).start();
        // Let the task register its interval before moving the clock.
        tokio::task::yield_now().await;
        // Past the first (skipped) tick and one real interval.
        tokio::time::advance(Duration::from_secs(61)).await;
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;

        assert!(sessions.get(&resolved.id).await.is_none());
        handle.shutdown().await;
    }
}
