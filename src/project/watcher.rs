//! Build output watcher
//!
//! Watches each module's `build/generated` tree and calls back once a burst
//! of file events has been quiet for a while, so one Gradle build triggers
//! one classpath reload.

use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, info, trace, warn};

#[derive(Debug, Error)]
pub enum WatcherError {
    #[error("File watcher error: {0}")]
    Notify(#[from] notify::Error),
}

/// Coalescing timer: fires once per burst, after `quiet` without events
#[derive(Debug, Clone)]
pub struct QuietPeriod {
    quiet: Duration,
    last_event: Option<Instant>,
}

impl QuietPeriod {
    pub fn new(quiet: Duration) -> Self {
        Self {
            quiet,
            last_event: None,
        }
    }

    pub fn record(&mut self, now: Instant) {
        self.last_event = Some(now);
    }

    /// When the current burst settles, if one is pending
    pub fn deadline(&self) -> Option<Instant> {
        self.last_event.map(|last| last + self.quiet)
    }

    /// True exactly once per burst, when `now` has reached the deadline
    pub fn poll(&mut self, now: Instant) -> bool {
        match self.deadline() {
            Some(deadline) if now >= deadline => {
                self.last_event = None;
                true
            }
            _ => false,
        }
    }
}

pub struct BuildWatcher {
    _watcher: RecommendedWatcher,
    watched: Vec<PathBuf>,
    task: JoinHandle<()>,
}

impl BuildWatcher {
    /// Watch `dirs` recursively; missing directories are skipped
    pub fn spawn<F, Fut>(
        dirs: Vec<PathBuf>,
        quiet: Duration,
        on_settled: F,
    ) -> Result<Self, WatcherError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();

        let mut watcher = notify::recommended_watcher(
            move |result: notify::Result<notify::Event>| match result {
                Ok(event) => {
                    if matches!(
                        event.kind,
                        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
                    ) {
                        trace!("Build output event: {:?} {:?}", event.kind, event.paths);
                        let _ = tx.send(());
                    }
                }
                Err(e) => warn!("Build watcher error: {}", e),
            },
        )?;

        let mut watched = Vec::new();
        for dir in dirs {
            if !dir.is_dir() {
                debug!("Not watching missing directory {}", dir.display());
                continue;
            }
            watcher.watch(&dir, RecursiveMode::Recursive)?;
            watched.push(dir);
        }
        info!("Watching {} build output directories", watched.len());

        let task = spawn_settle_loop(rx, quiet, on_settled);
        Ok(Self {
            _watcher: watcher,
            watched,
            task,
        })
    }

    pub fn watched(&self) -> &[PathBuf] {
        &self.watched
    }

    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for BuildWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Drain `events` and call `on_settled` once per quiet burst
fn spawn_settle_loop<F, Fut>(
    mut events: mpsc::UnboundedReceiver<()>,
    quiet: Duration,
    on_settled: F,
) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let on_settled = Arc::new(on_settled);
    tokio::spawn(async move {
        let mut timer = QuietPeriod::new(quiet);
        loop {
            let deadline = timer.deadline();
            tokio::select! {
                event = events.recv() => match event {
                    Some(()) => timer.record(Instant::now()),
                    None => break,
                },
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    if timer.poll(Instant::now()) {
                        info!("Build outputs settled, reloading classpath");
                        on_settled().await;
                    }
                }
            }
        }
        debug!("Build watcher loop finished");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_quiet_period_fires_once_per_burst() {
        let start = Instant::now();
        let mut timer = QuietPeriod::new(Duration::from_millis(500));
        assert_eq!(timer.deadline(), None);
        assert!(!timer.poll(start));

        timer.record(start);
        timer.record(start + Duration::from_millis(300));
        assert_eq!(timer.deadline(), Some(start + Duration::from_millis(800)));
        assert!(!timer.poll(start + Duration::from_millis(799)));
        assert!(timer.poll(start + Duration::from_millis(800)));
        assert!(!timer.poll(start + Duration::from_millis(2000)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_settle_loop_coalesces_bursts() {
        let (tx, rx) = mpsc::unbounded_channel();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let task = spawn_settle_loop(rx, Duration::from_millis(500), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        for _ in 0..5 {
            tx.send(()).unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        tx.send(()).unwrap();
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 2);

        drop(tx);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_directories_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let existing = dir.path().join("build/generated");
        std::fs::create_dir_all(&existing).unwrap();

        let watcher = BuildWatcher::spawn(
            vec![existing.clone(), dir.path().join("missing")],
            Duration::from_millis(50),
            || async {},
        )
        .unwrap();
        assert_eq!(watcher.watched(), &[existing]);
        watcher.stop();
    }
}
