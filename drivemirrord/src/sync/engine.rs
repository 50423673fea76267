use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use drivemirror_core::{CrawlFrom, DeltaPage, DriveError, RemoteDrive};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::delta::partition_entries;
use super::index::{IndexError, MirrorStore};
use crate::context::DriveContext;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("index error: {0}")]
    Index(#[from] IndexError),
    #[error("api error: {0}")]
    Drive(#[from] DriveError),
    #[error("delta page carried neither a next-page nor a completion link")]
    MissingContinuation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SyncState {
    Idle,
    FreshCrawl,
    Resume,
    Paging,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CrawlMode {
    Fresh,
    Resumed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    Started {
        mode: CrawlMode,
    },
    CursorDiscarded,
    PageCommitted {
        upserts: usize,
        deletions: usize,
        processed: u64,
    },
    Completed {
        processed: u64,
    },
    Cancelled {
        processed: u64,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncSummary {
    pub mode: CrawlMode,
    pub pages: u64,
    pub upserted: u64,
    pub deleted: u64,
}

impl SyncSummary {
    fn new(mode: CrawlMode) -> Self {
        Self {
            mode,
            pages: 0,
            upserted: 0,
            deleted: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Another pass was already running in this process; nothing was done.
    AlreadyRunning,
    Completed(SyncSummary),
    /// Stopped at a page boundary; the cursor points at the next page.
    Cancelled(SyncSummary),
}

/// Incremental, resumable crawl of the remote tree into the mirror store.
///
/// The cursor is written right after each page is committed, so a crash
/// replays at most one page. Replays are harmless because upserts are keyed
/// by id and deletions tolerate missing ids.
pub struct SyncEngine {
    remote: Arc<dyn RemoteDrive>,
    store: Arc<MirrorStore>,
    running: AtomicBool,
    processed: AtomicU64,
    state: watch::Sender<SyncState>,
    events: Option<mpsc::UnboundedSender<SyncEvent>>,
}

impl SyncEngine {
    pub fn new(context: &DriveContext) -> Self {
        let (state, _) = watch::channel(SyncState::Idle);
        Self {
            remote: Arc::clone(&context.remote),
            store: Arc::clone(&context.store),
            running: AtomicBool::new(false),
            processed: AtomicU64::new(0),
            state,
            events: None,
        }
    }

    pub fn with_progress(mut self, events: mpsc::UnboundedSender<SyncEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn state(&self) -> SyncState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncState> {
        self.state.subscribe()
    }

    pub fn processed_items(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub async fn run(&self, cancel: &CancellationToken) -> Result<SyncOutcome, EngineError> {
        let Some(_guard) = RunGuard::acquire(&self.running) else {
            info!("sync already in progress; ignoring request");
            return Ok(SyncOutcome::AlreadyRunning);
        };

        match self.run_pass(cancel).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                warn!(error = %err, "sync pass failed; cursor left at last committed page");
                self.set_state(SyncState::Failed);
                Err(err)
            }
        }
    }

    /// Forgets the cursor and every mirrored record. Returns `false` while a
    /// pass is running.
    pub async fn reset(&self) -> Result<bool, EngineError> {
        let Some(_guard) = RunGuard::acquire(&self.running) else {
            return Ok(false);
        };
        self.store.clear_all().await?;
        self.set_state(SyncState::Idle);
        info!("mirror reset; next sync performs a fresh crawl");
        Ok(true)
    }

    async fn run_pass(&self, cancel: &CancellationToken) -> Result<SyncOutcome, EngineError> {
        let stored = self
            .store
            .get_cursor()
            .await?
            .filter(|cursor| !cursor.trim().is_empty());

        let (mode, mut page) = match stored {
            Some(link) => {
                self.set_state(SyncState::Resume);
                match self.remote.crawl(CrawlFrom::Link(&link)).await {
                    Ok(page) => (CrawlMode::Resumed, page),
                    Err(err) if err.is_cursor_expired() => {
                        warn!(error = %err, "stored cursor rejected; falling back to a fresh crawl");
                        self.store.clear_cursor().await?;
                        self.emit(SyncEvent::CursorDiscarded);
                        (CrawlMode::Fresh, self.fresh_first_page().await?)
                    }
                    Err(err) => return Err(err.into()),
                }
            }
            None => (CrawlMode::Fresh, self.fresh_first_page().await?),
        };

        info!(?mode, "sync pass started");
        self.emit(SyncEvent::Started { mode });
        self.set_state(SyncState::Paging);
        let mut summary = SyncSummary::new(mode);

        loop {
            self.commit_page(&page, &mut summary).await?;

            match (page.next_link.take(), page.delta_link.take()) {
                (Some(next), _) => {
                    self.store.set_cursor(&next).await?;
                    if cancel.is_cancelled() {
                        let processed = self.processed_items();
                        info!(pages = summary.pages, processed, "sync pass cancelled");
                        self.emit(SyncEvent::Cancelled { processed });
                        self.set_state(SyncState::Idle);
                        return Ok(SyncOutcome::Cancelled(summary));
                    }
                    page = self.remote.crawl(CrawlFrom::Link(&next)).await?;
                }
                (None, Some(completion)) => {
                    self.store.set_cursor(&completion).await?;
                    let processed = self.processed_items();
                    info!(
                        pages = summary.pages,
                        upserted = summary.upserted,
                        deleted = summary.deleted,
                        "sync pass completed"
                    );
                    self.emit(SyncEvent::Completed { processed });
                    self.set_state(SyncState::Completed);
                    return Ok(SyncOutcome::Completed(summary));
                }
                (None, None) => return Err(EngineError::MissingContinuation),
            }
        }
    }

    async fn fresh_first_page(&self) -> Result<DeltaPage, EngineError> {
        self.set_state(SyncState::FreshCrawl);
        let root = self.remote.get_root().await?;
        debug!(root = %root.id, "starting fresh crawl from root");
        Ok(self.remote.crawl(CrawlFrom::Root(&root.id)).await?)
    }

    async fn commit_page(
        &self,
        page: &DeltaPage,
        summary: &mut SyncSummary,
    ) -> Result<(), EngineError> {
        let changes = partition_entries(&page.value);
        let deleted = self.store.delete_many(&changes.deletions).await?;
        let upserted = self.store.upsert_many(&changes.upserts).await?;

        let handled = (changes.upserts.len() + changes.deletions.len()) as u64;
        let processed = self.processed.fetch_add(handled, Ordering::Relaxed) + handled;
        summary.pages += 1;
        summary.upserted += upserted as u64;
        summary.deleted += deleted;

        debug!(
            upserts = changes.upserts.len(),
            deletions = changes.deletions.len(),
            ignored = changes.ignored,
            processed,
            "delta page committed"
        );
        self.emit(SyncEvent::PageCommitted {
            upserts: changes.upserts.len(),
            deletions: changes.deletions.len(),
            processed,
        });
        Ok(())
    }

    fn set_state(&self, state: SyncState) {
        self.state.send_replace(state);
    }

    fn emit(&self, event: SyncEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }
}

/// Single-flight flag, released on every exit path.
struct RunGuard<'a>(&'a AtomicBool);

impl<'a> RunGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;
