//! Cursor pagination over internal sequences.
//!
//! [`Paginator::next`] turns an iterator into batches. When items remain
//! after a batch, the rest of the iterator is parked under a fresh random
//! cursor. A cursor resolves at most once: lookup and removal are one
//! step, so concurrent callers presenting the same cursor see exactly one
//! winner. Parked iterators are evicted after the idle timeout.

use std::collections::HashMap;
use std::iter::Peekable;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use fastacp_core::logging::targets;
use fastacp_core::{AcpError, PaginationConfig};
use fastacp_protocol::schema::ListSessionsRequest;
use tokio::task::AbortHandle;
use tokio::time::Instant;

use crate::error::HandlerError;

/// Bytes of randomness in a cursor.
const CURSOR_BYTES: usize = 16;

/// A request that may carry a pagination cursor.
pub trait PaginatedRequest {
    /// The cursor from a previous page, or `None` for the first page.
    fn cursor(&self) -> Option<&str>;
}

impl PaginatedRequest for ListSessionsRequest {
    fn cursor(&self) -> Option<&str> {
        self.cursor.as_deref()
    }
}

/// Pagination failure.
#[derive(Debug)]
pub enum PaginationError {
    /// Batch size must be at least 1.
    InvalidBatchSize,
    /// Idle timeout must be positive.
    InvalidIdleTimeout,
    /// The cursor is unknown, already consumed, or evicted.
    InvalidCursor(String),
    /// The system random source failed.
    Rng(getrandom::Error),
}

impl std::fmt::Display for PaginationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PaginationError::InvalidBatchSize => write!(f, "Batch size must be at least 1"),
            PaginationError::InvalidIdleTimeout => write!(f, "Idle timeout must be positive"),
            PaginationError::InvalidCursor(cursor) => {
                write!(f, "Invalid or expired cursor: {cursor}")
            }
            PaginationError::Rng(err) => write!(f, "Cursor generation failed: {err}"),
        }
    }
}

impl std::error::Error for PaginationError {}

impl From<PaginationError> for AcpError {
    fn from(err: PaginationError) -> Self {
        match err {
            PaginationError::InvalidCursor(ref cursor) => AcpError::invalid_params(err.to_string())
                .with_data(serde_json::json!({ "cursor": cursor })),
            other => AcpError::internal_error(other.to_string()),
        }
    }
}

impl From<PaginationError> for HandlerError {
    fn from(err: PaginationError) -> Self {
        HandlerError::Rpc(err.into())
    }
}

type Remaining<T> = Peekable<Box<dyn Iterator<Item = T> + Send>>;

struct CursorEntry<T> {
    items: Remaining<T>,
    expires_at: Instant,
    eviction: Option<AbortHandle>,
}

type CursorTable<T> = Arc<Mutex<HashMap<String, CursorEntry<T>>>>;

fn lock<T>(table: &Mutex<T>) -> MutexGuard<'_, T> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Single-use cursor pagination with idle eviction.
pub struct Paginator<T> {
    batch_size: usize,
    idle_timeout: Duration,
    cursors: CursorTable<T>,
}

impl<T: Send + 'static> Paginator<T> {
    /// Creates a paginator.
    ///
    /// # Errors
    ///
    /// Fails if `batch_size` is zero or `idle_timeout` is zero.
    pub fn new(batch_size: usize, idle_timeout: Duration) -> Result<Self, PaginationError> {
        if batch_size == 0 {
            return Err(PaginationError::InvalidBatchSize);
        }
        if idle_timeout.is_zero() {
            return Err(PaginationError::InvalidIdleTimeout);
        }
        Ok(Self {
            batch_size,
            idle_timeout,
            cursors: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Creates a paginator from configuration.
    ///
    /// # Errors
    ///
    /// As [`Paginator::new`].
    pub fn from_config(config: &PaginationConfig) -> Result<Self, PaginationError> {
        Self::new(config.batch_size, config.idle_timeout)
    }

    /// Maximum number of items per page.
    #[must_use]
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Number of live cursors.
    #[must_use]
    pub fn live_cursors(&self) -> usize {
        lock(&self.cursors).len()
    }

    /// Produces the next page.
    ///
    /// Without a cursor, `sequence` is called for a fresh iterator. With
    /// one, the parked iterator is taken out of the table. `build` receives
    /// the request, the batch and the next cursor (`None` on the last page).
    ///
    /// Eviction timers run on the ambient tokio runtime; without one,
    /// expired cursors are still rejected when presented.
    ///
    /// # Errors
    ///
    /// Fails with [`PaginationError::InvalidCursor`] for an unknown,
    /// consumed or expired cursor.
    pub fn next<Req, Res, I, S, B>(
        &self,
        request: &Req,
        sequence: S,
        build: B,
    ) -> Result<Res, PaginationError>
    where
        Req: PaginatedRequest + ?Sized,
        I: Iterator<Item = T> + Send + 'static,
        S: FnOnce(&Req) -> I,
        B: FnOnce(&Req, Vec<T>, Option<String>) -> Res,
    {
        let mut items: Remaining<T> = match request.cursor() {
            None => {
                let fresh: Box<dyn Iterator<Item = T> + Send> = Box::new(sequence(request));
                fresh.peekable()
            }
            Some(cursor) => self.take(cursor)?,
        };

        let batch: Vec<T> = items.by_ref().take(self.batch_size).collect();
        let next_cursor = if items.peek().is_some() {
            Some(self.park(items)?)
        } else {
            None
        };
        Ok(build(request, batch, next_cursor))
    }

    fn take(&self, cursor: &str) -> Result<Remaining<T>, PaginationError> {
        let entry = lock(&self.cursors).remove(cursor);
        let Some(entry) = entry else {
            log::warn!(target: targets::PAGINATION, "rejected unknown cursor {}", cursor);
            return Err(PaginationError::InvalidCursor(cursor.to_owned()));
        };
        if let Some(eviction) = &entry.eviction {
            eviction.abort();
        }
        if Instant::now() >= entry.expires_at {
            log::warn!(target: targets::PAGINATION, "rejected expired cursor {}", cursor);
            return Err(PaginationError::InvalidCursor(cursor.to_owned()));
        }
        log::trace!(target: targets::PAGINATION, "resumed cursor {}", cursor);
        Ok(entry.items)
    }

    fn park(&self, items: Remaining<T>) -> Result<String, PaginationError> {
        let cursor = mint_cursor()?;
        let mut cursors = lock(&self.cursors);
        // Spawned under the lock so the timer cannot fire before the entry exists.
        let eviction = tokio::runtime::Handle::try_current().ok().map(|runtime| {
            runtime
                .spawn(evict_after(
                    Arc::downgrade(&self.cursors),
                    cursor.clone(),
                    self.idle_timeout,
                ))
                .abort_handle()
        });
        cursors.insert(
            cursor.clone(),
            CursorEntry {
                items,
                expires_at: Instant::now() + self.idle_timeout,
                eviction,
            },
        );
        log::trace!(target: targets::PAGINATION, "parked cursor {}", cursor);
        Ok(cursor)
    }
}

impl<T> Drop for Paginator<T> {
    fn drop(&mut self) {
        for entry in lock(&self.cursors).values() {
            if let Some(eviction) = &entry.eviction {
                eviction.abort();
            }
        }
    }
}

impl<T> std::fmt::Debug for Paginator<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Paginator")
            .field("batch_size", &self.batch_size)
            .field("idle_timeout", &self.idle_timeout)
            .field("live_cursors", &lock(&self.cursors).len())
            .finish()
    }
}

async fn evict_after<T>(cursors: Weak<Mutex<HashMap<String, CursorEntry<T>>>>, cursor: String, delay: Duration) {
    tokio::time::sleep(delay).await;
    let Some(cursors) = cursors.upgrade() else {
        return;
    };
    if lock(&cursors).remove(&cursor).is_some() {
        log::debug!(target: targets::PAGINATION, "evicted idle cursor {}", cursor);
    }
}

fn mint_cursor() -> Result<String, PaginationError> {
    let mut bytes = [0u8; CURSOR_BYTES];
    getrandom::fill(&mut bytes).map_err(PaginationError::Rng)?;
    Ok(bytes.iter().map(|b| format!("{b:02x}")).collect())
}
