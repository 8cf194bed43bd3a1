//! Guarantees at-most-one concurrent build per fingerprint.
//!
//! Concurrent callers asking for the same derived file either win a build
//! ticket and run the driver, or find one already in flight and wait on it;
//! nobody ever starts a second `flac`/`lame`/`oggenc` pipeline for the same
//! fingerprint while the first is still running.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info};

use crate::cache::{CacheError, CacheHandle, CacheStore, ProbeResult};
use crate::drivers::{BuildSource, Driver, DriverError};
use crate::fingerprint::Fingerprint;

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),
    #[error("driver error: {0}")]
    Driver(#[from] DriverError),
    #[error("build was cancelled before completion")]
    Cancelled,
    /// A concurrent waiter's view of a build that failed in the builder
    /// task; `DriverError`/`CacheError` are not `Clone`; the message is
    /// preserved, the type is not.
    #[error("build failed: {0}")]
    ObservedFailure(String),
}

struct Ticket {
    notify: Notify,
    outcome: Mutex<Option<Result<(), Arc<String>>>>,
}

/// Coordinates get-or-build requests against a [`CacheStore`].
#[derive(Clone)]
pub struct BuildCoordinator {
    cache: CacheStore,
    tickets: Arc<Mutex<HashMap<Fingerprint, Arc<Ticket>>>>,
}

impl BuildCoordinator {
    pub fn new(cache: CacheStore) -> Self {
        BuildCoordinator {
            cache,
            tickets: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    /// Return a pinned handle to the ready entry for `fp`, building it first
    /// if necessary. Only one caller per fingerprint ever invokes `driver`;
    /// the rest wait on its result.
    pub async fn get_or_build(
        &self,
        fp: Fingerprint,
        source: &BuildSource,
        driver: &dyn Driver,
    ) -> Result<CacheHandle, CoordinatorError> {
        if let ProbeResult::Ready { .. } = self.cache.probe(fp).await {
            return Ok(self.cache.acquire(fp).await?);
        }

        enum Role {
            Builder(Arc<Ticket>),
            Waiter(Arc<Ticket>),
        }

        // Holding `tickets` locked across the "does an entry exist" check
        // and the insert is what makes exactly one caller become the
        // builder; everyone else observes the ticket it just inserted.
        let role = {
            let mut tickets = self.tickets.lock().await;
            match tickets.get(&fp) {
                Some(existing) => Role::Waiter(existing.clone()),
                None => {
                    let fresh = Arc::new(Ticket {
                        notify: Notify::new(),
                        outcome: Mutex::new(None),
                    });
                    tickets.insert(fp, fresh.clone());
                    Role::Builder(fresh)
                }
            }
        };

        match role {
            Role::Builder(ticket) => self.build_and_resolve(fp, source, driver, ticket).await,
            Role::Waiter(ticket) => self.wait_for(fp, ticket).await,
        }
    }

    async fn build_and_resolve(
        &self,
        fp: Fingerprint,
        source: &BuildSource,
        driver: &dyn Driver,
        ticket: Arc<Ticket>,
    ) -> Result<CacheHandle, CoordinatorError> {
        let result = self.run_build(fp, source, driver).await;

        {
            let mut outcome = ticket.outcome.lock().await;
            *outcome = Some(result.as_ref().map(|_| ()).map_err(|e| Arc::new(e.to_string())));
        }
        ticket.notify.notify_waiters();

        self.tickets.lock().await.remove(&fp);

        result
    }

    async fn run_build(
        &self,
        fp: Fingerprint,
        source: &BuildSource,
        driver: &dyn Driver,
    ) -> Result<CacheHandle, CoordinatorError> {
        let slot = match self.cache.reserve(fp).await {
            Ok(slot) => slot,
            Err(CacheError::AlreadyReserved(_)) => {
                // We won ticket election because no ticket existed for `fp`,
                // but the cache entry itself is not `absent`: an earlier
                // build (whose ticket we never saw, because it resolved and
                // was removed between our `probe` and our taking the ticket
                // lock) already promoted it. Treat this the same as losing a
                // `reserve` race: the entry is ready, so hand it back instead
                // of failing the caller.
                return Ok(self.cache.acquire(fp).await?);
            }
            Err(e) => return Err(e.into()),
        };
        debug!(fingerprint = %fp, "coordinator: starting build");

        match driver.run_to_sink(source, &slot.path).await {
            Ok(()) => {
                let (_, len) = self.cache.promote(slot).await?;
                info!(fingerprint = %fp, bytes = len, "coordinator: build complete");
                Ok(self.cache.acquire(fp).await?)
            }
            Err(e) => {
                self.cache.abandon(slot).await?;
                Err(CoordinatorError::Driver(e))
            }
        }
    }

    async fn wait_for(&self, fp: Fingerprint, ticket: Arc<Ticket>) -> Result<CacheHandle, CoordinatorError> {
        loop {
            // `enable()` registers this waiter before we check `outcome`, so
            // a `notify_waiters()` that lands between the check and the
            // `.await` below is not missed (see tokio::sync::Notify docs).
            let notified = ticket.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let outcome = ticket.outcome.lock().await;
                if let Some(result) = outcome.as_ref() {
                    return match result {
                        Ok(()) => Ok(self.cache.acquire(fp).await?),
                        Err(msg) => Err(CoordinatorError::ObservedFailure((**msg).clone())),
                    };
                }
            }
            notified.await;
        }
    }
}
