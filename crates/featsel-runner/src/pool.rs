use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::scheduler::{JobId, Scheduler};

/// How long one listing is reused before the scheduler is asked again.
pub const DEFAULT_LISTING_MAX_AGE: Duration = Duration::from_secs(1);

/// Shared view of which jobs the scheduler considers live.
///
/// Jobs polling concurrently go through one `JobPool`, so a round of N jobs
/// costs one listing per `max_age` instead of N.
pub struct JobPool {
    scheduler: Arc<dyn Scheduler>,
    max_age: Duration,
    cached: Mutex<Option<(Instant, Arc<BTreeSet<JobId>>)>>,
}

impl JobPool {
    pub fn new(scheduler: Arc<dyn Scheduler>) -> Self {
        Self::with_max_age(scheduler, DEFAULT_LISTING_MAX_AGE)
    }

    pub fn with_max_age(scheduler: Arc<dyn Scheduler>, max_age: Duration) -> Self {
        Self {
            scheduler,
            max_age,
            cached: Mutex::new(None),
        }
    }

    pub fn scheduler(&self) -> &dyn Scheduler {
        self.scheduler.as_ref()
    }

    pub fn live_ids(&self) -> Result<Arc<BTreeSet<JobId>>> {
        let mut cached = self
            .cached
            .lock()
            .map_err(|_| Error::Scheduler("live id cache poisoned".to_string()))?;
        if let Some((at, ids)) = cached.as_ref() {
            if at.elapsed() < self.max_age {
                return Ok(Arc::clone(ids));
            }
        }
        let ids = Arc::new(self.scheduler.live_ids()?);
        *cached = Some((Instant::now(), Arc::clone(&ids)));
        Ok(ids)
    }

    pub fn is_live(&self, id: JobId) -> Result<bool> {
        Ok(self.live_ids()?.contains(&id))
    }

    /// Drops the cached listing so the next query hits the scheduler.
    pub fn invalidate(&self) {
        if let Ok(mut cached) = self.cached.lock() {
            *cached = None;
        }
    }

    /// Requests deletion of every live job. Individual failures are logged,
    /// not returned. Returns how many deletions were requested.
    pub fn kill_all(&self) -> Result<usize> {
        let ids = self.scheduler.live_ids()?;
        for id in ids.iter() {
            if let Err(err) = self.scheduler.delete(*id) {
                warn!(job_id = id, error = %err, "delete request failed");
            }
        }
        self.invalidate();
        info!(count = ids.len(), "requested deletion of all live jobs");
        Ok(ids.len())
    }
}
