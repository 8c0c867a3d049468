use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::debug;

use super::store::ValueStore;
use crate::config::DhtConfig;

/// Periodically drops stored values older than `max_age`.
pub struct KeyExpirer {
    store: Arc<ValueStore>,
    max_age: Duration,
    interval: Duration,
    initial_delay: Duration,
}

impl KeyExpirer {
    pub fn new(store: Arc<ValueStore>, config: &DhtConfig) -> Self {
        Self {
            store,
            max_age: config.key_max_age,
            interval: config.expire_interval,
            initial_delay: config.expire_initial_delay,
        }
    }

    /// One sweep. Returns the number of values removed.
    pub fn do_expire(&self) -> usize {
        let Some(cutoff) = Instant::now().checked_sub(self.max_age) else {
            return 0;
        };
        let removed = self.store.expire(cutoff);
        if removed > 0 {
            debug!("expired {} stored values", removed);
        }
        removed
    }

    /// Sweeps after the initial delay and then every `interval` until the
    /// returned handle is aborted.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            sleep(self.initial_delay).await;
            loop {
                self.do_expire();
                sleep(self.interval).await;
            }
        })
    }
}
