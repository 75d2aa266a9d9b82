use crate::{
    key::{
        split_key,
        KeyError,
    },
    queue::WorkQueue,
    sync::Synchronize,
    watch_group::WatchGroups,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error(transparent)]
    MalformedKey(#[from] KeyError),
    #[error("namespace {namespace:?} is not watched by this controller")]
    NotWatched { namespace: String },
    #[error("VirtualServer {key} not found in cache")]
    NotFound { key: String },
    #[error("sync failed: {0:#}")]
    Sync(eyre::Report),
}

impl ProcessError {
    /// Malformed keys and unwatched namespaces will never succeed, everything else might.
    pub fn is_retryable(&self) -> bool {
        match self {
            ProcessError::MalformedKey(_) | ProcessError::NotWatched { .. } => false,
            ProcessError::NotFound { .. } | ProcessError::Sync(_) => true,
        }
    }
}

/// Drains the work queue one key at a time.
pub struct Worker<S: ?Sized> {
    queue: WorkQueue,
    groups: Arc<WatchGroups>,
    sync: Arc<S>,
}

/// Marks the key done when the current iteration ends, however it ends.
struct DoneGuard<'a> {
    queue: &'a WorkQueue,
    key: &'a str,
}

impl Drop for DoneGuard<'_> {
    fn drop(&mut self) {
        self.queue.done(self.key);
    }
}

impl<S: Synchronize + ?Sized> Worker<S> {
    pub fn new(queue: WorkQueue, groups: Arc<WatchGroups>, sync: Arc<S>) -> Self {
        Self { queue, groups, sync }
    }

    /// Runs until the queue shuts down. An item that is being processed when that happens is finished
    /// first.
    pub async fn run(&self, token: CancellationToken) {
        debug!(queue = %self.queue.name(), "processing items on the work queue");

        while let Some(key) = self.queue.get().await {
            let _done = DoneGuard {
                queue: &self.queue,
                key: &key,
            };

            match self.process(&token, &key).await {
                Ok(()) => {
                    self.queue.forget(&key);
                    debug!(%key, "finished processing work item");
                }
                Err(err) if err.is_retryable() => {
                    let delay = self.queue.add_with_backoff(&key);
                    debug!(%key, ?delay, "re-queueing item due to error processing: {err}");
                }
                Err(err @ ProcessError::MalformedKey(_)) => {
                    self.queue.forget(&key);
                    error!("{err}");
                }
                Err(err) => {
                    self.queue.forget(&key);
                    warn!(%key, "dropping work item: {err}");
                }
            }
        }

        debug!(queue = %self.queue.name(), "work queue shut down, worker exiting");
    }

    #[instrument(level = "debug", skip(self, token))]
    pub async fn process(&self, token: &CancellationToken, key: &str) -> Result<(), ProcessError> {
        let (namespace, name) = split_key(key)?;

        let group = self.groups.resolve(namespace).ok_or_else(|| ProcessError::NotWatched {
            namespace: namespace.to_string(),
        })?;

        let vs = group
            .get_parent(namespace, name)
            .ok_or_else(|| ProcessError::NotFound { key: key.to_string() })?;

        debug!("processing virtual server resource");
        self.sync.sync(token, vs).await.map_err(ProcessError::Sync)
    }
}
