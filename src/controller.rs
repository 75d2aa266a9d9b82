//! Wires the watches, the work queue and the worker together.
//!
//! Lifecycle: `Constructed` → `Running` → `Draining` → `Stopped`. [`Controller::run`] starts every watch
//! group, waits until all caches have synced, then runs a single worker until the stop token is
//! cancelled. No VirtualServer is synchronized before every cache has finished its initial listing.
//! The queue capacity only applies once the worker runs, the initial listings always fit.

use crate::{
    key::key_for,
    queue::{
        AddOutcome,
        WorkQueue,
    },
    rate_limiter::BackoffConfig,
    sync::Synchronize,
    translate::EventTranslator,
    watch_group::{
        SyncCheck,
        WatchGroups,
    },
    worker::Worker,
};
use std::{
    sync::Arc,
    time::Duration,
};
use tokio::{
    sync::watch,
    time::MissedTickBehavior,
};
use tokio_util::sync::CancellationToken;

pub const CONTROLLER_NAME: &str = "externaldns";

const DEFAULT_QUEUE_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Constructed,
    Running,
    Draining,
    Stopped,
}

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("cache {0} stopped before it synced")]
    CacheSync(String),
    #[error("caches did not sync within {0:?}")]
    CacheSyncTimeout(Duration),
    #[error("stopped while waiting for caches to sync")]
    Cancelled,
    #[error("controller was already started")]
    AlreadyStarted,
}

#[derive(Debug, Clone)]
pub struct ControllerOpts {
    pub name: String,
    pub backoff: BackoffConfig,
    /// Upper bound for waiting keys, `None` for an unbounded queue.
    pub queue_capacity: Option<usize>,
    /// How long to wait for the caches before giving up, `None` to wait until stopped.
    pub cache_sync_timeout: Option<Duration>,
    /// Queue every cached VirtualServer again at this interval, `None` to only react to changes.
    pub resync_period: Option<Duration>,
}

impl Default for ControllerOpts {
    fn default() -> Self {
        Self {
            name: CONTROLLER_NAME.to_string(),
            backoff: BackoffConfig::default(),
            queue_capacity: Some(DEFAULT_QUEUE_CAPACITY),
            cache_sync_timeout: None,
            resync_period: None,
        }
    }
}

pub struct Controller<S: ?Sized> {
    name: String,
    groups: Arc<WatchGroups>,
    queue: WorkQueue,
    sync: Arc<S>,
    cache_sync_timeout: Option<Duration>,
    resync_period: Option<Duration>,
    state: watch::Sender<ControllerState>,
}

impl<S: Synchronize + ?Sized + 'static> Controller<S> {
    pub fn new(groups: WatchGroups, sync: Arc<S>, opts: ControllerOpts) -> Self {
        let (state, _) = watch::channel(ControllerState::Constructed);
        let queue = WorkQueue::new(opts.name.clone(), &opts.backoff, opts.queue_capacity);
        // nothing drains the queue before the caches have synced
        queue.suspend_capacity();
        Self {
            queue,
            name: opts.name,
            groups: Arc::new(groups),
            sync,
            cache_sync_timeout: opts.cache_sync_timeout,
            resync_period: opts.resync_period,
            state,
        }
    }

    pub fn queue(&self) -> &WorkQueue {
        &self.queue
    }

    pub fn state(&self) -> ControllerState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ControllerState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: ControllerState) {
        debug!(controller = %self.name, ?state, "controller state changed");
        self.state.send_replace(state);
    }

    /// Runs the controller until `stop` is cancelled. Returns an error if the caches could not be
    /// synced. Apart from [`ControllerError::Cancelled`] the caller is expected to treat that as fatal.
    pub async fn run(&self, stop: CancellationToken) -> Result<(), ControllerError> {
        let started = self.state.send_if_modified(|state| {
            if *state == ControllerState::Constructed {
                *state = ControllerState::Running;
                true
            } else {
                false
            }
        });
        if !started {
            return Err(ControllerError::AlreadyStarted);
        }

        info!(controller = %self.name, "starting external-dns control loop");

        // watches outlive `stop` until the worker has drained
        let watch_token = CancellationToken::new();
        let translator = EventTranslator::new(self.queue.clone());
        let mut watches = Vec::new();
        for group in self.groups.groups() {
            watches.extend(group.start(&translator, &watch_token));
        }

        let checks: Vec<SyncCheck> = self
            .groups
            .groups()
            .flat_map(|group| group.has_synced_checks())
            .collect();
        debug!(controller = %self.name, "waiting for {} caches to sync", checks.len());

        if let Err(err) = wait_for_cache_sync(checks, &stop, self.cache_sync_timeout).await {
            error!(controller = %self.name, "error syncing caches: {err}");
            self.queue.shut_down();
            watch_token.cancel();
            futures::future::join_all(watches).await;
            self.set_state(ControllerState::Stopped);
            return Err(err);
        }

        self.queue.resume_capacity();
        debug!(controller = %self.name, "caches synced, queue has {} items", self.queue.len());

        if let Some(period) = self.resync_period {
            watches.push(tokio::spawn(resync(
                self.groups.clone(),
                self.queue.clone(),
                period,
                watch_token.clone(),
            )));
        }

        let worker = Worker::new(self.queue.clone(), self.groups.clone(), self.sync.clone());
        let worker_task = tokio::spawn({
            let stop = stop.clone();
            async move { worker.run(stop).await }
        });

        stop.cancelled().await;

        self.set_state(ControllerState::Draining);
        debug!(controller = %self.name, "shutting down queue as stop was signaled");
        self.queue.shut_down();
        if let Err(err) = worker_task.await {
            error!(controller = %self.name, "worker task failed: {err}");
        }

        watch_token.cancel();
        futures::future::join_all(watches).await;
        self.set_state(ControllerState::Stopped);
        info!(controller = %self.name, "controller stopped");
        Ok(())
    }
}

/// Queues every cached VirtualServer once per `period`, starting one period from now.
async fn resync(groups: Arc<WatchGroups>, queue: WorkQueue, period: Duration, token: CancellationToken) {
    let mut ticks = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticks.tick() => {}
        }

        let keys: Vec<String> = groups
            .groups()
            .flat_map(|group| group.parents().state())
            .map(|vs| key_for(vs.as_ref()))
            .collect();
        debug!("resyncing {} VirtualServers", keys.len());
        for key in keys {
            if queue.add(key).await == AddOutcome::ShuttingDown {
                return;
            }
        }
    }
}

/// Waits until every check has passed. Fails as soon as one check fails, the timeout expires or
/// `stop` is cancelled.
pub async fn wait_for_cache_sync(
    checks: Vec<SyncCheck>,
    stop: &CancellationToken,
    timeout: Option<Duration>,
) -> Result<(), ControllerError> {
    let all = futures::future::try_join_all(checks.into_iter().map(SyncCheck::wait));
    let synced = async {
        let synced = match timeout {
            Some(timeout) => tokio::time::timeout(timeout, all)
                .await
                .map_err(|_| ControllerError::CacheSyncTimeout(timeout))?,
            None => all.await,
        };
        synced.map(|_| ())
    };

    tokio::select! {
        _ = stop.cancelled() => Err(ControllerError::Cancelled),
        result = synced => result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        testing::{
            listing,
            virtual_server,
            RecordingSync,
            TestGroup,
        },
        watch_group::WatchGroup,
    };
    use kube::runtime::watcher;
    use tokio::{
        sync::mpsc::UnboundedReceiver,
        time::Instant,
    };

    fn controller(
        groups: WatchGroups,
        timeout: Option<Duration>,
    ) -> (Arc<Controller<RecordingSync>>, UnboundedReceiver<String>) {
        controller_with(
            groups,
            ControllerOpts {
                cache_sync_timeout: timeout,
                ..Default::default()
            },
        )
    }

    fn controller_with(
        groups: WatchGroups,
        opts: ControllerOpts,
    ) -> (Arc<Controller<RecordingSync>>, UnboundedReceiver<String>) {
        let (sync, calls) = RecordingSync::new();
        (Arc::new(Controller::new(groups, sync, opts)), calls)
    }

    fn spawn_run(
        controller: &Arc<Controller<RecordingSync>>,
        stop: &CancellationToken,
    ) -> tokio::task::JoinHandle<Result<(), ControllerError>> {
        let controller = controller.clone();
        let stop = stop.clone();
        tokio::spawn(async move { controller.run(stop).await })
    }

    #[tokio::test]
    async fn nothing_is_synced_before_caches_are_ready() {
        let mut team_a = TestGroup::new("team-a");
        let mut team_b = TestGroup::new("team-b");
        // team-a finishes its initial listing early
        team_a.sync([virtual_server("team-a", "cafe")]);

        let mut groups = WatchGroups::new();
        groups.register("team-a", team_a.group);
        groups.register("team-b", team_b.group);
        let (controller, mut calls) = controller(groups, None);
        controller.queue().add("team-a/cafe").await;

        let stop = CancellationToken::new();
        let run = spawn_run(&controller, &stop);
        tokio::task::yield_now().await;
        assert_eq!(controller.state(), ControllerState::Running);

        team_b.parents.apply_watcher_event(&watcher::Event::Init);
        team_b.parents.apply_watcher_event(&watcher::Event::InitApply(virtual_server("team-b", "tea")));
        tokio::task::yield_now().await;
        assert!(calls.try_recv().is_err());

        team_b.parents.apply_watcher_event(&watcher::Event::InitDone);
        tokio::task::yield_now().await;
        assert!(calls.try_recv().is_err());

        team_b.children.apply_watcher_event(&watcher::Event::Init);
        team_b.children.apply_watcher_event(&watcher::Event::InitDone);
        assert_eq!(calls.recv().await.as_deref(), Some("team-a/cafe"));

        controller.queue().add("team-b/tea").await;
        assert_eq!(calls.recv().await.as_deref(), Some("team-b/tea"));

        stop.cancel();
        run.await.unwrap().unwrap();
        assert_eq!(controller.state(), ControllerState::Stopped);
        assert!(controller.queue().is_shutting_down());
    }

    #[tokio::test]
    async fn abandoned_cache_fails_startup() {
        let TestGroup { group, parents, children: _children } = TestGroup::new("team-a");
        let mut groups = WatchGroups::new();
        groups.register("team-a", group);
        let (controller, mut calls) = controller(groups, None);

        let stop = CancellationToken::new();
        let run = spawn_run(&controller, &stop);
        drop(parents);

        let err = run.await.unwrap().unwrap_err();
        assert!(matches!(err, ControllerError::CacheSync(_)), "{err}");
        assert_eq!(controller.state(), ControllerState::Stopped);
        assert!(calls.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_caches_time_out() {
        let test = TestGroup::new("team-a");
        let mut groups = WatchGroups::new();
        groups.register("team-a", test.group);
        let (controller, _calls) = controller(groups, Some(Duration::from_secs(30)));

        let err = controller.run(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, ControllerError::CacheSyncTimeout(timeout) if timeout == Duration::from_secs(30)));
    }

    #[tokio::test]
    async fn stop_during_startup_is_reported() {
        let test = TestGroup::new("team-a");
        let mut groups = WatchGroups::new();
        groups.register("team-a", test.group);
        let (controller, _calls) = controller(groups, None);

        let stop = CancellationToken::new();
        stop.cancel();
        assert!(matches!(controller.run(stop).await, Err(ControllerError::Cancelled)));
    }

    #[tokio::test]
    async fn controller_runs_once() {
        let mut test = TestGroup::new("");
        test.sync([]);
        let mut groups = WatchGroups::new();
        groups.register("", test.group);
        let (controller, _calls) = controller(groups, None);

        let stop = CancellationToken::new();
        let run = spawn_run(&controller, &stop);
        let mut state = controller.subscribe();
        state.wait_for(|state| *state == ControllerState::Running).await.unwrap();

        assert!(matches!(controller.run(stop.clone()).await, Err(ControllerError::AlreadyStarted)));

        stop.cancel();
        run.await.unwrap().unwrap();
        assert!(matches!(controller.run(stop).await, Err(ControllerError::AlreadyStarted)));
    }

    #[tokio::test(start_paused = true)]
    async fn initial_listing_may_exceed_queue_capacity() {
        let servers = ["a", "b", "c", "d", "e"].map(|name| virtual_server("team-a", name));
        let group = WatchGroup::from_events("team-a", listing(servers.to_vec()), listing(Vec::new()));
        let mut groups = WatchGroups::new();
        groups.register("team-a", group);
        let (controller, mut calls) = controller_with(
            groups,
            ControllerOpts {
                queue_capacity: Some(2),
                cache_sync_timeout: Some(Duration::from_secs(30)),
                ..Default::default()
            },
        );

        let stop = CancellationToken::new();
        let mut run = spawn_run(&controller, &stop);

        let mut synced = Vec::new();
        while synced.len() < servers.len() {
            tokio::select! {
                key = calls.recv() => synced.push(key.unwrap()),
                result = &mut run => panic!("controller stopped early: {result:?}"),
            }
        }
        synced.sort();
        assert_eq!(synced, ["team-a/a", "team-a/b", "team-a/c", "team-a/d", "team-a/e"]);

        // the bound is back in place for the running controller
        for key in ["team-a/x", "team-a/y"] {
            controller.queue().try_add(key);
        }
        assert_eq!(controller.queue().try_add("team-a/z"), crate::queue::AddOutcome::Full);

        stop.cancel();
        run.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn resync_queues_cached_virtual_servers_periodically() {
        let mut test = TestGroup::new("team-a");
        test.sync([virtual_server("team-a", "cafe")]);
        let mut groups = WatchGroups::new();
        groups.register("team-a", test.group);
        let (controller, mut calls) = controller_with(
            groups,
            ControllerOpts {
                resync_period: Some(Duration::from_secs(60)),
                ..Default::default()
            },
        );

        let start = Instant::now();
        let stop = CancellationToken::new();
        let run = spawn_run(&controller, &stop);

        assert_eq!(calls.recv().await.as_deref(), Some("team-a/cafe"));
        assert!(start.elapsed() >= Duration::from_secs(60));
        assert_eq!(calls.recv().await.as_deref(), Some("team-a/cafe"));
        assert!(start.elapsed() >= Duration::from_secs(120));

        stop.cancel();
        run.await.unwrap().unwrap();
    }
}
