//! Fixtures shared by the unit tests.

use crate::{
    key::key_for,
    resources::{
        DNSEndpoint,
        VirtualServer,
        VirtualServerSpec,
    },
    sync::Synchronize,
    watch_group::{
        WatchEvents,
        WatchGroup,
    },
};
use async_trait::async_trait;
use futures::StreamExt as _;
use kube::runtime::{
    reflector::{
        self,
        store::Writer,
    },
    watcher,
};
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    sync::Arc,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub fn virtual_server(namespace: &str, name: &str) -> VirtualServer {
    let mut vs = VirtualServer::new(
        name,
        VirtualServerSpec {
            host: format!("{name}.example.com"),
            external_dns: None,
        },
    );
    vs.metadata.namespace = Some(namespace.to_string());
    vs
}

/// A watch that lists `objects` and then stays quiet.
pub fn listing<K: Send + 'static>(objects: Vec<K>) -> WatchEvents<K> {
    let events = std::iter::once(watcher::Event::Init)
        .chain(objects.into_iter().map(watcher::Event::InitApply))
        .chain(std::iter::once(watcher::Event::InitDone))
        .map(Ok);
    futures::stream::iter(events).chain(futures::stream::pending()).boxed()
}

/// A watch group whose caches are filled through the returned writers.
pub struct TestGroup {
    pub group: WatchGroup,
    pub parents: Writer<VirtualServer>,
    pub children: Writer<DNSEndpoint>,
}

impl TestGroup {
    pub fn new(scope: &str) -> Self {
        let (parent_store, parents) = reflector::store();
        let (child_store, children) = reflector::store();
        Self {
            group: WatchGroup::from_stores(scope, parent_store, child_store),
            parents,
            children,
        }
    }

    /// Completes the initial listing of both caches with `objects` as the VirtualServers.
    pub fn sync(&mut self, objects: impl IntoIterator<Item = VirtualServer>) {
        self.parents.apply_watcher_event(&watcher::Event::Init);
        for vs in objects {
            self.parents.apply_watcher_event(&watcher::Event::InitApply(vs));
        }
        self.parents.apply_watcher_event(&watcher::Event::InitDone);
        self.children.apply_watcher_event(&watcher::Event::Init);
        self.children.apply_watcher_event(&watcher::Event::InitDone);
    }
}

/// Reports the key of every synced VirtualServer and fails each one a configurable number of times.
pub struct RecordingSync {
    calls: mpsc::UnboundedSender<String>,
    failures: Mutex<HashMap<String, u32>>,
}

impl RecordingSync {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<String>) {
        let (calls, rx) = mpsc::unbounded_channel();
        let sync = Arc::new(Self {
            calls,
            failures: Mutex::new(HashMap::new()),
        });
        (sync, rx)
    }

    pub fn fail(&self, key: &str, times: u32) {
        self.failures.lock().insert(key.to_string(), times);
    }
}

#[async_trait]
impl Synchronize for RecordingSync {
    async fn sync(&self, _token: &CancellationToken, vs: Arc<VirtualServer>) -> eyre::Result<()> {
        let key = key_for(vs.as_ref());
        let _ = self.calls.send(key.clone());

        let mut failures = self.failures.lock();
        match failures.get_mut(&key) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                Err(eyre::eyre!("sync of {key} failed"))
            }
            _ => Ok(()),
        }
    }
}
