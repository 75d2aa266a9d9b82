//! Caches and watches for one namespace scope.

use crate::{
    controller::ControllerError,
    key::key_for,
    resources::{
        DNSEndpoint,
        VirtualServer,
    },
    scope::{
        NamespaceScope,
        ScopeResolver,
        ALL_NAMESPACES,
    },
    translate::EventTranslator,
};
use futures::{
    future::BoxFuture,
    stream::BoxStream,
    Stream,
    StreamExt as _,
};
use kube::{
    runtime::{
        reflector::{
            self,
            store::Writer,
            ObjectRef,
            Store,
        },
        watcher,
        WatchStreamExt as _,
    },
    Api,
    Client,
    Resource,
};
use parking_lot::Mutex;
use std::{
    fmt::Debug,
    hash::Hash,
    sync::Arc,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Watch groups by scope.
pub type WatchGroups = ScopeResolver<WatchGroup>;

/// The raw events of one watch.
pub type WatchEvents<K> = BoxStream<'static, Result<watcher::Event<K>, watcher::Error>>;

/// Creates one watch group per scope name. A global scope gets a single cluster wide group.
pub fn watch_groups(client: &Client, scope: &NamespaceScope, config: &watcher::Config) -> WatchGroups {
    let mut groups = WatchGroups::new();
    for name in scope.scope_names() {
        groups.register(name.clone(), WatchGroup::new(client.clone(), &name, config.clone()));
    }
    groups
}

/// Resolves once the named cache has received its initial listing.
pub struct SyncCheck {
    name: String,
    ready: BoxFuture<'static, bool>,
}

impl SyncCheck {
    pub fn new(name: impl Into<String>, ready: BoxFuture<'static, bool>) -> Self {
        Self {
            name: name.into(),
            ready,
        }
    }

    fn for_store<K>(name: String, store: Store<K>) -> Self
    where
        K: Resource + Clone + Send + Sync + 'static,
        K::DynamicType: Eq + Hash + Clone + Send + Sync,
    {
        Self::new(name, Box::pin(async move { store.wait_until_ready().await.is_ok() }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn wait(self) -> Result<(), ControllerError> {
        if self.ready.await {
            trace!(cache = %self.name, "cache synced");
            Ok(())
        } else {
            Err(ControllerError::CacheSync(self.name))
        }
    }
}

impl Debug for SyncCheck {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncCheck").field("name", &self.name).finish()
    }
}

struct Sources {
    parents: BoxStream<'static, VirtualServer>,
    children: BoxStream<'static, DNSEndpoint>,
}

/// The VirtualServer and DNSEndpoint caches of one scope, plus the watches filling them.
pub struct WatchGroup {
    scope: String,
    parents: Store<VirtualServer>,
    children: Store<DNSEndpoint>,
    sources: Mutex<Option<Sources>>,
}

impl WatchGroup {
    /// `scope` is a namespace, or [`ALL_NAMESPACES`] to watch the whole cluster.
    pub fn new(client: Client, scope: &str, config: watcher::Config) -> Self {
        let (parent_api, child_api): (Api<VirtualServer>, Api<DNSEndpoint>) = if scope == ALL_NAMESPACES {
            (Api::all(client.clone()), Api::all(client))
        } else {
            (Api::namespaced(client.clone(), scope), Api::namespaced(client, scope))
        };

        Self::from_events(
            scope,
            watcher(parent_api, config.clone()).default_backoff().boxed(),
            watcher(child_api, config).default_backoff().boxed(),
        )
    }

    /// A group whose caches are filled from the given watch events.
    pub fn from_events(
        scope: &str,
        parent_events: WatchEvents<VirtualServer>,
        child_events: WatchEvents<DNSEndpoint>,
    ) -> Self {
        let (parents, parent_writer) = reflector::store();
        let (children, child_writer) = reflector::store();
        let display = display_scope(scope);

        Self {
            scope: scope.to_string(),
            parents,
            children,
            sources: Mutex::new(Some(Sources {
                parents: changed_objects(parent_writer, parent_events, display).boxed(),
                children: changed_objects(child_writer, child_events, display).boxed(),
            })),
        }
    }

    /// A group over caches filled by someone else.
    pub fn from_stores(scope: &str, parents: Store<VirtualServer>, children: Store<DNSEndpoint>) -> Self {
        Self {
            scope: scope.to_string(),
            parents,
            children,
            sources: Mutex::new(None),
        }
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    fn display_scope(&self) -> &str {
        display_scope(&self.scope)
    }

    pub fn parents(&self) -> &Store<VirtualServer> {
        &self.parents
    }

    pub fn children(&self) -> &Store<DNSEndpoint> {
        &self.children
    }

    /// Looks up a VirtualServer in the local cache.
    pub fn get_parent(&self, namespace: &str, name: &str) -> Option<Arc<VirtualServer>> {
        self.parents.get(&ObjectRef::new(name).within(namespace))
    }

    pub fn has_synced_checks(&self) -> Vec<SyncCheck> {
        let scope = self.display_scope();
        vec![
            SyncCheck::for_store(format!("VirtualServer ({scope})"), self.parents.clone()),
            SyncCheck::for_store(format!("DNSEndpoint ({scope})"), self.children.clone()),
        ]
    }

    /// Starts both watches. Each watch hands its events to `translator` one at a time, so a slow
    /// queue holds up the watch instead of dropping events. Has no effect on a group that was already
    /// started or that has no watches of its own.
    pub fn start(&self, translator: &EventTranslator, token: &CancellationToken) -> Vec<JoinHandle<()>> {
        let Some(Sources {
            mut parents,
            mut children,
        }) = self.sources.lock().take()
        else {
            debug!(scope = %self.display_scope(), "watch group has nothing to start");
            return Vec::new();
        };

        info!(scope = %self.display_scope(), "starting watches");

        let parent_task = tokio::spawn({
            let translator = translator.clone();
            let token = token.clone();
            async move {
                loop {
                    let vs = tokio::select! {
                        _ = token.cancelled() => break,
                        vs = parents.next() => vs,
                    };
                    let Some(vs) = vs else { break };
                    translator.on_parent_event(&vs).await;
                }
            }
        });

        let child_task = tokio::spawn({
            let translator = translator.clone();
            let token = token.clone();
            async move {
                loop {
                    let ep = tokio::select! {
                        _ = token.cancelled() => break,
                        ep = children.next() => ep,
                    };
                    let Some(ep) = ep else { break };
                    translator.on_child_event(&ep).await;
                }
            }
        });

        vec![parent_task, child_task]
    }
}

impl Debug for WatchGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchGroup").field("scope", &self.scope).finish()
    }
}

fn display_scope(scope: &str) -> &str {
    if scope == ALL_NAMESPACES {
        "<all namespaces>"
    } else {
        scope
    }
}

/// Objects that were added, updated or deleted, with the cache kept up to date along the way.
fn changed_objects<K>(
    writer: Writer<K>,
    events: WatchEvents<K>,
    scope: &str,
) -> impl Stream<Item = K> + Send + 'static
where
    K: Resource + Clone + Debug + Send + Sync + 'static,
    K::DynamicType: Default + Eq + Hash + Clone + Send + Sync,
{
    let kind = K::kind(&K::DynamicType::default()).into_owned();
    let scope = scope.to_string();
    reflector::reflector(writer, events)
        .filter_map(move |event| {
            let obj = match event {
                Ok(event) => changed_object(event),
                Err(err) => {
                    warn!(%kind, %scope, "watch error: {err}");
                    None
                }
            };
            futures::future::ready(obj)
        })
}

/// The object an event is about. Initial listings count as adds.
pub fn changed_object<K: Resource>(event: watcher::Event<K>) -> Option<K> {
    match event {
        watcher::Event::Apply(obj) | watcher::Event::InitApply(obj) | watcher::Event::Delete(obj) => {
            trace!(object = %key_for(&obj), "watch event");
            Some(obj)
        }
        watcher::Event::Init | watcher::Event::InitDone => None,
    }
}
