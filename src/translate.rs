use crate::{
    key::{
        join_key,
        key_for,
    },
    queue::WorkQueue,
    resources::{
        DNSEndpoint,
        VirtualServer,
    },
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{
    Resource,
    ResourceExt as _,
};

/// Returns the owner reference marked as controller, if any.
pub fn controller_of<K: Resource>(obj: &K) -> Option<&OwnerReference> {
    obj.meta()
        .owner_references
        .as_ref()?
        .iter()
        .find(|reference| reference.controller == Some(true))
}

/// Turns watch notifications into queue keys for the parent kind.
#[derive(Debug, Clone)]
pub struct EventTranslator {
    queue: WorkQueue,
    parent_kind: String,
}

impl EventTranslator {
    pub fn new(queue: WorkQueue) -> Self {
        Self {
            queue,
            parent_kind: VirtualServer::kind(&()).into_owned(),
        }
    }

    pub fn queue(&self) -> &WorkQueue {
        &self.queue
    }

    /// Derives the parent key of a child object. Orphans and children controlled by another kind
    /// have none.
    ///
    /// The api version is not compared, no other kind called `VirtualServer` controls DNSEndpoints.
    /// Owner and owned object always share a namespace, so the child's namespace is used.
    pub fn parent_key(&self, child: &DNSEndpoint) -> Option<String> {
        let owner = controller_of(child)?;
        if owner.kind != self.parent_kind {
            return None;
        }
        let namespace = child.namespace().unwrap_or_default();
        Some(join_key(&namespace, &owner.name))
    }

    /// Queues the owner of `child`. Waits for the queue to accept the key, so no child event is lost
    /// under backpressure.
    pub async fn on_child_event(&self, child: &DNSEndpoint) {
        let Some(key) = self.parent_key(child) else {
            trace!(endpoint = %key_for(child), "ignoring event for endpoint without VirtualServer controller");
            return;
        };
        trace!(endpoint = %key_for(child), %key, "queueing owner of endpoint");
        self.queue.add(key).await;
    }

    /// Every parent event queues the parent itself.
    pub async fn on_parent_event(&self, parent: &VirtualServer) {
        self.queue.add(key_for(parent)).await;
    }
}
