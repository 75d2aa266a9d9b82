use kube::{
    runtime::events::{
        Event,
        EventType,
        Recorder,
        Reporter,
    },
    Client,
    Resource,
};

pub const REASON_UPDATED: &str = "UpdatedDNSEndpoint";
pub const REASON_DELETED: &str = "DeletedDNSEndpoint";
pub const REASON_NO_TARGETS: &str = "NoExternalEndpoints";
pub const REASON_FAILED: &str = "FailedToUpdateDNSEndpoint";

const ACTION: &str = "Reconcile";

/// Publishes Kubernetes events about VirtualServers. Publishing is best effort, a failed event is
/// logged and otherwise ignored.
pub struct EventRecorder {
    recorder: Recorder,
}

impl EventRecorder {
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }

    pub async fn publish<K>(&self, obj: &K, type_: EventType, reason: &str, note: impl Into<String>)
    where
        K: Resource<DynamicType = ()>,
    {
        let event = Event {
            type_,
            reason: reason.to_string(),
            note: Some(note.into()),
            action: ACTION.to_string(),
            secondary: None,
        };
        if let Err(err) = self.recorder.publish(&event, &obj.object_ref(&())).await {
            warn!(reason, "failed to publish event: {err}");
        }
    }
}
