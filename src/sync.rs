//! Turns a VirtualServer into its desired DNSEndpoint.

use crate::{
    events::{
        self,
        EventRecorder,
    },
    resources::{
        DNSEndpoint,
        DNSEndpointSpec,
        Endpoint,
        RecordType,
        VirtualServer,
    },
    translate::controller_of,
};
use async_trait::async_trait;
use eyre::{
    Context as _,
    OptionExt as _,
    Result,
};
use kube::{
    api::{
        DeleteParams,
        Patch,
        PatchParams,
    },
    runtime::events::EventType,
    Api,
    Client,
    Resource as _,
    ResourceExt as _,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Brings the cluster in line with one VirtualServer. Any error is retried later.
#[async_trait]
pub trait Synchronize: Send + Sync {
    async fn sync(&self, token: &CancellationToken, vs: Arc<VirtualServer>) -> Result<()>;
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DesiredError {
    #[error("VirtualServer has no external endpoints yet")]
    NoTargets,
    #[error("VirtualServer is missing metadata: {0}")]
    Metadata(&'static str),
}

/// The DNSEndpoint that should exist for `vs`, or `None` if external DNS is disabled for it.
///
/// Targets are the load balancer IPs from the status, or its hostnames if it reports no IPs.
pub fn desired_endpoint(vs: &VirtualServer) -> Result<Option<DNSEndpoint>, DesiredError> {
    let Some(dns) = vs.spec.external_dns.as_ref().filter(|dns| dns.enable) else {
        return Ok(None);
    };

    let name = vs.metadata.name.as_deref().ok_or(DesiredError::Metadata("name"))?;
    let namespace = vs.metadata.namespace.as_deref().ok_or(DesiredError::Metadata("namespace"))?;
    let owner = vs.controller_owner_ref(&()).ok_or(DesiredError::Metadata("uid"))?;

    let external = vs
        .status
        .as_ref()
        .and_then(|status| status.external_endpoints.as_deref())
        .unwrap_or_default();
    let ips: Vec<String> = external.iter().filter_map(|ep| ep.ip.clone()).collect();
    let (mut targets, fallback_type) = if ips.is_empty() {
        let hostnames: Vec<String> = external.iter().filter_map(|ep| ep.hostname.clone()).collect();
        (hostnames, RecordType::CNAME)
    } else {
        (ips, RecordType::A)
    };
    if targets.is_empty() {
        return Err(DesiredError::NoTargets);
    }
    targets.sort();
    targets.dedup();

    let mut endpoint = DNSEndpoint::new(
        name,
        DNSEndpointSpec {
            endpoints: vec![Endpoint {
                dns_name: vs.spec.host.clone(),
                targets,
                record_type: Some(dns.record_type.unwrap_or(fallback_type)),
                record_ttl: dns.record_ttl,
                labels: dns.labels.clone(),
                provider_specific: dns.provider_specific.clone(),
            }],
        },
    );
    endpoint.metadata.namespace = Some(namespace.to_string());
    endpoint.metadata.owner_references = Some(vec![owner]);
    Ok(Some(endpoint))
}

/// Whether applying produced a new version of the DNSEndpoint. An apply that changes nothing keeps
/// the resource version.
pub fn endpoint_changed(before: Option<&DNSEndpoint>, after: &DNSEndpoint) -> bool {
    match before {
        Some(before) => before.resource_version() != after.resource_version(),
        None => true,
    }
}

/// Server side applies the desired DNSEndpoint, or removes it once external DNS is disabled.
pub struct ApplyDnsEndpoint {
    client: Client,
    recorder: EventRecorder,
    field_manager: String,
}

impl ApplyDnsEndpoint {
    pub fn new(client: Client, recorder: EventRecorder, field_manager: impl Into<String>) -> Self {
        Self {
            client,
            recorder,
            field_manager: field_manager.into(),
        }
    }

    async fn remove(&self, vs: &VirtualServer) -> Result<()> {
        let ns = vs.namespace().ok_or_eyre("missing namespace")?;
        let name = vs.name_any();
        let api = Api::<DNSEndpoint>::namespaced(self.client.clone(), &ns);

        let Some(existing) = api.get_opt(&name).await? else {
            return Ok(());
        };
        // only remove endpoints this VirtualServer controls
        if controller_of(&existing).map(|owner| &owner.uid) != vs.uid().as_ref() {
            return Ok(());
        }

        match api.delete(&name, &DeleteParams::default()).await {
            Ok(_) => {}
            Err(kube::Error::Api(err)) if err.code == 404 => return Ok(()),
            Err(err) => return Err(err).context("unable to delete DNSEndpoint"),
        }
        info!("deleted DNSEndpoint {ns}/{name}");
        self.recorder
            .publish(
                vs,
                EventType::Normal,
                events::REASON_DELETED,
                format!("DNSEndpoint {ns}/{name} deleted, external DNS is disabled"),
            )
            .await;
        Ok(())
    }
}

#[async_trait]
impl Synchronize for ApplyDnsEndpoint {
    #[instrument(level = "debug", skip_all, fields(vs = %crate::key::key_for(vs.as_ref())))]
    async fn sync(&self, _token: &CancellationToken, vs: Arc<VirtualServer>) -> Result<()> {
        let endpoint = match desired_endpoint(&vs) {
            Ok(Some(endpoint)) => endpoint,
            Ok(None) => return self.remove(&vs).await,
            Err(err @ DesiredError::NoTargets) => {
                self.recorder
                    .publish(vs.as_ref(), EventType::Warning, events::REASON_NO_TARGETS, err.to_string())
                    .await;
                return Err(err.into());
            }
            Err(err) => return Err(err.into()),
        };

        let ns = endpoint.namespace().ok_or_eyre("missing namespace")?;
        let name = endpoint.name_any();
        debug!("applying DNSEndpoint {ns}/{name}");

        let api = Api::<DNSEndpoint>::namespaced(self.client.clone(), &ns);
        let before = api.get_opt(&name).await.context("unable to read DNSEndpoint")?;
        let result = api
            .patch(
                &name,
                &PatchParams::apply(&self.field_manager).force(),
                &Patch::Apply(&endpoint),
            )
            .await;

        match result {
            Ok(applied) if endpoint_changed(before.as_ref(), &applied) => {
                self.recorder
                    .publish(
                        vs.as_ref(),
                        EventType::Normal,
                        events::REASON_UPDATED,
                        format!("DNSEndpoint {ns}/{name} updated for host {}", vs.spec.host),
                    )
                    .await;
                Ok(())
            }
            Ok(_) => {
                debug!("DNSEndpoint {ns}/{name} is up to date");
                Ok(())
            }
            Err(err) => {
                self.recorder
                    .publish(
                        vs.as_ref(),
                        EventType::Warning,
                        events::REASON_FAILED,
                        format!("unable to apply DNSEndpoint {ns}/{name}: {err}"),
                    )
                    .await;
                Err(err).context("unable to apply DNSEndpoint")
            }
        }
    }
}
