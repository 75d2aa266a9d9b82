use kube::CustomResource;
use schemars::JsonSchema;
use serde::{
    Deserialize,
    Serialize,
};
use std::collections::BTreeMap;

#[allow(clippy::upper_case_acronyms)]
#[derive(Default, Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, JsonSchema)]
pub enum RecordType {
    #[default]
    #[serde(rename = "A")]
    A,
    #[serde(rename = "AAAA")]
    AAAA,
    #[serde(rename = "CNAME")]
    CNAME,
}

impl std::str::FromStr for RecordType {
    type Err = eyre::Report;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "A" => Ok(RecordType::A),
            "AAAA" => Ok(RecordType::AAAA),
            "CNAME" => Ok(RecordType::CNAME),
            s => Err(eyre::eyre!("Invalid RecordType: {s:?}")),
        }
    }
}

impl std::fmt::Display for RecordType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RecordType::A => "A",
            RecordType::AAAA => "AAAA",
            RecordType::CNAME => "CNAME",
        };
        f.write_str(s)
    }
}

// -=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-
// parent

/// The subset of the NGINX `VirtualServer` resource the controller reads. Unknown fields are ignored on
/// deserialization, the controller never writes VirtualServers.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "k8s.nginx.org",
    version = "v1",
    kind = "VirtualServer",
    shortname = "vs",
    status = "VirtualServerStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct VirtualServerSpec {
    /// The host (domain name) of the server
    pub host: String,
    /// External DNS configuration for the host
    #[serde(rename = "externalDNS")]
    pub external_dns: Option<ExternalDns>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExternalDns {
    /// Whether a DNSEndpoint should be created for the host
    #[serde(default)]
    pub enable: bool,
    /// The record type. Defaults to A, or CNAME if the load balancer only reports hostnames.
    pub record_type: Option<RecordType>,
    /// TTL in seconds
    #[serde(rename = "recordTTL")]
    pub record_ttl: Option<i64>,
    /// Labels to set on the endpoint
    pub labels: Option<BTreeMap<String, String>>,
    /// Provider specific configuration passed through to external-dns
    pub provider_specific: Option<Vec<ProviderSpecificProperty>>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VirtualServerStatus {
    pub state: Option<String>,
    pub reason: Option<String>,
    pub message: Option<String>,
    pub external_endpoints: Option<Vec<ExternalEndpoint>>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExternalEndpoint {
    pub ip: Option<String>,
    pub hostname: Option<String>,
    pub ports: Option<String>,
}

// -=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-=-
// child

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    group = "externaldns.nginx.org",
    version = "v1",
    kind = "DNSEndpoint",
    shortname = "dnsep",
    status = "DNSEndpointStatus",
    derive = "PartialEq",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct DNSEndpointSpec {
    pub endpoints: Vec<Endpoint>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    /// The hostname of the DNS record
    pub dns_name: String,
    /// The targets the record points to
    pub targets: Vec<String>,
    /// The type of the record
    pub record_type: Option<RecordType>,
    /// TTL in seconds
    #[serde(rename = "recordTTL")]
    pub record_ttl: Option<i64>,
    pub labels: Option<BTreeMap<String, String>>,
    pub provider_specific: Option<Vec<ProviderSpecificProperty>>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ProviderSpecificProperty {
    pub name: String,
    pub value: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DNSEndpointStatus {
    pub observed_generation: Option<i64>,
}
