use crate::{
    controller::{
        ControllerOpts,
        CONTROLLER_NAME,
    },
    rate_limiter::BackoffConfig,
    scope::NamespaceScope,
};
use clap::Parser;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(version, about)]
pub enum Args {
    /// Print the DNSEndpoint CRD
    Crds,
    /// Run the controller
    Controller(ControllerArgs),
}

#[derive(Parser, Debug)]
pub struct ControllerArgs {
    #[clap(
        long = "watch-namespace",
        env = "WATCH_NAMESPACE",
        value_delimiter = ',',
        help = "Namespaces to watch, comma separated. Empty or unset watches all namespaces"
    )]
    pub watch_namespaces: Vec<String>,

    #[clap(
        long,
        env = "CACHE_SYNC_TIMEOUT",
        help = "Give up if the caches have not synced after this long. If not set, wait forever",
        value_parser = humantime::parse_duration
    )]
    pub cache_sync_timeout: Option<Duration>,

    #[clap(
        long,
        env = "RESYNC_PERIOD",
        help = "Reconcile every cached VirtualServer again at this interval, 0s disables resyncs",
        default_value = "5m",
        value_parser = humantime::parse_duration
    )]
    pub resync_period: Duration,

    #[clap(
        long,
        env = "QUEUE_CAPACITY",
        help = "Maximum number of waiting work items, 0 for no limit",
        default_value_t = 1024
    )]
    pub queue_capacity: usize,

    #[clap(
        long,
        env = "BACKOFF_BASE",
        help = "Retry delay after the first failure of a VirtualServer",
        default_value = "5ms",
        value_parser = humantime::parse_duration
    )]
    pub backoff_base: Duration,

    #[clap(
        long,
        env = "BACKOFF_MAX",
        help = "Upper bound for the retry delay of a VirtualServer",
        default_value = "1000s",
        value_parser = humantime::parse_duration
    )]
    pub backoff_max: Duration,

    #[clap(
        long,
        env = "CONTROLLER_NAME",
        help = "Name used for events and as server side apply field manager",
        default_value = CONTROLLER_NAME
    )]
    pub controller_name: String,
}

impl ControllerArgs {
    pub fn scope(&self) -> NamespaceScope {
        NamespaceScope::from_namespaces(&self.watch_namespaces)
    }

    pub fn controller_opts(&self) -> ControllerOpts {
        ControllerOpts {
            name: self.controller_name.clone(),
            backoff: BackoffConfig {
                base_delay: self.backoff_base,
                max_delay: self.backoff_max,
                ..Default::default()
            },
            queue_capacity: (self.queue_capacity > 0).then_some(self.queue_capacity),
            cache_sync_timeout: self.cache_sync_timeout,
            resync_period: (!self.resync_period.is_zero()).then_some(self.resync_period),
        }
    }
}
