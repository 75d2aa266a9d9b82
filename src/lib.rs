#[macro_use]
extern crate tracing;

pub mod config;
pub mod controller;
pub mod events;
pub mod key;
pub mod queue;
pub mod rate_limiter;
pub mod resources;
pub mod scope;
pub mod sync;
pub mod translate;
pub mod watch_group;
pub mod worker;

#[cfg(test)]
mod testing;
