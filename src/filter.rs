//! Content filter hook.
//!
//! Consulted only for configs with `content_filter` set. Filtering rules
//! themselves live outside this crate; any `Fn(&ReplicationConfig,
//! &InboundUnit) -> bool` works as a filter.

use crate::config::ReplicationConfig;
use crate::event::InboundUnit;

pub trait ContentFilter: Send + Sync + 'static {
    /// Whether `unit` may be replicated under `config`.
    fn allows(&self, config: &ReplicationConfig, unit: &InboundUnit) -> bool;
}

/// Lets everything through.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl ContentFilter for AllowAll {
    fn allows(&self, _config: &ReplicationConfig, _unit: &InboundUnit) -> bool {
        true
    }
}

impl<F> ContentFilter for F
where
    F: Fn(&ReplicationConfig, &InboundUnit) -> bool + Send + Sync + 'static,
{
    fn allows(&self, config: &ReplicationConfig, unit: &InboundUnit) -> bool {
        self(config, unit)
    }
}
