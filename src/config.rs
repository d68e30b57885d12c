//! Process-lifetime request configuration.

use std::fmt;
use std::sync::Arc;

use crate::ip::{IpResolver, ResolveIp};

/// Default in-memory ceiling for multipart form parsing: 64 MiB.
pub const DEFAULT_MAX_MULTIPART_MEMORY: u64 = 64 << 20;

/// Settings every [`Context`](crate::Context) reads.
///
/// Assembled through the [`Server`](crate::Server) setters before serving
/// begins, then frozen behind an `Arc` and shared read-only by every request.
/// There is no way to change it while requests are in flight.
#[derive(Clone)]
pub struct Config {
    pub(crate) max_multipart_memory: u64,
    pub(crate) ip_resolver: Arc<dyn ResolveIp>,
}

impl Config {
    pub fn max_multipart_memory(&self) -> u64 {
        self.max_multipart_memory
    }

    pub fn ip_resolver(&self) -> &dyn ResolveIp {
        self.ip_resolver.as_ref()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_multipart_memory: DEFAULT_MAX_MULTIPART_MEMORY,
            ip_resolver: Arc::new(IpResolver::default()),
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("max_multipart_memory", &self.max_multipart_memory)
            .finish_non_exhaustive()
    }
}
