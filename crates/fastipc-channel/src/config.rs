use std::time::Duration;

use fastipc_transport::TransportConfig;

/// Configuration for a [`Channel`](crate::Channel).
#[derive(Debug, Clone, Default)]
pub struct ChannelConfig {
    /// Module whose types and methods travel as compact tokens.
    pub module: Option<String>,
    /// Settings for both transport directions.
    pub transport: TransportConfig,
    /// Deadline applied to every outgoing call. `None` waits for the reply
    /// indefinitely.
    pub call_timeout: Option<Duration>,
}

impl ChannelConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Specialize the channel for `module`.
    pub fn with_module(mut self, module: impl Into<String>) -> Self {
        self.module = Some(module.into());
        self
    }

    /// Override transport settings.
    pub fn with_transport(mut self, transport: TransportConfig) -> Self {
        self.transport = transport;
        self
    }

    /// Fail calls whose reply does not arrive within `timeout`.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }
}
