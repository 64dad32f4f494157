//! Setup errors. Per-message failures are reported as
//! [`ferry_core::domain::BrokerError`] through the ports instead.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AmqpError {
    #[error("failed to connect to broker: {0}")]
    Connect(#[source] lapin::Error),

    #[error("failed to open channel: {0}")]
    Channel(#[source] lapin::Error),

    #[error("failed to declare queue {queue}: {source}")]
    Declare {
        queue: String,
        #[source]
        source: lapin::Error,
    },

    #[error("failed to configure channel: {0}")]
    Configure(#[source] lapin::Error),

    #[error("failed to start consumer on {queue}: {source}")]
    Consume {
        queue: String,
        #[source]
        source: lapin::Error,
    },

    #[error("failed to close connection: {0}")]
    Close(#[source] lapin::Error),
}
