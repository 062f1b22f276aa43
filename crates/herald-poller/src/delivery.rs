//! Hand-off of claimed requests to the execution channel.

use std::sync::Arc;

use tracing::{debug, warn};

use herald_core::Request;

use crate::channel::{ChannelError, ExecutionChannel};
use crate::notice;

/// Delivers requests for one instance into its execution channel.
///
/// Delivery is a single injection with no retry; whatever the channel does
/// with the text afterwards is not observed.
pub struct DeliverySink {
    channel: Arc<dyn ExecutionChannel>,
    instance: String,
}

impl DeliverySink {
    pub fn new(channel: Arc<dyn ExecutionChannel>, instance: impl Into<String>) -> Self {
        Self {
            channel,
            instance: instance.into(),
        }
    }

    pub fn channel_id(&self) -> &str {
        self.channel.id()
    }

    /// Whether the channel can accept text right now. A failing check
    /// counts as absent.
    pub async fn is_live(&self) -> bool {
        match self.channel.exists().await {
            Ok(live) => live,
            Err(e) => {
                warn!(channel = %self.channel.id(), error = %e, "Channel check failed");
                false
            }
        }
    }

    /// Inject the composed instruction for `req`.
    pub async fn deliver(&self, req: &Request) -> Result<(), ChannelError> {
        let text = notice::prompt(req, &self.instance);
        debug!(id = req.id, channel = %self.channel.id(), len = text.len(), "Injecting request");
        self.channel.inject(&text).await
    }
}
