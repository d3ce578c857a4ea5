//! Inbound routing from the session to the correlation registry.

use std::{sync::Arc, time::Duration};

use tracing::{debug, warn};

use crate::{
    id::IdAllocator,
    message::Reply,
    protocol::VenueProtocol,
    registry::{CorrelationRegistry, Delivery},
    supervisor::Dispatch,
};

/// Routes every inbound message to the wait registered for its id.
pub struct Dispatcher<P: VenueProtocol> {
    protocol: Arc<P>,
    registry: Arc<CorrelationRegistry>,
    ids: Arc<IdAllocator>,
    orphan_ttl: Duration,
}

impl<P: VenueProtocol> Dispatcher<P> {
    pub fn new(
        protocol: Arc<P>,
        registry: Arc<CorrelationRegistry>,
        ids: Arc<IdAllocator>,
        orphan_ttl: Duration,
    ) -> Self {
        Self {
            protocol,
            registry,
            ids,
            orphan_ttl,
        }
    }
}

impl<P: VenueProtocol> Dispatch for Dispatcher<P> {
    fn on_message(&self, text: String) {
        let Some(routing) = self.protocol.route(&text) else {
            warn!(len = text.len(), "Discarding inbound message without correlation id");
            return;
        };

        if !self.ids.was_issued(routing.id) {
            warn!(id = %routing.id, "Discarding message for a correlation id never issued");
            return;
        }

        let id = routing.id;
        if self.registry.deliver(Reply::new(id, routing.is_error, text)) == Delivery::Stored {
            debug!(%id, "Reply stored without a registered wait");
        }
    }

    fn on_session_lost(&self, reason: &str) {
        let resolved = self.registry.fail_all(reason);
        if resolved > 0 {
            warn!(resolved, reason, "Released pending waits after session loss");
        }
    }

    fn on_tick(&self) {
        let swept = self.registry.sweep_orphans(self.orphan_ttl);
        if swept > 0 {
            debug!(swept, "Dropped unclaimed replies");
        }
    }
}
