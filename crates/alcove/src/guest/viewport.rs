//! Layout observation for the guest: watches the scope's viewport value and
//! broadcasts `resize` messages, debounced to one message per observation
//! window rather than one per change.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::time::sleep;
use tracing::debug;

use applet_proto::{Message, Payload};

use super::ScopeInner;

pub(super) fn spawn_viewport_observer(inner: &Arc<ScopeInner>, debounce: Duration) {
    let weak: Weak<ScopeInner> = Arc::downgrade(inner);
    let mut viewport = inner.viewport_rx();
    tokio::spawn(async move {
        loop {
            if viewport.changed().await.is_err() {
                // Scope dropped; nothing left to observe.
                break;
            }
            // Let the rest of the batch land, then take the final state.
            sleep(debounce).await;
            let dimensions = *viewport.borrow_and_update();

            let Some(inner) = weak.upgrade() else { break };
            *inner.dimensions.write() = dimensions;
            if inner
                .relay
                .send(Message::new(Payload::Resize { dimensions }))
                .is_err()
            {
                break;
            }
            debug!(
                width = dimensions.width,
                height = dimensions.height,
                "resize observed"
            );
        }
    });
}
