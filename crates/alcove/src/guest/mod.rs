//! Guest-side scope: the applet's half of the protocol.
//!
//! `AppletScope::register` performs the announce half of the handshake
//! immediately, adopts the private channel the host transfers back, loads the
//! manifest, and registers with the host. From then on it owns the
//! authoritative data value and the action-handler registry, both plain
//! instance-owned maps, nothing process-wide.

mod viewport;

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, error, warn};

use applet_proto::{ActionDescriptor, ActionMap, Dimensions, Kind, Manifest, Message, Payload};

use crate::events::Callbacks;
use crate::guest::viewport::spawn_viewport_observer;
use crate::manifest::load_manifest;
use crate::relay::MessageRelay;
use crate::runtime::GuestWindow;

type ActionHandler = Arc<dyn Fn(Value) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

#[derive(Clone)]
pub struct AppletScope {
    inner: Arc<ScopeInner>,
}

pub(crate) struct ScopeInner {
    pub(crate) relay: MessageRelay,
    manifest: RwLock<Manifest>,
    actions: RwLock<ActionMap>,
    handlers: RwLock<HashMap<String, ActionHandler>>,
    data: RwLock<Value>,
    pub(crate) dimensions: RwLock<Dimensions>,
    viewport: watch::Sender<Dimensions>,
    on_load: Callbacks<Manifest>,
    on_ready: Callbacks<()>,
    on_data: Callbacks<Value>,
}

impl AppletScope {
    /// Creates the scope and announces to the embedding host. The returned
    /// scope is live immediately; registration with the host completes in the
    /// background once the private channel arrives.
    pub fn register(window: GuestWindow) -> AppletScope {
        let relay = MessageRelay::new("applet");
        let inner = Arc::new(ScopeInner {
            relay,
            manifest: RwLock::new(Manifest::default()),
            actions: RwLock::new(ActionMap::new()),
            handlers: RwLock::new(HashMap::new()),
            data: RwLock::new(Value::Null),
            dimensions: RwLock::new(Dimensions::default()),
            viewport: watch::channel(Dimensions::default()).0,
            on_load: Callbacks::new(),
            on_ready: Callbacks::new(),
            on_data: Callbacks::new(),
        });

        Self::wire_relay(&inner);

        // Announce half of the handshake: posted before any private channel
        // exists, using the permissive delivery path.
        let announcement = Message::new(Payload::Connect);
        match serde_json::to_vec(&announcement) {
            Ok(raw) => {
                if window.announce.post(Bytes::from(raw), None).is_err() {
                    warn!("embedding host is gone, applet will never connect");
                }
            }
            Err(err) => error!(%err, "failed to encode connect announcement"),
        }

        // This task keeps the scope alive for the lifetime of the context:
        // it adopts the transferred port, initializes, then parks on the
        // inbox until the host closes it.
        let strong = inner.clone();
        let GuestWindow {
            mut inbox,
            location,
            manifest,
            resize_debounce,
            ..
        } = window;
        tokio::spawn(async move {
            let mut connected = false;
            while let Some(envelope) = inbox.recv().await {
                let Some(port) = envelope.port else {
                    debug!("ignoring portless envelope from host");
                    continue;
                };
                if connected {
                    debug!("ignoring extra port transfer, channel already upgraded");
                    continue;
                }
                connected = true;
                strong.relay.attach(port);
                initialize(&strong, &location, manifest.clone(), resize_debounce).await;
            }
            debug!("guest inbox closed, scope winding down");
        });

        AppletScope { inner }
    }

    fn wire_relay(inner: &Arc<ScopeInner>) {
        let weak = Arc::downgrade(inner);
        inner.relay.on(Kind::Data, move |message| {
            let weak = weak.clone();
            async move {
                let Some(inner) = weak.upgrade() else { return };
                if let Payload::Data { data } = message.payload {
                    // The host asked us to adopt a value; the broadcast below
                    // is what updates the host's mirror, and it is ordered
                    // before the relay's acknowledgement.
                    inner.adopt_data(data);
                }
            }
        });

        let weak = Arc::downgrade(inner);
        inner.relay.on(Kind::Action, move |message| {
            let weak = weak.clone();
            async move {
                let Some(inner) = weak.upgrade() else { return };
                // Handlers run in their own task so slow actions never block
                // the channel; completions may arrive in any order.
                tokio::spawn(async move {
                    inner.handle_action(message).await;
                });
            }
        });
    }

    /// Registers or replaces the handler for `action_id` without touching the
    /// declared catalog.
    pub fn set_action_handler<F, Fut>(&self, action_id: impl Into<String>, handler: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let handler: ActionHandler = Arc::new(move |args| Box::pin(handler(args)));
        self.inner.handlers.write().insert(action_id.into(), handler);
    }

    /// Registers a handler and merges its descriptor into the catalog,
    /// re-broadcasting the updated catalog to the host.
    pub fn define_action<F, Fut>(
        &self,
        action_id: impl Into<String>,
        descriptor: ActionDescriptor,
        handler: F,
    ) where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let action_id = action_id.into();
        let mut descriptor = descriptor;
        descriptor.normalize();
        self.set_action_handler(action_id.clone(), handler);

        let actions = {
            let mut actions = self.inner.actions.write();
            actions.insert(action_id, descriptor);
            actions.clone()
        };
        let _ = self
            .inner
            .relay
            .send(Message::new(Payload::Actions { actions }));
    }

    /// The authoritative data value.
    pub fn data(&self) -> Value {
        self.inner.data.read().clone()
    }

    /// Updates the authoritative value immediately and broadcasts it. The
    /// applet is the source of truth, so nothing is deferred.
    pub fn set_data(&self, data: Value) {
        self.inner.adopt_data(data);
    }

    /// Reports a new layout size. Rapid successive calls are coalesced to one
    /// `resize` message per observation window, carrying the final state.
    pub fn resize(&self, dimensions: Dimensions) {
        self.inner.viewport.send_replace(dimensions);
    }

    pub fn dimensions(&self) -> Dimensions {
        *self.inner.dimensions.read()
    }

    pub fn manifest(&self) -> Manifest {
        self.inner.manifest.read().clone()
    }

    pub fn actions(&self) -> ActionMap {
        self.inner.actions.read().clone()
    }

    /// Fired once the manifest is loaded, before registering with the host.
    pub fn on_load<F>(&self, listener: F)
    where
        F: Fn(&Manifest) + Send + Sync + 'static,
    {
        self.inner.on_load.subscribe(listener);
    }

    /// Fired once the `register` message has been sent.
    pub fn on_ready<F>(&self, listener: F)
    where
        F: Fn(&()) + Send + Sync + 'static,
    {
        self.inner.on_ready.subscribe(listener);
    }

    /// Fired whenever the data value changes, locally or host-initiated.
    pub fn on_data<F>(&self, listener: F)
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.inner.on_data.subscribe(listener);
    }
}

async fn initialize(
    inner: &Arc<ScopeInner>,
    location: &crate::runtime::AppletLocation,
    manifest_override: Option<Manifest>,
    resize_debounce: std::time::Duration,
) {
    let manifest = match manifest_override {
        Some(mut manifest) => {
            manifest.normalize();
            manifest
        }
        None => load_manifest(location).await,
    };
    *inner.manifest.write() = manifest.clone();

    // Keep actions the program already defined; the manifest fills the rest.
    let actions = {
        let mut actions = inner.actions.write();
        for (id, descriptor) in &manifest.actions {
            actions.entry(id.clone()).or_insert_with(|| descriptor.clone());
        }
        actions.clone()
    };

    inner.on_load.emit(&manifest);

    let register = Message::new(Payload::Register {
        manifest,
        actions,
        data: inner.data.read().clone(),
    });
    if inner.relay.send(register).is_err() {
        debug!("channel closed before registration");
        return;
    }
    inner.on_ready.emit(&());

    spawn_viewport_observer(inner, resize_debounce);
}

impl ScopeInner {
    pub(crate) fn viewport_rx(&self) -> watch::Receiver<Dimensions> {
        self.viewport.subscribe()
    }

    /// Stores a new authoritative value, broadcasts it, and fires local
    /// listeners.
    fn adopt_data(&self, data: Value) {
        *self.data.write() = data.clone();
        let _ = self.relay.send(Message::new(Payload::Data { data: data.clone() }));
        self.on_data.emit(&data);
    }

    async fn handle_action(self: Arc<Self>, message: Message) {
        let Payload::Action {
            action_id,
            arguments,
        } = message.payload
        else {
            return;
        };
        let handler = self.handlers.read().get(&action_id).cloned();
        let Some(handler) = handler else {
            // Not an error: the host is allowed to probe actions we never
            // declared. Only explicit handler failures are reported.
            debug!(%action_id, "no handler registered, ignoring action");
            return;
        };
        match handler(arguments).await {
            Ok(()) => {
                let _ = self.relay.send(Message::new(Payload::ActionComplete {
                    request_id: message.id,
                }));
            }
            Err(err) => {
                error!(%action_id, %err, "action handler failed");
                let _ = self.relay.send(Message::new(Payload::ActionError {
                    request_id: message.id,
                    message: format!("error executing action handler '{action_id}': {err}"),
                }));
            }
        }
    }
}
