//! The host's proxy for one applet instance: mirrored catalog, mirrored data
//! value, last-known size, pending action requests, and the connection
//! upgrade loop.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::debug;
use uuid::Uuid;

use applet_proto::{ActionMap, Dimensions, Kind, Manifest, Message, Payload};
use port_bus::{mailbox, port_pair, Mailbox, MailboxSender};

use crate::config::HostConfig;
use crate::errors::{ConnectionError, ExecutionError};
use crate::events::Callbacks;
use crate::host::{Container, LoadOptions};
use crate::relay::MessageRelay;
use crate::runtime::{spawn_guest, AppletBundle, AppletLocation, AppletProgram, SandboxPolicy};

type PendingAction = oneshot::Sender<Result<(), ExecutionError>>;

/// Handle on a loaded applet. Cheap to clone; all clones share one instance.
#[derive(Clone)]
pub struct Applet {
    inner: Arc<AppletInner>,
}

impl std::fmt::Debug for Applet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Applet").field("id", &self.inner.id).finish_non_exhaustive()
    }
}

struct AppletInner {
    id: Uuid,
    config: HostConfig,
    allow_unsafe: bool,
    policy: RwLock<SandboxPolicy>,
    program: AppletProgram,
    location: AppletLocation,
    manifest_override: Option<Manifest>,
    announce_tx: MailboxSender,
    inbox_tx: RwLock<MailboxSender>,
    relay: RwLock<Option<MessageRelay>>,
    guest_task: Mutex<Option<JoinHandle<()>>>,
    upgrade_task: Mutex<Option<JoinHandle<()>>>,
    // Mirrors; written only by inbound messages.
    manifest: RwLock<Manifest>,
    actions: RwLock<ActionMap>,
    data: RwLock<Value>,
    dimensions: RwLock<Option<Dimensions>>,
    container: Option<Container>,
    pending: Mutex<HashMap<String, PendingAction>>,
    registered: watch::Sender<bool>,
    closed: AtomicBool,
    on_actions: Callbacks<ActionMap>,
    on_data: Callbacks<Value>,
    on_resize: Callbacks<Dimensions>,
}

impl Applet {
    /// Spawns the isolated context and the upgrade listener. Registration
    /// has not happened yet; callers await [`Applet::wait_registered`].
    pub(super) fn boot(
        config: HostConfig,
        bundle: AppletBundle,
        container: Option<Container>,
        options: LoadOptions,
    ) -> Applet {
        let AppletBundle {
            location,
            manifest,
            program,
        } = bundle;

        let (announce_tx, announce_rx) = mailbox();
        let (inbox_tx, guest_task) = spawn_guest(
            &program,
            location.clone(),
            manifest.clone(),
            announce_tx.clone(),
            config.resize_debounce,
        );

        let inner = Arc::new(AppletInner {
            id: Uuid::new_v4(),
            config,
            allow_unsafe: options.allow_unsafe,
            policy: RwLock::new(SandboxPolicy::Isolated),
            program,
            location,
            manifest_override: manifest,
            announce_tx,
            inbox_tx: RwLock::new(inbox_tx),
            relay: RwLock::new(None),
            guest_task: Mutex::new(Some(guest_task)),
            upgrade_task: Mutex::new(None),
            manifest: RwLock::new(Manifest::default()),
            actions: RwLock::new(ActionMap::new()),
            data: RwLock::new(Value::Null),
            dimensions: RwLock::new(None),
            container,
            pending: Mutex::new(HashMap::new()),
            registered: watch::channel(false).0,
            closed: AtomicBool::new(false),
            on_actions: Callbacks::new(),
            on_data: Callbacks::new(),
            on_resize: Callbacks::new(),
        });

        let upgrade_task = spawn_upgrade_listener(&inner, announce_rx);
        *inner.upgrade_task.lock() = Some(upgrade_task);

        Applet { inner }
    }

    pub(super) async fn wait_registered(&self) -> Result<(), ConnectionError> {
        let mut registered = self.inner.registered.subscribe();
        let result = match timeout(
            self.inner.config.connect_timeout,
            registered.wait_for(|ready| *ready),
        )
        .await
        {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(ConnectionError::Closed),
            Err(_) => Err(ConnectionError::Timeout(self.inner.config.connect_timeout)),
        };
        result
    }

    /// Tears the instance down after a failed load.
    pub(super) fn abandon(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.teardown();
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// The effective sandbox policy, negotiated between load options and the
    /// applet's manifest at registration.
    pub fn sandbox_policy(&self) -> SandboxPolicy {
        *self.inner.policy.read()
    }

    /// Mirrored manifest (read-only copy of the applet's).
    pub fn manifest(&self) -> Manifest {
        self.inner.manifest.read().clone()
    }

    /// Mirrored action catalog. The applet is authoritative; this may lag.
    pub fn actions(&self) -> ActionMap {
        self.inner.actions.read().clone()
    }

    /// Last mirrored data value. Synchronous, no I/O.
    pub fn data(&self) -> Value {
        self.inner.data.read().clone()
    }

    /// Last reported layout size, if any resize has been observed.
    pub fn dimensions(&self) -> Option<Dimensions> {
        *self.inner.dimensions.read()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Invokes an action on the applet and awaits its completion. The applet
    /// is authoritative about which actions exist; nothing is validated
    /// against the mirrored catalog here. Rejects with [`ExecutionError`] on
    /// handler failure or after the response timeout.
    pub async fn dispatch_action(
        &self,
        action_id: impl Into<String>,
        arguments: Value,
    ) -> Result<(), ExecutionError> {
        if self.is_closed() {
            return Err(ExecutionError::Disconnected);
        }
        let relay = self
            .inner
            .relay
            .read()
            .clone()
            .ok_or(ExecutionError::Disconnected)?;

        let message = Message::new(Payload::Action {
            action_id: action_id.into(),
            arguments,
        });
        let request_id = message.id.clone();
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().insert(request_id.clone(), tx);

        if relay.send(message).is_err() {
            self.inner.pending.lock().remove(&request_id);
            return Err(ExecutionError::Disconnected);
        }

        match timeout(self.inner.config.response_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ExecutionError::Disconnected),
            Err(_) => {
                // Abandon the pending record; a late reply finds nothing and
                // is ignored.
                self.inner.pending.lock().remove(&request_id);
                Err(ExecutionError::Timeout(self.inner.config.response_timeout))
            }
        }
    }

    /// Asks the applet to adopt a new data value. The local mirror is not
    /// updated optimistically: it changes only when the applet's confirming
    /// broadcast arrives, which is ordered before this call resolves.
    pub async fn set_data(&self, data: Value) -> Result<(), ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }
        let relay = self
            .inner
            .relay
            .read()
            .clone()
            .ok_or(ConnectionError::Closed)?;
        let message = Message::new(Payload::Data { data });
        match timeout(self.inner.config.response_timeout, relay.request(message)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(ConnectionError::Closed),
            Err(_) => Err(ConnectionError::Timeout(self.inner.config.response_timeout)),
        }
    }

    /// Fired when the mirrored action catalog changes.
    pub fn on_actions<F>(&self, listener: F)
    where
        F: Fn(&ActionMap) + Send + Sync + 'static,
    {
        self.inner.on_actions.subscribe(listener);
    }

    /// Fired when the mirrored data value changes.
    pub fn on_data<F>(&self, listener: F)
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.inner.on_data.subscribe(listener);
    }

    /// Fired when the applet reports a new layout size.
    pub fn on_resize<F>(&self, listener: F)
    where
        F: Fn(&Dimensions) + Send + Sync + 'static,
    {
        self.inner.on_resize.subscribe(listener);
    }

    /// Tears down the guest context and restarts the applet program. The
    /// fresh guest re-announces and the upgrade listener replaces the private
    /// channel; resolves once the new registration arrives.
    pub async fn reload(&self) -> Result<(), ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }
        debug!(applet = %self.inner.id, "reloading applet");
        let _ = self.inner.registered.send(false);
        if let Some(task) = self.inner.guest_task.lock().take() {
            task.abort();
        }
        {
            // Hold the inbox slot until the new sender is in place, so the
            // fresh guest's `connect` cannot be answered into the old inbox.
            let mut inbox_slot = self.inner.inbox_tx.write();
            let (inbox_tx, guest_task) = spawn_guest(
                &self.inner.program,
                self.inner.location.clone(),
                self.inner.manifest_override.clone(),
                self.inner.announce_tx.clone(),
                self.inner.config.resize_debounce,
            );
            *inbox_slot = inbox_tx;
            *self.inner.guest_task.lock() = Some(guest_task);
        }
        self.wait_registered().await
    }

    /// Releases the isolated context. Terminal: the handle is unusable
    /// afterwards, and a second call fails with [`ConnectionError::Closed`].
    pub fn disconnect(&self) -> Result<(), ConnectionError> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Err(ConnectionError::Closed);
        }
        debug!(applet = %self.inner.id, "disconnecting applet");
        self.inner.teardown();
        Ok(())
    }
}

impl AppletInner {
    fn teardown(&self) {
        if let Some(task) = self.guest_task.lock().take() {
            task.abort();
        }
        if let Some(task) = self.upgrade_task.lock().take() {
            task.abort();
        }
        // Dropping the relay aborts its bridge and closes the private
        // channel; dropping pending waiters resolves in-flight dispatches
        // with `Disconnected`.
        *self.relay.write() = None;
        self.pending.lock().clear();
        let _ = self.registered.send(false);
    }
}

impl Drop for AppletInner {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Runs for the lifetime of the applet instance: every `connect`
/// announcement from the context yields a fresh private channel, replacing
/// any previous one (reconnection after a guest reload).
fn spawn_upgrade_listener(inner: &Arc<AppletInner>, mut announce_rx: Mailbox) -> JoinHandle<()> {
    let weak = Arc::downgrade(inner);
    tokio::spawn(async move {
        while let Some(envelope) = announce_rx.recv().await {
            let Some(inner) = weak.upgrade() else { break };
            let message: Message = match serde_json::from_slice(&envelope.payload) {
                Ok(message) => message,
                Err(err) => {
                    debug!(%err, "dropping malformed announcement");
                    continue;
                }
            };
            if !matches!(message.payload, Payload::Connect) {
                debug!(kind = ?message.kind(), "ignoring non-connect announcement");
                continue;
            }
            debug!(applet = %inner.id, "connect announcement, upgrading to private channel");

            let (host_port, guest_port) = port_pair();
            let relay = MessageRelay::new("host");
            wire_relay_handlers(&inner, &relay);
            relay.attach(host_port);

            // Transfer the guest end inside the announcement's reply.
            let reply = Message::new(Payload::Connect);
            let raw = match serde_json::to_vec(&reply) {
                Ok(raw) => raw,
                Err(err) => {
                    debug!(%err, "failed to encode upgrade reply");
                    continue;
                }
            };
            if inner
                .inbox_tx
                .read()
                .post(Bytes::from(raw), Some(guest_port))
                .is_err()
            {
                debug!(applet = %inner.id, "guest inbox closed, dropping upgrade");
                continue;
            }

            // The old private channel, if any, is discarded and never reused.
            *inner.relay.write() = Some(relay);
        }
    })
}

fn wire_relay_handlers(inner: &Arc<AppletInner>, relay: &MessageRelay) {
    let weak = Arc::downgrade(inner);
    relay.on(Kind::Register, move |message| {
        let weak = weak.clone();
        async move {
            let Some(inner) = weak.upgrade() else { return };
            let Payload::Register {
                mut manifest,
                mut actions,
                data,
            } = message.payload
            else {
                return;
            };
            manifest.normalize();
            for descriptor in actions.values_mut() {
                descriptor.normalize();
            }
            *inner.policy.write() =
                SandboxPolicy::negotiate(inner.allow_unsafe, manifest.allow_unsafe);
            *inner.manifest.write() = manifest;
            *inner.actions.write() = actions.clone();
            *inner.data.write() = data.clone();
            let _ = inner.registered.send(true);
            inner.on_actions.emit(&actions);
            inner.on_data.emit(&data);
        }
    });

    let weak = Arc::downgrade(inner);
    relay.on(Kind::Data, move |message| {
        let weak = weak.clone();
        async move {
            let Some(inner) = weak.upgrade() else { return };
            if let Payload::Data { data } = message.payload {
                *inner.data.write() = data.clone();
                inner.on_data.emit(&data);
            }
        }
    });

    let weak = Arc::downgrade(inner);
    relay.on(Kind::Actions, move |message| {
        let weak = weak.clone();
        async move {
            let Some(inner) = weak.upgrade() else { return };
            if let Payload::Actions { mut actions } = message.payload {
                for descriptor in actions.values_mut() {
                    descriptor.normalize();
                }
                *inner.actions.write() = actions.clone();
                inner.on_actions.emit(&actions);
            }
        }
    });

    let weak = Arc::downgrade(inner);
    relay.on(Kind::Resize, move |message| {
        let weak = weak.clone();
        async move {
            let Some(inner) = weak.upgrade() else { return };
            if let Payload::Resize { dimensions } = message.payload {
                *inner.dimensions.write() = Some(dimensions);
                if let Some(container) = &inner.container {
                    container.apply(dimensions);
                }
                inner.on_resize.emit(&dimensions);
            }
        }
    });

    let weak = Arc::downgrade(inner);
    relay.on(Kind::ActionComplete, move |message| {
        let weak = weak.clone();
        async move {
            let Some(inner) = weak.upgrade() else { return };
            if let Payload::ActionComplete { request_id } = message.payload {
                match inner.pending.lock().remove(&request_id) {
                    Some(waiter) => {
                        let _ = waiter.send(Ok(()));
                    }
                    None => debug!(%request_id, "late action completion, ignoring"),
                }
            }
        }
    });

    let weak = Arc::downgrade(inner);
    relay.on(Kind::ActionError, move |message| {
        let weak = weak.clone();
        async move {
            let Some(inner) = weak.upgrade() else { return };
            if let Payload::ActionError {
                request_id,
                message,
            } = message.payload
            {
                match inner.pending.lock().remove(&request_id) {
                    Some(waiter) => {
                        let _ = waiter.send(Err(ExecutionError::Handler(message)));
                    }
                    None => debug!(%request_id, "late action error, ignoring"),
                }
            }
        }
    });
}
