//! Typed dispatch and request/response correlation over one [`Port`].
//!
//! A relay owns its port through a bridge task: outbound messages are queued,
//! JSON-encoded and written to the port; inbound bytes are decoded and routed
//! by message kind through a handler table. After a registered handler
//! settles, the relay emits a `response` message naming the handled message's
//! id, so the protocol is self-acknowledging without call sites managing that
//! bookkeeping. Messages of unrecognized kind or malformed shape are dropped
//! with a debug line, never surfaced to application code.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::debug;

use applet_proto::{Kind, Message, Payload};
use port_bus::Port;

use crate::errors::RelayError;

type Handler = Arc<dyn Fn(Message) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Clone)]
pub struct MessageRelay {
    inner: Arc<RelayInner>,
}

struct RelayInner {
    /// "host" or "applet"; only used in log lines.
    label: &'static str,
    outgoing: mpsc::UnboundedSender<Message>,
    outgoing_rx: Mutex<Option<mpsc::UnboundedReceiver<Message>>>,
    handlers: Mutex<HashMap<Kind, Vec<Handler>>>,
    pending: Mutex<HashMap<String, oneshot::Sender<()>>>,
    bridge: Mutex<Option<JoinHandle<()>>>,
}

impl MessageRelay {
    pub fn new(label: &'static str) -> Self {
        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(RelayInner {
                label,
                outgoing,
                outgoing_rx: Mutex::new(Some(outgoing_rx)),
                handlers: Mutex::new(HashMap::new()),
                pending: Mutex::new(HashMap::new()),
                bridge: Mutex::new(None),
            }),
        }
    }

    /// Registers an async handler for one message kind. Handlers registered
    /// for the same kind run in registration order.
    pub fn on<F, Fut>(&self, kind: Kind, handler: F)
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |message| Box::pin(handler(message)));
        self.inner
            .handlers
            .lock()
            .entry(kind)
            .or_default()
            .push(handler);
    }

    /// Starts the bridge task over `port`. Messages sent before `attach` are
    /// queued and flushed once the bridge starts.
    pub fn attach(&self, port: Port) {
        let Some(mut outgoing_rx) = self.inner.outgoing_rx.lock().take() else {
            debug!(label = self.inner.label, "relay already attached, ignoring port");
            return;
        };
        let weak = Arc::downgrade(&self.inner);
        let label = self.inner.label;
        let mut port = port;
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    outbound = outgoing_rx.recv() => {
                        let Some(message) = outbound else { break };
                        match serde_json::to_vec(&message) {
                            Ok(raw) => {
                                if port.send(Bytes::from(raw)).is_err() {
                                    debug!(label, "peer port closed, stopping bridge");
                                    break;
                                }
                            }
                            Err(err) => debug!(label, %err, "failed to encode message"),
                        }
                    }
                    inbound = port.recv() => {
                        let Some(raw) = inbound else {
                            debug!(label, "channel closed by peer");
                            break;
                        };
                        let Some(inner) = weak.upgrade() else { break };
                        inner.dispatch(raw).await;
                    }
                }
            }
        });
        *self.inner.bridge.lock() = Some(handle);
    }

    /// Fire-and-forget send.
    pub fn send(&self, message: Message) -> Result<(), RelayError> {
        debug!(
            label = self.inner.label,
            kind = ?message.kind(),
            id = %message.id,
            "send message"
        );
        self.inner
            .outgoing
            .send(message)
            .map_err(|_| RelayError::Closed)
    }

    /// Sends a message and resolves once the peer's `response` for it comes
    /// back. No timeout is applied here; callers bound the wait.
    pub async fn request(&self, message: Message) -> Result<(), RelayError> {
        let (tx, rx) = oneshot::channel();
        let request_id = message.id.clone();
        self.inner.pending.lock().insert(request_id.clone(), tx);
        if let Err(err) = self.send(message) {
            self.inner.pending.lock().remove(&request_id);
            return Err(err);
        }
        rx.await.map_err(|_| RelayError::Closed)
    }
}

impl RelayInner {
    async fn dispatch(self: Arc<Self>, raw: Bytes) {
        let message: Message = match serde_json::from_slice(&raw) {
            Ok(message) => message,
            Err(err) => {
                debug!(label = self.label, %err, "dropping malformed message");
                return;
            }
        };
        debug!(
            label = self.label,
            kind = ?message.kind(),
            id = %message.id,
            "received message"
        );

        if let Payload::Response { request_id } = &message.payload {
            match self.pending.lock().remove(request_id) {
                Some(waiter) => {
                    let _ = waiter.send(());
                }
                None => debug!(
                    label = self.label,
                    %request_id, "response without pending request, ignoring"
                ),
            }
            return;
        }

        let handlers = self
            .handlers
            .lock()
            .get(&message.kind())
            .cloned()
            .unwrap_or_default();
        if handlers.is_empty() {
            debug!(label = self.label, kind = ?message.kind(), "no handler for kind, ignoring");
            return;
        }

        let request_id = message.id.clone();
        for handler in handlers {
            handler(message.clone()).await;
        }
        let ack = Message::new(Payload::Response { request_id });
        let _ = self.outgoing.send(ack);
    }
}

impl Drop for RelayInner {
    fn drop(&mut self) {
        if let Some(handle) = self.bridge.lock().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use applet_proto::Dimensions;
    use port_bus::port_pair;
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn handled_request_is_acknowledged() {
        let (host_port, applet_port) = port_pair();
        let host = MessageRelay::new("host");
        let applet = MessageRelay::new("applet");

        let seen: Arc<Mutex<Vec<serde_json::Value>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        applet.on(Kind::Data, move |message| {
            let sink = sink.clone();
            async move {
                if let Payload::Data { data } = message.payload {
                    sink.lock().push(data);
                }
            }
        });

        host.attach(host_port);
        applet.attach(applet_port);

        let message = Message::new(Payload::Data {
            data: json!({ "n": 1 }),
        });
        tokio::time::timeout(Duration::from_secs(1), host.request(message))
            .await
            .expect("acknowledged before timeout")
            .expect("request ok");
        assert_eq!(&*seen.lock(), &[json!({ "n": 1 })]);
    }

    #[tokio::test]
    async fn malformed_and_unhandled_messages_are_dropped() {
        let (host_port, applet_port) = port_pair();
        let applet = MessageRelay::new("applet");

        let seen: Arc<Mutex<Vec<Dimensions>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        applet.on(Kind::Resize, move |message| {
            let sink = sink.clone();
            async move {
                if let Payload::Resize { dimensions } = message.payload {
                    sink.lock().push(dimensions);
                }
            }
        });
        applet.attach(applet_port);

        // Garbage, an unknown kind, and a recognized-but-unhandled kind all
        // get dropped without tearing the bridge down.
        host_port.send(Bytes::from_static(b"not json")).expect("send ok");
        host_port
            .send(Bytes::from(
                serde_json::to_vec(&json!({ "id": "x", "timestamp": 0, "type": "mystery" }))
                    .expect("encode"),
            ))
            .expect("send ok");
        host_port
            .send(Bytes::from(
                serde_json::to_vec(&Message::new(Payload::Connect)).expect("encode"),
            ))
            .expect("send ok");
        host_port
            .send(Bytes::from(
                serde_json::to_vec(&Message::new(Payload::Resize {
                    dimensions: Dimensions {
                        width: 320.0,
                        height: 200.0,
                    },
                }))
                .expect("encode"),
            ))
            .expect("send ok");

        tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                if !seen.lock().is_empty() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("resize dispatched");
        assert_eq!(seen.lock().len(), 1);
    }

    #[tokio::test]
    async fn sends_before_attach_are_flushed_in_order() {
        let (host_port, mut applet_port) = port_pair();
        let host = MessageRelay::new("host");

        host.send(Message::new(Payload::Connect)).expect("send ok");
        host.send(Message::new(Payload::Data { data: json!(2) }))
            .expect("send ok");
        host.attach(host_port);

        let first: Message =
            serde_json::from_slice(&applet_port.recv().await.expect("first")).expect("decode");
        let second: Message =
            serde_json::from_slice(&applet_port.recv().await.expect("second")).expect("decode");
        assert_eq!(first.kind(), Kind::Connect);
        assert_eq!(second.kind(), Kind::Data);
    }
}
