//! Host-side surface: loading applets and the embedding container.

mod applet;

pub use applet::Applet;

use std::sync::Arc;

use tokio::sync::watch;
use tracing::debug;

use applet_proto::Dimensions;

use crate::config::HostConfig;
use crate::errors::ConnectionError;
use crate::runtime::AppletBundle;

/// Options applied when loading one applet.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoadOptions {
    /// Opt in to a relaxed sandbox. Only takes effect for applets whose
    /// manifest also declares `unsafe`.
    pub allow_unsafe: bool,
}

/// The embedding container an applet is loaded into. Mirrors the applet's
/// reported layout size so the embedder can resize whatever visual surface
/// it manages. Loading without a container gives a headless applet: actions
/// and data still function, resize events are not meaningful.
#[derive(Clone)]
pub struct Container {
    dimensions: Arc<watch::Sender<Dimensions>>,
}

impl Container {
    pub fn new() -> Self {
        Self {
            dimensions: Arc::new(watch::channel(Dimensions::default()).0),
        }
    }

    /// Last size reported by the embedded applet.
    pub fn dimensions(&self) -> Dimensions {
        *self.dimensions.borrow()
    }

    /// Watch size changes, e.g. to drive a layout system.
    pub fn subscribe(&self) -> watch::Receiver<Dimensions> {
        self.dimensions.subscribe()
    }

    pub(crate) fn apply(&self, dimensions: Dimensions) {
        self.dimensions.send_replace(dimensions);
    }
}

impl Default for Container {
    fn default() -> Self {
        Self::new()
    }
}

/// Loads applets. One `Host` may load any number of applet instances; each
/// gets its own isolated context and private channel with no cross-talk.
#[derive(Debug, Clone, Default)]
pub struct Host {
    config: HostConfig,
}

impl Host {
    pub fn new(config: HostConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    /// Spawns the applet's isolated context, runs the connection handshake,
    /// and resolves once the applet's initial `register` message arrives.
    /// Fails with [`ConnectionError::Timeout`] if the handshake does not
    /// complete within the configured connect timeout.
    pub async fn load(
        &self,
        bundle: AppletBundle,
        container: Option<Container>,
        options: LoadOptions,
    ) -> Result<Applet, ConnectionError> {
        let applet = Applet::boot(self.config.clone(), bundle, container, options);
        match applet.wait_registered().await {
            Ok(()) => {
                debug!(applet = %applet.id(), "applet loaded");
                Ok(applet)
            }
            Err(err) => {
                applet.abandon();
                Err(err)
            }
        }
    }
}
