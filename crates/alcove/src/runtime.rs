//! The embedding runtime: spawning an applet program as an isolated task.
//!
//! A guest receives exactly one value, its [`GuestWindow`]: an announce
//! sender pointing at the embedding host, an inbox for envelopes posted back
//! down (the handshake's port transfer arrives here), and the location its
//! manifest lives at. Everything else the guest touches it must build itself;
//! the only way to reach the host is through messages.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::task::JoinHandle;
use url::Url;

use applet_proto::Manifest;
use port_bus::{mailbox, Mailbox, MailboxSender};

/// Where an applet's entry document (and therefore its manifest) lives.
#[derive(Debug, Clone)]
pub enum AppletLocation {
    Remote(Url),
    Local(PathBuf),
    /// No document at all; the manifest is inline or empty.
    Inline,
}

/// Sandboxing policy applied to an applet's execution context. The default
/// is the strictest available; `Permissive` requires both the load options
/// and the applet's manifest to opt in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxPolicy {
    /// Scripts and form-style interaction only, no ambient trust.
    Isolated,
    /// Relaxed isolation for applets that embed third-party content.
    Permissive,
}

pub type AppletProgram = Arc<dyn Fn(GuestWindow) -> BoxFuture<'static, ()> + Send + Sync>;

/// An applet ready to be loaded: its location plus the program to run inside
/// the isolated context.
#[derive(Clone)]
pub struct AppletBundle {
    pub(crate) location: AppletLocation,
    pub(crate) manifest: Option<Manifest>,
    pub(crate) program: AppletProgram,
}

impl AppletBundle {
    pub fn new<F, Fut>(location: AppletLocation, program: F) -> Self
    where
        F: Fn(GuestWindow) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        Self {
            location,
            manifest: None,
            program: Arc::new(move |window| Box::pin(program(window))),
        }
    }

    /// A bundle with no entry document, common for tests and headless
    /// applets.
    pub fn inline<F, Fut>(program: F) -> Self
    where
        F: Fn(GuestWindow) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        Self::new(AppletLocation::Inline, program)
    }

    /// Supplies the manifest directly, bypassing the loader.
    pub fn with_manifest(mut self, manifest: Manifest) -> Self {
        self.manifest = Some(manifest);
        self
    }
}

/// Everything a guest task is given. Consumed by
/// [`AppletScope::register`](crate::guest::AppletScope::register).
pub struct GuestWindow {
    pub(crate) announce: MailboxSender,
    pub(crate) inbox: Mailbox,
    pub(crate) location: AppletLocation,
    pub(crate) manifest: Option<Manifest>,
    pub(crate) resize_debounce: Duration,
}

/// Spawns the guest program in its own task and returns the host-side ends:
/// the sender for the guest's inbox and the task handle. The caller owns
/// both; tearing the task down is the only way to stop a guest.
pub(crate) fn spawn_guest(
    program: &AppletProgram,
    location: AppletLocation,
    manifest: Option<Manifest>,
    announce: MailboxSender,
    resize_debounce: Duration,
) -> (MailboxSender, JoinHandle<()>) {
    let (inbox_tx, inbox) = mailbox();
    let window = GuestWindow {
        announce,
        inbox,
        location,
        manifest,
        resize_debounce,
    };
    let task = tokio::spawn(program(window));
    (inbox_tx, task)
}

impl SandboxPolicy {
    pub(crate) fn negotiate(host_allows_unsafe: bool, manifest_allows_unsafe: bool) -> Self {
        if host_allows_unsafe && manifest_allows_unsafe {
            SandboxPolicy::Permissive
        } else {
            SandboxPolicy::Isolated
        }
    }
}
