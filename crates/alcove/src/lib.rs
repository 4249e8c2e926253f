//! Alcove: embed isolated applets behind a narrow message protocol.
//!
//! A host loads an applet into a sandboxed execution context, discovers its
//! declared actions, invokes them with correlation and timeouts, and mirrors
//! the applet's data value and layout size. The applet, symmetrically,
//! declares actions, handles invocations, and pushes data/size updates
//! upward. Messages are the only channel of interaction; no shared object
//! graph exists across the boundary.

pub mod config;
pub mod errors;
pub mod events;
pub mod guest;
pub mod host;
pub mod manifest;
pub mod relay;
pub mod runtime;
pub mod telemetry;

pub use applet_proto::{ActionDescriptor, ActionMap, Dimensions, Manifest, ManifestIcon};

pub use config::HostConfig;
pub use errors::{ConnectionError, ExecutionError};
pub use guest::AppletScope;
pub use host::{Applet, Container, Host, LoadOptions};
pub use runtime::{AppletBundle, AppletLocation, GuestWindow, SandboxPolicy};
