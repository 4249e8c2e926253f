//! Soft-failing manifest loader.
//!
//! An applet declares its action catalog in a `manifest.json` next to its
//! entry document. Absence of a manifest is a valid, common state (e.g.
//! during first paint), so this loader never fails: fetch errors, parse
//! errors and missing files all degrade to the empty manifest.

use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::{debug, warn};
use url::Url;

use applet_proto::Manifest;

use crate::runtime::AppletLocation;

pub const MANIFEST_FILE: &str = "manifest.json";

/// Loads and normalizes the manifest for `location`. Infallible by contract;
/// callers always get a usable (possibly empty) manifest.
pub async fn load_manifest(location: &AppletLocation) -> Manifest {
    let result = match location {
        AppletLocation::Inline => return Manifest::default(),
        AppletLocation::Remote(url) => fetch_remote(url).await,
        AppletLocation::Local(path) => read_local(path).await,
    };
    let mut manifest = match result {
        Ok(manifest) => manifest,
        Err(err) => {
            warn!(?location, %err, "manifest unavailable, falling back to empty manifest");
            Manifest::default()
        }
    };
    manifest.normalize();
    debug!(
        ?location,
        actions = manifest.actions.len(),
        "manifest loaded"
    );
    manifest
}

/// Resolves the manifest's `start_url` relative to the manifest location.
pub fn resolve_start_url(manifest: &Manifest, base: &Url) -> Option<Url> {
    let start_url = manifest.start_url.as_deref()?;
    base.join(start_url).ok()
}

async fn fetch_remote(base: &Url) -> anyhow::Result<Manifest> {
    let url = manifest_url(base)?;
    let response = reqwest::get(url.clone())
        .await
        .with_context(|| format!("fetching {url}"))?
        .error_for_status()?;
    let manifest = response.json::<Manifest>().await.context("parsing manifest")?;
    Ok(manifest)
}

async fn read_local(path: &Path) -> anyhow::Result<Manifest> {
    let path = local_manifest_path(path);
    let raw = tokio::fs::read(&path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let manifest = serde_json::from_slice(&raw).context("parsing manifest")?;
    Ok(manifest)
}

fn manifest_url(base: &Url) -> anyhow::Result<Url> {
    if base.path().ends_with(".json") {
        return Ok(base.clone());
    }
    // Treat the location as a directory so `join` resolves next to it.
    let mut base = base.clone();
    if !base.path().ends_with('/') {
        base.set_path(&format!("{}/", base.path()));
    }
    base.join(MANIFEST_FILE).context("resolving manifest url")
}

fn local_manifest_path(path: &Path) -> PathBuf {
    if path.extension().is_some_and(|ext| ext == "json") {
        path.to_path_buf()
    } else {
        path.join(MANIFEST_FILE)
    }
}
