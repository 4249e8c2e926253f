//! Data flow in both directions: the applet owns the value, the host mirrors.

use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc::unbounded_channel;

use alcove::{AppletBundle, AppletScope, Host, HostConfig, LoadOptions};

fn test_config() -> HostConfig {
    HostConfig {
        connect_timeout: Duration::from_secs(2),
        response_timeout: Duration::from_secs(2),
        resize_debounce: Duration::from_millis(25),
    }
}

fn scope_bundle() -> (
    AppletBundle,
    tokio::sync::mpsc::UnboundedReceiver<AppletScope>,
) {
    let (scope_tx, scope_rx) = unbounded_channel();
    let bundle = AppletBundle::inline(move |window| {
        let scope_tx = scope_tx.clone();
        async move {
            let scope = AppletScope::register(window);
            let _ = scope_tx.send(scope);
        }
    });
    (bundle, scope_rx)
}

#[tokio::test]
async fn host_push_round_trips_through_the_applet() {
    let host = Host::new(test_config());
    let (bundle, mut scope_rx) = scope_bundle();
    let applet = host
        .load(bundle, None, LoadOptions::default())
        .await
        .expect("load");
    let scope = scope_rx.recv().await.expect("scope handle");

    let (seen_tx, mut seen_rx) = unbounded_channel();
    scope.on_data(move |value| {
        let _ = seen_tx.send(value.clone());
    });

    applet
        .set_data(json!({ "todo": ["write tests"] }))
        .await
        .expect("set_data");

    // The applet adopted the value and confirmed it before set_data resolved.
    assert_eq!(scope.data(), json!({ "todo": ["write tests"] }));
    assert_eq!(applet.data(), json!({ "todo": ["write tests"] }));
    assert_eq!(
        seen_rx.recv().await.as_ref(),
        Some(&json!({ "todo": ["write tests"] }))
    );
}

#[tokio::test]
async fn applet_broadcast_reaches_the_host_mirror() {
    let host = Host::new(test_config());
    let (bundle, mut scope_rx) = scope_bundle();
    let applet = host
        .load(bundle, None, LoadOptions::default())
        .await
        .expect("load");
    let scope = scope_rx.recv().await.expect("scope handle");

    let (seen_tx, mut seen_rx) = unbounded_channel();
    applet.on_data(move |value| {
        let _ = seen_tx.send(value.clone());
    });

    scope.set_data(json!({ "count": 7 }));
    // The applet's own view updates synchronously.
    assert_eq!(scope.data(), json!({ "count": 7 }));

    assert_eq!(seen_rx.recv().await.as_ref(), Some(&json!({ "count": 7 })));
    assert_eq!(applet.data(), json!({ "count": 7 }));
}

#[tokio::test]
async fn initial_data_is_part_of_registration() {
    let host = Host::new(test_config());
    let bundle = AppletBundle::inline(|window| async move {
        let scope = AppletScope::register(window);
        scope.set_data(json!({ "seeded": true }));
    });

    let applet = host
        .load(bundle, None, LoadOptions::default())
        .await
        .expect("load");

    // Whether the seed arrived in `register` or as an immediate broadcast,
    // the mirror converges on it.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
    loop {
        if applet.data() == json!({ "seeded": true }) {
            break;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("mirror never adopted the seeded value: {:?}", applet.data());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
