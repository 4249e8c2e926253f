//! Disconnect and reload semantics.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::Notify;

use alcove::{
    AppletBundle, AppletScope, ConnectionError, ExecutionError, Host, HostConfig, LoadOptions,
};

fn test_config() -> HostConfig {
    HostConfig {
        connect_timeout: Duration::from_secs(2),
        response_timeout: Duration::from_secs(2),
        resize_debounce: Duration::from_millis(25),
    }
}

#[tokio::test]
async fn disconnect_is_terminal() {
    let host = Host::new(test_config());
    let bundle = AppletBundle::inline(|window| async move {
        let scope = AppletScope::register(window);
        scope.set_action_handler("noop", |_args| async { Ok(()) });
    });

    let applet = host
        .load(bundle, None, LoadOptions::default())
        .await
        .expect("load");
    applet
        .dispatch_action("noop", json!({}))
        .await
        .expect("dispatch while connected");

    applet.disconnect().expect("first disconnect");
    assert!(applet.is_closed());

    let err = applet
        .dispatch_action("noop", json!({}))
        .await
        .expect_err("dispatch after disconnect");
    assert!(matches!(err, ExecutionError::Disconnected));

    let err = applet
        .set_data(json!({}))
        .await
        .expect_err("set_data after disconnect");
    assert!(matches!(err, ConnectionError::Closed));

    let err = applet.reload().await.expect_err("reload after disconnect");
    assert!(matches!(err, ConnectionError::Closed));

    let err = applet.disconnect().expect_err("second disconnect");
    assert!(matches!(err, ConnectionError::Closed));
}

#[tokio::test]
async fn disconnect_rejects_in_flight_dispatches() {
    let host = Host::new(test_config());
    let gate = Arc::new(Notify::new());
    let guest_gate = gate.clone();
    let bundle = AppletBundle::inline(move |window| {
        let gate = guest_gate.clone();
        async move {
            let scope = AppletScope::register(window);
            scope.set_action_handler("stall", move |_args| {
                let gate = gate.clone();
                async move {
                    gate.notified().await;
                    Ok(())
                }
            });
        }
    });

    let applet = host
        .load(bundle, None, LoadOptions::default())
        .await
        .expect("load");

    let pending_applet = applet.clone();
    let pending =
        tokio::spawn(async move { pending_applet.dispatch_action("stall", json!({})).await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    applet.disconnect().expect("disconnect");

    let err = pending
        .await
        .expect("join")
        .expect_err("in-flight dispatch must reject");
    assert!(matches!(err, ExecutionError::Disconnected));
}

#[tokio::test]
async fn reload_restarts_the_program_and_reconnects() {
    let host = Host::new(test_config());
    let boots = Arc::new(AtomicUsize::new(0));
    let guest_boots = boots.clone();
    let bundle = AppletBundle::inline(move |window| {
        let boots = guest_boots.clone();
        async move {
            boots.fetch_add(1, Ordering::SeqCst);
            let scope = AppletScope::register(window);
            let state = scope.clone();
            scope.set_action_handler("mark", move |_args| {
                let scope = state.clone();
                async move {
                    scope.set_data(json!({ "marked": true }));
                    Ok(())
                }
            });
        }
    });

    let applet = host
        .load(bundle, None, LoadOptions::default())
        .await
        .expect("load");
    assert_eq!(boots.load(Ordering::SeqCst), 1);

    applet
        .dispatch_action("mark", json!({}))
        .await
        .expect("dispatch before reload");
    assert_eq!(applet.data(), json!({ "marked": true }));

    applet.reload().await.expect("reload");
    assert_eq!(boots.load(Ordering::SeqCst), 2);

    // The fresh context starts from its own registration state and the
    // channel works end to end again.
    assert_eq!(applet.data(), serde_json::Value::Null);
    applet
        .dispatch_action("mark", json!({}))
        .await
        .expect("dispatch after reload");
    assert_eq!(applet.data(), json!({ "marked": true }));
}
