//! Resize reporting: rapid size changes coalesce to one message carrying the
//! final state.

use std::time::Duration;

use tokio::sync::mpsc::unbounded_channel;
use tokio::time::sleep;

use alcove::{AppletBundle, AppletScope, Container, Dimensions, Host, HostConfig, LoadOptions};

fn test_config() -> HostConfig {
    HostConfig {
        connect_timeout: Duration::from_secs(2),
        response_timeout: Duration::from_secs(2),
        resize_debounce: Duration::from_millis(25),
    }
}

#[tokio::test]
async fn rapid_resizes_collapse_to_the_final_size() {
    let host = Host::new(test_config());
    let (scope_tx, mut scope_rx) = unbounded_channel();
    let bundle = AppletBundle::inline(move |window| {
        let scope_tx = scope_tx.clone();
        async move {
            let scope = AppletScope::register(window);
            let _ = scope_tx.send(scope);
        }
    });

    let container = Container::new();
    let applet = host
        .load(bundle, Some(container.clone()), LoadOptions::default())
        .await
        .expect("load");
    let scope = scope_rx.recv().await.expect("scope handle");

    let (resize_tx, mut resize_rx) = unbounded_channel();
    applet.on_resize(move |dims| {
        let _ = resize_tx.send(*dims);
    });

    for width in [100.0, 200.0, 300.0, 400.0, 500.0] {
        scope.resize(Dimensions {
            width,
            height: 240.0,
        });
    }

    let reported = resize_rx.recv().await.expect("resize event");
    assert_eq!(
        reported,
        Dimensions {
            width: 500.0,
            height: 240.0
        }
    );

    // Only the final state crossed the wire.
    sleep(Duration::from_millis(120)).await;
    assert!(resize_rx.try_recv().is_err());

    assert_eq!(applet.dimensions(), Some(reported));
    assert_eq!(container.dimensions(), reported);
    assert_eq!(scope.dimensions(), reported);
}

#[tokio::test]
async fn later_resizes_report_again() {
    let host = Host::new(test_config());
    let (scope_tx, mut scope_rx) = unbounded_channel();
    let bundle = AppletBundle::inline(move |window| {
        let scope_tx = scope_tx.clone();
        async move {
            let scope = AppletScope::register(window);
            let _ = scope_tx.send(scope);
        }
    });

    let applet = host
        .load(bundle, None, LoadOptions::default())
        .await
        .expect("load");
    let scope = scope_rx.recv().await.expect("scope handle");

    let (resize_tx, mut resize_rx) = unbounded_channel();
    applet.on_resize(move |dims| {
        let _ = resize_tx.send(*dims);
    });

    scope.resize(Dimensions {
        width: 320.0,
        height: 200.0,
    });
    let first = resize_rx.recv().await.expect("first resize");
    assert_eq!(first.width, 320.0);

    scope.resize(Dimensions {
        width: 640.0,
        height: 480.0,
    });
    let second = resize_rx.recv().await.expect("second resize");
    assert_eq!(
        second,
        Dimensions {
            width: 640.0,
            height: 480.0
        }
    );
}
