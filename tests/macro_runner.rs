mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::AsyncReadExt;

use common::FakeBackend;
use marauder_console_lib::catalog;
use marauder_console_lib::macros::{MacroError, MacroRunner};
use marauder_console_lib::serial::SerialManager;

#[tokio::test]
async fn refuses_to_run_while_disconnected() {
    let backend = FakeBackend::new();
    let manager = SerialManager::new(backend.clone());
    let runner = MacroRunner::new(Duration::from_millis(1));

    let result = runner.run(&manager, &["scanap"]).await;
    assert_eq!(result, Err(MacroError::NotConnected));
    assert!(!runner.is_executing());
    assert_eq!(backend.counters.writes(), 0);
}

#[tokio::test]
async fn sends_steps_in_order_with_delay() {
    let backend = FakeBackend::new();
    let manager = SerialManager::new(backend.clone());
    assert!(manager.connect(115200).await);
    let mut peer = backend.next_peer().await;

    let recon = catalog::find_macro("Full Recon").expect("macro exists");
    let runner = MacroRunner::new(Duration::from_millis(20));

    let started = Instant::now();
    let sent = runner.run(&manager, recon.steps).await.unwrap();
    assert_eq!(sent, 5);
    // four gaps between five steps
    assert!(started.elapsed() >= Duration::from_millis(80));
    assert!(!runner.is_executing());

    let expected = b"scanap\nstopscan\nscansta\nstopscan\nlistap\n";
    let mut buf = vec![0u8; expected.len()];
    peer.read_exact(&mut buf).await.unwrap();
    assert_eq!(buf, expected);

    manager.disconnect().await;
}

#[tokio::test]
async fn second_run_is_rejected_while_first_is_active() {
    let backend = FakeBackend::new();
    let manager = Arc::new(SerialManager::new(backend.clone()));
    assert!(manager.connect(115200).await);
    let _peer = backend.next_peer().await;

    let runner = Arc::new(MacroRunner::new(Duration::from_millis(100)));
    let first = {
        let manager = manager.clone();
        let runner = runner.clone();
        tokio::spawn(async move { runner.run(&manager, &["scanap", "stopscan"]).await })
    };

    assert!(common::wait_until(|| runner.is_executing()).await);
    assert_eq!(
        runner.run(&manager, &["listap"]).await,
        Err(MacroError::AlreadyRunning)
    );

    assert_eq!(first.await.unwrap(), Ok(2));
    assert!(!runner.is_executing());
    manager.disconnect().await;
}

#[tokio::test]
async fn stops_early_when_connection_drops() {
    let backend = FakeBackend::new();
    let manager = Arc::new(SerialManager::new(backend.clone()));
    assert!(manager.connect(115200).await);
    let _peer = backend.next_peer().await;

    let runner = Arc::new(MacroRunner::new(Duration::from_millis(100)));
    let run = {
        let manager = manager.clone();
        let runner = runner.clone();
        tokio::spawn(async move {
            runner
                .run(&manager, &["scanap", "stopscan", "select -a 0", "attack -t deauth"])
                .await
        })
    };

    assert!(common::wait_until(|| runner.is_executing()).await);
    manager.disconnect().await;

    let sent = run.await.unwrap().unwrap();
    assert!(sent < 4, "sent {} steps after disconnect", sent);
}
