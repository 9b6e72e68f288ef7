//! End-to-end scenarios against `SimAdapter`, exercising the manager
//! the way a real client population would.

use canbus_manager::{BusMode, ClientMode, Error, Frame, Manager, ManagerConfig};
use canbus_sim_driver::SimAdapter;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn manager_with(cfg: ManagerConfig) -> (Manager, Arc<SimAdapter>) {
    let adapter = Arc::new(SimAdapter::new());
    let manager = Manager::new(adapter.clone(), cfg);
    (manager, adapter)
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(20)).await;
}

#[tokio::test]
async fn single_tx_round_trip_over_loopback() {
    let (manager, _adapter) = manager_with(ManagerConfig {
        loopback: true,
        ..ManagerConfig::default()
    });

    let sender = manager.register(ClientMode::TxEnabled).unwrap();
    manager.activate(sender).await.unwrap();
    settle().await;

    assert_eq!(manager.status().bus_mode, BusMode::NoAck);

    let received = Arc::new(Mutex::new(Vec::new()));
    let received2 = received.clone();
    manager
        .set_rx_callback(
            sender,
            Some(Arc::new(move |f: &Frame| {
                received2.lock().unwrap().push(f.id);
            })),
        )
        .unwrap();

    manager
        .transmit(sender, Frame::new(0x123, vec![1, 2, 3]))
        .await
        .unwrap();

    settle().await;
    assert_eq!(*received.lock().unwrap(), vec![0x123]);
}

#[tokio::test]
async fn multiple_clients_coexist_on_one_bus() {
    let (manager, adapter) = manager_with(ManagerConfig::default());

    let rx_a = manager.register(ClientMode::RxOnly).unwrap();
    let rx_b = manager.register(ClientMode::RxOnly).unwrap();
    manager.activate(rx_a).await.unwrap();
    manager.activate(rx_b).await.unwrap();
    settle().await;

    assert_eq!(manager.status().bus_mode, BusMode::ListenOnly);

    let hits = Arc::new(AtomicUsize::new(0));
    for h in [rx_a, rx_b] {
        let hits = hits.clone();
        manager
            .set_rx_callback(h, Some(Arc::new(move |_f: &Frame| {
                hits.fetch_add(1, Ordering::SeqCst);
            })))
            .unwrap();
    }

    adapter.inject_frame(Frame::new(0x42, vec![9]));
    settle().await;

    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn set_mode_rejects_a_conflicting_demotion() {
    let (manager, _adapter) = manager_with(ManagerConfig::default());

    let a = manager.register(ClientMode::TxEnabled).unwrap();
    manager.activate(a).await.unwrap();
    let b = manager.register(ClientMode::TxEnabled).unwrap();
    manager.activate(b).await.unwrap();
    settle().await;

    assert_eq!(manager.status().bus_mode, BusMode::Normal);

    let err = manager.set_mode(b, ClientMode::RxOnly).await.unwrap_err();
    assert_eq!(err, Error::ModeConflict);
    assert_eq!(manager.status().bus_mode, BusMode::Normal);
}

#[tokio::test]
async fn callback_never_fires_after_unregister() {
    let (manager, adapter) = manager_with(ManagerConfig::default());

    let rx = manager.register(ClientMode::RxOnly).unwrap();
    manager.activate(rx).await.unwrap();
    settle().await;

    let hits = Arc::new(AtomicUsize::new(0));
    let hits2 = hits.clone();
    manager
        .set_rx_callback(rx, Some(Arc::new(move |_f: &Frame| {
            hits2.fetch_add(1, Ordering::SeqCst);
        })))
        .unwrap();

    manager.unregister(rx).await.unwrap();
    adapter.inject_frame(Frame::new(0x7, vec![]));
    settle().await;

    assert_eq!(hits.load(Ordering::SeqCst), 0);
    assert_eq!(manager.status().bus_mode, BusMode::Stopped);
}

#[tokio::test]
async fn toggling_loopback_swaps_normal_and_noack() {
    let (manager, _adapter) = manager_with(ManagerConfig::default());

    let tx = manager.register(ClientMode::TxEnabled).unwrap();
    manager.activate(tx).await.unwrap();
    settle().await;
    assert_eq!(manager.status().bus_mode, BusMode::Normal);

    manager.set_loopback(true).await.unwrap();
    settle().await;
    assert_eq!(manager.status().bus_mode, BusMode::NoAck);

    manager.set_loopback(false).await.unwrap();
    settle().await;
    assert_eq!(manager.status().bus_mode, BusMode::Normal);
}

#[tokio::test]
async fn bus_off_triggers_autonomous_recovery() {
    let (manager, adapter) = manager_with(ManagerConfig {
        bus_off_recovery_delay_ms: 200,
        ..ManagerConfig::default()
    });

    let tx = manager.register(ClientMode::TxEnabled).unwrap();
    manager.activate(tx).await.unwrap();
    settle().await;

    adapter.induce_bus_off();
    settle().await;
    assert!(manager.status().recovery_in_progress);

    assert_eq!(
        manager.transmit(tx, Frame::new(0x1, vec![])).await,
        Err(Error::BusOff)
    );

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!manager.status().recovery_in_progress);
    assert_eq!(manager.status().bus_off_count, 1);

    manager.transmit(tx, Frame::new(0x1, vec![])).await.unwrap();
}
