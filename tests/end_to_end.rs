use std::sync::{Arc, Mutex};
use std::time::Duration;

use gattlink::ble::gatt::HEART_RATE_MEASUREMENT;
use gattlink::ble::simulated::{SimBleAdapter, SimPeripheral, SimReply};
use gattlink::ble::transport::{BleAddress, NotificationEvent};
use gattlink::{BleError, ClientConfig, ConnectionState, GattClient};
use tokio::time::Instant;

fn peripheral_a() -> BleAddress {
    BleAddress::Mac([0x0F, 0x1D, 0xAA, 0x00, 0x00, 0x0A])
}

fn scripted_a() -> SimPeripheral {
    SimPeripheral::new(peripheral_a())
        .with_name("A")
        .advertising_at(vec![Duration::from_millis(200), Duration::from_millis(700)])
        .with_connect_latency(Duration::from_millis(100))
}

#[tokio::test(start_paused = true)]
async fn test_scan_connect_send_timeout() {
    let adapter = SimBleAdapter::new();
    adapter.add_peripheral(scripted_a());
    adapter.set_responder(&peripheral_a(), |data| {
        if data == b"silent" {
            None
        } else {
            Some(SimReply::after(Duration::from_millis(200), b"pong".to_vec()))
        }
    });
    let client = GattClient::start(adapter.clone(), ClientConfig::default())
        .await
        .unwrap();

    // Two advertisements, one handle
    let found = client.scan(Duration::from_secs(1)).await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].address, peripheral_a());
    assert_eq!(found[0].local_name.as_deref(), Some("A"));

    let mut states = client.watch_state(&peripheral_a());
    assert!(states.is_none());

    let started = Instant::now();
    let token = client
        .connect(&found[0], Duration::from_secs(5))
        .await
        .unwrap();
    assert!(started.elapsed() >= Duration::from_millis(100));
    assert_eq!(client.state(&peripheral_a()), ConnectionState::Ready);
    assert!(client.is_connected(&peripheral_a()));
    states = client.watch_state(&peripheral_a());
    assert_eq!(*states.unwrap().borrow(), ConnectionState::Ready);

    let started = Instant::now();
    let reply = client
        .send(&token, b"ping", Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(reply, b"pong");
    assert!(started.elapsed() >= Duration::from_millis(200));
    assert!(started.elapsed() < Duration::from_secs(1));

    let started = Instant::now();
    let result = client.send(&token, b"silent", Duration::from_secs(1)).await;
    assert_eq!(result, Err(BleError::RequestTimeout));
    assert!(started.elapsed() >= Duration::from_secs(1));

    // The connection survives a timed-out request
    assert!(client.is_connected(&peripheral_a()));
    let reply = client
        .send(&token, b"again", Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(reply, b"pong");

    client.shutdown().await.unwrap();
    assert!(!adapter.is_started());
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_during_connect_never_reaches_ready() {
    let adapter = SimBleAdapter::new();
    adapter.add_peripheral(scripted_a());
    let client = Arc::new(
        GattClient::start(adapter.clone(), ClientConfig::default())
            .await
            .unwrap(),
    );
    let found = client.scan(Duration::from_secs(1)).await.unwrap();
    let handle = found[0].clone();

    let connecting = {
        let client = Arc::clone(&client);
        tokio::spawn(async move { client.connect(&handle, Duration::from_secs(5)).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(client.state(&peripheral_a()), ConnectionState::Connecting);

    client.disconnect_peripheral(&peripheral_a()).await.unwrap();
    let result = connecting.await.unwrap();
    assert_eq!(result, Err(BleError::Canceled));

    // Let any leftover adapter work settle, then check nothing came back up
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(client.state(&peripheral_a()), ConnectionState::Disconnected);
    assert!(!adapter.is_linked(&peripheral_a()));
}

#[tokio::test(start_paused = true)]
async fn test_link_loss_resolves_every_pending_request() {
    let adapter = SimBleAdapter::new();
    adapter.add_peripheral(scripted_a());
    let config = ClientConfig {
        strict_ordering: false,
        ..ClientConfig::default()
    };
    let client = GattClient::start(adapter.clone(), config).await.unwrap();
    let found = client.scan(Duration::from_secs(1)).await.unwrap();
    let token = client
        .connect(&found[0], Duration::from_secs(5))
        .await
        .unwrap();

    let mut pending = Vec::new();
    for i in 0..5u8 {
        pending.push(
            client
                .begin_send(&token, &[i], Duration::from_secs(10))
                .await
                .unwrap(),
        );
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    adapter.drop_link(&peripheral_a());

    for request in pending {
        assert_eq!(request.outcome().await, Err(BleError::LinkLost));
    }
    assert_eq!(client.state(&peripheral_a()), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_strict_mode_rejects_overlapping_send() {
    let adapter = SimBleAdapter::new();
    adapter.add_peripheral(scripted_a());
    adapter.set_responder(&peripheral_a(), |data| {
        Some(SimReply::after(Duration::from_millis(400), data.to_vec()))
    });
    let client = GattClient::start(adapter.clone(), ClientConfig::default())
        .await
        .unwrap();
    let found = client.scan(Duration::from_secs(1)).await.unwrap();
    let token = client
        .connect(&found[0], Duration::from_secs(5))
        .await
        .unwrap();

    let first = client
        .begin_send(&token, b"first", Duration::from_secs(1))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        client.send(&token, b"second", Duration::from_secs(1)).await,
        Err(BleError::RequestInFlight)
    );
    assert_eq!(first.outcome().await.unwrap().payload, b"first");

    // The slot is free again
    let reply = client
        .send(&token, b"third", Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(reply, b"third");
}

#[tokio::test(start_paused = true)]
async fn test_unsolicited_notifications_do_not_disturb_requests() {
    let adapter = SimBleAdapter::new();
    adapter.add_peripheral(scripted_a().with_characteristics(vec![
        gattlink::ble::gatt::DEFAULT_REPLY_CHARACTERISTIC,
        HEART_RATE_MEASUREMENT,
    ]));
    adapter.set_responder(&peripheral_a(), |_| {
        Some(SimReply::after(Duration::from_millis(300), b"reply".to_vec()))
    });
    let client = GattClient::start(adapter.clone(), ClientConfig::default())
        .await
        .unwrap();
    let found = client.scan(Duration::from_secs(1)).await.unwrap();
    let token = client
        .connect(&found[0], Duration::from_secs(5))
        .await
        .unwrap();

    let beats: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&beats);
    client
        .subscribe(
            &token,
            HEART_RATE_MEASUREMENT,
            Arc::new(move |e: NotificationEvent| sink.lock().unwrap().extend(e.payload)),
        )
        .await
        .unwrap();

    let pending = client
        .begin_send(&token, b"req", Duration::from_secs(1))
        .await
        .unwrap();
    for bpm in [60u8, 61, 62] {
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(adapter.notify(&peripheral_a(), HEART_RATE_MEASUREMENT, &[bpm]));
    }

    assert_eq!(pending.outcome().await.unwrap().payload, b"reply");
    assert_eq!(*beats.lock().unwrap(), vec![60, 61, 62]);

    let stats = client.dispatch_stats(&peripheral_a()).unwrap();
    assert_eq!(stats.matched_requests, 1);
    assert_eq!(stats.handled, 3);
    assert_eq!(stats.dropped, 0);

    // Unsubscribing stops delivery at the adapter
    client
        .unsubscribe(&token, HEART_RATE_MEASUREMENT)
        .await
        .unwrap();
    assert!(!adapter.notify(&peripheral_a(), HEART_RATE_MEASUREMENT, &[63]));
    assert_eq!(*beats.lock().unwrap(), vec![60, 61, 62]);

    // A reply nobody waits for and nobody handles goes to the default logger
    assert!(adapter.notify(
        &peripheral_a(),
        gattlink::ble::gatt::DEFAULT_REPLY_CHARACTERISTIC,
        b"stray"
    ));
    tokio::time::sleep(Duration::from_millis(1)).await;
    let stats = client.dispatch_stats(&peripheral_a()).unwrap();
    assert_eq!(stats.unhandled, 1);
    assert_eq!(stats.matched_requests, 1);
}

#[tokio::test(start_paused = true)]
async fn test_connect_timeout_and_refusal() {
    let adapter = SimBleAdapter::new();
    let slow = BleAddress::Mac([0x0F, 0x1D, 0, 0, 0, 0x51]);
    let grumpy = BleAddress::Mac([0x0F, 0x1D, 0, 0, 0, 0x52]);
    adapter.add_peripheral(
        SimPeripheral::new(slow.clone()).with_connect_latency(Duration::from_secs(30)),
    );
    adapter.add_peripheral(SimPeripheral::new(grumpy.clone()).refusing_connections());
    let client = GattClient::start(adapter.clone(), ClientConfig::default())
        .await
        .unwrap();
    let found = client.scan(Duration::from_millis(500)).await.unwrap();
    assert_eq!(found.len(), 2);
    let handle_for = |addr: &BleAddress| found.iter().find(|h| &h.address == addr).unwrap().clone();

    let started = Instant::now();
    let result = client
        .connect(&handle_for(&slow), Duration::from_secs(5))
        .await;
    assert_eq!(result, Err(BleError::ConnectionTimeout));
    assert!(started.elapsed() >= Duration::from_secs(5));
    assert_eq!(client.state(&slow), ConnectionState::Failed);

    let result = client
        .connect(&handle_for(&grumpy), Duration::from_secs(5))
        .await;
    assert!(matches!(result, Err(BleError::ConnectionRefused(_))));
    assert_eq!(client.state(&grumpy), ConnectionState::Failed);
}

#[tokio::test]
async fn test_radio_unavailable() {
    let adapter = SimBleAdapter::new();
    adapter.set_radio_available(false);
    let result = GattClient::start(adapter.clone(), ClientConfig::default()).await;
    assert!(matches!(result, Err(BleError::RadioUnavailable(_))));
    assert!(!adapter.is_started());
}
