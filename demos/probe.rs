use std::sync::Arc;
use std::time::Duration;

use gattlink::ble::simulated::{SimBleAdapter, SimPeripheral, SimReply};
use gattlink::ble::transport::{BleAdapter, BleAddress, NotificationEvent};
use gattlink::{ClientConfig, GattClient};

fn simulated_adapter() -> Arc<dyn BleAdapter> {
    let adapter = SimBleAdapter::new();
    let address = BleAddress::Mac([0x0F, 0x1D, 0, 0, 0, 1]);
    adapter.add_peripheral(
        SimPeripheral::new(address.clone())
            .with_name("Ophidia")
            .advertising_at(vec![Duration::from_millis(100), Duration::from_millis(600)])
            .with_connect_latency(Duration::from_millis(150)),
    );
    adapter.set_responder(&address, |data| {
        let mut reply = data.to_vec();
        reply.reverse();
        Some(SimReply::after(Duration::from_millis(40), reply))
    });
    adapter
}

#[cfg(feature = "ble-central")]
fn host_adapter(use_hardware: bool, config: &ClientConfig) -> Arc<dyn BleAdapter> {
    if use_hardware {
        gattlink::ble::btleplug::BtleplugAdapter::with_write_timeout(config.write_timeout())
    } else {
        simulated_adapter()
    }
}

#[cfg(not(feature = "ble-central"))]
fn host_adapter(use_hardware: bool, _config: &ClientConfig) -> Arc<dyn BleAdapter> {
    if use_hardware {
        log::warn!("Built without ble-central; using the simulated adapter");
    }
    simulated_adapter()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let use_hardware = args.iter().any(|a| a == "--hardware");
    let payload = args
        .iter()
        .find(|a| !a.starts_with("--"))
        .cloned()
        .unwrap_or_else(|| "ping".to_string());

    let config = match std::env::var("GATTLINK_CONFIG") {
        Ok(path) => ClientConfig::from_json(&std::fs::read_to_string(path)?)?,
        Err(_) => ClientConfig::default(),
    };

    println!("📡 Gattlink probe");
    println!("=================");

    let client = GattClient::start(host_adapter(use_hardware, &config), config).await?;

    println!("🔍 Scanning for {:?}...", client.config().scan_timeout());
    let found = client.scan(client.config().scan_timeout()).await?;
    if found.is_empty() {
        println!("❌ No peripherals found");
        client.shutdown().await?;
        return Ok(());
    }
    for (i, p) in found.iter().enumerate() {
        println!(
            "   {}. {} {} rssi={:?}",
            i + 1,
            p.address,
            p.local_name.as_deref().unwrap_or("(unnamed)"),
            p.rssi
        );
    }

    let target = &found[0];
    println!("🔗 Connecting to {}...", target.address);
    let token = client
        .connect(target, client.config().connect_timeout())
        .await?;
    println!("✅ {:?}", client.state(&target.address));

    client
        .subscribe(
            &token,
            client.config().reply_characteristic,
            Arc::new(|event: NotificationEvent| {
                println!("   📨 unsolicited {} bytes", event.payload.len());
            }),
        )
        .await?;

    println!("📤 Sending {:?}", payload);
    match client
        .send(&token, payload.as_bytes(), client.config().request_timeout())
        .await
    {
        Ok(reply) => println!("📥 Reply: {:?}", String::from_utf8_lossy(&reply)),
        Err(e) => println!("⚠️  Request failed: {}", e),
    }

    if let Some(stats) = client.dispatch_stats(&target.address) {
        println!(
            "📊 matched={} handled={} unhandled={} dropped={}",
            stats.matched_requests, stats.handled, stats.unhandled, stats.dropped
        );
    }

    client.disconnect(&token).await?;
    client.shutdown().await?;
    println!("👋 Done");
    Ok(())
}
