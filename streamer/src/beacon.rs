use camlink_common::config::BeaconConfig;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Payload announcing the stream host, e.g. `ESP32CAM:192.168.1.20`.
pub fn beacon_message(prefix: &str, ip: Ipv4Addr) -> String {
    format!("{prefix}:{ip}")
}

/// Address of the interface holding the default route.
///
/// Connecting a UDP socket sends nothing; it only makes the kernel pick the
/// outbound interface.
pub async fn local_ipv4() -> Option<Ipv4Addr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await.ok()?;
    socket.connect((Ipv4Addr::new(8, 8, 8, 8), 80)).await.ok()?;
    match socket.local_addr().ok()? {
        SocketAddr::V4(addr) if !addr.ip().is_unspecified() => Some(*addr.ip()),
        _ => None,
    }
}

/// Broadcast the host address until cancelled.
pub async fn run_beacon(config: BeaconConfig, cancel: CancellationToken) {
    let socket = match UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await {
        Ok(socket) => socket,
        Err(e) => {
            warn!(error = %e, "failed to bind beacon socket, discovery disabled");
            return;
        }
    };
    if let Err(e) = socket.set_broadcast(true) {
        warn!(error = %e, "failed to enable broadcast, discovery disabled");
        return;
    }
    let target = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::BROADCAST, config.port));
    info!(%target, interval_ms = config.interval_ms, "beacon started");
    broadcast_loop(&socket, target, &config, &cancel).await;
    info!("beacon stopped");
}

async fn broadcast_loop(
    socket: &UdpSocket,
    target: SocketAddr,
    config: &BeaconConfig,
    cancel: &CancellationToken,
) {
    let mut ticker = tokio::time::interval(Duration::from_millis(config.interval_ms.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        // Re-resolved every tick so a DHCP change is picked up
        let ip = match config.advertise_ip {
            Some(ip) => Some(ip),
            None => local_ipv4().await,
        };
        let Some(ip) = ip else {
            debug!("no local address yet, skipping beacon");
            continue;
        };

        let message = beacon_message(&config.prefix, ip);
        match socket.send_to(message.as_bytes(), target).await {
            Ok(_) => debug!(%message, "beacon sent"),
            Err(e) => warn!(error = %e, "failed to send beacon"),
        }
    }
}
