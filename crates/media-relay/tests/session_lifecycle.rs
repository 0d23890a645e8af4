//! Lifecycle integration tests: reservation expiry, idle close and the
//! background reaper driven through the public API only.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::time::sleep;

use media_relay::{
    CallId, CloseReason, MediaKind, RelayConfig, SessionController, SessionEvent, SessionState,
};

fn config(start: u16, end: u16) -> RelayConfig {
    RelayConfig {
        bind_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
        port_range_start: start,
        port_range_end: end,
        reservation_timeout: Duration::from_secs(60),
        reaper_interval: Duration::from_secs(3600),
        idle_timeout: None,
        max_packet_size: 1500,
    }
}

fn relay_addr(port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
}

/// Poll until the session disappears from the table (closed by a background
/// task) or the budget runs out.
async fn wait_for_close(controller: &SessionController, call_id: &CallId) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while controller.lookup(call_id).await.is_some() {
        assert!(Instant::now() < deadline, "session was never closed");
        sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_full_lifecycle_with_port_reuse() {
    let controller = SessionController::new(config(41000, 41009)).unwrap();
    let call_id = CallId::from("life-1");

    let session = controller
        .allocate_session(call_id.clone(), MediaKind::Audio)
        .await
        .unwrap();
    assert_eq!(session.state, SessionState::Reserved);

    controller.start_session(&call_id).await.unwrap();
    let active = controller.lookup(&call_id).await.unwrap();
    assert_eq!(active.state, SessionState::Active);
    assert_eq!(active.port_a, session.port_a);

    controller.stop_session(&call_id).await.unwrap();
    assert!(controller.lookup(&call_id).await.is_none());
    assert_eq!(controller.pool_usage().free, 10);

    // The same call id is usable again and receives the freed ports
    let replay = controller
        .allocate_session(call_id.clone(), MediaKind::Audio)
        .await
        .unwrap();
    assert_eq!(replay.port_a, session.port_a);
    assert_eq!(replay.port_b, session.port_b);

    controller.stop_session(&call_id).await.unwrap();
    controller.shutdown().await;
}

#[tokio::test]
async fn test_background_reaper_expires_unstarted_reservation() {
    let mut cfg = config(41010, 41019);
    cfg.reservation_timeout = Duration::from_millis(200);
    cfg.reaper_interval = Duration::from_millis(50);
    let controller = SessionController::new(cfg).unwrap();
    let mut events = controller.take_event_receiver().await.unwrap();

    let call_id = CallId::from("life-2");
    let session = controller
        .allocate_session(call_id.clone(), MediaKind::Audio)
        .await
        .unwrap();

    // Never started: the reaper must expire it on its own
    wait_for_close(&controller, &call_id).await;
    assert_eq!(controller.pool_usage().free, 10);

    // Re-allocating proves the ports actually went back to the pool
    let second = controller
        .allocate_session(CallId::from("life-2b"), MediaKind::Audio)
        .await
        .unwrap();
    assert_eq!(second.port_a, session.port_a);
    assert_eq!(second.port_b, session.port_b);

    // Reserved for the expired call, then the expiry itself
    assert!(matches!(
        events.recv().await.unwrap(),
        SessionEvent::SessionReserved { .. }
    ));
    match events.recv().await.unwrap() {
        SessionEvent::SessionClosed {
            call_id: id,
            reason,
        } => {
            assert_eq!(id, call_id);
            assert_eq!(reason, CloseReason::Expired);
        }
        other => panic!("unexpected event: {other:?}"),
    }

    controller.shutdown().await;
}

#[tokio::test]
async fn test_started_session_outlives_reservation_window() {
    let mut cfg = config(41020, 41029);
    cfg.reservation_timeout = Duration::from_millis(100);
    cfg.reaper_interval = Duration::from_millis(50);
    let controller = SessionController::new(cfg).unwrap();

    let call_id = CallId::from("life-3");
    controller
        .allocate_session(call_id.clone(), MediaKind::Audio)
        .await
        .unwrap();
    controller.start_session(&call_id).await.unwrap();

    // Well past the reservation window plus several reaper passes
    sleep(Duration::from_millis(300)).await;

    let session = controller.lookup(&call_id).await.unwrap();
    assert_eq!(session.state, SessionState::Active);

    controller.stop_session(&call_id).await.unwrap();
    controller.shutdown().await;
}

#[tokio::test]
async fn test_idle_timeout_closes_silent_active_session() {
    let mut cfg = config(41030, 41039);
    cfg.idle_timeout = Some(Duration::from_millis(200));
    cfg.reaper_interval = Duration::from_millis(50);
    let controller = SessionController::new(cfg).unwrap();
    let mut events = controller.take_event_receiver().await.unwrap();

    let call_id = CallId::from("life-4");
    controller
        .allocate_session(call_id.clone(), MediaKind::Video)
        .await
        .unwrap();
    controller.start_session(&call_id).await.unwrap();

    // No traffic ever flows; the idle sweep must reclaim the session
    wait_for_close(&controller, &call_id).await;
    assert_eq!(controller.pool_usage().free, 10);

    assert!(matches!(
        events.recv().await.unwrap(),
        SessionEvent::SessionReserved { .. }
    ));
    assert!(matches!(
        events.recv().await.unwrap(),
        SessionEvent::SessionStarted { .. }
    ));
    assert!(matches!(
        events.recv().await.unwrap(),
        SessionEvent::SessionClosed {
            reason: CloseReason::Idle,
            ..
        }
    ));

    controller.shutdown().await;
}

#[tokio::test]
async fn test_active_session_with_traffic_is_not_idle_closed() {
    let mut cfg = config(41040, 41049);
    cfg.idle_timeout = Some(Duration::from_millis(300));
    cfg.reaper_interval = Duration::from_millis(50);
    let controller = SessionController::new(cfg).unwrap();

    let call_id = CallId::from("life-5");
    let session = controller
        .allocate_session(call_id.clone(), MediaKind::Audio)
        .await
        .unwrap();
    controller.start_session(&call_id).await.unwrap();

    let participant_a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let participant_b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    participant_b
        .send_to(b"latch-b", relay_addr(session.port_b))
        .await
        .unwrap();

    // Keep datagrams flowing for well over the idle window
    for _ in 0..8 {
        participant_a
            .send_to(b"keepalive", relay_addr(session.port_a))
            .await
            .unwrap();
        sleep(Duration::from_millis(100)).await;
    }

    let session = controller.lookup(&call_id).await.unwrap();
    assert_eq!(session.state, SessionState::Active);
    assert!(session.stats.unwrap().packets_relayed >= 1);

    controller.stop_session(&call_id).await.unwrap();
    controller.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_closes_remaining_sessions() {
    let controller = SessionController::new(config(41050, 41059)).unwrap();

    controller
        .allocate_session(CallId::from("life-6a"), MediaKind::Audio)
        .await
        .unwrap();
    controller
        .allocate_session(CallId::from("life-6b"), MediaKind::Video)
        .await
        .unwrap();
    controller
        .start_session(&CallId::from("life-6b"))
        .await
        .unwrap();

    controller.shutdown().await;

    assert_eq!(controller.session_count().await, 0);
    assert_eq!(controller.pool_usage().free, 10);
}
