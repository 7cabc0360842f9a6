use std::sync::Arc;
use std::time::Duration;

use chorus_client_core::av_sync::PlaybackClocks;
use chorus_client_core::health::ChannelStatus;
use chorus_client_core::media::devices::{CaptureError, DeviceKind, MemoryPreferences, SyntheticDevices};
use chorus_client_core::media::loopback::LoopbackNetwork;
use chorus_client_core::media::{
    ConnectionState, IceServer, MediaKind, PeerConnection, PeerConnectionFactory, PeerEvent,
    PeerEventSink, TrackRole,
};
use chorus_client_core::session::{
    ChannelHandle, ChannelSnapshot, MeshClient, SessionDeps, SessionError, SessionEvent,
    SessionTiming, join_channel,
};
use chorus_client_core::signaling::local::LocalRelay;
use chorus_client_core::signaling::{ReconnectTarget, SignalMessage};
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const CHANNEL: &str = "lounge";

struct Mesh {
    relay: Arc<LocalRelay>,
    network: LoopbackNetwork,
    timing: SessionTiming,
}

struct Member {
    handle: ChannelHandle,
    devices: Arc<SyntheticDevices>,
}

impl Mesh {
    fn new() -> Self {
        Self::with_relay(LocalRelay::default())
    }

    fn with_relay(relay: LocalRelay) -> Self {
        Self {
            relay: Arc::new(relay),
            network: LoopbackNetwork::new(),
            timing: SessionTiming::default(),
        }
    }

    fn deps(&self, peer: &str, devices: Arc<SyntheticDevices>) -> SessionDeps {
        SessionDeps {
            signaling: self.relay.clone(),
            factory: Arc::new(self.network.factory(peer)),
            devices,
            preferences: Arc::new(MemoryPreferences::new()),
            fallback_ice_servers: vec![IceServer::stun("stun:fallback")],
            timing: self.timing.clone(),
        }
    }

    async fn join(&self, peer: &str) -> Member {
        let devices = Arc::new(SyntheticDevices::new());
        let deps = self.deps(peer, Arc::clone(&devices));
        let handle = join_channel(&deps, CHANNEL, peer, None, CancellationToken::new())
            .await
            .expect("join channel");
        Member { handle, devices }
    }

    async fn connected_pair(&self) -> (Member, Member) {
        let a = self.join("a1").await;
        let b = self.join("b2").await;
        until(&a.handle, "a1 connected to b2", |s| connected(s, "b2")).await;
        until(&b.handle, "b2 connected to a1", |s| connected(s, "a1")).await;
        (a, b)
    }
}

fn connected(snapshot: &ChannelSnapshot, peer: &str) -> bool {
    snapshot
        .peer(peer)
        .is_some_and(|p| p.connection == ConnectionState::Connected)
}

async fn until<F>(handle: &ChannelHandle, what: &str, mut check: F) -> ChannelSnapshot
where
    F: FnMut(&ChannelSnapshot) -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(60);
    loop {
        let snapshot = handle.snapshot().await.expect("session alive");
        if check(&snapshot) {
            return snapshot;
        }
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

async fn expect_event<F>(
    events: &mut broadcast::Receiver<SessionEvent>,
    what: &str,
    mut check: F,
) -> SessionEvent
where
    F: FnMut(&SessionEvent) -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(60);
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match tokio::time::timeout(remaining, events.recv()).await {
            Ok(Ok(event)) if check(&event) => return event,
            Ok(Ok(_)) | Ok(Err(broadcast::error::RecvError::Lagged(_))) => {}
            Ok(Err(broadcast::error::RecvError::Closed)) => panic!("session closed waiting for {what}"),
            Err(_) => panic!("timed out waiting for {what}"),
        }
    }
}

#[test_timeout::tokio_timeout_test(30, paused)]
async fn existing_member_initiates_and_newcomer_only_answers() {
    let mesh = Mesh::new();
    let a = mesh.join("a1").await;
    until(&a.handle, "a1 joined", |s| s.status == ChannelStatus::Connected).await;
    tokio::time::sleep(Duration::from_secs(1)).await;
    let b = mesh.join("b2").await;

    until(&a.handle, "a1 connected to b2", |s| connected(s, "b2")).await;
    until(&b.handle, "b2 connected to a1", |s| connected(s, "a1")).await;
    // Run well past the newcomer's own initiation delay.
    tokio::time::sleep(mesh.timing.join_initiate_delay * 5).await;

    let a_pc = mesh.network.peer("a1", "b2").expect("a1 connection");
    let b_pc = mesh.network.peer("b2", "a1").expect("b2 connection");
    assert_eq!(a_pc.offers_created(), 1);
    assert_eq!(b_pc.offers_created(), 0);

    let snapshot = a.handle.snapshot().await.unwrap();
    assert_eq!(snapshot.status, ChannelStatus::Connected);
    assert_eq!(snapshot.queued, 0);
    assert!(connected(&snapshot, "b2"));
    let snapshot = b.handle.snapshot().await.unwrap();
    assert_eq!(snapshot.queued, 0);
    assert!(connected(&snapshot, "a1"));
}

#[test_timeout::tokio_timeout_test(30, paused)]
async fn explicit_requests_from_both_sides_converge() {
    let mut mesh = Mesh::new();
    mesh.timing.join_initiate_delay = Duration::from_secs(120);
    mesh.timing.user_joined_delay = Duration::from_secs(120);
    let a = mesh.join("a1").await;
    let b = mesh.join("b2").await;
    until(&a.handle, "a1 sees b2", |s| {
        s.participants.iter().any(|p| p.peer_id == "b2")
    })
    .await;

    let started = Instant::now();
    a.handle.request_connection("b2").unwrap();
    b.handle.request_connection("a1").unwrap();

    until(&a.handle, "a1 connected", |s| connected(s, "b2")).await;
    until(&b.handle, "b2 connected", |s| connected(s, "a1")).await;
    assert!(started.elapsed() < Duration::from_secs(5));

    let (a_local, a_remote) = mesh.network.peer("a1", "b2").unwrap().committed_descriptions();
    let (b_local, b_remote) = mesh.network.peer("b2", "a1").unwrap().committed_descriptions();
    assert_eq!(a_local, b_remote);
    assert_eq!(a_remote, b_local);
}

#[test_timeout::tokio_timeout_test(30, paused)]
async fn simultaneous_track_changes_settle_on_both_sides() {
    let mesh = Mesh::new();
    let (a, b) = mesh.connected_pair().await;
    let mut a_events = a.handle.subscribe();
    let mut b_events = b.handle.subscribe();

    let (a_cam, b_cam) = tokio::join!(a.handle.set_camera(true), b.handle.set_camera(true));
    a_cam.unwrap();
    b_cam.unwrap();

    expect_event(&mut a_events, "b2 camera at a1", |event| {
        matches!(event, SessionEvent::RemoteTrackAdded { peer_id, role: Some(TrackRole::Camera), .. } if peer_id == "b2")
    })
    .await;
    expect_event(&mut b_events, "a1 camera at b2", |event| {
        matches!(event, SessionEvent::RemoteTrackAdded { peer_id, role: Some(TrackRole::Camera), .. } if peer_id == "a1")
    })
    .await;

    let snapshot = until(&a.handle, "a1 settled", |s| {
        connected(s, "b2")
            && s.peer("b2")
                .is_some_and(|p| p.remote_tracks == 2 && p.syncing)
    })
    .await;
    assert_eq!(
        snapshot.peer("b2").unwrap().senders,
        vec![TrackRole::Microphone, TrackRole::Camera]
    );
}

#[test_timeout::tokio_timeout_test(30, paused)]
async fn camera_toggle_adds_then_removes_one_remote_track() {
    let mesh = Mesh::new();
    let (a, b) = mesh.connected_pair().await;
    let mut b_events = b.handle.subscribe();

    a.handle.set_camera(true).await.unwrap();
    let added = expect_event(&mut b_events, "camera added", |event| {
        matches!(event, SessionEvent::RemoteTrackAdded { role: Some(TrackRole::Camera), .. })
    })
    .await;
    let SessionEvent::RemoteTrackAdded { track_id, .. } = added else {
        unreachable!();
    };

    // Enabling twice is a no-op.
    a.handle.set_camera(true).await.unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;

    a.handle.set_camera(false).await.unwrap();
    expect_event(&mut b_events, "camera removed", |event| {
        matches!(event, SessionEvent::RemoteTrackRemoved { track_id: removed, .. } if *removed == track_id)
    })
    .await;

    tokio::time::sleep(Duration::from_secs(2)).await;
    let mut camera_adds = 0;
    while let Ok(event) = b_events.try_recv() {
        if matches!(event, SessionEvent::RemoteTrackAdded { role: Some(TrackRole::Camera), .. }) {
            camera_adds += 1;
        }
    }
    assert_eq!(camera_adds, 0);

    let a_pc = mesh.network.peer("a1", "b2").unwrap();
    assert_eq!(a_pc.sender_roles(), vec![TrackRole::Microphone]);
    let snapshot = a.handle.snapshot().await.unwrap();
    assert_eq!(snapshot.local_tracks, vec![TrackRole::Microphone]);
    assert_eq!(snapshot.peer("b2").unwrap().senders, vec![TrackRole::Microphone]);
}

#[test_timeout::tokio_timeout_test(30, paused)]
async fn sync_state_is_dropped_when_remote_audio_ends() {
    let mesh = Mesh::new();
    let (a, b) = mesh.connected_pair().await;

    a.handle.set_camera(true).await.unwrap();
    until(&b.handle, "a1 audio and video at b2", |s| {
        s.peer("a1").is_some_and(|p| p.remote_tracks == 2 && p.syncing)
    })
    .await;

    mesh.network.end_remote_tracks("b2", "a1", MediaKind::Audio);
    let snapshot = until(&b.handle, "sync dropped", |s| {
        s.peer("a1").is_some_and(|p| p.remote_tracks == 1)
    })
    .await;
    assert!(!snapshot.peer("a1").unwrap().syncing);
}

#[test_timeout::tokio_timeout_test(30, paused)]
async fn screen_share_with_audio_publishes_two_tracks() {
    let mesh = Mesh::new();
    let (a, b) = mesh.connected_pair().await;

    a.handle.set_screen_share(true, true).await.unwrap();
    until(&b.handle, "screen tracks at b2", |s| {
        s.peer("a1").is_some_and(|p| p.remote_tracks == 3)
    })
    .await;
    let a_pc = mesh.network.peer("a1", "b2").unwrap();
    assert_eq!(a_pc.sender_count(), 3);

    a.handle.set_screen_share(false, false).await.unwrap();
    until(&b.handle, "screen tracks gone", |s| {
        s.peer("a1").is_some_and(|p| p.remote_tracks == 1)
    })
    .await;
    assert_eq!(a_pc.sender_roles(), vec![TrackRole::Microphone]);
}

#[test_timeout::tokio_timeout_test(30, paused)]
async fn camera_permission_denied_is_reported() {
    let mesh = Mesh::new();
    let (a, _b) = mesh.connected_pair().await;
    let mut events = a.handle.subscribe();
    a.devices
        .fail(DeviceKind::Camera, CaptureError::PermissionDenied(DeviceKind::Camera));

    let err = a.handle.set_camera(true).await.unwrap_err();
    assert!(matches!(
        err,
        SessionError::Capture(CaptureError::PermissionDenied(DeviceKind::Camera))
    ));
    expect_event(&mut events, "error event", |event| matches!(event, SessionEvent::Error { .. })).await;
    let snapshot = a.handle.snapshot().await.unwrap();
    assert_eq!(snapshot.local_tracks, vec![TrackRole::Microphone]);
}

#[test_timeout::tokio_timeout_test(30, paused)]
async fn microphone_switch_replaces_the_sender_in_place() {
    let mesh = Mesh::new();
    let (a, _b) = mesh.connected_pair().await;
    a.devices
        .add_device(DeviceKind::Microphone, "mic-usb", "USB Microphone");
    let a_pc = mesh.network.peer("a1", "b2").unwrap();
    let offers = a_pc.offers_created();

    a.handle
        .switch_microphone(Some("mic-usb".to_string()))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(a_pc.sender_roles(), vec![TrackRole::Microphone]);
    assert_eq!(a_pc.offers_created(), offers);

    // An unknown device falls back to the default one.
    a.handle
        .switch_microphone(Some("mic-gone".to_string()))
        .await
        .unwrap();

    a.devices
        .fail(DeviceKind::Microphone, CaptureError::Busy(DeviceKind::Microphone));
    assert!(a.handle.switch_microphone(None).await.is_err());
    let snapshot = a.handle.snapshot().await.unwrap();
    assert_eq!(snapshot.local_tracks, vec![TrackRole::Microphone]);
}

#[test_timeout::tokio_timeout_test(30, paused)]
async fn candidates_before_the_offer_are_applied_after_it() {
    let mesh = Mesh::new();
    let a = mesh.join("a1").await;
    until(&a.handle, "a1 joined", |s| s.status == ChannelStatus::Connected).await;

    // A remote participant driven by hand.
    let (tx, mut rx) = mpsc::unbounded_channel();
    let z = mesh
        .network
        .factory("z9")
        .create("a1", &[], PeerEventSink::new("a1", 1, tx))
        .await
        .unwrap();
    let offer = z.create_offer(false).await.unwrap();
    z.set_local_description(offer.clone()).await.unwrap();
    let mut candidate = None;
    while let Ok(envelope) = rx.try_recv() {
        if let PeerEvent::IceCandidate(c) = envelope.event {
            candidate = Some(c);
        }
    }
    let candidate = candidate.expect("z9 gathered a candidate");

    mesh.relay.deliver(
        CHANNEL,
        "a1",
        &SignalMessage::IceCandidate {
            channel_id: CHANNEL.into(),
            from: "z9".into(),
            to: "a1".into(),
            candidate: candidate.clone(),
        },
    );
    tokio::time::sleep(Duration::from_millis(200)).await;
    mesh.relay.deliver(
        CHANNEL,
        "a1",
        &SignalMessage::Offer {
            channel_id: CHANNEL.into(),
            from: "z9".into(),
            to: "a1".into(),
            description: offer,
        },
    );

    let snapshot = until(&a.handle, "a1 answered z9", |s| s.peer("z9").is_some()).await;
    assert!(snapshot.participants.iter().any(|p| p.peer_id == "z9"));
    let a_pc = mesh.network.peer("a1", "z9").expect("a1 connection to z9");
    assert_eq!(a_pc.applied_candidates(), vec![candidate.candidate]);
    assert!(a_pc.committed_descriptions().0.is_some());
}

#[test_timeout::tokio_timeout_test(30, paused)]
async fn failed_connection_is_torn_down_and_not_retried() {
    let mesh = Mesh::new();
    let (a, _b) = mesh.connected_pair().await;
    let mut events = a.handle.subscribe();

    mesh.network.fail("a1", "b2");
    expect_event(&mut events, "error status", |event| {
        matches!(event, SessionEvent::Status { status: ChannelStatus::Error })
    })
    .await;
    expect_event(&mut events, "b2 closed", |event| {
        matches!(event, SessionEvent::PeerState { peer_id, state: ConnectionState::Closed } if peer_id == "b2")
    })
    .await;

    tokio::time::sleep(Duration::from_secs(30)).await;
    let snapshot = a.handle.snapshot().await.unwrap();
    assert!(snapshot.peer("b2").is_none());
    assert!(snapshot.participants.iter().any(|p| p.peer_id == "b2"));
    assert!(mesh.network.peer("a1", "b2").is_none());

    let reports = mesh.relay.reports(CHANNEL);
    assert!(reports.iter().any(|report| matches!(
        report,
        SignalMessage::ConnectionReport { peer_id, state: ConnectionState::Failed, .. } if peer_id == "a1"
    )));
}

#[test_timeout::tokio_timeout_test(30, paused)]
async fn ice_disruption_recovers_through_restart() {
    let mesh = Mesh::new();
    let (a, b) = mesh.connected_pair().await;
    let a_pc = mesh.network.peer("a1", "b2").unwrap();
    let b_pc = mesh.network.peer("b2", "a1").unwrap();
    let offers_before = a_pc.offers_created() + b_pc.offers_created();

    mesh.network.disrupt("a1", "b2");
    until(&a.handle, "a1 degraded", |s| s.status == ChannelStatus::Degraded).await;

    until(&a.handle, "a1 recovered", |s| connected(s, "b2")).await;
    until(&b.handle, "b2 recovered", |s| connected(s, "a1")).await;
    assert!(a_pc.offers_created() + b_pc.offers_created() > offers_before);
    // Same connections, restarted in place.
    assert!(Arc::ptr_eq(&a_pc, &mesh.network.peer("a1", "b2").unwrap()));
}

#[test_timeout::tokio_timeout_test(30, paused)]
async fn remote_speaking_edges_follow_the_audio_level() {
    let mesh = Mesh::new();
    let (a, _b) = mesh.connected_pair().await;
    let mut events = a.handle.subscribe();

    mesh.network.set_audio_level("a1", "b2", Some(0.5));
    expect_event(&mut events, "b2 speaking", |event| {
        matches!(event, SessionEvent::Speaking { peer_id, speaking: true } if peer_id == "b2")
    })
    .await;

    // A short dip does not end the utterance.
    mesh.network.set_audio_level("a1", "b2", Some(0.0));
    tokio::time::sleep(Duration::from_millis(130)).await;
    mesh.network.set_audio_level("a1", "b2", Some(0.5));
    tokio::time::sleep(Duration::from_secs(1)).await;
    while let Ok(event) = events.try_recv() {
        assert!(!matches!(event, SessionEvent::Speaking { speaking: false, .. }));
    }

    mesh.network.set_audio_level("a1", "b2", Some(0.0));
    expect_event(&mut events, "b2 quiet", |event| {
        matches!(event, SessionEvent::Speaking { peer_id, speaking: false } if peer_id == "b2")
    })
    .await;
}

#[test_timeout::tokio_timeout_test(30, paused)]
async fn local_speaking_stops_when_muted() {
    let mesh = Mesh::new();
    let a = mesh.join("a1").await;
    let mut events = a.handle.subscribe();

    a.devices.set_input_level(0.8);
    expect_event(&mut events, "local speaking", |event| {
        matches!(event, SessionEvent::Speaking { peer_id, speaking: true } if peer_id == "a1")
    })
    .await;

    a.handle.set_muted(true).unwrap();
    expect_event(&mut events, "local quiet", |event| {
        matches!(event, SessionEvent::Speaking { peer_id, speaking: false } if peer_id == "a1")
    })
    .await;
    tokio::time::sleep(Duration::from_secs(1)).await;
    while let Ok(event) = events.try_recv() {
        assert!(!matches!(event, SessionEvent::Speaking { speaking: true, .. }));
    }
    assert!(a.handle.snapshot().await.unwrap().muted);
}

#[test_timeout::tokio_timeout_test(30, paused)]
async fn force_reconnect_rebuilds_every_connection() {
    let mesh = Mesh::new();
    let (a, b) = mesh.connected_pair().await;
    let old = mesh.network.peer("a1", "b2").unwrap();

    mesh.relay.force_reconnect(CHANNEL, ReconnectTarget::All);
    until(&a.handle, "a1 rebuilt", |s| connected(s, "b2")
        && mesh
            .network
            .peer("a1", "b2")
            .is_some_and(|pc| !Arc::ptr_eq(&pc, &old)))
    .await;
    until(&b.handle, "b2 rebuilt", |s| connected(s, "a1")).await;

    // A repeat within the dedupe window is ignored.
    let current = mesh.network.peer("a1", "b2").unwrap();
    mesh.relay.force_reconnect(CHANNEL, ReconnectTarget::All);
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(Arc::ptr_eq(&current, &mesh.network.peer("a1", "b2").unwrap()));
}

#[test_timeout::tokio_timeout_test(30, paused)]
async fn departed_participant_is_cleaned_up() {
    let mesh = Mesh::new();
    let (a, b) = mesh.connected_pair().await;
    let mut events = a.handle.subscribe();

    b.handle.leave().await;
    assert!(b.handle.is_closed());
    expect_event(&mut events, "b2 left", |event| {
        matches!(event, SessionEvent::ParticipantLeft { peer_id } if peer_id == "b2")
    })
    .await;
    let snapshot = a.handle.snapshot().await.unwrap();
    assert!(snapshot.peers.is_empty());
    assert!(snapshot.participants.is_empty());
    assert_eq!(snapshot.status, ChannelStatus::Connected);
    assert_eq!(mesh.relay.members(CHANNEL), vec!["a1".to_string()]);
}

#[test_timeout::tokio_timeout_test(30, paused)]
async fn microphone_failure_aborts_the_join() {
    let mesh = Mesh::new();
    let devices = Arc::new(SyntheticDevices::new());
    devices.fail(
        DeviceKind::Microphone,
        CaptureError::PermissionDenied(DeviceKind::Microphone),
    );
    let deps = mesh.deps("a1", devices);
    let err = join_channel(&deps, CHANNEL, "a1", None, CancellationToken::new())
        .await
        .err()
        .expect("join must fail");
    assert!(matches!(
        err,
        SessionError::Capture(CaptureError::PermissionDenied(DeviceKind::Microphone))
    ));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(mesh.relay.members(CHANNEL).is_empty());
}

#[test_timeout::tokio_timeout_test(30, paused)]
async fn gateway_sees_heartbeats_and_connection_reports() {
    let mesh = Mesh::with_relay(
        LocalRelay::default().with_ice_servers(vec![IceServer::stun("stun:relay.example")]),
    );
    let (a, _b) = mesh.connected_pair().await;
    tokio::time::sleep(Duration::from_secs(45)).await;

    assert!(mesh.relay.heartbeats(CHANNEL, "a1") >= 2);
    assert!(mesh.relay.heartbeats(CHANNEL, "b2") >= 2);
    let reports = mesh.relay.reports(CHANNEL);
    assert!(reports.iter().any(|report| matches!(
        report,
        SignalMessage::ConnectionReport { peer_id, remote_peer, state: ConnectionState::Connected, .. }
            if peer_id == "a1" && remote_peer == "b2"
    )));

    let pc = mesh.network.peer("b2", "a1").unwrap();
    assert_eq!(pc.ice_servers()[0].urls, vec!["stun:relay.example".to_string()]);
    let snapshot = a.handle.snapshot().await.unwrap();
    assert_eq!(snapshot.ice_servers[0].urls, vec!["stun:relay.example".to_string()]);
}

struct DriftingClocks {
    started: Instant,
    video_offset: Mutex<f64>,
    rate: Mutex<f64>,
}

impl DriftingClocks {
    fn new(video_offset: f64) -> Self {
        Self {
            started: Instant::now(),
            video_offset: Mutex::new(video_offset),
            rate: Mutex::new(1.0),
        }
    }
}

impl PlaybackClocks for DriftingClocks {
    fn audio_time(&self) -> Option<f64> {
        Some(self.started.elapsed().as_secs_f64())
    }

    fn video_time(&self) -> Option<f64> {
        Some(self.started.elapsed().as_secs_f64() + *self.video_offset.lock())
    }

    fn set_video_rate(&self, rate: f64) {
        *self.rate.lock() = rate;
    }
}

#[test_timeout::tokio_timeout_test(30, paused)]
async fn drifting_video_is_slowed_then_resync_is_requested() {
    let mesh = Mesh::new();
    let (a, b) = mesh.connected_pair().await;
    a.handle.set_camera(true).await.unwrap();
    until(&b.handle, "b2 syncing a1", |s| s.peer("a1").is_some_and(|p| p.syncing)).await;

    let clocks = Arc::new(DriftingClocks::new(0.4));
    b.handle.attach_playback("a1", clocks.clone()).unwrap();
    tokio::time::sleep(Duration::from_secs(12)).await;
    assert!(*clocks.rate.lock() < 1.0);

    let mut a_events = a.handle.subscribe();
    *clocks.video_offset.lock() = 3.0;
    expect_event(&mut a_events, "resync request", |event| {
        matches!(event, SessionEvent::Resync { peer_id } if peer_id == "b2")
    })
    .await;
}

#[test_timeout::tokio_timeout_test(30, paused)]
async fn switching_channels_leaves_the_previous_one() {
    let mesh = Mesh::new();
    let devices = Arc::new(SyntheticDevices::new());
    let client = MeshClient::new(mesh.deps("a1", devices), "a1", Some("Ada".to_string()));

    let first = client.join(CHANNEL).await.unwrap();
    until(&first, "joined lounge", |s| s.status == ChannelStatus::Connected).await;
    let second = client.join("den").await.unwrap();

    assert!(first.is_closed());
    assert!(first.snapshot().await.is_err());
    assert_eq!(client.current().await.unwrap().channel_id(), "den");
    until(&second, "joined den", |s| s.status == ChannelStatus::Connected).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(mesh.relay.members(CHANNEL).is_empty());
    assert_eq!(mesh.relay.members("den"), vec!["a1".to_string()]);

    client.leave().await;
    assert!(client.current().await.is_none());
}
