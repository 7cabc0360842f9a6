//! In-process signaling relay.
//!
//! [`LocalRelay`] plays the gateway's part of the channel contract on top of a
//! [`signal_bus::LocalBus`]: clients publish to `<channel>/server`, the relay
//! keeps the roster and delivers to `<channel>/<peer>` inboxes.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use signal_bus::{Bus, LocalBus, Topic, recv_next};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::{
    Participant, ReconnectTarget, SignalMessage, SignalSink, SignalingConnection, SignalingError,
    SignalingTransport,
};
use crate::PeerId;
use crate::media::IceServer;

#[derive(Debug, Default)]
struct ChannelRoster {
    members: BTreeMap<PeerId, Participant>,
    reports: Vec<SignalMessage>,
    heartbeats: HashMap<PeerId, usize>,
}

#[derive(Default)]
struct RelayState {
    channels: HashMap<String, ChannelRoster>,
    tasks: HashMap<String, JoinHandle<()>>,
}

pub struct LocalRelay {
    bus: Arc<LocalBus>,
    ice_servers: Option<Vec<IceServer>>,
    state: Arc<Mutex<RelayState>>,
}

impl Default for LocalRelay {
    fn default() -> Self {
        Self::new(Arc::new(LocalBus::new()))
    }
}

impl LocalRelay {
    pub fn new(bus: Arc<LocalBus>) -> Self {
        Self {
            bus,
            ice_servers: None,
            state: Arc::new(Mutex::new(RelayState::default())),
        }
    }

    /// ICE servers handed to every joiner in its participants reply.
    pub fn with_ice_servers(mut self, servers: Vec<IceServer>) -> Self {
        self.ice_servers = Some(servers);
        self
    }

    pub fn bus(&self) -> Arc<LocalBus> {
        Arc::clone(&self.bus)
    }

    pub fn members(&self, channel_id: &str) -> Vec<PeerId> {
        self.state
            .lock()
            .channels
            .get(channel_id)
            .map(|roster| roster.members.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// `connection-report` messages received for `channel_id`, oldest first.
    pub fn reports(&self, channel_id: &str) -> Vec<SignalMessage> {
        self.state
            .lock()
            .channels
            .get(channel_id)
            .map(|roster| roster.reports.clone())
            .unwrap_or_default()
    }

    pub fn heartbeats(&self, channel_id: &str, peer_id: &str) -> usize {
        self.state
            .lock()
            .channels
            .get(channel_id)
            .and_then(|roster| roster.heartbeats.get(peer_id).copied())
            .unwrap_or(0)
    }

    /// Delivers `message` straight into one participant's inbox.
    pub fn deliver(&self, channel_id: &str, peer_id: &str, message: &SignalMessage) {
        deliver(&self.bus, &Topic::new(channel_id, peer_id), message);
    }

    /// Sends a server-originated `force-reconnect` to every member.
    pub fn force_reconnect(&self, channel_id: &str, target: ReconnectTarget) {
        let message = SignalMessage::ForceReconnect {
            channel_id: channel_id.to_string(),
            target,
            reason: Some("server request".to_string()),
        };
        for peer in self.members(channel_id) {
            self.deliver(channel_id, &peer, &message);
        }
    }

    fn ensure_channel(&self, channel_id: &str) {
        let mut state = self.state.lock();
        if state
            .tasks
            .get(channel_id)
            .is_some_and(|task| !task.is_finished())
        {
            return;
        }
        state.channels.entry(channel_id.to_string()).or_default();
        let mut inbox = self.bus.subscribe(&Topic::server(channel_id));
        let bus = Arc::clone(&self.bus);
        let shared = Arc::clone(&self.state);
        let ice_servers = self.ice_servers.clone();
        let channel = channel_id.to_string();
        let task = tokio::spawn(async move {
            while let Some(frame) = recv_next(&mut inbox).await {
                match serde_json::from_slice::<SignalMessage>(&frame.payload) {
                    Ok(message) => relay(&bus, &shared, &channel, ice_servers.as_deref(), message),
                    Err(err) => {
                        warn!(target = "chorus::signaling::local", error = %err, "undecodable frame")
                    }
                }
            }
        });
        state.tasks.insert(channel_id.to_string(), task);
    }
}

impl Drop for LocalRelay {
    fn drop(&mut self) {
        for (_, task) in self.state.lock().tasks.drain() {
            task.abort();
        }
    }
}

fn deliver(bus: &LocalBus, topic: &Topic, message: &SignalMessage) {
    let payload = match serde_json::to_vec(message) {
        Ok(payload) => Bytes::from(payload),
        Err(err) => {
            warn!(target = "chorus::signaling::local", error = %err, "encode failed");
            return;
        }
    };
    if let Err(err) = bus.publish(topic, payload) {
        debug!(
            target = "chorus::signaling::local",
            kind = message.kind(),
            error = %err,
            "delivery skipped"
        );
    }
}

fn broadcast(bus: &LocalBus, channel: &str, members: &[PeerId], except: &str, message: &SignalMessage) {
    for peer in members.iter().filter(|peer| peer.as_str() != except) {
        deliver(bus, &Topic::new(channel, peer.as_str()), message);
    }
}

fn relay(
    bus: &LocalBus,
    shared: &Mutex<RelayState>,
    channel: &str,
    ice_servers: Option<&[IceServer]>,
    message: SignalMessage,
) {
    trace!(target = "chorus::signaling::local", %message, "relaying");
    if let Some(to) = message.recipient() {
        deliver(bus, &Topic::new(channel, to), &message);
        return;
    }

    let mut state = shared.lock();
    let roster = state.channels.entry(channel.to_string()).or_default();
    match message {
        SignalMessage::Join {
            peer_id,
            display_name,
            ..
        } => {
            let returning = roster.members.contains_key(&peer_id);
            let participant = Participant {
                peer_id: peer_id.clone(),
                display_name,
                muted: false,
            };
            roster.members.insert(peer_id.clone(), participant.clone());
            let others: Vec<Participant> = roster
                .members
                .values()
                .filter(|member| member.peer_id != peer_id)
                .cloned()
                .collect();
            let members: Vec<PeerId> = roster.members.keys().cloned().collect();
            drop(state);

            deliver(
                bus,
                &Topic::new(channel, peer_id.as_str()),
                &SignalMessage::Participants {
                    channel_id: channel.to_string(),
                    participants: others,
                    ice_servers: ice_servers.map(<[IceServer]>::to_vec),
                },
            );
            let notice = if returning {
                SignalMessage::UserReconnected {
                    channel_id: channel.to_string(),
                    peer_id: peer_id.clone(),
                }
            } else {
                SignalMessage::UserJoined {
                    channel_id: channel.to_string(),
                    participant,
                }
            };
            broadcast(bus, channel, &members, &peer_id, &notice);
        }
        SignalMessage::Leave { peer_id, .. } => {
            if roster.members.remove(&peer_id).is_none() {
                return;
            }
            roster.heartbeats.remove(&peer_id);
            let members: Vec<PeerId> = roster.members.keys().cloned().collect();
            drop(state);
            broadcast(
                bus,
                channel,
                &members,
                &peer_id,
                &SignalMessage::UserLeft {
                    channel_id: channel.to_string(),
                    peer_id: peer_id.clone(),
                },
            );
        }
        SignalMessage::TrackState { ref peer_id, .. } => {
            let members: Vec<PeerId> = roster.members.keys().cloned().collect();
            let sender = peer_id.clone();
            drop(state);
            broadcast(bus, channel, &members, &sender, &message);
        }
        SignalMessage::UserUpdated {
            ref participant, ..
        } => {
            roster
                .members
                .insert(participant.peer_id.clone(), participant.clone());
            let members: Vec<PeerId> = roster.members.keys().cloned().collect();
            let sender = participant.peer_id.clone();
            drop(state);
            broadcast(bus, channel, &members, &sender, &message);
        }
        SignalMessage::Heartbeat { peer_id, .. } => {
            *roster.heartbeats.entry(peer_id).or_default() += 1;
        }
        report @ SignalMessage::ConnectionReport { .. } => {
            roster.reports.push(report);
        }
        other => {
            debug!(
                target = "chorus::signaling::local",
                kind = other.kind(),
                "ignoring client message"
            );
        }
    }
}

struct BusSink {
    bus: Arc<LocalBus>,
    server: Topic,
}

impl SignalSink for BusSink {
    fn send(&self, message: SignalMessage) -> Result<(), SignalingError> {
        let payload = serde_json::to_vec(&message)?;
        self.bus
            .publish(&self.server, Bytes::from(payload))
            .map_err(|err| SignalingError::Transport(err.to_string()))
    }
}

#[async_trait]
impl SignalingTransport for LocalRelay {
    async fn connect(
        &self,
        channel_id: &str,
        peer_id: &str,
    ) -> Result<SignalingConnection, SignalingError> {
        self.ensure_channel(channel_id);
        let mut inbox = self.bus.subscribe(&Topic::new(channel_id, peer_id));
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let peer = peer_id.to_string();
        tokio::spawn(async move {
            while let Some(frame) = recv_next(&mut inbox).await {
                match serde_json::from_slice::<SignalMessage>(&frame.payload) {
                    Ok(message) => {
                        if inbound_tx.send(message).is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        warn!(
                            target = "chorus::signaling::local",
                            peer_id = %peer,
                            error = %err,
                            "undecodable inbox frame"
                        );
                    }
                }
            }
        });
        Ok(SignalingConnection {
            sink: Arc::new(BusSink {
                bus: Arc::clone(&self.bus),
                server: Topic::server(channel_id),
            }),
            inbound: inbound_rx,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn next(connection: &mut SignalingConnection) -> SignalMessage {
        tokio::time::timeout(Duration::from_secs(1), connection.inbound.recv())
            .await
            .expect("message in time")
            .expect("connection open")
    }

    #[tokio::test]
    async fn join_returns_roster_and_notifies_members() {
        let relay = LocalRelay::default().with_ice_servers(vec![IceServer::stun("stun:relay")]);
        let mut a = relay.connect("lounge", "a1").await.unwrap();
        a.sink
            .send(SignalMessage::Join {
                channel_id: "lounge".into(),
                peer_id: "a1".into(),
                display_name: None,
            })
            .unwrap();
        assert!(matches!(
            next(&mut a).await,
            SignalMessage::Participants { participants, .. } if participants.is_empty()
        ));

        let mut b = relay.connect("lounge", "b2").await.unwrap();
        b.sink
            .send(SignalMessage::Join {
                channel_id: "lounge".into(),
                peer_id: "b2".into(),
                display_name: None,
            })
            .unwrap();
        let SignalMessage::Participants {
            participants,
            ice_servers,
            ..
        } = next(&mut b).await
        else {
            panic!("expected participants");
        };
        assert_eq!(participants, vec![Participant::new("a1")]);
        assert_eq!(ice_servers.map(|servers| servers.len()), Some(1));
        assert!(matches!(
            next(&mut a).await,
            SignalMessage::UserJoined { participant, .. } if participant.peer_id == "b2"
        ));
    }

    #[tokio::test]
    async fn addressed_messages_reach_only_the_recipient() {
        let relay = LocalRelay::default();
        let mut a = relay.connect("lounge", "a1").await.unwrap();
        let mut b = relay.connect("lounge", "b2").await.unwrap();
        a.sink
            .send(SignalMessage::ResyncRequest {
                channel_id: "lounge".into(),
                from: "a1".into(),
                to: "b2".into(),
            })
            .unwrap();
        assert!(matches!(next(&mut b).await, SignalMessage::ResyncRequest { .. }));
        assert!(a.inbound.try_recv().is_err());
    }
}
