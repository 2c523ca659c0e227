//! Link supervisor
//!
//! Watches per-peer link health and drives the ICE-versus-relay choice:
//! connections stuck in path selection are torn down and retried
//! relay-only, persistently bad links fall back to relay, duplicate
//! sessions are closed, and the startup path preference is derived from
//! measured direct ping against an estimate of the relay round trip.
//! Relay fallback happens at most once per session.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use lanlink_proto::UserId;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::substrate::{LinkState, SessionEvent, Substrate, TransportTuning};

/// How long a connection may sit in Connecting/FindingRoute before the
/// relay fallback kicks in
pub const CONNECT_STALL: Duration = Duration::from_secs(8);

/// Consecutive bad samples before a connected link falls back to relay
pub const BAD_QUALITY_SAMPLES: u32 = 120;

/// Connection quality below this counts as a bad sample
pub const QUALITY_FLOOR: f32 = 0.2;

/// Diagnostic substrings that identify a failed direct-path attempt
const ICE_FAILURE_MARKERS: [&str; 3] = [
    "NAT traversal",
    "Timed out attempting to connect",
    "end-to-end timeout",
];

/// Decisions surfaced to the owner of the session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorEvent {
    /// The session should be re-established relay-only
    RelayRetry { peer: UserId },

    /// The session is beyond saving; the boundary decides what to do
    SessionFatal { peer: UserId, reason: String },

    /// A duplicate incoming session was closed
    DuplicateClosed { peer: UserId },
}

#[derive(Debug, Default)]
struct LinkWatch {
    connect_started: Option<Instant>,
    bad_samples: u32,
    relay_fallback_tried: bool,
    relay_retry_pending: bool,
}

/// Per-peer link health state machine
pub struct LinkSupervisor {
    substrate: Arc<dyn Substrate>,
    watches: Mutex<HashMap<UserId, LinkWatch>>,
    events: mpsc::UnboundedSender<SupervisorEvent>,
}

impl LinkSupervisor {
    pub fn new(
        substrate: Arc<dyn Substrate>,
        events: mpsc::UnboundedSender<SupervisorEvent>,
    ) -> Self {
        Self {
            substrate,
            watches: Mutex::new(HashMap::new()),
            events,
        }
    }

    /// Start watching a peer whose connection attempt begins now
    pub fn track(&self, peer: UserId) {
        let mut watches = self.watches.lock().unwrap();
        watches.insert(
            peer,
            LinkWatch {
                connect_started: Some(Instant::now()),
                ..Default::default()
            },
        );
    }

    /// Stop watching a peer
    pub fn untrack(&self, peer: UserId) {
        self.watches.lock().unwrap().remove(&peer);
    }

    /// Peers currently under watch
    pub fn watched(&self) -> Vec<UserId> {
        self.watches.lock().unwrap().keys().copied().collect()
    }

    /// Periodic health pass; call at most every 100 ms
    pub fn tick(&self) {
        let peers = self.watched();
        for peer in peers {
            self.check_peer(peer);
        }
    }

    fn check_peer(&self, peer: UserId) {
        // A queued ICE-failure retry fires on the next tick, whether or
        // not the failed link still reports status.
        {
            let mut watches = self.watches.lock().unwrap();
            if let Some(watch) = watches.get_mut(&peer) {
                if watch.relay_retry_pending && !watch.relay_fallback_tried {
                    watch.relay_retry_pending = false;
                    watch.relay_fallback_tried = true;
                    watch.connect_started = Some(Instant::now());
                    watch.bad_samples = 0;
                    drop(watches);
                    self.begin_relay_retry(peer);
                    return;
                }
            } else {
                return;
            }
        }

        let Some(status) = self.substrate.status(peer) else {
            return;
        };

        let mut retry = false;
        {
            let mut watches = self.watches.lock().unwrap();
            let Some(watch) = watches.get_mut(&peer) else {
                return;
            };

            if status.state.is_connecting() {
                if !watch.relay_fallback_tried {
                    if let Some(started) = watch.connect_started {
                        if started.elapsed() > CONNECT_STALL {
                            info!(target: "substrate", %peer, "route selection stalled, retrying via relay");
                            watch.relay_fallback_tried = true;
                            watch.connect_started = Some(Instant::now());
                            watch.bad_samples = 0;
                            retry = true;
                        }
                    }
                }
            } else if status.state == LinkState::Connected {
                watch.connect_started = None;
                let bad = status.ping_ms <= 0
                    || status.quality_local < QUALITY_FLOOR
                    || status.quality_remote < QUALITY_FLOOR;
                watch.bad_samples = if bad { watch.bad_samples + 1 } else { 0 };

                if bad && watch.bad_samples >= BAD_QUALITY_SAMPLES && !watch.relay_fallback_tried {
                    info!(target: "substrate", %peer, "link quality poor, retrying via relay");
                    watch.relay_fallback_tried = true;
                    watch.bad_samples = 0;
                    watch.connect_started = Some(Instant::now());
                    retry = true;
                }
            }
        }

        if retry {
            self.begin_relay_retry(peer);
        }
    }

    /// Feed a substrate lifecycle event through the duplicate and
    /// failure rules
    pub fn handle_event(&self, event: &SessionEvent) {
        match event {
            SessionEvent::Requested { peer } => {
                // An incoming session for a peer we already track is a
                // duplicate; close it before the substrate asserts.
                let is_duplicate = self.watches.lock().unwrap().contains_key(peer);
                if is_duplicate {
                    warn!(target: "substrate", peer = %peer, "closing duplicate session");
                    self.substrate
                        .close_session(*peer, "Replace duplicate connection");
                    let _ = self.events.send(SupervisorEvent::DuplicateClosed { peer: *peer });
                } else {
                    self.track(*peer);
                }
            }
            SessionEvent::StateChanged {
                peer,
                old,
                new,
                reason,
            } => {
                if *new == LinkState::Connecting && *old == LinkState::None {
                    let is_duplicate = {
                        let watches = self.watches.lock().unwrap();
                        watches
                            .get(peer)
                            .map(|w| w.connect_started.is_none())
                            .unwrap_or(false)
                    };
                    if is_duplicate {
                        warn!(target: "substrate", peer = %peer, "closing duplicate connecting session");
                        self.substrate
                            .close_session(*peer, "Replace duplicate connection");
                        let _ = self
                            .events
                            .send(SupervisorEvent::DuplicateClosed { peer: *peer });
                    }
                } else if *new == LinkState::ProblemDetected {
                    self.handle_problem(*peer, *old, reason);
                } else if *new == LinkState::Connected {
                    let mut watches = self.watches.lock().unwrap();
                    if let Some(watch) = watches.get_mut(peer) {
                        watch.connect_started = None;
                        watch.bad_samples = 0;
                    }
                }
            }
        }
    }

    fn handle_problem(&self, peer: UserId, old: LinkState, reason: &str) {
        let failed_while_connecting = old.is_connecting();
        let ice_failure = ICE_FAILURE_MARKERS.iter().any(|m| reason.contains(m));

        let mut watches = self.watches.lock().unwrap();
        let Some(watch) = watches.get_mut(&peer) else {
            return;
        };

        if !watch.relay_fallback_tried && (failed_while_connecting || ice_failure) {
            debug!(target: "substrate", %peer, reason, "queueing relay-only retry");
            watch.relay_retry_pending = true;
        } else if failed_while_connecting && reason.contains("Timed out attempting to connect") {
            drop(watches);
            warn!(target: "substrate", %peer, "connection timed out after relay fallback");
            let _ = self.events.send(SupervisorEvent::SessionFatal {
                peer,
                reason: reason.to_string(),
            });
        }
    }

    fn begin_relay_retry(&self, peer: UserId) {
        self.substrate
            .close_session(peer, "Retry via relay after ICE stall");
        self.substrate.set_tuning(TransportTuning {
            relay_only: true,
            ..TransportTuning::default()
        });
        let _ = self.events.send(SupervisorEvent::RelayRetry { peer });
    }

    /// Derive the startup ICE/relay preference
    ///
    /// `direct_ping_ms` is the measured ping on an existing direct link
    /// when one is available. Direct within 10 ms of the relay estimate
    /// keeps ICE preferred; a relay at least 15 ms faster flips the
    /// bias. Penalties are virtual latency offsets.
    pub fn apply_path_preference(&self, direct_ping_ms: Option<i32>) {
        let relay_ping = self.substrate.relay_ping_estimate_ms().map(|p| p as i32);

        let mut tuning = TransportTuning::default();
        match (direct_ping_ms, relay_ping) {
            (Some(direct), relay) if relay.map_or(true, |r| direct <= r + 10) => {
                tuning.relay_penalty_ms = 150;
            }
            (direct, Some(relay)) if direct.map_or(true, |d| relay + 15 < d) => {
                tuning.ice_penalty_ms = 200;
            }
            _ => {}
        }

        info!(
            target: "substrate",
            direct = ?direct_ping_ms,
            relay = ?relay_ping,
            ice_penalty = tuning.ice_penalty_ms,
            relay_penalty = tuning.relay_penalty_ms,
            "applied path preference"
        );
        self.substrate.set_tuning(tuning);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryHub;

    fn setup() -> (
        MemoryHub,
        LinkSupervisor,
        mpsc::UnboundedReceiver<SupervisorEvent>,
    ) {
        let hub = MemoryHub::new();
        let local = hub.endpoint(UserId(1), "local");
        hub.endpoint(UserId(2), "remote");
        hub.connect(UserId(1), UserId(2));
        let (tx, rx) = mpsc::unbounded_channel();
        let supervisor = LinkSupervisor::new(local, tx);
        (hub, supervisor, rx)
    }

    #[test]
    fn test_bad_quality_triggers_single_relay_fallback() {
        let (hub, supervisor, mut rx) = setup();
        supervisor.track(UserId(2));
        hub.set_link_quality(UserId(1), UserId(2), LinkState::Connected, 40, 0.05);

        for _ in 0..BAD_QUALITY_SAMPLES {
            supervisor.tick();
        }
        assert_eq!(
            rx.try_recv().unwrap(),
            SupervisorEvent::RelayRetry { peer: UserId(2) }
        );
        assert!(hub.tuning_of(UserId(1)).relay_only);

        // Fallback is once per session: more bad samples change nothing.
        hub.connect(UserId(1), UserId(2));
        hub.set_link_quality(UserId(1), UserId(2), LinkState::Connected, 40, 0.05);
        for _ in 0..(BAD_QUALITY_SAMPLES * 2) {
            supervisor.tick();
        }
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_good_quality_resets_sample_counter() {
        let (hub, supervisor, mut rx) = setup();
        supervisor.track(UserId(2));

        hub.set_link_quality(UserId(1), UserId(2), LinkState::Connected, 40, 0.05);
        for _ in 0..(BAD_QUALITY_SAMPLES - 1) {
            supervisor.tick();
        }
        hub.set_link_quality(UserId(1), UserId(2), LinkState::Connected, 40, 0.9);
        supervisor.tick();
        hub.set_link_quality(UserId(1), UserId(2), LinkState::Connected, 40, 0.05);
        for _ in 0..(BAD_QUALITY_SAMPLES - 1) {
            supervisor.tick();
        }
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_ice_failure_queues_relay_retry() {
        let (_hub, supervisor, mut rx) = setup();
        supervisor.track(UserId(2));

        supervisor.handle_event(&SessionEvent::StateChanged {
            peer: UserId(2),
            old: LinkState::FindingRoute,
            new: LinkState::ProblemDetected,
            reason: "NAT traversal failure".into(),
        });
        assert!(rx.try_recv().is_err()); // queued, not fired
        supervisor.tick();
        assert_eq!(
            rx.try_recv().unwrap(),
            SupervisorEvent::RelayRetry { peer: UserId(2) }
        );
    }

    #[test]
    fn test_timeout_after_fallback_is_fatal() {
        let (_hub, supervisor, mut rx) = setup();
        supervisor.track(UserId(2));

        // First failure queues the relay retry and latches the fallback.
        supervisor.handle_event(&SessionEvent::StateChanged {
            peer: UserId(2),
            old: LinkState::Connecting,
            new: LinkState::ProblemDetected,
            reason: "Timed out attempting to connect".into(),
        });
        supervisor.tick();
        assert!(matches!(
            rx.try_recv().unwrap(),
            SupervisorEvent::RelayRetry { .. }
        ));

        // The same diagnostic after the fallback escalates.
        supervisor.handle_event(&SessionEvent::StateChanged {
            peer: UserId(2),
            old: LinkState::Connecting,
            new: LinkState::ProblemDetected,
            reason: "Timed out attempting to connect".into(),
        });
        assert!(matches!(
            rx.try_recv().unwrap(),
            SupervisorEvent::SessionFatal { .. }
        ));
    }

    #[test]
    fn test_duplicate_connecting_session_closed() {
        let (hub, supervisor, mut rx) = setup();
        supervisor.track(UserId(2));
        // Mark the existing link settled.
        supervisor.handle_event(&SessionEvent::StateChanged {
            peer: UserId(2),
            old: LinkState::Connecting,
            new: LinkState::Connected,
            reason: String::new(),
        });

        supervisor.handle_event(&SessionEvent::StateChanged {
            peer: UserId(2),
            old: LinkState::None,
            new: LinkState::Connecting,
            reason: String::new(),
        });
        assert_eq!(
            rx.try_recv().unwrap(),
            SupervisorEvent::DuplicateClosed { peer: UserId(2) }
        );
        assert!(!hub.has_link(UserId(1), UserId(2)));
    }

    #[test]
    fn test_path_preference_prefers_ice_on_lan() {
        let (hub, supervisor, _rx) = setup();
        hub.set_relay_ping(UserId(1), Some(60));

        supervisor.apply_path_preference(Some(5));
        let tuning = hub.tuning_of(UserId(1));
        assert_eq!(tuning.relay_penalty_ms, 150);
        assert_eq!(tuning.ice_penalty_ms, 0);
    }

    #[test]
    fn test_path_preference_prefers_relay_when_clearly_faster() {
        let (hub, supervisor, _rx) = setup();
        hub.set_relay_ping(UserId(1), Some(30));

        supervisor.apply_path_preference(Some(80));
        let tuning = hub.tuning_of(UserId(1));
        assert_eq!(tuning.ice_penalty_ms, 200);
        assert_eq!(tuning.relay_penalty_ms, 0);
    }

    #[test]
    fn test_path_preference_neutral_without_measurements() {
        let (hub, supervisor, _rx) = setup();
        hub.set_relay_ping(UserId(1), None);

        supervisor.apply_path_preference(None);
        let tuning = hub.tuning_of(UserId(1));
        assert_eq!(tuning.ice_penalty_ms, 0);
        assert_eq!(tuning.relay_penalty_ms, 0);
    }
}
