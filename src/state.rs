//! Observable State Surface
//!
//! Schreibgeschützter Snapshot von Registrierung und Anruf. Der Dispatcher
//! veröffentlicht nach jedem Übergang; beliebig viele Abonnenten erhalten
//! alle Übergänge in Reihenfolge.

use crate::engine::CallId;
use crate::session::{
    CallDirection, CallState, CallView, IncomingCallDescriptor, RegistrationState,
};
use futures::stream::{self, Stream, StreamExt};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

// ============================================================================
// SNAPSHOT
// ============================================================================

/// Veröffentlichter Zustand des Session-Managers
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSnapshot {
    pub registration: RegistrationState,
    pub call: CallState,
    pub session_id: Option<Uuid>,
    pub call_id: Option<CallId>,
    pub direction: Option<CallDirection>,
    pub remote_address: Option<String>,
    pub is_muted: bool,
    pub is_speaker_on: bool,
    pub incoming: Option<IncomingCallDescriptor>,
}

impl StateSnapshot {
    pub fn new(registration: &RegistrationState, call: &CallView) -> Self {
        let session = call.session.as_ref();
        Self {
            registration: registration.clone(),
            call: call.state.clone(),
            session_id: session.map(|s| s.id),
            call_id: session.map(|s| s.call_id),
            direction: session.map(|s| s.direction),
            remote_address: session.map(|s| s.remote_address.clone()),
            is_muted: call.is_muted(),
            is_speaker_on: call.is_speaker_on(),
            incoming: call.incoming.clone(),
        }
    }
}

// ============================================================================
// PUBLISHER
// ============================================================================

/// Hält den aktuellen Snapshot und verteilt Änderungen an alle Abonnenten
#[derive(Debug)]
pub struct StatePublisher {
    current: RwLock<StateSnapshot>,
    tx: broadcast::Sender<StateSnapshot>,
}

impl StatePublisher {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            current: RwLock::new(StateSnapshot::default()),
            tx,
        }
    }

    /// Aktueller Snapshot
    pub fn snapshot(&self) -> StateSnapshot {
        self.current.read().clone()
    }

    /// Veröffentlicht den Snapshot; unveränderte Snapshots werden verworfen
    ///
    /// Gibt `true` zurück wenn tatsächlich veröffentlicht wurde.
    pub fn publish(&self, snapshot: StateSnapshot) -> bool {
        let mut current = self.current.write();
        if *current == snapshot {
            return false;
        }
        *current = snapshot.clone();
        // Ohne Abonnenten schlägt send fehl, das ist kein Fehler
        let _ = self.tx.send(snapshot);
        true
    }

    /// Abonniert Änderungen ab jetzt, zusammen mit dem aktuellen Snapshot
    pub fn subscribe(&self) -> StateSubscription {
        // Lesesperre hält publish() an: kein Übergang fällt zwischen
        // Snapshot und Receiver
        let current = self.current.read();
        StateSubscription {
            current: current.clone(),
            rx: self.tx.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

// ============================================================================
// SUBSCRIPTION
// ============================================================================

/// Abonnement: Snapshot beim Abonnieren plus alle folgenden Übergänge
#[derive(Debug)]
pub struct StateSubscription {
    current: StateSnapshot,
    rx: broadcast::Receiver<StateSnapshot>,
}

impl StateSubscription {
    /// Snapshot zum Zeitpunkt des Abonnierens bzw. zuletzt empfangen
    pub fn current(&self) -> &StateSnapshot {
        &self.current
    }

    /// Wartet auf den nächsten Übergang
    ///
    /// `None` wenn der Manager beendet wurde. Hinkt der Abonnent hinterher,
    /// werden verpasste Übergänge übersprungen und geloggt.
    pub async fn next(&mut self) -> Option<StateSnapshot> {
        loop {
            match self.rx.recv().await {
                Ok(snapshot) => {
                    self.current = snapshot.clone();
                    return Some(snapshot);
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("State subscriber lagged, skipped {} transitions", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Nicht-blockierend; `None` wenn gerade kein Übergang ansteht
    pub fn try_next(&mut self) -> Option<StateSnapshot> {
        loop {
            match self.rx.try_recv() {
                Ok(snapshot) => {
                    self.current = snapshot.clone();
                    return Some(snapshot);
                }
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    tracing::warn!("State subscriber lagged, skipped {} transitions", skipped);
                }
                Err(_) => return None,
            }
        }
    }

    /// Als Stream, beginnend mit dem aktuellen Snapshot
    pub fn into_stream(self) -> impl Stream<Item = StateSnapshot> {
        let first = self.current.clone();
        stream::once(async move { first }).chain(stream::unfold(self, |mut sub| async move {
            sub.next().await.map(|snapshot| (snapshot, sub))
        }))
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn with_registration(state: RegistrationState) -> StateSnapshot {
        StateSnapshot {
            registration: state,
            ..Default::default()
        }
    }

    #[test]
    fn test_publish_deduplicates() {
        let publisher = StatePublisher::new(16);
        let mut sub = publisher.subscribe();

        assert!(publisher.publish(with_registration(RegistrationState::Progress)));
        assert!(!publisher.publish(with_registration(RegistrationState::Progress)));
        assert!(publisher.publish(with_registration(RegistrationState::Ok)));

        assert_eq!(sub.try_next().unwrap().registration, RegistrationState::Progress);
        assert_eq!(sub.try_next().unwrap().registration, RegistrationState::Ok);
        assert!(sub.try_next().is_none());
    }

    #[test]
    fn test_late_subscriber_gets_current() {
        let publisher = StatePublisher::new(16);
        publisher.publish(with_registration(RegistrationState::Ok));

        let mut late = publisher.subscribe();
        assert_eq!(late.current().registration, RegistrationState::Ok);
        assert!(late.try_next().is_none());
    }

    #[tokio::test]
    async fn test_multiple_subscribers_in_order() {
        let publisher = StatePublisher::new(16);
        let mut first = publisher.subscribe();
        let mut second = publisher.subscribe();
        assert_eq!(publisher.subscriber_count(), 2);

        publisher.publish(with_registration(RegistrationState::Progress));
        publisher.publish(with_registration(RegistrationState::Failed("timeout".into())));

        for sub in [&mut first, &mut second] {
            assert_eq!(sub.next().await.unwrap().registration, RegistrationState::Progress);
            assert_eq!(
                sub.next().await.unwrap().registration,
                RegistrationState::Failed("timeout".into())
            );
        }
    }

    #[tokio::test]
    async fn test_stream_starts_with_current() {
        let publisher = StatePublisher::new(16);
        publisher.publish(with_registration(RegistrationState::Progress));
        let stream = publisher.subscribe().into_stream();
        publisher.publish(with_registration(RegistrationState::Ok));
        drop(publisher);

        let states: Vec<_> = stream.map(|s| s.registration).collect().await;
        assert_eq!(states, vec![RegistrationState::Progress, RegistrationState::Ok]);
    }

    #[test]
    fn test_snapshot_json() {
        let snapshot = with_registration(RegistrationState::Failed("timeout".into()));
        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["registration"]["state"], "failed");
        assert_eq!(json["registration"]["reason"], "timeout");
        assert_eq!(json["isMuted"], false);
    }
}
