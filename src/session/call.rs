//! Call Session
//!
//! Verwaltet höchstens einen aktiven Anruf. Engine-Events werden über die
//! reine Funktion `next_call_state` auf `CallState` abgebildet; Seiteneffekte
//! (Audio belegen/freigeben, Slot räumen) passieren nur beim Eintritt in
//! einen Zustand.

use super::audio::{AudioGuard, SharedAudioSession};
use crate::engine::{CallId, EngineAdapter, EngineCallState, EngineError, RemoteParty};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use thiserror::Error;
use uuid::Uuid;

// ============================================================================
// CALL STATE
// ============================================================================

/// Status des (letzten) Anrufs
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum CallState {
    /// Noch kein Anruf
    #[default]
    Idle,
    /// Ausgehender Anruf wird aufgebaut
    OutgoingInit,
    /// Gegenstelle klingelt
    Ringing,
    /// Eingehender Anruf wartet auf Antwort
    IncomingReceived,
    Connected,
    StreamsRunning,
    Paused,
    /// Anruf beendet, Engine hat ihn noch nicht freigegeben
    Ended,
    Released,
    Error(String),
}

impl CallState {
    /// Kein weiteres Event ändert diesen Zustand
    pub fn is_terminal(&self) -> bool {
        matches!(self, CallState::Released | CallState::Error(_))
    }

    /// Zustände in denen die Audio-Ressource gehalten wird
    pub fn requires_media(&self) -> bool {
        matches!(
            self,
            CallState::Connected | CallState::StreamsRunning | CallState::Paused
        )
    }
}

/// Übergangstabelle für Engine-Events
///
/// Reine Funktion; `None` bedeutet "Event ändert nichts".
pub fn next_call_state(
    current: &CallState,
    event: EngineCallState,
    message: &str,
) -> Option<CallState> {
    use EngineCallState as E;

    if current.is_terminal() {
        return None;
    }

    let next = match event {
        E::IncomingReceived => CallState::IncomingReceived,
        E::OutgoingInit => CallState::OutgoingInit,
        E::OutgoingProgress | E::OutgoingRinging | E::OutgoingEarlyMedia => CallState::Ringing,
        E::Connected => CallState::Connected,
        E::StreamsRunning => CallState::StreamsRunning,
        E::Pausing | E::Paused | E::PausedByRemote => CallState::Paused,
        E::Resuming => return None,
        E::End => CallState::Ended,
        E::Released => CallState::Released,
        E::Error => CallState::Error(if message.trim().is_empty() {
            "call failed".to_string()
        } else {
            message.trim().to_string()
        }),
    };

    // Nach Ended zählt nur noch die Freigabe
    if *current == CallState::Ended && !next.is_terminal() {
        return None;
    }

    // Verspätete Aufbau-Events fallen nicht hinter eine bestehende Verbindung zurück
    if current.requires_media()
        && matches!(
            next,
            CallState::OutgoingInit | CallState::Ringing | CallState::IncomingReceived
        )
    {
        return None;
    }

    (next != *current).then_some(next)
}

// ============================================================================
// CALL SESSION
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallDirection {
    Incoming,
    Outgoing,
}

/// Ein Anruf aus Sicht der Session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallSession {
    pub id: Uuid,
    pub call_id: CallId,
    pub direction: CallDirection,
    pub remote_address: String,
    pub state: CallState,
    pub started_at: DateTime<Utc>,
    pub connected_at: Option<DateTime<Utc>>,
    pub is_muted: bool,
    pub is_speaker_on: bool,
}

impl CallSession {
    fn new(call_id: CallId, direction: CallDirection, remote_address: String, state: CallState) -> Self {
        Self {
            id: Uuid::new_v4(),
            call_id,
            direction,
            remote_address,
            state,
            started_at: Utc::now(),
            connected_at: None,
            is_muted: false,
            is_speaker_on: false,
        }
    }
}

/// Anrufer-Infos für die UI, solange ein Anruf klingelt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingCallDescriptor {
    /// Anzeigename, sonst die Nummer
    pub caller_id: String,
    pub caller_number: String,
}

impl IncomingCallDescriptor {
    pub fn from_remote(remote: &RemoteParty) -> Self {
        let number = remote.user_part().to_string();
        let caller_id = remote
            .display_name
            .as_ref()
            .map(|n| n.trim())
            .filter(|n| !n.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| number.clone());
        Self {
            caller_id,
            caller_number: number,
        }
    }
}

/// Call-Teil des veröffentlichten Snapshots
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallView {
    pub state: CallState,
    pub session: Option<CallSession>,
    pub incoming: Option<IncomingCallDescriptor>,
}

impl CallView {
    pub fn is_muted(&self) -> bool {
        self.session.as_ref().is_some_and(|s| s.is_muted)
    }

    pub fn is_speaker_on(&self) -> bool {
        self.session.as_ref().is_some_and(|s| s.is_speaker_on)
    }
}

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    #[error("Already in a call")]
    Busy,

    #[error("No active call")]
    NoActiveCall,

    #[error("No incoming call to accept")]
    NoIncomingCall,

    #[error(transparent)]
    Engine(#[from] EngineError),
}

// ============================================================================
// CALL CONTROLLER
// ============================================================================

#[derive(Debug)]
struct ActiveCall {
    session: CallSession,
    audio: Option<AudioGuard>,
    release_deadline: Option<Instant>,
    /// Terminate während OutgoingInit, wird nachgeholt
    terminate_pending: bool,
}

/// Besitzt den einen Call-Slot und die Audio-Ressource
pub struct CallController {
    audio: SharedAudioSession,
    release_grace: Duration,
    last_state: CallState,
    active: Option<ActiveCall>,
    incoming: Option<IncomingCallDescriptor>,
    transitions: Vec<CallView>,
}

impl CallController {
    pub fn new(audio: SharedAudioSession, release_grace: Duration) -> Self {
        Self {
            audio,
            release_grace,
            last_state: CallState::Idle,
            active: None,
            incoming: None,
            transitions: Vec::new(),
        }
    }

    /// Slot belegt (Anruf nicht Idle/Released/Error)
    pub fn is_live(&self) -> bool {
        self.active.is_some()
    }

    pub fn state(&self) -> &CallState {
        self.active
            .as_ref()
            .map(|a| &a.session.state)
            .unwrap_or(&self.last_state)
    }

    pub fn holds_audio(&self) -> bool {
        self.active.as_ref().is_some_and(|a| a.audio.is_some())
    }

    pub fn view(&self) -> CallView {
        CallView {
            state: self.state().clone(),
            session: self.active.as_ref().map(|a| a.session.clone()),
            incoming: self.incoming.clone(),
        }
    }

    /// Seit dem letzten Aufruf erfolgte Übergänge, in Reihenfolge
    pub fn drain_transitions(&mut self) -> Vec<CallView> {
        std::mem::take(&mut self.transitions)
    }

    // ========================================================================
    // COMMANDS
    // ========================================================================

    /// Ausgehender Anruf; Slot muss frei sein
    pub fn originate(&mut self, adapter: &mut EngineAdapter, address: &str) -> Result<(), CallError> {
        if self.active.is_some() {
            return Err(CallError::Busy);
        }

        let call_id = adapter.originate_call(address)?;
        let session = CallSession::new(
            call_id,
            CallDirection::Outgoing,
            address.trim().to_string(),
            CallState::OutgoingInit,
        );
        tracing::info!("Outgoing call {} to {}", call_id, session.remote_address);

        self.active = Some(ActiveCall {
            session,
            audio: None,
            release_deadline: None,
            terminate_pending: false,
        });
        self.record();
        Ok(())
    }

    /// Eingehenden Anruf annehmen
    pub fn accept(&mut self, adapter: &mut EngineAdapter, now: Instant) -> Result<(), CallError> {
        let call_id = match &self.active {
            Some(active)
                if self.incoming.is_some() && active.session.state == CallState::IncomingReceived =>
            {
                active.session.call_id
            }
            _ => return Err(CallError::NoIncomingCall),
        };

        if let Err(e) = adapter.accept_call(call_id) {
            tracing::warn!("Accepting {} failed: {}", call_id, e);
            self.fail(adapter, format!("accept failed: {}", e), true, now);
            return Err(e.into());
        }
        Ok(())
    }

    /// Aktiven Anruf beenden
    ///
    /// Während `OutgoingInit` wird das Beenden zurückgehalten, bis die Engine
    /// den Verbindungsaufbau weitergeschaltet hat.
    pub fn terminate(&mut self, adapter: &mut EngineAdapter, now: Instant) -> Result<(), CallError> {
        let active = self.active.as_mut().ok_or(CallError::NoActiveCall)?;
        let call_id = active.session.call_id;

        match active.session.state {
            CallState::OutgoingInit => {
                tracing::info!("Holding terminate of {} until setup progresses", call_id);
                active.terminate_pending = true;
                Ok(())
            }
            CallState::Ended => Ok(()),
            _ => self.send_terminate(adapter, now),
        }
    }

    /// Aktiven Anruf für einen neuen ausgehenden Anruf räumen
    pub fn terminate_for_replacement(&mut self, adapter: &mut EngineAdapter, now: Instant) {
        if let Err(e) = self.terminate(adapter, now) {
            tracing::warn!("Terminating previous call failed: {}", e);
        }
    }

    /// Anruf sofort beenden, ohne auf die Engine zu warten (z.B. beim Herunterfahren)
    ///
    /// Terminate geht best-effort an die Engine, auch während `OutgoingInit`;
    /// Slot und Audio werden in jedem Fall freigegeben.
    pub fn abort(&mut self, adapter: &mut EngineAdapter, reason: &str, now: Instant) {
        let Some(active) = &self.active else {
            return;
        };
        let terminate = active.session.state != CallState::Ended;
        tracing::info!("Aborting call {}: {}", active.session.call_id, reason);
        self.fail(adapter, reason.to_string(), terminate, now);
    }

    pub fn set_muted(&mut self, adapter: &mut EngineAdapter, muted: bool) -> Result<(), CallError> {
        let active = self.active.as_mut().ok_or(CallError::NoActiveCall)?;
        if active.session.is_muted == muted {
            return Ok(());
        }

        adapter.set_muted(muted)?;
        active.session.is_muted = muted;
        tracing::info!("Microphone muted: {}", muted);
        self.record();
        Ok(())
    }

    pub fn set_speaker(&mut self, adapter: &mut EngineAdapter, on: bool) -> Result<(), CallError> {
        let active = self.active.as_mut().ok_or(CallError::NoActiveCall)?;
        if active.session.is_speaker_on == on {
            return Ok(());
        }

        adapter.set_speaker(on)?;
        if let Some(audio) = &active.audio {
            if let Err(e) = audio.set_speaker(on) {
                tracing::warn!("Audio route change failed: {}", e);
            }
        }
        active.session.is_speaker_on = on;
        tracing::info!("Speaker on: {}", on);
        self.record();
        Ok(())
    }

    // ========================================================================
    // ENGINE EVENTS
    // ========================================================================

    pub fn on_engine_event(
        &mut self,
        adapter: &mut EngineAdapter,
        call_id: CallId,
        event: EngineCallState,
        remote: &RemoteParty,
        message: &str,
        now: Instant,
    ) {
        let current = match &self.active {
            None => {
                if event == EngineCallState::IncomingReceived {
                    self.start_incoming(call_id, remote);
                } else {
                    tracing::debug!("Ignoring {:?} for {} without active call", event, call_id);
                }
                return;
            }
            Some(active) if active.session.call_id != call_id => {
                if event == EngineCallState::IncomingReceived {
                    tracing::warn!(
                        "Dropping incoming call {} from {}: {} is still active",
                        call_id,
                        remote.address,
                        active.session.call_id
                    );
                } else {
                    tracing::debug!("Ignoring {:?} for inactive {}", event, call_id);
                }
                return;
            }
            Some(active) => active.session.state.clone(),
        };

        match next_call_state(&current, event, message) {
            Some(next) => self.enter(adapter, next, now),
            None => tracing::debug!("Call event {:?} ignored in state {:?}", event, current),
        }
    }

    /// Zeitgesteuerte Übergänge (Freigabe nach Ended)
    pub fn on_tick(&mut self, adapter: &mut EngineAdapter, now: Instant) {
        let expired = self
            .active
            .as_ref()
            .and_then(|a| a.release_deadline)
            .is_some_and(|deadline| now >= deadline);

        if expired {
            tracing::warn!("Engine did not release call in time; releasing locally");
            self.enter(adapter, CallState::Released, now);
        }
    }

    // ========================================================================
    // PRIVATE METHODS
    // ========================================================================

    fn start_incoming(&mut self, call_id: CallId, remote: &RemoteParty) {
        let descriptor = IncomingCallDescriptor::from_remote(remote);
        tracing::info!(
            "Incoming call {} from {} ({})",
            call_id,
            descriptor.caller_id,
            descriptor.caller_number
        );

        self.active = Some(ActiveCall {
            session: CallSession::new(
                call_id,
                CallDirection::Incoming,
                remote.address.clone(),
                CallState::IncomingReceived,
            ),
            audio: None,
            release_deadline: None,
            terminate_pending: false,
        });
        self.incoming = Some(descriptor);
        self.record();
    }

    /// Zustand betreten und Eintrittsaktionen ausführen
    fn enter(&mut self, adapter: &mut EngineAdapter, next: CallState, now: Instant) {
        let Some(active) = self.active.as_mut() else {
            return;
        };

        tracing::info!(
            "Call {} state: {:?} -> {:?}",
            active.session.call_id,
            active.session.state,
            next
        );
        active.session.state = next.clone();
        if next.requires_media() && active.session.connected_at.is_none() {
            active.session.connected_at = Some(Utc::now());
        }
        if next != CallState::IncomingReceived {
            self.incoming = None;
        }

        if next.is_terminal() {
            self.cleanup(next);
            return;
        }
        self.record();

        match next {
            CallState::Connected | CallState::StreamsRunning | CallState::Paused => {
                if let Err(reason) = self.ensure_audio(adapter) {
                    self.fail(adapter, reason, true, now);
                    return;
                }
            }
            CallState::Ended => {
                if let Some(active) = self.active.as_mut() {
                    if let Some(audio) = active.audio.take() {
                        audio.release();
                    }
                    active.release_deadline = now.checked_add(self.release_grace);
                }
            }
            _ => {}
        }

        let pending = self.active.as_mut().is_some_and(|a| {
            a.session.state != CallState::OutgoingInit
                && std::mem::take(&mut a.terminate_pending)
        });
        if pending && next != CallState::Ended {
            tracing::info!("Applying held terminate");
            if let Err(e) = self.send_terminate(adapter, now) {
                tracing::warn!("Held terminate failed: {}", e);
            }
        }
    }

    /// Audio-Ressource belegen, falls noch nicht geschehen
    fn ensure_audio(&mut self, adapter: &mut EngineAdapter) -> Result<(), String> {
        let Some(active) = self.active.as_mut() else {
            return Ok(());
        };
        if active.audio.is_some() {
            return Ok(());
        }

        let speaker = active.session.is_speaker_on;
        match AudioGuard::acquire(&self.audio, speaker) {
            Ok(guard) => {
                adapter.select_audio_devices(speaker);
                active.audio = Some(guard);
                Ok(())
            }
            Err(e) => {
                tracing::warn!("Audio resource unavailable: {}", e);
                Err(format!("audio unavailable: {}", e))
            }
        }
    }

    fn send_terminate(&mut self, adapter: &mut EngineAdapter, now: Instant) -> Result<(), CallError> {
        let Some(active) = self.active.as_mut() else {
            return Err(CallError::NoActiveCall);
        };
        let call_id = active.session.call_id;

        match adapter.terminate_call(call_id) {
            Ok(()) => {
                tracing::info!("Terminate sent for {}", call_id);
                // Begrenztes Warten auf End/Released
                active.release_deadline = now.checked_add(self.release_grace);
                Ok(())
            }
            Err(e) => {
                tracing::warn!("Terminate of {} failed: {}", call_id, e);
                self.enter(adapter, CallState::Error(format!("terminate failed: {}", e)), now);
                Err(e.into())
            }
        }
    }

    /// Anruf mit Fehler beenden; optional Engine-Call terminieren
    fn fail(&mut self, adapter: &mut EngineAdapter, reason: String, terminate: bool, now: Instant) {
        if terminate {
            if let Some(active) = &self.active {
                let call_id = active.session.call_id;
                if let Err(e) = adapter.terminate_call(call_id) {
                    tracing::warn!("Best-effort terminate of {} failed: {}", call_id, e);
                }
            }
        }
        self.enter(adapter, CallState::Error(reason), now);
    }

    /// Slot räumen; Audio wird bedingungslos freigegeben
    fn cleanup(&mut self, final_state: CallState) {
        if let Some(mut active) = self.active.take() {
            if let Some(audio) = active.audio.take() {
                audio.release();
            }
            tracing::info!(
                "Call {} disposed ({:?})",
                active.session.call_id,
                final_state
            );
        }

        {
            let mut audio = self.audio.lock();
            audio.release_wake_lock();
            audio.deactivate();
        }

        self.incoming = None;
        self.last_state = final_state;
        self.record();
    }

    fn record(&mut self) {
        let view = self.view();
        if self.transitions.last() != Some(&view) {
            self.transitions.push(view);
        }
    }
}

impl std::fmt::Debug for CallController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallController")
            .field("state", self.state())
            .field("holds_audio", &self.holds_audio())
            .field("incoming", &self.incoming)
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AccountConfig, SessionConfig};
    use crate::engine::simulated::{EngineOp, SimulatedEngine, SimulatorHandle};
    use crate::engine::EngineEvent;
    use crate::session::audio::{shared, SimulatedAudioSession};

    struct Fixture {
        calls: CallController,
        adapter: EngineAdapter,
        sim: SimulatorHandle,
        audio: SimulatedAudioSession,
        now: Instant,
    }

    impl Fixture {
        fn new() -> Self {
            let engine = SimulatedEngine::new();
            let sim = engine.handle();
            let mut adapter = EngineAdapter::new(Box::new(engine), &SessionConfig::default());
            adapter.initialize().unwrap();
            adapter
                .configure_account(&AccountConfig::new("alice", "pw", "pbx.example.com"))
                .unwrap();
            adapter.step();
            adapter.step();
            assert!(adapter.is_registered());

            let audio = SimulatedAudioSession::new();
            let calls = CallController::new(shared(audio.clone()), Duration::from_secs(2));
            Self {
                calls,
                adapter,
                sim,
                audio,
                now: Instant::now(),
            }
        }

        fn pump(&mut self) {
            for event in self.adapter.step() {
                if let EngineEvent::CallStateChanged {
                    call_id,
                    state,
                    remote,
                    message,
                } = event
                {
                    self.calls.on_engine_event(
                        &mut self.adapter,
                        call_id,
                        state,
                        &remote,
                        &message,
                        self.now,
                    );
                }
            }
        }

        fn pump_n(&mut self, n: usize) {
            for _ in 0..n {
                self.pump();
            }
        }

        fn states(&mut self) -> Vec<CallState> {
            self.calls
                .drain_transitions()
                .into_iter()
                .map(|v| v.state)
                .collect()
        }

        fn active_call(&self) -> CallId {
            self.calls.view().session.unwrap().call_id
        }
    }

    #[test]
    fn test_mapping_is_deterministic() {
        use EngineCallState as E;
        let events = [
            E::OutgoingInit,
            E::OutgoingProgress,
            E::OutgoingRinging,
            E::Connected,
            E::StreamsRunning,
            E::PausedByRemote,
            E::Resuming,
            E::StreamsRunning,
            E::End,
            E::StreamsRunning,
            E::Released,
            E::Connected,
        ];
        let replay = || {
            events.iter().fold(CallState::Idle, |state, event| {
                next_call_state(&state, *event, "").unwrap_or(state)
            })
        };
        assert_eq!(replay(), CallState::Released);
        assert_eq!(replay(), replay());
    }

    #[test]
    fn test_mapping_table() {
        use EngineCallState as E;
        assert_eq!(
            next_call_state(&CallState::OutgoingInit, E::OutgoingEarlyMedia, ""),
            Some(CallState::Ringing)
        );
        assert_eq!(next_call_state(&CallState::Ringing, E::OutgoingRinging, ""), None);
        assert_eq!(
            next_call_state(&CallState::Connected, E::Error, "488 Not Acceptable Here"),
            Some(CallState::Error("488 Not Acceptable Here".into()))
        );
        assert_eq!(next_call_state(&CallState::Ended, E::Connected, ""), None);
        assert_eq!(next_call_state(&CallState::StreamsRunning, E::OutgoingProgress, ""), None);
        assert_eq!(next_call_state(&CallState::Error("x".into()), E::Released, ""), None);
    }

    #[test]
    fn test_outgoing_call_lifecycle() {
        let mut f = Fixture::new();
        f.calls.originate(&mut f.adapter, "1001").unwrap();
        let call = f.active_call();

        f.pump_n(3);
        assert_eq!(f.calls.state(), &CallState::Ringing);
        assert!(!f.calls.holds_audio());

        f.sim.remote_answer(call);
        f.pump_n(2);
        assert_eq!(f.calls.state(), &CallState::StreamsRunning);
        assert!(f.calls.holds_audio());
        assert!(f.audio.is_active());
        assert!(f.calls.view().session.unwrap().connected_at.is_some());

        f.calls.terminate(&mut f.adapter, f.now).unwrap();
        f.pump();
        assert_eq!(f.calls.state(), &CallState::Ended);
        assert!(!f.calls.holds_audio());
        assert!(!f.audio.holds_wake_lock());

        f.pump();
        assert_eq!(f.calls.state(), &CallState::Released);
        assert!(!f.calls.is_live());
        assert!(!f.audio.is_active());

        assert_eq!(
            f.states(),
            vec![
                CallState::OutgoingInit,
                CallState::Ringing,
                CallState::Connected,
                CallState::StreamsRunning,
                CallState::Ended,
                CallState::Released,
            ]
        );
    }

    #[test]
    fn test_audio_held_only_in_media_states() {
        let mut f = Fixture::new();
        f.calls.originate(&mut f.adapter, "1001").unwrap();
        let call = f.active_call();
        f.sim.remote_answer(call);

        for _ in 0..8 {
            f.pump();
            assert_eq!(f.calls.holds_audio(), f.calls.state().requires_media());
        }
    }

    #[test]
    fn test_release_synthesized_after_grace() {
        let mut f = Fixture::new();
        f.sim.set_auto_release(false);
        f.calls.originate(&mut f.adapter, "1001").unwrap();
        f.pump_n(3);

        f.calls.terminate(&mut f.adapter, f.now).unwrap();
        f.pump_n(3);
        assert_eq!(f.calls.state(), &CallState::Ended);

        f.calls.on_tick(&mut f.adapter, f.now + Duration::from_millis(1999));
        assert_eq!(f.calls.state(), &CallState::Ended);
        f.calls.on_tick(&mut f.adapter, f.now + Duration::from_secs(2));
        assert_eq!(f.calls.state(), &CallState::Released);
        assert!(!f.calls.is_live());
    }

    #[test]
    fn test_terminate_held_during_outgoing_init() {
        let mut f = Fixture::new();
        f.calls.originate(&mut f.adapter, "1001").unwrap();
        let call = f.active_call();

        f.calls.terminate(&mut f.adapter, f.now).unwrap();
        assert!(!f.sim.ops().contains(&EngineOp::Terminate(call)));

        // OutgoingInit ändert nichts, OutgoingProgress löst das Terminate aus
        f.pump();
        assert!(!f.sim.ops().contains(&EngineOp::Terminate(call)));
        f.pump();
        assert!(f.sim.ops().contains(&EngineOp::Terminate(call)));

        f.pump_n(4);
        assert_eq!(f.calls.state(), &CallState::Released);
    }

    #[test]
    fn test_terminate_failure_still_cleans_up() {
        let mut f = Fixture::new();
        f.calls.originate(&mut f.adapter, "1001").unwrap();
        let call = f.active_call();
        f.sim.remote_answer(call);
        f.pump_n(3);
        assert!(f.calls.holds_audio());

        f.sim.fail_next("terminate");
        let result = f.calls.terminate(&mut f.adapter, f.now);
        assert!(matches!(result, Err(CallError::Engine(_))));
        assert!(matches!(f.calls.state(), CallState::Error(_)));
        assert!(!f.calls.is_live());
        assert!(!f.audio.is_active());

        // Slot ist sofort wieder nutzbar
        assert!(f.calls.originate(&mut f.adapter, "1002").is_ok());
    }

    #[test]
    fn test_incoming_descriptor_lifecycle() {
        let mut f = Fixture::new();
        f.sim
            .incoming_call("sip:0301234@pbx.example.com", Some("Hausverwaltung"));
        f.pump();

        let view = f.calls.view();
        assert_eq!(view.state, CallState::IncomingReceived);
        assert_eq!(
            view.incoming,
            Some(IncomingCallDescriptor {
                caller_id: "Hausverwaltung".into(),
                caller_number: "0301234".into(),
            })
        );

        f.calls.accept(&mut f.adapter, f.now).unwrap();
        f.pump();
        assert_eq!(f.calls.state(), &CallState::Connected);
        assert!(f.calls.view().incoming.is_none());
    }

    #[test]
    fn test_second_incoming_is_dropped() {
        let mut f = Fixture::new();
        let first = f.sim.incoming_call("sip:100@pbx.example.com", None);
        f.pump();
        f.sim.incoming_call("sip:200@pbx.example.com", None);
        f.pump();

        let view = f.calls.view();
        assert_eq!(view.session.unwrap().call_id, first);
        assert_eq!(view.incoming.unwrap().caller_number, "100");
        assert_eq!(view.state, CallState::IncomingReceived);
    }

    #[test]
    fn test_accept_without_incoming() {
        let mut f = Fixture::new();
        assert_eq!(
            f.calls.accept(&mut f.adapter, f.now),
            Err(CallError::NoIncomingCall)
        );
        assert!(!f.sim.ops().iter().any(|op| matches!(op, EngineOp::Accept(_))));
    }

    #[test]
    fn test_audio_failure_terminates_call() {
        let mut f = Fixture::new();
        let call = f.sim.incoming_call("sip:100@pbx.example.com", None);
        f.pump();
        f.audio.fail_next_activation("session busy");

        f.calls.accept(&mut f.adapter, f.now).unwrap();
        f.pump();

        assert!(matches!(f.calls.state(), CallState::Error(reason) if reason.contains("session busy")));
        assert!(f.sim.ops().contains(&EngineOp::Terminate(call)));
        assert!(!f.calls.is_live());

        // Spätere Engine-Events des alten Calls ändern nichts mehr
        f.pump_n(3);
        assert!(matches!(f.calls.state(), CallState::Error(_)));
        assert!(f.calls.originate(&mut f.adapter, "1001").is_ok());
    }

    #[test]
    fn test_mute_is_idempotent() {
        let mut f = Fixture::new();
        assert_eq!(
            f.calls.set_muted(&mut f.adapter, true),
            Err(CallError::NoActiveCall)
        );

        f.calls.originate(&mut f.adapter, "1001").unwrap();
        f.states();

        f.calls.set_muted(&mut f.adapter, true).unwrap();
        f.calls.set_muted(&mut f.adapter, true).unwrap();
        assert_eq!(f.calls.drain_transitions().len(), 1);
        assert!(f.calls.view().is_muted());
        assert!(!f.sim.mic_enabled());

        let mic_ops = f
            .sim
            .ops()
            .iter()
            .filter(|op| matches!(op, EngineOp::SetMicEnabled(_)))
            .count();
        assert_eq!(mic_ops, 1);
    }

    #[test]
    fn test_speaker_applies_to_audio_route() {
        let mut f = Fixture::new();
        f.calls.originate(&mut f.adapter, "1001").unwrap();
        let call = f.active_call();
        f.sim.remote_answer(call);
        f.pump_n(3);

        f.calls.set_speaker(&mut f.adapter, true).unwrap();
        assert!(f.audio.is_speaker_on());
        assert_eq!(f.sim.selected_devices().1, Some("speaker".into()));
        assert!(f.calls.view().is_speaker_on());
    }

    fn connected_call(f: &mut Fixture) -> CallId {
        f.calls.originate(&mut f.adapter, "1001").unwrap();
        let call = f.active_call();
        f.pump_n(3);
        f.sim.remote_answer(call);
        f.pump_n(2);
        assert_eq!(f.calls.state(), &CallState::StreamsRunning);
        assert!(f.audio.is_active());
        call
    }

    #[test]
    fn test_remote_hangup_releases_audio() {
        let mut f = Fixture::new();
        let call = connected_call(&mut f);

        f.sim.remote_hangup(call);
        f.pump();
        assert_eq!(f.calls.state(), &CallState::Ended);
        assert!(f.calls.is_live());
        assert!(!f.calls.holds_audio());
        assert!(!f.audio.is_active());
        assert!(!f.audio.holds_wake_lock());

        f.pump();
        assert_eq!(f.calls.state(), &CallState::Released);
        assert!(!f.calls.is_live());
        assert!(f.calls.view().session.is_none());
    }

    #[test]
    fn test_engine_error_cleans_up() {
        let mut f = Fixture::new();
        let call = connected_call(&mut f);

        f.sim.fail_call(call, "503 Service Unavailable");
        f.pump();
        assert_eq!(
            f.calls.state(),
            &CallState::Error("503 Service Unavailable".into())
        );
        assert!(!f.calls.is_live());
        assert!(!f.audio.is_active());

        // Nachzügler-Released des alten Calls
        f.pump();
        assert_eq!(
            f.calls.state(),
            &CallState::Error("503 Service Unavailable".into())
        );
        assert!(f.calls.originate(&mut f.adapter, "1002").is_ok());
    }

    #[test]
    fn test_ringing_incoming_ended_by_engine() {
        let mut f = Fixture::new();
        let call = f.sim.incoming_call("sip:100@pbx.example.com", None);
        f.pump();
        assert!(f.calls.view().incoming.is_some());

        f.sim.remote_hangup(call);
        f.pump();
        let view = f.calls.view();
        assert_eq!(view.state, CallState::Ended);
        assert!(view.incoming.is_none());
        assert_eq!(f.calls.accept(&mut f.adapter, f.now), Err(CallError::NoIncomingCall));

        f.pump();
        assert_eq!(f.calls.state(), &CallState::Released);
        assert!(!f.calls.is_live());
    }

    #[test]
    fn test_abort_releases_slot_and_audio() {
        let mut f = Fixture::new();
        let call = connected_call(&mut f);

        f.calls.abort(&mut f.adapter, "shutdown", f.now);
        assert!(f.sim.ops().contains(&EngineOp::Terminate(call)));
        assert_eq!(f.calls.state(), &CallState::Error("shutdown".into()));
        assert!(!f.calls.is_live());
        assert!(!f.audio.is_active());

        // Ohne Anruf passiert nichts
        let ops = f.sim.ops().len();
        f.calls.abort(&mut f.adapter, "shutdown", f.now);
        assert_eq!(f.sim.ops().len(), ops);
    }

    #[test]
    fn test_huge_release_grace_does_not_overflow() {
        let mut f = Fixture::new();
        f.calls = CallController::new(shared(f.audio.clone()), Duration::MAX);
        f.sim.set_auto_release(false);
        f.calls.originate(&mut f.adapter, "1001").unwrap();
        f.pump_n(3);

        f.calls.terminate(&mut f.adapter, f.now).unwrap();
        f.pump();
        assert_eq!(f.calls.state(), &CallState::Ended);

        f.calls.on_tick(&mut f.adapter, f.now + Duration::from_secs(3600));
        assert_eq!(f.calls.state(), &CallState::Ended);
    }
}
