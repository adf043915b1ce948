//! Event Dispatcher
//!
//! Einziger Schreiber aller Session-Zustände. Läuft auf einem eigenen Thread:
//! ein Intervall treibt `step()` der Engine, eine Queue liefert die Befehle
//! der UI. Events werden in Engine-Reihenfolge angewendet und nach jedem
//! Übergang wird ein Snapshot veröffentlicht.

use crate::config::{AccountConfig, SessionConfig};
use crate::engine::{EngineAdapter, EngineError, EngineEvent, TelephonyEngine};
use crate::session::{
    CallController, CallError, RegistrationError, RegistrationSession, SharedAudioSession,
};
use crate::state::{StatePublisher, StateSnapshot};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Fehler eines UI-Befehls
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("Engine not initialized")]
    NotInitialized,

    #[error("Not registered")]
    NotRegistered,

    #[error("No account configured")]
    NoAccount,

    #[error("No incoming call to accept")]
    NoIncomingCall,

    #[error("No active call")]
    NoActiveCall,

    #[error("Already in a call")]
    Busy,

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Superseded by a newer call request")]
    Superseded,

    #[error("Session manager is not running")]
    Unavailable,

    #[error(transparent)]
    Engine(EngineError),
}

impl From<EngineError> for CommandError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::NotInitialized => CommandError::NotInitialized,
            EngineError::NotRegistered => CommandError::NotRegistered,
            EngineError::InvalidAddress(address) => CommandError::InvalidAddress(address),
            other => CommandError::Engine(other),
        }
    }
}

impl From<CallError> for CommandError {
    fn from(e: CallError) -> Self {
        match e {
            CallError::Busy => CommandError::Busy,
            CallError::NoActiveCall => CommandError::NoActiveCall,
            CallError::NoIncomingCall => CommandError::NoIncomingCall,
            CallError::Engine(e) => e.into(),
        }
    }
}

impl From<RegistrationError> for CommandError {
    fn from(e: RegistrationError) -> Self {
        match e {
            RegistrationError::NoAccount => CommandError::NoAccount,
            RegistrationError::Engine(e) => e.into(),
        }
    }
}

// ============================================================================
// COMMANDS
// ============================================================================

pub type Responder = oneshot::Sender<Result<(), CommandError>>;

/// Befehle der UI an den Dispatcher
#[derive(Debug)]
pub enum Command {
    ConfigureAccount {
        account: AccountConfig,
        respond: Responder,
    },
    Register {
        respond: Responder,
    },
    Unregister {
        respond: Responder,
    },
    RefreshRegistration {
        respond: Responder,
    },
    OriginateCall {
        address: String,
        respond: Responder,
    },
    AcceptCall {
        session_id: Uuid,
        respond: Responder,
    },
    TerminateCall {
        session_id: Uuid,
        respond: Responder,
    },
    ToggleMute {
        muted: bool,
        respond: Responder,
    },
    ToggleSpeaker {
        on: bool,
        respond: Responder,
    },
    Shutdown {
        respond: Responder,
    },
}

/// Ausgehender Anruf, der auf die Freigabe des Slots wartet
#[derive(Debug)]
struct PendingOriginate {
    address: String,
    respond: Responder,
}

// ============================================================================
// DISPATCHER
// ============================================================================

pub struct Dispatcher {
    adapter: EngineAdapter,
    registration: RegistrationSession,
    calls: CallController,
    publisher: Arc<StatePublisher>,
    pending_originate: Option<PendingOriginate>,
    poll_interval: Duration,
}

impl Dispatcher {
    /// Erstellt den Dispatcher und initialisiert die Engine
    pub fn start(
        config: &SessionConfig,
        engine: Box<dyn TelephonyEngine + Send>,
        audio: SharedAudioSession,
        publisher: Arc<StatePublisher>,
    ) -> Result<Self, EngineError> {
        let mut adapter = EngineAdapter::new(engine, config);
        adapter.initialize()?;

        Ok(Self {
            adapter,
            registration: RegistrationSession::new(config.registration_timeout),
            calls: CallController::new(audio, config.release_grace),
            publisher,
            pending_originate: None,
            poll_interval: config.poll_interval.max(Duration::from_millis(1)),
        })
    }

    /// Hauptschleife; endet mit `Shutdown` oder wenn alle Handles weg sind
    pub async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!("Dispatcher running (poll interval {:?})", self.poll_interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.poll(Instant::now());
                }
                command = commands.recv() => match command {
                    Some(command) => {
                        if !self.handle_command(command, Instant::now()) {
                            break;
                        }
                    }
                    None => {
                        tracing::info!("All session handles dropped");
                        self.shutdown(Instant::now());
                        break;
                    }
                }
            }
        }

        tracing::info!("Dispatcher stopped");
    }

    /// Eine Iteration: Engine-Events anwenden, danach Timer prüfen
    pub fn poll(&mut self, now: Instant) {
        for event in self.adapter.step() {
            self.apply_event(event, now);
            self.publish();
            self.issue_pending_originate();
        }

        self.registration.on_tick(&mut self.adapter, now);
        self.calls.on_tick(&mut self.adapter, now);
        self.publish();
        self.issue_pending_originate();
    }

    /// Befehl ausführen; `false` beendet die Schleife
    pub fn handle_command(&mut self, command: Command, now: Instant) -> bool {
        match command {
            Command::ConfigureAccount { account, respond } => {
                let result = self.configure_account(account, now);
                self.respond(respond, result);
            }
            Command::Register { respond } => {
                let result = self
                    .registration
                    .register(&mut self.adapter, now)
                    .map_err(CommandError::from);
                self.respond(respond, result);
            }
            Command::Unregister { respond } => {
                let result = self
                    .registration
                    .unregister(&mut self.adapter, now)
                    .map_err(CommandError::from);
                self.respond(respond, result);
            }
            Command::RefreshRegistration { respond } => {
                let result = self
                    .registration
                    .refresh(&mut self.adapter)
                    .map_err(CommandError::from);
                self.respond(respond, result);
            }
            Command::OriginateCall { address, respond } => {
                self.originate(address, respond, now);
                self.publish();
            }
            Command::AcceptCall {
                session_id,
                respond,
            } => {
                let result = if self.is_current_session(session_id) {
                    self.calls
                        .accept(&mut self.adapter, now)
                        .map_err(CommandError::from)
                } else {
                    Err(CommandError::NoIncomingCall)
                };
                self.respond(respond, result);
            }
            Command::TerminateCall {
                session_id,
                respond,
            } => {
                let result = if self.is_current_session(session_id) {
                    self.calls
                        .terminate(&mut self.adapter, now)
                        .map_err(CommandError::from)
                } else {
                    Err(CommandError::NoActiveCall)
                };
                self.respond(respond, result);
                self.issue_pending_originate();
            }
            Command::ToggleMute { muted, respond } => {
                let result = self
                    .calls
                    .set_muted(&mut self.adapter, muted)
                    .map_err(CommandError::from);
                self.respond(respond, result);
            }
            Command::ToggleSpeaker { on, respond } => {
                let result = self
                    .calls
                    .set_speaker(&mut self.adapter, on)
                    .map_err(CommandError::from);
                self.respond(respond, result);
            }
            Command::Shutdown { respond } => {
                self.shutdown(now);
                let _ = respond.send(Ok(()));
                return false;
            }
        }
        true
    }

    /// Engine stoppen; ein laufender Anruf wird best-effort beendet
    pub fn shutdown(&mut self, now: Instant) {
        if let Some(pending) = self.pending_originate.take() {
            let _ = pending.respond.send(Err(CommandError::Unavailable));
        }
        self.calls.abort(&mut self.adapter, "shutdown", now);
        self.adapter.shutdown();
        self.publish();
    }

    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot::new(self.registration.state(), &self.calls.view())
    }

    // ========================================================================
    // PRIVATE METHODS
    // ========================================================================

    fn configure_account(
        &mut self,
        account: AccountConfig,
        now: Instant,
    ) -> Result<(), CommandError> {
        if !self.adapter.is_initialized() {
            return Err(CommandError::NotInitialized);
        }
        self.registration
            .configure(account, &mut self.adapter, now)
            .map_err(CommandError::from)
    }

    fn originate(&mut self, address: String, respond: Responder, now: Instant) {
        let validation = if !self.adapter.is_initialized() {
            Err(CommandError::NotInitialized)
        } else if address.trim().is_empty() {
            Err(CommandError::InvalidAddress(address.clone()))
        } else if !self.registration.state().is_registered() {
            Err(CommandError::NotRegistered)
        } else {
            Ok(())
        };
        if let Err(e) = validation {
            tracing::warn!("Originate to '{}' rejected: {}", address, e);
            let _ = respond.send(Err(e));
            return;
        }

        if !self.calls.is_live() {
            let result = self
                .calls
                .originate(&mut self.adapter, &address)
                .map_err(CommandError::from);
            let _ = respond.send(result);
            return;
        }

        // Slot belegt: alten Anruf beenden, neuen erst nach Released absetzen
        match self.pending_originate.replace(PendingOriginate { address, respond }) {
            Some(older) => {
                tracing::info!("Queued call to {} superseded", older.address);
                let _ = older.respond.send(Err(CommandError::Superseded));
            }
            None => {
                tracing::info!("Terminating active call before new outgoing call");
                self.calls.terminate_for_replacement(&mut self.adapter, now);
            }
        }
    }

    fn issue_pending_originate(&mut self) {
        if self.calls.is_live() {
            return;
        }
        let Some(pending) = self.pending_originate.take() else {
            return;
        };

        tracing::info!("Slot free, issuing queued call to {}", pending.address);
        let result = if self.registration.state().is_registered() {
            self.calls
                .originate(&mut self.adapter, &pending.address)
                .map_err(CommandError::from)
        } else {
            Err(CommandError::NotRegistered)
        };
        if let Err(e) = &result {
            tracing::warn!("Queued call to {} failed: {}", pending.address, e);
        }
        let _ = pending.respond.send(result);
        self.publish();
    }

    fn apply_event(&mut self, event: EngineEvent, now: Instant) {
        match event {
            EngineEvent::RegistrationStateChanged { state, message } => {
                self.registration.on_engine_event(state, &message, now);
            }
            EngineEvent::CallStateChanged {
                call_id,
                state,
                remote,
                message,
            } => {
                self.calls
                    .on_engine_event(&mut self.adapter, call_id, state, &remote, &message, now);
            }
        }
    }

    fn is_current_session(&self, session_id: Uuid) -> bool {
        self.calls
            .view()
            .session
            .is_some_and(|s| s.id == session_id)
    }

    fn respond(&mut self, respond: Responder, result: Result<(), CommandError>) {
        if let Err(e) = &result {
            tracing::warn!("Command failed: {}", e);
        }
        self.publish();
        let _ = respond.send(result);
    }

    /// Jeden Call-Übergang einzeln veröffentlichen, dann den aktuellen Stand
    fn publish(&mut self) {
        let registration = self.registration.state().clone();
        for view in self.calls.drain_transitions() {
            self.publisher
                .publish(StateSnapshot::new(&registration, &view));
        }
        self.publisher
            .publish(StateSnapshot::new(&registration, &self.calls.view()));
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("registration", self.registration.state())
            .field("call", self.calls.state())
            .field("pending_originate", &self.pending_originate.is_some())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
