//! Session Manager
//!
//! Handle der UI auf den Dispatcher-Thread. Befehle werden in die Queue
//! gestellt und asynchron beantwortet; Zustand wird über Snapshot und
//! Abonnement gelesen.

use crate::config::{AccountConfig, SessionConfig};
use crate::dispatcher::{Command, CommandError, Dispatcher, Responder};
use crate::engine::{EngineError, TelephonyEngine};
use crate::session::SharedAudioSession;
use crate::state::{StatePublisher, StateSnapshot, StateSubscription};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::JoinHandle;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum ManagerError {
    #[error("Failed to spawn dispatcher thread: {0}")]
    Spawn(String),

    #[error("Failed to build dispatcher runtime: {0}")]
    Runtime(String),

    #[error("Engine initialization failed: {0}")]
    Init(#[from] EngineError),

    #[error("Dispatcher stopped unexpectedly")]
    Stopped,
}

// ============================================================================
// SESSION MANAGER
// ============================================================================

/// Thread-sicheres Handle; Klone teilen sich denselben Dispatcher
#[derive(Clone)]
pub struct SessionManager {
    commands: mpsc::Sender<Command>,
    publisher: Arc<StatePublisher>,
    thread: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl SessionManager {
    /// Startet den Dispatcher-Thread und initialisiert die Engine dort
    ///
    /// Kehrt erst nach der Initialisierung zurück. Ein Fehler wird genau
    /// einmal gemeldet, es gibt keinen erneuten Versuch.
    pub async fn start(
        config: SessionConfig,
        engine: Box<dyn TelephonyEngine + Send>,
        audio: SharedAudioSession,
    ) -> Result<Self, ManagerError> {
        let publisher = Arc::new(StatePublisher::new(config.event_capacity));
        let (tx, rx) = mpsc::channel(config.command_queue_capacity.max(1));
        let (ready_tx, ready_rx) = oneshot::channel::<Result<(), ManagerError>>();

        let thread_publisher = Arc::clone(&publisher);
        let handle = std::thread::Builder::new()
            .name("sip-dispatcher".to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        let _ = ready_tx.send(Err(ManagerError::Runtime(e.to_string())));
                        return;
                    }
                };

                runtime.block_on(async move {
                    let dispatcher =
                        match Dispatcher::start(&config, engine, audio, thread_publisher) {
                            Ok(dispatcher) => dispatcher,
                            Err(e) => {
                                tracing::error!("Engine initialization failed: {}", e);
                                let _ = ready_tx.send(Err(e.into()));
                                return;
                            }
                        };
                    let _ = ready_tx.send(Ok(()));
                    dispatcher.run(rx).await;
                });
            })
            .map_err(|e| ManagerError::Spawn(e.to_string()))?;

        ready_rx.await.map_err(|_| ManagerError::Stopped)??;
        tracing::info!("Session manager started");

        Ok(Self {
            commands: tx,
            publisher,
            thread: Arc::new(Mutex::new(Some(handle))),
        })
    }

    // ========================================================================
    // STATE
    // ========================================================================

    pub fn snapshot(&self) -> StateSnapshot {
        self.publisher.snapshot()
    }

    /// Aktueller Snapshot plus alle folgenden Übergänge
    pub fn subscribe(&self) -> StateSubscription {
        self.publisher.subscribe()
    }

    // ========================================================================
    // REGISTRATION
    // ========================================================================

    /// Account setzen; leerer Account meldet ab
    pub async fn configure_account(&self, account: AccountConfig) -> Result<(), CommandError> {
        self.request(|respond| Command::ConfigureAccount { account, respond })
            .await
    }

    pub async fn register(&self) -> Result<(), CommandError> {
        self.request(|respond| Command::Register { respond }).await
    }

    pub async fn unregister(&self) -> Result<(), CommandError> {
        self.request(|respond| Command::Unregister { respond }).await
    }

    pub async fn refresh_registration(&self) -> Result<(), CommandError> {
        self.request(|respond| Command::RefreshRegistration { respond })
            .await
    }

    // ========================================================================
    // CALLS
    // ========================================================================

    /// Ausgehender Anruf
    ///
    /// Läuft bereits ein Anruf, wird er beendet und dieser Aufruf kehrt erst
    /// zurück, wenn der neue Anruf an die Engine übergeben wurde.
    pub async fn originate_call(&self, address: impl Into<String>) -> Result<(), CommandError> {
        let address = address.into();
        self.request(|respond| Command::OriginateCall { address, respond })
            .await
    }

    pub async fn accept_call(&self, session_id: Uuid) -> Result<(), CommandError> {
        self.request(|respond| Command::AcceptCall {
            session_id,
            respond,
        })
        .await
    }

    pub async fn terminate_call(&self, session_id: Uuid) -> Result<(), CommandError> {
        self.request(|respond| Command::TerminateCall {
            session_id,
            respond,
        })
        .await
    }

    pub async fn toggle_mute(&self, muted: bool) -> Result<(), CommandError> {
        self.request(|respond| Command::ToggleMute { muted, respond })
            .await
    }

    pub async fn toggle_speaker(&self, on: bool) -> Result<(), CommandError> {
        self.request(|respond| Command::ToggleSpeaker { on, respond })
            .await
    }

    /// Engine stoppen und auf das Ende des Dispatcher-Threads warten
    pub async fn shutdown(&self) -> Result<(), CommandError> {
        let result = self.request(|respond| Command::Shutdown { respond }).await;

        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            match tokio::task::spawn_blocking(move || handle.join()).await {
                Ok(Ok(())) => tracing::info!("Session manager stopped"),
                _ => tracing::warn!("Dispatcher thread did not exit cleanly"),
            }
        }
        result
    }

    pub fn is_running(&self) -> bool {
        !self.commands.is_closed()
    }

    async fn request(
        &self,
        build: impl FnOnce(Responder) -> Command,
    ) -> Result<(), CommandError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(build(tx))
            .await
            .map_err(|_| CommandError::Unavailable)?;
        rx.await.map_err(|_| CommandError::Unavailable)?
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("running", &self.is_running())
            .field("subscribers", &self.publisher.subscriber_count())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::simulated::{SimulatedEngine, SimulatorHandle};
    use crate::session::audio::{shared, SimulatedAudioSession};
    use crate::session::{CallState, RegistrationState};
    use std::time::Duration;

    fn fast_config() -> SessionConfig {
        SessionConfig {
            poll_interval: Duration::from_millis(5),
            registration_timeout: Duration::from_millis(300),
            release_grace: Duration::from_millis(200),
            ..SessionConfig::default()
        }
    }

    async fn start() -> (SessionManager, SimulatorHandle, SimulatedAudioSession) {
        let engine = SimulatedEngine::new();
        let sim = engine.handle();
        let audio = SimulatedAudioSession::new();
        let manager = SessionManager::start(fast_config(), Box::new(engine), shared(audio.clone()))
            .await
            .unwrap();
        (manager, sim, audio)
    }

    async fn wait_for(
        sub: &mut StateSubscription,
        predicate: impl Fn(&StateSnapshot) -> bool,
    ) -> StateSnapshot {
        if predicate(sub.current()) {
            return sub.current().clone();
        }
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match sub.next().await {
                    Some(snapshot) if predicate(&snapshot) => return snapshot,
                    Some(_) => continue,
                    None => panic!("manager stopped"),
                }
            }
        })
        .await
        .expect("state not reached in time")
    }

    #[tokio::test]
    async fn test_start_failure_reported_once() {
        let engine = SimulatedEngine::new();
        engine.handle().fail_next("start");
        let result = SessionManager::start(
            fast_config(),
            Box::new(engine),
            shared(SimulatedAudioSession::new()),
        )
        .await;
        assert!(matches!(result, Err(ManagerError::Init(_))));
    }

    #[tokio::test]
    async fn test_register_and_call() {
        let (manager, sim, audio) = start().await;
        let mut sub = manager.subscribe();

        manager
            .configure_account(AccountConfig::new("alice", "pw", "pbx.example.com"))
            .await
            .unwrap();
        wait_for(&mut sub, |s| s.registration == RegistrationState::Ok).await;

        manager.originate_call("1001").await.unwrap();
        let ringing = wait_for(&mut sub, |s| s.call == CallState::Ringing).await;
        sim.remote_answer(ringing.call_id.unwrap());
        wait_for(&mut sub, |s| s.call == CallState::StreamsRunning).await;
        assert!(audio.is_active());

        manager.toggle_speaker(true).await.unwrap();
        assert!(manager.snapshot().is_speaker_on);

        manager
            .terminate_call(ringing.session_id.unwrap())
            .await
            .unwrap();
        wait_for(&mut sub, |s| s.call == CallState::Released).await;
        assert!(!audio.is_active());

        manager.shutdown().await.unwrap();
        assert!(!sim.is_started());
    }

    #[tokio::test]
    async fn test_registration_timeout() {
        let (manager, sim, _) = start().await;
        sim.set_registrar(crate::engine::simulated::RegistrarBehavior::Unreachable);
        let mut sub = manager.subscribe();

        manager
            .configure_account(AccountConfig::new("alice", "pw", "unreachable.invalid"))
            .await
            .unwrap();
        let failed = wait_for(&mut sub, |s| {
            matches!(s.registration, RegistrationState::Failed(_))
        })
        .await;
        assert_eq!(failed.registration, RegistrationState::Failed("timeout".into()));

        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_commands_after_shutdown() {
        let (manager, _, _) = start().await;
        let other = manager.clone();
        manager.shutdown().await.unwrap();

        assert_eq!(other.register().await, Err(CommandError::Unavailable));
        assert!(!other.is_running());
    }
}
