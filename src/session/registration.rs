//! Registration Session
//!
//! Hält den aktuellen SIP-Account und den Registrierungs-Status. Der Status
//! wird ausschließlich durch Engine-Events, den lokalen Timeout oder eine
//! explizite Abmeldung verändert.

use crate::config::AccountConfig;
use crate::engine::{EngineAdapter, EngineError, EngineRegistrationState};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use thiserror::Error;

// ============================================================================
// REGISTRATION STATE
// ============================================================================

/// Registrierungs-Status des Accounts
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum RegistrationState {
    /// Noch nie konfiguriert
    #[default]
    None,
    /// REGISTER unterwegs
    Progress,
    /// Registriert
    Ok,
    /// Fehlgeschlagen (Grund vom Server oder "timeout")
    Failed(String),
    /// Abgemeldet
    Cleared,
}

impl RegistrationState {
    pub fn is_registered(&self) -> bool {
        matches!(self, RegistrationState::Ok)
    }
}

/// Übergangstabelle für Engine-Events
///
/// Reine Funktion; `None` bedeutet "Event ändert nichts". Events ohne
/// laufenden Registrierungsversuch (None/Cleared/Failed) sind veraltet.
/// Ein Refresh der Engine (`Progress` während `Ok`) lässt die Registrierung
/// bestehen, Anrufe bleiben möglich; erst `Failed` oder `Cleared` beenden sie.
pub fn next_registration_state(
    current: &RegistrationState,
    event: EngineRegistrationState,
    message: &str,
) -> Option<RegistrationState> {
    use EngineRegistrationState as E;
    use RegistrationState as S;

    match (current, event) {
        (S::Progress, E::Ok) => Some(S::Ok),
        (S::Progress | S::Ok, E::Failed) => Some(S::Failed(failure_reason(message))),
        (S::Ok, E::Cleared) => Some(S::Cleared),
        _ => None,
    }
}

fn failure_reason(message: &str) -> String {
    if message.trim().is_empty() {
        "registration failed".to_string()
    } else {
        message.trim().to_string()
    }
}

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistrationError {
    #[error("No account configured")]
    NoAccount,

    #[error(transparent)]
    Engine(#[from] EngineError),
}

// ============================================================================
// REGISTRATION SESSION
// ============================================================================

#[derive(Debug)]
pub struct RegistrationSession {
    account: Option<AccountConfig>,
    state: RegistrationState,
    timeout: Duration,
    deadline: Option<Instant>,
}

impl RegistrationSession {
    pub fn new(timeout: Duration) -> Self {
        Self {
            account: None,
            state: RegistrationState::None,
            timeout,
            deadline: None,
        }
    }

    pub fn state(&self) -> &RegistrationState {
        &self.state
    }

    pub fn account(&self) -> Option<&AccountConfig> {
        self.account.as_ref()
    }

    /// Account ersetzen; leerer Account meldet ab
    pub fn configure(
        &mut self,
        account: AccountConfig,
        adapter: &mut EngineAdapter,
        now: Instant,
    ) -> Result<(), RegistrationError> {
        adapter.configure_account(&account)?;

        if account.is_empty() {
            self.account = None;
            self.set_state(RegistrationState::Cleared, now);
        } else {
            self.account = Some(account);
            self.begin_attempt(now);
        }
        Ok(())
    }

    /// Erneuter Registrierungsversuch mit dem gespeicherten Account
    pub fn register(
        &mut self,
        adapter: &mut EngineAdapter,
        now: Instant,
    ) -> Result<(), RegistrationError> {
        if self.account.is_none() {
            return Err(RegistrationError::NoAccount);
        }
        if self.state == RegistrationState::Progress {
            tracing::debug!("Registration already in progress");
            return Ok(());
        }
        adapter.set_registration_enabled(true)?;
        self.begin_attempt(now);
        Ok(())
    }

    /// Abmelden; der Account bleibt für einen späteren `register()` erhalten
    pub fn unregister(
        &mut self,
        adapter: &mut EngineAdapter,
        now: Instant,
    ) -> Result<(), RegistrationError> {
        if self.account.is_some() {
            adapter.set_registration_enabled(false)?;
        }
        self.set_state(RegistrationState::Cleared, now);
        Ok(())
    }

    /// REGISTER auffrischen; kein Effekt solange ein Versuch läuft
    pub fn refresh(&mut self, adapter: &mut EngineAdapter) -> Result<(), RegistrationError> {
        if self.account.is_none() {
            return Err(RegistrationError::NoAccount);
        }
        if self.state == RegistrationState::Progress {
            tracing::debug!("Refresh skipped, registration in progress");
            return Ok(());
        }
        adapter.refresh_registration()?;
        Ok(())
    }

    /// Engine-Event anwenden; `true` wenn sich der Status geändert hat
    pub fn on_engine_event(
        &mut self,
        event: EngineRegistrationState,
        message: &str,
        now: Instant,
    ) -> bool {
        match next_registration_state(&self.state, event, message) {
            Some(next) => self.set_state(next, now),
            None => {
                tracing::debug!(
                    "Ignoring registration event {:?} in state {:?}",
                    event,
                    self.state
                );
                false
            }
        }
    }

    /// Timeout prüfen; `true` wenn ein Timeout ausgelöst wurde
    pub fn on_tick(&mut self, adapter: &mut EngineAdapter, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if now >= deadline && self.state == RegistrationState::Progress => {}
            _ => return false,
        }

        tracing::warn!("Registration timed out after {:?}", self.timeout);
        self.set_state(RegistrationState::Failed("timeout".to_string()), now);

        if let Err(e) = adapter.set_registration_enabled(false) {
            tracing::warn!("Failed to unregister after timeout: {}", e);
        }
        true
    }

    /// Neuer Versuch: Timeout startet immer neu, auch aus `Progress`
    fn begin_attempt(&mut self, now: Instant) {
        if !self.set_state(RegistrationState::Progress, now) {
            self.deadline = self.deadline_from(now);
        }
    }

    fn deadline_from(&self, now: Instant) -> Option<Instant> {
        let deadline = now.checked_add(self.timeout);
        if deadline.is_none() {
            tracing::warn!("Registration timeout {:?} out of range, not armed", self.timeout);
        }
        deadline
    }

    fn set_state(&mut self, next: RegistrationState, now: Instant) -> bool {
        if next == self.state {
            return false;
        }

        self.deadline = if next == RegistrationState::Progress {
            self.deadline_from(now)
        } else {
            None
        };

        tracing::info!("Registration state: {:?} -> {:?}", self.state, next);
        self.state = next;
        true
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::engine::simulated::{RegistrarBehavior, SimulatedEngine, SimulatorHandle};
    use crate::engine::EngineEvent;

    fn setup() -> (RegistrationSession, EngineAdapter, SimulatorHandle) {
        let engine = SimulatedEngine::new();
        let sim = engine.handle();
        let mut adapter = EngineAdapter::new(Box::new(engine), &SessionConfig::default());
        adapter.initialize().unwrap();
        (RegistrationSession::new(Duration::from_secs(30)), adapter, sim)
    }

    fn pump(session: &mut RegistrationSession, adapter: &mut EngineAdapter, now: Instant) {
        for event in adapter.step() {
            if let EngineEvent::RegistrationStateChanged { state, message } = event {
                session.on_engine_event(state, &message, now);
            }
        }
    }

    #[test]
    fn test_transition_table() {
        use EngineRegistrationState as E;
        use RegistrationState as S;

        assert_eq!(next_registration_state(&S::Progress, E::Ok, ""), Some(S::Ok));
        assert_eq!(
            next_registration_state(&S::Progress, E::Failed, "401 Unauthorized"),
            Some(S::Failed("401 Unauthorized".into()))
        );
        assert_eq!(next_registration_state(&S::Ok, E::Cleared, ""), Some(S::Cleared));
        assert_eq!(next_registration_state(&S::Ok, E::Progress, ""), None);
        assert_eq!(next_registration_state(&S::Progress, E::Cleared, ""), None);
        assert_eq!(next_registration_state(&S::Cleared, E::Ok, ""), None);
        assert_eq!(
            next_registration_state(&S::Failed("timeout".into()), E::Cleared, ""),
            None
        );
    }

    #[test]
    fn test_successful_registration() {
        let (mut session, mut adapter, _) = setup();
        let now = Instant::now();

        session
            .configure(AccountConfig::new("alice", "pw", "pbx.example.com"), &mut adapter, now)
            .unwrap();
        assert_eq!(session.state(), &RegistrationState::Progress);

        pump(&mut session, &mut adapter, now);
        pump(&mut session, &mut adapter, now);
        assert_eq!(session.state(), &RegistrationState::Ok);
        assert!(!session.on_tick(&mut adapter, now + Duration::from_secs(60)));
    }

    #[test]
    fn test_timeout_without_retry() {
        let (mut session, mut adapter, sim) = setup();
        sim.set_registrar(RegistrarBehavior::Unreachable);
        let start = Instant::now();

        session
            .configure(AccountConfig::new("alice", "pw", "unreachable.invalid"), &mut adapter, start)
            .unwrap();
        pump(&mut session, &mut adapter, start);

        assert!(!session.on_tick(&mut adapter, start + Duration::from_secs(29)));
        assert!(session.on_tick(&mut adapter, start + Duration::from_secs(30)));
        assert_eq!(session.state(), &RegistrationState::Failed("timeout".into()));

        let before = sim.network_ops();
        for i in 0..5 {
            pump(&mut session, &mut adapter, start + Duration::from_secs(31 + i));
            session.on_tick(&mut adapter, start + Duration::from_secs(31 + i));
        }
        assert_eq!(session.state(), &RegistrationState::Failed("timeout".into()));
        assert_eq!(sim.network_ops(), before);
    }

    #[test]
    fn test_empty_account_clears() {
        let (mut session, mut adapter, sim) = setup();
        let now = Instant::now();

        session
            .configure(AccountConfig::new("", "", ""), &mut adapter, now)
            .unwrap();
        assert_eq!(session.state(), &RegistrationState::Cleared);
        assert_eq!(sim.network_ops(), 0);
        assert!(session.account().is_none());
    }

    #[test]
    fn test_refresh_is_noop_in_progress() {
        let (mut session, mut adapter, sim) = setup();
        let now = Instant::now();
        session
            .configure(AccountConfig::new("alice", "pw", "pbx.example.com"), &mut adapter, now)
            .unwrap();

        let ops = sim.network_ops();
        session.refresh(&mut adapter).unwrap();
        assert_eq!(sim.network_ops(), ops);
    }

    #[test]
    fn test_register_requires_account() {
        let (mut session, mut adapter, _) = setup();
        assert_eq!(
            session.register(&mut adapter, Instant::now()),
            Err(RegistrationError::NoAccount)
        );
    }

    #[test]
    fn test_retry_after_failure() {
        let (mut session, mut adapter, sim) = setup();
        sim.set_registrar(RegistrarBehavior::Reject("403 Forbidden".into()));
        let now = Instant::now();

        session
            .configure(AccountConfig::new("alice", "pw", "pbx.example.com"), &mut adapter, now)
            .unwrap();
        pump(&mut session, &mut adapter, now);
        pump(&mut session, &mut adapter, now);
        assert_eq!(session.state(), &RegistrationState::Failed("403 Forbidden".into()));

        sim.set_registrar(RegistrarBehavior::Accept);
        session.register(&mut adapter, now).unwrap();
        assert_eq!(session.state(), &RegistrationState::Progress);
        pump(&mut session, &mut adapter, now);
        pump(&mut session, &mut adapter, now);
        assert_eq!(session.state(), &RegistrationState::Ok);
    }

    #[test]
    fn test_engine_refresh_keeps_registration() {
        let (mut session, mut adapter, sim) = setup();
        let now = Instant::now();
        session
            .configure(AccountConfig::new("alice", "pw", "pbx.example.com"), &mut adapter, now)
            .unwrap();
        pump(&mut session, &mut adapter, now);
        pump(&mut session, &mut adapter, now);
        assert_eq!(session.state(), &RegistrationState::Ok);

        session.refresh(&mut adapter).unwrap();
        assert_eq!(sim.network_ops(), 2);
        pump(&mut session, &mut adapter, now);
        assert_eq!(session.state(), &RegistrationState::Ok);
        assert!(adapter.is_registered());
        assert!(!session.on_tick(&mut adapter, now + Duration::from_secs(60)));

        pump(&mut session, &mut adapter, now);
        assert_eq!(session.state(), &RegistrationState::Ok);
    }

    #[test]
    fn test_huge_timeout_does_not_overflow() {
        let engine = SimulatedEngine::new();
        let mut adapter = EngineAdapter::new(Box::new(engine), &SessionConfig::default());
        adapter.initialize().unwrap();
        let mut session = RegistrationSession::new(Duration::MAX);
        let now = Instant::now();

        session
            .configure(AccountConfig::new("alice", "pw", "pbx.example.com"), &mut adapter, now)
            .unwrap();
        assert_eq!(session.state(), &RegistrationState::Progress);
        assert!(!session.on_tick(&mut adapter, now + Duration::from_secs(3600)));
    }
}
