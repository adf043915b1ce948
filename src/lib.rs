//! SIP Session Manager - Telefonie-Kern der Hausverwaltungs-App
//!
//! Treibt eine pollende SIP/RTP-Engine und stellt der UI bereit:
//! - Registrierung eines SIP-Accounts mit lokalem Timeout
//! - Höchstens einen Anruf gleichzeitig, inkl. Audio-Session
//! - Einen beobachtbaren Zustand für beliebig viele Abonnenten
//!
//! ## Verwendung
//! ```no_run
//! use sip_session_manager::engine::simulated::SimulatedEngine;
//! use sip_session_manager::session::{audio, SimulatedAudioSession};
//! use sip_session_manager::{AccountConfig, SessionConfig, SessionManager};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! sip_session_manager::init_logging();
//!
//! let manager = SessionManager::start(
//!     SessionConfig::from_env(),
//!     Box::new(SimulatedEngine::new()),
//!     audio::shared(SimulatedAudioSession::new()),
//! )
//! .await?;
//!
//! let mut states = manager.subscribe();
//! manager
//!     .configure_account(AccountConfig::new("4711", "geheim", "pbx.example.com"))
//!     .await?;
//! while let Some(snapshot) = states.next().await {
//!     println!("{:?}", snapshot.registration);
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod manager;
pub mod session;
pub mod state;
pub mod store;

pub use config::{AccountConfig, SessionConfig, Transport};
pub use dispatcher::CommandError;
pub use engine::{EngineError, TelephonyEngine};
pub use manager::{ManagerError, SessionManager};
pub use session::{CallState, IncomingCallDescriptor, RegistrationState};
pub use state::{StateSnapshot, StateSubscription};
pub use store::{AccountStore, FileAccountStore, StoreError};

// ============================================================================
// LOGGING
// ============================================================================

/// Standard-Filter wenn `RUST_LOG` nicht gesetzt ist
const DEFAULT_LOG_FILTER: &str = "sip_session_manager=debug";

/// Initialisiert das Logging
///
/// Ein bereits installierter Subscriber (z.B. der Host-App) bleibt aktiv.
pub fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER));

    if tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .try_init()
        .is_err()
    {
        tracing::debug!("Logging already initialized");
    }
}
