//! Audio Resource - exklusive Audio-Session des Geräts
//!
//! Die Audio-Session (Kategorie/Modus, Ein-/Ausgabegerät, Wake-Lock) gehört
//! immer genau einem Anruf. Belegt wird sie über einen `AudioGuard`, der sie
//! beim Freigeben bzw. Droppen wieder deaktiviert.
//!
//! Mit Feature `host-audio` prüft `HostAudioSession` per cpal, dass ein
//! Ein- und Ausgabegerät mit passender Sprach-Konfiguration verfügbar ist.

use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Sample Rate (48kHz ist der Standard für beste Qualität)
pub const SAMPLE_RATE: u32 = 48000;

/// Channels (Mono für Voice)
pub const CHANNELS: u16 = 1;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AudioError {
    #[error("No audio input device found")]
    NoInputDevice,

    #[error("No audio output device found")]
    NoOutputDevice,

    #[error("Unsupported audio configuration: {0}")]
    UnsupportedConfig(String),

    #[error("Audio session activation failed: {0}")]
    ActivationFailed(String),

    #[error("Audio route change failed: {0}")]
    RouteFailed(String),
}

// ============================================================================
// AUDIO SESSION
// ============================================================================

/// Plattform-Audio-Session
///
/// `deactivate` und `release_wake_lock` müssen auch ohne vorheriges
/// `activate` gefahrlos aufrufbar sein.
pub trait AudioSession {
    /// Kategorie/Modus für Sprache setzen und Session aktivieren
    fn activate(&mut self) -> Result<(), AudioError>;
    fn deactivate(&mut self);
    fn set_speaker(&mut self, on: bool) -> Result<(), AudioError>;
    fn acquire_wake_lock(&mut self);
    fn release_wake_lock(&mut self);
}

/// Geteilte Audio-Session; gehört dem Dispatcher-Thread
pub type SharedAudioSession = Arc<Mutex<Box<dyn AudioSession + Send>>>;

pub fn shared(session: impl AudioSession + Send + 'static) -> SharedAudioSession {
    Arc::new(Mutex::new(Box::new(session)))
}

// ============================================================================
// AUDIO GUARD
// ============================================================================

/// Exklusive Belegung der Audio-Session für einen Anruf
///
/// Alles-oder-nichts: schlägt `acquire` fehl, ist nichts belegt.
pub struct AudioGuard {
    session: SharedAudioSession,
    released: bool,
}

impl AudioGuard {
    pub fn acquire(session: &SharedAudioSession, speaker: bool) -> Result<Self, AudioError> {
        let mut s = session.lock();
        s.activate()?;

        if let Err(e) = s.set_speaker(speaker) {
            tracing::warn!("Failed to apply speaker route: {}", e);
        }
        s.acquire_wake_lock();
        drop(s);

        tracing::info!("Audio resource acquired (speaker: {})", speaker);
        Ok(Self {
            session: Arc::clone(session),
            released: false,
        })
    }

    pub fn set_speaker(&self, on: bool) -> Result<(), AudioError> {
        self.session.lock().set_speaker(on)
    }

    /// Explizite Freigabe; `Drop` übernimmt das sonst
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        let mut s = self.session.lock();
        s.release_wake_lock();
        s.deactivate();
        tracing::info!("Audio resource released");
    }
}

impl Drop for AudioGuard {
    fn drop(&mut self) {
        self.release_inner();
    }
}

impl std::fmt::Debug for AudioGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioGuard")
            .field("released", &self.released)
            .finish()
    }
}

// ============================================================================
// SIMULATED AUDIO SESSION
// ============================================================================

#[derive(Debug, Default)]
struct SimulatedAudioState {
    active: bool,
    speaker: bool,
    wake_lock: bool,
    activations: usize,
    deactivations: usize,
    fail_activation: Option<String>,
}

/// Audio-Session ohne Hardware, für Tests und die simulierte Engine
#[derive(Debug, Default, Clone)]
pub struct SimulatedAudioSession {
    state: Arc<Mutex<SimulatedAudioState>>,
}

impl SimulatedAudioSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Nächste Aktivierung schlägt mit `reason` fehl
    pub fn fail_next_activation(&self, reason: &str) {
        self.state.lock().fail_activation = Some(reason.to_string());
    }

    pub fn is_active(&self) -> bool {
        self.state.lock().active
    }

    pub fn is_speaker_on(&self) -> bool {
        self.state.lock().speaker
    }

    pub fn holds_wake_lock(&self) -> bool {
        self.state.lock().wake_lock
    }

    pub fn activations(&self) -> usize {
        self.state.lock().activations
    }

    pub fn deactivations(&self) -> usize {
        self.state.lock().deactivations
    }
}

impl AudioSession for SimulatedAudioSession {
    fn activate(&mut self) -> Result<(), AudioError> {
        let mut s = self.state.lock();
        if let Some(reason) = s.fail_activation.take() {
            return Err(AudioError::ActivationFailed(reason));
        }
        s.active = true;
        s.activations += 1;
        Ok(())
    }

    fn deactivate(&mut self) {
        let mut s = self.state.lock();
        if s.active {
            s.active = false;
            s.deactivations += 1;
        }
    }

    fn set_speaker(&mut self, on: bool) -> Result<(), AudioError> {
        self.state.lock().speaker = on;
        Ok(())
    }

    fn acquire_wake_lock(&mut self) {
        self.state.lock().wake_lock = true;
    }

    fn release_wake_lock(&mut self) {
        self.state.lock().wake_lock = false;
    }
}

// ============================================================================
// HOST AUDIO SESSION (cpal)
// ============================================================================

#[cfg(feature = "host-audio")]
pub use host::HostAudioSession;

#[cfg(feature = "host-audio")]
mod host {
    use super::{AudioError, AudioSession, CHANNELS, SAMPLE_RATE};
    use cpal::traits::{DeviceTrait, HostTrait};
    use cpal::{Device, SampleFormat, StreamConfig, SupportedStreamConfigRange};

    /// Audio-Session auf Basis der Standardgeräte des Hosts
    ///
    /// Die Engine öffnet die Streams selbst; hier wird nur geprüft und
    /// festgehalten, welche Geräte und Konfigurationen der Anruf belegt.
    pub struct HostAudioSession {
        host: cpal::Host,
        input: Option<(Device, StreamConfig)>,
        output: Option<(Device, StreamConfig)>,
        speaker: bool,
    }

    // Device ist nicht auf allen Plattformen Send; Zugriff erfolgt nur
    // vom Dispatcher-Thread
    unsafe impl Send for HostAudioSession {}

    impl HostAudioSession {
        pub fn new() -> Self {
            Self {
                host: cpal::default_host(),
                input: None,
                output: None,
                speaker: false,
            }
        }

        /// Namen der aktuell belegten Geräte (Eingabe, Ausgabe)
        pub fn device_names(&self) -> (Option<String>, Option<String>) {
            let name = |d: &Option<(Device, StreamConfig)>| {
                d.as_ref().and_then(|(device, _)| device.name().ok())
            };
            (name(&self.input), name(&self.output))
        }

        fn find_best_input_config(device: &Device) -> Result<StreamConfig, AudioError> {
            let configs = device
                .supported_input_configs()
                .map_err(|e| AudioError::UnsupportedConfig(e.to_string()))?;
            select_best_config(configs.collect())
        }

        fn find_best_output_config(device: &Device) -> Result<StreamConfig, AudioError> {
            let configs = device
                .supported_output_configs()
                .map_err(|e| AudioError::UnsupportedConfig(e.to_string()))?;
            select_best_config(configs.collect())
        }
    }

    impl Default for HostAudioSession {
        fn default() -> Self {
            Self::new()
        }
    }

    impl AudioSession for HostAudioSession {
        fn activate(&mut self) -> Result<(), AudioError> {
            let input = self
                .host
                .default_input_device()
                .ok_or(AudioError::NoInputDevice)?;
            let output = self
                .host
                .default_output_device()
                .ok_or(AudioError::NoOutputDevice)?;

            let input_config = Self::find_best_input_config(&input)?;
            let output_config = Self::find_best_output_config(&output)?;

            tracing::info!(
                "Audio session active: input {} Hz/{} ch, output {} Hz/{} ch",
                input_config.sample_rate.0,
                input_config.channels,
                output_config.sample_rate.0,
                output_config.channels
            );

            self.input = Some((input, input_config));
            self.output = Some((output, output_config));
            Ok(())
        }

        fn deactivate(&mut self) {
            if self.input.take().is_some() | self.output.take().is_some() {
                tracing::debug!("Audio session deactivated");
            }
        }

        fn set_speaker(&mut self, on: bool) -> Result<(), AudioError> {
            // Desktop-Hosts kennen keine Hörmuschel; Route bleibt beim Standardgerät
            self.speaker = on;
            tracing::debug!("Speaker route requested: {}", on);
            Ok(())
        }

        fn acquire_wake_lock(&mut self) {}

        fn release_wake_lock(&mut self) {}
    }

    /// Wählt die beste Konfiguration aus einer Liste
    fn select_best_config(
        configs: Vec<SupportedStreamConfigRange>,
    ) -> Result<StreamConfig, AudioError> {
        // Priorität: 48kHz Mono F32 > 48kHz F32 > höchste Rate F32 > erste
        let target_rate = cpal::SampleRate(SAMPLE_RATE);
        let supports_target = |c: &SupportedStreamConfigRange| {
            c.min_sample_rate() <= target_rate && c.max_sample_rate() >= target_rate
        };

        let preferred = configs
            .iter()
            .filter(|c| supports_target(c) && c.sample_format() == SampleFormat::F32)
            .min_by_key(|c| (c.channels() != CHANNELS, c.channels()));
        if let Some(config) = preferred {
            return Ok(config.clone().with_sample_rate(target_rate).into());
        }

        if let Some(config) = configs.iter().find(|c| c.sample_format() == SampleFormat::F32) {
            return Ok(config.clone().with_max_sample_rate().into());
        }

        if let Some(config) = configs.first() {
            return Ok(config.clone().with_max_sample_rate().into());
        }

        Err(AudioError::UnsupportedConfig(
            "No suitable audio configuration found".to_string(),
        ))
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_releases_on_drop() {
        let audio = SimulatedAudioSession::new();
        let session = shared(audio.clone());

        {
            let _guard = AudioGuard::acquire(&session, true).unwrap();
            assert!(audio.is_active());
            assert!(audio.is_speaker_on());
            assert!(audio.holds_wake_lock());
        }

        assert!(!audio.is_active());
        assert!(!audio.holds_wake_lock());
        assert_eq!(audio.deactivations(), 1);
    }

    #[test]
    fn test_release_is_single_shot() {
        let audio = SimulatedAudioSession::new();
        let session = shared(audio.clone());

        let guard = AudioGuard::acquire(&session, false).unwrap();
        guard.release();
        session.lock().deactivate();
        assert_eq!(audio.deactivations(), 1);
    }

    #[test]
    fn test_failed_acquire_holds_nothing() {
        let audio = SimulatedAudioSession::new();
        audio.fail_next_activation("route busy");
        let session = shared(audio.clone());

        let err = AudioGuard::acquire(&session, false).unwrap_err();
        assert_eq!(err, AudioError::ActivationFailed("route busy".into()));
        assert!(!audio.is_active());
        assert!(!audio.holds_wake_lock());
    }
}
