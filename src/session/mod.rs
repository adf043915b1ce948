//! Registrierungs- und Anruf-Sessions

pub mod audio;
mod call;
mod registration;

pub use audio::{AudioError, AudioGuard, AudioSession, SharedAudioSession, SimulatedAudioSession};
pub use call::{
    next_call_state, CallController, CallDirection, CallError, CallSession, CallState, CallView,
    IncomingCallDescriptor,
};
pub use registration::{
    next_registration_state, RegistrationError, RegistrationSession, RegistrationState,
};
