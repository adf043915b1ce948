//! Engine Adapter
//!
//! Kapselt die SIP/RTP-Engine hinter dem `TelephonyEngine`-Trait.
//! Der Adapter besitzt die Engine exklusiv und wird nur vom Dispatcher-Thread
//! benutzt.

mod adapter;
mod backend;
mod events;
pub mod simulated;

pub use adapter::{EngineAdapter, EngineError};
pub use backend::{
    AuthInfo, BackendError, BackendResult, NetworkPolicy, ProxyConfig, TelephonyEngine,
};
pub use events::*;
