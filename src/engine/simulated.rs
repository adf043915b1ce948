//! Simulierte Telefonie-Engine
//!
//! In-Process-Implementierung von `TelephonyEngine` für Tests, Demos und
//! UI-Entwicklung ohne echte SIP-Gegenstelle. Über den `SimulatorHandle`
//! lässt sich steuern, wie sich Registrar und Gegenstellen verhalten, und
//! jeder Engine-Aufruf wird protokolliert.
//!
//! Events werden tick-genau geplant: ein Event mit Verzögerung `n` erscheint
//! in der `n+1`-ten folgenden `iterate()`-Runde.

use super::backend::{
    AuthInfo, BackendError, BackendResult, NetworkPolicy, ProxyConfig, TelephonyEngine,
};
use super::events::{
    AudioDevice, AudioDeviceKind, CallId, EngineCallState, EngineEvent, EngineRegistrationState,
    RemoteParty,
};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

const CODECS: [&str; 6] = ["PCMU", "PCMA", "opus", "G729", "speex", "G722"];

// ============================================================================
// BEHAVIOUR
// ============================================================================

/// Verhalten des simulierten Registrars
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrarBehavior {
    /// `Progress`, dann `Ok`
    Accept,
    /// Nur `Progress`, keine Antwort
    Unreachable,
    /// `Progress`, dann `Failed(reason)`
    Reject(String),
}

/// Protokollierter Engine-Aufruf
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineOp {
    Create,
    Start,
    Stop,
    SetNetworkPolicy,
    AddAuthInfo(String),
    ClearAuthInfo,
    AddProxyConfig(String),
    ClearProxyConfigs,
    SetRegisterEnabled(bool),
    RefreshRegistrations,
    Invite(String),
    Accept(CallId),
    Terminate(CallId),
    SetMicEnabled(bool),
    SetInputDevice(String),
    SetOutputDevice(String),
    SetCodecEnabled(String, bool),
    SetCodecOrder(Vec<String>),
}

// ============================================================================
// INTERNAL STATE
// ============================================================================

#[derive(Debug)]
struct Scheduled {
    due: u64,
    event: EngineEvent,
}

#[derive(Debug, Clone)]
struct SimCall {
    remote: RemoteParty,
    state: EngineCallState,
}

#[derive(Debug)]
struct SimState {
    tick: u64,
    queue: Vec<Scheduled>,
    ops: Vec<EngineOp>,
    network_ops: usize,
    fail_next: HashSet<String>,
    registrar: RegistrarBehavior,
    auto_release: bool,

    started: bool,
    auth: Vec<AuthInfo>,
    proxies: Vec<ProxyConfig>,
    registered: bool,

    next_call: u64,
    calls: HashMap<CallId, SimCall>,
    mic_enabled: bool,

    codecs: Vec<(String, bool)>,
    codec_order: Vec<String>,
    devices: Vec<AudioDevice>,
    input_device: Option<String>,
    output_device: Option<String>,
}

impl SimState {
    fn new() -> Self {
        Self {
            tick: 0,
            queue: Vec::new(),
            ops: Vec::new(),
            network_ops: 0,
            fail_next: HashSet::new(),
            registrar: RegistrarBehavior::Accept,
            auto_release: true,
            started: false,
            auth: Vec::new(),
            proxies: Vec::new(),
            registered: false,
            next_call: 1,
            calls: HashMap::new(),
            mic_enabled: true,
            codecs: CODECS.iter().map(|c| (c.to_string(), true)).collect(),
            codec_order: Vec::new(),
            devices: default_devices(),
            input_device: None,
            output_device: None,
        }
    }

    fn check(&mut self, op: &str) -> BackendResult<()> {
        if self.fail_next.remove(op) {
            Err(BackendError::new(format!("simulated {} failure", op)))
        } else {
            Ok(())
        }
    }

    fn schedule(&mut self, delay: u64, event: EngineEvent) {
        let due = self.tick + 1 + delay;
        self.queue.push(Scheduled { due, event });
    }

    fn schedule_registration(&mut self, delay: u64, state: EngineRegistrationState, message: &str) {
        self.schedule(
            delay,
            EngineEvent::RegistrationStateChanged {
                state,
                message: message.to_string(),
            },
        );
    }

    fn schedule_call(&mut self, delay: u64, call_id: CallId, state: EngineCallState, message: &str) {
        let remote = self
            .calls
            .get(&call_id)
            .map(|c| c.remote.clone())
            .unwrap_or_default();
        self.schedule(
            delay,
            EngineEvent::CallStateChanged {
                call_id,
                state,
                remote,
                message: message.to_string(),
            },
        );
    }

    /// Noch nicht zugestellte Registrierungs-Events verwerfen
    fn drop_pending_registration(&mut self) {
        self.queue
            .retain(|s| !matches!(s.event, EngineEvent::RegistrationStateChanged { .. }));
    }

    fn start_registration(&mut self) {
        self.network_ops += 1;
        self.drop_pending_registration();
        self.schedule_registration(0, EngineRegistrationState::Progress, "Registration in progress");
        match self.registrar.clone() {
            RegistrarBehavior::Accept => {
                self.schedule_registration(1, EngineRegistrationState::Ok, "Registration successful")
            }
            RegistrarBehavior::Unreachable => {}
            RegistrarBehavior::Reject(reason) => {
                self.schedule_registration(1, EngineRegistrationState::Failed, &reason)
            }
        }
    }

    fn live_call(&self, call: CallId) -> Option<&SimCall> {
        self.calls.get(&call).filter(|c| {
            !matches!(
                c.state,
                EngineCallState::End | EngineCallState::Released | EngineCallState::Error
            )
        })
    }

    fn end_call(&mut self, call: CallId, message: &str) {
        self.schedule_call(0, call, EngineCallState::End, message);
        if self.auto_release {
            self.schedule_call(1, call, EngineCallState::Released, "Call released");
        }
        if let Some(c) = self.calls.get_mut(&call) {
            c.state = EngineCallState::End;
        }
    }
}

fn default_devices() -> Vec<AudioDevice> {
    let device = |id: &str, name: &str, kind, capture, play| AudioDevice {
        id: id.to_string(),
        name: name.to_string(),
        kind,
        can_capture: capture,
        can_play: play,
    };
    vec![
        device("bt", "Bluetooth Headset", AudioDeviceKind::Bluetooth, true, true),
        device("mic", "Built-in Microphone", AudioDeviceKind::Microphone, true, false),
        device("earpiece", "Built-in Receiver", AudioDeviceKind::Earpiece, false, true),
        device("speaker", "Built-in Speaker", AudioDeviceKind::Speaker, false, true),
    ]
}

// ============================================================================
// SIMULATED ENGINE
// ============================================================================

/// Simulierte Engine; wird in den `EngineAdapter` verschoben
pub struct SimulatedEngine {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedEngine {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState::new())),
        }
    }

    /// Handle zur Steuerung und Beobachtung, auch nachdem die Engine verschoben wurde
    pub fn handle(&self) -> SimulatorHandle {
        SimulatorHandle {
            state: Arc::clone(&self.state),
        }
    }
}

impl Default for SimulatedEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl TelephonyEngine for SimulatedEngine {
    fn create(&mut self) -> BackendResult<()> {
        let mut s = self.state.lock();
        s.ops.push(EngineOp::Create);
        s.check("create")
    }

    fn start(&mut self) -> BackendResult<()> {
        let mut s = self.state.lock();
        s.ops.push(EngineOp::Start);
        s.check("start")?;
        s.started = true;
        Ok(())
    }

    fn stop(&mut self) {
        let mut s = self.state.lock();
        s.ops.push(EngineOp::Stop);
        s.started = false;
        s.queue.clear();
    }

    fn iterate(&mut self) -> Vec<EngineEvent> {
        let mut s = self.state.lock();
        s.tick += 1;
        let tick = s.tick;

        let (due, pending): (Vec<_>, Vec<_>) =
            std::mem::take(&mut s.queue).into_iter().partition(|e| e.due <= tick);
        s.queue = pending;

        let events: Vec<EngineEvent> = due.into_iter().map(|e| e.event).collect();
        for event in &events {
            match event {
                EngineEvent::RegistrationStateChanged { state, .. } => {
                    if *state != EngineRegistrationState::Progress {
                        s.registered = *state == EngineRegistrationState::Ok;
                    }
                }
                EngineEvent::CallStateChanged { call_id, state, .. } => {
                    if let Some(call) = s.calls.get_mut(call_id) {
                        call.state = *state;
                    }
                    if *state == EngineCallState::Released {
                        s.calls.remove(call_id);
                    }
                }
            }
        }
        events
    }

    fn set_network_policy(&mut self, _policy: &NetworkPolicy) -> BackendResult<()> {
        let mut s = self.state.lock();
        s.ops.push(EngineOp::SetNetworkPolicy);
        s.check("set_network_policy")
    }

    fn add_auth_info(&mut self, auth: AuthInfo) -> BackendResult<()> {
        let mut s = self.state.lock();
        s.ops.push(EngineOp::AddAuthInfo(auth.username.clone()));
        s.check("add_auth_info")?;
        s.auth.push(auth);
        Ok(())
    }

    fn clear_auth_info(&mut self) -> BackendResult<()> {
        let mut s = self.state.lock();
        s.ops.push(EngineOp::ClearAuthInfo);
        s.check("clear_auth_info")?;
        s.auth.clear();
        Ok(())
    }

    fn proxy_count(&self) -> usize {
        self.state.lock().proxies.len()
    }

    fn add_proxy_config(&mut self, proxy: ProxyConfig) -> BackendResult<()> {
        let mut s = self.state.lock();
        s.ops.push(EngineOp::AddProxyConfig(proxy.identity.clone()));
        s.check("add_proxy_config")?;
        let register = proxy.register_enabled;
        s.proxies.push(proxy);
        if register {
            s.start_registration();
        }
        Ok(())
    }

    fn clear_proxy_configs(&mut self) -> BackendResult<()> {
        let mut s = self.state.lock();
        s.ops.push(EngineOp::ClearProxyConfigs);
        s.check("clear_proxy_configs")?;
        s.drop_pending_registration();
        if s.registered {
            s.schedule_registration(0, EngineRegistrationState::Cleared, "Unregistration done");
        }
        s.proxies.clear();
        s.registered = false;
        Ok(())
    }

    fn set_register_enabled(&mut self, enabled: bool) -> BackendResult<()> {
        let mut s = self.state.lock();
        s.ops.push(EngineOp::SetRegisterEnabled(enabled));
        s.check("set_register_enabled")?;
        for proxy in s.proxies.iter_mut() {
            proxy.register_enabled = enabled;
        }
        if enabled {
            s.start_registration();
        } else {
            s.drop_pending_registration();
            s.schedule_registration(0, EngineRegistrationState::Cleared, "Unregistration done");
        }
        Ok(())
    }

    fn refresh_registrations(&mut self) -> BackendResult<()> {
        let mut s = self.state.lock();
        s.ops.push(EngineOp::RefreshRegistrations);
        s.check("refresh_registrations")?;
        if s.proxies.iter().any(|p| p.register_enabled) {
            s.start_registration();
        }
        Ok(())
    }

    fn invite(&mut self, address: &str) -> BackendResult<CallId> {
        let mut s = self.state.lock();
        s.ops.push(EngineOp::Invite(address.to_string()));
        s.check("invite")?;
        s.network_ops += 1;

        let call_id = CallId(s.next_call);
        s.next_call += 1;
        s.calls.insert(
            call_id,
            SimCall {
                remote: RemoteParty::new(address),
                state: EngineCallState::OutgoingInit,
            },
        );
        s.schedule_call(0, call_id, EngineCallState::OutgoingInit, "Starting outgoing call");
        s.schedule_call(1, call_id, EngineCallState::OutgoingProgress, "Outgoing call in progress");
        s.schedule_call(2, call_id, EngineCallState::OutgoingRinging, "Remote ringing");
        Ok(call_id)
    }

    fn accept(&mut self, call: CallId) -> BackendResult<()> {
        let mut s = self.state.lock();
        s.ops.push(EngineOp::Accept(call));
        s.check("accept")?;
        match s.live_call(call) {
            Some(c) if c.state == EngineCallState::IncomingReceived => {}
            _ => return Err(BackendError::new(format!("{} is not ringing", call))),
        }
        s.schedule_call(0, call, EngineCallState::Connected, "Connected");
        s.schedule_call(1, call, EngineCallState::StreamsRunning, "Streams running");
        Ok(())
    }

    fn terminate(&mut self, call: CallId) -> BackendResult<()> {
        let mut s = self.state.lock();
        s.ops.push(EngineOp::Terminate(call));
        s.check("terminate")?;
        if s.live_call(call).is_none() {
            return Err(BackendError::new(format!("{} not found", call)));
        }
        s.end_call(call, "Call terminated");
        Ok(())
    }

    fn set_mic_enabled(&mut self, enabled: bool) -> BackendResult<()> {
        let mut s = self.state.lock();
        s.ops.push(EngineOp::SetMicEnabled(enabled));
        s.check("set_mic_enabled")?;
        s.mic_enabled = enabled;
        Ok(())
    }

    fn audio_devices(&self) -> Vec<AudioDevice> {
        self.state.lock().devices.clone()
    }

    fn set_input_device(&mut self, device_id: &str) -> BackendResult<()> {
        let mut s = self.state.lock();
        s.ops.push(EngineOp::SetInputDevice(device_id.to_string()));
        s.check("set_input_device")?;
        s.input_device = Some(device_id.to_string());
        Ok(())
    }

    fn set_output_device(&mut self, device_id: &str) -> BackendResult<()> {
        let mut s = self.state.lock();
        s.ops.push(EngineOp::SetOutputDevice(device_id.to_string()));
        s.check("set_output_device")?;
        s.output_device = Some(device_id.to_string());
        Ok(())
    }

    fn codec_names(&self) -> Vec<String> {
        self.state.lock().codecs.iter().map(|(n, _)| n.clone()).collect()
    }

    fn set_codec_enabled(&mut self, name: &str, enabled: bool) -> BackendResult<()> {
        let mut s = self.state.lock();
        s.ops.push(EngineOp::SetCodecEnabled(name.to_string(), enabled));
        s.check("set_codec_enabled")?;
        match s.codecs.iter_mut().find(|(n, _)| n == name) {
            Some(codec) => {
                codec.1 = enabled;
                Ok(())
            }
            None => Err(BackendError::new(format!("unknown codec {}", name))),
        }
    }

    fn set_codec_order(&mut self, names: &[String]) -> BackendResult<()> {
        let mut s = self.state.lock();
        s.ops.push(EngineOp::SetCodecOrder(names.to_vec()));
        s.check("set_codec_order")?;
        s.codec_order = names.to_vec();
        Ok(())
    }
}

// ============================================================================
// SIMULATOR HANDLE
// ============================================================================

/// Steuerung der simulierten Gegenseite (Registrar, Anrufer, Angerufene)
#[derive(Clone)]
pub struct SimulatorHandle {
    state: Arc<Mutex<SimState>>,
}

impl SimulatorHandle {
    pub fn set_registrar(&self, behavior: RegistrarBehavior) {
        self.state.lock().registrar = behavior;
    }

    /// Ob `terminate()` neben `End` auch `Released` meldet
    pub fn set_auto_release(&self, enabled: bool) {
        self.state.lock().auto_release = enabled;
    }

    /// Lässt den nächsten Aufruf der genannten Operation fehlschlagen
    pub fn fail_next(&self, operation: &str) {
        self.state.lock().fail_next.insert(operation.to_string());
    }

    /// Simuliert einen eingehenden Anruf
    pub fn incoming_call(&self, address: &str, display_name: Option<&str>) -> CallId {
        let mut s = self.state.lock();
        let call_id = CallId(s.next_call);
        s.next_call += 1;

        let mut remote = RemoteParty::new(address);
        if let Some(name) = display_name {
            remote = remote.with_display_name(name);
        }
        s.calls.insert(
            call_id,
            SimCall {
                remote,
                state: EngineCallState::IncomingReceived,
            },
        );
        s.schedule_call(0, call_id, EngineCallState::IncomingReceived, "Incoming call");
        call_id
    }

    /// Gegenstelle nimmt einen ausgehenden Anruf an
    pub fn remote_answer(&self, call: CallId) {
        let mut s = self.state.lock();
        s.schedule_call(0, call, EngineCallState::Connected, "Connected");
        s.schedule_call(1, call, EngineCallState::StreamsRunning, "Streams running");
    }

    /// Gegenstelle legt auf
    pub fn remote_hangup(&self, call: CallId) {
        self.state.lock().end_call(call, "Call ended by remote");
    }

    /// Engine meldet einen Fehler für den Anruf
    pub fn fail_call(&self, call: CallId, reason: &str) {
        let mut s = self.state.lock();
        s.schedule_call(0, call, EngineCallState::Error, reason);
        s.schedule_call(1, call, EngineCallState::Released, "Call released");
    }

    pub fn ops(&self) -> Vec<EngineOp> {
        self.state.lock().ops.clone()
    }

    /// Anzahl ausgelöster REGISTER- und INVITE-Vorgänge
    pub fn network_ops(&self) -> usize {
        self.state.lock().network_ops
    }

    pub fn is_started(&self) -> bool {
        self.state.lock().started
    }

    pub fn enabled_codecs(&self) -> Vec<String> {
        self.state.lock().codec_order.clone()
    }

    pub fn codec_enabled(&self, name: &str) -> bool {
        self.state
            .lock()
            .codecs
            .iter()
            .any(|(n, enabled)| n == name && *enabled)
    }

    pub fn auth_count(&self) -> usize {
        self.state.lock().auth.len()
    }

    pub fn proxy_identities(&self) -> Vec<String> {
        self.state
            .lock()
            .proxies
            .iter()
            .map(|p| p.identity.clone())
            .collect()
    }

    pub fn mic_enabled(&self) -> bool {
        self.state.lock().mic_enabled
    }

    /// (Eingabe, Ausgabe)
    pub fn selected_devices(&self) -> (Option<String>, Option<String>) {
        let s = self.state.lock();
        (s.input_device.clone(), s.output_device.clone())
    }

    /// Anzahl nicht beendeter Anrufe in der Engine
    pub fn live_calls(&self) -> usize {
        let s = self.state.lock();
        s.calls.keys().filter(|id| s.live_call(**id).is_some()).count()
    }
}

impl std::fmt::Debug for SimulatorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = self.state.lock();
        f.debug_struct("SimulatorHandle")
            .field("tick", &s.tick)
            .field("pending_events", &s.queue.len())
            .field("registered", &s.registered)
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
