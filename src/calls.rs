//! Tracks the lifecycle of outgoing (originated) and incoming telephony
//! calls on top of an [`AmiMultiplexer`].
//!
//! A call is only ever known to the server as a set of channels
//! (`Uniqueid`s). [`CallManager`] bridges that gap for an originated call by
//! injecting a uniquely-named tracking variable into the `Originate`
//! action's variables and watching for the `VarSet` event the server emits
//! when it applies that variable to the new channel. Incoming calls have no
//! such hook and are instead promoted from `Newchannel` candidates the first
//! time a registered factory recognizes one, via [`Newstate`].
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use rand::RngCore;
use sha1::{Digest, Sha1};

use crate::ami::{ActionError, ActionResult, AmiMultiplexer, Event};
use crate::headers::HeaderMap;
use crate::token::{aggregate, CompletionToken};
use crate::transport::Transport;

/// Triggered by an `OriginateResponse` event of type `Failure`.
///
/// Mirrors `obelus.ami.calls.OriginateError`: the numeric `Reason` header
/// Asterisk attaches to a failed originate. See
/// <http://permalink.gmane.org/gmane.comp.telephony.pbx.asterisk.user/210539>
/// for what the reason codes mean.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginateError {
    pub reason: i64,
}

impl fmt::Display for OriginateError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Originate failed with reason {}", self.reason)
    }
}

impl std::error::Error for OriginateError {}

/// Why a call failed before it was ever tracked: either the `Originate`
/// action itself was refused, or it was accepted and then the server sent
/// a failed `OriginateResponse` before the tracking `VarSet` arrived.
#[derive(Debug)]
pub enum CallFailure {
    ActionRefused(ActionError),
    OriginateFailed(OriginateError),
}

impl fmt::Display for CallFailure {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::ActionRefused(e) => write!(f, "{e}"),
            Self::OriginateFailed(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for CallFailure {}

/// User-overridable call lifecycle hooks.
///
/// Every method defaults to doing nothing; implement only the events you
/// care about. The [`CallManager`] itself owns all bookkeeping (call id,
/// tracked channels, state) — a `Call` implementation only reacts.
pub trait Call {
    /// The `Originate` action was accepted by the server (this does not
    /// yet mean a channel exists).
    fn call_queued(&mut self) {}
    /// The call failed before being tracked: the action was refused, or a
    /// failed `OriginateResponse` arrived first.
    fn call_failed(&mut self, _exc: CallFailure) {}
    /// The call's channel state changed. `state_desc` is Asterisk's
    /// textual description of `state`.
    fn call_state_changed(&mut self, _state: i64, _state_desc: &str) {}
    /// Dialing has started (`Dial` event, `SubEvent: Begin`).
    fn dialing_started(&mut self) {}
    /// Dialing has finished (`Dial` event, `SubEvent: End`) with the given
    /// `DialStatus`.
    fn dialing_finished(&mut self, _status: &str) {}
    /// The call has ended: no channel remains. `cause`/`cause_desc` are
    /// the last non-zero hangup cause observed (Q.850-ish; see
    /// `<asterisk>/include/asterisk/causes.h`).
    fn call_ended(&mut self, _cause: i64, _cause_desc: &str) {}
}

/// Per-call bookkeeping the manager owns: the user's [`Call`] hooks plus
/// everything spec.md's `Call` data model names (channels bound so far,
/// last hangup cause, outgoing/incoming phase).
struct CallRecord {
    call_id: String,
    action_id: Option<String>,
    outgoing: bool,
    state: Option<i64>,
    state_desc: Option<String>,
    unique_ids: std::collections::BTreeSet<String>,
    last_hangup_cause: Option<(i64, String)>,
    hooks: Box<dyn Call>,
}

impl CallRecord {
    /// The channel unique ids currently bound to this call, in sorted
    /// order (mirrors `obelus.ami.calls.Call.unique_ids()`).
    fn unique_ids_sorted(&self) -> Vec<&str> {
        self.unique_ids.iter().map(String::as_str).collect()
    }
}

fn random_tracking_variable() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    let digest = Sha1::digest(bytes);
    let hex = hex::encode(digest).to_uppercase();
    format!("X_{}", &hex[..12])
}

fn update_hangup_cause(record: &mut CallRecord, headers: &HeaderMap) {
    let cause: i64 = headers.get("Cause").and_then(|v| v.parse().ok()).unwrap_or(0);
    if cause != 0 || record.last_hangup_cause.is_none() {
        let desc = headers.get("Cause-txt").unwrap_or("").to_owned();
        record.last_hangup_cause = Some((cause, desc));
    }
}

/// Correlates AMI events into tracked [`Call`]s.
///
/// Must be bound to exactly one [`AmiMultiplexer`] via [`CallManager::bind`]
/// before any call is originated or any incoming call can be detected;
/// binding registers the event handlers this type needs
/// (`Newchannel`, `VarSet`, `LocalBridge`, `Dial`, `Newstate`,
/// `SoftHangupRequest`, `Hangup`, `OriginateResponse`).
pub struct CallManager {
    tracking_variable: String,
    next_call_id: u64,
    incoming_call_factory: Option<Box<dyn FnMut(&HeaderMap) -> Box<dyn Call>>>,
    // channel unique id => last Newchannel event headers (incoming-call candidates)
    new_channels: HashMap<String, HeaderMap>,
    // action id => call id, for originated calls not yet bound to a channel
    actions: HashMap<String, String>,
    // call id => record, for every live call
    calls: HashMap<String, CallRecord>,
    // channel unique id => call id
    unique_ids: HashMap<String, String>,
}

impl Default for CallManager {
    fn default() -> Self {
        Self::new()
    }
}

impl CallManager {
    pub fn new() -> Self {
        Self {
            tracking_variable: random_tracking_variable(),
            next_call_id: 1,
            incoming_call_factory: None,
            new_channels: HashMap::new(),
            actions: HashMap::new(),
            calls: HashMap::new(),
            unique_ids: HashMap::new(),
        }
    }

    /// The per-manager tracking variable name, of the form `X_[A-F0-9]{12}`.
    pub fn tracking_variable(&self) -> &str {
        &self.tracking_variable
    }

    fn next_call_id(&mut self) -> String {
        let id = self.next_call_id;
        self.next_call_id += 1;
        id.to_string()
    }

    /// All outgoing (originated) calls, whether or not they have been
    /// bound to a channel yet.
    pub fn queued_calls(&self) -> Vec<&str> {
        self.calls
            .values()
            .filter(|c| c.outgoing)
            .map(|c| c.call_id.as_str())
            .collect()
    }

    /// Calls that are fully tracked (bound to at least one channel),
    /// whether incoming or originated. Some queued outgoing calls may not
    /// appear here yet.
    pub fn tracked_calls(&self) -> Vec<&str> {
        let queued: std::collections::HashSet<&str> =
            self.actions.values().map(String::as_str).collect();
        self.calls
            .keys()
            .filter(|id| !queued.contains(id.as_str()))
            .map(String::as_str)
            .collect()
    }

    /// The channel unique ids currently bound to `call_id`, sorted.
    pub fn unique_ids_of(&self, call_id: &str) -> Option<Vec<&str>> {
        self.calls.get(call_id).map(CallRecord::unique_ids_sorted)
    }

    /// Registers `factory` to build a [`Call`] for incoming calls the
    /// manager detects (a `Newstate` event on a non-local channel with no
    /// tracked call yet). Without a factory, incoming calls are never
    /// tracked.
    pub fn listen_for_incoming_calls(&mut self, factory: impl FnMut(&HeaderMap) -> Box<dyn Call> + 'static) {
        self.incoming_call_factory = Some(Box::new(factory));
    }

    /// Registers every event handler this manager needs on `ami`.
    ///
    /// # Errors
    /// Returns a [`ProgrammerError`](crate::ProgrammerError) if any of the
    /// handler names are already registered (e.g. `bind` called twice on
    /// the same multiplexer).
    pub fn bind<T: Transport + 'static>(
        manager: &Rc<RefCell<Self>>,
        ami: &mut AmiMultiplexer<T>,
    ) -> Result<(), crate::ProgrammerError> {
        macro_rules! on {
            ($name:literal, $method:ident) => {{
                let handle = Rc::clone(manager);
                ami.register_event_handler($name, move |event| {
                    handle.borrow_mut().$method(&event);
                })?;
            }};
        }
        on!("Newchannel", on_new_channel);
        on!("VarSet", on_var_set);
        on!("LocalBridge", on_local_bridge);
        on!("Dial", on_dial);
        on!("Newstate", on_new_state);
        on!("SoftHangupRequest", on_soft_hangup_request);
        on!("Hangup", on_hangup);
        on!("OriginateResponse", on_originate_response);
        Ok(())
    }

    /// Sets up server-side AMI filters tailored to this manager: a
    /// `call`-privilege whitelist and a whitelist on the tracking
    /// variable, to avoid the bursts of `NewExten`/`VarSet`/`AGIExec`
    /// events a busy Asterisk generates by default. Not required for
    /// correct operation, only for reducing traffic.
    pub fn setup_filters<T: Transport>(
        &self,
        ami: &mut AmiMultiplexer<T>,
    ) -> CompletionToken<Vec<ActionResult>, ActionError> {
        let filters = [
            "Privilege: call,all".to_owned(),
            format!("Variable: {}", self.tracking_variable),
        ];
        let tokens = filters
            .into_iter()
            .map(|filter| {
                let mut headers = HeaderMap::new();
                headers.insert("Operation", "Add");
                headers.insert("Filter", filter);
                ami.send_action("Filter", headers, None)
            })
            .collect();
        aggregate(tokens)
    }

    /// Originates `call` with the given AMI `headers` and, optionally,
    /// call-specific `variables`. The tracking variable is injected into
    /// `variables` automatically. Returns the newly assigned call id.
    pub fn originate<T: Transport>(
        manager: &Rc<RefCell<Self>>,
        ami: &mut AmiMultiplexer<T>,
        call: Box<dyn Call>,
        headers: HeaderMap,
        variables: Option<HashMap<String, String>>,
    ) -> String {
        let (call_id, token) = {
            let mut mgr = manager.borrow_mut();
            let call_id = mgr.next_call_id();
            let mut variables = variables.unwrap_or_default();
            variables.insert(mgr.tracking_variable.clone(), call_id.clone());
            let token = ami.send_action("Originate", headers, Some(&variables));
            mgr.calls.insert(
                call_id.clone(),
                CallRecord {
                    call_id: call_id.clone(),
                    action_id: None,
                    outgoing: true,
                    state: None,
                    state_desc: None,
                    unique_ids: std::collections::BTreeSet::new(),
                    last_hangup_cause: None,
                    hooks: call,
                },
            );
            (call_id, token)
        };

        let manager_ok = Rc::clone(manager);
        let call_id_ok = call_id.clone();
        let _ = token.on_result(move |result| {
            let mut mgr = manager_ok.borrow_mut();
            let action_id = match &result {
                ActionResult::Response(resp) => resp.headers.get("ActionID").map(str::to_owned),
                ActionResult::EventList(list) => list.headers.get("ActionID").map(str::to_owned),
            };
            let Some(action_id) = action_id else { return };
            mgr.actions.insert(action_id.clone(), call_id_ok.clone());
            if let Some(record) = mgr.calls.get_mut(&call_id_ok) {
                record.action_id = Some(action_id);
                record.hooks.call_queued();
            }
        });
        let manager_err = Rc::clone(manager);
        let call_id_err = call_id.clone();
        let _ = token.on_exception(move |exc| {
            let mut mgr = manager_err.borrow_mut();
            if let Some(mut record) = mgr.calls.remove(&call_id_err) {
                record.hooks.call_failed(CallFailure::ActionRefused(exc));
            }
        });
        call_id
    }

    fn on_originate_response(&mut self, event: &Event) {
        let h = &event.headers;
        if h.get("Response") != Some("Failure") {
            return;
        }
        let Some(action_id) = h.get("ActionID") else { return };
        let Some(call_id) = self.actions.remove(action_id) else { return };
        let Some(mut record) = self.calls.remove(&call_id) else { return };
        let reason = h.get("Reason").and_then(|v| v.parse().ok()).unwrap_or(0);
        record
            .hooks
            .call_failed(CallFailure::OriginateFailed(OriginateError { reason }));
    }

    fn on_new_channel(&mut self, event: &Event) {
        let h = &event.headers;
        let Some(unique_id) = h.get("Uniqueid") else { return };
        if h.get("Channel").is_some_and(|c| c.starts_with("Local/")) {
            return;
        }
        self.new_channels.insert(unique_id.to_owned(), h.clone());
    }

    fn on_var_set(&mut self, event: &Event) {
        let h = &event.headers;
        if h.get("Variable") != Some(self.tracking_variable.as_str()) {
            return;
        }
        let Some(call_id) = h.get("Value") else { return };
        let Some(unique_id) = h.get("Uniqueid") else { return };
        self.new_channels.remove(unique_id);
        let Some(record) = self.calls.get_mut(call_id) else {
            #[cfg(feature = "tracing")]
            tracing::error!(call_id, "got unknown call id in VarSet");
            return;
        };
        match record.action_id.take() {
            Some(action_id) => {
                self.actions.remove(&action_id);
            }
            None => {
                #[cfg(feature = "tracing")]
                tracing::error!(call_id, "got duplicate VarSet for call");
                return;
            }
        }
        record.unique_ids.insert(unique_id.to_owned());
        self.unique_ids.insert(unique_id.to_owned(), call_id.to_owned());
    }

    fn on_local_bridge(&mut self, event: &Event) {
        let h = &event.headers;
        let Some(id1) = h.get("Uniqueid1") else { return };
        let Some(call_id) = self.unique_ids.get(id1).cloned() else {
            return;
        };
        let Some(id2) = h.get("Uniqueid2") else { return };
        if let Some(other) = self.unique_ids.get(id2) {
            if other != &call_id {
                #[cfg(feature = "tracing")]
                tracing::error!(id2, other = other.as_str(), "LocalBridge onto a call id already bound elsewhere");
                return;
            }
        }
        if let Some(record) = self.calls.get_mut(&call_id) {
            record.unique_ids.insert(id2.to_owned());
        }
        self.unique_ids.insert(id2.to_owned(), call_id);
    }

    fn on_dial(&mut self, event: &Event) {
        let h = &event.headers;
        let Some(unique_id) = h.get("UniqueID") else { return };
        let Some(call_id) = self.unique_ids.get(unique_id).cloned() else {
            return;
        };
        let Some(record) = self.calls.get_mut(&call_id) else { return };
        match h.get("SubEvent") {
            Some("Begin") => record.hooks.dialing_started(),
            Some("End") => {
                let status = h.get("DialStatus").unwrap_or("");
                record.hooks.dialing_finished(status);
            }
            _ => {}
        }
    }

    fn candidate_incoming_call(&mut self, unique_id: &str) -> Option<String> {
        let headers = self.new_channels.remove(unique_id)?;
        let factory = self.incoming_call_factory.as_mut()?;
        let call_id = {
            let id = self.next_call_id;
            self.next_call_id += 1;
            id.to_string()
        };
        let hooks = factory(&headers);
        let mut unique_ids = std::collections::BTreeSet::new();
        unique_ids.insert(unique_id.to_owned());
        self.calls.insert(
            call_id.clone(),
            CallRecord {
                call_id: call_id.clone(),
                action_id: None,
                outgoing: false,
                state: None,
                state_desc: None,
                unique_ids,
                last_hangup_cause: None,
                hooks,
            },
        );
        self.unique_ids.insert(unique_id.to_owned(), call_id.clone());
        Some(call_id)
    }

    fn on_new_state(&mut self, event: &Event) {
        let h = &event.headers;
        let Some(unique_id) = h.get("Uniqueid").map(str::to_owned) else { return };
        let call_id = match self.unique_ids.get(&unique_id).cloned() {
            Some(id) => id,
            None => match self.candidate_incoming_call(&unique_id) {
                Some(id) => id,
                None => return,
            },
        };
        let Some(record) = self.calls.get_mut(&call_id) else { return };
        let state: i64 = h.get("ChannelState").and_then(|v| v.parse().ok()).unwrap_or(0);
        let state_desc = h.get("ChannelStateDesc").unwrap_or("").to_owned();
        if record.state != Some(state) {
            record.state = Some(state);
            record.hooks.call_state_changed(state, &state_desc);
        }
        record.state_desc = Some(state_desc);
    }

    fn on_soft_hangup_request(&mut self, event: &Event) {
        let h = &event.headers;
        let Some(unique_id) = h.get("Uniqueid") else { return };
        let Some(call_id) = self.unique_ids.get(unique_id).cloned() else {
            return;
        };
        if let Some(record) = self.calls.get_mut(&call_id) {
            update_hangup_cause(record, h);
        }
    }

    fn on_hangup(&mut self, event: &Event) {
        let h = &event.headers;
        let Some(unique_id) = h.get("Uniqueid").map(str::to_owned) else { return };
        self.new_channels.remove(&unique_id);
        let Some(call_id) = self.unique_ids.remove(&unique_id) else {
            return;
        };
        let now_empty = {
            let Some(record) = self.calls.get_mut(&call_id) else { return };
            record.unique_ids.remove(&unique_id);
            update_hangup_cause(record, h);
            record.unique_ids.is_empty()
        };
        if now_empty {
            let mut record = self.calls.remove(&call_id).expect("just looked up above");
            let (cause, desc) = record.last_hangup_cause.clone().unwrap_or((0, String::new()));
            record.hooks.call_ended(cause, &desc);
        }
    }
}
