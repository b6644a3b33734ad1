//! Matches AMI actions to their responses, aggregates event lists, and
//! dispatches unmatched events to named handlers.
use std::collections::HashMap;
use std::fmt;

use crate::ami::parser::{AmiParseError, AmiParsed, AmiParser, Event, Response, ResponseType};
use crate::headers::HeaderMap;
use crate::line::LineAccumulator;
use crate::token::CompletionToken;
use crate::transport::Transport;
use crate::ProgrammerError;

/// What a successful action token fires with: either the plain response,
/// or the merged result of an `EventList: start` ... `EventList: complete`
/// aggregation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionResult {
    Response(Response),
    EventList(EventList),
}

/// An aggregated event list: the headers of the opening response merged
/// with the closing event's headers, plus every event observed in
/// between.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventList {
    pub headers: HeaderMap,
    pub events: Vec<Event>,
}

/// An error response (`Response: Error`) received for an action, or the
/// connection being torn down while the action was still outstanding.
#[derive(Debug)]
pub enum ActionError {
    /// The PBX refused the action; carries the `Message` header, if any.
    Refused(String),
    /// The connection was lost before a terminal response arrived.
    ConnectionLost,
}

impl fmt::Display for ActionError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Refused(message) => write!(f, "action refused: {message}"),
            Self::ConnectionLost => write!(f, "connection lost while action was pending"),
        }
    }
}

impl std::error::Error for ActionError {}

pub type ActionToken = CompletionToken<ActionResult, ActionError>;

struct EventListInProgress {
    headers: HeaderMap,
    events: Vec<Event>,
}

/// Wraps an [`AmiParser`] with action/event-list correlation and a
/// transport to write serialized actions to.
pub struct AmiMultiplexer<T: Transport> {
    transport: T,
    line_acc: LineAccumulator,
    parser: AmiParser,
    next_action_id: u64,
    actions: HashMap<String, ActionToken>,
    event_lists: HashMap<String, EventListInProgress>,
    event_handlers: HashMap<String, Box<dyn FnMut(Event)>>,
    unhandled_event_handler: Option<Box<dyn FnMut(Event)>>,
    greeting_handler: Option<Box<dyn FnOnce(String, String)>>,
}

impl<T: Transport> AmiMultiplexer<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            line_acc: LineAccumulator::new(),
            parser: AmiParser::new(),
            next_action_id: 1,
            actions: HashMap::new(),
            event_lists: HashMap::new(),
            event_handlers: HashMap::new(),
            unhandled_event_handler: None,
            greeting_handler: None,
        }
    }

    /// Registers a callback fired exactly once with `(name, version)` from
    /// the AMI greeting line.
    pub fn on_greeting(&mut self, cb: impl FnOnce(String, String) + 'static) {
        self.greeting_handler = Some(Box::new(cb));
    }

    /// Registers a catch-all for events that match no registered handler
    /// and no in-progress event list.
    pub fn on_unhandled_event(&mut self, cb: impl FnMut(Event) + 'static) {
        self.unhandled_event_handler = Some(Box::new(cb));
    }

    fn next_id(&mut self) -> String {
        let id = self.next_action_id;
        self.next_action_id += 1;
        id.to_string()
    }

    fn serialize_message(headers: &HeaderMap) -> Vec<u8> {
        let mut out = String::new();
        for (key, value) in headers.iter() {
            for v in value.values() {
                out.push_str(key);
                out.push_str(": ");
                out.push_str(v);
                out.push_str("\r\n");
            }
        }
        out.push_str("\r\n");
        out.into_bytes()
    }

    /// Submits an action named `name` with `headers`, optionally
    /// attaching `variables` as `Variable: k=v` entries. Assigns an
    /// `ActionID` if `headers` doesn't already carry one, serializes the
    /// message and writes it to the transport. Returns the action id
    /// alongside the token so the caller can later [`Self::cancel_action`]
    /// it.
    pub fn send_action(
        &mut self,
        name: &str,
        mut headers: HeaderMap,
        variables: Option<&HashMap<String, String>>,
    ) -> (String, ActionToken) {
        if let Some(variables) = variables {
            if !variables.is_empty() {
                let vars: Vec<String> = variables
                    .iter()
                    .map(|(k, v)| format!("{k}={v}"))
                    .collect();
                headers.insert("Variable", vars);
            }
        }
        headers.insert("Action", name);
        let action_id = match headers.get("ActionID") {
            Some(existing) => existing.to_owned(),
            None => {
                let id = self.next_id();
                headers.insert("ActionID", id.clone());
                id
            }
        };
        let data = Self::serialize_message(&headers);
        self.transport.write(&data);
        let token = ActionToken::new();
        self.actions.insert(action_id.clone(), token.clone());
        (action_id, token)
    }

    /// Cancels the outstanding action `action_id`, detaching `token` from
    /// this multiplexer's action map: a response or event-list completion
    /// that later arrives for `action_id` is silently dropped instead of
    /// firing anything. A no-op if `action_id` is no longer tracked (the
    /// action already completed or was already cancelled).
    ///
    /// # Errors
    /// Returns [`ProgrammerError::StaleCancel`] if a different token now
    /// occupies `action_id`'s slot than the one passed in — only reachable
    /// after id reuse following a previous cancel. The occupying token is
    /// left untouched in that case.
    pub fn cancel_action(
        &mut self,
        action_id: &str,
        token: &ActionToken,
    ) -> Result<(), ProgrammerError> {
        match self.actions.get(action_id) {
            Some(current) if !current.ptr_eq(token) => Err(ProgrammerError::StaleCancel),
            Some(_) => {
                self.actions.remove(action_id);
                self.event_lists.remove(action_id);
                token.cancel();
                Ok(())
            }
            None => {
                token.cancel();
                Ok(())
            }
        }
    }

    /// Registers `handler` for unsolicited events named `name`.
    ///
    /// # Errors
    /// Returns [`ProgrammerError::HandlerAlreadyRegistered`] if a handler
    /// is already registered for `name`.
    pub fn register_event_handler(
        &mut self,
        name: impl Into<String>,
        handler: impl FnMut(Event) + 'static,
    ) -> Result<(), ProgrammerError> {
        let name = name.into();
        if self.event_handlers.contains_key(&name) {
            return Err(ProgrammerError::HandlerAlreadyRegistered(name));
        }
        self.event_handlers.insert(name, Box::new(handler));
        Ok(())
    }

    /// Removes the handler registered for `name`, if any.
    pub fn unregister_event_handler(&mut self, name: &str) {
        self.event_handlers.remove(name);
    }

    /// Feeds raw bytes from the transport into the line accumulator and
    /// then the AMI parser, dispatching completed units as they appear.
    ///
    /// # Errors
    /// Propagates [`AmiParseError`] from the underlying parser; a parse
    /// error is fatal to this multiplexer instance.
    pub fn data_received(&mut self, data: &[u8]) -> Result<(), AmiParseError> {
        let lines = self.line_acc.feed(data);
        for line in lines {
            let line = String::from_utf8_lossy(&line).into_owned();
            if let Some(parsed) = self.parser.feed_line(&line)? {
                self.dispatch(parsed);
            }
        }
        Ok(())
    }

    fn dispatch(&mut self, parsed: AmiParsed) {
        match parsed {
            AmiParsed::Greeting { name, version } => {
                if let Some(cb) = self.greeting_handler.take() {
                    cb(name, version);
                }
            }
            AmiParsed::Response(resp) => self.response_received(resp),
            AmiParsed::Event(event) => self.event_received(event),
        }
    }

    fn response_received(&mut self, resp: Response) {
        let action_id = match resp.headers.get("ActionID") {
            Some(id) => id.to_owned(),
            None => return,
        };
        let token = match self.actions.get(&action_id) {
            Some(t) => t.clone(),
            None => {
                #[cfg(feature = "tracing")]
                tracing::warn!(action_id = action_id.as_str(), "response for unknown or stale action id, dropping");
                return;
            }
        };
        if resp.response_type == ResponseType::Error {
            self.actions.remove(&action_id);
            let message = resp.headers.get("Message").unwrap_or("").to_owned();
            let _ = token.set_exception(ActionError::Refused(message));
            return;
        }
        let event_list_header = resp.headers.get("EventList").map(str::to_lowercase);
        if event_list_header.as_deref() == Some("start") {
            self.event_lists.insert(
                action_id,
                EventListInProgress {
                    headers: resp.headers,
                    events: Vec::new(),
                },
            );
            return;
        }
        self.actions.remove(&action_id);
        let _ = token.set_result(ActionResult::Response(resp));
    }

    fn event_received(&mut self, event: Event) {
        let action_id = event.headers.get("ActionID").map(str::to_owned);
        if let Some(action_id) = &action_id {
            if let Some(mut in_progress) = self.event_lists.remove(action_id) {
                let event_list_value = event.headers.get("EventList").map(str::to_lowercase);
                if event_list_value.as_deref() == Some("complete") {
                    for (key, value) in event.headers.iter() {
                        in_progress.headers.insert(key, value.clone());
                    }
                    if let Some(token) = self.actions.remove(action_id) {
                        let _ = token.set_result(ActionResult::EventList(EventList {
                            headers: in_progress.headers,
                            events: in_progress.events,
                        }));
                    }
                    return;
                }
                in_progress.events.push(event);
                self.event_lists.insert(action_id.clone(), in_progress);
                return;
            }
        }
        self.dispatch_event(event);
    }

    fn dispatch_event(&mut self, event: Event) {
        if let Some(handler) = self.event_handlers.get_mut(&event.name) {
            handler(event);
        } else if let Some(handler) = self.unhandled_event_handler.as_mut() {
            handler(event);
        } else {
            #[cfg(feature = "tracing")]
            tracing::info!(name = event.name.as_str(), "unhandled AMI event");
        }
    }

    /// Fires every outstanding action token with
    /// [`ActionError::ConnectionLost`], as though the transport had just
    /// been closed. Outstanding event-list aggregations are treated the
    /// same way.
    pub fn connection_lost(&mut self) {
        for (_, token) in self.actions.drain() {
            let _ = token.set_exception(ActionError::ConnectionLost);
        }
        self.event_lists.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Default)]
    struct RecordingTransport {
        written: Rc<RefCell<Vec<u8>>>,
    }

    impl Transport for RecordingTransport {
        fn write(&mut self, data: &[u8]) {
            self.written.borrow_mut().extend_from_slice(data);
        }
    }

    #[test]
    fn send_action_assigns_and_writes_action_id() {
        let written = Rc::new(RefCell::new(Vec::new()));
        let transport = RecordingTransport {
            written: Rc::clone(&written),
        };
        let mut ami = AmiMultiplexer::new(transport);
        let (_id, _token) = ami.send_action("Ping", HeaderMap::new(), None);
        let out = String::from_utf8(written.borrow().clone()).unwrap();
        assert!(out.contains("Action: Ping\r\n"));
        assert!(out.contains("ActionID: 1\r\n"));
        assert!(out.ends_with("\r\n\r\n"));
    }

    #[test]
    fn response_fires_matching_token() {
        let mut ami = AmiMultiplexer::new(RecordingTransport::default());
        ami.data_received(b"Asterisk Call Manager/1.4\r\n").unwrap();
        let (_id, token) = ami.send_action(
            "Ping",
            {
                let mut h = HeaderMap::new();
                h.insert("ActionID", "1234");
                h
            },
            None,
        );
        let seen = Rc::new(RefCell::new(None));
        let seen2 = Rc::clone(&seen);
        token
            .on_result(move |r| *seen2.borrow_mut() = Some(r))
            .unwrap();
        ami.data_received(
            b"Response: Success\r\nActionID: 1234\r\nAsteriskVersion: 1.8.13\r\n\r\n",
        )
        .unwrap();
        assert!(matches!(&*seen.borrow(), Some(ActionResult::Response(_))));
    }

    #[test]
    fn error_response_fires_exception() {
        let mut ami = AmiMultiplexer::new(RecordingTransport::default());
        ami.data_received(b"Asterisk Call Manager/1.4\r\n").unwrap();
        let (_id, token) = ami.send_action(
            "Originate",
            {
                let mut h = HeaderMap::new();
                h.insert("ActionID", "1");
                h
            },
            None,
        );
        let seen = Rc::new(RefCell::new(None));
        let seen2 = Rc::clone(&seen);
        token
            .on_exception(move |e: ActionError| *seen2.borrow_mut() = Some(e.to_string()))
            .unwrap();
        ami.data_received(b"Response: Error\r\nActionID: 1\r\nMessage: Nope\r\n\r\n")
            .unwrap();
        assert_eq!(seen.borrow().as_deref(), Some("action refused: Nope"));
    }

    #[test]
    fn event_list_aggregation() {
        let mut ami = AmiMultiplexer::new(RecordingTransport::default());
        ami.data_received(b"Asterisk Call Manager/1.4\r\n").unwrap();
        let (_id, token) = ami.send_action(
            "CoreShowChannels",
            {
                let mut h = HeaderMap::new();
                h.insert("ActionID", "7");
                h
            },
            None,
        );
        let seen = Rc::new(RefCell::new(None));
        let seen2 = Rc::clone(&seen);
        token
            .on_result(move |r| *seen2.borrow_mut() = Some(r))
            .unwrap();
        ami.data_received(b"Response: Success\r\nActionID: 7\r\nEventList: start\r\n\r\n")
            .unwrap();
        ami.data_received(b"Event: CoreShowChannel\r\nActionID: 7\r\nChannel: SIP/1\r\n\r\n")
            .unwrap();
        ami.data_received(b"Event: CoreShowChannel\r\nActionID: 7\r\nChannel: SIP/2\r\n\r\n")
            .unwrap();
        ami.data_received(
            b"Event: CoreShowChannelsComplete\r\nActionID: 7\r\nEventList: Complete\r\nListItems: 2\r\n\r\n",
        )
        .unwrap();
        match &*seen.borrow() {
            Some(ActionResult::EventList(list)) => {
                assert_eq!(list.events.len(), 2);
                assert_eq!(list.headers.get("ListItems"), Some("2"));
            }
            other => panic!("expected an event list, got {other:?}"),
        }
    }

    #[test]
    fn unmatched_event_goes_to_named_handler() {
        let mut ami = AmiMultiplexer::new(RecordingTransport::default());
        ami.data_received(b"Asterisk Call Manager/1.4\r\n").unwrap();
        let seen = Rc::new(RefCell::new(None));
        let seen2 = Rc::clone(&seen);
        ami.register_event_handler("Hangup", move |event| {
            *seen2.borrow_mut() = Some(event.headers.get("Uniqueid").unwrap().to_owned());
        })
        .unwrap();
        ami.data_received(b"Event: Hangup\r\nUniqueid: 1.1\r\nCause: 16\r\n\r\n")
            .unwrap();
        assert_eq!(seen.borrow().as_deref(), Some("1.1"));
    }

    #[test]
    fn connection_lost_fires_pending_actions() {
        let mut ami = AmiMultiplexer::new(RecordingTransport::default());
        let (_id, token) = ami.send_action("Ping", HeaderMap::new(), None);
        let seen = Rc::new(RefCell::new(false));
        let seen2 = Rc::clone(&seen);
        token
            .on_exception(move |e| *seen2.borrow_mut() = matches!(e, ActionError::ConnectionLost))
            .unwrap();
        ami.connection_lost();
        assert!(seen.borrow().clone());
    }

    #[test]
    fn cancel_action_detaches_from_action_map() {
        let mut ami = AmiMultiplexer::new(RecordingTransport::default());
        ami.data_received(b"Asterisk Call Manager/1.4\r\n").unwrap();
        let (id, token) = ami.send_action(
            "Ping",
            {
                let mut h = HeaderMap::new();
                h.insert("ActionID", "9");
                h
            },
            None,
        );
        let seen = Rc::new(RefCell::new(false));
        let seen2 = Rc::clone(&seen);
        token.on_result(move |_| *seen2.borrow_mut() = true).unwrap();
        ami.cancel_action(&id, &token).unwrap();
        assert!(token.is_triggered());
        ami.data_received(b"Response: Success\r\nActionID: 9\r\n\r\n")
            .unwrap();
        assert!(!seen.borrow().clone());
    }

    #[test]
    fn cancel_action_rejects_stale_slot() {
        let mut ami = AmiMultiplexer::new(RecordingTransport::default());
        let (id, token) = ami.send_action(
            "Ping",
            {
                let mut h = HeaderMap::new();
                h.insert("ActionID", "9");
                h
            },
            None,
        );
        let other: ActionToken = ActionToken::new();
        assert!(matches!(
            ami.cancel_action(&id, &other),
            Err(ProgrammerError::StaleCancel)
        ));
        assert!(!token.is_triggered());
    }
}
