//! Splices AGI command/response traffic for many channels across one AMI
//! connection, using `AsyncAGI` events instead of a dedicated socket per
//! channel.
//!
//! Binding ties an executor to exactly one [`crate::ami::AmiMultiplexer`]
//! by registering an `AsyncAGI` event handler. Because
//! [`crate::ami::AmiMultiplexer::register_event_handler`] requires a
//! `'static` closure, and this executor's own state needs to be mutated
//! from inside that closure, [`AsyncAgiExecutor::bind`] takes the executor
//! wrapped in `Rc<RefCell<_>>`: the multiplexer ends up holding a clone of
//! that `Rc` inside its event handler, but the executor itself never holds
//! a reference back to the multiplexer, so there is no cycle. Command
//! routing ([`AsyncAgiExecutor::send_command`]) instead takes the
//! multiplexer as a plain `&mut` argument, since it is always called by
//! the host directly rather than from within event dispatch.
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use percent_encoding::percent_decode_str;
use rand::RngCore;
use sha1::{Digest, Sha1};

use crate::agi::{AgiError, AgiParser, AgiToken};
use crate::ami::{ActionError, AmiMultiplexer, Event};
use crate::headers::HeaderMap;
use crate::transport::Transport;
use crate::ProgrammerError;

/// Failure modes specific to routing a command through an executor, as
/// opposed to an error reported by the AGI server itself (those arrive on
/// the returned [`AgiToken`]).
#[derive(Debug)]
pub enum AsyncAgiSendError {
    /// The executor has not been [`AsyncAgiExecutor::bind`]-ed to an AMI
    /// multiplexer.
    NotBound,
    /// No Async AGI channel with this server-assigned id is currently
    /// known to the executor.
    UnknownChannel(String),
    /// A command is already outstanding on this channel.
    NotIdle,
}

impl fmt::Display for AsyncAgiSendError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::NotBound => write!(f, "operation on a non-bound executor"),
            Self::UnknownChannel(id) => write!(f, "no Async AGI channel with id {id:?}"),
            Self::NotIdle => write!(f, "can only send a command while idle"),
        }
    }
}

impl std::error::Error for AsyncAgiSendError {}

struct AsyncAgiChannel {
    parser: AgiParser,
    // Command ID => token awaiting the matching AsyncAGI Exec event.
    commands: HashMap<String, AgiToken>,
}

/// Dispatches between a single AMI connection and an arbitrary number of
/// AGI channels, one per live Async AGI session.
pub struct AsyncAgiExecutor {
    bound: bool,
    channels: HashMap<String, Rc<RefCell<AsyncAgiChannel>>>,
    command_id_stem: String,
    next_command_seq: u64,
    protocol_factory: Box<dyn FnMut() -> AgiParser>,
    // Shared with every channel's bound parser session so a channel
    // established while this field is rebound still calls the handler in
    // place at the time it fires.
    channel_established: Rc<RefCell<Option<Box<dyn FnMut(&str)>>>>,
}

fn random_command_id_stem() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    let digest = Sha1::digest(bytes);
    hex::encode(digest)[..10].to_owned()
}

/// Splits a decoded AGI data block into lines, each retaining its `\n`
/// terminator, mirroring Python's `str.splitlines(keepends=True)` for the
/// LF-only framing AGI uses internally.
fn lines_with_terminators(s: &str) -> Vec<&str> {
    let mut lines = Vec::new();
    let mut start = 0;
    for (i, c) in s.char_indices() {
        if c == '\n' {
            lines.push(&s[start..=i]);
            start = i + 1;
        }
    }
    if start < s.len() {
        lines.push(&s[start..]);
    }
    lines
}

impl AsyncAgiExecutor {
    /// Creates a new, unbound executor. `protocol_factory` is called once
    /// per new Async AGI channel to produce the [`AgiParser`] that will
    /// drive it.
    pub fn new(protocol_factory: impl FnMut() -> AgiParser + 'static) -> Self {
        Self {
            bound: false,
            channels: HashMap::new(),
            command_id_stem: random_command_id_stem(),
            next_command_seq: 1,
            protocol_factory: Box::new(protocol_factory),
            channel_established: Rc::new(RefCell::new(None)),
        }
    }

    /// Whether this executor is currently bound to an AMI multiplexer.
    pub fn is_bound(&self) -> bool {
        self.bound
    }

    /// Registers `cb` to be called with the server-assigned channel id
    /// once a new Async AGI channel's environment has finished arriving
    /// (`SubEvent: Start`) and its per-channel [`AgiParser`] session is
    /// established — see spec.md §4.7 Start and the testable property "a
    /// session is bound and its established callback fires". Without this,
    /// a caller has no way to learn a channel's id in order to
    /// [`AsyncAgiExecutor::send_command`] on it. Overwrites any previously
    /// registered callback.
    pub fn on_channel_started(&mut self, cb: impl FnMut(&str) + 'static) {
        *self.channel_established.borrow_mut() = Some(Box::new(cb));
    }

    /// The server-assigned ids of every currently live Async AGI channel.
    pub fn channel_ids(&self) -> impl Iterator<Item = &str> {
        self.channels.keys().map(String::as_str)
    }

    fn next_command_id(&mut self) -> String {
        let seq = self.next_command_seq;
        self.next_command_seq += 1;
        format!("{seq}-{}", self.command_id_stem)
    }

    /// Binds `executor` to `ami`, registering an `AsyncAGI` event handler.
    ///
    /// # Errors
    /// Returns [`ProgrammerError::ExecutorAlreadyBound`] if already bound.
    pub fn bind<T: Transport + 'static>(
        executor: &Rc<RefCell<Self>>,
        ami: &mut AmiMultiplexer<T>,
    ) -> Result<(), ProgrammerError> {
        if executor.borrow().bound {
            return Err(ProgrammerError::ExecutorAlreadyBound);
        }
        let handle = Rc::clone(executor);
        ami.register_event_handler("AsyncAGI", move |event| {
            handle.borrow_mut().handle_event(&event);
        })?;
        executor.borrow_mut().bound = true;
        Ok(())
    }

    /// Unbinds `executor` from `ami`, removing the `AsyncAGI` event
    /// handler.
    ///
    /// # Errors
    /// Returns [`ProgrammerError::ExecutorNotBound`] if not currently
    /// bound.
    pub fn unbind<T: Transport>(
        executor: &Rc<RefCell<Self>>,
        ami: &mut AmiMultiplexer<T>,
    ) -> Result<(), ProgrammerError> {
        if !executor.borrow().bound {
            return Err(ProgrammerError::ExecutorNotBound);
        }
        ami.unregister_event_handler("AsyncAGI");
        executor.borrow_mut().bound = false;
        Ok(())
    }

    fn handle_event(&mut self, event: &Event) {
        match event.headers.get("SubEvent") {
            Some("Start") => self.asyncagi_start(event),
            Some("Exec") => self.asyncagi_exec(event),
            Some("End") => self.asyncagi_end(event),
            #[cfg(feature = "tracing")]
            other => tracing::warn!(?other, "unknown AsyncAGI subevent received"),
            #[cfg(not(feature = "tracing"))]
            _ => {}
        }
    }

    fn asyncagi_start(&mut self, event: &Event) {
        let Some(channel_id) = event.headers.get("Channel") else {
            return;
        };
        if self.channels.contains_key(channel_id) {
            #[cfg(feature = "tracing")]
            tracing::error!(channel_id, "received new AsyncAGI start for bound channel");
            return;
        }
        let mut parser = (self.protocol_factory)();
        let handler = Rc::clone(&self.channel_established);
        let channel_id_owned = channel_id.to_owned();
        parser.bind_session(move || {
            if let Some(cb) = handler.borrow_mut().as_mut() {
                cb(&channel_id_owned);
            }
        });
        let env_value = event.headers.get("Env").unwrap_or("");
        let decoded: Vec<u8> = percent_decode_str(env_value).collect();
        let text = String::from_utf8_lossy(&decoded).into_owned();
        for line in lines_with_terminators(&text) {
            if parser.feed_line(line).is_err() {
                return;
            }
        }
        if !parser.is_idle() {
            #[cfg(feature = "tracing")]
            tracing::error!(
                channel_id,
                "invalid AGI protocol state after AsyncAGI Start"
            );
            return;
        }
        self.channels.insert(
            channel_id.to_owned(),
            Rc::new(RefCell::new(AsyncAgiChannel {
                parser,
                commands: HashMap::new(),
            })),
        );
    }

    fn asyncagi_exec(&mut self, event: &Event) {
        let Some(channel_id) = event.headers.get("Channel") else {
            return;
        };
        let Some(command_id) = event.headers.get("CommandID") else {
            return;
        };
        let Some(channel_rc) = self.channels.get(channel_id) else {
            #[cfg(feature = "tracing")]
            tracing::warn!(channel_id, "AsyncAGI exec for unknown channel");
            return;
        };
        let mut channel = channel_rc.borrow_mut();
        let Some(token) = channel.commands.remove(command_id) else {
            #[cfg(feature = "tracing")]
            tracing::warn!(channel_id, command_id, "AsyncAGI exec for unknown command");
            return;
        };
        channel.parser.push_pending(token);
        let result_value = event.headers.get("Result").unwrap_or("");
        let decoded: Vec<u8> = percent_decode_str(result_value).collect();
        let text = String::from_utf8_lossy(&decoded).into_owned();
        for line in lines_with_terminators(&text) {
            if channel.parser.feed_line(line).is_err() {
                return;
            }
        }
        if !channel.parser.is_idle() {
            #[cfg(feature = "tracing")]
            tracing::error!(
                channel_id,
                "invalid AGI protocol state after AsyncAGI Exec (bad Result line?)"
            );
        }
    }

    fn asyncagi_end(&mut self, event: &Event) {
        let Some(channel_id) = event.headers.get("Channel") else {
            return;
        };
        let Some(channel_rc) = self.channels.remove(channel_id) else {
            #[cfg(feature = "tracing")]
            tracing::warn!(channel_id, "AsyncAGI end for unknown channel");
            return;
        };
        let mut channel = channel_rc.borrow_mut();
        channel.parser.connection_lost();
        for (_, token) in channel.commands.drain() {
            let _ = token.set_exception(AgiError::ConnectionLost);
        }
    }

    /// Submits an AGI command on the given channel, routing it out as an
    /// `AGI` action over `ami`. The returned token fires with the eventual
    /// AGI response once the matching `AsyncAGI Exec` event arrives; if the
    /// underlying `AGI` action itself is refused, the token fires directly
    /// with that failure.
    ///
    /// # Errors
    /// See [`AsyncAgiSendError`].
    pub fn send_command<T: Transport>(
        &mut self,
        ami: &mut AmiMultiplexer<T>,
        channel_id: &str,
        args: &[&str],
    ) -> Result<AgiToken, AsyncAgiSendError> {
        if !self.bound {
            return Err(AsyncAgiSendError::NotBound);
        }
        let channel_rc = self
            .channels
            .get(channel_id)
            .ok_or_else(|| AsyncAgiSendError::UnknownChannel(channel_id.to_owned()))?
            .clone();
        let line = {
            let mut channel = channel_rc.borrow_mut();
            channel
                .parser
                .begin_command(args)
                .map_err(|_| AsyncAgiSendError::NotIdle)?
        };
        let command_line = String::from_utf8_lossy(&line).trim_end().to_owned();
        let command_id = self.next_command_id();

        let mut headers = HeaderMap::new();
        headers.insert("Command", command_line);
        headers.insert("CommandID", command_id.clone());
        headers.insert("Channel", channel_id.to_owned());
        let action_token = ami.send_action("AGI", headers, None);

        let user_token: AgiToken = AgiToken::new();

        let channel_for_success = Rc::clone(&channel_rc);
        let user_token_for_success = user_token.clone();
        let command_id_for_success = command_id.clone();
        let _ = action_token.on_result(move |_resp| {
            channel_for_success
                .borrow_mut()
                .commands
                .insert(command_id_for_success, user_token_for_success);
        });
        let user_token_for_failure = user_token.clone();
        let _ = action_token.on_exception(move |exc: ActionError| {
            let _ = user_token_for_failure.set_exception(AgiError::ActionFailed(exc.to_string()));
        });

        Ok(user_token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
    use std::cell::RefCell as StdRefCell;

    #[derive(Default)]
    struct RecordingTransport {
        written: Rc<StdRefCell<Vec<u8>>>,
    }

    impl Transport for RecordingTransport {
        fn write(&mut self, data: &[u8]) {
            self.written.borrow_mut().extend_from_slice(data);
        }
    }

    fn encode(s: &str) -> String {
        utf8_percent_encode(s, NON_ALPHANUMERIC).to_string()
    }

    #[test]
    fn start_registers_one_idle_channel() {
        let mut ami = AmiMultiplexer::new(RecordingTransport::default());
        let executor = Rc::new(RefCell::new(AsyncAgiExecutor::new(AgiParser::new)));
        AsyncAgiExecutor::bind(&executor, &mut ami).unwrap();

        let env = encode("agi_channel: SIP/1\nagi_uniqueid: 1.1\n\n");
        let mut h = HeaderMap::new();
        h.insert("SubEvent", "Start");
        h.insert("Channel", "SIP/1-000001");
        h.insert("Env", env);
        executor
            .borrow_mut()
            .handle_event(&Event {
                name: "AsyncAGI".to_owned(),
                headers: h,
            });
        assert_eq!(executor.borrow().channels.len(), 1);
    }

    #[test]
    fn start_fires_channel_established_callback_with_channel_id() {
        let mut ami = AmiMultiplexer::new(RecordingTransport::default());
        let executor = Rc::new(RefCell::new(AsyncAgiExecutor::new(AgiParser::new)));
        AsyncAgiExecutor::bind(&executor, &mut ami).unwrap();

        let seen = Rc::new(StdRefCell::new(None));
        let seen2 = Rc::clone(&seen);
        executor
            .borrow_mut()
            .on_channel_started(move |id| *seen2.borrow_mut() = Some(id.to_owned()));

        let env = encode("agi_channel: SIP/1\nagi_uniqueid: 1.1\n\n");
        let mut h = HeaderMap::new();
        h.insert("SubEvent", "Start");
        h.insert("Channel", "SIP/1-000001");
        h.insert("Env", env);
        executor.borrow_mut().handle_event(&Event {
            name: "AsyncAGI".to_owned(),
            headers: h,
        });

        assert_eq!(seen.borrow().as_deref(), Some("SIP/1-000001"));
        assert_eq!(
            executor.borrow().channel_ids().collect::<Vec<_>>(),
            vec!["SIP/1-000001"]
        );
    }

    #[test]
    fn end_on_unknown_channel_is_a_noop() {
        let executor = Rc::new(RefCell::new(AsyncAgiExecutor::new(AgiParser::new)));
        let mut h = HeaderMap::new();
        h.insert("SubEvent", "End");
        h.insert("Channel", "nope");
        executor.borrow_mut().handle_event(&Event {
            name: "AsyncAGI".to_owned(),
            headers: h,
        });
        assert!(executor.borrow().channels.is_empty());
    }

    #[test]
    fn full_round_trip_through_exec() {
        let mut ami = AmiMultiplexer::new(RecordingTransport::default());
        let executor = Rc::new(RefCell::new(AsyncAgiExecutor::new(AgiParser::new)));
        AsyncAgiExecutor::bind(&executor, &mut ami).unwrap();

        let env = encode("agi_channel: SIP/1\n\n");
        let mut start_headers = HeaderMap::new();
        start_headers.insert("SubEvent", "Start");
        start_headers.insert("Channel", "SIP/1-000001");
        start_headers.insert("Env", env);
        ami.data_received(b"Asterisk Call Manager/1.4\r\n").unwrap();
        executor.borrow_mut().handle_event(&Event {
            name: "AsyncAGI".to_owned(),
            headers: start_headers,
        });

        let token = executor
            .borrow_mut()
            .send_command(&mut ami, "SIP/1-000001", &["noop"])
            .unwrap();
        let seen = Rc::new(StdRefCell::new(None));
        let seen2 = Rc::clone(&seen);
        token.on_result(move |r| *seen2.borrow_mut() = Some(r)).unwrap();

        // The AGI action was assigned ActionID 1; answer it successfully.
        ami.data_received(b"Response: Success\r\nActionID: 1\r\n\r\n")
            .unwrap();

        let result = encode("200 result=0 (foobar) endpos=1234\n");
        let mut exec_headers = HeaderMap::new();
        exec_headers.insert("SubEvent", "Exec");
        exec_headers.insert("Channel", "SIP/1-000001");
        exec_headers.insert("CommandID", "1-".to_owned() + &executor.borrow().command_id_stem);
        exec_headers.insert("Result", result);
        executor.borrow_mut().handle_event(&Event {
            name: "AsyncAGI".to_owned(),
            headers: exec_headers,
        });

        let resp = seen.borrow().clone().unwrap();
        assert_eq!(resp.result, 0);
        assert_eq!(resp.data.as_deref(), Some("foobar"));
    }

    #[test]
    fn distinct_executors_draw_disjoint_command_ids() {
        let mut seen = std::collections::HashSet::new();
        for _ in 0..20 {
            let mut executor = AsyncAgiExecutor::new(AgiParser::new);
            let id = executor.next_command_id();
            assert!(seen.insert(id), "command id collided across executors");
        }
    }

    #[test]
    fn one_executor_draws_increasing_sequence_numbers() {
        let mut executor = AsyncAgiExecutor::new(AgiParser::new);
        let first = executor.next_command_id();
        let second = executor.next_command_id();
        assert_ne!(first, second);
        assert!(first.starts_with("1-"));
        assert!(second.starts_with("2-"));
        assert_eq!(
            first.split_once('-').unwrap().1,
            second.split_once('-').unwrap().1
        );
    }
}
