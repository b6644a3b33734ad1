//! Line-oriented state machine for the AGI wire syntax: the environment
//! dump, command escaping, and response-code handling (including the
//! multi-line `520` usage-message block).
use std::collections::{HashMap, VecDeque};
use std::fmt;

use crate::token::CompletionToken;
use crate::ProgrammerError;

/// Errors in the AGI byte stream itself (not errors *reported by* AGI
/// commands — see [`AgiError`] for those).
#[derive(Debug, PartialEq, Eq)]
pub enum AgiParseError {
    /// An `agi_KEY: value` line in the environment block had no `:`.
    NotAKeyValuePair(String),
    /// A response line's fourth character wasn't a space or a hyphen.
    MalformedResponseLine(String),
    /// A response code parsed but fell outside `[200, 600)`.
    ResponseCodeOutOfRange(u16),
    /// The leading digits of a response line weren't a valid code.
    UnparsableResponseCode(String),
}

impl fmt::Display for AgiParseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::NotAKeyValuePair(line) => write!(f, "expected a key/value pair, got {line:?}"),
            Self::MalformedResponseLine(line) => write!(f, "invalid response line {line:?}"),
            Self::ResponseCodeOutOfRange(code) => write!(f, "invalid response code {code}"),
            Self::UnparsableResponseCode(line) => {
                write!(f, "response code is not parsable in {line:?}")
            }
        }
    }
}

impl std::error::Error for AgiParseError {}

/// An error reported by the AGI server in answer to a command.
#[derive(Debug)]
pub enum AgiError {
    /// Code 510.
    UnknownCommand(String),
    /// Code 511.
    ForbiddenCommand(String),
    /// Code 520.
    SyntaxError(String),
    /// A successful response line carried `result=-1`.
    CommandFailure(String),
    /// Any other error code `>= 300`.
    Generic(u16, String),
    /// The connection was lost while this command was still pending.
    ConnectionLost,
    /// The command never reached the AGI server: the AMI action carrying
    /// it (Async AGI only) was itself refused or lost.
    ActionFailed(String),
}

impl fmt::Display for AgiError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::UnknownCommand(msg) => write!(f, "{msg}"),
            Self::ForbiddenCommand(msg) => write!(f, "{msg}"),
            Self::SyntaxError(msg) => write!(f, "{msg}"),
            Self::CommandFailure(msg) => write!(f, "{msg}"),
            Self::Generic(code, msg) => write!(f, "AGI error {code}: {msg}"),
            Self::ConnectionLost => write!(f, "connection lost while command was pending"),
            Self::ActionFailed(msg) => write!(f, "underlying AMI action failed: {msg}"),
        }
    }
}

impl std::error::Error for AgiError {}

/// The parsed payload of a successful AGI response line, e.g.
/// `result=0 (foobar) endpos=1234`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgiResponse {
    pub result: i64,
    pub variables: HashMap<String, String>,
    pub data: Option<String>,
}

pub type AgiToken = CompletionToken<AgiResponse, AgiError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Init,
    Idle,
    AwaitingResponse,
    InResponse,
}

/// Unit returned by [`AgiParser::feed_line`] when the environment block
/// has just finished accumulating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgiParsed {
    EnvironmentReady,
}

/// The AGI protocol state machine for one channel.
///
/// Command submission is split into two steps on purpose:
/// [`AgiParser::begin_command`] validates and encodes the command line
/// without touching the pending-command queue, and
/// [`AgiParser::push_pending`] enqueues the token that the eventual
/// response should fire. This split exists because the two AGI channel
/// kinds (direct — written straight to the same transport — and the
/// Async AGI indirect kind) push the token at different points relative
/// to transmitting the bytes, and keeping that decision outside the
/// parser avoids the parser needing a back-reference to its channel.
pub struct AgiParser {
    state: State,
    env: HashMap<String, String>,
    argv: Vec<String>,
    commands: VecDeque<AgiToken>,
    resp_code: Option<u16>,
    resp_message: String,
    session_established: Option<Box<dyn FnOnce()>>,
}

impl Default for AgiParser {
    fn default() -> Self {
        Self::new()
    }
}

impl AgiParser {
    pub fn new() -> Self {
        Self {
            state: State::Init,
            env: HashMap::new(),
            argv: Vec::new(),
            commands: VecDeque::new(),
            resp_code: None,
            resp_message: String::new(),
            session_established: None,
        }
    }

    /// Resets to the initial state, discarding any accumulated
    /// environment and pending commands.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Binds `cb` as this parser's session: fired exactly once, when the
    /// environment block finishes accumulating and the parser transitions
    /// to `idle` (spec.md §4.6's "a bound session callback fires here").
    /// Overwrites any previously bound session callback.
    pub fn bind_session(&mut self, cb: impl FnOnce() + 'static) {
        self.session_established = Some(Box::new(cb));
    }

    /// The environment variables received so far (without the `agi_`
    /// prefix).
    pub fn env(&self) -> &HashMap<String, String> {
        &self.env
    }

    /// The positional arguments received from `agi_arg_N` headers, in
    /// order.
    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    /// Whether the parser is idle (no command outstanding).
    pub fn is_idle(&self) -> bool {
        matches!(self.state, State::Idle)
    }

    fn split_key_value(line: &str) -> Result<(String, String), AgiParseError> {
        let trimmed = line.trim_end_matches(['\r', '\n']);
        match trimmed.split_once(':') {
            Some((key, value)) => Ok((key.to_owned(), value.trim_start().to_owned())),
            None => Err(AgiParseError::NotAKeyValuePair(trimmed.to_owned())),
        }
    }

    /// Feeds one line (its terminator, if any, is ignored) into the state
    /// machine.
    #[cfg_attr(feature = "tracing", tracing::instrument(skip(self)))]
    pub fn feed_line(&mut self, line: &str) -> Result<Option<AgiParsed>, AgiParseError> {
        match self.state {
            State::Init => {
                let trimmed = line.trim_end_matches(['\r', '\n']);
                if trimmed.is_empty() {
                    self.state = State::Idle;
                    if let Some(cb) = self.session_established.take() {
                        cb();
                    }
                    return Ok(Some(AgiParsed::EnvironmentReady));
                }
                let (key, value) = Self::split_key_value(trimmed)?;
                let Some(agi_var) = key.strip_prefix("agi_") else {
                    // Not a recognized `agi_` variable; ignore rather than
                    // erroring, matching how unknown custom setups behave.
                    return Ok(None);
                };
                if let Some(arg_suffix) = agi_var.strip_prefix("arg_") {
                    if let Ok(num) = arg_suffix.parse::<usize>() {
                        if num == self.argv.len() + 1 {
                            self.argv.push(value);
                            return Ok(None);
                        }
                    }
                }
                self.env.insert(agi_var.to_owned(), value);
                Ok(None)
            }
            State::Idle => Ok(None),
            State::AwaitingResponse => {
                let bytes = line.as_bytes();
                if bytes.len() < 4 || !(bytes[3] == b' ' || bytes[3] == b'-') {
                    return Err(AgiParseError::MalformedResponseLine(line.to_owned()));
                }
                let code: u16 = line[..3]
                    .parse()
                    .map_err(|_| AgiParseError::UnparsableResponseCode(line.to_owned()))?;
                if !(200..600).contains(&code) {
                    return Err(AgiParseError::ResponseCodeOutOfRange(code));
                }
                let tail = &line[4..];
                if code < 300 {
                    self.deliver_success(tail.trim_end_matches(['\r', '\n']));
                    return Ok(None);
                }
                if code == 520 && tail.contains("follows") {
                    self.resp_code = Some(code);
                    self.resp_message = tail.to_owned();
                    self.state = State::InResponse;
                    return Ok(None);
                }
                self.deliver_error(code, tail.trim_end_matches(['\r', '\n']));
                Ok(None)
            }
            State::InResponse => {
                let code = self.resp_code.expect("resp_code set on entry to InResponse");
                if line.starts_with(&format!("{code} ")) {
                    let message = std::mem::take(&mut self.resp_message);
                    self.resp_code = None;
                    self.deliver_error(code, &message);
                    return Ok(None);
                }
                if line.ends_with("520 End of proper usage.\n") {
                    self.resp_message.push_str(line);
                    let message = std::mem::take(&mut self.resp_message);
                    self.resp_code = None;
                    self.deliver_error(code, &message);
                    return Ok(None);
                }
                self.resp_message.push_str(line);
                Ok(None)
            }
        }
    }

    fn pop_command(&mut self) -> Option<AgiToken> {
        let token = self.commands.pop_front();
        self.state = if self.commands.is_empty() {
            State::Idle
        } else {
            State::AwaitingResponse
        };
        token
    }

    fn deliver_success(&mut self, body: &str) {
        let (result, variables, data) = Self::parse_result(body);
        let Some(token) = self.pop_command() else {
            return;
        };
        if result < 0 {
            let _ = token.set_exception(AgiError::CommandFailure(body.to_owned()));
        } else {
            let _ = token.set_result(AgiResponse {
                result,
                variables,
                data,
            });
        }
    }

    fn deliver_error(&mut self, code: u16, message: &str) {
        let Some(token) = self.pop_command() else {
            return;
        };
        let exc = match code {
            510 => AgiError::UnknownCommand(message.to_owned()),
            511 => AgiError::ForbiddenCommand(message.to_owned()),
            520 => AgiError::SyntaxError(message.to_owned()),
            other => AgiError::Generic(other, message.to_owned()),
        };
        let _ = token.set_exception(exc);
    }

    /// Parses `result=<int>`, any `key=value` tokens, and a single
    /// parenthesized data field out of a successful response's tail, e.g.
    /// `result=1 (foo bar) endpos=123`.
    fn parse_result(line: &str) -> (i64, HashMap<String, String>, Option<String>) {
        let mut result = 0i64;
        let mut variables = HashMap::new();
        let mut data_parts: Vec<String> = Vec::new();
        let mut in_data = false;
        for part in line.split(' ') {
            if in_data {
                if let Some(stripped) = part.strip_suffix(')') {
                    data_parts.push(stripped.to_owned());
                    in_data = false;
                } else {
                    data_parts.push(part.to_owned());
                }
                continue;
            }
            if let Some(rest) = part.strip_prefix('(') {
                if let Some(inner) = rest.strip_suffix(')') {
                    data_parts.push(inner.to_owned());
                } else {
                    data_parts.push(rest.to_owned());
                    in_data = true;
                }
                continue;
            }
            match part.split_once('=') {
                Some(("result", value)) => {
                    result = value.parse().unwrap_or(0);
                }
                Some((key, value)) => {
                    variables.insert(key.to_owned(), value.to_owned());
                }
                None => {}
            }
        }
        let data = if data_parts.is_empty() {
            None
        } else {
            Some(data_parts.join(" "))
        };
        (result, variables, data)
    }

    fn escape_arg(arg: &str) -> Result<String, ProgrammerError> {
        if arg.contains('\0') {
            return Err(ProgrammerError::InvalidArgument('\0'));
        }
        if arg.contains('\n') {
            return Err(ProgrammerError::InvalidArgument('\n'));
        }
        let escaped = arg.replace('\\', "\\\\").replace('"', "\\\"");
        if arg.is_empty() || escaped != arg || arg.contains(' ') || arg.contains('\t') {
            Ok(format!("\"{escaped}\""))
        } else {
            Ok(escaped)
        }
    }

    /// Validates that the parser is idle, escapes and joins `args`, and
    /// transitions to `awaiting-response`. Returns the encoded command
    /// line (including trailing `\n`), ready to be transmitted. Does NOT
    /// enqueue any completion token — call [`AgiParser::push_pending`]
    /// once the caller has decided when the token should join the FIFO.
    ///
    /// # Errors
    /// Returns [`ProgrammerError::NotIdle`] if a command is already
    /// outstanding, or [`ProgrammerError::InvalidArgument`] if an argument
    /// contains a NUL or newline byte.
    pub fn begin_command(&mut self, args: &[&str]) -> Result<Vec<u8>, ProgrammerError> {
        if !matches!(self.state, State::Idle) {
            return Err(ProgrammerError::NotIdle);
        }
        let mut escaped = Vec::with_capacity(args.len());
        for arg in args {
            escaped.push(Self::escape_arg(arg)?);
        }
        let mut line = escaped.join(" ");
        line.push('\n');
        self.state = State::AwaitingResponse;
        Ok(line.into_bytes())
    }

    /// Enqueues `token` as the next command awaiting a response.
    pub fn push_pending(&mut self, token: AgiToken) {
        self.commands.push_back(token);
    }

    /// Fires every still-pending command token with
    /// [`AgiError::ConnectionLost`].
    pub fn connection_lost(&mut self) {
        for token in self.commands.drain(..) {
            let _ = token.set_exception(AgiError::ConnectionLost);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn environment_block_populates_env_and_argv() {
        let mut parser = AgiParser::new();
        for line in [
            "agi_channel: SIP/1\n",
            "agi_arg_1: hello\n",
            "agi_arg_2: world\n",
            "\n",
        ] {
            let _ = parser.feed_line(line).unwrap();
        }
        assert!(parser.is_idle());
        assert_eq!(parser.env().get("channel"), Some(&"SIP/1".to_owned()));
        assert_eq!(parser.argv(), &["hello".to_owned(), "world".to_owned()]);
    }

    #[test]
    fn bound_session_fires_once_when_environment_completes() {
        let mut parser = AgiParser::new();
        let fired = Rc::new(RefCell::new(0u32));
        let fired2 = Rc::clone(&fired);
        parser.bind_session(move || *fired2.borrow_mut() += 1);
        parser.feed_line("agi_channel: SIP/1\n").unwrap();
        assert_eq!(*fired.borrow(), 0);
        parser.feed_line("\n").unwrap();
        assert_eq!(*fired.borrow(), 1);
        parser.feed_line("200 result=0\n").unwrap();
        assert_eq!(*fired.borrow(), 1);
    }

    #[test]
    fn command_escaping_plain() {
        let mut parser = AgiParser::new();
        parser.feed_line("\n").unwrap();
        let line = parser
            .begin_command(&["set", "variable", "foo", "bar"])
            .unwrap();
        assert_eq!(line, b"set variable foo bar\n");
    }

    #[test]
    fn command_escaping_whitespace() {
        let mut parser = AgiParser::new();
        parser.feed_line("\n").unwrap();
        let line = parser
            .begin_command(&["set", "variable", "some\tspaced data", "bar"])
            .unwrap();
        assert_eq!(line, "set variable \"some\tspaced data\" bar\n".as_bytes());
    }

    #[test]
    fn command_escaping_quotes_and_backslash() {
        let mut parser = AgiParser::new();
        parser.feed_line("\n").unwrap();
        let line = parser
            .begin_command(&["set", "variable", "some\"quoted\"\\data", "bar"])
            .unwrap();
        assert_eq!(
            line,
            "set variable \"some\\\"quoted\\\"\\\\data\" bar\n".as_bytes()
        );
    }

    #[test]
    fn successful_response_fires_token_with_parsed_fields() {
        let mut parser = AgiParser::new();
        parser.feed_line("\n").unwrap();
        let token = AgiToken::new();
        parser.begin_command(&["stream", "file"]).unwrap();
        parser.push_pending(token.clone());
        let seen = Rc::new(RefCell::new(None));
        let seen2 = Rc::clone(&seen);
        token.on_result(move |r| *seen2.borrow_mut() = Some(r)).unwrap();
        parser
            .feed_line("200 result=0 (foobar) endpos=1234\n")
            .unwrap();
        let resp = seen.borrow().clone().unwrap();
        assert_eq!(resp.result, 0);
        assert_eq!(resp.data.as_deref(), Some("foobar"));
        assert_eq!(resp.variables.get("endpos"), Some(&"1234".to_owned()));
        assert!(parser.is_idle());
    }

    #[test]
    fn unknown_command_error() {
        let mut parser = AgiParser::new();
        parser.feed_line("\n").unwrap();
        let token = AgiToken::new();
        parser.begin_command(&["bogus"]).unwrap();
        parser.push_pending(token.clone());
        let seen = Rc::new(RefCell::new(None));
        let seen2 = Rc::clone(&seen);
        token
            .on_exception(move |e| *seen2.borrow_mut() = Some(e.to_string()))
            .unwrap();
        parser.feed_line("510 some message\n").unwrap();
        assert_eq!(seen.borrow().as_deref(), Some("some message"));
    }

    #[test]
    fn result_negative_one_is_command_failure() {
        let mut parser = AgiParser::new();
        parser.feed_line("\n").unwrap();
        let token = AgiToken::new();
        parser.begin_command(&["exec"]).unwrap();
        parser.push_pending(token.clone());
        let seen = Rc::new(RefCell::new(false));
        let seen2 = Rc::clone(&seen);
        token
            .on_exception(move |e| *seen2.borrow_mut() = matches!(e, AgiError::CommandFailure(_)))
            .unwrap();
        parser.feed_line("200 result=-1\n").unwrap();
        assert!(seen.borrow().clone());
    }

    #[test]
    fn multiline_520_usage_message() {
        let mut parser = AgiParser::new();
        parser.feed_line("\n").unwrap();
        let token = AgiToken::new();
        parser.begin_command(&["exec", "foo"]).unwrap();
        parser.push_pending(token.clone());
        let seen = Rc::new(RefCell::new(None));
        let seen2 = Rc::clone(&seen);
        token
            .on_exception(move |e| *seen2.borrow_mut() = Some(e.to_string()))
            .unwrap();
        parser.feed_line("520-Invalid command syntax. Proper usage follows:\n").unwrap();
        parser.feed_line("Exec <appname> [args]\n").unwrap();
        parser.feed_line("520 End of proper usage.\n").unwrap();
        assert!(seen.borrow().as_deref().unwrap().starts_with("Invalid command syntax"));
        assert!(parser.is_idle());
    }

    #[test]
    fn newline_in_argument_is_rejected() {
        let mut parser = AgiParser::new();
        parser.feed_line("\n").unwrap();
        assert!(matches!(
            parser.begin_command(&["exec", "foo\nbar"]),
            Err(ProgrammerError::InvalidArgument('\n'))
        ));
    }

    #[test]
    fn send_command_while_not_idle_is_programmer_error() {
        let mut parser = AgiParser::new();
        parser.feed_line("\n").unwrap();
        parser.begin_command(&["foo"]).unwrap();
        assert!(matches!(
            parser.begin_command(&["bar"]),
            Err(ProgrammerError::NotIdle)
        ));
    }

    #[test]
    fn connection_lost_fires_pending_command() {
        let mut parser = AgiParser::new();
        parser.feed_line("\n").unwrap();
        let token = AgiToken::new();
        parser.begin_command(&["exec"]).unwrap();
        parser.push_pending(token.clone());
        let seen = Rc::new(RefCell::new(false));
        let seen2 = Rc::clone(&seen);
        token
            .on_exception(move |e| *seen2.borrow_mut() = matches!(e, AgiError::ConnectionLost))
            .unwrap();
        parser.connection_lost();
        assert!(seen.borrow().clone());
    }
}
