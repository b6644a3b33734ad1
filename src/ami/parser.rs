//! Line-oriented state machine for the AMI wire syntax.
//!
//! [`AmiParser`] only knows about syntax: greeting line, `Key: value`
//! framing, and the `follows`-response payload block. It has no notion of
//! actions, action ids, or event lists — that correlation logic lives one
//! layer up, in [`crate::ami::multiplexer::AmiMultiplexer`].
use std::fmt;

use crate::headers::HeaderMap;

/// Syntax errors in the AMI byte stream. Fatal to the parser instance that
/// raised them; the caller is expected to discard it (and, in practice,
/// close the connection).
#[derive(Debug, PartialEq, Eq)]
pub enum AmiParseError {
    /// The greeting line wasn't of the form `NAME/VERSION`.
    BadGreeting(String),
    /// A `Key: value` line had no `:`.
    NotAKeyValuePair(String),
    /// The first line of a message was neither `Response:` nor `Event:`.
    UnexpectedFirstKey(String),
    /// A `Response:` line's value wasn't one of the recognized types.
    UnknownResponseType(String),
}

impl fmt::Display for AmiParseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::BadGreeting(line) => write!(f, "invalid greeting line: {line:?}"),
            Self::NotAKeyValuePair(line) => write!(f, "expected a key/value pair, got {line:?}"),
            Self::UnexpectedFirstKey(line) => {
                write!(f, "unexpected first message line: {line:?}")
            }
            Self::UnknownResponseType(value) => write!(f, "invalid response type {value:?}"),
        }
    }
}

impl std::error::Error for AmiParseError {}

/// The kind of an AMI response, taken from its `Response:` header value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseType {
    Success,
    Follows,
    Error,
    Goodbye,
}

impl ResponseType {
    fn from_header_value(value: &str) -> Option<Self> {
        match value.to_lowercase().as_str() {
            "success" => Some(Self::Success),
            "follows" => Some(Self::Follows),
            "error" => Some(Self::Error),
            "goodbye" => Some(Self::Goodbye),
            _ => None,
        }
    }
}

/// A completed AMI response: `Response:` headers plus, for `follows`
/// responses, the accumulated command payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub response_type: ResponseType,
    pub headers: HeaderMap,
    pub payload: Vec<String>,
}

/// A completed, asynchronous AMI event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub name: String,
    pub headers: HeaderMap,
}

/// One parsed unit handed up from [`AmiParser::feed_line`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AmiParsed {
    /// The initial `NAME/VERSION` greeting line.
    Greeting { name: String, version: String },
    Response(Response),
    Event(Event),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Init,
    Idle,
    InResponse,
    InEvent,
    InResponseFollows,
}

const RESPONSE_FOLLOWS_END: &str = "--END COMMAND--";

/// The AMI syntax state machine: feed it lines, get back completed
/// responses and events.
pub struct AmiParser {
    state: State,
    headers: HeaderMap,
    payload: Vec<String>,
    response_type: Option<ResponseType>,
    event_name: Option<String>,
}

impl Default for AmiParser {
    fn default() -> Self {
        Self::new()
    }
}

impl AmiParser {
    pub fn new() -> Self {
        Self {
            state: State::Init,
            headers: HeaderMap::new(),
            payload: Vec::new(),
            response_type: None,
            event_name: None,
        }
    }

    /// Resets the parser to its initial state, as if newly constructed.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    fn split_key_value(line: &str) -> Result<(String, String), AmiParseError> {
        let trimmed = line.trim_end_matches(['\r', '\n']);
        match trimmed.split_once(':') {
            Some((key, value)) => Ok((key.to_owned(), value.trim_start().to_owned())),
            None => Err(AmiParseError::NotAKeyValuePair(trimmed.to_owned())),
        }
    }

    /// Feeds one line (terminator included or not; it is stripped) into
    /// the state machine. Returns `Some` when the line completed a
    /// greeting, response or event.
    #[cfg_attr(feature = "tracing", tracing::instrument(skip(self)))]
    pub fn feed_line(&mut self, line: &str) -> Result<Option<AmiParsed>, AmiParseError> {
        let line = line.trim_end_matches(['\r', '\n']);
        match self.state {
            State::Init => {
                let (name, version) = line
                    .split_once('/')
                    .ok_or_else(|| AmiParseError::BadGreeting(line.to_owned()))?;
                self.state = State::Idle;
                Ok(Some(AmiParsed::Greeting {
                    name: name.to_owned(),
                    version: version.to_owned(),
                }))
            }
            State::Idle => {
                if line.is_empty() {
                    return Ok(None);
                }
                let (key, value) = Self::split_key_value(line)?;
                if key.eq_ignore_ascii_case("response") {
                    let response_type = ResponseType::from_header_value(&value)
                        .ok_or_else(|| AmiParseError::UnknownResponseType(value.clone()))?;
                    self.state = State::InResponse;
                    self.headers = HeaderMap::new();
                    self.payload = Vec::new();
                    self.response_type = Some(response_type);
                    Ok(None)
                } else if key.eq_ignore_ascii_case("event") {
                    self.state = State::InEvent;
                    self.headers = HeaderMap::new();
                    self.event_name = Some(value);
                    Ok(None)
                } else {
                    Err(AmiParseError::UnexpectedFirstKey(line.to_owned()))
                }
            }
            State::InResponse => {
                if line.is_empty() {
                    self.state = State::Idle;
                    return Ok(Some(self.complete_response()));
                }
                let (key, value) = Self::split_key_value(line)?;
                self.headers.insert(key, value);
                if self.response_type == Some(ResponseType::Follows)
                    && self.headers.contains("privilege")
                    && self.headers.contains("actionid")
                {
                    self.state = State::InResponseFollows;
                }
                Ok(None)
            }
            State::InEvent => {
                if line.is_empty() {
                    self.state = State::Idle;
                    return Ok(Some(self.complete_event()));
                }
                let (key, value) = Self::split_key_value(line)?;
                self.headers.insert(key, value);
                Ok(None)
            }
            State::InResponseFollows => {
                if let Some(stripped) = line.strip_suffix(RESPONSE_FOLLOWS_END) {
                    if !stripped.is_empty() {
                        self.payload.push(stripped.to_owned());
                    }
                    self.state = State::Idle;
                    return Ok(Some(self.complete_response()));
                }
                self.payload.push(line.to_owned());
                Ok(None)
            }
        }
    }

    fn complete_response(&mut self) -> AmiParsed {
        AmiParsed::Response(Response {
            response_type: self.response_type.take().expect("response type set on entry"),
            headers: std::mem::take(&mut self.headers),
            payload: std::mem::take(&mut self.payload),
        })
    }

    fn complete_event(&mut self) -> AmiParsed {
        AmiParsed::Event(Event {
            name: self.event_name.take().expect("event name set on entry"),
            headers: std::mem::take(&mut self.headers),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_all(parser: &mut AmiParser, lines: &[&str]) -> Vec<AmiParsed> {
        lines
            .iter()
            .filter_map(|l| parser.feed_line(l).unwrap())
            .collect()
    }

    #[test]
    fn greeting_line() {
        let mut parser = AmiParser::new();
        let results = feed_all(&mut parser, &["Asterisk Call Manager/1.4"]);
        assert_eq!(
            results,
            vec![AmiParsed::Greeting {
                name: "Asterisk Call Manager".to_owned(),
                version: "1.4".to_owned(),
            }]
        );
    }

    #[test]
    fn simple_response() {
        let mut parser = AmiParser::new();
        feed_all(&mut parser, &["Asterisk Call Manager/1.4"]);
        let results = feed_all(
            &mut parser,
            &[
                "Response: Success",
                "ActionID: 1234",
                "AsteriskVersion: 1.8.13",
                "",
            ],
        );
        assert_eq!(results.len(), 1);
        match &results[0] {
            AmiParsed::Response(resp) => {
                assert_eq!(resp.response_type, ResponseType::Success);
                assert_eq!(resp.headers.get("ActionID"), Some("1234"));
                assert!(resp.payload.is_empty());
            }
            other => panic!("expected a response, got {other:?}"),
        }
    }

    #[test]
    fn follows_response_with_payload() {
        let mut parser = AmiParser::new();
        feed_all(&mut parser, &["Asterisk Call Manager/1.4"]);
        let results = feed_all(
            &mut parser,
            &[
                "Response: Follows",
                "Privilege: Command",
                "ActionID: 1234",
                "foo",
                "bar--END COMMAND--",
                "",
            ],
        );
        match &results[0] {
            AmiParsed::Response(resp) => {
                assert_eq!(resp.response_type, ResponseType::Follows);
                assert_eq!(resp.payload, vec!["foo".to_owned(), "bar".to_owned()]);
            }
            other => panic!("expected a response, got {other:?}"),
        }
    }

    #[test]
    fn event() {
        let mut parser = AmiParser::new();
        feed_all(&mut parser, &["Asterisk Call Manager/1.4"]);
        let results = feed_all(
            &mut parser,
            &["Event: Hangup", "Uniqueid: 123.1", "Cause: 16", ""],
        );
        match &results[0] {
            AmiParsed::Event(event) => {
                assert_eq!(event.name, "Hangup");
                assert_eq!(event.headers.get("cause"), Some("16"));
            }
            other => panic!("expected an event, got {other:?}"),
        }
    }

    #[test]
    fn unexpected_first_key_is_an_error() {
        let mut parser = AmiParser::new();
        feed_all(&mut parser, &["Asterisk Call Manager/1.4"]);
        assert!(parser.feed_line("Garbage: true").is_err());
    }

    #[test]
    fn headers_are_case_insensitive_on_the_way_out() {
        let mut parser = AmiParser::new();
        feed_all(&mut parser, &["Asterisk Call Manager/1.4"]);
        let results = feed_all(
            &mut parser,
            &["Response: Success", "AMIversion: 1.1", ""],
        );
        match &results[0] {
            AmiParsed::Response(resp) => {
                assert_eq!(resp.headers.get("amiversion"), Some("1.1"));
                assert_eq!(resp.headers.get("AmiVersion"), Some("1.1"));
            }
            other => panic!("expected a response, got {other:?}"),
        }
    }
}
