//! The "direct" AGI channel: a script or FastAGI connection where
//! commands and responses travel over the same transport the environment
//! arrived on. See [`crate::asyncagi`] for the "indirect" channel, which
//! instead splices AGI traffic through an AMI connection.
use std::collections::HashMap;

use crate::agi::parser::{AgiParseError, AgiParser, AgiToken};
use crate::line::LineAccumulator;
use crate::transport::Transport;
use crate::ProgrammerError;

/// Drives an [`AgiParser`] directly against a transport: feeding it bytes
/// as they arrive and writing command lines straight out.
pub struct AgiConnection<T: Transport> {
    transport: T,
    line_acc: LineAccumulator,
    parser: AgiParser,
}

impl<T: Transport> AgiConnection<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            line_acc: LineAccumulator::new(),
            parser: AgiParser::new(),
        }
    }

    /// Binds `cb` as this connection's session-established callback,
    /// fired once the AGI environment block has finished arriving and the
    /// connection is ready to accept commands. See
    /// [`AgiParser::bind_session`].
    pub fn on_established(&mut self, cb: impl FnOnce() + 'static) {
        self.parser.bind_session(cb);
    }

    /// Feeds raw bytes from the transport into the parser.
    ///
    /// # Errors
    /// Propagates [`AgiParseError`]; a parse error is fatal to this
    /// connection.
    pub fn data_received(&mut self, data: &[u8]) -> Result<(), AgiParseError> {
        for line in self.line_acc.feed(data) {
            let line = String::from_utf8_lossy(&line).into_owned();
            self.parser.feed_line(&line)?;
        }
        Ok(())
    }

    /// The AGI environment variables received at connection start.
    pub fn env(&self) -> &HashMap<String, String> {
        self.parser.env()
    }

    /// The positional arguments passed in the request (`agi_arg_N`).
    pub fn argv(&self) -> &[String] {
        self.parser.argv()
    }

    /// Submits an AGI command, writing the escaped command line to the
    /// transport and returning a token that fires with the eventual
    /// response.
    ///
    /// # Errors
    /// Returns [`ProgrammerError::NotIdle`] if a command is already
    /// outstanding, or a forbidden-character error from escaping.
    pub fn send_command(&mut self, args: &[&str]) -> Result<AgiToken, ProgrammerError> {
        let line = self.parser.begin_command(args)?;
        let token = AgiToken::new();
        self.parser.push_pending(token.clone());
        self.transport.write(&line);
        Ok(token)
    }

    /// Fires the pending command token (if any) with a connection-lost
    /// error, as the transport reports its own disconnection.
    pub fn connection_lost(&mut self) {
        self.parser.connection_lost();
    }
}
