//! pbxwire is a framework-agnostic implementation of the two wire protocols a
//! PBX exposes to external controllers: the Manager Interface (AMI) and the
//! Gateway Interface (AGI).
//!
//! pbxwire does not open sockets, does not run an event loop and does not
//! depend on any particular async runtime. It is pushed bytes through
//! `data_received`-style methods and pushes bytes back out through a small
//! [`transport::Transport`] trait; the host is responsible for everything
//! that happens on the wire.
//!
//! To get started with the AMI side, construct an [`ami::AmiMultiplexer`]
//! around something implementing [`transport::Transport`], feed it bytes as
//! they arrive, and submit actions with [`ami::AmiMultiplexer::send_action`]:
//! ```ignore
//! use pbxwire::ami::AmiMultiplexer;
//!
//! let mut ami = AmiMultiplexer::new(my_transport);
//! ami.data_received(b"Asterisk Call Manager/1.4\r\n");
//! let token = ami.send_action("Ping", Default::default(), None);
//! let _ = token.on_result(|resp| println!("got {:?}", resp));
//! ```
//!
//! The AGI side is symmetric: [`agi::AgiParser`] drives a single channel's
//! state machine, and [`asyncagi::AsyncAgiExecutor`] splices AGI traffic for
//! many channels over one AMI connection.
//!
//! pbxwire imposes no particular concurrency model: see the module docs on
//! [`token`] for the single-threaded cooperative semantics every component
//! relies on.
pub mod agi;
pub mod ami;
pub mod asyncagi;
pub mod calls;
pub mod headers;
pub mod line;
pub mod token;
pub mod transport;

/// Errors that indicate API misuse rather than a protocol or network
/// failure.
///
/// These are never produced by malformed wire data; they signal that the
/// caller violated a contract documented on the type it called into
/// (firing a token twice, issuing a command while not idle, and so on).
#[derive(Debug)]
pub enum ProgrammerError {
    /// `set_result`/`set_exception` was called on a token that had already
    /// fired.
    AlreadyTriggered,
    /// A result or exception callback was bound twice on the same token.
    CallbackAlreadyBound,
    /// An operation was attempted on an [`asyncagi::AsyncAgiExecutor`] that
    /// is not currently bound to an [`ami::AmiMultiplexer`].
    ExecutorNotBound,
    /// [`asyncagi::AsyncAgiExecutor::bind`] was called on an executor that
    /// is already bound.
    ExecutorAlreadyBound,
    /// An event handler was registered twice under the same name.
    HandlerAlreadyRegistered(String),
    /// A command was submitted to an [`agi::AgiParser`] that was not in the
    /// `idle` state.
    NotIdle,
    /// An AGI command argument contained a NUL or newline byte, neither of
    /// which can be escaped onto the wire.
    InvalidArgument(char),
    /// A [`token::CompletionToken`] was cancelled while a different token
    /// occupied the same action-id slot. Only reachable after id reuse
    /// following a previous cancel.
    StaleCancel,
}

impl std::fmt::Display for ProgrammerError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::AlreadyTriggered => write!(f, "cannot trigger a completion token a second time"),
            Self::CallbackAlreadyBound => write!(f, "a callback is already bound on this token"),
            Self::ExecutorNotBound => write!(f, "operation on a non-bound executor"),
            Self::ExecutorAlreadyBound => write!(f, "executor is already bound"),
            Self::HandlerAlreadyRegistered(name) => {
                write!(f, "handler already registered for {name}")
            }
            Self::NotIdle => write!(f, "can only send a command while idle"),
            Self::InvalidArgument(c) => {
                write!(f, "command argument contains forbidden character {c:?}")
            }
            Self::StaleCancel => write!(f, "cannot cancel a stale action handler"),
        }
    }
}

impl std::error::Error for ProgrammerError {}
