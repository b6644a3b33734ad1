//! The Manager Interface (AMI): a line-oriented action/response protocol
//! with asynchronous events, all multiplexed over one connection.
pub mod multiplexer;
pub mod parser;

pub use multiplexer::{ActionError, ActionResult, ActionToken, AmiMultiplexer, EventList};
pub use parser::{AmiParseError, AmiParsed, Event, Response, ResponseType};
