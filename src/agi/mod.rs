//! The Gateway Interface (AGI): a per-channel request/response protocol
//! carried either directly over its own connection ([`channel`]) or
//! spliced through an AMI connection (see [`crate::asyncagi`]).
pub mod channel;
pub mod parser;

pub use channel::AgiConnection;
pub use parser::{AgiError, AgiParseError, AgiParsed, AgiParser, AgiResponse, AgiToken};
