//! TCToken model and lenient parser for the eID activation client.
//!
//! The TCToken ("activation token") is the bootstrap document an eService
//! hands to the client before card authentication starts. It travels over
//! the open web, so this crate only models and parses it; all trust
//! decisions live in the `eid-activation` crate.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod parse;
pub mod token;

pub use parse::{parse_tc_token, TokenError};
pub use token::{Binding, PathSecurityProtocol, TcToken};
