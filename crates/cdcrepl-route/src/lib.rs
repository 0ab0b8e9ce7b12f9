//! # cdcrepl-route - routing collaborators
//!
//! - [`named_server`]: pattern-based routing of queries to named backends
//! - [`debug_cli`]: line-oriented admin sessions with a bounded line buffer

pub mod debug_cli;
pub mod named_server;

pub use debug_cli::{
    CliError, CliReply, CommandExecutor, CommandOutcome, DebugCli, LineBuffer, LineOverflow,
    SessionId,
};
pub use named_server::{NamedServerFilter, RouteDecision, RouteError, RouteRule, ServerStatus};
