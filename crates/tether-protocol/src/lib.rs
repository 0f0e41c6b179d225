//! Wire protocol for the tether session broker.
//!
//! A session has two classes of peers: human clients and exactly one runner
//! (the agent process inside the sandbox). Each class has its own inbound and
//! outbound frame set. All frames are JSON text frames tagged with a `type`
//! field; unrecognised fields are ignored for forward compatibility.

pub mod client;
pub mod message;
pub mod runner;

pub use client::{ClientEvent, ClientMessage, ConnectedUser, FileChange, QuestionFrame};
pub use message::{MessageParts, Role, ToolCallStatus, TranscriptMessage};
pub use runner::{GitIdentity, PromptAuthor, RpcKind, RpcOutcome, RunnerCommand, RunnerMessage};
