//! Session conveniences layered on a [`Transport`](crate::ssh::transport::Transport):
//! running commands and keeping an idle connection alive.

pub mod exec;
pub mod keepalive;

pub use exec::CommandOutput;
pub use keepalive::{keepalive_message, KeepaliveTask, KEEPALIVE_PAYLOAD_LEN};
