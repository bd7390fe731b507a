//! Replicated container state machine applied on top of a Raft-style
//! consensus log in a distributed object store.

pub mod apply;
pub mod cache;
pub mod command;
pub mod config;
pub mod container_op_pool;
pub mod container_queue;
pub mod dispatcher;
pub mod error;
pub mod executor_pool;
pub mod gid;
pub mod log;
pub mod metrics;
pub mod notifications;
pub mod snapshot;
pub mod state_machine;
pub mod stream;
pub mod transaction;
pub mod write_path;

pub use command::{CommandKind, ContainerRequest, ContainerResponse, ContainerResult};
pub use config::Config;
pub use dispatcher::ContainerDispatcher;
pub use error::{Result, StateMachineError};
pub use gid::Gid;
pub use state_machine::ContainerStateMachine;
