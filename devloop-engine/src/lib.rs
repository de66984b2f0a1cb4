//! # devloop-engine
//!
//! The dev-loop engine: a single-writer store, the subscribers reacting to
//! it, and the runtime that wires them to the file system and the control
//! socket.
//!
//! ```text
//!  watcher ──┐                          ┌──► BuildController ──► CompositeBuilder
//!  socket  ──┼──► Store ── snapshots ───┼──► ResourceMonitor
//!  builds  ──┘   (reduce)               └──► StatusLogger
//! ```

pub mod action;
pub mod buildcontrol;
pub mod controller;
mod error;
pub mod monitor;
pub mod paths;
pub mod protocol;
pub mod reducer;
mod runtime;
mod server;
pub mod state;
pub mod store;
pub mod subscriber;
pub mod view;
pub mod watcher;

pub use action::{Action, BuildReason, ErrorSource, UserCommand};
pub use buildcontrol::{next_retry_at, next_target_to_build, Selection};
pub use controller::{BuildController, Launched};
pub use error::EngineError;
pub use monitor::{ResourceMonitor, StatusLogger};
pub use protocol::{
    request_status, request_stop, request_trigger, EngineClient, EngineRequest, EngineResponse,
};
pub use reducer::{reduce, ReducerError};
pub use runtime::{init_tracing, load_config, run, start_blocking, EngineOptions, LoadedConfig};
pub use state::{EngineState, TargetPhase, TargetState, TargetStatus};
pub use store::{Store, StoreHandle, StoreLoop};
pub use subscriber::{Subscriber, SubscriberPool};
pub use view::{EngineView, TargetView};
