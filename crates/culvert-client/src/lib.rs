//! Client-side tunnel engine.
//!
//! Drives the framed command protocol over a single reliable stream and the
//! connection lifecycle around it: start/stop attempt guarding, transport
//! notification handling, inbound command dispatch, interface settings
//! application, and a pull-based diagnostic log channel.
//!
//! The engine is transport-agnostic: callers hand a
//! [`culvert_transport::StreamConnector`] to [`TunnelController::new`] and the
//! controller drives whatever stream the connector produces.

pub mod controller;
pub mod error;
pub mod logq;
pub mod settings;
pub mod state;

pub use controller::{ControllerConfig, StartHandle, TunnelController};
pub use error::TunnelError;
pub use logq::LogQueue;
pub use settings::{InterfaceConfigurator, InterfaceSettings, SettingsError};
pub use state::{
    AttemptGuard, ConnectionState, StartDecision, StateMachine, StopDecision, Transition,
};
