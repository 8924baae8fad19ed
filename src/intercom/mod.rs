//! # Intercom Module
//!
//! Everything that talks to a doorbell's middleware server.
//!
//! ## Key Components:
//! - **Endpoint**: Base address, timeouts and route table of one middleware
//! - **ControlClient**: HTTP control calls (health, upload, session, abort)
//! - **StreamChannelManager**: The to-device and from-device WebSockets
//! - **SessionCoordinator**: State machine tying the above together
//! - **DeviceRegistry**: One coordinator per configured device
//!
//! ## Data Flow:
//! ```text
//! HTTP handler → DeviceRegistry → SessionCoordinator ─┬→ ControlClient → middleware (HTTP)
//!                                                      ├→ StreamChannelManager → middleware (WS)
//!                                                      └→ AudioTranscoder → ffmpeg
//! ```

pub mod control;
pub mod coordinator;
pub mod endpoint;
pub mod registry;
pub mod stream;

pub use coordinator::{SessionCoordinator, SessionSnapshot, SessionState};
pub use endpoint::{Endpoint, StreamDirection};
pub use registry::{DeviceEntry, DeviceRegistry, DeviceSummary};
