//! TETHER Realtime - Low-Latency Sync Channel
//!
//! A persistent websocket session used when the operator enables immediate
//! propagation of sync items. The channel:
//!
//! - authenticates on connect (bearer credential + device id headers)
//! - exchanges periodic heartbeats and reconnects after two consecutive
//!   missed remote beats
//! - requires an acknowledgement for every sent item, reporting
//!   "not delivered" on timeout so the caller falls back to batch sync
//! - backs off exponentially on reconnect and gives up after a capped
//!   attempt count, leaving batch sync as the only path until an explicit
//!   [`RealtimeChannel::reconnect`]

mod channel;
mod envelope;

pub use channel::{ChannelConfig, ChannelEvent, ChannelStatus, RealtimeChannel};
pub use envelope::RealtimeMessage;
