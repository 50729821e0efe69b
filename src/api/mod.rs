// Boot-mode service surface
//
// Transport-agnostic: the CLI drives it directly, an HTTP/websocket bridge would wrap it.

pub mod boot;

pub use boot::{BootService, JobHandle};
