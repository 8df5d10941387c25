//! Interceptors shipped with the runtime.

mod firewall;
mod protocol;
mod recorder;

pub use firewall::MethodFirewall;
pub use protocol::ProtocolGate;
pub use recorder::TrafficRecorder;
