pub mod liveness;
pub mod net;

pub use liveness::LivenessPlan;
pub use net::SerialNet;
