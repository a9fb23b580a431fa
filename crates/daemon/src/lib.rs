pub mod proxy;

pub use proxy::{LoopbackHost, PollSocket, ProxyServer};
