//! Trellis Cell - reaching into remote clusters
//!
//! - **Site Registry**: tracks clusters with a connected reverse tunnel
//! - **Dialers**: open byte streams to addresses inside a cluster, through the
//!   tunnel or directly over TCP

pub mod connection;
pub mod direct;
pub mod tunnel;

pub use connection::{BoxedStream, RemoteSite, SiteMap, SiteRegistry, TunnelStream};
pub use direct::DirectSite;
pub use tunnel::{Dialer, TunnelDialer, TunnelError, DEFAULT_SOURCE_HINT};
