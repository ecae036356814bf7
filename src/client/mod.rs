//! Feed-handler-side components: connection management and the
//! receive/parse/update loop.

pub mod handler;
pub mod socket;

pub use handler::{ConnectionState, FeedHandler, FeedHandlerConfig, FeedStatsSnapshot};
pub use socket::FeedSocket;
