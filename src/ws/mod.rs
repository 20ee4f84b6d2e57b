pub mod connection;
pub mod frames;
pub mod messages;
pub mod session;
pub mod transport;

pub use connection::{FeedSession, FeedStats};
pub use transport::{FeedTransport, TungsteniteTransport};
