// Market-data feed: wire records, transports and the connection supervisor
pub mod record;
pub mod supervisor;
pub mod transport;

pub use record::{parse_message, symbol_from_instrument_key, FeedRecord, InstrumentMap};
pub use supervisor::{
    ConnectionState, ConnectionSupervisor, FeedEvent, StalenessPolicy, SupervisorConfig,
};
pub use transport::{ChannelTransport, FeedTransport, ReplayTransport, WsFeedTransport};
