pub use crate::config::Config;
pub use crate::connection::{Callbacks, Connection, NodeContext};
pub use crate::event::TransportAddr;
pub use crate::identity::{Capabilities, ChannelId, PeerId, DEFAULT_CHANNELID, PROTOCOL_ID};
pub use crate::pool::{Pool, Slot};
pub use crate::support::{Error, ErrorKind, ProtocolResult};
pub use crate::sync::LockStrategy;
