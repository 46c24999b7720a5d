pub mod channel;
pub mod event;
pub mod manager;
pub mod transport;

pub use channel::{Channel, StreamId};
pub use event::{decode_event, MarketEvent};
pub use manager::{Listener, ListenerId, StreamStats, SubscriptionManager, SubscriptionState};
pub use transport::{FrameStream, StreamTransport};
