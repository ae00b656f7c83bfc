mod broadcaster;
mod event;
mod line;
mod meta;
mod ring;

pub use broadcaster::{LogBroadcaster, Subscription, SubscriptionHandle};
pub use event::{LogEvent, Severity};
pub use line::{LogLine, LogSource};
pub use meta::{LogLevel, LogMeta};
pub use ring::RingBuffer;
