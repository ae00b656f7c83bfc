mod client;
mod console;
mod packet;

pub use client::RconClient;
pub use console::RconConsole;
pub use packet::{MAX_INCOMING_BODY, MAX_OUTGOING_BODY, Packet};
