//! Serial console plumbing: session hub, WebSocket framing and access
//! tickets.

mod hub;
pub use hub::{ByteStream, ClientHandle, ConsoleHub, Duplex, IDLE_CLOSE};

mod ticket;
pub use ticket::{TicketRegistry, TICKET_LIFETIME_SECS};

pub mod websocket;
