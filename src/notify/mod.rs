//! Time notification protocol.
//!
//! A one-shot command followed by a server-to-client push stream:
//! - Client sends: `START\n` (also `START`, `START\r`, `START\r\n`)
//! - Server responds with an acknowledgement line, then one JSON
//!   notification per interval until the connection goes away.
//! - Any other first line gets a farewell line and the connection is closed.
//!
//! ## Protocol Format
//!
//! ```text
//! Request:  START\n
//! Response: Starting notification service...\n
//!           {"type":"push","title":"Current time","data":"2024-05-01T12:00:00+02:00"}\n
//!           {"type":"push","title":"Current time","data":"2024-05-01T12:00:01+02:00"}\n
//!           ...
//!
//! Request:  hello\n
//! Response: Goodbye, client!\n
//! ```

pub mod command;
pub mod handler;
pub mod message;

pub use handler::{handle_connection, Settings};
