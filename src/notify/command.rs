//! Request line parser.

/// Literal that switches a connection into streaming mode.
const START: &[u8] = b"START";

/// Parsed request command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Begin the push stream.
    Start,
    /// Anything else, including an empty or truncated line.
    Other,
}

impl Command {
    /// Classify the first line received on a connection.
    ///
    /// One trailing `\n` and then one trailing `\r` are dropped before a
    /// case-sensitive comparison, so exactly `START`, `START\n`, `START\r`
    /// and `START\r\n` select [`Command::Start`].
    pub fn parse(line: &[u8]) -> Command {
        let line = line.strip_suffix(b"\n").unwrap_or(line);
        let line = line.strip_suffix(b"\r").unwrap_or(line);

        if line == START {
            Command::Start
        } else {
            Command::Other
        }
    }
}

/// Acknowledgement sent before the first notification.
pub fn response_started() -> &'static [u8] {
    b"Starting notification service...\n"
}

/// Farewell sent to any client that did not ask to start.
pub fn response_goodbye() -> &'static [u8] {
    b"Goodbye, client!\n"
}
