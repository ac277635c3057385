//! Notification record and its wire encoding.

use bytes::{BufMut, BytesMut};
use chrono::{DateTime, Local, SecondsFormat, TimeZone};
use serde::Serialize;
use std::fmt::Display;

/// Category tag carried by every notification.
pub const PUSH_TYPE: &str = "push";

/// Title of the time notification.
pub const CURRENT_TIME_TITLE: &str = "Current time";

/// A single pushed record.
///
/// Serialized field order is `type`, `title`, `data`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub title: &'static str,
    pub data: String,
}

impl Notification {
    /// Notification stamped with the local wall-clock time.
    pub fn current_time() -> Self {
        Self::at(Local::now())
    }

    /// Notification stamped with `time`, whole seconds only.
    ///
    /// The sub-second part is dropped, never rounded, so a stamp can not
    /// run ahead of the clock it was read from.
    pub fn at<Tz>(time: DateTime<Tz>) -> Self
    where
        Tz: TimeZone,
        Tz::Offset: Display,
    {
        Self {
            kind: PUSH_TYPE,
            title: CURRENT_TIME_TITLE,
            data: time.to_rfc3339_opts(SecondsFormat::Secs, true),
        }
    }

    /// Append the compact JSON form and a trailing `\n` to `buf`.
    pub fn encode(&self, buf: &mut BytesMut) -> serde_json::Result<()> {
        serde_json::to_writer((&mut *buf).writer(), self)?;
        buf.put_u8(b'\n');
        Ok(())
    }
}
