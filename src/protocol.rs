//! Control channel wire format.
//!
//! Operator to generator: fixed five-byte records, a one-byte command code
//! followed by a big-endian `u32` value.
//!
//! Generator to operator: the cumulative byte counter as a big-endian `u64`,
//! once per [`STATS_PERIOD`](crate::config::STATS_PERIOD).

use crate::{Error, Result};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Size of one control record on the wire.
pub const CONTROL_RECORD_LEN: usize = 5;

/// Size of one stats record on the wire.
pub const STATS_RECORD_LEN: usize = 8;

pub const CODE_SET_FLOWS: u8 = 0;
pub const CODE_SET_RATE: u8 = 1;
pub const CODE_SET_INTERVAL: u8 = 2;
pub const CODE_TERMINATE: u8 = 3;

/// A raw, unvalidated control record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlRecord {
    pub code: u8,
    pub value: u32,
}

impl ControlRecord {
    pub fn from_bytes(bytes: [u8; CONTROL_RECORD_LEN]) -> Self {
        Self {
            code: bytes[0],
            value: u32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]),
        }
    }

    pub fn to_bytes(&self) -> [u8; CONTROL_RECORD_LEN] {
        let v = self.value.to_be_bytes();
        [self.code, v[0], v[1], v[2], v[3]]
    }
}

/// A validated control command.
///
/// # Examples
///
/// ```
/// use flowgen::protocol::{ControlMessage, ControlRecord};
///
/// let record = ControlRecord { code: 1, value: 8_000 };
/// let msg = ControlMessage::try_from(record).unwrap();
/// assert_eq!(msg, ControlMessage::SetRate(8_000));
///
/// // zero is only legal for Terminate
/// assert!(ControlMessage::try_from(ControlRecord { code: 2, value: 0 }).is_err());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMessage {
    /// Desired number of open flows
    SetFlowCount(u32),
    /// Target rate in bits per second on the wire
    SetRate(u32),
    /// Pacing interval in milliseconds
    SetInterval(u32),
    /// Report final stats and exit
    Terminate,
}

impl ControlMessage {
    pub fn code(&self) -> u8 {
        match self {
            ControlMessage::SetFlowCount(_) => CODE_SET_FLOWS,
            ControlMessage::SetRate(_) => CODE_SET_RATE,
            ControlMessage::SetInterval(_) => CODE_SET_INTERVAL,
            ControlMessage::Terminate => CODE_TERMINATE,
        }
    }

    pub fn value(&self) -> u32 {
        match *self {
            ControlMessage::SetFlowCount(v)
            | ControlMessage::SetRate(v)
            | ControlMessage::SetInterval(v) => v,
            ControlMessage::Terminate => 0,
        }
    }

    pub fn to_bytes(&self) -> [u8; CONTROL_RECORD_LEN] {
        ControlRecord {
            code: self.code(),
            value: self.value(),
        }
        .to_bytes()
    }
}

impl TryFrom<ControlRecord> for ControlMessage {
    type Error = Error;

    fn try_from(record: ControlRecord) -> Result<Self> {
        if record.value == 0 && record.code != CODE_TERMINATE {
            return Err(Error::Protocol(format!(
                "was asked to change code={} to zero",
                record.code
            )));
        }

        match record.code {
            CODE_SET_FLOWS => Ok(ControlMessage::SetFlowCount(record.value)),
            CODE_SET_RATE => Ok(ControlMessage::SetRate(record.value)),
            CODE_SET_INTERVAL => Ok(ControlMessage::SetInterval(record.value)),
            CODE_TERMINATE => Ok(ControlMessage::Terminate),
            code => Err(Error::Protocol(format!("unexpected control code {}", code))),
        }
    }
}

/// Reads the next control record from `reader`.
///
/// Returns `Ok(None)` on a clean end of stream at a record boundary.
///
/// # Errors
///
/// Returns an error if the stream fails or ends in the middle of a record.
pub async fn read_control_record<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<ControlRecord>> {
    let mut buf = [0u8; CONTROL_RECORD_LEN];
    let mut filled = 0;
    while filled < CONTROL_RECORD_LEN {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(Error::Connection(format!(
                "control stream closed mid-record ({} of {} bytes)",
                filled, CONTROL_RECORD_LEN
            )));
        }
        filled += n;
    }
    Ok(Some(ControlRecord::from_bytes(buf)))
}

/// Encodes the cumulative byte counter for the control peer.
pub fn encode_stats(total_bytes: u64) -> [u8; STATS_RECORD_LEN] {
    total_bytes.to_be_bytes()
}
