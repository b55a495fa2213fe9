use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::codec::CodecKind;

/// Magic number identifying a wirecall connection. A connection whose option
/// prelude carries a different value is rejected by the server.
pub const MAGIC_NUMBER: u32 = 0x3bef13;

/// Status string the server answers an HTTP CONNECT upgrade with. The client
/// proceeds with the RPC protocol only after reading exactly this status.
pub const CONNECTED_STATUS: &str = "200 Connected to Gee RPC";

/// Request path the HTTP upgrade endpoint answers CONNECT on.
pub const DEFAULT_RPC_PATH: &str = "/_geeprc_";

/// Connection parameters, negotiated once per connection.
///
/// The client sends `Options` JSON-encoded as the first record on the socket
/// (after the HTTP upgrade when that transport is used); the server validates
/// the magic number and codec kind before any codec is instantiated. Timeouts
/// travel as nanoseconds on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Options {
    /// Fixed protocol constant; see [`MAGIC_NUMBER`].
    #[serde(rename = "MagicNumber")]
    pub magic_number: u32,

    /// The codec both sides use for every frame after the prelude.
    #[serde(rename = "CodecType")]
    pub codec_type: CodecKind,

    /// Bounds the whole client-construction path, including the prelude
    /// write. Zero disables the bound.
    #[serde(rename = "ConnectTimeOut", with = "duration_nanos")]
    pub connect_timeout: Duration,

    /// Per-request handler budget enforced by the server. Zero disables it.
    #[serde(rename = "HandleTimeOut", with = "duration_nanos")]
    pub handle_timeout: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            magic_number: MAGIC_NUMBER,
            codec_type: CodecKind::Proto,
            connect_timeout: Duration::from_secs(10),
            handle_timeout: Duration::from_secs(10),
        }
    }
}

impl Options {
    /// Options for the given codec, with default timeouts.
    pub fn with_codec(codec_type: CodecKind) -> Self {
        Options {
            codec_type,
            ..Options::default()
        }
    }
}

/// Durations serialize as u64 nanoseconds, the prelude's wire representation.
mod duration_nanos {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_nanos() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let nanos = u64::deserialize(deserializer)?;
        Ok(Duration::from_nanos(nanos))
    }
}
