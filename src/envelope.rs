//! An [Envelope] wraps an opaque, already serialized message together with its type, its sender
//!  and three timestamps. It is the unit of exchange in an [crate::session::OD4Session].
//!
//! ## Wire format
//!
//! Envelopes are framed with a five byte header, followed by the proto encoded envelope
//!  (see [crate::proto] for the encoding rules):
//!
//! ```ascii
//! 0: 0x0D                         magic
//! 1: 0xA4                         magic
//! 2: payload length (u24 LE)      i.e. envelopes are limited to 16 MiB - 1
//! 5: payload
//! ```
//!
//! Payload fields (message id 1):
//!
//! ```ascii
//! 1: data type          int32 (zig-zag varint)
//! 2: serialized data    bytes
//! 3: sent               TimeStamp (nested)
//! 4: received           TimeStamp (nested)
//! 5: sample time stamp  TimeStamp (nested)
//! 6: sender stamp       uint32 (varint)
//! ```
//!
//! TimeStamp fields (message id 12): `1: seconds int32`, `2: microseconds int32`
//!
//! Several envelopes may be concatenated in a single datagram.

use anyhow::bail;
use bytes::{BufMut, Bytes, BytesMut};
use tracing::trace;

use crate::proto::{put_bytes_field, put_message_field, put_sint32_field, put_uint32_field, try_read_field, FieldValue};
use crate::time::TimeStamp;
use crate::util::safe_converter::PrecheckedCast;


#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct Envelope {
    pub data_type: i32,
    pub sender_stamp: u32,
    pub serialized_data: Vec<u8>,
    pub sent: TimeStamp,
    pub received: TimeStamp,
    pub sampled: TimeStamp,
}

impl Envelope {
    pub const MAGIC: [u8; 2] = [0x0D, 0xA4];
    pub const HEADER_LEN: usize = 5;
    pub const MAX_PAYLOAD_LEN: usize = 0xff_ffff;

    pub fn new(data_type: i32, sender_stamp: u32, serialized_data: impl Into<Vec<u8>>) -> Envelope {
        Envelope {
            data_type,
            sender_stamp,
            serialized_data: serialized_data.into(),
            ..Default::default()
        }
    }

    pub fn with_sent(mut self, sent: TimeStamp) -> Envelope {
        self.sent = sent;
        self
    }

    pub fn with_received(mut self, received: TimeStamp) -> Envelope {
        self.received = received;
        self
    }

    pub fn with_sampled(mut self, sampled: TimeStamp) -> Envelope {
        self.sampled = sampled;
        self
    }

    pub fn encode(&self) -> anyhow::Result<Bytes> {
        let mut buf = BytesMut::with_capacity(Self::HEADER_LEN + self.serialized_data.len() + 64);
        self.ser(&mut buf)?;
        Ok(buf.freeze())
    }

    /// appends the framed envelope to the buffer
    pub fn ser(&self, buf: &mut BytesMut) -> anyhow::Result<()> {
        let mut payload = BytesMut::with_capacity(self.serialized_data.len() + 64);
        self.ser_payload(&mut payload);

        if payload.len() > Self::MAX_PAYLOAD_LEN {
            bail!("encoded envelope has {} bytes, exceeding the maximum of {}", payload.len(), Self::MAX_PAYLOAD_LEN);
        }
        let len: u32 = payload.len().prechecked_cast();

        buf.put_slice(&Self::MAGIC);
        buf.put_slice(&len.to_le_bytes()[..3]);
        buf.put_slice(&payload);
        Ok(())
    }

    fn ser_payload(&self, buf: &mut BytesMut) {
        put_sint32_field(buf, 1, self.data_type);
        put_bytes_field(buf, 2, &self.serialized_data);
        put_message_field(buf, 3, |b| ser_time_stamp(b, &self.sent));
        put_message_field(buf, 4, |b| ser_time_stamp(b, &self.received));
        put_message_field(buf, 5, |b| ser_time_stamp(b, &self.sampled));
        put_uint32_field(buf, 6, self.sender_stamp);
    }

    /// Reads exactly one framed envelope, advancing the buffer past it
    pub fn try_deser(buf: &mut &[u8]) -> anyhow::Result<Envelope> {
        if buf.len() < Self::HEADER_LEN {
            bail!("buffer is shorter than an envelope header: {} < {} bytes", buf.len(), Self::HEADER_LEN);
        }
        if buf[..2] != Self::MAGIC {
            bail!("invalid envelope magic bytes {:02x?}", &buf[..2]);
        }

        let len = u32::from_le_bytes([buf[2], buf[3], buf[4], 0]) as usize;
        if buf.len() - Self::HEADER_LEN < len {
            bail!("envelope header announces {} bytes, but only {} are available", len, buf.len() - Self::HEADER_LEN);
        }

        let payload = &buf[Self::HEADER_LEN..Self::HEADER_LEN + len];
        let envelope = Self::try_deser_payload(payload)?;
        *buf = &buf[Self::HEADER_LEN + len..];
        Ok(envelope)
    }

    fn try_deser_payload(mut payload: &[u8]) -> anyhow::Result<Envelope> {
        let mut result = Envelope::default();

        while let Some((field_id, value)) = try_read_field(&mut payload)? {
            match field_id {
                1 => result.data_type = value.as_sint32()?,
                2 => result.serialized_data = value.as_bytes()?.to_vec(),
                3 => result.sent = try_deser_time_stamp(value)?,
                4 => result.received = try_deser_time_stamp(value)?,
                5 => result.sampled = try_deser_time_stamp(value)?,
                6 => result.sender_stamp = value.as_uint32()?,
                _ => trace!("skipping unknown envelope field {}", field_id),
            }
        }
        Ok(result)
    }

    /// Iterates over all envelopes in a buffer. Iteration ends after the first malformed frame,
    ///  which is reported as an error.
    pub fn frames(buf: &[u8]) -> EnvelopeFrames<'_> {
        EnvelopeFrames { buf }
    }
}

pub struct EnvelopeFrames<'a> {
    buf: &'a [u8],
}

impl Iterator for EnvelopeFrames<'_> {
    type Item = anyhow::Result<Envelope>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buf.is_empty() {
            return None;
        }
        let result = Envelope::try_deser(&mut self.buf);
        if result.is_err() {
            self.buf = &[];
        }
        Some(result)
    }
}

fn ser_time_stamp(buf: &mut BytesMut, ts: &TimeStamp) {
    put_sint32_field(buf, 1, ts.seconds);
    put_sint32_field(buf, 2, ts.microseconds);
}

fn try_deser_time_stamp(value: FieldValue) -> anyhow::Result<TimeStamp> {
    let mut buf = value.as_bytes()?;
    let mut seconds = 0;
    let mut microseconds = 0;

    while let Some((field_id, value)) = try_read_field(&mut buf)? {
        match field_id {
            1 => seconds = value.as_sint32()?,
            2 => microseconds = value.as_sint32()?,
            _ => trace!("skipping unknown time stamp field {}", field_id),
        }
    }

    // normalizes values written by peers that do not keep microseconds in range
    Ok(TimeStamp::from_micros(seconds as i64 * 1_000_000 + microseconds as i64))
}

#[cfg(test)]
mod test {
    use rstest::rstest;

    use super::*;

    const ENCODED_31_13: &[u8] = b"\x0d\xa4\x1a\x00\x00\x08\x3e\x12\x02ab\x1a\x04\x08\x02\x10\x04\x22\x04\x08\x00\x10\x00\x2a\x04\x08\x00\x10\x00\x30\x0d";

    fn envelope_31_13() -> Envelope {
        Envelope::new(31, 13, b"ab".as_slice())
            .with_sent(TimeStamp { seconds: 1, microseconds: 2 })
    }

    #[test]
    fn test_field_round_trip() {
        let mut e = Envelope::default();

        assert_eq!(e.data_type, 0);
        e.data_type = 53;
        assert_eq!(e.data_type, 53);

        assert!(e.serialized_data.is_empty());
        e.serialized_data = b"muppet".to_vec();
        assert_eq!(e.serialized_data, b"muppet");

        let ts = TimeStamp::from_secs_f64(347238.438274);
        assert!(e.sent.is_epoch());
        e.sent = ts;
        assert_eq!(e.sent.as_secs_f64(), 347238.438274);

        assert!(e.received.is_epoch());
        e.received = ts;
        assert_eq!(e.received.as_secs_f64(), 347238.438274);

        assert!(e.sampled.is_epoch());
        e.sampled = ts;
        assert_eq!(e.sampled.as_secs_f64(), 347238.438274);

        assert_eq!(e.sender_stamp, 0);
        e.sender_stamp = 53;
        assert_eq!(e.sender_stamp, 53);
    }

    #[test]
    fn test_clone_is_independent() {
        let original = envelope_31_13();
        let mut copy = original.clone();
        copy.serialized_data.push(b'c');
        copy.sent = TimeStamp::EPOCH;

        assert_eq!(original.serialized_data, b"ab");
        assert_eq!(original.sent, TimeStamp { seconds: 1, microseconds: 2 });
    }

    #[test]
    fn test_encode() {
        let encoded = envelope_31_13().encode().unwrap();
        assert_eq!(encoded.as_ref(), ENCODED_31_13);
    }

    #[test]
    fn test_decode() {
        let mut buf = ENCODED_31_13;
        let decoded = Envelope::try_deser(&mut buf).unwrap();
        assert_eq!(decoded, envelope_31_13());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_round_trip_all_fields() {
        let envelope = Envelope::new(-7, u32::MAX, vec![0u8; 300])
            .with_sent(TimeStamp { seconds: 1_700_000_000, microseconds: 999_999 })
            .with_received(TimeStamp { seconds: -3, microseconds: 1 })
            .with_sampled(TimeStamp::from_secs_f64(347238.438274));

        let encoded = envelope.encode().unwrap();
        let decoded = Envelope::try_deser(&mut encoded.as_ref()).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn test_decode_leaves_remainder() {
        let mut buf = ENCODED_31_13.to_vec();
        buf.extend_from_slice(b"xyz");

        let mut parse_buf = buf.as_slice();
        Envelope::try_deser(&mut parse_buf).unwrap();
        assert_eq!(parse_buf, b"xyz");
    }

    #[test]
    fn test_decode_skips_unknown_fields() {
        // data type 2 (zig-zag 4), unknown field 9 as varint, sender stamp 1
        let mut buf: &[u8] = b"\x0d\xa4\x06\x00\x00\x08\x04\x48\x07\x30\x01";
        let decoded = Envelope::try_deser(&mut buf).unwrap();
        assert_eq!(decoded, Envelope::new(2, 1, Vec::<u8>::new()));
    }

    #[rstest]
    #[case::too_short(b"\x0d\xa4\x00")]
    #[case::wrong_magic(b"\x0d\xa5\x00\x00\x00")]
    #[case::truncated_payload(b"\x0d\xa4\x04\x00\x00\x08\x3e")]
    #[case::malformed_payload(b"\x0d\xa4\x02\x00\x00\x12\x05")]
    #[case::wrong_field_type(b"\x0d\xa4\x02\x00\x00\x0d\x00")]
    fn test_decode_malformed(#[case] mut buf: &[u8]) {
        assert!(Envelope::try_deser(&mut buf).is_err());
    }

    #[test]
    fn test_frames_concatenated() {
        let second = Envelope::new(1, 2, b"second".as_slice());

        let mut buf = BytesMut::new();
        envelope_31_13().ser(&mut buf).unwrap();
        second.ser(&mut buf).unwrap();

        let decoded = Envelope::frames(&buf)
            .collect::<anyhow::Result<Vec<_>>>()
            .unwrap();
        assert_eq!(decoded, vec![envelope_31_13(), second]);
    }

    #[test]
    fn test_frames_stop_at_first_malformed() {
        let mut buf = BytesMut::new();
        envelope_31_13().ser(&mut buf).unwrap();
        buf.put_slice(b"garbage");
        envelope_31_13().ser(&mut buf).unwrap();

        let results = Envelope::frames(&buf).collect::<Vec<_>>();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].as_ref().unwrap(), &envelope_31_13());
        assert!(results[1].is_err());
    }

    #[test]
    fn test_encode_too_large() {
        let envelope = Envelope::new(1, 1, vec![0u8; Envelope::MAX_PAYLOAD_LEN]);
        assert!(envelope.encode().is_err());
    }
}
