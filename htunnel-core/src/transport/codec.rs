use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::Error;

/*
   0               8              24                              56
   +---------------+---------------+-------------------------------+
   |     kind      |  label length |         payload length        |
   +---------------+---------------+-------------------------------+
   |                     label (utf-8)  ...                        |
   +---------------------------------------------------------------+
   |                     payload  ...                              |
   +---------------------------------------------------------------+
*/
pub const HEAD_LEN: usize = 7;
pub const DEFAULT_MAX_PAYLOAD: usize = 1024 * 1024;

#[derive(Eq, PartialEq, Copy, Clone, Debug)]
#[repr(u8)]
pub enum FrameKind {
    /// First frame on a connection, proves the session nonce.
    Hello,
    Open,
    Data,
    Close,
    /// The sender is closing the whole session.
    Bye,
    Unknown = 255,
}

impl From<u8> for FrameKind {
    fn from(value: u8) -> Self {
        match value {
            0 => FrameKind::Hello,
            1 => FrameKind::Open,
            2 => FrameKind::Data,
            3 => FrameKind::Close,
            4 => FrameKind::Bye,
            _ => FrameKind::Unknown,
        }
    }
}

impl From<FrameKind> for u8 {
    fn from(value: FrameKind) -> Self {
        value as u8
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Frame {
    Hello { nonce: u64 },
    Open { label: String },
    Data { label: String, payload: Bytes },
    Close { label: String },
    Bye,
}

impl Frame {
    pub fn kind(&self) -> FrameKind {
        match self {
            Frame::Hello { .. } => FrameKind::Hello,
            Frame::Open { .. } => FrameKind::Open,
            Frame::Data { .. } => FrameKind::Data,
            Frame::Close { .. } => FrameKind::Close,
            Frame::Bye => FrameKind::Bye,
        }
    }
}

#[derive(Clone, Debug)]
pub struct FrameCodec {
    max_payload: usize,
}

impl FrameCodec {
    pub fn new(max_payload: usize) -> Self {
        Self { max_payload }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PAYLOAD)
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEAD_LEN {
            return Ok(None);
        }
        let kind = FrameKind::from(src[0]);
        let label_len = u16::from_be_bytes([src[1], src[2]]) as usize;
        let payload_len = u32::from_be_bytes([src[3], src[4], src[5], src[6]]) as usize;
        if payload_len > self.max_payload {
            return Err(Error::InvalidFrame(format!(
                "payload too long {payload_len}>{}",
                self.max_payload
            )));
        }
        let total = HEAD_LEN + label_len + payload_len;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }
        src.advance(HEAD_LEN);
        let label = src.split_to(label_len);
        let payload = src.split_to(payload_len).freeze();
        let label = String::from_utf8(label.to_vec())
            .map_err(|_| Error::InvalidFrame("label is not utf-8".into()))?;
        let frame = match kind {
            FrameKind::Hello => {
                let nonce: [u8; 8] = payload[..]
                    .try_into()
                    .map_err(|_| Error::InvalidFrame("hello without nonce".into()))?;
                Frame::Hello {
                    nonce: u64::from_be_bytes(nonce),
                }
            }
            FrameKind::Open => Frame::Open { label },
            FrameKind::Data => Frame::Data { label, payload },
            FrameKind::Close => Frame::Close { label },
            FrameKind::Bye => Frame::Bye,
            FrameKind::Unknown => {
                return Err(Error::InvalidFrame(format!("unknown kind {kind:?}")));
            }
        };
        Ok(Some(frame))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let kind = item.kind();
        let nonce = match &item {
            Frame::Hello { nonce } => nonce.to_be_bytes(),
            _ => [0u8; 8],
        };
        let (label, payload): (&str, &[u8]) = match &item {
            Frame::Hello { .. } => ("", &nonce[..]),
            Frame::Open { label } | Frame::Close { label } => (label.as_str(), &[][..]),
            Frame::Data { label, payload } => (label.as_str(), &payload[..]),
            Frame::Bye => ("", &[][..]),
        };
        if label.len() > u16::MAX as usize {
            return Err(Error::InvalidFrame(format!("label too long {}", label.len())));
        }
        if payload.len() > self.max_payload {
            return Err(Error::InvalidFrame(format!(
                "payload too long {}>{}",
                payload.len(),
                self.max_payload
            )));
        }
        dst.reserve(HEAD_LEN + label.len() + payload.len());
        dst.put_u8(kind.into());
        dst.put_u16(label.len() as u16);
        dst.put_u32(payload.len() as u32);
        dst.put_slice(label.as_bytes());
        dst.put_slice(payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use bytes::{Bytes, BytesMut};
    use tokio_util::codec::{Decoder, Encoder};

    use super::{Frame, FrameCodec, FrameKind};

    #[test]
    fn frame_kind_from_u8() {
        assert_eq!(FrameKind::from(2), FrameKind::Data);
        assert_eq!(FrameKind::from(128), FrameKind::Unknown);
    }

    #[test]
    fn decode_waits_for_whole_frame() {
        let mut codec = FrameCodec::default();
        let mut wire = BytesMut::new();
        codec
            .encode(
                Frame::Data {
                    label: "7|3".into(),
                    payload: Bytes::from_static(b"payload"),
                },
                &mut wire,
            )
            .unwrap();
        codec.encode(Frame::Close { label: "7|3".into() }, &mut wire).unwrap();

        let mut src = BytesMut::new();
        let mut frames = Vec::new();
        for byte in wire.iter() {
            src.extend_from_slice(&[*byte]);
            while let Some(frame) = codec.decode(&mut src).unwrap() {
                frames.push(frame);
            }
        }
        assert_eq!(
            frames,
            vec![
                Frame::Data {
                    label: "7|3".into(),
                    payload: Bytes::from_static(b"payload"),
                },
                Frame::Close { label: "7|3".into() },
            ]
        );
        assert!(src.is_empty());
    }

    #[test]
    fn rejects_garbage() {
        let mut codec = FrameCodec::new(16);
        let mut src = BytesMut::from(&[9u8, 0, 0, 0, 0, 0, 0][..]);
        assert!(codec.decode(&mut src).is_err());

        let mut src = BytesMut::from(&[2u8, 0, 0, 0, 0, 1, 0][..]);
        assert!(codec.decode(&mut src).is_err());

        let mut dst = BytesMut::new();
        let too_long = Frame::Data {
            label: "x".into(),
            payload: Bytes::from(vec![0u8; 17]),
        };
        assert!(codec.encode(too_long, &mut dst).is_err());
    }
}
