//! Framing. An application frame is a 4-byte big-endian type tag followed by the payload.
//! On byte-stream transports each frame travels inside a record: 4 bytes BE length + frame,
//! since TCP does not preserve message boundaries.

const TAG_SIZE: usize = 4;
const LEN_SIZE: usize = 4;
/// Largest record body accepted from the stream.
pub const MAX_RECORD_LEN: u32 = 16 * 1024 * 1024; // 16 MiB

/// Type tag of an application frame. Unknown tags decode fine; the caller decides what to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TypeTag(pub i32);

impl TypeTag {
    /// UTF-8 text payload (chat or control command).
    pub const MESSAGE: TypeTag = TypeTag(1);
    /// Opaque binary payload, e.g. one encoded video access unit.
    pub const FRAME: TypeTag = TypeTag(2);
}

/// Encode one application frame: tag + payload.
pub fn encode(tag: TypeTag, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(TAG_SIZE + payload.len());
    out.extend_from_slice(&tag.0.to_be_bytes());
    out.extend_from_slice(payload);
    out
}

/// Decode one application frame. The payload borrows from `bytes`.
pub fn decode(bytes: &[u8]) -> Result<(TypeTag, &[u8]), FrameDecodeError> {
    if bytes.len() < TAG_SIZE {
        return Err(FrameDecodeError::Malformed(bytes.len()));
    }
    let tag = i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    Ok((TypeTag(tag), &bytes[TAG_SIZE..]))
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("malformed frame: {0} bytes, need at least 4")]
    Malformed(usize),
}

/// Wrap a frame in a record: 4 bytes BE length + frame.
pub fn encode_record(frame: &[u8]) -> Result<Vec<u8>, RecordError> {
    let len = u32::try_from(frame.len()).map_err(|_| RecordError::TooLarge(u32::MAX))?;
    if len > MAX_RECORD_LEN {
        return Err(RecordError::TooLarge(len));
    }
    let mut out = Vec::with_capacity(LEN_SIZE + frame.len());
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(frame);
    Ok(out)
}

/// Validate a record header read off the stream and return the body length.
pub fn record_len(header: [u8; LEN_SIZE]) -> Result<usize, RecordError> {
    let len = u32::from_be_bytes(header);
    if len > MAX_RECORD_LEN {
        return Err(RecordError::TooLarge(len));
    }
    Ok(len as usize)
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecordError {
    #[error("record too large: {0} bytes")]
    TooLarge(u32),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_input_is_malformed() {
        for n in 0..TAG_SIZE {
            let bytes = vec![0xAB; n];
            assert_eq!(decode(&bytes), Err(FrameDecodeError::Malformed(n)));
        }
    }

    #[test]
    fn roundtrip_text_and_binary() {
        let text = encode(TypeTag::MESSAGE, "hello".as_bytes());
        assert_eq!(decode(&text).unwrap(), (TypeTag::MESSAGE, "hello".as_bytes()));

        let frame = encode(TypeTag::FRAME, &[0, 0, 0, 1, 0x67]);
        assert_eq!(decode(&frame).unwrap(), (TypeTag::FRAME, &[0, 0, 0, 1, 0x67][..]));
    }

    #[test]
    fn tag_is_big_endian() {
        assert_eq!(&encode(TypeTag::MESSAGE, b"")[..], &[0, 0, 0, 1]);
        assert_eq!(&encode(TypeTag::FRAME, b"x")[..], &[0, 0, 0, 2, b'x']);
    }

    #[test]
    fn empty_payload_and_unknown_tag() {
        let (tag, payload) = decode(&[0, 0, 0, 9]).unwrap();
        assert_eq!(tag, TypeTag(9));
        assert!(payload.is_empty());
        let neg = encode(TypeTag(-1), b"z");
        assert_eq!(decode(&neg).unwrap().0, TypeTag(-1));
    }

    #[test]
    fn record_header_carries_frame_len() {
        let frame = encode(TypeTag::MESSAGE, b"/call");
        let rec = encode_record(&frame).unwrap();
        let header = [rec[0], rec[1], rec[2], rec[3]];
        assert_eq!(record_len(header).unwrap(), frame.len());
        assert_eq!(&rec[LEN_SIZE..], &frame[..]);
    }

    #[test]
    fn oversized_record_rejected() {
        let header = (MAX_RECORD_LEN + 1).to_be_bytes();
        assert_eq!(record_len(header), Err(RecordError::TooLarge(MAX_RECORD_LEN + 1)));
        let big = vec![0u8; MAX_RECORD_LEN as usize + 1];
        assert!(matches!(encode_record(&big), Err(RecordError::TooLarge(_))));
    }
}
