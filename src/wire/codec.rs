//! Length-prefixed framing.
//!
//! A frame is a 3-byte big-endian payload length followed by the payload: a UTF-8 printed
//! [`Message`]. There is no resynchronization marker, any framing error is final for the stream.
use crate::error::ProtocolError;
use crate::wire::{sexp, Message};
use bytes::{BufMut, Bytes, BytesMut};
use std::io::{ErrorKind, Read, Write};

pub const HEADER_LEN: usize = 3;
pub const MAX_PAYLOAD: usize = (1 << 24) - 1;

/// Serialize a message into a complete frame.
pub fn encode(message: &Message) -> Result<Bytes, ProtocolError> {
    let payload = message.to_string();
    if payload.len() > MAX_PAYLOAD {
        return Err(ProtocolError::TooLarge(payload.len()));
    }

    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.put_uint(payload.len() as u64, HEADER_LEN);
    buf.put_slice(payload.as_bytes());
    Ok(buf.freeze())
}

/// Decode a message from a frame payload (without the header).
pub fn decode_payload(payload: Vec<u8>) -> Result<Message, ProtocolError> {
    let text = String::from_utf8(payload)?;
    let sexp = sexp::read(&text)?;
    Message::from_sexp(&sexp)
}

/// Decode one complete frame.
pub fn decode(frame: &[u8]) -> Result<Message, ProtocolError> {
    if frame.len() < HEADER_LEN {
        return Err(ProtocolError::TruncatedHeader(frame.len()));
    }
    let len = payload_len(&frame[..HEADER_LEN]);
    let payload = &frame[HEADER_LEN..];
    if payload.len() < len {
        return Err(ProtocolError::TruncatedPayload {
            expected: len,
            got: payload.len(),
        });
    }
    if payload.len() > len {
        return Err(ProtocolError::Malformed(format!(
            "{} bytes after the end of the frame",
            payload.len() - len
        )));
    }
    decode_payload(payload.to_vec())
}

fn payload_len(header: &[u8]) -> usize {
    header.iter().fold(0usize, |acc, b| (acc << 8) | *b as usize)
}

/// Read as many bytes as possible into `buf`, stopping early only at end of stream.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<usize, ProtocolError> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}

/// Read the next message from a stream.
///
/// Returns `Ok(None)` if the stream ends cleanly at a frame boundary.
pub fn read_message<R: Read>(reader: &mut R) -> Result<Option<Message>, ProtocolError> {
    let mut header = [0u8; HEADER_LEN];
    match read_full(reader, &mut header)? {
        0 => return Ok(None),
        HEADER_LEN => {}
        n => return Err(ProtocolError::TruncatedHeader(n)),
    }

    let len = payload_len(&header);
    let mut payload = vec![0u8; len];
    let got = read_full(reader, &mut payload)?;
    if got < len {
        return Err(ProtocolError::TruncatedPayload { expected: len, got });
    }

    let message = decode_payload(payload)?;
    log::trace!(target: "wire", "<- {message}");
    Ok(Some(message))
}

/// Write a message as a single frame and flush the stream.
pub fn write_message<W: Write + ?Sized>(
    writer: &mut W,
    message: &Message,
) -> Result<(), ProtocolError> {
    let frame = encode(message)?;
    log::trace!(target: "wire", "-> {message}");
    writer.write_all(&frame)?;
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::wire::{ReturnValue, Sexp, WorkerRef};
    use std::io::Cursor;

    fn output(text: &str) -> Message {
        Message::Output {
            text: text.to_string(),
        }
    }

    #[test]
    fn test_frame_layout() {
        let frame = encode(&output("")).unwrap();
        let payload = br#"(:write-string "")"#;
        assert_eq!(&frame[..HEADER_LEN], &[0, 0, payload.len() as u8]);
        assert_eq!(&frame[HEADER_LEN..], payload);
    }

    #[test]
    fn test_decode_encode() {
        let messages = [
            output(""),
            output("\u{0}\u{0}\u{3}abc"),
            output("юникод ✓"),
            Message::Return {
                worker: WorkerRef(1),
                value: ReturnValue::Ok(Sexp::Int(3)),
                id: 1,
            },
        ];

        for msg in messages {
            let frame = encode(&msg).unwrap();
            assert_eq!(decode(&frame).unwrap(), msg);
        }
    }

    #[test]
    fn test_stream() {
        let first = output("one");
        let second = Message::Interrupt {
            worker: WorkerRef(2),
        };
        let mut stream = Vec::new();
        write_message(&mut stream, &first).unwrap();
        write_message(&mut stream, &second).unwrap();

        let mut cursor = Cursor::new(stream);
        assert_eq!(read_message(&mut cursor).unwrap(), Some(first));
        assert_eq!(read_message(&mut cursor).unwrap(), Some(second));
        assert_eq!(read_message(&mut cursor).unwrap(), None);
    }

    #[test]
    fn test_truncation() {
        let mut cursor = Cursor::new(vec![0u8, 0]);
        assert!(matches!(
            read_message(&mut cursor),
            Err(ProtocolError::TruncatedHeader(2))
        ));

        let mut frame = vec![0u8, 0, 50];
        frame.extend_from_slice(b"(:write-st");
        let mut cursor = Cursor::new(frame.clone());
        assert!(matches!(
            read_message(&mut cursor),
            Err(ProtocolError::TruncatedPayload {
                expected: 50,
                got: 10
            })
        ));
        assert!(matches!(
            decode(&frame),
            Err(ProtocolError::TruncatedPayload {
                expected: 50,
                got: 10
            })
        ));
    }

    #[test]
    fn test_bad_payload() {
        struct TestCase {
            payload: &'static [u8],
        }
        let cases = [
            TestCase {
                payload: &[0xff, 0xfe],
            },
            TestCase {
                payload: b"(:write-string",
            },
            TestCase {
                payload: b"(:no-such-message 1)",
            },
            TestCase { payload: b"" },
        ];

        for tc in cases {
            let mut frame = vec![0u8, 0, tc.payload.len() as u8];
            frame.extend_from_slice(tc.payload);
            assert!(read_message(&mut Cursor::new(frame)).is_err());
        }
    }

    #[test]
    fn test_too_large() {
        let msg = output(&"x".repeat(MAX_PAYLOAD));
        assert!(matches!(encode(&msg), Err(ProtocolError::TooLarge(_))));
    }
}
