// https://redis.io/docs/reference/protocol-spec

use std::fmt;
use std::io::Cursor;
use std::str;

use bytes::{Buf, Bytes};
use thiserror::Error as ThisError;

static CRLF: &[u8; 2] = b"\r\n";

#[derive(Debug, ThisError)]
pub enum Error {
    #[error("not enough data is available to parse an entire frame")]
    Incomplete,
    #[error("invalid frame data type: {0}")]
    InvalidDataType(u8),
    #[error("protocol error; invalid UTF-8 string")]
    InvalidUtf8,
    #[error("protocol error; invalid integer: {0:?}")]
    InvalidInteger(String),
    #[error("frame size exceeds limit")]
    FrameTooLarge,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// The RESP2 subset a pub/sub client sends and receives. Replies to PUBLISH
/// are integers; everything arriving on a subscribed connection is an array
/// of bulk strings and integers.
#[derive(Clone, Debug, PartialEq)]
pub enum Frame {
    Simple(String),
    Error(String),
    Integer(i64),
    Bulk(Bytes),
    Null,
    Array(Vec<Frame>),
}

impl Frame {
    /// Builds the array-of-bulk-strings form the server expects for a
    /// command. Bulk strings are length-prefixed, so arguments may contain
    /// whitespace or control bytes without escaping.
    pub fn command<'a>(parts: impl IntoIterator<Item = &'a str>) -> Frame {
        let parts = parts
            .into_iter()
            .map(|part| Frame::Bulk(Bytes::copy_from_slice(part.as_bytes())))
            .collect();

        Frame::Array(parts)
    }

    /// Views a textual frame as UTF-8. Pub/sub reply elements arrive as bulk
    /// strings; simple strings are accepted for symmetry.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Frame::Simple(s) => Some(s),
            Frame::Bulk(bytes) => str::from_utf8(bytes).ok(),
            _ => None,
        }
    }

    pub fn parse(src: &mut Cursor<&[u8]>) -> Result<Self, Error> {
        // The first byte in a RESP-serialized payload identifies its type,
        // subsequent bytes constitute the type's contents.
        let first_byte = get_byte(src)?;
        let data_type = DataType::try_from(first_byte)?;

        match data_type {
            DataType::SimpleString => {
                let line = get_line(src)?;
                Ok(Frame::Simple(to_utf8(line)?))
            }
            DataType::SimpleError => {
                let line = get_line(src)?;
                Ok(Frame::Error(to_utf8(line)?))
            }
            DataType::Integer => {
                let line = get_line(src)?;
                Ok(Frame::Integer(to_integer(line)?))
            }
            // $<length>\r\n<data>\r\n
            DataType::BulkString => {
                let length = to_integer(get_line(src)?)?;

                if length == -1 {
                    return Ok(Frame::Null);
                }

                // The payload is length-prefixed and may itself contain CRLF,
                // so it is read by size rather than by line scanning.
                let length = usize::try_from(length)
                    .map_err(|_| Error::InvalidInteger(length.to_string()))?;
                if src.remaining() < length + CRLF.len() {
                    return Err(Error::Incomplete);
                }

                let start = src.position() as usize;
                let data = Bytes::copy_from_slice(&src.get_ref()[start..start + length]);
                src.advance(length + CRLF.len());

                Ok(Frame::Bulk(data))
            }
            // *<number-of-elements>\r\n<element-1>...<element-n>
            DataType::Array => {
                let length = to_integer(get_line(src)?)?;

                if length == -1 {
                    return Ok(Frame::Null);
                }

                let length = usize::try_from(length)
                    .map_err(|_| Error::InvalidInteger(length.to_string()))?;
                let mut frames = Vec::with_capacity(length);
                for _ in 0..length {
                    frames.push(Self::parse(src)?);
                }

                Ok(Frame::Array(frames))
            }
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        match self {
            Frame::Simple(s) => {
                let mut bytes = Vec::with_capacity(1 + s.len() + CRLF.len());
                bytes.push(u8::from(DataType::SimpleString));
                bytes.extend_from_slice(s.as_bytes());
                bytes.extend_from_slice(CRLF);
                bytes
            }
            Frame::Error(s) => {
                let mut bytes = Vec::with_capacity(1 + s.len() + CRLF.len());
                bytes.push(u8::from(DataType::SimpleError));
                bytes.extend_from_slice(s.as_bytes());
                bytes.extend_from_slice(CRLF);
                bytes
            }
            Frame::Integer(i) => {
                let digits = i.to_string();
                let mut bytes = Vec::with_capacity(1 + digits.len() + CRLF.len());
                bytes.push(u8::from(DataType::Integer));
                bytes.extend_from_slice(digits.as_bytes());
                bytes.extend_from_slice(CRLF);
                bytes
            }
            Frame::Bulk(data) => {
                let length = data.len().to_string();
                let mut bytes =
                    Vec::with_capacity(1 + length.len() + CRLF.len() * 2 + data.len());
                bytes.push(u8::from(DataType::BulkString));
                bytes.extend_from_slice(length.as_bytes());
                bytes.extend_from_slice(CRLF);
                bytes.extend_from_slice(data);
                bytes.extend_from_slice(CRLF);
                bytes
            }
            Frame::Null => b"$-1\r\n".to_vec(),
            Frame::Array(frames) => {
                let length = frames.len().to_string();
                let mut bytes = Vec::with_capacity(1 + length.len() + CRLF.len());
                bytes.push(u8::from(DataType::Array));
                bytes.extend_from_slice(length.as_bytes());
                bytes.extend_from_slice(CRLF);
                for frame in frames {
                    bytes.extend(frame.serialize());
                }
                bytes
            }
        }
    }
}

impl From<Frame> for Vec<u8> {
    fn from(frame: Frame) -> Self {
        frame.serialize()
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Frame::Simple(s) => write!(f, "+{}", s),
            Frame::Error(s) => write!(f, "-{}", s),
            Frame::Integer(i) => write!(f, ":{}", i),
            Frame::Bulk(bytes) => write!(f, "${}", String::from_utf8_lossy(bytes)),
            Frame::Null => write!(f, "$-1"),
            Frame::Array(frames) => {
                write!(f, "*{}", frames.len())?;
                for frame in frames {
                    write!(f, " {}", frame)?;
                }
                Ok(())
            }
        }
    }
}

fn get_byte(src: &mut Cursor<&[u8]>) -> Result<u8, Error> {
    if !src.has_remaining() {
        return Err(Error::Incomplete);
    }
    Ok(src.get_u8())
}

/// Returns the bytes up to the next CRLF and advances the cursor past it.
fn get_line<'a>(src: &mut Cursor<&'a [u8]>) -> Result<&'a [u8], Error> {
    let start = src.position() as usize;
    let end = src.get_ref().len();

    let line_end = src.get_ref()[start..end]
        .windows(CRLF.len())
        .position(|window| window == CRLF)
        .map(|index| start + index)
        .ok_or(Error::Incomplete)?;

    src.set_position((line_end + CRLF.len()) as u64);

    Ok(&src.get_ref()[start..line_end])
}

fn to_utf8(line: &[u8]) -> Result<String, Error> {
    str::from_utf8(line)
        .map(str::to_string)
        .map_err(|_| Error::InvalidUtf8)
}

fn to_integer(line: &[u8]) -> Result<i64, Error> {
    let digits = str::from_utf8(line).map_err(|_| Error::InvalidUtf8)?;
    digits
        .parse::<i64>()
        .map_err(|_| Error::InvalidInteger(digits.to_string()))
}

#[derive(Debug)]
enum DataType {
    SimpleString, // '+'
    SimpleError,  // '-'
    Integer,      // ':'
    BulkString,   // '$'
    Array,        // '*'
}

impl TryFrom<u8> for DataType {
    type Error = Error;

    fn try_from(byte: u8) -> Result<Self, Error> {
        match byte {
            b'+' => Ok(Self::SimpleString),
            b'-' => Ok(Self::SimpleError),
            b':' => Ok(Self::Integer),
            b'$' => Ok(Self::BulkString),
            b'*' => Ok(Self::Array),
            _ => Err(Error::InvalidDataType(byte)),
        }
    }
}

impl From<DataType> for u8 {
    fn from(value: DataType) -> Self {
        match value {
            DataType::SimpleString => b'+',
            DataType::SimpleError => b'-',
            DataType::Integer => b':',
            DataType::BulkString => b'$',
            DataType::Array => b'*',
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(data: &[u8]) -> Result<Frame, Error> {
        let mut cursor = Cursor::new(data);
        Frame::parse(&mut cursor)
    }

    #[test]
    fn parse_simple_string_frame() {
        let frame = parse(b"+OK\r\n");

        assert!(matches!(frame, Ok(Frame::Simple(ref s)) if s == "OK"));
    }

    #[test]
    fn parse_simple_error_frame() {
        let frame = parse(b"-ERR unknown command\r\n");

        assert!(matches!(
            frame,
            Ok(Frame::Error(ref s)) if s == "ERR unknown command"
        ));
    }

    #[test]
    fn parse_integer_frame() {
        assert!(matches!(parse(b":1000\r\n"), Ok(Frame::Integer(1000))));
        assert!(matches!(parse(b":-1000\r\n"), Ok(Frame::Integer(-1000))));
        assert!(matches!(parse(b":0\r\n"), Ok(Frame::Integer(0))));
    }

    #[test]
    fn parse_bulk_string_frame() {
        let frame = parse(b"$6\r\nfoobar\r\n");

        assert!(matches!(
            frame,
            Ok(Frame::Bulk(ref b)) if b == &Bytes::from("foobar")
        ));
    }

    #[test]
    fn parse_bulk_string_frame_with_embedded_crlf() {
        let frame = parse(b"$12\r\nhello\r\nworld\r\n");

        assert!(matches!(
            frame,
            Ok(Frame::Bulk(ref b)) if b == &Bytes::from("hello\r\nworld")
        ));
    }

    #[test]
    fn parse_bulk_string_frame_null() {
        assert!(matches!(parse(b"$-1\r\n"), Ok(Frame::Null)));
    }

    #[test]
    fn parse_array_frame_null() {
        assert!(matches!(parse(b"*-1\r\n"), Ok(Frame::Null)));
    }

    #[test]
    fn parse_message_reply() {
        let data = b"*3\r\n$7\r\nmessage\r\n$9\r\nmychannel\r\n$5\r\nhello\r\n";

        let frame = parse(data).unwrap();

        assert_eq!(
            frame,
            Frame::Array(vec![
                Frame::Bulk(Bytes::from("message")),
                Frame::Bulk(Bytes::from("mychannel")),
                Frame::Bulk(Bytes::from("hello")),
            ])
        );
    }

    #[test]
    fn parse_subscribe_ack_reply() {
        let data = b"*3\r\n$9\r\nsubscribe\r\n$9\r\nmychannel\r\n:1\r\n";

        let frame = parse(data).unwrap();

        assert_eq!(
            frame,
            Frame::Array(vec![
                Frame::Bulk(Bytes::from("subscribe")),
                Frame::Bulk(Bytes::from("mychannel")),
                Frame::Integer(1),
            ])
        );
    }

    #[test]
    fn parse_incomplete_frame() {
        assert!(matches!(parse(b""), Err(Error::Incomplete)));
        assert!(matches!(parse(b"*3\r\n$7\r\nmess"), Err(Error::Incomplete)));
        assert!(matches!(parse(b"$10\r\nhello"), Err(Error::Incomplete)));
    }

    #[test]
    fn parse_invalid_data_type() {
        assert!(matches!(parse(b"?what\r\n"), Err(Error::InvalidDataType(b'?'))));
    }

    #[test]
    fn serialize_publish_command() {
        let frame = Frame::command(["PUBLISH", "mychannel", "hello world"]);

        assert_eq!(
            frame.serialize(),
            b"*3\r\n$7\r\nPUBLISH\r\n$9\r\nmychannel\r\n$11\r\nhello world\r\n"
        );
    }

    #[test]
    fn serialize_subscribe_command() {
        let frame = Frame::command(["SUBSCRIBE", "mychannel"]);

        assert_eq!(frame.serialize(), b"*2\r\n$9\r\nSUBSCRIBE\r\n$9\r\nmychannel\r\n");
    }

    #[test]
    fn as_str_on_textual_frames() {
        assert_eq!(Frame::Simple("OK".into()).as_str(), Some("OK"));
        assert_eq!(Frame::Bulk(Bytes::from("hi")).as_str(), Some("hi"));
        assert_eq!(Frame::Integer(5).as_str(), None);
        assert_eq!(Frame::Null.as_str(), None);
    }
}
