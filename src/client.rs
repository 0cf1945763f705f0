use futures::{SinkExt, StreamExt};
use thiserror::Error as ThisError;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::debug;

use crate::codec::FrameCodec;
use crate::frame::{self, Frame};

#[derive(Debug, ThisError)]
pub enum Error {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Frame(#[from] frame::Error),
    #[error("connection closed by server")]
    ConnectionClosed,
    #[error("server error: {0}")]
    Server(String),
    #[error("protocol error; unexpected reply: {0}")]
    UnexpectedReply(Frame),
}

/// A framed session with the server. Whoever opens it owns it; dropping it
/// closes the underlying socket.
pub struct Connection {
    framed: Framed<TcpStream, FrameCodec>,
}

impl Connection {
    pub async fn connect(host: &str, port: u16) -> Result<Connection, Error> {
        let stream = TcpStream::connect((host, port)).await?;

        Ok(Connection {
            framed: Framed::new(stream, FrameCodec),
        })
    }

    pub async fn send(&mut self, frame: Frame) -> Result<(), Error> {
        self.framed.send(frame).await?;
        Ok(())
    }

    /// Reads the next decoded frame. `Ok(None)` means the server closed the
    /// connection.
    pub async fn next_frame(&mut self) -> Result<Option<Frame>, Error> {
        match self.framed.next().await {
            Some(frame) => Ok(Some(frame?)),
            None => Ok(None),
        }
    }
}

/// One-connection publishing client.
pub struct Publisher {
    conn: Connection,
}

impl Publisher {
    pub async fn connect(host: &str, port: u16) -> Result<Publisher, Error> {
        Ok(Publisher {
            conn: Connection::connect(host, port).await?,
        })
    }

    /// Publishes `message` on `channel` and returns the number of clients
    /// subscribed to the channel at the moment of publish. The count is not
    /// a delivery acknowledgment.
    ///
    /// Ref: <https://redis.io/docs/latest/commands/publish>
    pub async fn publish(&mut self, channel: &str, message: &str) -> Result<i64, Error> {
        self.conn
            .send(Frame::command(["PUBLISH", channel, message]))
            .await?;

        // One round trip per call. A closed stream here means the connection
        // is unusable for any further publish.
        match self.conn.next_frame().await? {
            Some(Frame::Integer(subscribers)) => Ok(subscribers),
            Some(Frame::Error(message)) => Err(Error::Server(message)),
            Some(frame) => Err(Error::UnexpectedReply(frame)),
            None => Err(Error::ConnectionClosed),
        }
    }
}

/// A reply arriving on a subscribed connection.
#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    /// A payload delivered on a channel this connection subscribes to.
    Message { channel: String, payload: String },
    /// Acknowledgment of a SUBSCRIBE, carrying the connection's new total
    /// subscription count.
    Subscribed { channel: String, subscriptions: i64 },
}

impl Event {
    /// Decodes a pub/sub reply. Both shapes that matter are three-element
    /// arrays tagged with their kind; any other reply yields `None`.
    fn from_frame(frame: &Frame) -> Option<Event> {
        let items = match frame {
            Frame::Array(items) if items.len() == 3 => items,
            _ => return None,
        };

        match items[0].as_str()? {
            "message" => Some(Event::Message {
                channel: items[1].as_str()?.to_string(),
                payload: items[2].as_str()?.to_string(),
            }),
            "subscribe" => {
                let subscriptions = match &items[2] {
                    Frame::Integer(count) => *count,
                    _ => return None,
                };

                Some(Event::Subscribed {
                    channel: items[1].as_str()?.to_string(),
                    subscriptions,
                })
            }
            _ => None,
        }
    }
}

/// One-connection subscribing client.
pub struct Subscriber {
    conn: Connection,
}

impl Subscriber {
    pub async fn connect(host: &str, port: u16) -> Result<Subscriber, Error> {
        Ok(Subscriber {
            conn: Connection::connect(host, port).await?,
        })
    }

    /// Issues a SUBSCRIBE. The acknowledgment is not read here; it arrives
    /// on the reply stream and surfaces through [`Subscriber::next_event`].
    pub async fn subscribe(&mut self, channel: &str) -> Result<(), Error> {
        self.conn
            .send(Frame::command(["SUBSCRIBE", channel]))
            .await
    }

    /// Reads the next pub/sub event, silently skipping replies that are
    /// neither a message nor a subscribe acknowledgment. Blocks until the
    /// server sends one or closes the connection; there is no timeout.
    pub async fn next_event(&mut self) -> Result<Event, Error> {
        loop {
            let frame = self
                .conn
                .next_frame()
                .await?
                .ok_or(Error::ConnectionClosed)?;

            match Event::from_frame(&frame) {
                Some(event) => return Ok(event),
                None => debug!("ignoring non-pubsub reply: {}", frame),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    fn bulk(s: &str) -> Frame {
        Frame::Bulk(Bytes::copy_from_slice(s.as_bytes()))
    }

    #[test]
    fn decode_message_event() {
        let frame = Frame::Array(vec![bulk("message"), bulk("news"), bulk("hello")]);

        assert_eq!(
            Event::from_frame(&frame),
            Some(Event::Message {
                channel: String::from("news"),
                payload: String::from("hello"),
            })
        );
    }

    #[test]
    fn decode_subscribe_ack_event() {
        let frame = Frame::Array(vec![bulk("subscribe"), bulk("news"), Frame::Integer(2)]);

        assert_eq!(
            Event::from_frame(&frame),
            Some(Event::Subscribed {
                channel: String::from("news"),
                subscriptions: 2,
            })
        );
    }

    #[test]
    fn decode_ignores_other_tags() {
        let frame = Frame::Array(vec![bulk("unsubscribe"), bulk("news"), Frame::Integer(0)]);

        assert_eq!(Event::from_frame(&frame), None);
    }

    #[test]
    fn decode_ignores_other_shapes() {
        assert_eq!(Event::from_frame(&Frame::Simple("OK".into())), None);
        assert_eq!(Event::from_frame(&Frame::Integer(1)), None);
        assert_eq!(
            Event::from_frame(&Frame::Array(vec![bulk("message"), bulk("news")])),
            None
        );
    }

    #[test]
    fn decode_ignores_malformed_subscribe_ack() {
        // count slot holds a string instead of an integer
        let frame = Frame::Array(vec![bulk("subscribe"), bulk("news"), bulk("2")]);

        assert_eq!(Event::from_frame(&frame), None);
    }
}
