//! Callback-based pub/sub client.
//!
//! Owns two connections: publishes go out on one, serialized by a lock;
//! subscriptions live on the other, which a background task owns outright.
//! Registered handlers are invoked by that task as messages arrive.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use thiserror::Error as ThisError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::client::{self, Event, Publisher, Subscriber};

/// Upper bound on concurrently registered channels.
pub const MAX_SUBSCRIPTIONS: usize = 100;

#[derive(Debug, ThisError)]
pub enum Error {
    #[error("client is closed")]
    Closed,
    #[error("channel name must not be empty")]
    EmptyChannel,
    #[error("subscription table full (max {MAX_SUBSCRIPTIONS} channels)")]
    SubscriptionLimit,
    #[error("already subscribed to channel {0:?}")]
    AlreadySubscribed(String),
    #[error(transparent)]
    Client(#[from] client::Error),
}

/// Receives messages for one subscribed channel.
///
/// Implemented for free by any `Fn(&str, &str)` closure that is
/// `Send + Sync`. Handlers run synchronously on the reader task, so a slow
/// handler stalls delivery for every channel.
pub trait MessageHandler: Send + Sync {
    fn handle(&self, channel: &str, payload: &str);
}

impl<F> MessageHandler for F
where
    F: Fn(&str, &str) + Send + Sync,
{
    fn handle(&self, channel: &str, payload: &str) {
        self(channel, payload)
    }
}

/// Channel-to-handler registrations, bounded at [`MAX_SUBSCRIPTIONS`].
/// Keyed by channel, so a channel can hold at most one handler and dispatch
/// is a lookup rather than a scan.
#[derive(Default)]
struct Registry {
    handlers: HashMap<String, Arc<dyn MessageHandler>>,
}

impl Registry {
    fn insert(&mut self, channel: &str, handler: Arc<dyn MessageHandler>) -> Result<(), Error> {
        if self.handlers.len() >= MAX_SUBSCRIPTIONS {
            return Err(Error::SubscriptionLimit);
        }
        if self.handlers.contains_key(channel) {
            return Err(Error::AlreadySubscribed(channel.to_string()));
        }

        self.handlers.insert(channel.to_string(), handler);
        Ok(())
    }

    fn remove(&mut self, channel: &str) {
        self.handlers.remove(channel);
    }

    fn get(&self, channel: &str) -> Option<Arc<dyn MessageHandler>> {
        self.handlers.get(channel).cloned()
    }

    fn clear(&mut self) {
        self.handlers.clear();
    }
}

/// State shared between the caller-facing [`PubSub`] handle and the reader
/// task. The registry mutex is never held across an await point.
struct Shared {
    registry: Mutex<Registry>,
    running: AtomicBool,
    last_error: Mutex<Option<String>>,
}

impl Shared {
    fn registry(&self) -> std::sync::MutexGuard<'_, Registry> {
        self.registry.lock().unwrap()
    }
}

/// A new-subscription request funneled to the reader task, which is the only
/// place allowed to write on the subscribe connection once it is running.
struct SubscribeRequest {
    channel: String,
    ack: oneshot::Sender<Result<(), client::Error>>,
}

enum Reader {
    /// Connection opened at [`PubSub::connect`], waiting for the first
    /// subscription before any task is spawned.
    Parked(Subscriber),
    /// The background task owns the connection.
    Running {
        requests: mpsc::UnboundedSender<SubscribeRequest>,
        handle: JoinHandle<()>,
    },
    Closed,
}

pub struct PubSub {
    publisher: tokio::sync::Mutex<Option<Publisher>>,
    reader: Reader,
    shared: Arc<Shared>,
}

impl PubSub {
    /// Opens the publish and subscribe connections. If either fails, neither
    /// survives: the first connection is dropped when the second one's error
    /// propagates, so a failed connect leaves no state behind.
    pub async fn connect(host: &str, port: u16) -> Result<PubSub, Error> {
        let publisher = Publisher::connect(host, port).await?;
        let subscriber = Subscriber::connect(host, port).await?;

        debug!("connected to {}:{}", host, port);

        Ok(PubSub {
            publisher: tokio::sync::Mutex::new(Some(publisher)),
            reader: Reader::Parked(subscriber),
            shared: Arc::new(Shared {
                registry: Mutex::new(Registry::default()),
                running: AtomicBool::new(true),
                last_error: Mutex::new(None),
            }),
        })
    }

    /// Publishes on the shared publish connection, serialized by a lock so
    /// concurrent publishes hit the wire in lock-acquisition order. Returns
    /// the channel's subscriber count at the moment of publish.
    pub async fn publish(&self, channel: &str, message: &str) -> Result<i64, Error> {
        if channel.is_empty() {
            return Err(Error::EmptyChannel);
        }

        let mut publisher = self.publisher.lock().await;
        let publisher = publisher.as_mut().ok_or(Error::Closed)?;

        Ok(publisher.publish(channel, message).await?)
    }

    /// Registers `handler` for `channel` and issues the SUBSCRIBE command.
    /// The first successful registration starts the background reader task,
    /// which takes ownership of the subscribe connection; later registrations
    /// are routed to it. If the command cannot be issued, the registration is
    /// rolled back and the table is left unchanged.
    pub async fn subscribe<H>(&mut self, channel: &str, handler: H) -> Result<(), Error>
    where
        H: MessageHandler + 'static,
    {
        if channel.is_empty() {
            return Err(Error::EmptyChannel);
        }
        if matches!(self.reader, Reader::Closed) {
            return Err(Error::Closed);
        }

        // Register before issuing the command so a message racing the
        // acknowledgment already finds its handler.
        self.shared.registry().insert(channel, Arc::new(handler))?;

        let result = self.issue_subscribe(channel).await;
        if result.is_err() {
            self.shared.registry().remove(channel);
        }
        result
    }

    async fn issue_subscribe(&mut self, channel: &str) -> Result<(), Error> {
        match &self.reader {
            Reader::Parked(_) => {
                let Reader::Parked(mut subscriber) =
                    std::mem::replace(&mut self.reader, Reader::Closed)
                else {
                    unreachable!()
                };

                // No reader task exists yet, so writing directly on the
                // connection cannot interleave with anything.
                match subscriber.subscribe(channel).await {
                    Ok(()) => {
                        let (requests, receiver) = mpsc::unbounded_channel();
                        let handle =
                            tokio::spawn(read_loop(subscriber, receiver, Arc::clone(&self.shared)));
                        self.reader = Reader::Running { requests, handle };
                        Ok(())
                    }
                    Err(err) => {
                        self.reader = Reader::Parked(subscriber);
                        Err(err.into())
                    }
                }
            }
            Reader::Running { requests, .. } => {
                let (ack, ack_rx) = oneshot::channel();
                let request = SubscribeRequest {
                    channel: channel.to_string(),
                    ack,
                };

                // A send or ack failure means the reader task has exited,
                // which only happens when the connection is gone.
                if requests.send(request).is_err() {
                    return Err(client::Error::ConnectionClosed.into());
                }
                match ack_rx.await {
                    Ok(result) => Ok(result?),
                    Err(_) => Err(client::Error::ConnectionClosed.into()),
                }
            }
            Reader::Closed => Err(Error::Closed),
        }
    }

    /// Shuts the client down. Idempotent. The subscribe-request channel is
    /// dropped as the shutdown signal, the reader task is joined before any
    /// connection state is released, and the registration table is cleared.
    /// Subsequent calls to [`PubSub::publish`] or [`PubSub::subscribe`]
    /// return [`Error::Closed`].
    pub async fn close(&mut self) {
        // Clear the flag first so a read failure caused by the teardown is
        // classified as a graceful shutdown, not a lost connection.
        self.shared.running.store(false, Ordering::SeqCst);

        match std::mem::replace(&mut self.reader, Reader::Closed) {
            Reader::Running { requests, handle } => {
                drop(requests);
                if let Err(err) = handle.await {
                    error!("subscription reader task failed: {}", err);
                }
            }
            Reader::Parked(_) | Reader::Closed => {}
        }

        self.shared.registry().clear();
        *self.publisher.get_mut() = None;

        debug!("pub/sub client closed");
    }

    /// False once [`PubSub::close`] has begun or the reader task has
    /// stopped after losing its connection.
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// The connection-loss error recorded by the reader task, if any.
    /// Message delivery has ceased for good once this is set.
    pub fn last_error(&self) -> Option<String> {
        self.shared.last_error.lock().unwrap().clone()
    }
}

/// Reader-task loop: the sole owner of the subscribe connection. New
/// SUBSCRIBE commands arrive over `requests` so they never interleave with
/// reply reads at the framing level; a closed `requests` channel is the
/// shutdown signal.
async fn read_loop(
    mut subscriber: Subscriber,
    mut requests: mpsc::UnboundedReceiver<SubscribeRequest>,
    shared: Arc<Shared>,
) {
    debug!("subscription reader started");

    loop {
        tokio::select! {
            request = requests.recv() => match request {
                Some(SubscribeRequest { channel, ack }) => {
                    let result = subscriber.subscribe(&channel).await;
                    // The caller may have given up waiting; nothing to do then.
                    let _ = ack.send(result);
                }
                None => break,
            },
            event = subscriber.next_event() => match event {
                Ok(Event::Message { channel, payload }) => {
                    let handler = shared.registry().get(&channel);
                    match handler {
                        // Invoked outside the lock; at most one handler fires
                        // per message since the table is keyed by channel.
                        Some(handler) => handler.handle(&channel, &payload),
                        None => debug!("message on channel {:?} with no handler", channel),
                    }
                }
                Ok(Event::Subscribed { channel, subscriptions }) => {
                    debug!(
                        "subscribed to {:?} (total subscriptions: {})",
                        channel, subscriptions
                    );
                }
                Err(err) => {
                    // A still-set running flag distinguishes genuine
                    // connection loss from close() tearing the client down.
                    if shared.running.swap(false, Ordering::SeqCst) {
                        error!("connection lost in subscription reader: {}", err);
                        *shared.last_error.lock().unwrap() = Some(err.to_string());
                    }
                    break;
                }
            },
        }
    }

    debug!("subscription reader stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> Arc<dyn MessageHandler> {
        Arc::new(|_: &str, _: &str| {})
    }

    #[test]
    fn registry_rejects_duplicate_channel() {
        let mut registry = Registry::default();

        registry.insert("news", noop()).unwrap();
        let err = registry.insert("news", noop()).unwrap_err();

        assert!(matches!(err, Error::AlreadySubscribed(ref c) if c == "news"));
        assert!(registry.get("news").is_some());
    }

    #[test]
    fn registry_rejects_insert_beyond_capacity() {
        let mut registry = Registry::default();

        for i in 0..MAX_SUBSCRIPTIONS {
            registry.insert(&format!("channel-{}", i), noop()).unwrap();
        }

        let err = registry.insert("one-too-many", noop()).unwrap_err();

        assert!(matches!(err, Error::SubscriptionLimit));
        // The table is unchanged: still exactly the accepted entries.
        assert_eq!(registry.handlers.len(), MAX_SUBSCRIPTIONS);
        assert!(registry.get("one-too-many").is_none());
        assert!(registry.get("channel-0").is_some());
        assert!(registry.get("channel-99").is_some());
    }

    #[test]
    fn registry_lookup_is_per_channel() {
        let mut registry = Registry::default();

        registry.insert("news", noop()).unwrap();

        assert!(registry.get("news").is_some());
        assert!(registry.get("other").is_none());

        registry.remove("news");
        assert!(registry.get("news").is_none());
    }
}
