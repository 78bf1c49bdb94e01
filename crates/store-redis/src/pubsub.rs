use std::collections::HashMap;
use std::pin::pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use keylock_store::Subscription;
use redis::aio::{PubSubSink, PubSubStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::Error;

const CHANNEL_CAPACITY: usize = 64;

type SubscribeReply = oneshot::Sender<Result<broadcast::Receiver<Bytes>, redis::RedisError>>;

pub enum Command {
    Subscribe {
        channel: String,
        reply: SubscribeReply,
    },
    Unsubscribe {
        channel: String,
    },
}

struct ChannelState {
    sender: broadcast::Sender<Bytes>,
    subscribers: usize,
}

/// Owns the pub/sub connection. Redis `SUBSCRIBE` is issued once per channel
/// no matter how many local subscriptions share it, and `UNSUBSCRIBE` once
/// the last one is dropped.
pub async fn run_dispatcher(
    mut sink: PubSubSink,
    stream: PubSubStream,
    mut commands: mpsc::UnboundedReceiver<Command>,
    shutdown: CancellationToken,
) {
    let mut stream = pin!(stream);
    let mut channels: HashMap<String, ChannelState> = HashMap::new();

    loop {
        tokio::select! {
            () = shutdown.cancelled() => {
                debug!("Pub/sub dispatcher shutting down");
                break;
            }
            command = commands.recv() => match command {
                Some(Command::Subscribe { channel, reply }) => {
                    let result = add_subscriber(&mut sink, &mut channels, &channel).await;

                    // A requester cancelled mid-subscribe never builds its handle.
                    if let Err(Ok(_receiver)) = reply.send(result) {
                        remove_subscriber(&mut sink, &mut channels, &channel).await;
                    }
                }
                Some(Command::Unsubscribe { channel }) => {
                    remove_subscriber(&mut sink, &mut channels, &channel).await;
                }
                None => break,
            },
            message = stream.next() => {
                let Some(message) = message else {
                    warn!("Pub/sub connection closed");
                    break;
                };

                if let Some(state) = channels.get(message.get_channel_name()) {
                    // An error only means every local waiter already left.
                    let _ = state
                        .sender
                        .send(Bytes::copy_from_slice(message.get_payload_bytes()));
                }
            }
        }
    }

    // Dropping the senders ends every outstanding subscription.
    channels.clear();
}

async fn add_subscriber(
    sink: &mut PubSubSink,
    channels: &mut HashMap<String, ChannelState>,
    channel: &str,
) -> Result<broadcast::Receiver<Bytes>, redis::RedisError> {
    if let Some(state) = channels.get_mut(channel) {
        state.subscribers += 1;
        return Ok(state.sender.subscribe());
    }

    sink.subscribe(channel).await?;
    debug!(channel, "Subscribed");

    let (sender, receiver) = broadcast::channel(CHANNEL_CAPACITY);
    channels.insert(
        channel.to_string(),
        ChannelState {
            sender,
            subscribers: 1,
        },
    );

    Ok(receiver)
}

async fn remove_subscriber(
    sink: &mut PubSubSink,
    channels: &mut HashMap<String, ChannelState>,
    channel: &str,
) {
    let Some(state) = channels.get_mut(channel) else {
        return;
    };

    state.subscribers = state.subscribers.saturating_sub(1);
    if state.subscribers > 0 {
        return;
    }

    channels.remove(channel);

    if let Err(e) = sink.unsubscribe(channel).await {
        warn!(channel, error = ?e, "Failed to unsubscribe");
    } else {
        debug!(channel, "Unsubscribed");
    }
}

/// Subscription to one channel of a `RedisLockStore`.
///
/// Dropping it hands the unsubscribe to the dispatcher, so it is safe to drop
/// from synchronous cleanup code.
#[derive(Debug)]
pub struct RedisSubscription {
    channel: String,
    receiver: broadcast::Receiver<Bytes>,
    commands: mpsc::UnboundedSender<Command>,
}

impl RedisSubscription {
    pub(crate) const fn new(
        channel: String,
        receiver: broadcast::Receiver<Bytes>,
        commands: mpsc::UnboundedSender<Command>,
    ) -> Self {
        Self {
            channel,
            receiver,
            commands,
        }
    }
}

impl Drop for RedisSubscription {
    fn drop(&mut self) {
        // Fails only once the dispatcher has stopped, which already unsubscribed everything.
        let _ = self.commands.send(Command::Unsubscribe {
            channel: std::mem::take(&mut self.channel),
        });
    }
}

#[async_trait]
impl Subscription for RedisSubscription {
    type Error = Error;

    async fn next_message(&mut self) -> Result<Option<Bytes>, Self::Error> {
        match self.receiver.recv().await {
            Ok(payload) => Ok(Some(payload)),
            Err(RecvError::Lagged(skipped)) => {
                warn!(channel = %self.channel, skipped, "Subscription lagged behind publisher");
                Ok(Some(Bytes::new()))
            }
            Err(RecvError::Closed) => Ok(None),
        }
    }
}
