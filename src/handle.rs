//! # Application Facade
//!
//! `MqttHandle` is the application-facing side of the client. It is a cheap,
//! copyable handle that can be passed to any task; all protocol state stays
//! with the network task. Requests travel over a channel as owned values, and
//! each call blocks on a completion slot until the network task settles the
//! operation.

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::{Channel, Receiver, Sender};
use heapless::{String, Vec};

use crate::client::MAX_PAYLOAD_LEN;
use crate::completion::{CompletionPool, Token};
use crate::error::ClientError;
use crate::matcher::{valid_filter, valid_topic};
use crate::packet::QoS;
use crate::subscription::MAX_TOPIC_LEN;

/// Depth of the request channel between handles and the network task.
pub(crate) const REQUEST_QUEUE_DEPTH: usize = 4;

/// Number of operations that may be awaiting completion at once.
pub(crate) const COMPLETION_SLOTS: usize = 8;

/// A received application message, borrowed for the duration of the handler
/// call.
#[derive(Debug, Clone, Copy)]
pub struct Message<'a> {
    /// The concrete topic the message arrived on (not the filter that
    /// matched it).
    pub topic: &'a str,
    pub payload: &'a [u8],
    /// Whether the broker flagged this as a retained message.
    pub retain: bool,
}

/// Receives messages for one subscription.
///
/// Handlers run inline on the network task, so they must return promptly: the
/// client reads no further packets while a handler runs. In particular, a
/// handler must not await an [`MqttHandle`] operation of its own client, as
/// that request would wait on the very task it is running on. Use
/// [`MqttHandle::try_publish`] or hand the work to another task instead.
pub trait MessageHandler: Sync {
    fn on_message(&self, message: Message<'_>);
}

/// An operation shipped to the network task. Topic and payload are stored
/// inline so the caller's buffers need not outlive the call.
pub(crate) enum Request {
    Publish {
        topic: String<MAX_TOPIC_LEN>,
        payload: Vec<u8, MAX_PAYLOAD_LEN>,
        qos: QoS,
        retain: bool,
        /// `None` for fire-and-forget publishes; nobody is waiting.
        token: Option<Token>,
    },
    Subscribe {
        filter: String<MAX_TOPIC_LEN>,
        qos: QoS,
        handler: &'static dyn MessageHandler,
        token: Token,
    },
    Unsubscribe {
        filter: String<MAX_TOPIC_LEN>,
        token: Token,
    },
}

pub(crate) type RequestChannel =
    Channel<CriticalSectionRawMutex, Request, REQUEST_QUEUE_DEPTH>;
pub(crate) type RequestSender<'a> =
    Sender<'a, CriticalSectionRawMutex, Request, REQUEST_QUEUE_DEPTH>;
pub(crate) type RequestReceiver<'a> =
    Receiver<'a, CriticalSectionRawMutex, Request, REQUEST_QUEUE_DEPTH>;

/// A handle for issuing MQTT operations from application tasks.
///
/// Obtained from [`MqttState::split`](crate::client::MqttState::split), and
/// freely copyable across tasks.
#[derive(Clone, Copy)]
pub struct MqttHandle<'a> {
    tx: RequestSender<'a>,
    completions: &'a CompletionPool<COMPLETION_SLOTS>,
}

impl<'a> MqttHandle<'a> {
    pub(crate) fn new(
        tx: RequestSender<'a>,
        completions: &'a CompletionPool<COMPLETION_SLOTS>,
    ) -> Self {
        Self { tx, completions }
    }

    /// Publishes a message and waits until it is settled: written out for
    /// QoS 0, acknowledged by the broker for QoS 1 and 2.
    ///
    /// Fails with [`ClientError::NotConnected`] when the client has no broker
    /// connection, and with [`ClientError::ConnectionLost`] when the
    /// connection drops before the acknowledgement arrives.
    pub async fn publish(
        &self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<(), ClientError> {
        if !valid_topic(topic) {
            return Err(ClientError::InvalidTopic);
        }
        let topic = String::try_from(topic).map_err(|_| ClientError::InvalidTopic)?;
        let payload = Vec::from_slice(payload).map_err(|_| ClientError::PayloadTooLarge)?;

        let claim = self.completions.claim().ok_or(ClientError::QueueFull)?;
        self.tx
            .send(Request::Publish {
                topic,
                payload,
                qos,
                retain,
                token: Some(claim.token()),
            })
            .await;
        claim.wait().await
    }

    /// Queues a publish without waiting for the outcome.
    ///
    /// Returns [`ClientError::QueueFull`] instead of blocking when the
    /// request queue has no room. Safe to call from a message handler.
    pub fn try_publish(
        &self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<(), ClientError> {
        if !valid_topic(topic) {
            return Err(ClientError::InvalidTopic);
        }
        let topic = String::try_from(topic).map_err(|_| ClientError::InvalidTopic)?;
        let payload = Vec::from_slice(payload).map_err(|_| ClientError::PayloadTooLarge)?;

        self.tx
            .try_send(Request::Publish {
                topic,
                payload,
                qos,
                retain,
                token: None,
            })
            .map_err(|_| ClientError::QueueFull)?;
        Ok(())
    }

    /// Registers `handler` for `filter` and marks the subscription as
    /// desired.
    ///
    /// Returns once the client has recorded the subscription and attempted
    /// the broker request. A subscribe attempted while disconnected fails
    /// with [`ClientError::NotConnected`]; once this call has succeeded the
    /// subscription is tracked and re-established after every reconnect
    /// until [`Self::unsubscribe`] is called.
    ///
    /// Calling subscribe again for an already-tracked filter replaces the
    /// registration: the new qos and handler take effect and the failure
    /// counter resets.
    pub async fn subscribe(
        &self,
        filter: &str,
        qos: QoS,
        handler: &'static dyn MessageHandler,
    ) -> Result<(), ClientError> {
        if !valid_filter(filter) {
            return Err(ClientError::InvalidFilter);
        }
        let filter = String::try_from(filter).map_err(|_| ClientError::InvalidFilter)?;

        let claim = self.completions.claim().ok_or(ClientError::QueueFull)?;
        self.tx
            .send(Request::Subscribe {
                filter,
                qos,
                handler,
                token: claim.token(),
            })
            .await;
        claim.wait().await
    }

    /// Marks the subscription for `filter` as no longer desired.
    ///
    /// Delivery to its handler stops as soon as the network task processes
    /// the request, even if the broker-side unsubscribe is still pending.
    /// Unsubscribing a filter that was never subscribed (or could never be
    /// one) is a no-op. While disconnected the call fails with
    /// [`ClientError::NotConnected`], but the dropped desire is still
    /// recorded and the broker side is cleaned up on the next connect.
    ///
    /// When subscribe and unsubscribe calls for the same filter race, the
    /// last request the network task processes determines the final state.
    pub async fn unsubscribe(&self, filter: &str) -> Result<(), ClientError> {
        // A filter that can never be tracked is already unsubscribed.
        let Ok(filter) = String::try_from(filter) else {
            return Ok(());
        };
        if !valid_filter(&filter) {
            return Ok(());
        }

        let claim = self.completions.claim().ok_or(ClientError::QueueFull)?;
        self.tx
            .send(Request::Unsubscribe {
                filter,
                token: claim.token(),
            })
            .await;
        claim.wait().await
    }
}
