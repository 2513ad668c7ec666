//! # Inbound Message Reassembly
//!
//! Incoming PUBLISH payloads arrive from the transport in bounded reads, so a
//! single logical message may span several chunks. The reassembler matches the
//! topic against the subscription table once, up front, then accumulates
//! payload chunks until the final one and delivers the whole message to the
//! matched handler.
//!
//! A payload that fits in one final chunk is delivered straight from the
//! receive buffer without copying.

use heapless::{String, Vec};

use crate::handle::Message;
use crate::subscription::{SubKey, SubscriptionTable, MAX_TOPIC_LEN};

struct Active {
    key: SubKey,
    topic: String<MAX_TOPIC_LEN>,
    retain: bool,
    buf: Vec<u8, { crate::client::MAX_PAYLOAD_LEN }>,
    /// Set once a chunk no longer fits; the message is dropped on completion.
    overflowed: bool,
}

/// Accumulates chunked inbound publishes and dispatches complete messages.
///
/// Owned by the network task alongside the subscription table. Only one
/// message is ever in flight at a time because the transport delivers
/// payload bytes in order.
pub(crate) struct Reassembler {
    active: Option<Active>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self { active: None }
    }

    /// Starts a new inbound message. Any previous partial message is dropped.
    ///
    /// If no subscription filter matches the topic (or the topic is too long
    /// to track), the message body is consumed and discarded chunk by chunk.
    pub fn begin<const N: usize>(
        &mut self,
        topic: &str,
        retain: bool,
        table: &SubscriptionTable<N>,
    ) {
        self.active = None;
        let Some(key) = table.match_topic(topic) else {
            debug!("no subscription matches topic {}", topic);
            return;
        };
        let Ok(topic) = String::try_from(topic) else {
            warn!("inbound topic exceeds {} bytes, dropping message", MAX_TOPIC_LEN);
            return;
        };
        self.active = Some(Active {
            key,
            topic,
            retain,
            buf: Vec::new(),
            overflowed: false,
        });
    }

    /// Feeds one payload chunk. On the final chunk of a matched message the
    /// handler runs inline, then the reassembler returns to idle.
    pub fn chunk<const N: usize>(
        &mut self,
        data: &[u8],
        is_last: bool,
        table: &SubscriptionTable<N>,
    ) {
        let Some(active) = &mut self.active else {
            return;
        };

        if active.buf.is_empty() && is_last && !active.overflowed {
            // Single-chunk message, deliver without copying.
            let active = self.active.take().unwrap();
            deliver(&active, data, table);
            return;
        }

        if !active.overflowed && active.buf.extend_from_slice(data).is_err() {
            warn!("message on {} exceeds reassembly buffer, dropping", active.topic.as_str());
            active.overflowed = true;
        }

        if is_last {
            let active = self.active.take().unwrap();
            if !active.overflowed {
                deliver(&active, &active.buf, table);
            }
        }
    }

    /// Drops any partial message. Called when the connection is lost, since
    /// the remaining chunks will never arrive.
    pub fn reset(&mut self) {
        self.active = None;
    }
}

fn deliver<const N: usize>(active: &Active, payload: &[u8], table: &SubscriptionTable<N>) {
    // Re-check at delivery time: the subscription may have been removed or
    // marked unwanted while the message was streaming in.
    let Some(sub) = table.get(active.key) else {
        return;
    };
    if !sub.want_subscribed {
        return;
    }
    sub.handler.on_message(Message {
        topic: &active.topic,
        payload,
        retain: active.retain,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::MessageHandler;
    use crate::packet::QoS;
    use crate::subscription::Subscription;
    use std::sync::Mutex;
    use std::vec::Vec as StdVec;

    #[derive(Default)]
    struct Recorder {
        messages: Mutex<StdVec<(std::string::String, StdVec<u8>)>>,
    }

    impl MessageHandler for Recorder {
        fn on_message(&self, message: Message<'_>) {
            self.messages
                .lock()
                .unwrap()
                .push((message.topic.into(), message.payload.into()));
        }
    }

    fn recorder() -> &'static Recorder {
        Box::leak(Box::new(Recorder::default()))
    }

    fn table_with(filter: &str, handler: &'static Recorder) -> SubscriptionTable<4> {
        let mut table = SubscriptionTable::new();
        table
            .insert(Subscription::new(
                String::try_from(filter).unwrap(),
                QoS::AtMostOnce,
                handler,
            ))
            .unwrap();
        table
    }

    #[test]
    fn single_chunk_message_is_delivered() {
        let handler = recorder();
        let table = table_with("a/b", handler);
        let mut reassembler = Reassembler::new();

        reassembler.begin("a/b", false, &table);
        reassembler.chunk(b"Hello", true, &table);

        let messages = handler.messages.lock().unwrap();
        assert_eq!(messages.as_slice(), &[("a/b".into(), b"Hello".to_vec())]);
    }

    #[test]
    fn chunks_are_reassembled_in_order() {
        let handler = recorder();
        let table = table_with("a/b", handler);
        let mut reassembler = Reassembler::new();

        reassembler.begin("a/b", false, &table);
        reassembler.chunk(b"He", false, &table);
        reassembler.chunk(b"llo", true, &table);

        let messages = handler.messages.lock().unwrap();
        assert_eq!(messages.as_slice(), &[("a/b".into(), b"Hello".to_vec())]);
    }

    #[test]
    fn unmatched_topic_is_discarded() {
        let handler = recorder();
        let table = table_with("a/b", handler);
        let mut reassembler = Reassembler::new();

        reassembler.begin("other/topic", false, &table);
        reassembler.chunk(b"payload", true, &table);

        assert!(handler.messages.lock().unwrap().is_empty());
    }

    #[test]
    fn wildcard_match_delivers_concrete_topic() {
        let handler = recorder();
        let table = table_with("a/+", handler);
        let mut reassembler = Reassembler::new();

        reassembler.begin("a/b", false, &table);
        reassembler.chunk(b"x", true, &table);

        let messages = handler.messages.lock().unwrap();
        assert_eq!(messages[0].0, "a/b");
    }

    #[test]
    fn oversized_message_is_dropped() {
        let handler = recorder();
        let table = table_with("a/b", handler);
        let mut reassembler = Reassembler::new();

        reassembler.begin("a/b", false, &table);
        let big = [0u8; crate::client::MAX_PAYLOAD_LEN];
        reassembler.chunk(&big, false, &table);
        reassembler.chunk(b"one more byte", true, &table);

        assert!(handler.messages.lock().unwrap().is_empty());
    }

    #[test]
    fn unwanted_subscription_is_not_delivered() {
        let handler = recorder();
        let mut table = table_with("a/b", handler);
        let mut reassembler = Reassembler::new();

        reassembler.begin("a/b", false, &table);
        reassembler.chunk(b"He", false, &table);
        // Unsubscribe lands between chunks.
        let key = table.find("a/b").unwrap();
        table.get_mut(key).unwrap().want_subscribed = false;
        reassembler.chunk(b"llo", true, &table);

        assert!(handler.messages.lock().unwrap().is_empty());
    }

    #[test]
    fn reset_drops_partial_message() {
        let handler = recorder();
        let table = table_with("a/b", handler);
        let mut reassembler = Reassembler::new();

        reassembler.begin("a/b", false, &table);
        reassembler.chunk(b"He", false, &table);
        reassembler.reset();
        // A stray final chunk after reset goes nowhere.
        reassembler.chunk(b"llo", true, &table);

        assert!(handler.messages.lock().unwrap().is_empty());
    }
}
