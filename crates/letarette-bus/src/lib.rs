//! Letarette Bus: publish/subscribe transport used between workers,
//! document masters and search clients.
//!
//! [`Bus`] is the raw byte-level interface, implemented by [`NatsBus`]
//! for production and [`MemoryBus`] for single-process clusters and
//! tests. [`BusExt`] layers the compressed JSON codec on top.

pub mod codec;
pub mod memory;
pub mod nats;

use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{Stream, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;

use letarette_core::{Error, Result};

pub use memory::MemoryBus;
pub use nats::NatsBus;

/// A message as delivered to a subscriber.
#[derive(Debug, Clone)]
pub struct Message {
    pub subject: String,
    pub reply: Option<String>,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        codec::decode(&self.payload)
    }
}

/// An active subscription. Dropping it unsubscribes.
pub struct Subscription {
    inner: Pin<Box<dyn Stream<Item = Message> + Send>>,
}

impl Subscription {
    pub fn new(stream: impl Stream<Item = Message> + Send + 'static) -> Self {
        Self {
            inner: Box::pin(stream),
        }
    }

    /// Next message, or `None` once the subscription is closed.
    pub async fn next_message(&mut self) -> Option<Message> {
        self.inner.next().await
    }

    /// Close the subscription after `n` messages.
    pub fn take(self, n: usize) -> Self {
        Self::new(self.inner.take(n))
    }
}

impl Stream for Subscription {
    type Item = Message;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Message>> {
        self.inner.as_mut().poll_next(cx)
    }
}

#[async_trait]
pub trait Bus: Send + Sync + 'static {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<()>;

    /// Publish with a reply subject attached.
    async fn publish_request(&self, subject: &str, reply: &str, payload: Vec<u8>) -> Result<()>;

    /// Publish and wait for the first reply.
    async fn request(&self, subject: &str, payload: Vec<u8>, timeout: Duration) -> Result<Message>;

    async fn subscribe(&self, subject: &str) -> Result<Subscription>;

    /// Subscribe as one member of `group`; each message goes to a single member.
    async fn queue_subscribe(&self, subject: &str, group: &str) -> Result<Subscription>;

    /// A fresh, unique reply subject.
    fn new_inbox(&self) -> String;

    /// Largest payload the transport accepts, in bytes.
    fn max_payload(&self) -> usize;

    /// Number of times the connection has been re-established.
    fn reconnects(&self) -> u64 {
        0
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// Typed helpers using the compressed JSON codec.
#[async_trait]
pub trait BusExt: Bus {
    async fn publish_json<T: Serialize + Sync + ?Sized>(&self, subject: &str, value: &T) -> Result<()>;

    async fn publish_request_json<T: Serialize + Sync + ?Sized>(
        &self,
        subject: &str,
        reply: &str,
        value: &T,
    ) -> Result<()>;

    async fn request_json<T, R>(&self, subject: &str, value: &T, timeout: Duration) -> Result<R>
    where
        T: Serialize + Sync + ?Sized,
        R: DeserializeOwned;

    /// Answer a received request on its reply subject.
    async fn reply_json<T: Serialize + Sync + ?Sized>(&self, msg: &Message, value: &T) -> Result<()>;
}

#[async_trait]
impl<B: Bus + ?Sized> BusExt for B {
    async fn publish_json<T: Serialize + Sync + ?Sized>(&self, subject: &str, value: &T) -> Result<()> {
        let payload = codec::encode(value)?;
        self.publish(subject, payload).await
    }

    async fn publish_request_json<T: Serialize + Sync + ?Sized>(
        &self,
        subject: &str,
        reply: &str,
        value: &T,
    ) -> Result<()> {
        let payload = codec::encode(value)?;
        self.publish_request(subject, reply, payload).await
    }

    async fn request_json<T, R>(&self, subject: &str, value: &T, timeout: Duration) -> Result<R>
    where
        T: Serialize + Sync + ?Sized,
        R: DeserializeOwned,
    {
        let payload = codec::encode(value)?;
        let reply = self.request(subject, payload, timeout).await?;
        reply.decode()
    }

    async fn reply_json<T: Serialize + Sync + ?Sized>(&self, msg: &Message, value: &T) -> Result<()> {
        let reply = msg
            .reply
            .as_deref()
            .ok_or_else(|| Error::Protocol(format!("message on {} has no reply subject", msg.subject)))?;
        self.publish_json(reply, value).await
    }
}
