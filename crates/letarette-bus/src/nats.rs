//! NATS transport.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_nats::{ConnectOptions, Event, RequestErrorKind};
use async_trait::async_trait;
use futures::StreamExt;
use tracing::{info, warn};

use crate::{Bus, Message, Subscription};
use letarette_core::config::NatsConfig;
use letarette_core::{Error, Result};

pub struct NatsBus {
    client: async_nats::Client,
    reconnects: Arc<AtomicU64>,
}

fn convert(msg: async_nats::Message) -> Message {
    Message {
        subject: msg.subject.to_string(),
        reply: msg.reply.map(|r| r.to_string()),
        payload: msg.payload.to_vec(),
    }
}

impl NatsBus {
    /// Connect using the configured servers and credentials. Reconnects
    /// are retried forever.
    pub async fn connect(cfg: &NatsConfig) -> Result<Self> {
        let reconnects = Arc::new(AtomicU64::new(0));
        let counter = reconnects.clone();

        let mut options = ConnectOptions::new()
            .max_reconnects(None)
            .event_callback(move |event| {
                let counter = counter.clone();
                async move {
                    match event {
                        Event::Disconnected => {
                            counter.fetch_add(1, Ordering::Relaxed);
                            warn!("Bus connection lost");
                        }
                        Event::Connected => info!("Bus connected"),
                        other => warn!("Bus event: {}", other),
                    }
                }
            });

        if let Some(seed_file) = &cfg.seed_file {
            let seed = tokio::fs::read_to_string(seed_file).await?;
            options = options.nkey(seed.trim().to_string());
        }
        for ca in &cfg.root_cas {
            options = options.add_root_certificates(ca.clone());
        }

        let urls = cfg.urls.join(",");
        let client = options
            .connect(urls.as_str())
            .await
            .map_err(|e| Error::Bus(format!("failed to connect to {}: {}", urls, e)))?;
        info!("Connected to {}", urls);

        Ok(Self { client, reconnects })
    }

    fn check_payload(&self, payload: &[u8]) -> Result<()> {
        if payload.len() > self.max_payload() {
            return Err(Error::MaxPayload(payload.len()));
        }
        Ok(())
    }
}

#[async_trait]
impl Bus for NatsBus {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<()> {
        self.check_payload(&payload)?;
        self.client
            .publish(subject.to_string(), payload.into())
            .await
            .map_err(|e| Error::Bus(e.to_string()))
    }

    async fn publish_request(&self, subject: &str, reply: &str, payload: Vec<u8>) -> Result<()> {
        self.check_payload(&payload)?;
        self.client
            .publish_with_reply(subject.to_string(), reply.to_string(), payload.into())
            .await
            .map_err(|e| Error::Bus(e.to_string()))
    }

    async fn request(&self, subject: &str, payload: Vec<u8>, timeout: Duration) -> Result<Message> {
        self.check_payload(&payload)?;
        let request = self.client.request(subject.to_string(), payload.into());
        match tokio::time::timeout(timeout, request).await {
            Ok(Ok(msg)) => Ok(convert(msg)),
            Ok(Err(e)) => match e.kind() {
                RequestErrorKind::NoResponders => Err(Error::NoResponders(subject.to_string())),
                RequestErrorKind::TimedOut => Err(Error::Timeout(format!("request on {}", subject))),
                _ => Err(Error::Bus(e.to_string())),
            },
            Err(_) => Err(Error::Timeout(format!("request on {}", subject))),
        }
    }

    async fn subscribe(&self, subject: &str) -> Result<Subscription> {
        let subscriber = self
            .client
            .subscribe(subject.to_string())
            .await
            .map_err(|e| Error::Bus(e.to_string()))?;
        Ok(Subscription::new(subscriber.map(convert)))
    }

    async fn queue_subscribe(&self, subject: &str, group: &str) -> Result<Subscription> {
        let subscriber = self
            .client
            .queue_subscribe(subject.to_string(), group.to_string())
            .await
            .map_err(|e| Error::Bus(e.to_string()))?;
        Ok(Subscription::new(subscriber.map(convert)))
    }

    fn new_inbox(&self) -> String {
        self.client.new_inbox()
    }

    fn max_payload(&self) -> usize {
        self.client.server_info().max_payload
    }

    fn reconnects(&self) -> u64 {
        self.reconnects.load(Ordering::Relaxed)
    }

    async fn flush(&self) -> Result<()> {
        self.client
            .flush()
            .await
            .map_err(|e| Error::Bus(e.to_string()))
    }
}
