//! Redis pub/sub bus for multi-process deployments.
//!
//! Publishes go over one shared multiplexed connection. Each subscription
//! holds its own pub/sub connection, since a subscribed Redis connection
//! cannot issue ordinary commands. Channel names are `{prefix}:{topic}`.

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::MultiplexedConnection;
use std::sync::Arc;

use super::{dispatch, BusHandler, FanoutBus, Subscription, Topic};
use crate::error::BusError;
use crate::protocol::BusEnvelope;

fn backend(e: redis::RedisError) -> BusError {
    BusError::Backend(e.to_string())
}

pub struct RedisBus {
    client: redis::Client,
    conn: MultiplexedConnection,
    prefix: String,
}

impl RedisBus {
    pub async fn connect(url: &str, prefix: impl Into<String>) -> Result<Self, BusError> {
        let client = redis::Client::open(url).map_err(backend)?;
        let conn = client.get_multiplexed_async_connection().await.map_err(backend)?;
        Ok(Self {
            client,
            conn,
            prefix: prefix.into(),
        })
    }

    fn channel(&self, topic: &Topic) -> String {
        format!("{}:{}", self.prefix, topic.channel_name())
    }
}

#[async_trait]
impl FanoutBus for RedisBus {
    async fn publish(&self, topic: &Topic, envelope: &BusEnvelope) -> Result<usize, BusError> {
        let bytes = envelope
            .encode()
            .map_err(|e| BusError::Serialization(e.to_string()))?;
        let mut conn = self.conn.clone();
        let receivers: i64 = redis::cmd("PUBLISH")
            .arg(self.channel(topic))
            .arg(bytes)
            .query_async(&mut conn)
            .await
            .map_err(backend)?;
        Ok(receivers.max(0) as usize)
    }

    async fn subscribe(&self, topic: &Topic, handler: Arc<dyn BusHandler>) -> Result<Subscription, BusError> {
        let channel = self.channel(topic);
        let mut pubsub = self.client.get_async_pubsub().await.map_err(backend)?;
        pubsub.subscribe(&channel).await.map_err(backend)?;

        let task_topic = topic.clone();
        let task = tokio::spawn(async move {
            let stream = pubsub.on_message();
            futures_util::pin_mut!(stream);
            while let Some(msg) = stream.next().await {
                match msg.get_payload::<Vec<u8>>() {
                    Ok(bytes) => dispatch(&task_topic, &bytes, handler.as_ref()).await,
                    Err(e) => log::warn!("Bus: unreadable payload on {channel}: {e}"),
                }
            }
            log::warn!("Bus: pub/sub stream for {channel} ended, awaiting resubscribe");
        });
        Ok(Subscription::new(topic.clone(), task))
    }
}
