use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::{MultiplexedConnection, PubSubSink, PubSubStream};
use redis::{AsyncCommands, Client};
use tracing::info;

use crate::messaging::transport::{Frame, Transport, TransportSink, TransportStream};
use crate::shared::config::RedisSettings;
use crate::shared::error::Result;

/// Redis pub/sub transport.
///
/// Each connection is a pair: a multiplexed connection for PUBLISH and PING,
/// and a dedicated pub/sub connection (Redis demands one) split into its
/// sink and stream halves.
pub struct RedisTransport {
    settings: RedisSettings,
}

impl RedisTransport {
    pub fn new(settings: RedisSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl Transport for RedisTransport {
    async fn connect(&self) -> Result<(Box<dyn TransportSink>, Box<dyn TransportStream>)> {
        let client = Client::open(self.settings.url())?;
        let publish_conn = client.get_multiplexed_async_connection().await?;
        let pubsub = client.get_async_pubsub().await?;
        let (pubsub_sink, pubsub_stream) = pubsub.split();

        info!(
            "Connected to Redis at {}:{}",
            self.settings.host, self.settings.port
        );

        Ok((
            Box::new(RedisSink {
                publish_conn,
                pubsub_sink,
            }),
            Box::new(RedisStream {
                stream: pubsub_stream,
            }),
        ))
    }
}

struct RedisSink {
    publish_conn: MultiplexedConnection,
    pubsub_sink: PubSubSink,
}

#[async_trait]
impl TransportSink for RedisSink {
    async fn publish(&mut self, channel: &str, payload: &[u8]) -> Result<()> {
        let _: () = self.publish_conn.publish(channel, payload).await?;
        Ok(())
    }

    async fn subscribe(&mut self, channel: &str) -> Result<()> {
        self.pubsub_sink.subscribe(channel).await?;
        Ok(())
    }

    async fn unsubscribe(&mut self, channel: &str) -> Result<()> {
        self.pubsub_sink.unsubscribe(channel).await?;
        Ok(())
    }

    async fn ping(&mut self) -> Result<()> {
        let _: String = redis::cmd("PING")
            .query_async(&mut self.publish_conn)
            .await?;
        Ok(())
    }
}

struct RedisStream {
    stream: PubSubStream,
}

#[async_trait]
impl TransportStream for RedisStream {
    async fn next_frame(&mut self) -> Option<Frame> {
        self.stream.next().await.map(|msg| Frame {
            channel: msg.get_channel_name().to_string(),
            payload: msg.get_payload_bytes().to_vec(),
        })
    }
}
