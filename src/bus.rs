//! Relays `pub`/`sub`/`unsub` frames between the device and an external
//! MQTT broker, and forwards broker messages back to the device as `msg`
//! frames. Owns the Subscription set so it survives broker reconnects.
//!
//! The network client is reached only through the [`MqttSink`] trait, so
//! the pub/sub/unsub bookkeeping can be exercised against a recording
//! mock without a live broker.

use std::time::Duration;

use bytes::Bytes;
use indexmap::IndexSet;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::frame::Frame;
use crate::issuer;
use crate::router::Router;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("mqtt client error: {0}")]
    Client(#[from] rumqttc::ClientError),
}

/// Anything that can perform the three broker operations the device
/// protocol needs. Implemented for `rumqttc::AsyncClient`; test code
/// implements it for a recording mock.
pub trait MqttSink {
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), BusError>;
    async fn subscribe(&self, topic: &str) -> Result<(), BusError>;
    async fn unsubscribe(&self, topic: &str) -> Result<(), BusError>;
}

impl MqttSink for AsyncClient {
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), BusError> {
        AsyncClient::publish(self, topic, QoS::AtLeastOnce, false, payload.to_vec())
            .await
            .map_err(BusError::from)
    }

    async fn subscribe(&self, topic: &str) -> Result<(), BusError> {
        AsyncClient::subscribe(self, topic, QoS::AtLeastOnce)
            .await
            .map_err(BusError::from)
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), BusError> {
        AsyncClient::unsubscribe(self, topic)
            .await
            .map_err(BusError::from)
    }
}

/// Spawn the bus bridge: connects to `host:port`, registers itself as the
/// router's bus sink, and returns once the background task is running.
/// The returned channel is the same one installed on the router — callers
/// never need it directly, but tests use it to inject frames without a
/// router in the loop.
pub async fn spawn(
    router: Router,
    host: &str,
    port: u16,
    cancel: CancellationToken,
) -> mpsc::UnboundedSender<Frame> {
    let mut opts = MqttOptions::new(format!("luatt-{}", std::process::id()), host, port);
    opts.set_keep_alive(Duration::from_secs(30));
    let (client, eventloop) = AsyncClient::new(opts, 64);

    let (tx, rx) = mpsc::unbounded_channel();
    router.attach_bus(tx.clone()).await;

    tokio::spawn(run(router, client, eventloop, rx, cancel));

    tx
}

async fn run(
    router: Router,
    client: AsyncClient,
    mut eventloop: EventLoop,
    mut rx: mpsc::UnboundedReceiver<Frame>,
    cancel: CancellationToken,
) {
    let mut subscriptions: IndexSet<String> = IndexSet::new();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            frame = rx.recv() => {
                match frame {
                    Some(f) => handle_device_frame(&client, &mut subscriptions, &f).await,
                    None => break,
                }
            }
            event = eventloop.poll() => {
                match event {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        resubscribe(&client, &subscriptions).await;
                    }
                    Ok(Event::Incoming(Packet::Publish(p))) => {
                        let args = [Bytes::from(p.topic.into_bytes()), p.payload];
                        if let Err(e) = issuer::fire_and_forget(&router, "msg", &args).await {
                            warn!("forwarding mqtt message to device failed: {e}");
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("mqtt eventloop error: {e}");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }
    }
}

async fn resubscribe(client: &impl MqttSink, subscriptions: &IndexSet<String>) {
    for topic in subscriptions {
        info!("mqtt resubscribe: {topic}");
        if let Err(e) = client.subscribe(topic).await {
            warn!("mqtt resubscribe {topic} failed: {e}");
        }
    }
}

/// Apply one inbound device frame (`pub`/`sub`/`unsub`) to the broker
/// client and the owned subscription set. Any other verb is ignored —
/// the router only ever routes these three verbs here.
async fn handle_device_frame(client: &impl MqttSink, subscriptions: &mut IndexSet<String>, frame: &Frame) {
    match frame.verb() {
        Some(b"pub") => {
            if frame.fields.len() != 4 {
                warn!("mqtt pub: 4 args required, {} given", frame.fields.len());
                return;
            }
            let topic = String::from_utf8_lossy(&frame.fields[2]).into_owned();
            let payload = &frame.fields[3];
            info!("mqtt pub: {topic}");
            if let Err(e) = client.publish(&topic, payload).await {
                warn!("mqtt publish {topic} failed: {e}");
            }
        }
        Some(b"sub") => {
            if frame.fields.len() != 3 {
                warn!("mqtt sub: 3 args required, {} given", frame.fields.len());
                return;
            }
            let topic = String::from_utf8_lossy(&frame.fields[2]).into_owned();
            info!("mqtt sub: {topic}");
            subscriptions.insert(topic.clone());
            if let Err(e) = client.subscribe(&topic).await {
                warn!("mqtt subscribe {topic} failed: {e}");
            }
        }
        Some(b"unsub") => {
            if frame.fields.len() != 3 {
                warn!("mqtt unsub: 3 args required, {} given", frame.fields.len());
                return;
            }
            let topic = String::from_utf8_lossy(&frame.fields[2]).into_owned();
            info!("mqtt unsub: {topic}");
            if topic == "*" {
                let topics: Vec<String> = subscriptions.drain(..).collect();
                for t in topics {
                    if let Err(e) = client.unsubscribe(&t).await {
                        warn!("mqtt unsubscribe {t} failed: {e}");
                    }
                }
            } else {
                subscriptions.shift_remove(&topic);
                if let Err(e) = client.unsubscribe(&topic).await {
                    warn!("mqtt unsubscribe {topic} failed: {e}");
                }
            }
        }
        _ => {}
    }
}
