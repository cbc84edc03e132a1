use std::str::Utf8Error;
use std::sync::{Arc, Mutex, PoisonError};

use rumqttc::v5::Event::Incoming;
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::mqttbytes::v5::{Packet, Publish};
use rumqttc::v5::{AsyncClient, EventLoop, MqttOptions};
use tokio::sync::{mpsc, watch};

pub struct Mqtt {
    client: MqttClient,
    event_loop: EventLoop,
    connected_tx: watch::Sender<bool>,
}

#[derive(Clone)]
pub struct MqttClient {
    client: Arc<AsyncClient>,
    routes: Arc<Mutex<Vec<Route>>>,
    connected_rx: watch::Receiver<bool>,
}

struct Route {
    topic: String,
    tx: mpsc::Sender<MqttInMessage>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttInMessage {
    pub topic: String,
    pub payload: String,
}

pub struct MqttSubscription {
    topic: String,
    rx: mpsc::Receiver<MqttInMessage>,
}

impl Mqtt {
    pub fn connect(host: &str, port: u16, client_id: &str) -> Self {
        let mut mqttoptions = MqttOptions::new(client_id, host, port);
        mqttoptions.set_keep_alive(std::time::Duration::from_secs(5));
        //subscriptions are restored by us after every ConnAck
        mqttoptions.set_clean_start(true);

        let (client, event_loop) = AsyncClient::new(mqttoptions, 10);
        let (connected_tx, connected_rx) = watch::channel(false);

        Mqtt {
            client: MqttClient {
                client: Arc::new(client),
                routes: Arc::new(Mutex::new(vec![])),
                connected_rx,
            },
            event_loop,
            connected_tx,
        }
    }

    pub fn client(&self) -> MqttClient {
        self.client.clone()
    }

    pub async fn run(mut self) {
        loop {
            match self.event_loop.poll().await {
                Ok(Incoming(Packet::ConnAck(_))) => {
                    tracing::info!("MQTT connected");
                    self.connected_tx.send_replace(true);
                    self.client.restore_subscriptions();
                }
                Ok(Incoming(Packet::Publish(publish))) => {
                    self.client.dispatch(&publish).await;
                }
                Ok(Incoming(Packet::Disconnect(_))) => {
                    tracing::warn!("MQTT broker closed the connection");
                    self.connected_tx.send_replace(false);
                }
                Ok(_) => {}
                Err(e) => {
                    if self.connected_tx.send_replace(false) {
                        tracing::error!("MQTT connection lost: {}", e);
                    } else {
                        tracing::debug!("MQTT still not connected: {}", e);
                    }
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                }
            }
        }
    }
}

impl MqttClient {
    pub fn is_connected(&self) -> bool {
        *self.connected_rx.borrow()
    }

    pub async fn subscribe(&self, topic: impl Into<String>) -> anyhow::Result<MqttSubscription> {
        let topic = topic.into();
        let (tx, rx) = mpsc::channel::<MqttInMessage>(32);

        let already_subscribed = {
            let mut routes = self.routes.lock().unwrap_or_else(PoisonError::into_inner);
            routes.retain(|r| !r.tx.is_closed());
            let exists = routes.iter().any(|r| r.topic == topic);
            routes.push(Route {
                topic: topic.clone(),
                tx,
            });
            exists
        };

        if already_subscribed {
            tracing::info!("Adding listener to existing MQTT subscription {}", topic);
        } else {
            tracing::info!("Subscribing to MQTT topic {}", topic);
            self.client.subscribe(topic.clone(), QoS::AtLeastOnce).await?;
        }

        Ok(MqttSubscription { topic, rx })
    }

    fn restore_subscriptions(&self) {
        let mut topics: Vec<String> = {
            let routes = self.routes.lock().unwrap_or_else(PoisonError::into_inner);
            routes.iter().filter(|r| !r.tx.is_closed()).map(|r| r.topic.clone()).collect()
        };
        topics.sort();
        topics.dedup();

        for topic in topics {
            if let Err(e) = self.client.try_subscribe(topic.clone(), QoS::AtLeastOnce) {
                tracing::error!("Error restoring MQTT subscription {}: {}", topic, e);
            }
        }
    }

    async fn dispatch(&self, publish: &Publish) {
        let message = match MqttInMessage::try_from(publish) {
            Ok(m) => m,
            Err(e) => {
                tracing::error!("Error parsing MQTT message: {}", e);
                return;
            }
        };

        let receivers: Vec<mpsc::Sender<MqttInMessage>> = {
            let routes = self.routes.lock().unwrap_or_else(PoisonError::into_inner);
            routes
                .iter()
                .filter(|r| r.topic == message.topic)
                .map(|r| r.tx.clone())
                .collect()
        };

        if receivers.is_empty() {
            tracing::debug!("No listener for MQTT topic {}", message.topic);
        }

        for tx in receivers {
            if let Err(e) = tx
                .send_timeout(message.clone(), tokio::time::Duration::from_secs(5))
                .await
            {
                tracing::error!("Failed to forward MQTT message on {}: {}", message.topic, e);
            }
        }
    }
}

impl MqttSubscription {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub async fn recv(&mut self) -> Option<MqttInMessage> {
        self.rx.recv().await
    }
}

impl TryFrom<&Publish> for MqttInMessage {
    type Error = Utf8Error;

    fn try_from(publish: &Publish) -> Result<Self, Self::Error> {
        Ok(MqttInMessage {
            topic: std::str::from_utf8(&publish.topic)?.to_string(),
            payload: std::str::from_utf8(&publish.payload)?.to_string(),
        })
    }
}
