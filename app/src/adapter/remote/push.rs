use infrastructure::{MqttClient, MqttInMessage, MqttSubscription};
use tokio::sync::mpsc;

use crate::command::CommandBatch;
use crate::port::{DeviceId, ServerEvent};

pub async fn subscribe(
    mqtt: &MqttClient,
    topic_prefix: &str,
    device: &DeviceId,
) -> anyhow::Result<mpsc::Receiver<ServerEvent>> {
    let commands = mqtt.subscribe(format!("{}/{}/commands", topic_prefix, device)).await?;
    let status = mqtt.subscribe(format!("{}/{}/status", topic_prefix, device)).await?;

    let (tx, rx) = mpsc::channel(16);
    tokio::spawn(forward(commands, status, tx));

    Ok(rx)
}

async fn forward(mut commands: MqttSubscription, mut status: MqttSubscription, tx: mpsc::Sender<ServerEvent>) {
    loop {
        let event = tokio::select! {
            _ = tx.closed() => break,
            Some(msg) = commands.recv() => match parse_commands(&msg) {
                Ok(batch) => ServerEvent::NewCommands(batch),
                Err(e) => {
                    tracing::error!("Error parsing pushed commands on {}: {:?}", msg.topic, e);
                    continue;
                }
            },
            Some(_) = status.recv() => ServerEvent::StatusRequested,
            else => break,
        };

        if tx.send(event).await.is_err() {
            break;
        }
    }

    tracing::debug!("Stopped forwarding events of {} and {}", commands.topic(), status.topic());
}

fn parse_commands(msg: &MqttInMessage) -> anyhow::Result<CommandBatch> {
    Ok(serde_json::from_str(&msg.payload)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CommandedState, OutletCommand};
    use crate::core::time::DateTime;
    use crate::outlet::{ChannelId, OutletState};

    fn message(payload: &str) -> MqttInMessage {
        MqttInMessage {
            topic: "controllers/dev-1/commands".to_string(),
            payload: payload.to_string(),
        }
    }

    #[test]
    fn parses_pushed_commands() {
        let batch = parse_commands(&message(
            r#"{"4": [{"time": "2023-11-14T22:13:20Z", "state": 1}, {"time": "2023-11-14T22:23:20Z", "state": 0, "isLast": true}]}"#,
        ))
        .unwrap();

        let commands = &batch[&ChannelId::new(4)];
        assert_eq!(commands.len(), 2);
        assert_eq!(commands[0].time, DateTime::from_millis(1_700_000_000_000));
        assert_eq!(commands[0].state, CommandedState::On);
        assert_eq!(
            commands[1],
            OutletCommand::new(DateTime::from_millis(1_700_000_600_000), OutletState::Off).last()
        );
    }

    #[test]
    fn rejects_malformed_payload() {
        assert!(parse_commands(&message("not json")).is_err());
    }
}
