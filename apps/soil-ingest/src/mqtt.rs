use crate::config::Config;
use crate::ingest::{subscription_filter, IngestOutcome, Ingestor};
use anyhow::Result;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, Outgoing, QoS};
use tokio::time::{sleep, timeout, Duration};
use tokio_util::sync::CancellationToken;

const RECONNECT_DELAY: Duration = Duration::from_secs(2);
const DISCONNECT_GRACE: Duration = Duration::from_secs(1);

/// Subscribes to the device data feed and hands every publish to `ingestor`,
/// reconnecting until `cancel` fires.
pub async fn run_listener(
    config: Config,
    ingestor: Ingestor,
    cancel: CancellationToken,
) -> Result<()> {
    let data_filter = subscription_filter(&config.topic_namespace);
    let stats = ingestor.stats();

    while !cancel.is_cancelled() {
        let mut mqttoptions = MqttOptions::new(
            config.mqtt_client_id.clone(),
            config.mqtt_host.clone(),
            config.mqtt_port,
        );
        mqttoptions.set_keep_alive(config.mqtt_keepalive());
        if let Some(username) = &config.mqtt_username {
            mqttoptions.set_credentials(
                username.clone(),
                config.mqtt_password.clone().unwrap_or_default(),
            );
        }

        let (client, mut eventloop) = AsyncClient::new(mqttoptions, 32);

        if let Err(err) = client.subscribe(data_filter.clone(), QoS::AtLeastOnce).await {
            tracing::warn!(error=%err, "failed to queue MQTT subscription; retrying");
            pause(&cancel, RECONNECT_DELAY).await;
            continue;
        }

        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => {
                    disconnect(&client, &mut eventloop).await;
                    stats.set_mqtt_connected(false);
                    return Ok(());
                }
                event = eventloop.poll() => event,
            };

            match event {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    stats.set_mqtt_connected(true);
                    tracing::info!(
                        host = %config.mqtt_host,
                        port = config.mqtt_port,
                        topic = %data_filter,
                        "connected to MQTT broker"
                    );
                }
                Ok(Event::Incoming(Incoming::Publish(publish))) => {
                    tracing::debug!(
                        topic = %publish.topic,
                        bytes = publish.payload.len(),
                        "message received"
                    );
                    let mut payload = publish.payload.to_vec();
                    if let IngestOutcome::Persisted { readings, .. } =
                        ingestor.handle_message(&publish.topic, &mut payload).await
                    {
                        tracing::debug!(topic = %publish.topic, readings, "message ingested");
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    stats.set_mqtt_connected(false);
                    stats.record_error(format!("mqtt: {err}"));
                    tracing::warn!(error=%err, "MQTT connection dropped; reconnecting");
                    break;
                }
            }
        }

        pause(&cancel, RECONNECT_DELAY).await;
    }

    stats.set_mqtt_connected(false);
    Ok(())
}

async fn disconnect(client: &AsyncClient, eventloop: &mut rumqttc::EventLoop) {
    if let Err(err) = client.disconnect().await {
        tracing::debug!(error=%err, "MQTT disconnect request failed");
        return;
    }
    let drained = timeout(DISCONNECT_GRACE, async {
        loop {
            match eventloop.poll().await {
                Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    })
    .await;
    if drained.is_err() {
        tracing::debug!("MQTT disconnect did not flush before timeout");
    }
    tracing::info!("disconnected from MQTT broker");
}

/// Sleeps for `delay` unless `cancel` fires first.
async fn pause(cancel: &CancellationToken, delay: Duration) {
    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = sleep(delay) => {}
    }
}
