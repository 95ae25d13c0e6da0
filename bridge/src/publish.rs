use std::{collections::HashSet, sync::Arc, time::Duration};

use rumqttc::{AsyncClient, Event, EventLoop, Incoming, LastWill, MqttOptions, Outgoing, QoS};
use tokio::{sync::watch, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use aiseg_common::{
    bridge_status_topic, entities_for, sensor_availability_topic, sensor_state_topic, MqttConfig,
    SensorKind, Snapshot, PAYLOAD_OFFLINE, PAYLOAD_ONLINE,
};

pub struct Publisher {
    mqtt: AsyncClient,
    prefix: String,
    eventloop_task: JoinHandle<()>,
}

impl Publisher {
    pub async fn start(
        config: &MqttConfig,
        host: String,
        updates: watch::Receiver<Arc<Snapshot>>,
        cancel: CancellationToken,
    ) -> anyhow::Result<Self> {
        let prefix = config.topic_prefix.clone();
        let status_topic = bridge_status_topic(&prefix);

        let mut options = MqttOptions::new("aiseg2-bridge", config.host.clone(), config.port);
        options.set_keep_alive(Duration::from_secs(30));
        options.set_last_will(LastWill::new(
            status_topic.clone(),
            PAYLOAD_OFFLINE,
            QoS::AtLeastOnce,
            true,
        ));
        if !config.user.is_empty() {
            options.set_credentials(config.user.clone(), config.pass.clone());
        }

        let (mqtt, eventloop) = AsyncClient::new(options, 64);
        mqtt.try_publish(status_topic, QoS::AtLeastOnce, true, PAYLOAD_ONLINE)?;

        let eventloop_task = spawn_mqtt_loop(eventloop);
        spawn_snapshot_publish_loop(mqtt.clone(), prefix.clone(), host, updates, cancel);

        Ok(Self {
            mqtt,
            prefix,
            eventloop_task,
        })
    }

    // Requests are queued without waiting: with the broker unreachable the
    // request channel stops draining and an awaited publish would never return.
    pub async fn stop(mut self) {
        if let Err(err) = self.mqtt.try_publish(
            bridge_status_topic(&self.prefix),
            QoS::AtLeastOnce,
            true,
            PAYLOAD_OFFLINE,
        ) {
            warn!("bridge offline publish failed: {err}");
        }
        if let Err(err) = self.mqtt.try_disconnect() {
            warn!("mqtt disconnect failed: {err}");
        }
        if tokio::time::timeout(Duration::from_secs(2), &mut self.eventloop_task)
            .await
            .is_err()
        {
            debug!("mqtt event loop did not drain before shutdown");
            self.eventloop_task.abort();
        }
    }
}

fn spawn_mqtt_loop(mut eventloop: EventLoop) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => info!("mqtt connected"),
                Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
                Ok(_) => {}
                Err(err) => {
                    warn!("mqtt poll error: {err}");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    })
}

fn spawn_snapshot_publish_loop(
    mqtt: AsyncClient,
    prefix: String,
    host: String,
    mut updates: watch::Receiver<Arc<Snapshot>>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        let mut known: HashSet<String> = HashSet::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                changed = updates.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }

            let snapshot = updates.borrow_and_update().clone();
            let messages = snapshot_messages(&prefix, &host, &snapshot, &known);
            known = snapshot
                .records()
                .iter()
                .map(|record| record.device_id.clone())
                .collect();

            let mut dropped = 0usize;
            for (topic, payload) in messages {
                if mqtt.try_publish(topic, QoS::AtLeastOnce, true, payload).is_err() {
                    dropped += 1;
                }
            }
            if dropped > 0 {
                warn!(dropped, "mqtt request queue full, sensor states not published");
            }
        }
    });
}

// Devices seen before but missing now are published as offline.
fn snapshot_messages(
    prefix: &str,
    host: &str,
    snapshot: &Snapshot,
    previously_known: &HashSet<String>,
) -> Vec<(String, String)> {
    let mut messages = Vec::new();

    for record in snapshot.records() {
        let availability = if record.is_online() {
            PAYLOAD_ONLINE
        } else {
            PAYLOAD_OFFLINE
        };
        messages.push((
            sensor_availability_topic(prefix, &record.device_id),
            availability.to_string(),
        ));

        for entity in entities_for(record, host) {
            let payload = match entity.kind {
                SensorKind::Temperature => format!("{:.1}", entity.value),
                SensorKind::Humidity => format!("{:.0}", entity.value),
            };
            messages.push((
                sensor_state_topic(prefix, &record.device_id, entity.kind),
                payload,
            ));
        }
    }

    let mut gone: Vec<&String> = previously_known
        .iter()
        .filter(|device_id| snapshot.get(device_id).is_none())
        .collect();
    gone.sort();
    for device_id in gone {
        messages.push((
            sensor_availability_topic(prefix, device_id),
            PAYLOAD_OFFLINE.to_string(),
        ));
    }

    messages
}
