use crate::errors::{Error, Result};
use crate::message::Message;
use chrono::Utc;
use rand::Rng;
use rumqttc::{AsyncClient, Event, MqttOptions, Outgoing, Packet, QoS};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Upper bound for the randomized pause between publishes, in seconds.
const MAX_SLEEP_SECS: u64 = 10;

/// One publisher in the fleet. Owns its broker connection and a fixed device
/// set, and publishes randomized readings until its running flag is cleared.
pub struct Worker {
    client_id: String,
    user_id: String,
    device_ids: Arc<Vec<String>>,
    broker: String,
    port: u16,
    topic: String,
    running: Arc<AtomicBool>,
}

impl Worker {
    pub fn new(
        user_id: &str,
        device_ids: Arc<Vec<String>>,
        slot: usize,
        broker: &str,
        port: u16,
        topic: &str,
        running: Arc<AtomicBool>,
    ) -> Self {
        Self {
            client_id: format!("{}-{}", user_id, slot),
            user_id: user_id.to_string(),
            device_ids,
            broker: broker.to_string(),
            port,
            topic: topic.to_string(),
            running,
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Runs the worker to completion. A connect failure ends the worker for
    /// good; the coordinator never restarts it.
    pub async fn run(self) {
        let client_id = self.client_id.clone();
        match self.run_loop().await {
            Ok(()) => info!("[{}] Disconnected", client_id),
            Err(e) => error!("[{}] Worker failed: {}", client_id, e),
        }
    }

    async fn run_loop(self) -> Result<()> {
        let mut options = MqttOptions::new(&self.client_id, &self.broker, self.port);
        options.set_keep_alive(Duration::from_secs(30));
        options.set_clean_session(true);

        let (client, mut eventloop) = AsyncClient::new(options, 64);

        // The first polls drive the connect handshake; any failure before the
        // CONNACK is fatal for this worker.
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => break,
                Ok(_) => {}
                Err(e) => return Err(Error::Connection(e)),
            }
        }
        info!(
            "[{}] Connected to broker {}:{}",
            self.client_id, self.broker, self.port
        );

        // Keep polling in the background so rumqttc services keep-alives, the
        // QoS 2 handshake and reconnects while the publish loop sleeps.
        let driver_id = self.client_id.clone();
        let mut driver = tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        error!("[{}] Connection error: {}", driver_id, e);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        while self.running.load(Ordering::Acquire) {
            // Random pause staggers traffic so the fleet never publishes in
            // lockstep.
            let delay = rand::thread_rng().gen_range(0..MAX_SLEEP_SECS);
            tokio::time::sleep(Duration::from_secs(delay)).await;

            if let Err(e) = self.publish_one(&client).await {
                warn!("[{}] Publish failed: {}", self.client_id, e);
            }
        }

        if let Err(e) = client.disconnect().await {
            warn!("[{}] Disconnect failed: {}", self.client_id, e);
        }
        // Bounded wait for the event loop to flush the DISCONNECT.
        if tokio::time::timeout(Duration::from_secs(5), &mut driver)
            .await
            .is_err()
        {
            driver.abort();
        }
        Ok(())
    }

    async fn publish_one(&self, client: &AsyncClient) -> Result<()> {
        let message = {
            let mut rng = rand::thread_rng();
            let device_id = self.pick_device(&mut rng);
            Message::generate(&mut rng, &self.user_id, device_id, Utc::now())
        };
        let payload = serde_json::to_string(&message)?;

        client
            .publish(
                &self.topic,
                QoS::ExactlyOnce,
                false,
                payload.clone().into_bytes(),
            )
            .await?;

        info!("[{}] Message published: {}", self.client_id, payload);
        Ok(())
    }

    fn pick_device(&self, rng: &mut impl Rng) -> &str {
        &self.device_ids[rng.gen_range(0..self.device_ids.len())]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn test_worker(device_ids: Vec<String>) -> Worker {
        Worker::new(
            "u-1",
            Arc::new(device_ids),
            0,
            "127.0.0.1",
            1883,
            "telemetry",
            Arc::new(AtomicBool::new(true)),
        )
    }

    #[test]
    fn test_client_id_combines_user_and_slot() {
        let worker = test_worker(vec!["d-1".to_string()]);
        assert_eq!(worker.client_id(), "u-1-0");

        let other = Worker::new(
            "u-2",
            Arc::new(vec!["d-1".to_string()]),
            3,
            "127.0.0.1",
            1883,
            "telemetry",
            Arc::new(AtomicBool::new(true)),
        );
        assert_eq!(other.client_id(), "u-2-3");
    }

    #[test]
    fn test_pick_device_stays_in_assigned_set() {
        let devices = vec!["d-1".to_string(), "d-2".to_string(), "d-3".to_string()];
        let worker = test_worker(devices.clone());
        let mut rng = StdRng::seed_from_u64(11);

        for _ in 0..200 {
            let picked = worker.pick_device(&mut rng).to_string();
            assert!(devices.contains(&picked));
        }
    }

    #[test]
    fn test_failed_connect_ends_worker() {
        tokio_test::block_on(async {
            // Nothing listens on this port: the worker must fail fast instead
            // of retrying.
            let worker = Worker::new(
                "u-1",
                Arc::new(vec!["d-1".to_string()]),
                0,
                "127.0.0.1",
                1,
                "telemetry",
                Arc::new(AtomicBool::new(true)),
            );

            let finished = tokio::time::timeout(Duration::from_secs(30), worker.run()).await;
            assert!(
                finished.is_ok(),
                "worker did not terminate after connect failure"
            );
        });
    }
}
