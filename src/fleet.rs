use crate::registry::UserDevices;
use crate::worker::Worker;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

struct FleetWorker {
    client_id: String,
    running: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

/// All workers spawned for one run. Append-only while the fleet starts up;
/// only signalled and joined afterwards.
#[derive(Default)]
pub struct Fleet {
    workers: Vec<FleetWorker>,
}

impl Fleet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Spawns `workers_per_user` publishers for every user that owns at
    /// least one device.
    pub fn spawn_fleet(
        &mut self,
        users: Vec<UserDevices>,
        workers_per_user: usize,
        broker: &str,
        port: u16,
        topic: &str,
    ) {
        for user in users {
            if user.device_ids.is_empty() {
                warn!("User {} has no device", user.user_id);
                continue;
            }
            let device_ids = Arc::new(user.device_ids);
            for slot in 0..workers_per_user {
                self.spawn(&user.user_id, Arc::clone(&device_ids), slot, broker, port, topic);
            }
        }
    }

    fn spawn(
        &mut self,
        user_id: &str,
        device_ids: Arc<Vec<String>>,
        slot: usize,
        broker: &str,
        port: u16,
        topic: &str,
    ) {
        let running = Arc::new(AtomicBool::new(true));
        let worker = Worker::new(
            user_id,
            device_ids,
            slot,
            broker,
            port,
            topic,
            Arc::clone(&running),
        );
        let client_id = worker.client_id().to_string();
        debug!("[{}] Spawning worker", client_id);

        let task = tokio::spawn(worker.run());
        self.workers.push(FleetWorker {
            client_id,
            running,
            task,
        });
    }

    /// Detached view of the running flags, for the shutdown signal task.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            flags: self
                .workers
                .iter()
                .map(|w| Arc::clone(&w.running))
                .collect(),
        }
    }

    /// Blocks until every worker has terminated, cleanly or not.
    pub async fn await_all(self) {
        for worker in self.workers {
            if let Err(e) = worker.task.await {
                error!("[{}] Worker task panicked: {}", worker.client_id, e);
            }
        }
    }
}

/// Clonable handle that stops every worker in the fleet. Flipping the flags
/// never blocks; workers drain on their own schedule.
#[derive(Clone)]
pub struct ShutdownHandle {
    flags: Vec<Arc<AtomicBool>>,
}

impl ShutdownHandle {
    pub fn shutdown_all(&self) {
        info!("Stopping {} workers", self.flags.len());
        for flag in &self.flags {
            flag.store(false, Ordering::Release);
        }
    }
}
