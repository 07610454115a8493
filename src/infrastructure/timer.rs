//! Procedure timers on the tokio runtime.
//!
//! Every timer is a sleeping task. When it wakes it hands its procedure id
//! to the `expired` channel, whose receiver feeds
//! `RscManager::handle_procedure_timeout`. Stopping a timer aborts the task.

use crate::domain::facades::Timer;
use crate::domain::models::{ProcedureId, TimerId};
use anyhow::{anyhow, bail, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::trace;

type TimerTable = Arc<Mutex<HashMap<TimerId, JoinHandle<()>>>>;

pub struct TokioTimer {
    handle: Handle,
    expired: mpsc::UnboundedSender<ProcedureId>,
    timers: TimerTable,
    next_id: AtomicU64,
}

impl TokioTimer {
    pub fn new(handle: Handle, expired: mpsc::UnboundedSender<ProcedureId>) -> Self {
        Self {
            handle,
            expired,
            timers: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(0),
        }
    }

    /// Number of timers that have neither fired nor been stopped
    pub fn pending(&self) -> usize {
        self.timers.lock().map(|t| t.len()).unwrap_or(0)
    }
}

impl Timer for TokioTimer {
    fn start(&self, timeout: Duration, procedure_id: ProcedureId) -> Result<TimerId> {
        if self.expired.is_closed() {
            bail!("Timer expiry channel closed");
        }

        let timer_id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let timers = self.timers.clone();
        let expired = self.expired.clone();

        // Held across the spawn so the task cannot remove itself before it
        // is inserted.
        let mut table = self
            .timers
            .lock()
            .map_err(|_| anyhow!("Timer table poisoned"))?;
        let task = self.handle.spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Ok(mut table) = timers.lock() {
                table.remove(&timer_id);
            }
            trace!("Timer {} expired for procedure {}", timer_id, procedure_id);
            let _ = expired.send(procedure_id);
        });
        table.insert(timer_id, task);

        Ok(timer_id)
    }

    fn stop(&self, timer_id: TimerId) {
        let task = match self.timers.lock() {
            Ok(mut table) => table.remove(&timer_id),
            Err(_) => None,
        };
        if let Some(task) = task {
            task.abort();
            trace!("Timer {} stopped", timer_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_timer_fires_once() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let timer = TokioTimer::new(Handle::current(), tx);

        timer.start(Duration::from_millis(10), 42).unwrap();
        let fired = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap();
        assert_eq!(fired, Some(42));

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(timer.pending(), 0);
    }

    #[tokio::test]
    async fn test_stopped_timer_is_silent() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let timer = TokioTimer::new(Handle::current(), tx);

        let id = timer.start(Duration::from_millis(30), 7).unwrap();
        assert_eq!(timer.pending(), 1);
        timer.stop(id);
        assert_eq!(timer.pending(), 0);

        let fired = tokio::time::timeout(Duration::from_millis(120), rx.recv()).await;
        assert!(fired.is_err());
    }

    #[tokio::test]
    async fn test_closed_channel_rejects_start() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let timer = TokioTimer::new(Handle::current(), tx);
        assert!(timer.start(Duration::from_millis(10), 1).is_err());
    }
}
