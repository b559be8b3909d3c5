use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, info};
use url::Url;

use crate::net::{Method, Request, Transport};

const MIN_INTERVAL: Duration = Duration::from_secs(1);

/// Events the host delivers to the background agent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostEvent {
  /// The network became reachable after being unreachable
  ConnectivityRestored,
  ConnectivityLost,
  /// A probe reached the host and nothing changed
  Reachable,
  /// Periodic sync opportunity
  PeriodicTick,
}

/// Produces host events by probing a health endpoint and running a periodic timer
pub struct ConnectivityMonitor {
  rx: mpsc::UnboundedReceiver<HostEvent>,
  task: JoinHandle<()>,
}

impl ConnectivityMonitor {
  /// Start probing `health_url` every `probe_interval`. `periodic` enables
  /// periodic ticks at that interval. Zero intervals are raised to one second.
  pub fn spawn(
    transport: Arc<dyn Transport>,
    health_url: Url,
    probe_interval: Duration,
    periodic: Option<Duration>,
  ) -> Self {
    let (tx, rx) = mpsc::unbounded_channel();
    let probe_interval = probe_interval.max(MIN_INTERVAL);
    let periodic = periodic.map(|period| period.max(MIN_INTERVAL));

    let task = tokio::spawn(async move {
      let mut probe = tokio::time::interval(probe_interval);
      probe.set_missed_tick_behavior(MissedTickBehavior::Delay);
      let mut periodic = periodic.map(|period| {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker
      });
      let mut online: Option<bool> = None;

      loop {
        let event = tokio::select! {
          _ = probe.tick() => {
            let reachable = is_reachable(transport.as_ref(), &health_url).await;
            let event = match (online, reachable) {
              (Some(false), true) => Some(HostEvent::ConnectivityRestored),
              (Some(true), false) | (None, false) => Some(HostEvent::ConnectivityLost),
              (_, true) => Some(HostEvent::Reachable),
              (Some(false), false) => None,
            };
            online = Some(reachable);
            event
          }
          _ = next_tick(&mut periodic) => Some(HostEvent::PeriodicTick),
        };

        if let Some(event) = event {
          if event == HostEvent::Reachable {
            debug!("Host reachable");
          } else {
            info!(?event, "Host event");
          }
          if tx.send(event).is_err() {
            break;
          }
        }
      }
    });

    Self { rx, task }
  }

  /// Receive the next event
  pub async fn next(&mut self) -> Option<HostEvent> {
    self.rx.recv().await
  }
}

impl Drop for ConnectivityMonitor {
  fn drop(&mut self) {
    self.task.abort();
  }
}

async fn next_tick(ticker: &mut Option<Interval>) {
  match ticker {
    Some(ticker) => {
      ticker.tick().await;
    }
    None => std::future::pending().await,
  }
}

/// Any answer from the server counts as reachable.
async fn is_reachable(transport: &dyn Transport, health_url: &Url) -> bool {
  match transport
    .send(Request::new(Method::Head, health_url.clone()))
    .await
  {
    Ok(_) => true,
    Err(e) => {
      debug!("Health probe failed: {}", e);
      false
    }
  }
}
