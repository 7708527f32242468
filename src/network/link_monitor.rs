use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::LinkEvent;
use crate::config::NetworkConfig;
use crate::runtime::ServiceEvent;

const SYSFS_NET: &str = "/sys/class/net";

/// Polls `operstate` of a network interface and reports transitions.
///
/// Without an interface the link is reported up once and the task ends.
pub struct LinkMonitor {
    interface: Option<String>,
    sysfs_root: PathBuf,
    poll_interval: Duration,
    last: Option<LinkEvent>,
}

impl LinkMonitor {
    pub fn new(config: &NetworkConfig) -> Self {
        Self {
            interface: config.interface.clone(),
            sysfs_root: PathBuf::from(SYSFS_NET),
            poll_interval: config.poll_interval(),
            last: None,
        }
    }

    pub fn with_sysfs_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.sysfs_root = root.into();
        self
    }

    /// Reads the interface state once.
    ///
    /// A missing interface counts as down. "unknown" counts as up because
    /// several drivers (tun, some USB adapters) never report anything else.
    pub async fn read_link(&self) -> LinkEvent {
        let Some(interface) = &self.interface else {
            return LinkEvent::LinkUp;
        };

        let path = self.sysfs_root.join(interface).join("operstate");
        match tokio::fs::read_to_string(&path).await {
            Ok(state) => match state.trim() {
                "up" | "unknown" => LinkEvent::LinkUp,
                other => {
                    debug!("Interface {} reports operstate '{}'", interface, other);
                    LinkEvent::LinkDown
                }
            },
            Err(e) => {
                debug!("Could not read {}: {}", path.display(), e);
                LinkEvent::LinkDown
            }
        }
    }

    /// Returns the new state if it differs from the last reported one
    pub async fn poll_transition(&mut self) -> Option<LinkEvent> {
        let current = self.read_link().await;
        if self.last == Some(current) {
            return None;
        }
        self.last = Some(current);
        Some(current)
    }

    pub fn spawn(
        mut self,
        events: mpsc::Sender<ServiceEvent>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            match &self.interface {
                Some(interface) => info!(
                    "Watching interface {} every {:?}",
                    interface, self.poll_interval
                ),
                None => info!("No network interface configured, assuming link is up"),
            }

            let mut interval = tokio::time::interval(self.poll_interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {}
                }

                if let Some(event) = self.poll_transition().await {
                    match event {
                        LinkEvent::LinkUp => info!("Network link up"),
                        LinkEvent::LinkDown => warn!("Network link down"),
                    }
                    if events.send(ServiceEvent::Link(event)).await.is_err() {
                        break;
                    }
                }

                if self.interface.is_none() {
                    break;
                }
            }
            debug!("Link monitor stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor_for(root: &std::path::Path, interface: &str) -> LinkMonitor {
        LinkMonitor::new(&NetworkConfig {
            interface: Some(interface.to_string()),
            poll_interval_ms: 10,
        })
        .with_sysfs_root(root)
    }

    fn write_operstate(root: &std::path::Path, interface: &str, state: &str) {
        let dir = root.join(interface);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("operstate"), format!("{}\n", state)).unwrap();
    }

    #[tokio::test]
    async fn without_interface_link_is_up() {
        let mut monitor = LinkMonitor::new(&NetworkConfig::default());
        assert_eq!(monitor.poll_transition().await, Some(LinkEvent::LinkUp));
        assert_eq!(monitor.poll_transition().await, None);
    }

    #[tokio::test]
    async fn reports_only_transitions() {
        let root = tempfile::tempdir().unwrap();
        write_operstate(root.path(), "wlan0", "up");
        let mut monitor = monitor_for(root.path(), "wlan0");

        assert_eq!(monitor.poll_transition().await, Some(LinkEvent::LinkUp));
        assert_eq!(monitor.poll_transition().await, None);

        write_operstate(root.path(), "wlan0", "down");
        assert_eq!(monitor.poll_transition().await, Some(LinkEvent::LinkDown));
        assert_eq!(monitor.poll_transition().await, None);

        write_operstate(root.path(), "wlan0", "unknown");
        assert_eq!(monitor.poll_transition().await, Some(LinkEvent::LinkUp));
    }

    #[tokio::test]
    async fn missing_interface_is_down() {
        let root = tempfile::tempdir().unwrap();
        let monitor = monitor_for(root.path(), "eth7");
        assert_eq!(monitor.read_link().await, LinkEvent::LinkDown);
    }

    #[tokio::test]
    async fn spawned_monitor_forwards_events() {
        let root = tempfile::tempdir().unwrap();
        write_operstate(root.path(), "eth0", "up");
        let (tx, mut rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();

        let handle = monitor_for(root.path(), "eth0").spawn(tx, cancel.clone());
        assert_eq!(rx.recv().await, Some(ServiceEvent::Link(LinkEvent::LinkUp)));

        write_operstate(root.path(), "eth0", "down");
        assert_eq!(rx.recv().await, Some(ServiceEvent::Link(LinkEvent::LinkDown)));

        cancel.cancel();
        handle.await.unwrap();
    }
}
