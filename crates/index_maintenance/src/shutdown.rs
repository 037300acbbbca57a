use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

/// Used by the maintenance scheduler to signal it has hit a fault it cannot
/// recover from. The owning process is expected to restart the node.
#[derive(Clone)]
pub struct ShutdownSignal {
    shutdown_tx: Option<Arc<Mutex<Option<mpsc::UnboundedSender<ShutdownMessage>>>>>,
    node_name: String,
}

#[derive(Debug)]
pub struct ShutdownMessage {
    pub error: anyhow::Error,
    pub node_name: String,
}

impl ShutdownSignal {
    pub fn new(shutdown_tx: mpsc::UnboundedSender<ShutdownMessage>, node_name: String) -> Self {
        Self {
            shutdown_tx: Some(Arc::new(Mutex::new(Some(shutdown_tx)))),
            node_name,
        }
    }

    pub fn signal(&self, fatal_error: anyhow::Error) {
        tracing::error!("Fatal maintenance error on {}: {fatal_error:?}", self.node_name);
        if let Some(ref shutdown_tx_mutex) = self.shutdown_tx {
            let Some(shutdown_tx) = shutdown_tx_mutex.lock().take() else {
                // A shutdown message has already been sent for this node.
                return;
            };
            _ = shutdown_tx.send(ShutdownMessage {
                error: fatal_error,
                node_name: self.node_name.clone(),
            });
        } else {
            panic!("Shutting down due to fatal error: {fatal_error}");
        }
    }

    /// Creates a new ShutdownSignal that panics when signaled.
    pub fn panic() -> Self {
        Self {
            shutdown_tx: None,
            node_name: "".to_owned(),
        }
    }

    #[cfg(any(test, feature = "testing"))]
    pub fn no_op() -> Self {
        Self {
            shutdown_tx: Some(Arc::new(Mutex::new(None))),
            node_name: "".to_owned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::ShutdownSignal;

    #[test]
    fn test_only_first_fatal_error_is_delivered() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let signal = ShutdownSignal::new(tx, "node-1".to_owned());
        signal.signal(anyhow::anyhow!("first"));
        signal.clone().signal(anyhow::anyhow!("second"));
        let msg = rx.try_recv().expect("first message");
        assert_eq!(msg.node_name, "node-1");
        assert_eq!(msg.error.to_string(), "first");
        assert!(rx.try_recv().is_err());
    }
}
