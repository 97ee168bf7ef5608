use crate::protocol::OverlayProtocol;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Handle on a node's running listener and its spawned handler tasks.
///
/// Auxiliary loops (persistence) attach themselves with [`ServerHandle::spawn`]
/// so one cancellation brings the whole node down and `shutdown` can wait
/// for everything it started.
#[derive(Debug, Clone)]
pub struct ServerHandle {
    token: CancellationToken,
    tracker: TaskTracker,
}

impl ServerHandle {
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tracker.spawn(task);
    }

    /// Stops accepting, lets in-flight handlers drain, waits for all tasks.
    pub async fn shutdown(&self) {
        self.token.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }
}

/// Starts the accept loop for a node: one tracked task per inbound
/// connection, each running the node's request handler to completion.
pub fn serve<P: OverlayProtocol>(listener: TcpListener, node: Arc<P>) -> ServerHandle {
    let token = CancellationToken::new();
    let tracker = TaskTracker::new();
    tracker.spawn(accept_loop(
        listener,
        node,
        token.clone(),
        tracker.clone(),
    ));
    ServerHandle { token, tracker }
}

async fn accept_loop<P: OverlayProtocol>(
    listener: TcpListener,
    node: Arc<P>,
    token: CancellationToken,
    tracker: TaskTracker,
) {
    tracing::info!(node = %node.node_info(), "listening");
    loop {
        tokio::select! {
            // shutdown wins over a pending accept
            biased;

            _ = token.cancelled() => {
                tracing::debug!(node = %node.node_info(), "listener stopping");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let node = Arc::clone(&node);
                    tracker.spawn(async move {
                        node.serve_connection(stream, peer).await;
                    });
                }
                Err(e) => {
                    tracing::warn!(node = %node.node_info(), error = %e, "accept failed");
                }
            }
        }
    }
}
