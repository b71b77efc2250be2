//! Service wiring and lifecycle management.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::mirror::{Mirror, MirrorHandle};
use crate::projector::Projector;
use crate::sink::ZoneSink;

/// Name the projector subscribes to the mirror under.
const PROJECTOR_SUBSCRIBER: &str = "dns-projector";

/// Delay before the projector retries a failed subscription.
const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(1);

/// The complete sync service: a mirror actor feeding a projector actor
/// that publishes the derived zone into a sink.
pub struct SyncServer {
    config: SyncConfig,
    sink: Arc<dyn ZoneSink>,
}

impl SyncServer {
    /// Create a server publishing into `sink`.
    pub fn new(config: SyncConfig, sink: Arc<dyn ZoneSink>) -> Self {
        Self { config, sink }
    }

    /// Run until the token is cancelled.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), SyncError> {
        info!(
            master = %self.config.master_url,
            domain = %self.config.domain,
            "starting mesos-dns-sync"
        );

        let (mirror, handle) = Mirror::new(self.config.clone(), cancel.clone())?;
        let mirror_task = tokio::spawn(mirror.run());

        let mut projector = Projector::new(self.config.clone(), self.sink.clone());
        let projector_cancel = cancel.clone();
        let projector_task = tokio::spawn(async move {
            projector_loop(&mut projector, handle, projector_cancel).await;
        });

        if let Err(err) = projector_task.await {
            warn!(%err, "projector task panicked");
        }
        if let Err(err) = mirror_task.await {
            warn!(%err, "mirror task panicked");
        }

        info!("mesos-dns-sync stopped");
        Ok(())
    }
}

/// Keep the projector subscribed. Projection state is retained across
/// resubscribes, so a forced termination only costs the missed updates
/// until the next full snapshot.
async fn projector_loop(projector: &mut Projector, handle: MirrorHandle, cancel: CancellationToken) {
    while !cancel.is_cancelled() {
        match handle.subscribe(PROJECTOR_SUBSCRIBER).await {
            Ok(subscription) => projector.run(subscription, cancel.clone()).await,
            Err(SyncError::MirrorClosed) => return,
            Err(err) => warn!(%err, "projector failed to subscribe"),
        }
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = sleep(RESUBSCRIBE_DELAY) => {}
        }
    }
}
