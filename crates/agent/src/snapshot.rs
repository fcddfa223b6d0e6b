//! The snapshot job: one camera activation end to end.
//!
//! Orchestrates the grabber, the upload legs, and the prediction trigger,
//! recording a metric stage at every boundary. The stage label sequence is
//! a public contract for the aggregator.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{ensure, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use md5::{Digest, Md5};
use tracing::warn;

use rtsp_ingest::{DecoderProvider, FrameGrabber};

use crate::api::ApiClient;
use crate::metrics::JobMetrics;
use crate::roster::CameraDescriptor;
use crate::scheduler::Activation;

/// Executes snapshot jobs against one API and decoder provider.
pub struct SnapshotRunner {
    api: Arc<ApiClient>,
    decoders: Arc<dyn DecoderProvider>,
    deadline_divisor: u32,
}

impl SnapshotRunner {
    pub fn new(
        api: Arc<ApiClient>,
        decoders: Arc<dyn DecoderProvider>,
        deadline_divisor: u32,
    ) -> Self {
        Self {
            api,
            decoders,
            deadline_divisor: deadline_divisor.max(1),
        }
    }

    /// Run one activation to completion. Metrics are stopped on every path;
    /// `success` is set only when all steps succeeded.
    pub fn run(&self, activation: &Activation) -> (JobMetrics, Result<()>) {
        let mut metrics = JobMetrics::new();
        let result = self.execute(&activation.camera, &mut metrics);
        metrics.stop(result.is_ok());
        (metrics, result)
    }

    fn execute(&self, camera: &CameraDescriptor, metrics: &mut JobMetrics) -> Result<()> {
        ensure!(
            camera.refresh_interval_s > 0,
            "refresh interval must be greater than zero"
        );
        let deadline =
            Duration::from_secs(camera.refresh_interval_s) / self.deadline_divisor;

        let mut grabber = FrameGrabber::new(
            &camera.rtsp_url,
            deadline,
            Arc::clone(&self.decoders),
        )
        .context("creating frame grabber")?;
        metrics.add("setup");

        grabber.open().context("opening camera stream")?;
        metrics.add("start");

        let frame = grabber.next_frame().context("getting frame")?;
        if let Some(pause_warning) = &frame.pause_warning {
            warn!(
                camera = camera.id.as_str(),
                "frame acquired but PAUSE failed: {pause_warning}"
            );
        }
        metrics.add("get_next_frame");

        let hash = BASE64.encode(Md5::digest(&frame.image));
        let content_length = frame.image.len();
        metrics.add("create_snapshot_body");

        let snapshot = self
            .api
            .create_snapshot(&camera.snapshot_url, &hash, content_length)
            .context("creating snapshot")?;
        metrics.add("create_snapshot");

        self.api
            .send_snapshot(&snapshot.image_url, frame.image, &hash)
            .context("sending snapshot")?;
        metrics.add("send_snapshot");

        self.api
            .create_predictions(&camera.snapshot_url, &snapshot.id)
            .context("creating predictions")?;
        metrics.add("create_predictions");

        // Grabber teardown happens on drop, covering early returns too.
        Ok(())
    }
}
