//! Window-less event sink for servers, CI and smoke runs

use std::sync::Arc;
use std::time::Duration;

use color_eyre::Result;
use flume::Receiver;
use tracing::{info, warn};

use super::EventTally;
use crate::pipeline::{Pipeline, PipelineEvent, ShutdownReport};

/// Consume pipeline events until Ctrl-C, `duration` elapses, or both stages finish.
pub async fn run(
    pipeline: Arc<Pipeline>,
    events: Receiver<PipelineEvent>,
    duration: Option<Duration>,
) -> Result<(EventTally, ShutdownReport)> {
    let mut tally = EventTally::default();
    let deadline = async {
        match duration {
            Some(d) => tokio::time::sleep(d).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            event = events.recv_async() => {
                let Ok(event) = event else { break };
                tally.record(&event);
                match &event {
                    PipelineEvent::Annotated(result) => info!(
                        "Frame {}: {} detections in {:?}",
                        result.source_sequence,
                        result.detections.len(),
                        result.inference_time
                    ),
                    PipelineEvent::Error { stage, error } => warn!("{} stage: {}", stage, error),
                    _ => {}
                }
                if tally.finished >= 2 {
                    info!("Both stages finished");
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
            _ = &mut deadline => {
                info!("Run duration reached");
                break;
            }
        }
    }

    let stats = pipeline.slot_stats();
    info!(
        "Slot saw {} frames, {} inferred, {} superseded unread",
        stats.frames_written, stats.frames_read, stats.frames_superseded
    );

    // Shutdown blocks for up to the grace period per stage.
    let report = tokio::task::spawn_blocking(move || pipeline.shutdown()).await?;
    Ok((tally, report))
}
