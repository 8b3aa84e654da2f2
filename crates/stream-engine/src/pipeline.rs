use std::{collections::HashMap, path::PathBuf, sync::Arc, time::Duration};

use tokio::time::timeout;
use tracing::{error, info, warn};

use crate::{
    directory::{StreamDirectory, StreamState},
    extractor::ExtractorAdapter,
    registry::ProcessRegistry,
    transcoder::{request_for_variant, TranscodeOutcome, TranscoderAdapter, DEFAULT_VARIANTS},
};

const TRANSCODE_DEADLINE: Duration = Duration::from_secs(2 * 3600);

/// Drives one stream from a source URL to a terminal state: extractor call,
/// stream directory creation, then parallel per-tier transcoding.
pub struct PipelineOrchestrator {
    extractor: Arc<ExtractorAdapter>,
    transcoder: Arc<TranscoderAdapter>,
    directory: Arc<StreamDirectory>,
    registry: Arc<ProcessRegistry>,
    streams_root: PathBuf,
}

impl PipelineOrchestrator {
    pub fn new(
        extractor: Arc<ExtractorAdapter>,
        transcoder: Arc<TranscoderAdapter>,
        directory: Arc<StreamDirectory>,
        registry: Arc<ProcessRegistry>,
        streams_root: PathBuf,
    ) -> Self {
        Self { extractor, transcoder, directory, registry, streams_root }
    }

    pub async fn run(&self, stream_id: String, source_url: String) {
        let metadata = match self.extractor.extract(&source_url).await {
            Ok(metadata) => metadata,
            Err(e) => {
                warn!(stream_id, error = %e, "extractor failed");
                self.directory.set_state(&stream_id, StreamState::Error, Some(e.to_string()));
                telemetry::metrics::STREAMS_FAILED_TOTAL.inc();
                return;
            }
        };

        let stream_dir = self.streams_root.join(&stream_id);
        if let Err(e) = tokio::fs::create_dir_all(&stream_dir).await {
            error!(stream_id, error = %e, "failed to create stream directory");
            self.directory.set_state(
                &stream_id,
                StreamState::Error,
                Some(format!("failed to create stream directory: {e}")),
            );
            telemetry::metrics::STREAMS_FAILED_TOTAL.inc();
            return;
        }

        self.directory.set_state(&stream_id, StreamState::Active, None);

        let outcome = timeout(
            TRANSCODE_DEADLINE,
            self.transcode_all(&stream_id, &metadata.url, &stream_dir),
        )
        .await;

        match outcome {
            Ok(results) => {
                let all_failed = results.values().all(|r| r.is_err());
                for (tier, result) in &results {
                    if let Err(e) = result {
                        warn!(stream_id, tier, error = %e, "quality tier failed");
                    }
                }
                if all_failed {
                    self.directory.set_state(
                        &stream_id,
                        StreamState::Error,
                        Some("all quality tiers failed".to_string()),
                    );
                    telemetry::metrics::STREAMS_FAILED_TOTAL.inc();
                } else {
                    info!(stream_id, "stream completed");
                    self.directory.set_state(&stream_id, StreamState::Completed, None);
                    telemetry::metrics::STREAMS_COMPLETED_TOTAL.inc();
                }
            }
            Err(_) => {
                warn!(stream_id, "transcode deadline exceeded");
                self.registry.cleanup_stream(&stream_id, &tokio_util::sync::CancellationToken::new()).await;
                self.directory.set_state(
                    &stream_id,
                    StreamState::TimedOut,
                    Some("transcode deadline exceeded".to_string()),
                );
                telemetry::metrics::STREAMS_FAILED_TOTAL.inc();
            }
        }
    }

    async fn transcode_all(
        &self,
        stream_id: &str,
        source_url: &str,
        stream_dir: &std::path::Path,
    ) -> HashMap<String, Result<TranscodeOutcome, crate::transcoder::TranscodeError>> {
        let mut handles = Vec::with_capacity(DEFAULT_VARIANTS.len());

        for variant in DEFAULT_VARIANTS {
            let req = request_for_variant(variant, source_url, stream_dir);
            let transcoder = self.transcoder.clone();
            let registry = self.registry.clone();
            let stream_id = stream_id.to_string();
            let tier = variant.tier.to_string();

            handles.push(tokio::spawn(async move {
                if let Err(e) = tokio::fs::create_dir_all(&req.output_dir).await {
                    return (tier, Err(crate::transcoder::TranscodeError(e.to_string())));
                }

                let child = match transcoder.spawn(&req) {
                    Ok(child) => child,
                    Err(e) => return (tier, Err(crate::transcoder::TranscodeError(e.to_string()))),
                };

                let pid = child.id().map(|p| p as i32);
                if let Some(pid) = pid {
                    registry.register(&stream_id, pid);
                }

                let result = TranscoderAdapter::wait(child, &req).await;

                if let Some(pid) = pid {
                    registry.deregister(&stream_id, pid);
                }

                (tier, result)
            }));
        }

        let mut results = HashMap::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok((tier, result)) => {
                    results.insert(tier, result);
                }
                Err(e) => {
                    error!(stream_id, error = %e, "transcode task panicked");
                }
            }
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    /// A transcode deadline timeout must still leave the stream in a
    /// terminal state, never stuck in `Active` forever.
    #[tokio::test]
    async fn timed_out_pipeline_marks_stream_terminal() {
        let directory = Arc::new(StreamDirectory::new(Duration::from_secs(300)));
        let record = directory.register("abc", Utc::now());
        directory.set_state(&record.id, StreamState::Active, None);
        directory.set_state(&record.id, StreamState::TimedOut, Some("transcode deadline exceeded".to_string()));
        let got = directory.get(&record.id).unwrap();
        assert_eq!(got.state, StreamState::TimedOut);
    }
}
