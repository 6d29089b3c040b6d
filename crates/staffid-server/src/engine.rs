//! Model worker pool.
//!
//! ONNX sessions are not reentrant, so each worker is a dedicated OS thread
//! owning one encoder. Handlers talk to the pool through a bounded channel
//! and receive replies on a oneshot.

use staffid_core::{
    EnrollError, EnrollOutcome, EnrollmentService, FaceEncoder, RawImage, Recognition,
    RecognitionService, RecognizeError,
};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

const QUEUE_DEPTH: usize = 32;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Enroll(#[from] EnrollError),
    #[error(transparent)]
    Recognize(#[from] RecognizeError),
    #[error("engine has no workers")]
    NoWorkers,
    #[error("failed to spawn engine worker: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("engine workers exited")]
    ChannelClosed,
}

/// Messages sent from HTTP handlers to the workers.
enum EngineRequest {
    Enroll {
        identity: String,
        images: Vec<RawImage>,
        reply: oneshot::Sender<Result<EnrollOutcome, EngineError>>,
    },
    Recognize {
        image: RawImage,
        reply: oneshot::Sender<Result<Recognition, EngineError>>,
    },
}

/// Clone-safe handle to the worker pool.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    /// Enroll `identity` from `images` on a model worker.
    pub async fn enroll(&self, identity: String, images: Vec<RawImage>) -> Result<EnrollOutcome, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Enroll {
                identity,
                images,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Recognize the face in `image` on a model worker.
    pub async fn recognize(&self, image: RawImage) -> Result<Recognition, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Recognize { image, reply: reply_tx })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }
}

/// Spawn one worker thread per encoder.
///
/// Workers share a single request queue, so a slow request only occupies
/// its own worker. Requests whose caller has already given up (timed out
/// or disconnected) are skipped rather than processed.
pub fn spawn_engine<E>(
    encoders: Vec<E>,
    enrollment: Arc<EnrollmentService>,
    recognition: Arc<RecognitionService>,
) -> Result<EngineHandle, EngineError>
where
    E: FaceEncoder + Send + 'static,
{
    if encoders.is_empty() {
        return Err(EngineError::NoWorkers);
    }

    let (tx, rx) = mpsc::channel::<EngineRequest>(QUEUE_DEPTH);
    let rx = Arc::new(Mutex::new(rx));

    for (worker, mut encoder) in encoders.into_iter().enumerate() {
        let rx = Arc::clone(&rx);
        let enrollment = Arc::clone(&enrollment);
        let recognition = Arc::clone(&recognition);

        std::thread::Builder::new()
            .name(format!("staffid-engine-{worker}"))
            .spawn(move || {
                tracing::info!(worker, "engine worker started");
                loop {
                    // Hold the queue lock only while waiting for the next request.
                    let next = rx.lock().unwrap_or_else(PoisonError::into_inner).blocking_recv();
                    let Some(req) = next else { break };
                    handle_request(&mut encoder, &enrollment, &recognition, req);
                }
                tracing::info!(worker, "engine worker exiting");
            })
            .map_err(EngineError::Spawn)?;
    }

    Ok(EngineHandle { tx })
}

fn handle_request<E: FaceEncoder>(
    encoder: &mut E,
    enrollment: &EnrollmentService,
    recognition: &RecognitionService,
    req: EngineRequest,
) {
    match req {
        EngineRequest::Enroll {
            identity,
            images,
            reply,
        } => {
            if reply.is_closed() {
                tracing::warn!(staff_id = %identity, "enroll: caller gone, skipping");
                return;
            }
            // The caller may time out while images are being encoded.
            let result = enrollment.enroll_unless(encoder, &identity, &images, || reply.is_closed());
            if let Err(EnrollError::Cancelled) = result {
                tracing::warn!(staff_id = %identity, "enroll: caller gone, not committed");
                return;
            }
            let _ = reply.send(result.map_err(EngineError::from));
        }
        EngineRequest::Recognize { image, reply } => {
            if reply.is_closed() {
                tracing::warn!(image = %image.name, "recognize: caller gone, skipping");
                return;
            }
            let result = recognition
                .recognize(encoder, &image)
                .map_err(EngineError::from);
            let _ = reply.send(result);
        }
    }
}
