//! End-to-end message handling against in-memory queue, store and video fakes.

use async_trait::async_trait;
use image::{Rgb, RgbImage};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use vidtrack_worker::{
    DecodeError, Frame, FramePipeline, FrameSource, LeaseManager, LeaseSettings, MessageQueue,
    ObjectStore, PipelineSettings, QueueError, QueueMessage, RawDetection, RetryPolicy,
    StreamInfo, TrackOutput, TrackParams, Tracker, TrackerError, TransferError, VideoDecoder,
    VideoEncoder, Worker, WorkerSettings,
};

#[derive(Default)]
struct QueueState {
    pending: VecDeque<QueueMessage>,
    deleted: Vec<String>,
    sent: Vec<(String, String)>,
}

#[derive(Clone, Default)]
struct FakeQueue {
    state: Arc<Mutex<QueueState>>,
}

impl FakeQueue {
    fn push(&self, receipt_handle: &str, body: String) {
        self.state.lock().unwrap().pending.push_back(QueueMessage {
            message_id: Some(format!("id-{}", receipt_handle)),
            receipt_handle: receipt_handle.to_string(),
            body,
        });
    }

    fn deleted(&self) -> Vec<String> {
        self.state.lock().unwrap().deleted.clone()
    }
}

#[async_trait]
impl MessageQueue for FakeQueue {
    async fn receive(
        &self,
        _wait: Duration,
        _visibility: Duration,
    ) -> Result<Option<QueueMessage>, QueueError> {
        Ok(self.state.lock().unwrap().pending.pop_front())
    }

    async fn change_visibility(
        &self,
        _receipt_handle: &str,
        _duration: Duration,
    ) -> Result<(), QueueError> {
        Ok(())
    }

    async fn delete(&self, receipt_handle: &str) -> Result<(), QueueError> {
        self.state
            .lock()
            .unwrap()
            .deleted
            .push(receipt_handle.to_string());
        Ok(())
    }

    async fn send(&self, queue_url: &str, body: &str) -> Result<(), QueueError> {
        self.state
            .lock()
            .unwrap()
            .sent
            .push((queue_url.to_string(), body.to_string()));
        Ok(())
    }
}

#[derive(Default)]
struct StoreState {
    objects: HashMap<String, Vec<u8>>,
    downloads: usize,
    uploads: usize,
}

/// Bucket-less object store; uploads never become visible when `invisible` is set.
#[derive(Clone, Default)]
struct FakeStore {
    state: Arc<Mutex<StoreState>>,
    invisible: bool,
}

impl FakeStore {
    fn put(&self, key: &str, data: &[u8]) {
        self.state
            .lock()
            .unwrap()
            .objects
            .insert(key.to_string(), data.to_vec());
    }

    fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.state.lock().unwrap().objects.get(key).cloned()
    }

    fn counts(&self) -> (usize, usize) {
        let state = self.state.lock().unwrap();
        (state.downloads, state.uploads)
    }
}

#[async_trait]
impl ObjectStore for FakeStore {
    async fn download(
        &self,
        bucket: &str,
        key: &str,
        local_path: &Path,
    ) -> Result<(), TransferError> {
        let data = {
            let mut state = self.state.lock().unwrap();
            state.downloads += 1;
            state.objects.get(key).cloned()
        };
        let data = data.ok_or_else(|| TransferError::NotFound {
            bucket: bucket.to_string(),
            key: key.to_string(),
        })?;
        std::fs::write(local_path, data)?;
        Ok(())
    }

    async fn upload(&self, bucket: &str, key: &str, local_path: &Path) -> Result<(), TransferError> {
        let data = std::fs::read(local_path)?;
        self.state.lock().unwrap().uploads += 1;

        if self.invisible {
            return Err(TransferError::ConfirmationTimeout {
                bucket: bucket.to_string(),
                key: key.to_string(),
                attempts: 3,
            });
        }
        self.put(key, &data);
        Ok(())
    }
}

struct ThreeFrames {
    next: u64,
}

impl Iterator for ThreeFrames {
    type Item = Result<Frame, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next == 3 {
            return None;
        }
        let index = self.next;
        self.next += 1;
        Some(Ok(Frame {
            index,
            image: RgbImage::from_pixel(8, 4, Rgb([10, 10, 10])),
        }))
    }
}

impl FrameSource for ThreeFrames {
    fn info(&self) -> StreamInfo {
        StreamInfo {
            fps: 24.0,
            width: 8,
            height: 4,
        }
    }
}

struct ThreeFrameDecoder;

impl VideoDecoder for ThreeFrameDecoder {
    fn open(&self, _path: &Path) -> Result<Box<dyn FrameSource>, DecodeError> {
        Ok(Box::new(ThreeFrames { next: 0 }))
    }
}

struct FileEncoder;

impl VideoEncoder for FileEncoder {
    fn encode(&self, frames: &[RgbImage], _info: &StreamInfo, path: &Path) -> Result<(), DecodeError> {
        std::fs::write(path, format!("{} frames", frames.len())).map_err(|e| DecodeError::Encode {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }
}

/// A single person walking left to right, tracked as id 7.
#[derive(Default)]
struct WalkingPerson {
    frame: usize,
}

impl Tracker for WalkingPerson {
    fn reset(&mut self) {
        self.frame = 0;
    }

    fn track(&mut self, _frame: &RgbImage, _params: &TrackParams) -> Result<TrackOutput, TrackerError> {
        let x = 0.25 + 0.25 * self.frame as f32;
        self.frame += 1;

        Ok(TrackOutput {
            names: Arc::new(vec!["person".to_string(), "car".to_string()]),
            detections: vec![RawDetection {
                xywhn: Some([x, 0.5, 0.25, 0.5]),
                class_id: Some(0),
                confidence: 0.9,
                track_id: Some(7),
            }],
        })
    }

    fn plot(&self, frame: &RgbImage, _output: &TrackOutput) -> RgbImage {
        frame.clone()
    }
}

fn storage_event(key: &str) -> String {
    serde_json::json!({
        "Records": [{
            "eventSource": "aws:s3",
            "s3": {"bucket": {"name": "videos"}, "object": {"key": key, "size": 5}}
        }]
    })
    .to_string()
}

type TestWorker = Worker<FakeQueue, FakeStore, WalkingPerson, ThreeFrameDecoder, FileEncoder>;

fn build_worker(queue: FakeQueue, store: FakeStore, scratch_dir: PathBuf) -> TestWorker {
    let retry = RetryPolicy {
        max_attempts: 2,
        base_factor: 2.0,
        initial_interval: Duration::from_millis(1),
        max_interval: Duration::from_millis(2),
        max_elapsed: Duration::from_secs(1),
    };
    let leases = LeaseManager::new(
        queue,
        LeaseSettings {
            wait_time: Duration::from_secs(1),
            visibility_timeout: Duration::from_secs(900),
            extension_interval: Duration::from_secs(300),
            extension_duration: Duration::from_secs(900),
        },
        retry,
    );
    let pipeline = FramePipeline::new(
        ThreeFrameDecoder,
        FileEncoder,
        PipelineSettings {
            confidence: 0.2,
            iou: 0.5,
            save_video: true,
        },
    );

    Worker::new(
        leases,
        store,
        WalkingPerson::default(),
        pipeline,
        WorkerSettings {
            scratch_dir,
            output_prefix: "output/".to_string(),
            label_filter: Some("person".to_string()),
            video_extensions: vec!["mp4".to_string(), "avi".to_string(), "mov".to_string()],
            completion_queue_url: None,
            idle_sleep: Duration::from_millis(1),
            error_sleep: Duration::from_millis(1),
        },
    )
}

fn is_empty_dir(dir: &Path) -> bool {
    std::fs::read_dir(dir).unwrap().next().is_none()
}

#[tokio::test]
async fn test_three_frame_video_is_tracked_and_acknowledged() {
    let scratch = tempfile::tempdir().unwrap();
    let queue = FakeQueue::default();
    let store = FakeStore::default();
    store.put("uploads/walk.mp4", b"fake video");
    queue.push("rh-1", storage_event("uploads/walk.mp4"));

    let mut worker = build_worker(queue.clone(), store.clone(), scratch.path().to_path_buf());
    assert!(worker.poll_once().await.unwrap());

    assert_eq!(queue.deleted(), vec!["rh-1".to_string()]);
    assert_eq!(store.counts(), (1, 2));
    assert!(is_empty_dir(scratch.path()));

    let document: serde_json::Value =
        serde_json::from_slice(&store.get("output/walk_output.json").unwrap()).unwrap();
    let frames = document.as_array().unwrap();
    assert_eq!(frames.len(), 3);

    for (i, frame) in frames.iter().enumerate() {
        let records = frame.as_array().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["timestamp"], i as u64);
        assert_eq!(records[0]["person"]["index"], 7);

        let left = records[0]["person"]["boundingBox"]["left"].as_f64().unwrap();
        let expected = 0.25 + 0.25 * i as f64 - 0.125;
        assert!((left - expected).abs() < 1e-6);
    }

    assert_eq!(
        store.get("output/walk_annotated.mp4").unwrap(),
        b"3 frames".to_vec()
    );

    // Queue is drained now
    assert!(!worker.poll_once().await.unwrap());
}

#[tokio::test]
async fn test_text_file_event_is_a_no_op_acknowledgment() {
    let scratch = tempfile::tempdir().unwrap();
    let queue = FakeQueue::default();
    let store = FakeStore::default();
    queue.push("rh-txt", storage_event("notes/readme.txt"));

    let mut worker = build_worker(queue.clone(), store.clone(), scratch.path().to_path_buf());
    assert!(worker.poll_once().await.unwrap());

    assert_eq!(queue.deleted(), vec!["rh-txt".to_string()]);
    assert_eq!(store.counts(), (0, 0));
    assert!(is_empty_dir(scratch.path()));
}

#[tokio::test]
async fn test_unconfirmed_upload_leaves_message_for_redelivery() {
    let scratch = tempfile::tempdir().unwrap();
    let queue = FakeQueue::default();
    let store = FakeStore {
        invisible: true,
        ..FakeStore::default()
    };
    store.put("walk.mp4", b"fake video");
    queue.push("rh-2", storage_event("walk.mp4"));

    let mut worker = build_worker(queue.clone(), store.clone(), scratch.path().to_path_buf());
    assert!(worker.poll_once().await.unwrap());

    assert!(queue.deleted().is_empty());
    assert!(store.get("output/walk_output.json").is_none());
    assert!(is_empty_dir(scratch.path()));
}

#[tokio::test]
async fn test_missing_object_leaves_message_for_redelivery() {
    let scratch = tempfile::tempdir().unwrap();
    let queue = FakeQueue::default();
    let store = FakeStore::default();
    queue.push("rh-3", storage_event("gone.mov"));

    let mut worker = build_worker(queue.clone(), store.clone(), scratch.path().to_path_buf());
    assert!(worker.poll_once().await.unwrap());

    assert!(queue.deleted().is_empty());
    assert_eq!(store.counts(), (1, 0));
    assert!(is_empty_dir(scratch.path()));
}
