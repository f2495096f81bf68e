//! Shared fixtures for the pipeline integration tests
//!
//! [`Harness`] wires a full pipeline over the in-memory store, repository and
//! queue, keeping concrete handles so tests can inspect or sabotage them.

#![allow(dead_code)]

use pmp_pipeline::config::Config;
use pmp_pipeline::context::{Backends, PipelineContext};
use pmp_pipeline::db::MemoryRepository;
use pmp_pipeline::ingest::{UploadReceipt, UploadRequest};
use pmp_pipeline::queue::MemoryJobQueue;
use pmp_pipeline::storage::MemoryStore;
use pmp_pipeline::worker::WorkerPool;
use std::io::Cursor;
use std::sync::Arc;
use uuid::Uuid;

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub repo: Arc<MemoryRepository>,
    pub queue: Arc<MemoryJobQueue>,
    pub context: PipelineContext,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Self {
        let store = Arc::new(MemoryStore::default());
        let repo = Arc::new(MemoryRepository::new());
        let queue = Arc::new(MemoryJobQueue::default());
        let backends = Backends {
            store: store.clone(),
            photos: repo.clone(),
            log: repo.clone(),
            legacy: repo.clone(),
            queue: queue.clone(),
        };
        Self {
            store,
            repo,
            queue,
            context: PipelineContext::from_backends(config, backends),
        }
    }

    pub fn pool(&self) -> WorkerPool {
        self.context.worker_pool().unwrap()
    }

    pub async fn upload(&self, protocol_id: Uuid, bytes: Vec<u8>) -> UploadReceipt {
        self.context
            .ingestion_gateway()
            .ingest(jpeg_request(protocol_id, bytes))
            .await
            .unwrap()
    }
}

pub fn jpeg_request(protocol_id: Uuid, bytes: Vec<u8>) -> UploadRequest {
    UploadRequest {
        protocol_id,
        filename: "photo.jpg".to_string(),
        mime_type: "image/jpeg".to_string(),
        bytes,
        user_id: None,
        metadata: serde_json::json!({ "category": "exterior" }),
    }
}

/// Gradient with per-pixel noise so it compresses like a real photo
pub fn noisy_rgb(width: u32, height: u32, seed: u32) -> Vec<u8> {
    let mut state = seed.wrapping_mul(2_654_435_761).wrapping_add(1);
    let mut pixels = Vec::with_capacity((width * height * 3) as usize);
    for y in 0..height {
        for x in 0..width {
            state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            let noise = (state >> 24) as u8 / 3;
            pixels.push(((x * 255 / width.max(1)) as u8).saturating_add(noise));
            pixels.push(((y * 255 / height.max(1)) as u8).saturating_add(noise));
            pixels.push(noise.wrapping_mul(3));
        }
    }
    pixels
}

pub fn jpeg(width: u16, height: u16, quality: u8, seed: u32) -> Vec<u8> {
    let mut out = Vec::new();
    jpeg_encoder::Encoder::new(&mut out, quality)
        .encode(
            &noisy_rgb(width.into(), height.into(), seed),
            width,
            height,
            jpeg_encoder::ColorType::Rgb,
        )
        .unwrap();
    out
}

pub fn png(width: u32, height: u32, seed: u32) -> Vec<u8> {
    let image = image::RgbImage::from_raw(width, height, noisy_rgb(width, height, seed)).unwrap();
    let mut out = Cursor::new(Vec::new());
    image.write_to(&mut out, image::ImageFormat::Png).unwrap();
    out.into_inner()
}

/// A small valid photo, distinct per seed
pub fn photo(seed: u32) -> Vec<u8> {
    jpeg(320, 240, 85, seed)
}
