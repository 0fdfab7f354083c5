//! Whole-package invariants over a recorded session.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;

use provinode_core::ident::sha256_hex;
use provinode_scan::capture::{CaptureFrame, CapturePipeline, FrameProvider, PipelineConfig};
use provinode_scan::recorder::SessionRecorder;

struct SweepProvider {
    frames: Vec<CaptureFrame>,
    cursor: usize,
}

#[async_trait]
impl FrameProvider for SweepProvider {
    async fn next_frame(&mut self) -> Option<CaptureFrame> {
        let frame = self.frames.get(self.cursor).cloned();
        self.cursor += 1;
        frame
    }

    fn pause(&mut self) {}
}

fn sweep_frames(count: usize) -> Vec<CaptureFrame> {
    (0..count)
        .map(|i| CaptureFrame {
            timestamp_sec: i as f64 * 0.033,
            pose: std::array::from_fn(|j| (i * 16 + j) as f64 * 0.25),
            intrinsics: [500.0, 0.0, 320.0, 0.0, 500.0, 240.0, 0.0, 0.0, 1.0],
            resolution: (640, 480),
            image_jpeg: (i % 10 == 0).then(|| vec![0xff, 0xd8, i as u8]),
            depth_map: Some(vec![i as u8; 16]),
            mesh_anchors: Vec::new(),
        })
        .collect()
}

#[tokio::test]
async fn recorded_package_satisfies_all_integrity_invariants() {
    let root = tempfile::tempdir().unwrap();
    let recorder = Arc::new(
        SessionRecorder::create(root.path(), "01FULLSESSION0000000000000", "01DEVICE")
            .await
            .unwrap(),
    );
    let pipeline = CapturePipeline::new(PipelineConfig {
        session_id: "01FULLSESSION0000000000000".to_string(),
        source_device_id: "01DEVICE".to_string(),
        recorder: Arc::clone(&recorder),
        transport: None,
    });

    let mut provider = SweepProvider {
        frames: sweep_frames(45),
        cursor: 0,
    };
    let dir = pipeline.run(&mut provider).await.unwrap();

    let log = tokio::fs::read_to_string(dir.join("samples.log")).await.unwrap();
    let lines: Vec<serde_json::Value> = log
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert!(!lines.is_empty());

    // Sequence numbers are a strict prefix of the naturals.
    for (index, line) in lines.iter().enumerate() {
        assert_eq!(line["sample_seq"].as_i64().unwrap(), index as i64);
    }

    // Every referenced blob exists, is non-empty, and hashes to its name.
    let mut referenced = BTreeSet::new();
    for line in &lines {
        let hash = line["hash_sha256"].as_str().unwrap();
        let blob_path = line["blob_path"].as_str().unwrap();
        assert_eq!(blob_path, format!("blobs/sha256/{hash}"));

        let bytes = tokio::fs::read(dir.join(blob_path)).await.unwrap();
        assert!(!bytes.is_empty());
        assert_eq!(sha256_hex(&bytes), hash);
        referenced.insert(blob_path.to_string());
    }

    // The integrity map covers exactly the referenced blobs.
    let integrity: serde_json::Value =
        serde_json::from_slice(&tokio::fs::read(dir.join("integrity.json")).await.unwrap())
            .unwrap();
    let blob_hashes: BTreeMap<String, String> =
        serde_json::from_value(integrity["blob_hashes"].clone()).unwrap();
    let mapped: BTreeSet<String> = blob_hashes.keys().cloned().collect();
    assert_eq!(mapped, referenced, "no orphans, no dangling references");

    // Manifest and log digests match the files on disk.
    let manifest_bytes = tokio::fs::read(dir.join("session.manifest.json")).await.unwrap();
    assert_eq!(
        integrity["manifest_sha256"].as_str().unwrap(),
        sha256_hex(&manifest_bytes)
    );
    let log_bytes = tokio::fs::read(dir.join("samples.log")).await.unwrap();
    assert_eq!(
        integrity["samples_log_sha256"].as_str().unwrap(),
        sha256_hex(&log_bytes)
    );

    // Manifest counters agree with what the log says.
    let manifest: serde_json::Value = serde_json::from_slice(&manifest_bytes).unwrap();
    assert_eq!(
        manifest["sample_count"].as_u64().unwrap(),
        lines.len() as u64
    );
    assert_eq!(
        manifest["blob_count"].as_u64().unwrap(),
        blob_hashes.len() as u64
    );
}
