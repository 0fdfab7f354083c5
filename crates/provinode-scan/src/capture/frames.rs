//! Frame provider interface and payload encodings.
//!
//! The sensor stack (camera, depth, world meshing) is an external
//! collaborator; the pipeline only sees [`CaptureFrame`] values pulled
//! from a [`FrameProvider`]. Payload encodings for the derived samples
//! live here so both the pipeline and its tests agree on the bytes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A mesh anchor update from the world-meshing source.
///
/// Field order is alphabetical so batches serialize with sorted keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeshAnchor {
    /// Triangle indices, three per face.
    pub face_indices: Vec<u32>,
    /// Stable anchor identifier.
    pub identifier: String,
    /// 4x4 column-major anchor transform.
    pub transform: [f64; 16],
    /// Vertex positions, three coordinates per vertex.
    pub vertices: Vec<f64>,
}

impl MeshAnchor {
    /// True when the anchor carries usable geometry.
    #[must_use]
    pub fn has_geometry(&self) -> bool {
        !self.vertices.is_empty() && !self.face_indices.is_empty()
    }
}

/// One frame delivered by the sensor stack.
#[derive(Debug, Clone, Default)]
pub struct CaptureFrame {
    /// Source timestamp in seconds on the device monotonic clock.
    pub timestamp_sec: f64,
    /// 4x4 column-major camera transform.
    pub pose: [f64; 16],
    /// Row-major 3x3 intrinsics matrix.
    pub intrinsics: [f64; 9],
    /// Sensor resolution.
    pub resolution: (u32, u32),
    /// JPEG-encoded color image, when available this frame.
    pub image_jpeg: Option<Vec<u8>>,
    /// Opaque depth map bytes, when available this frame.
    pub depth_map: Option<Vec<u8>>,
    /// Mesh anchor updates since the previous frame.
    pub mesh_anchors: Vec<MeshAnchor>,
}

/// External frame source.
#[async_trait]
pub trait FrameProvider: Send {
    /// Next frame, or `None` when the source has ended.
    async fn next_frame(&mut self) -> Option<CaptureFrame>;

    /// Pauses delivery; called when capture stops.
    fn pause(&mut self);
}

/// Pose payload: JSON array of the 16 column-major floats.
#[must_use]
pub fn encode_pose(pose: &[f64; 16]) -> Vec<u8> {
    serde_json::to_vec(&pose[..]).expect("pose serialization cannot fail")
}

/// Intrinsics payload with sorted keys.
#[derive(Debug, Serialize, Deserialize)]
pub struct IntrinsicsPayload {
    /// Sensor height in pixels.
    pub height: u32,
    /// Row-major 3x3 matrix.
    pub matrix: [f64; 9],
    /// Sensor width in pixels.
    pub width: u32,
}

/// Encodes the intrinsics payload.
#[must_use]
pub fn encode_intrinsics(matrix: &[f64; 9], resolution: (u32, u32)) -> Vec<u8> {
    let payload = IntrinsicsPayload {
        height: resolution.1,
        matrix: *matrix,
        width: resolution.0,
    };
    serde_json::to_vec(&payload).expect("intrinsics serialization cannot fail")
}

/// Mesh batch payload: JSON array of anchors with geometry.
#[must_use]
pub fn encode_mesh_batch(anchors: &[MeshAnchor]) -> Vec<u8> {
    serde_json::to_vec(anchors).expect("mesh serialization cannot fail")
}

/// Heartbeat payload.
#[derive(Debug, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    /// Frames seen so far.
    pub frame_counter: u64,
    /// Set on the final heartbeat of a session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_end: Option<bool>,
}

/// Encodes a heartbeat payload.
#[must_use]
pub fn encode_heartbeat(frame_counter: u64, session_end: bool) -> Vec<u8> {
    let payload = HeartbeatPayload {
        frame_counter,
        session_end: session_end.then_some(true),
    };
    serde_json::to_vec(&payload).expect("heartbeat serialization cannot fail")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pose_encodes_as_flat_array() {
        let mut pose = [0.0; 16];
        pose[0] = 1.0;
        pose[15] = 1.0;
        let decoded: Vec<f64> = serde_json::from_slice(&encode_pose(&pose)).unwrap();
        assert_eq!(decoded.len(), 16);
        assert!((decoded[0] - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn intrinsics_carry_matrix_and_resolution() {
        let bytes = encode_intrinsics(&[500.0, 0.0, 320.0, 0.0, 500.0, 240.0, 0.0, 0.0, 1.0], (640, 480));
        let payload: IntrinsicsPayload = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(payload.width, 640);
        assert_eq!(payload.height, 480);
        assert!((payload.matrix[0] - 500.0).abs() < f64::EPSILON);
    }

    #[test]
    fn heartbeat_omits_session_end_until_final() {
        let running = encode_heartbeat(30, false);
        assert!(!String::from_utf8(running).unwrap().contains("session_end"));

        let last: HeartbeatPayload =
            serde_json::from_slice(&encode_heartbeat(90, true)).unwrap();
        assert_eq!(last.session_end, Some(true));
        assert_eq!(last.frame_counter, 90);
    }

    #[test]
    fn anchor_geometry_check() {
        let mut anchor = MeshAnchor {
            face_indices: vec![],
            identifier: "a".to_string(),
            transform: [0.0; 16],
            vertices: vec![],
        };
        assert!(!anchor.has_geometry());
        anchor.vertices = vec![0.0, 0.0, 0.0];
        assert!(!anchor.has_geometry());
        anchor.face_indices = vec![0, 0, 0];
        assert!(anchor.has_geometry());
    }
}
