//! File relay. Each phase frame is routed and de-duplicated on its own;
//! nothing is buffered or reassembled here.

use super::delivery::object_with;
use super::directory::{Discriminant, SeenKey};
use super::gate::ConnectionState;
use super::{FilePhase, Mesh, MeshEvent, Routed};
use crate::transport::{Envelope, ErrorCode, FrameType};
use crate::utils::{MeshError, Result};
use serde_json::Value;

impl FilePhase {
    /// Frame type carrying this phase
    pub fn frame_type(self) -> FrameType {
        match self {
            Self::Start => FrameType::FileStart,
            Self::Chunk => FrameType::FileChunk,
            Self::End => FrameType::FileEnd,
        }
    }

    fn of(kind: FrameType) -> Option<Self> {
        match kind {
            FrameType::FileStart => Some(Self::Start),
            FrameType::FileChunk => Some(Self::Chunk),
            FrameType::FileEnd => Some(Self::End),
            _ => None,
        }
    }
}

impl Mesh {
    /// Announce a transfer: `meta` carries `file_id`, `name`, `size`, `sha256`
    pub async fn send_file_start(&self, to_user: &str, meta: &Value) -> Result<Routed> {
        self.send_file_phase(FilePhase::Start, to_user, meta).await
    }

    /// Relay one chunk: `meta` carries `file_id`, `index`, `ciphertext`
    pub async fn send_file_chunk(&self, to_user: &str, meta: &Value) -> Result<Routed> {
        self.send_file_phase(FilePhase::Chunk, to_user, meta).await
    }

    /// Close a transfer: `meta` carries `file_id`
    pub async fn send_file_end(&self, to_user: &str, meta: &Value) -> Result<Routed> {
        self.send_file_phase(FilePhase::End, to_user, meta).await
    }

    async fn send_file_phase(&self, phase: FilePhase, to_user: &str, meta: &Value) -> Result<Routed> {
        let payload = object_with("to_user", to_user, meta)?;
        self.route_to_user(phase.frame_type(), to_user, payload, |payload| {
            MeshEvent::FilePhaseReceived { phase, payload }
        })
        .await
    }

    pub(crate) async fn on_file_frame(
        &self,
        kind: FrameType,
        envelope: &Envelope,
        conn: &ConnectionState,
    ) -> Result<()> {
        let phase = FilePhase::of(kind)
            .ok_or_else(|| MeshError::unexpected(format!("{kind} is not a file frame")))?;
        let (Some(to_user), Some(file_id)) = (
            envelope.payload_str("to_user"),
            envelope.payload_str("file_id"),
        ) else {
            return Err(MeshError::rejected(ErrorCode::BadPayload, "missing to_user or file_id"));
        };

        // Chunk N must not suppress chunk N+1.
        let discriminant = match phase {
            FilePhase::Chunk => Discriminant::Chunk(
                envelope
                    .payload
                    .get("index")
                    .and_then(Value::as_u64)
                    .unwrap_or_default(),
            ),
            FilePhase::Start | FilePhase::End => Discriminant::None,
        };
        let key = SeenKey::new(kind, &envelope.from, file_id, discriminant);

        self.route_inbound(envelope, conn, to_user, key, |payload| {
            MeshEvent::FilePhaseReceived { phase, payload }
        })
        .await?;
        Ok(())
    }
}
