// rowflow/src/transport/frame.rs

//! Wire frames of the node transport and their length-prefixed JSON codec.
//!
//! Every frame is a big-endian `u32` byte length followed by that many bytes of
//! JSON. Rows travel in `Batch` frames that reference a schema by version; a
//! `Schema` frame announces each new version before its first batch.

use crate::core::row::Row;
use crate::core::schema::Schema;
use crate::core::value::Value;
use crate::error::{FlowError, FlowResult};
use crate::pipeline::definition::PipelineDefinition;
use crate::pipeline::result::RunResult;
use crate::stage::metrics::Checkpoint;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind as IoErrorKind;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum Frame {
  /// Supervisor → node: run this definition.
  Submit {
    run: String,
    definition: PipelineDefinition,
    #[serde(default)]
    input_port: Option<String>,
    #[serde(default)]
    input_schema: Option<Schema>,
    #[serde(default)]
    output_port: Option<String>,
  },
  /// Node → supervisor: the run is initialized and bound.
  Accepted {
    #[serde(default)]
    output_schema: Option<Schema>,
    /// Names the run for a later `Cancel`.
    #[serde(default)]
    run_id: u64,
  },
  /// Node → supervisor: the run could not be started.
  Rejected { message: String },
  Schema { version: u32, schema: Schema },
  Batch { version: u32, rows: Vec<Vec<Value>> },
  /// No more rows will follow in this direction.
  EndOfStream,
  /// Supervisor → node: stop the run.
  Stop,
  /// Supervisor → node, first frame of a control connection: stop an accepted
  /// run without waiting behind its data stream.
  Cancel { run_id: u64 },
  /// Node → supervisor: answer to `Cancel`.
  Cancelled { found: bool },
  Checkpoint { checkpoint: Checkpoint },
  /// Node → supervisor: the run ended; the last frame on a connection.
  Finished { result: RunResult },
}

impl Frame {
  pub fn name(&self) -> &'static str {
    match self {
      Frame::Submit { .. } => "submit",
      Frame::Accepted { .. } => "accepted",
      Frame::Rejected { .. } => "rejected",
      Frame::Schema { .. } => "schema",
      Frame::Batch { .. } => "batch",
      Frame::EndOfStream => "end_of_stream",
      Frame::Stop => "stop",
      Frame::Cancel { .. } => "cancel",
      Frame::Cancelled { .. } => "cancelled",
      Frame::Checkpoint { .. } => "checkpoint",
      Frame::Finished { .. } => "finished",
    }
  }
}

/// Writes frames to one half of a connection.
pub struct FrameWriter<W> {
  inner: W,
  peer: String,
  max_frame_bytes: usize,
}

impl<W> FrameWriter<W>
where
  W: tokio::io::AsyncWrite + Unpin,
{
  pub fn new(inner: W, peer: impl Into<String>, max_frame_bytes: usize) -> Self {
    Self {
      inner,
      peer: peer.into(),
      max_frame_bytes,
    }
  }

  pub async fn send(&mut self, frame: &Frame) -> FlowResult<()> {
    let payload = serde_json::to_vec(frame)?;
    if payload.len() > self.max_frame_bytes {
      return Err(FlowError::transport(
        &self.peer,
        format!("{} frame of {} bytes exceeds the {} byte limit", frame.name(), payload.len(), self.max_frame_bytes),
      ));
    }
    let len = u32::try_from(payload.len())
      .map_err(|_| FlowError::transport(&self.peer, "frame length overflows u32"))?;
    self.inner.write_u32(len).await?;
    self.inner.write_all(&payload).await?;
    self.inner.flush().await?;
    Ok(())
  }

  pub async fn shutdown(&mut self) -> FlowResult<()> {
    self.inner.shutdown().await?;
    Ok(())
  }
}

/// Reads frames from one half of a connection. Not cancel-safe; drive it from a
/// dedicated task.
pub struct FrameReader<R> {
  inner: R,
  peer: String,
  max_frame_bytes: usize,
}

impl<R> FrameReader<R>
where
  R: tokio::io::AsyncRead + Unpin,
{
  pub fn new(inner: R, peer: impl Into<String>, max_frame_bytes: usize) -> Self {
    Self {
      inner,
      peer: peer.into(),
      max_frame_bytes,
    }
  }

  pub fn peer(&self) -> &str {
    &self.peer
  }

  /// The next frame, or `None` when the peer closed the connection between frames.
  pub async fn next(&mut self) -> FlowResult<Option<Frame>> {
    let len = match self.inner.read_u32().await {
      Ok(len) => len as usize,
      Err(e) if e.kind() == IoErrorKind::UnexpectedEof => return Ok(None),
      Err(e) => return Err(FlowError::transport(&self.peer, e)),
    };
    if len > self.max_frame_bytes {
      return Err(FlowError::transport(
        &self.peer,
        format!("incoming frame of {} bytes exceeds the {} byte limit", len, self.max_frame_bytes),
      ));
    }
    let mut payload = vec![0u8; len];
    self
      .inner
      .read_exact(&mut payload)
      .await
      .map_err(|e| FlowError::transport(&self.peer, format!("connection lost mid-frame: {}", e)))?;
    Ok(Some(serde_json::from_slice(&payload)?))
  }
}

/// Groups outgoing rows into `Schema` and `Batch` frames.
#[derive(Debug)]
pub struct BatchEncoder {
  batch_size: usize,
  version: u32,
  current: Option<Arc<Schema>>,
  rows: Vec<Vec<Value>>,
}

impl BatchEncoder {
  pub fn new(batch_size: usize) -> Self {
    Self {
      batch_size: batch_size.max(1),
      version: 0,
      current: None,
      rows: Vec::new(),
    }
  }

  pub fn is_empty(&self) -> bool {
    self.rows.is_empty()
  }

  /// Adds a row; returns the frames that became ready to send.
  pub fn push(&mut self, row: Row) -> Vec<Frame> {
    let mut ready = Vec::new();
    let same = self.current.as_ref().is_some_and(|s| row.same_layout(s));
    if !same {
      ready.extend(self.flush());
      self.version += 1;
      self.current = Some(row.schema().clone());
      ready.push(Frame::Schema {
        version: self.version,
        schema: row.schema().as_ref().clone(),
      });
    }
    self.rows.push(row.into_values());
    if self.rows.len() >= self.batch_size {
      ready.extend(self.flush());
    }
    ready
  }

  /// The buffered rows as a batch frame, if any.
  pub fn flush(&mut self) -> Option<Frame> {
    if self.rows.is_empty() {
      return None;
    }
    Some(Frame::Batch {
      version: self.version,
      rows: std::mem::take(&mut self.rows),
    })
  }
}

/// Turns incoming `Schema` and `Batch` frames back into rows.
#[derive(Debug, Default)]
pub struct BatchDecoder {
  version: u32,
  current: Option<Arc<Schema>>,
}

impl BatchDecoder {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn set_schema(&mut self, version: u32, schema: Schema) {
    self.version = version;
    self.current = Some(Arc::new(schema));
  }

  pub fn decode(&self, peer: &str, version: u32, rows: Vec<Vec<Value>>) -> FlowResult<Vec<Row>> {
    let schema = match &self.current {
      Some(schema) if version == self.version => schema,
      _ => {
        return Err(FlowError::transport(
          peer,
          format!("batch references unknown schema version {}", version),
        ))
      }
    };
    rows
      .into_iter()
      .map(|values| Row::try_new(schema.clone(), values))
      .collect()
  }
}
