// rowflow/src/transport/remote.rs

//! The supervisor side of remote execution: a stage that runs on a worker node.
//!
//! The graph builder substitutes a `RemoteStage` for every stage placed on a
//! node. Each copy submits `input-port -> stage -> output-port` to the node as a
//! sub-pipeline of its own and then streams rows both ways over one connection.

use crate::boundary::{INPUT_PORT_PLUGIN, OUTPUT_PORT_PLUGIN};
use crate::core::context::InitContext;
use crate::core::control::{RunStatus, StageControl};
use crate::core::queue::RowQueue;
use crate::core::schema::Schema;
use crate::core::signal::RunSignal;
use crate::error::{ErrorDetail, ErrorKind, FlowError, FlowResult};
use crate::pipeline::definition::{Distribution, PipelineDefinition, StageDefinition};
use crate::pipeline::parameters::{ParameterDefinition, Parameters};
use crate::pipeline::result::{NestedResult, RunResult};
use crate::registry::StageFactory;
use crate::stage::metrics::Checkpoint;
use crate::stage::{Stage, StageContext};
use crate::transport::frame::{BatchDecoder, BatchEncoder, Frame, FrameReader, FrameWriter};
use async_trait::async_trait;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{event, Level};

pub(crate) const REMOTE_INPUT_PORT: &str = "input";
pub(crate) const REMOTE_OUTPUT_PORT: &str = "output";
const OUTBOX_FRAMES: usize = 16;

/// Creates `RemoteStage`s for stages placed on one node.
#[derive(Debug, Clone)]
pub struct RemoteStageFactory {
  node: String,
  address: String,
}

impl RemoteStageFactory {
  pub fn new(node: &str, address: &str) -> Self {
    Self {
      node: node.to_string(),
      address: address.to_string(),
    }
  }
}

impl StageFactory for RemoteStageFactory {
  fn create(&self, definition: &StageDefinition) -> FlowResult<Box<dyn Stage>> {
    Ok(Box::new(RemoteStage::new(&self.node, &self.address, definition.clone())))
  }
}

/// How the connection's reading half ended.
#[derive(Debug)]
enum ReaderOutcome {
  Finished(RunResult),
  Failed(String),
}

enum Event<'a> {
  FromNode(Option<crate::core::row::Row>),
  Permit(Result<mpsc::Permit<'a, Frame>, mpsc::error::SendError<()>>),
  FromParent(Option<crate::core::row::Row>),
  Checkpoint(Checkpoint),
  Stopped,
}

pub struct RemoteStage {
  node: String,
  address: String,
  definition: StageDefinition,
  run_name: String,
  /// Id the node gave the run in `Accepted`.
  run_id: u64,
  bind_timeout: Duration,
  connect_timeout: Duration,
  max_frame_bytes: usize,
  outbox: Option<mpsc::Sender<Frame>>,
  outgoing: VecDeque<Frame>,
  encoder: BatchEncoder,
  from_node: Option<Arc<RowQueue>>,
  reader: Option<JoinHandle<ReaderOutcome>>,
  checkpoints: mpsc::UnboundedReceiver<Checkpoint>,
  writer: Option<JoinHandle<FlowResult<()>>>,
  input_done: bool,
  nested_done: bool,
}

impl RemoteStage {
  pub fn new(node: &str, address: &str, definition: StageDefinition) -> Self {
    let (_, checkpoints) = mpsc::unbounded_channel();
    Self {
      node: node.to_string(),
      address: address.to_string(),
      definition,
      run_name: String::new(),
      run_id: 0,
      bind_timeout: Duration::ZERO,
      connect_timeout: Duration::ZERO,
      max_frame_bytes: 0,
      outbox: None,
      outgoing: VecDeque::new(),
      encoder: BatchEncoder::new(1),
      from_node: None,
      reader: None,
      checkpoints,
      writer: None,
      input_done: false,
      nested_done: false,
    }
  }

  /// `[input-port ->] stage -> output-port`, everything local to the node.
  fn remote_definition(&self, name: &str, has_input: bool, parameters: &Parameters) -> PipelineDefinition {
    let mut stage = self.definition.clone();
    stage.node = None;
    stage.copies = 1;
    stage.distribution = Distribution::RoundRobin;

    let mut definition = PipelineDefinition::new(name);
    definition.parameters = parameters
      .iter()
      .map(|(name, value)| ParameterDefinition::new(name).with_default(value))
      .collect();
    if has_input {
      definition.add_stage(
        StageDefinition::new("__input", INPUT_PORT_PLUGIN).with_config(json!({ "port": REMOTE_INPUT_PORT })),
      );
    }
    let stage_name = stage.name.clone();
    definition.add_stage(stage);
    definition.add_stage(
      StageDefinition::new("__output", OUTPUT_PORT_PLUGIN).with_config(json!({ "port": REMOTE_OUTPUT_PORT })),
    );
    if has_input {
      definition = definition.link("__input", &stage_name);
    }
    definition.link(&stage_name, "__output")
  }

  fn transport_error(&self, message: impl std::fmt::Display) -> FlowError {
    FlowError::transport(&self.node, message)
  }

  async fn connect(&self, timeout: Duration) -> FlowResult<TcpStream> {
    match tokio::time::timeout(timeout, TcpStream::connect(&self.address)).await {
      Ok(Ok(stream)) => {
        stream.set_nodelay(true)?;
        Ok(stream)
      }
      Ok(Err(e)) => Err(self.transport_error(format!("cannot connect to {}: {}", self.address, e))),
      Err(_) => Err(self.transport_error(format!("connect to {} timed out after {:?}", self.address, timeout))),
    }
  }

  fn stop_feeding(&mut self) {
    self.input_done = true;
    self.outgoing.clear();
  }

  /// Stops the remote run over a control connection of its own.
  ///
  /// The data connection may be backed up with batches the node cannot accept
  /// yet, so an in-band `Stop` could sit behind them indefinitely.
  async fn cancel_remote(&self) {
    match tokio::time::timeout(self.bind_timeout, self.request_cancel()).await {
      Ok(Ok(found)) => event!(Level::DEBUG, node = %self.node, run = %self.run_name, found, "Remote run cancelled."),
      Ok(Err(e)) => event!(Level::WARN, node = %self.node, error = %e, "Could not cancel the remote run."),
      Err(_) => event!(Level::WARN, node = %self.node, "Cancel was not confirmed in time."),
    }
  }

  async fn request_cancel(&self) -> FlowResult<bool> {
    let stream = self.connect(self.connect_timeout).await?;
    let (read_half, write_half) = stream.into_split();
    let mut reader = FrameReader::new(read_half, self.node.clone(), self.max_frame_bytes);
    let mut writer = FrameWriter::new(write_half, self.node.clone(), self.max_frame_bytes);
    writer.send(&Frame::Cancel { run_id: self.run_id }).await?;
    match reader.next().await? {
      Some(Frame::Cancelled { found }) => Ok(found),
      Some(other) => Err(self.transport_error(format!("expected cancelled, got {} frame", other.name()))),
      None => Err(self.transport_error("connection closed before the cancel was confirmed")),
    }
  }

  fn forward_checkpoint(&self, ctx: &StageContext, mut checkpoint: Checkpoint) {
    // The node also reports its port stages; only the wrapped stage is ours.
    if checkpoint.stage != ctx.stage_name() {
      return;
    }
    checkpoint.copy = ctx.id().copy;
    ctx.forward_checkpoint(&checkpoint);
  }

  async fn finish(&mut self, ctx: &mut StageContext, stopping: bool) -> FlowResult<StageControl> {
    self.stop_feeding();
    if stopping {
      // Nobody reads the node's rows any more; keep the reader from parking on a full queue.
      if let Some(from) = &self.from_node {
        from.drain();
      }
      if self.reader.is_some() {
        self.cancel_remote().await;
      }
      if let Some(writer) = self.writer.take() {
        writer.abort();
      }
    }
    let Some(reader) = self.reader.take() else {
      return Ok(StageControl::Done);
    };

    let outcome = if stopping {
      match tokio::time::timeout(self.bind_timeout, reader).await {
        Ok(joined) => joined,
        Err(_) => {
          event!(Level::WARN, node = %self.node, "Node did not confirm the stop in time.");
          return Ok(StageControl::Done);
        }
      }
    } else {
      reader.await
    };
    while let Ok(checkpoint) = self.checkpoints.try_recv() {
      self.forward_checkpoint(ctx, checkpoint);
    }

    match outcome {
      Ok(ReaderOutcome::Finished(result)) => {
        let failure = (result.status == RunStatus::Errored).then(|| {
          result.first_error.clone().unwrap_or_else(|| ErrorDetail {
            stage: self.definition.name.clone(),
            copy: ctx.id().copy,
            kind: ErrorKind::Run,
            message: "remote run failed".to_string(),
          })
        });
        event!(Level::DEBUG, node = %self.node, status = ?result.status, "Remote run finished.");
        ctx.attach_nested(NestedResult {
          stage: ctx.stage_name().to_string(),
          copy: ctx.id().copy,
          node: Some(self.node.clone()),
          result,
        });
        match failure {
          Some(detail) => Err(FlowError::Remote {
            node: self.node.clone(),
            detail,
          }),
          None => Ok(StageControl::Done),
        }
      }
      Ok(ReaderOutcome::Failed(message)) if stopping => {
        event!(Level::DEBUG, node = %self.node, %message, "Connection ended while stopping.");
        Ok(StageControl::Done)
      }
      Ok(ReaderOutcome::Failed(message)) => Err(self.transport_error(message)),
      Err(join_error) => Err(self.transport_error(format!("reader task failed: {}", join_error))),
    }
  }
}

async fn run_writer(mut writer: FrameWriter<OwnedWriteHalf>, mut outbox: mpsc::Receiver<Frame>) -> FlowResult<()> {
  while let Some(frame) = outbox.recv().await {
    writer.send(&frame).await?;
  }
  Ok(())
}

async fn run_reader(
  mut reader: FrameReader<OwnedReadHalf>,
  queue: Arc<RowQueue>,
  checkpoints: mpsc::UnboundedSender<Checkpoint>,
  node: String,
) -> ReaderOutcome {
  let mut decoder = BatchDecoder::new();
  let outcome = loop {
    let frame = match reader.next().await {
      Ok(Some(frame)) => frame,
      Ok(None) => break ReaderOutcome::Failed("connection closed before the remote run finished".to_string()),
      Err(e) => break ReaderOutcome::Failed(e.to_string()),
    };
    match frame {
      Frame::Schema { version, schema } => decoder.set_schema(version, schema),
      Frame::Batch { version, rows } => match decoder.decode(&node, version, rows) {
        Ok(rows) => {
          for row in rows {
            // A drained queue swallows rows; keep reading until Finished.
            if queue.put(row).await.is_err() {
              break;
            }
          }
        }
        Err(e) => break ReaderOutcome::Failed(e.to_string()),
      },
      Frame::EndOfStream => queue.close(),
      Frame::Checkpoint { checkpoint } => {
        event!(
          Level::INFO,
          node = %node,
          stage = %checkpoint.stage,
          rows_read = checkpoint.rows_read,
          rows_written = checkpoint.rows_written,
          "Remote checkpoint."
        );
        let _ = checkpoints.send(checkpoint);
      }
      Frame::Finished { result } => break ReaderOutcome::Finished(result),
      other => break ReaderOutcome::Failed(format!("unexpected {} frame", other.name())),
    }
  };
  queue.close();
  outcome
}

#[async_trait]
impl Stage for RemoteStage {
  async fn initialize(&mut self, init: &InitContext) -> FlowResult<Schema> {
    let config = init.engine().config().clone();
    let has_input = init.input_schema().is_some();
    self.run_name = format!("{}.{}@{}", init.pipeline_name(), init.copy(), self.node);
    self.bind_timeout = config.bind_timeout();
    self.connect_timeout = config.connect_timeout();
    self.max_frame_bytes = config.max_frame_bytes;
    self.encoder = BatchEncoder::new(config.transport_batch_size);

    let stream = self.connect(config.connect_timeout()).await?;
    let (read_half, write_half) = stream.into_split();
    let mut reader = FrameReader::new(read_half, self.node.clone(), config.max_frame_bytes);
    let mut writer = FrameWriter::new(write_half, self.node.clone(), config.max_frame_bytes);

    writer
      .send(&Frame::Submit {
        run: self.run_name.clone(),
        definition: self.remote_definition(&self.run_name, has_input, init.parameters()),
        input_port: has_input.then(|| REMOTE_INPUT_PORT.to_string()),
        input_schema: init.input_schema().map(|s| s.as_ref().clone()),
        output_port: Some(REMOTE_OUTPUT_PORT.to_string()),
      })
      .await?;

    let answer = tokio::time::timeout(self.bind_timeout, reader.next())
      .await
      .map_err(|_| FlowError::BindTimeout {
        port: format!("{}@{}", REMOTE_INPUT_PORT, self.node),
        timeout: self.bind_timeout,
      })??;
    let output_schema = match answer {
      Some(Frame::Accepted { output_schema, run_id }) => {
        self.run_id = run_id;
        output_schema.unwrap_or_default()
      }
      Some(Frame::Rejected { message }) => {
        return Err(FlowError::Remote {
          node: self.node.clone(),
          detail: ErrorDetail {
            stage: self.definition.name.clone(),
            copy: init.copy().copy,
            kind: ErrorKind::Initialization,
            message,
          },
        })
      }
      Some(other) => return Err(self.transport_error(format!("expected accepted, got {} frame", other.name()))),
      None => return Err(self.transport_error("connection closed during the handshake")),
    };
    event!(Level::DEBUG, node = %self.node, run = %self.run_name, "Remote run accepted.");

    let queue = Arc::new(RowQueue::new(
      format!("{} -> {}", self.node, init.copy()),
      config.queue_capacity,
      RunSignal::new(),
    ));
    let (outbox, outbox_rx) = mpsc::channel(OUTBOX_FRAMES);
    let (checkpoints_tx, checkpoints) = mpsc::unbounded_channel();
    self.checkpoints = checkpoints;
    self.reader = Some(tokio::spawn(run_reader(
      reader,
      queue.clone(),
      checkpoints_tx,
      self.node.clone(),
    )));
    self.writer = Some(tokio::spawn(run_writer(writer, outbox_rx)));
    self.outbox = Some(outbox);
    self.from_node = Some(queue);
    self.input_done = !has_input;
    self.nested_done = false;
    Ok(output_schema)
  }

  async fn process_once(&mut self, ctx: &mut StageContext) -> FlowResult<StageControl> {
    let want_nested = !self.nested_done;
    let want_send = !self.outgoing.is_empty();
    let want_parent = !self.input_done && !want_send;
    if !want_nested && !want_send && !want_parent {
      return self.finish(ctx, false).await;
    }

    let (Some(outbox), Some(from)) = (self.outbox.clone(), self.from_node.clone()) else {
      return Err(FlowError::Internal(format!("remote stage on '{}' used before initialize", self.node)));
    };
    let stop = ctx.stop_signal();
    let event = tokio::select! {
      row = from.get(), if want_nested => Event::FromNode(row),
      permit = outbox.reserve(), if want_send => Event::Permit(permit),
      row = ctx.get_row(), if want_parent => Event::FromParent(row),
      Some(checkpoint) = self.checkpoints.recv() => Event::Checkpoint(checkpoint),
      _ = stop.stopped() => Event::Stopped,
    };

    match event {
      Event::FromNode(Some(row)) => ctx.emit_row(row).await?,
      Event::FromNode(None) => {
        self.nested_done = true;
        self.stop_feeding();
      }
      Event::Permit(Ok(permit)) => {
        if let Some(frame) = self.outgoing.pop_front() {
          permit.send(frame);
        }
      }
      Event::Permit(Err(_)) => {
        let writer_error = match self.writer.take() {
          Some(writer) => match writer.await {
            Ok(Err(e)) => e.to_string(),
            _ => "writer stopped".to_string(),
          },
          None => "writer stopped".to_string(),
        };
        return Err(self.transport_error(writer_error));
      }
      Event::FromParent(Some(row)) => {
        self.outgoing.extend(self.encoder.push(row));
        if !ctx.input_pending() {
          self.outgoing.extend(self.encoder.flush());
        }
      }
      Event::FromParent(None) => {
        self.input_done = true;
        self.outgoing.extend(self.encoder.flush());
        self.outgoing.push_back(Frame::EndOfStream);
      }
      Event::Checkpoint(checkpoint) => self.forward_checkpoint(ctx, checkpoint),
      Event::Stopped => return self.finish(ctx, true).await,
    }
    Ok(StageControl::Continue)
  }

  async fn dispose(&mut self) {
    self.outbox = None;
    if let Some(queue) = self.from_node.take() {
      queue.drain();
    }
    // A reader still running means the remote run never reported back.
    if let Some(reader) = self.reader.take() {
      self.cancel_remote().await;
      reader.abort();
    }
    if let Some(writer) = self.writer.take() {
      writer.abort();
    }
  }
}
