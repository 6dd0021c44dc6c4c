// rowflow/src/transport/node.rs

//! The worker side of remote execution.
//!
//! A `NodeServer` accepts supervisor connections. Each connection submits one
//! pipeline, which runs as an independent run with its own port scope; its input
//! and output ports are bound to queues fed from and drained into the connection.

use crate::boundary::ports::PortBinding;
use crate::core::context::EngineContext;
use crate::core::queue::{PutOutcome, RowQueue};
use crate::core::row::Row;
use crate::error::{ErrorDetail, ErrorKind, FlowError, FlowResult};
use crate::pipeline::hooks::RunHooks;
use crate::pipeline::runner::{RunController, RunHandle, Runner};
use crate::stage::metrics::Checkpoint;
use crate::transport::frame::{BatchDecoder, BatchEncoder, Frame, FrameReader, FrameWriter};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{event, instrument, Instrument, Level};

/// Accepts supervisor connections and runs the pipelines they submit.
pub struct NodeServer {
  listener: TcpListener,
  engine: EngineContext,
  runs: Arc<ActiveRuns>,
}

/// Runs accepted by this node and not yet finished, by the id sent in `Accepted`.
#[derive(Default)]
struct ActiveRuns {
  next_id: AtomicU64,
  controllers: Mutex<HashMap<u64, RunController>>,
}

impl ActiveRuns {
  fn register(&self, controller: RunController) -> u64 {
    let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
    self.controllers.lock().insert(id, controller);
    id
  }

  fn remove(&self, id: u64) {
    self.controllers.lock().remove(&id);
  }

  fn cancel(&self, id: u64) -> bool {
    let controller = self.controllers.lock().get(&id).cloned();
    match controller {
      Some(controller) => {
        controller.stop();
        true
      }
      None => false,
    }
  }
}

impl NodeServer {
  /// Binds the listener. The engine's registry decides which plugins this node can run.
  pub async fn bind(addr: &str, engine: EngineContext) -> FlowResult<Self> {
    let listener = TcpListener::bind(addr).await?;
    event!(Level::INFO, addr = %listener.local_addr()?, "Node listening.");
    Ok(Self {
      listener,
      engine,
      runs: Arc::new(ActiveRuns::default()),
    })
  }

  pub fn local_addr(&self) -> FlowResult<SocketAddr> {
    Ok(self.listener.local_addr()?)
  }

  /// Accepts connections until the listener fails.
  pub async fn serve(self) -> FlowResult<()> {
    loop {
      let (stream, peer) = match self.listener.accept().await {
        Ok(accepted) => accepted,
        Err(e) => {
          event!(Level::WARN, error = %e, "Failed to accept connection.");
          continue;
        }
      };
      let engine = self.engine.clone();
      let runs = self.runs.clone();
      let span = tracing::info_span!("node_connection", peer = %peer);
      tokio::spawn(
        async move {
          if let Err(e) = handle_connection(stream, peer, engine, runs).await {
            event!(Level::WARN, error = %e, "Connection ended with an error.");
          }
        }
        .instrument(span),
      );
    }
  }

  /// Serves in a background task.
  pub fn spawn(self) -> FlowResult<NodeHandle> {
    let addr = self.local_addr()?;
    let task = tokio::spawn(self.serve());
    Ok(NodeHandle { addr, task })
  }
}

/// A node served in the background.
#[derive(Debug)]
pub struct NodeHandle {
  addr: SocketAddr,
  task: JoinHandle<FlowResult<()>>,
}

impl NodeHandle {
  pub fn local_addr(&self) -> SocketAddr {
    self.addr
  }

  /// Stops accepting connections. Runs already submitted keep going until their
  /// connection ends.
  pub fn shutdown(self) {
    self.task.abort();
  }
}

struct Submission {
  run: String,
  output_port: Option<String>,
  handle: RunHandle,
  input: Option<Arc<RowQueue>>,
  output: Option<Arc<RowQueue>>,
}

/// Builds, binds and starts a submitted pipeline.
async fn start_submission(engine: &EngineContext, frame: Frame, hooks: RunHooks) -> FlowResult<Submission> {
  let Frame::Submit {
    run,
    definition,
    input_port,
    input_schema,
    output_port,
  } = frame
  else {
    return Err(FlowError::Internal(format!("expected submit, got {} frame", frame.name())));
  };

  let scope = engine.scoped();
  let runner = Runner::new(scope.clone()).with_hooks(hooks);
  let graph = runner.build(&definition)?;
  let capacity = scope.config().queue_capacity;

  let input = match input_port {
    Some(port) => {
      let queue = Arc::new(RowQueue::new(
        format!("{} -> {}:{}", run, definition.name, port),
        capacity,
        graph.signal().clone(),
      ));
      let mut binding = PortBinding::new(queue.clone(), run.clone());
      if let Some(schema) = input_schema {
        binding = binding.with_schema(Arc::new(schema));
      }
      scope.ports().bind_input(&port, binding)?;
      Some(queue)
    }
    None => None,
  };
  let output = match &output_port {
    Some(port) => {
      let queue = Arc::new(RowQueue::new(
        format!("{}:{} -> {}", definition.name, port, run),
        capacity,
        graph.signal().clone(),
      ));
      scope.ports().bind_output(port, PortBinding::new(queue.clone(), run.clone()))?;
      Some(queue)
    }
    None => None,
  };

  let handle = runner.start(graph).await?;
  Ok(Submission {
    run,
    output_port,
    handle,
    input,
    output,
  })
}

#[instrument(name = "NodeServer::connection", skip_all, fields(peer = %peer), err(Display))]
async fn handle_connection(
  stream: TcpStream,
  peer: SocketAddr,
  engine: EngineContext,
  runs: Arc<ActiveRuns>,
) -> FlowResult<()> {
  stream.set_nodelay(true)?;
  let max_frame_bytes = engine.config().max_frame_bytes;
  let batch_size = engine.config().transport_batch_size;
  let peer_name = peer.to_string();
  let (read_half, write_half) = stream.into_split();
  let mut reader = FrameReader::new(read_half, peer_name.clone(), max_frame_bytes);
  let mut writer = FrameWriter::new(write_half, peer_name.clone(), max_frame_bytes);

  let first = match reader.next().await? {
    Some(Frame::Cancel { run_id }) => {
      let found = runs.cancel(run_id);
      event!(Level::INFO, run_id, found, "Supervisor cancelled a run.");
      return writer.send(&Frame::Cancelled { found }).await;
    }
    Some(first) => first,
    None => {
      event!(Level::DEBUG, "Peer closed before submitting.");
      return Ok(());
    }
  };

  let (checkpoints_tx, mut checkpoints) = mpsc::unbounded_channel::<Checkpoint>();
  let hooks = RunHooks::new().on_checkpoint(move |checkpoint| {
    let _ = checkpoints_tx.send(checkpoint.clone());
  });

  let submission = match start_submission(&engine, first, hooks).await {
    Ok(submission) => submission,
    Err(e) => {
      event!(Level::WARN, error = %e, "Submission rejected.");
      writer.send(&Frame::Rejected { message: e.to_string() }).await?;
      return Ok(());
    }
  };
  let Submission {
    run,
    output_port,
    handle,
    input,
    output,
  } = submission;

  let controller = handle.controller();
  let run_id = runs.register(controller.clone());
  event!(Level::INFO, run = %run, run_id, "Submission accepted.");

  let output_schema = output_port
    .as_deref()
    .and_then(|port| handle.output_port_schema(port))
    .map(|s| s.as_ref().clone());
  if let Err(e) = writer.send(&Frame::Accepted { output_schema, run_id }).await {
    controller.stop();
    let _ = handle.wait_done().await;
    runs.remove(run_id);
    return Err(e);
  }

  let inbound = tokio::spawn(read_inbound(reader, input, controller.clone(), run.clone()).in_current_span());

  let mut encoder = BatchEncoder::new(batch_size);
  let pumped = pump_outbound(&mut writer, &mut encoder, output.as_ref(), &mut checkpoints).await;
  if let Err(e) = &pumped {
    event!(Level::WARN, error = %e, "Lost the supervisor while streaming results.");
    controller.fail_if_running(ErrorDetail {
      stage: run.clone(),
      copy: 0,
      kind: ErrorKind::Transport,
      message: e.to_string(),
    });
  }

  let result = handle.wait_done().await;
  runs.remove(run_id);
  inbound.abort();
  event!(Level::INFO, run = %run, status = ?result.status, "Submitted run finished.");
  if pumped.is_ok() {
    // The supervisor may already have hung up after cancelling.
    if let Err(e) = writer.send(&Frame::Finished { result }).await {
      event!(Level::DEBUG, error = %e, "Supervisor gone before the final frame.");
    }
  }
  pumped
}

/// Streams the run's output rows and checkpoints to the supervisor.
async fn pump_outbound(
  writer: &mut FrameWriter<OwnedWriteHalf>,
  encoder: &mut BatchEncoder,
  output: Option<&Arc<RowQueue>>,
  checkpoints: &mut mpsc::UnboundedReceiver<Checkpoint>,
) -> FlowResult<()> {
  let Some(output) = output else {
    return Ok(());
  };
  loop {
    let row: Option<Row> = tokio::select! {
      row = output.get() => row,
      Some(checkpoint) = checkpoints.recv() => {
        writer.send(&Frame::Checkpoint { checkpoint }).await?;
        continue;
      }
    };
    match row {
      Some(row) => {
        for frame in encoder.push(row) {
          writer.send(&frame).await?;
        }
        if output.is_empty() {
          if let Some(frame) = encoder.flush() {
            writer.send(&frame).await?;
          }
        }
      }
      None => {
        if let Some(frame) = encoder.flush() {
          writer.send(&frame).await?;
        }
        while let Ok(checkpoint) = checkpoints.try_recv() {
          writer.send(&Frame::Checkpoint { checkpoint }).await?;
        }
        writer.send(&Frame::EndOfStream).await?;
        return Ok(());
      }
    }
  }
}

/// Feeds rows from the supervisor into the run and honours `Stop`.
async fn read_inbound(
  mut reader: FrameReader<OwnedReadHalf>,
  input: Option<Arc<RowQueue>>,
  controller: RunController,
  run: String,
) {
  let mut decoder = BatchDecoder::new();
  let mut ended = input.is_none();
  loop {
    let frame = match reader.next().await {
      Ok(Some(frame)) => frame,
      Ok(None) if ended => return,
      Ok(None) => {
        controller.fail_if_running(ErrorDetail {
          stage: run,
          copy: 0,
          kind: ErrorKind::Transport,
          message: format!("supervisor {} disconnected mid-stream", reader.peer()),
        });
        return;
      }
      Err(e) => {
        controller.fail_if_running(ErrorDetail {
          stage: run,
          copy: 0,
          kind: ErrorKind::Transport,
          message: e.to_string(),
        });
        return;
      }
    };
    match frame {
      Frame::Schema { version, schema } => decoder.set_schema(version, schema),
      Frame::Batch { version, rows } => {
        let Some(queue) = &input else {
          continue;
        };
        let rows = match decoder.decode(reader.peer(), version, rows) {
          Ok(rows) => rows,
          Err(e) => {
            controller.fail(ErrorDetail::new(run.clone(), 0, &e));
            return;
          }
        };
        for row in rows {
          match queue.put(row).await {
            Ok(PutOutcome::Accepted) => {}
            Ok(PutOutcome::Closed) => break,
            Err(e) => {
              controller.fail(ErrorDetail::new(run.clone(), 0, &e));
              return;
            }
          }
        }
      }
      Frame::EndOfStream => {
        ended = true;
        if let Some(queue) = &input {
          queue.close();
        }
      }
      Frame::Stop => {
        event!(Level::INFO, run = %run, "Supervisor requested stop.");
        controller.stop();
      }
      other => event!(Level::WARN, frame = other.name(), "Ignoring unexpected frame."),
    }
  }
}
