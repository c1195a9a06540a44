//! Worker threads of the parallel trainer.
//!
//! Each worker is a named OS thread owning one private replica. The replica
//! is built inside the thread from a `Send` descriptor, so models (which hold
//! single-threaded arenas) never cross threads. Requests arrive over a
//! `crossbeam_channel`; each carries a `tokio::sync::oneshot` sender for the
//! reply. A worker serves one request at a time: a request sent while the
//! previous one is still in flight (e.g. after a cancelled group) is rejected
//! with [`Error::WorkerBusy`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, trace, warn};
use tokio::sync::oneshot;

use super::Replica;
use crate::error::{Error, Result};
use crate::model::{BatchDeltas, LayerParameters};

/// Work units understood by a worker.
pub(crate) enum Request<D> {
    /// Build the replica from a descriptor
    InitModel(D),
    /// Overwrite replica weights and biases
    SyncWeights(Arc<Vec<LayerParameters>>),
    /// Accumulate deltas for the sub-batch starting at batch position
    /// `offset`, without updating weights
    TrainBatch {
        offset: usize,
        inputs: Vec<Vec<f64>>,
        expecteds: Vec<Vec<f64>>,
    },
    BeforeTrain,
    AfterTrain,
    Compute(Vec<Vec<f64>>),
    /// Drop the replica and stop the thread
    Terminate,
}

impl<D> Request<D> {
    pub(crate) fn tag(&self) -> &'static str {
        match self {
            Request::InitModel(_) => "initModel",
            Request::SyncWeights(_) => "syncWeights",
            Request::TrainBatch { .. } => "trainBatch",
            Request::BeforeTrain => "beforeTrain",
            Request::AfterTrain => "afterTrain",
            Request::Compute(_) => "compute",
            Request::Terminate => "terminate",
        }
    }
}

#[derive(Debug)]
pub(crate) enum Reply {
    Ready,
    Deltas(BatchDeltas),
    Outputs(Vec<Vec<f64>>),
}

struct Envelope<D> {
    request: Request<D>,
    reply: oneshot::Sender<Result<Reply>>,
}

/// Coordinator-side handle of one worker thread.
pub(crate) struct WorkerHandle<D> {
    id: usize,
    sender: Option<Sender<Envelope<D>>>,
    busy: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl<D: Send + 'static> WorkerHandle<D> {
    /// Start worker `id` serving replicas of type `M`.
    pub(crate) fn spawn<M>(id: usize) -> Result<Self>
    where
        M: Replica<Descriptor = D> + 'static,
    {
        let (sender, receiver) = unbounded();
        let busy = Arc::new(AtomicBool::new(false));
        let worker_busy = Arc::clone(&busy);
        let thread = thread::Builder::new()
            .name(format!("zen-dense-worker-{}", id))
            .spawn(move || run::<M>(id, receiver, worker_busy))
            .map_err(|e| Error::WorkerFailed {
                worker: id,
                message: format!("failed to spawn thread: {}", e),
            })?;
        Ok(Self {
            id,
            sender: Some(sender),
            busy,
            thread: Some(thread),
        })
    }

    pub(crate) fn id(&self) -> usize {
        self.id
    }

    /// Send one request and wait for its reply.
    ///
    /// Errors raised by the replica come back as [`Error::WorkerFailed`];
    /// a worker that died without answering yields [`Error::WorkerCrashed`].
    pub(crate) async fn request(&self, request: Request<D>) -> Result<Reply> {
        let worker = self.id;
        let Some(sender) = &self.sender else {
            return Err(Error::WorkerCrashed { worker });
        };
        if self.busy.swap(true, Ordering::AcqRel) {
            return Err(Error::WorkerBusy { worker });
        }
        trace!("worker {} <- {}", worker, request.tag());

        let (reply, response) = oneshot::channel();
        if sender.send(Envelope { request, reply }).is_err() {
            self.busy.store(false, Ordering::Release);
            return Err(Error::WorkerCrashed { worker });
        }
        match response.await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(err)) => Err(Error::WorkerFailed {
                worker,
                message: err.to_string(),
            }),
            Err(_) => Err(Error::WorkerCrashed { worker }),
        }
    }

    /// Close the request channel and wait for the thread to exit.
    ///
    /// A worker still busy with a request finishes it first.
    pub(crate) fn join(&mut self) {
        self.sender = None;
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("worker {} panicked", self.id);
            }
        }
    }
}

fn run<M: Replica>(id: usize, receiver: Receiver<Envelope<M::Descriptor>>, busy: Arc<AtomicBool>) {
    debug!("worker {} started", id);
    let mut replica: Option<M> = None;
    while let Ok(Envelope { request, reply }) = receiver.recv() {
        let terminate = matches!(request, Request::Terminate);
        let result = handle(&mut replica, request);
        busy.store(false, Ordering::Release);
        // the coordinator may have given up on this request
        let _ = reply.send(result);
        if terminate {
            break;
        }
    }
    debug!("worker {} stopped", id);
}

fn handle<M: Replica>(replica: &mut Option<M>, request: Request<M::Descriptor>) -> Result<Reply> {
    match request {
        Request::InitModel(descriptor) => {
            *replica = Some(M::restore(&descriptor)?);
            Ok(Reply::Ready)
        }
        Request::Terminate => {
            *replica = None;
            Ok(Reply::Ready)
        }
        request => {
            let model = replica.as_mut().ok_or(Error::NotInitialized)?;
            match request {
                Request::SyncWeights(parameters) => {
                    model.load_parameters(&parameters)?;
                    Ok(Reply::Ready)
                }
                Request::TrainBatch {
                    offset,
                    inputs,
                    expecteds,
                } => Ok(Reply::Deltas(model.accumulate(offset, &inputs, &expecteds)?)),
                Request::BeforeTrain => {
                    model.before_pass();
                    Ok(Reply::Ready)
                }
                Request::AfterTrain => {
                    model.after_pass();
                    Ok(Reply::Ready)
                }
                Request::Compute(inputs) => {
                    let outputs = inputs
                        .iter()
                        .map(|input| model.compute(input))
                        .collect::<Result<Vec<_>>>()?;
                    Ok(Reply::Outputs(outputs))
                }
                Request::InitModel(_) | Request::Terminate => Ok(Reply::Ready),
            }
        }
    }
}
