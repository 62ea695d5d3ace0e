//! Journal writer
//!
//! The single producer of journal entries. It runs only while the node is
//! leader: proposals arrive on a bounded queue, are validated against the
//! live state, sequenced in arrival order and appended in batches. Each
//! entry is applied to the store right after its batch is durable, and the
//! submitter is answered only then.
//!
//! A batch is cut early when a proposal reads state an earlier proposal in
//! the same batch writes; that proposal is validated again once the batch
//! has been applied. Validation before sequencing therefore always sees the
//! state the entry will be applied to.
//!
//! If an append fails the writer answers the batch with the failure, turns
//! every queued proposal away and reports to the coordinator, which takes
//! the node out of leadership. A writer never outlives its epoch.

use super::{JournalEntry, JournalStore};
use crate::metric_definitions::{WRITER_BATCH_SIZE, WRITER_REJECTED};
use crate::role::NodeEvent;
use crate::state::{EntityKey, MetadataStore, Operation};
use bytes::Bytes;
use meridian_common::config::JournalConfig;
use meridian_common::{ClusterRole, Epoch, Error, Result, SequenceId, now_millis};
use metrics::{counter, histogram};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// A caller's operation waiting to be sequenced
pub(crate) struct Proposal {
    pub op: Operation,
    pub request_id: String,
    pub reply: oneshot::Sender<Result<SequenceId>>,
}

enum Command {
    Propose(Proposal),
    /// Answered once everything queued before it is durable and applied
    Flush(oneshot::Sender<SequenceId>),
}

enum Failure {
    Append(Error),
    Apply(Error),
}

/// Cloneable submission side of a running writer
#[derive(Clone)]
pub(crate) struct WriterClient {
    tx: mpsc::Sender<Command>,
}

fn writer_closed() -> Error {
    Error::Unavailable("journal writer is closed".into())
}

impl WriterClient {
    /// Queue an operation and wait until it is durable and applied
    pub async fn propose(&self, op: Operation, request_id: String) -> Result<SequenceId> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Propose(Proposal {
                op,
                request_id,
                reply,
            }))
            .await
            .map_err(|_| writer_closed())?;
        rx.await.map_err(|_| writer_closed())?
    }

    /// Wait until everything queued so far is durable and applied
    pub async fn flush(&self) -> Result<SequenceId> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Flush(reply))
            .await
            .map_err(|_| writer_closed())?;
        rx.await.map_err(|_| writer_closed())
    }
}

/// Owner's handle on a running writer
pub struct WriterHandle {
    client: WriterClient,
    epoch: Epoch,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl WriterHandle {
    pub(crate) fn client(&self) -> WriterClient {
        self.client.clone()
    }

    /// Epoch the writer appends with
    #[must_use]
    pub const fn epoch(&self) -> Epoch {
        self.epoch
    }

    /// Stop accepting proposals, finish the batch in flight and wait for
    /// the task to end. Queued proposals are turned away.
    pub async fn close(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            warn!("Journal writer task ended abnormally: {}", e);
        }
    }
}

struct Pending {
    proposal: Proposal,
    op_code: u32,
    body: Bytes,
}

#[derive(Default)]
struct Batch {
    pending: Vec<Pending>,
    writes: BTreeSet<EntityKey>,
    flushes: Vec<oneshot::Sender<SequenceId>>,
    closed: bool,
}

/// Sequences, persists and applies proposals for one leader epoch
pub struct JournalWriter {
    journal: Arc<dyn JournalStore>,
    store: Arc<MetadataStore>,
    config: JournalConfig,
    epoch: Epoch,
    next_sequence: SequenceId,
    last_created_at: u64,
    events: mpsc::UnboundedSender<NodeEvent>,
}

impl JournalWriter {
    /// Start a writer continuing the journal at `last_sequence() + 1`.
    ///
    /// The caller must have applied every durable entry first.
    pub(crate) fn spawn(
        journal: Arc<dyn JournalStore>,
        store: Arc<MetadataStore>,
        config: JournalConfig,
        epoch: Epoch,
        events: mpsc::UnboundedSender<NodeEvent>,
    ) -> WriterHandle {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let next_sequence = journal.last_sequence() + 1;

        info!(
            "Starting journal writer for epoch {} at sequence {}",
            epoch, next_sequence
        );
        let writer = Self {
            journal,
            store,
            config,
            epoch,
            next_sequence,
            last_created_at: 0,
            events,
        };
        let task = tokio::spawn(writer.run(rx, shutdown_rx));

        WriterHandle {
            client: WriterClient { tx },
            epoch,
            shutdown,
            task,
        }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<Command>, mut shutdown: watch::Receiver<bool>) {
        let mut carry: Option<Command> = None;
        let max_entries = self.config.max_batch_entries.max(1);
        let window = self.config.batch_window();

        loop {
            let first = match carry.take() {
                Some(cmd) => cmd,
                None => tokio::select! {
                    biased;
                    _ = shutdown.changed() => break,
                    cmd = rx.recv() => match cmd {
                        Some(cmd) => cmd,
                        None => break,
                    },
                },
            };

            let mut batch = Batch::default();
            carry = self.admit(first, &mut batch);

            let deadline = Instant::now() + window;
            while carry.is_none() && !batch.closed && batch.pending.len() < max_entries {
                let cmd = match rx.try_recv() {
                    Ok(cmd) => cmd,
                    Err(TryRecvError::Empty) if !window.is_zero() && !batch.pending.is_empty() => {
                        match tokio::time::timeout_at(deadline, rx.recv()).await {
                            Ok(Some(cmd)) => cmd,
                            Ok(None) | Err(_) => break,
                        }
                    }
                    Err(_) => break,
                };
                carry = self.admit(cmd, &mut batch);
            }

            match self.commit(batch).await {
                Ok(()) => {}
                Err(Failure::Append(error)) => {
                    self.turn_away(rx, carry).await;
                    let _ = self.events.send(NodeEvent::StepDown {
                        epoch: self.epoch,
                        error,
                    });
                    return;
                }
                Err(Failure::Apply(error)) => {
                    self.turn_away(rx, carry).await;
                    let _ = self.events.send(NodeEvent::Halt { error });
                    return;
                }
            }
        }

        self.turn_away(rx, carry).await;
        info!("Journal writer for epoch {} stopped", self.epoch);
    }

    /// Add a command to the batch. Returns it back if it has to wait for
    /// the next batch.
    fn admit(&self, cmd: Command, batch: &mut Batch) -> Option<Command> {
        let proposal = match cmd {
            Command::Flush(reply) => {
                batch.flushes.push(reply);
                batch.closed = true;
                return None;
            }
            Command::Propose(proposal) => proposal,
        };

        let footprint = self.store.footprint(&proposal.op);
        if !batch.pending.is_empty() && footprint.conflicts_with(&batch.writes) {
            return Some(Command::Propose(proposal));
        }

        let encoded = self
            .store
            .validate(&proposal.op)
            .and_then(|()| proposal.op.encode());
        match encoded {
            Ok(body) => {
                batch.writes.extend(footprint.writes);
                batch.pending.push(Pending {
                    op_code: proposal.op.op_code().as_u32(),
                    body: Bytes::from(body),
                    proposal,
                });
            }
            Err(e) => {
                debug!("Rejected request {}: {}", proposal.request_id, e);
                counter!(WRITER_REJECTED).increment(1);
                let _ = proposal.reply.send(Err(e));
            }
        }
        None
    }

    async fn commit(&mut self, batch: Batch) -> std::result::Result<(), Failure> {
        let Batch {
            pending, flushes, ..
        } = batch;

        if !pending.is_empty() {
            // Timestamps never go backwards within a term
            let created_at = now_millis().max(self.last_created_at);
            let first = self.next_sequence;
            let entries: Vec<JournalEntry> = pending
                .iter()
                .zip(first..)
                .map(|(p, sequence_id)| JournalEntry {
                    sequence_id,
                    op_code: p.op_code,
                    created_at,
                    payload: p.body.clone(),
                })
                .collect();

            let journal = Arc::clone(&self.journal);
            let epoch = self.epoch;
            let to_append = entries.clone();
            let appended = tokio::task::spawn_blocking(move || journal.append(epoch, &to_append))
                .await
                .map_err(|e| Error::internal(format!("journal append task failed: {e}")))
                .and_then(|r| r);

            if let Err(e) = appended {
                error!(
                    "Journal append at {} failed in epoch {}: {}",
                    first, self.epoch, e
                );
                let reason = e.to_string();
                for p in pending {
                    let _ = p.proposal.reply.send(Err(Error::durability(first, &reason)));
                }
                return Err(Failure::Append(e));
            }

            self.next_sequence = first + entries.len() as u64;
            self.last_created_at = created_at;
            #[allow(clippy::cast_precision_loss)]
            histogram!(WRITER_BATCH_SIZE).record(entries.len() as f64);

            let mut pending = pending.into_iter();
            for entry in &entries {
                let Some(p) = pending.next() else { break };
                if let Err(e) = self.store.apply(entry) {
                    error!(
                        "Durable entry {} could not be applied: {}",
                        entry.sequence_id, e
                    );
                    let reason = e.to_string();
                    let _ = p.proposal.reply.send(Err(Error::Halted(reason.clone())));
                    for rest in pending {
                        let _ = rest.proposal.reply.send(Err(Error::Halted(reason.clone())));
                    }
                    return Err(Failure::Apply(e));
                }
                debug!(
                    "Request {} committed as {}",
                    p.proposal.request_id, entry.sequence_id
                );
                let _ = p.proposal.reply.send(Ok(entry.sequence_id));
            }
        }

        let durable = self.next_sequence - 1;
        for flush in flushes {
            let _ = flush.send(durable);
        }
        Ok(())
    }

    /// Refuse everything still queued
    async fn turn_away(&self, mut rx: mpsc::Receiver<Command>, carry: Option<Command>) {
        rx.close();
        let refuse = |cmd: Command| {
            if let Command::Propose(p) = cmd {
                let _ = p.reply.send(Err(Error::NotLeader {
                    role: ClusterRole::Unknown,
                    leader: None,
                    last_applied: self.store.last_applied(),
                }));
            }
        };
        if let Some(cmd) = carry {
            refuse(cmd);
        }
        while let Some(cmd) = rx.recv().await {
            refuse(cmd);
        }
    }
}
