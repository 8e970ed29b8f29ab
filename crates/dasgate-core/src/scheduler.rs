//! Bounded-concurrency fetch scheduler.
//!
//! Submitted requests wait in a min-heap ordered by submission time. A single
//! dispatch loop moves newly submitted requests into the heap and starts the
//! oldest one whenever an admission permit is free; the permit travels with the
//! spawned fetch and is released when it finishes. A limit of zero bypasses the
//! queue and spawns every fetch directly.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use crate::fetch::{CounterSnapshot, FetchExecutor, FetchResponse};

/// A fetch waiting for admission, with the channel its response goes to.
#[derive(Debug)]
pub struct FetchRequest {
    pub url: String,
    pub body: Option<String>,
    pub submitted_at: Instant,
    reply: UnboundedSender<FetchResponse>,
}

impl FetchRequest {
    pub fn get(url: impl Into<String>, reply: UnboundedSender<FetchResponse>) -> Self {
        Self {
            url: url.into(),
            body: None,
            submitted_at: Instant::now(),
            reply,
        }
    }

    pub fn post(
        url: impl Into<String>,
        body: impl Into<String>,
        reply: UnboundedSender<FetchResponse>,
    ) -> Self {
        Self {
            body: Some(body.into()),
            ..Self::get(url, reply)
        }
    }
}

struct QueueEntry {
    submitted_at: Instant,
    sequence: u64,
    request: FetchRequest,
}

impl QueueEntry {
    fn key(&self) -> (Instant, u64) {
        (self.submitted_at, self.sequence)
    }
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

pub struct FetchScheduler {
    executor: Arc<FetchExecutor>,
    limit: usize,
    queue: Option<UnboundedSender<FetchRequest>>,
}

impl FetchScheduler {
    /// Starts the dispatch loop. Must be called from within a tokio runtime.
    pub fn start(executor: Arc<FetchExecutor>, limit: usize) -> Self {
        if limit == 0 {
            info!("fetch scheduler running without a concurrency limit");
            return Self {
                executor,
                limit,
                queue: None,
            };
        }

        let (queue, incoming) = mpsc::unbounded_channel();
        let permits = Arc::new(Semaphore::new(limit));
        tokio::spawn(dispatch_loop(executor.clone(), incoming, permits));
        info!(limit, "fetch scheduler started");
        Self {
            executor,
            limit,
            queue: Some(queue),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn executor(&self) -> &Arc<FetchExecutor> {
        &self.executor
    }

    pub fn counters(&self) -> CounterSnapshot {
        self.executor.counters().snapshot()
    }

    /// Hands `request` to the queue; its response arrives on the request's
    /// reply channel.
    pub fn submit(&self, request: FetchRequest) {
        let Some(queue) = &self.queue else {
            spawn_fetch(self.executor.clone(), request, None);
            return;
        };

        self.executor.counters().enqueued();
        if let Err(mpsc::error::SendError(request)) = queue.send(request) {
            self.executor.counters().dequeued();
            warn!(url = %request.url, "dispatch loop has stopped; fetching without admission");
            spawn_fetch(self.executor.clone(), request, None);
        }
    }
}

async fn dispatch_loop(
    executor: Arc<FetchExecutor>,
    mut incoming: UnboundedReceiver<FetchRequest>,
    permits: Arc<Semaphore>,
) {
    let mut heap: BinaryHeap<Reverse<QueueEntry>> = BinaryHeap::new();
    let mut sequence = 0u64;
    let mut accepting = true;

    let mut push = |heap: &mut BinaryHeap<Reverse<QueueEntry>>, request: FetchRequest| {
        sequence += 1;
        heap.push(Reverse(QueueEntry {
            submitted_at: request.submitted_at,
            sequence,
            request,
        }));
    };

    loop {
        if heap.is_empty() {
            if !accepting {
                break;
            }
            match incoming.recv().await {
                Some(request) => push(&mut heap, request),
                None => break,
            }
            continue;
        }

        tokio::select! {
            biased;

            received = incoming.recv(), if accepting => match received {
                Some(request) => push(&mut heap, request),
                None => accepting = false,
            },
            permit = permits.clone().acquire_owned() => match permit {
                Ok(permit) => {
                    if let Some(Reverse(entry)) = heap.pop() {
                        executor.counters().dequeued();
                        spawn_fetch(executor.clone(), entry.request, Some(permit));
                    }
                }
                Err(_) => {
                    warn!(pending = heap.len(), "admission semaphore closed");
                    break;
                }
            },
        }
    }

    debug!("fetch scheduler stopped");
}

fn spawn_fetch(
    executor: Arc<FetchExecutor>,
    request: FetchRequest,
    permit: Option<OwnedSemaphorePermit>,
) {
    let FetchRequest {
        url, body, reply, ..
    } = request;
    tokio::spawn(async move {
        let _permit = permit;
        executor.fetch_into(url, body, reply).await;
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn entry(submitted_at: Instant, sequence: u64) -> Reverse<QueueEntry> {
        let (reply, _) = mpsc::unbounded_channel();
        Reverse(QueueEntry {
            submitted_at,
            sequence,
            request: FetchRequest::get(format!("https://h/{sequence}"), reply),
        })
    }

    #[test]
    fn heap_pops_oldest_submission_first() {
        let base = Instant::now();
        let mut heap = BinaryHeap::new();
        heap.push(entry(base + Duration::from_millis(20), 1));
        heap.push(entry(base, 2));
        heap.push(entry(base + Duration::from_millis(10), 3));

        let order: Vec<u64> = std::iter::from_fn(|| heap.pop().map(|Reverse(e)| e.sequence)).collect();
        assert_eq!(order, vec![2, 3, 1]);
    }

    #[test]
    fn equal_submission_times_fall_back_to_arrival_order() {
        let base = Instant::now();
        let mut heap = BinaryHeap::new();
        heap.push(entry(base, 7));
        heap.push(entry(base, 5));

        assert_eq!(heap.pop().map(|Reverse(e)| e.sequence), Some(5));
    }

    #[test]
    fn post_request_keeps_body() {
        let (reply, _) = mpsc::unbounded_channel();
        let request = FetchRequest::post("https://h/datasetlist", "{}", reply);

        assert_eq!(request.body.as_deref(), Some("{}"));
    }
}
