//! Bringing a node online: find an initial contact, look up the nodes nearest
//! to the local id, resolve id collisions, then refresh every bucket with a
//! pool of workers.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use flume::{Receiver, Sender};
use tracing::{debug, info, trace, warn};

use crate::common::{Contact, Kuid, PurgeMode};
use crate::concurrent::{DhtFuture, DhtTask};
use crate::context::Context;
use crate::manager::{FindNodeManager, PingManager};
use crate::result::{BootstrapResult, BootstrapResultType, FindNodeResult, PingResult};
use crate::{Error, Result};

/// Purge applied when the routing table turns out to be stale.
const STALE_PURGE: [PurgeMode; 4] = [
    PurgeMode::DropCache,
    PurgeMode::PurgeContacts,
    PurgeMode::MergeBuckets,
    PurgeMode::StateToUnknown,
];

/// Purge applied before the final verdict.
const FINAL_PURGE: [PurgeMode; 3] = [
    PurgeMode::DropCache,
    PurgeMode::PurgeContacts,
    PurgeMode::MergeBuckets,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapStatus {
    Bootstrapping,
    /// The routing table was found stale once and purged.
    RetryingBootstrap,
    Finished,
}

/// Where a bootstrap starts from.
#[derive(Debug, Clone)]
pub enum BootstrapSeed {
    Contact(Contact),
    /// Ping these first, the first contact to respond is the seed.
    Addresses(Vec<SocketAddr>),
}

/// Messages from bucket refresh workers to the control loop.
#[derive(Debug)]
enum WorkerReport {
    Refreshed { failures: usize, found_new: bool },
    Exhausted,
}

/// How a round of bucket refreshes ended.
#[derive(Debug, PartialEq, Eq)]
enum RefreshOutcome {
    /// Every bucket was refreshed, or the bootstrap timeout elapsed.
    Done,
    /// Too many failures for the first time.
    Retry,
    /// Too many failures again.
    Terminate,
}

#[derive(Debug)]
/// Shared by the workers of one refresh round.
struct RefreshRound {
    buckets: Receiver<Kuid>,
    deadline: Instant,
    stopped: AtomicBool,
    lookups: Mutex<Vec<DhtFuture<FindNodeResult>>>,
}

impl RefreshRound {
    /// Next bucket id to refresh, `None` once stopped, exhausted or past the
    /// deadline.
    fn next_bucket(&self) -> Option<Kuid> {
        if self.stopped.load(Ordering::SeqCst) || Instant::now() >= self.deadline {
            return None;
        }

        self.buckets.try_recv().ok()
    }

    /// Returns `false` and cancels the lookup if the round is stopped.
    fn track(&self, lookup: &DhtFuture<FindNodeResult>) -> bool {
        let mut lookups = self.lookups.lock().expect("mutex");
        lookups.retain(|lookup| !lookup.is_done());

        if self.stopped.load(Ordering::SeqCst) {
            lookup.cancel();
            return false;
        }

        lookups.push(lookup.clone());
        true
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);

        let lookups: Vec<_> = self.lookups.lock().expect("mutex").drain(..).collect();
        for lookup in lookups {
            lookup.cancel();
        }
    }
}

#[derive(Debug)]
/// A sub-task the control loop is blocked on.
enum Pending {
    Ping(DhtFuture<PingResult>),
    FindNode(DhtFuture<FindNodeResult>),
}

impl Pending {
    fn cancel(&self) {
        match self {
            Pending::Ping(future) => future.cancel(),
            Pending::FindNode(future) => future.cancel(),
        };
    }
}

#[derive(Debug)]
/// The bootstrap state machine, driven by its own control thread.
pub struct BootstrapProcess {
    context: Arc<Context>,
    ping: Arc<PingManager>,
    find_node: Arc<FindNodeManager>,
    seed: BootstrapSeed,
    status: Mutex<BootstrapStatus>,
    cancelled: AtomicBool,
    pending: Mutex<Option<Pending>>,
    round: Mutex<Option<Arc<RefreshRound>>>,
    future: OnceLock<DhtFuture<BootstrapResult>>,
    started: Instant,
}

impl BootstrapProcess {
    pub(crate) fn new(
        context: Arc<Context>,
        ping: Arc<PingManager>,
        find_node: Arc<FindNodeManager>,
        seed: BootstrapSeed,
    ) -> Self {
        BootstrapProcess {
            context,
            ping,
            find_node,
            seed,
            status: Mutex::new(BootstrapStatus::Bootstrapping),
            cancelled: AtomicBool::new(false),
            pending: Mutex::new(None),
            round: Mutex::new(None),
            future: OnceLock::new(),
            started: Instant::now(),
        }
    }

    // === Getters ===

    pub fn status(&self) -> BootstrapStatus {
        *self.status.lock().expect("mutex")
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    // === Private Methods ===

    fn set_status(&self, status: BootstrapStatus) {
        *self.status.lock().expect("mutex") = status;
    }

    fn run(self: &Arc<Self>) -> Result<BootstrapResult> {
        let contact = match &self.seed {
            BootstrapSeed::Contact(contact) => contact.clone(),
            BootstrapSeed::Addresses(addresses) => self.find_initial_contact(addresses.clone())?,
        };

        loop {
            let nearest = self.find_nearest_nodes(&contact)?;

            if !nearest.collisions.is_empty() {
                if self.check_collisions(nearest.collisions)? {
                    self.context.change_local_id();
                    continue;
                }
            } else {
                let local = self.context.local_contact();

                if nearest.remote_contacts(&local).next().is_none() {
                    debug!(?contact, "Found no nodes other than the local node");
                    return Ok(self.bootstrapped(contact, false));
                }
            }

            match self.refresh_all_buckets()? {
                RefreshOutcome::Retry => {
                    debug!("Routing table is stale, purging and starting over");
                    self.context.routing_table().purge(&STALE_PURGE);
                }
                RefreshOutcome::Done | RefreshOutcome::Terminate => {
                    return Ok(self.determine_if_bootstrapped(contact));
                }
            }
        }
    }

    fn find_initial_contact(&self, addresses: Vec<SocketAddr>) -> Result<Contact> {
        debug!(count = addresses.len(), "Looking for an initial bootstrap contact");

        let future = self.ping.ping_any(addresses);
        let pong = self.wait(Pending::Ping(future.clone()), || future.get())?;

        debug!(contact = ?pong.contact, "Found initial bootstrap contact");

        Ok(pong.contact)
    }

    fn find_nearest_nodes(&self, contact: &Contact) -> Result<FindNodeResult> {
        let local_id = self.context.local_id();
        debug!(?local_id, ?contact, "Finding nearest nodes");

        let future = self.find_node.lookup_from(local_id, contact.clone());
        let result = self.wait(Pending::FindNode(future.clone()), || future.get())?;

        trace!(
            path = result.path.len(),
            collisions = result.collisions.len(),
            "Found nearest nodes"
        );

        Ok(result)
    }

    /// Returns `true` if a colliding node answered the collision ping.
    fn check_collisions(&self, collisions: Vec<Contact>) -> Result<bool> {
        warn!(?collisions, "Checking node id collisions");

        let future = self.ping.collision_ping(collisions);

        match self.wait(Pending::Ping(future.clone()), || future.get()) {
            Ok(pong) => {
                let error = Error::Collision(self.context.local_id());
                warn!(%error, collides_with = ?pong.contact, "Changing local id");
                Ok(true)
            }
            // Nobody answered, the local id is fine.
            Err(error) if error.is_timeout() => Ok(false),
            Err(error) => Err(error),
        }
    }

    fn refresh_all_buckets(self: &Arc<Self>) -> Result<RefreshOutcome> {
        let mut bucket_ids = self.context.routing_table().refresh_ids(true);
        bucket_ids.reverse();

        debug!(buckets = bucket_ids.len(), "Refreshing all buckets");

        let (bucket_sender, buckets) = flume::unbounded();
        for id in bucket_ids {
            let _ = bucket_sender.send(id);
        }
        drop(bucket_sender);

        let round = Arc::new(RefreshRound {
            buckets,
            deadline: Instant::now() + self.context.config.bootstrap.bootstrap_timeout,
            stopped: AtomicBool::new(false),
            lookups: Mutex::new(vec![]),
        });
        *self.round.lock().expect("mutex") = Some(round.clone());

        if self.is_cancelled() {
            round.stop();
            return Err(Error::Cancelled);
        }

        let workers = self.context.config.bootstrap.workers.max(1);
        let (reports, receiver) = flume::unbounded();

        for i in 0..workers {
            let worker = Worker {
                find_node: self.find_node.clone(),
                round: round.clone(),
                reports: reports.clone(),
            };

            let spawned = self
                .context
                .executor
                .spawn_dedicated(format!("mojito-bootstrap-worker-{i}"), move || worker.run());

            if let Err(error) = spawned {
                round.stop();
                return Err(error);
            }
        }
        drop(reports);

        let outcome = self.collect_reports(workers, &receiver);
        round.stop();

        if self.is_cancelled() {
            return Err(Error::Cancelled);
        }

        Ok(outcome)
    }

    fn collect_reports(&self, workers: usize, receiver: &Receiver<WorkerReport>) -> RefreshOutcome {
        let max_failures = self.context.config.bootstrap.max_bootstrap_failures;

        let mut failures = 0;
        let mut found_new = false;
        let mut exhausted = 0;

        while exhausted < workers {
            match receiver.recv() {
                Ok(WorkerReport::Refreshed {
                    failures: count,
                    found_new: new,
                }) => {
                    found_new |= new;
                    failures += count;

                    if failures >= max_failures {
                        debug!(failures, "High failures while refreshing buckets");

                        return match self.status() {
                            BootstrapStatus::Bootstrapping => {
                                self.set_status(BootstrapStatus::RetryingBootstrap);
                                RefreshOutcome::Retry
                            }
                            _ => {
                                self.set_status(BootstrapStatus::Finished);
                                RefreshOutcome::Terminate
                            }
                        };
                    }
                }
                Ok(WorkerReport::Exhausted) => exhausted += 1,
                Err(_) => break,
            }
        }

        debug!(failures, found_new, "Refreshed all buckets");
        self.set_status(BootstrapStatus::Finished);

        RefreshOutcome::Done
    }

    fn determine_if_bootstrapped(&self, contact: Contact) -> BootstrapResult {
        let alive = {
            let mut table = self.context.routing_table();
            table.purge(&FINAL_PURGE);
            table.alive_percentage()
        };

        let ratio = self.context.config.bootstrap.is_bootstrapped_ratio;
        let bootstrapped = alive >= ratio;

        debug!(alive, ratio, bootstrapped, "Determined bootstrap verdict");

        self.bootstrapped(contact, bootstrapped)
    }

    fn bootstrapped(&self, contact: Contact, bootstrapped: bool) -> BootstrapResult {
        self.set_status(BootstrapStatus::Finished);
        self.context.set_bootstrapped(bootstrapped);

        let result = BootstrapResult {
            contact,
            elapsed: self.started.elapsed(),
            result_type: if bootstrapped {
                BootstrapResultType::Succeeded
            } else {
                BootstrapResultType::Failed
            },
        };

        info!(?result, "Finished bootstrapping");

        result
    }

    /// Block on a sub-task, which gets cancelled with the process.
    fn wait<T>(&self, pending: Pending, get: impl FnOnce() -> Result<T>) -> Result<T> {
        if self.is_cancelled() {
            pending.cancel();
            return Err(Error::Cancelled);
        }

        *self.pending.lock().expect("mutex") = Some(pending);

        // Cancelled while registering.
        if self.is_cancelled() {
            if let Some(pending) = self.pending.lock().expect("mutex").take() {
                pending.cancel();
            }
        }

        let result = get();
        self.pending.lock().expect("mutex").take();

        result
    }
}

impl DhtTask<BootstrapResult> for BootstrapProcess {
    fn wait_on_lock(&self) -> Duration {
        match self.seed {
            BootstrapSeed::Contact(_) => self.context.config.bootstrap.wait_on_lock_contact,
            BootstrapSeed::Addresses(_) => self.context.config.bootstrap.wait_on_lock_addresses,
        }
    }

    fn start(self: Arc<Self>, future: DhtFuture<BootstrapResult>) {
        if self.future.set(future.clone()).is_err() {
            return;
        }

        let process = self.clone();
        let spawned = self
            .context
            .executor
            .spawn_dedicated("mojito-bootstrap", move || {
                let result = process.run();

                if let Some(future) = process.future.get() {
                    match result {
                        Ok(result) => {
                            future.set_value(result);
                        }
                        Err(error) => {
                            debug!(?error, "Bootstrap failed");
                            future.set_exception(error);
                        }
                    }
                }
            });

        if let Err(error) = spawned {
            future.set_exception(error);
        }
    }

    fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }

        debug!("Cancelling bootstrap");

        if let Some(pending) = self.pending.lock().expect("mutex").take() {
            pending.cancel();
        }

        if let Some(round) = self.round.lock().expect("mutex").take() {
            round.stop();
        }

        if let Some(future) = self.future.get() {
            future.cancel();
        }
    }
}

/// Refreshes buckets one lookup at a time until the round runs out of them.
struct Worker {
    find_node: Arc<FindNodeManager>,
    round: Arc<RefreshRound>,
    reports: Sender<WorkerReport>,
}

impl Worker {
    fn run(self) {
        while let Some(bucket_id) = self.round.next_bucket() {
            let lookup = self.find_node.lookup(bucket_id);
            if !self.round.track(&lookup) {
                break;
            }

            let report = match lookup.get() {
                Ok(result) => WorkerReport::Refreshed {
                    failures: result.route_table_failures,
                    found_new: result.new_contacts > 0,
                },
                // Stopped, not a failure.
                Err(Error::Cancelled) => break,
                Err(error) => {
                    debug!(?bucket_id, ?error, "Bucket refresh failed");
                    WorkerReport::Refreshed {
                        failures: 1,
                        found_new: false,
                    }
                }
            };

            if self.reports.send(report).is_err() {
                return;
            }
        }

        let _ = self.reports.send(WorkerReport::Exhausted);
    }
}

#[derive(Debug)]
/// Starts [BootstrapProcess]es, one at a time.
pub struct BootstrapManager {
    context: Arc<Context>,
    ping: Arc<PingManager>,
    find_node: Arc<FindNodeManager>,
    current: Mutex<Option<DhtFuture<BootstrapResult>>>,
}

impl BootstrapManager {
    pub(crate) fn new(
        context: Arc<Context>,
        ping: Arc<PingManager>,
        find_node: Arc<FindNodeManager>,
    ) -> Self {
        BootstrapManager {
            context,
            ping,
            find_node,
            current: Mutex::new(None),
        }
    }

    pub fn is_bootstrapped(&self) -> bool {
        self.context.is_bootstrapped()
    }

    /// Bootstrap from `seed`, joins a bootstrap that is still running.
    pub fn bootstrap(&self, seed: BootstrapSeed) -> DhtFuture<BootstrapResult> {
        let mut current = self.current.lock().expect("mutex");

        if let Some(running) = current.as_ref() {
            if !running.is_done() {
                return running.clone();
            }
        }

        let process = Arc::new(BootstrapProcess::new(
            self.context.clone(),
            self.ping.clone(),
            self.find_node.clone(),
            seed,
        ));
        let future = DhtFuture::new(process.wait_on_lock());

        self.context.executor.execute(process, future.clone());
        *current = Some(future.clone());

        future
    }

    pub(crate) fn cancel(&self) {
        let current = self.current.lock().expect("mutex").take();
        if let Some(future) = current {
            future.cancel();
        }
    }
}
