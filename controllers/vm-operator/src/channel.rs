//! Event pipeline and VM channel registry
//!
//! Every watch notification is routed to the channel of the VM it belongs
//! to. Each channel is a queue drained by exactly one task, so events for
//! one VM are handled strictly in arrival order and never concurrently,
//! while different VMs proceed in parallel.
//!
//! A channel is torn down by its own task once the VM's Deleted event has
//! been handled and the queue is empty. The emptiness check and the removal
//! happen under the registry lock, the same lock `dispatch` holds while
//! enqueuing, so no event can be stranded on a retired channel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use cluster_client::{ManagedObject, VmKey};
use crds::VirtualMachine;
use tokio::sync::{Notify, mpsc};
use tracing::{debug, error, warn};

use crate::metrics::Metrics;
use crate::store::VmState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeType {
    Added,
    Modified,
    Deleted,
}

/// One unit of work on a VM channel
#[derive(Debug, Clone)]
pub enum VmChannelEvent {
    /// The VirtualMachine itself changed
    Vm {
        change: ChangeType,
        vm: Box<VirtualMachine>,
    },
    /// One of the VM's child objects changed
    Child {
        change: ChangeType,
        object: ManagedObject,
    },
    /// Re-run reconciliation against the cached state
    Resync,
}

impl VmChannelEvent {
    fn is_vm_deleted(&self) -> bool {
        matches!(
            self,
            VmChannelEvent::Vm {
                change: ChangeType::Deleted,
                ..
            }
        )
    }

    pub fn describe(&self) -> String {
        match self {
            VmChannelEvent::Vm { change, .. } => format!("VirtualMachine {:?}", change),
            VmChannelEvent::Child { change, object } => format!("{} {:?}", object.key(), change),
            VmChannelEvent::Resync => "Resync".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerOutcome {
    Done,
    /// Ask for a `Resync` after the delay
    RequeueAfter(Duration),
}

/// A participant in per-VM event processing
#[async_trait::async_trait]
pub trait VmEventHandler: Send + Sync {
    async fn handle(&self, state: &mut VmState, event: &VmChannelEvent, cancel: &CancelToken) -> HandlerOutcome;
}

/// Cancellation signal for in-flight work on a channel
///
/// Fired when a VM Deleted event is dispatched and cleared once that event
/// has been handled, so work queued between the two is skipped as well.
#[derive(Debug, Default)]
pub struct CancelToken {
    requested: AtomicU64,
    acknowledged: AtomicU64,
    notify: Notify,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.requested.fetch_add(1, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    fn requested(&self) -> u64 {
        self.requested.load(Ordering::SeqCst)
    }

    /// Clear the requests made up to `requested`
    fn acknowledge(&self, requested: u64) {
        self.acknowledged.fetch_max(requested, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.requested.load(Ordering::SeqCst) > self.acknowledged.load(Ordering::SeqCst)
    }

    /// Resolves once cancellation is requested
    pub async fn cancelled(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

struct VmChannel {
    sender: mpsc::UnboundedSender<VmChannelEvent>,
    cancel: Arc<CancelToken>,
}

pub struct ChannelRegistry {
    channels: Mutex<HashMap<VmKey, VmChannel>>,
    handlers: Vec<Arc<dyn VmEventHandler>>,
    metrics: Arc<Metrics>,
    this: Weak<ChannelRegistry>,
}

impl ChannelRegistry {
    /// Create a registry; every event is passed to `handlers` in order
    pub fn new(handlers: Vec<Arc<dyn VmEventHandler>>, metrics: Arc<Metrics>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            channels: Mutex::new(HashMap::new()),
            handlers,
            metrics,
            this: this.clone(),
        })
    }

    /// Enqueue `event` on the channel of `key`, creating it on first use
    pub fn dispatch(&self, key: VmKey, event: VmChannelEvent) {
        let mut channels = match self.channels.lock() {
            Ok(channels) => channels,
            Err(_) => {
                error!(vm = %key, "Channel registry lock poisoned, dropping event");
                return;
            }
        };

        if event.is_vm_deleted() {
            if let Some(channel) = channels.get(&key) {
                channel.cancel.cancel();
            }
        }

        let channel = channels
            .entry(key.clone())
            .or_insert_with(|| self.spawn_channel(&key));
        if let Err(mpsc::error::SendError(event)) = channel.sender.send(event) {
            // The channel task died (a handler panicked); start a fresh one
            warn!(vm = %key, "VM channel task is gone, restarting it");
            let fresh = self.spawn_channel(&key);
            if fresh.sender.send(event).is_err() {
                error!(vm = %key, "Failed to enqueue event on restarted channel");
            }
            channels.insert(key, fresh);
        }
        self.metrics.vm_channels.set(channels.len() as i64);
    }

    /// Enqueue only if the channel is still live
    pub fn dispatch_existing(&self, key: &VmKey, event: VmChannelEvent) {
        let live = self
            .channels
            .lock()
            .map(|channels| channels.contains_key(key))
            .unwrap_or(false);
        if live {
            self.dispatch(key.clone(), event);
        }
    }

    pub fn len(&self) -> usize {
        self.channels.lock().map(|c| c.len()).unwrap_or(0)
    }

    pub fn contains(&self, key: &VmKey) -> bool {
        self.channels.lock().map(|c| c.contains_key(key)).unwrap_or(false)
    }

    fn spawn_channel(&self, key: &VmKey) -> VmChannel {
        let (sender, receiver) = mpsc::unbounded_channel();
        let cancel = Arc::new(CancelToken::new());
        let task = ChannelTask {
            key: key.clone(),
            registry: self.this.clone(),
            handlers: self.handlers.clone(),
            cancel: cancel.clone(),
        };
        debug!(vm = %key, "Opening VM channel");
        tokio::spawn(task.run(receiver));
        VmChannel { sender, cancel }
    }

    /// Remove the channel if nothing is queued; otherwise hand back the next event
    fn try_retire(
        &self,
        key: &VmKey,
        receiver: &mut mpsc::UnboundedReceiver<VmChannelEvent>,
    ) -> Result<(), VmChannelEvent> {
        let mut channels = match self.channels.lock() {
            Ok(channels) => channels,
            Err(_) => return Ok(()),
        };
        match receiver.try_recv() {
            Ok(event) => Err(event),
            Err(_) => {
                channels.remove(key);
                self.metrics.vm_channels.set(channels.len() as i64);
                debug!(vm = %key, "Closed VM channel");
                Ok(())
            }
        }
    }
}

struct ChannelTask {
    key: VmKey,
    registry: Weak<ChannelRegistry>,
    handlers: Vec<Arc<dyn VmEventHandler>>,
    cancel: Arc<CancelToken>,
}

impl ChannelTask {
    async fn run(self, mut receiver: mpsc::UnboundedReceiver<VmChannelEvent>) {
        let mut state = VmState::new(self.key.clone());
        let mut next = receiver.recv().await;

        while let Some(event) = next.take() {
            self.process(&mut state, &event).await;

            if state.is_retired() {
                let Some(registry) = self.registry.upgrade() else {
                    return;
                };
                match registry.try_retire(&self.key, &mut receiver) {
                    Ok(()) => return,
                    Err(pending) => {
                        next = Some(pending);
                        continue;
                    }
                }
            }
            next = receiver.recv().await;
        }
    }

    async fn process(&self, state: &mut VmState, event: &VmChannelEvent) {
        debug!(vm = %self.key, event = %event.describe(), "Processing");
        state.apply(event);
        let requested = self.cancel.requested();

        let mut requeue: Option<Duration> = None;
        for handler in &self.handlers {
            if let HandlerOutcome::RequeueAfter(delay) = handler.handle(state, event, &self.cancel).await {
                requeue = Some(requeue.map_or(delay, |d| d.min(delay)));
            }
        }

        if event.is_vm_deleted() {
            self.cancel.acknowledge(requested);
        }

        if let Some(delay) = requeue {
            let registry = self.registry.clone();
            let key = self.key.clone();
            debug!(vm = %key, ?delay, "Requeueing");
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if let Some(registry) = registry.upgrade() {
                    registry.dispatch_existing(&key, VmChannelEvent::Resync);
                }
            });
        }
    }
}
