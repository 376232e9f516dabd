//! # Device Event Loop
//!
//! The outer dispatcher driving every [`DeviceMachine`]: one FIFO queue, one
//! container of machines, one place where single-shot timers become
//! `StateTimeout` events.
//!
//! Scheduling is single-threaded and cooperative. Handlers run to
//! completion; anything they emit lands behind the events already queued, so
//! delivery order is exactly enqueue order. Timer expiries are pumped into
//! the same queue and obey the same ordering.
//!
//! Two driving styles:
//!
//! - [`MachineEventLoop::run_until_idle`]: synchronous draining, the
//!   workhorse for embedding and for tests.
//! - [`MachineEventLoop::run`]: a `tokio::select!` loop fed by a
//!   [`Command`] channel, sleeping until the earliest armed timer deadline
//!   when nothing is queued.

use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::config::MachineConfig;
use crate::error::{Error, Result};
use crate::event::{Event, EventKind, EventQueue};
use crate::machine::{DeviceContext, DeviceMachine};
use crate::node::NodeRegistry;
use crate::resource::{ResourceStore, RESOURCE_DEVICES};
use crate::transport::TransportController;
use crate::{DeviceKey, StateLevel};

// ============================================================================
// COMMANDS
// ============================================================================

/// Commands accepted by the async event loop.
#[derive(Debug)]
pub enum Command {
    /// Enqueue one event for dispatch.
    Deliver(Event),
    /// Stop the loop.
    Shutdown,
}

/// Cheap cloneable handle feeding the async event loop.
#[derive(Debug, Clone)]
pub struct LoopHandle {
    tx: mpsc::Sender<Command>,
}

impl LoopHandle {
    /// Create a command channel; hand the receiver to
    /// [`MachineEventLoop::run`].
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Command>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    pub async fn deliver(&self, event: Event) -> Result<()> {
        self.tx
            .send(Command::Deliver(event))
            .await
            .map_err(|_| Error::LoopShutdown)
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.tx
            .send(Command::Shutdown)
            .await
            .map_err(|_| Error::LoopShutdown)
    }
}

// ============================================================================
// DEVICE CONTAINER
// ============================================================================

/// Owned collection of machines, one per device key.
#[derive(Default)]
pub struct DeviceContainer {
    devices: Vec<DeviceMachine>,
}

impl DeviceContainer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: DeviceKey) -> Option<&DeviceMachine> {
        self.devices.iter().find(|d| d.key() == key)
    }

    pub fn get_mut(&mut self, key: DeviceKey) -> Option<&mut DeviceMachine> {
        self.devices.iter_mut().find(|d| d.key() == key)
    }

    pub fn contains(&self, key: DeviceKey) -> bool {
        self.get(key).is_some()
    }

    /// Fetch or construct the machine for a key. Key 0 is rejected.
    pub fn get_or_create(
        &mut self,
        key: DeviceKey,
        config: &MachineConfig,
    ) -> Result<&mut DeviceMachine> {
        if key.is_zero() {
            return Err(Error::InvalidDeviceKey);
        }
        if let Some(pos) = self.devices.iter().position(|d| d.key() == key) {
            return Ok(&mut self.devices[pos]);
        }
        self.devices.push(DeviceMachine::new(key, config));
        let last = self.devices.len() - 1;
        Ok(&mut self.devices[last])
    }

    /// Drop the machine for a key; reports whether one was removed.
    pub fn remove(&mut self, key: DeviceKey) -> bool {
        let before = self.devices.len();
        self.devices.retain(|d| d.key() != key);
        self.devices.len() != before
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DeviceMachine> {
        self.devices.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut DeviceMachine> {
        self.devices.iter_mut()
    }
}

// ============================================================================
// EVENT LOOP
// ============================================================================

/// FIFO dispatcher over a container of device machines.
pub struct MachineEventLoop {
    config: MachineConfig,
    container: DeviceContainer,
    queue: EventQueue,
}

impl MachineEventLoop {
    pub fn new(config: MachineConfig) -> Self {
        Self {
            config,
            container: DeviceContainer::new(),
            queue: EventQueue::new(),
        }
    }

    pub fn config(&self) -> &MachineConfig {
        &self.config
    }

    pub fn container(&self) -> &DeviceContainer {
        &self.container
    }

    pub fn container_mut(&mut self) -> &mut DeviceContainer {
        &mut self.container
    }

    /// Fetch or construct the machine for a key.
    ///
    /// A newly constructed machine gets its initial `StateEnter` enqueued so
    /// the entry handler observes being entered like after any other
    /// transition.
    pub fn get_or_create(&mut self, key: DeviceKey) -> Result<&mut DeviceMachine> {
        let created = !self.container.contains(key);
        let machine = self.container.get_or_create(key, &self.config)?;
        if created {
            self.queue.push(Event::new(
                RESOURCE_DEVICES,
                EventKind::StateEnter,
                StateLevel::Main.index() as i64,
                key,
            ));
        }
        Ok(machine)
    }

    /// Drop the machine for a key; reports whether one was removed.
    pub fn remove(&mut self, key: DeviceKey) -> bool {
        self.container.remove(key)
    }

    /// Enqueue one event.
    pub fn push(&mut self, event: Event) {
        self.queue.push(event);
    }

    /// Events waiting for dispatch.
    pub fn pending_events(&self) -> usize {
        self.queue.len()
    }

    /// Deliver every queued event, including those emitted while draining.
    pub fn drain(
        &mut self,
        transport: &mut dyn TransportController,
        registry: &dyn NodeRegistry,
        store: &mut dyn ResourceStore,
    ) {
        while let Some(event) = self.queue.pop() {
            let Some(machine) = self.container.get_mut(event.device_key()) else {
                tracing::trace!("no machine for {}, dropping {:?}", event.device_key(), event.kind());
                continue;
            };
            if !machine.managed() {
                continue;
            }
            let mut ctx = DeviceContext {
                transport: &mut *transport,
                registry,
                store: &mut *store,
                queue: &mut self.queue,
            };
            machine.handle_event(&event, StateLevel::Main, &mut ctx);
        }
    }

    /// Convert every due timer into a `StateTimeout` event. Returns whether
    /// any fired.
    pub fn pump_timers(&mut self) -> bool {
        let mut fired = false;
        for machine in self.container.iter_mut() {
            if !machine.managed() {
                continue;
            }
            fired |= machine.pump_timers(&mut self.queue);
        }
        fired
    }

    /// Drain events and due timers until neither produces more work.
    pub fn run_until_idle(
        &mut self,
        transport: &mut dyn TransportController,
        registry: &dyn NodeRegistry,
        store: &mut dyn ResourceStore,
    ) {
        loop {
            self.drain(transport, registry, store);
            if !self.pump_timers() {
                break;
            }
        }
    }

    /// Earliest armed timer deadline across all managed machines.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.container
            .iter()
            .filter(|m| m.managed())
            .filter_map(DeviceMachine::next_deadline)
            .min()
    }

    /// Async driving loop: commands in, timer deadlines observed.
    ///
    /// Returns once a [`Command::Shutdown`] arrives or every handle was
    /// dropped.
    pub async fn run(
        &mut self,
        rx: &mut mpsc::Receiver<Command>,
        transport: &mut dyn TransportController,
        registry: &dyn NodeRegistry,
        store: &mut dyn ResourceStore,
    ) -> Result<()> {
        loop {
            self.run_until_idle(&mut *transport, registry, &mut *store);

            let deadline = self.next_deadline();
            tokio::select! {
                command = rx.recv() => match command {
                    Some(Command::Deliver(event)) => self.push(event),
                    Some(Command::Shutdown) | None => {
                        tracing::info!("device event loop shutting down");
                        return Ok(());
                    }
                },
                () = async {
                    match deadline {
                        Some(deadline) => tokio::time::sleep_until(deadline).await,
                        None => std::future::pending().await,
                    }
                } => {
                    self.pump_timers();
                }
            }
        }
    }
}

// ============================================================================
// UNIT TESTS
// ============================================================================
