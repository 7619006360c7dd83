//! Per-run event bus.
//!
//! The bus keeps the run's ordered, append-only log, persists every event to
//! the sink before anything else sees it, and hands deliveries to roles one
//! at a time. A delivery stays in flight until it is acknowledged; nothing
//! behind it is handed out in the meantime, which is what turns a stuck role
//! into backpressure instead of parallel retries.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};

use crate::domain::{Event, EventKind, RoleId};
use crate::error::{Result, VloopError};
use crate::id::generate_event_id;
use crate::storage::EventSink;

/// Capacity of the external publish channel
const EXTERNAL_CHANNEL_CAPACITY: usize = 64;

/// Capacity of the observer broadcast channel
const OBSERVER_CHANNEL_CAPACITY: usize = 256;

type Observer = Box<dyn Fn(&Event) + Send + Sync + 'static>;

/// One event handed to one role.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub role: RoleId,
    pub event: Event,
}

impl Delivery {
    pub fn seq(&self) -> u64 {
        self.event.seq
    }
}

/// Handle for writers outside the controller (watchdog, cancellation).
///
/// Events sent here are appended by the controller through `publish`, so the
/// controller stays the only writer of the run.
#[derive(Debug, Clone)]
pub struct BusPublisher {
    run_id: String,
    tx: mpsc::Sender<Event>,
}

impl BusPublisher {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Queue an event for the run. Fails if the run is gone or the channel
    /// is full.
    pub fn send(&self, event: Event) -> Result<()> {
        if event.run_id != self.run_id {
            return Err(VloopError::InvalidState(format!(
                "event for run {} sent to run {}",
                event.run_id, self.run_id
            )));
        }
        self.tx.try_send(event).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                VloopError::InvalidState(format!("run {} inbox is full", self.run_id))
            }
            mpsc::error::TrySendError::Closed(_) => VloopError::RunNotFound(self.run_id.clone()),
        })
    }

    /// Whether the run's controller is still receiving
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Ordered, durable delivery of typed events for one run.
pub struct EventBus {
    run_id: String,
    log: Vec<Event>,
    subscriptions: HashMap<EventKind, Vec<RoleId>>,
    sealed: bool,
    /// Set once the run is terminal: events are logged but not delivered
    halted: bool,
    queue: VecDeque<Delivery>,
    in_flight: Option<Delivery>,
    sink: Arc<dyn EventSink>,
    observers: Vec<Observer>,
    stream: broadcast::Sender<Event>,
    external_tx: mpsc::Sender<Event>,
    external_rx: mpsc::Receiver<Event>,
}

impl EventBus {
    pub fn new(run_id: impl Into<String>, sink: Arc<dyn EventSink>) -> Self {
        let (external_tx, external_rx) = mpsc::channel(EXTERNAL_CHANNEL_CAPACITY);
        let (stream, _) = broadcast::channel(OBSERVER_CHANNEL_CAPACITY);
        Self {
            run_id: run_id.into(),
            log: Vec::new(),
            subscriptions: HashMap::new(),
            sealed: false,
            halted: false,
            queue: VecDeque::new(),
            in_flight: None,
            sink,
            observers: Vec::new(),
            stream,
            external_tx,
            external_rx,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Register a role's interest in a kind. Only allowed before `seal`.
    pub fn subscribe(&mut self, run_id: &str, kind: EventKind, role: impl Into<RoleId>) -> Result<()> {
        if run_id != self.run_id {
            return Err(VloopError::InvalidState(format!(
                "subscription for run {} on bus of run {}",
                run_id, self.run_id
            )));
        }
        if self.sealed {
            return Err(VloopError::InvalidState(
                "subscriptions are fixed once the run has started".to_string(),
            ));
        }
        let role = role.into();
        let subscribers = self.subscriptions.entry(kind).or_default();
        if !subscribers.contains(&role) {
            subscribers.push(role);
        }
        Ok(())
    }

    /// Freeze the subscription table for the lifetime of the run
    pub fn seal(&mut self) {
        self.sealed = true;
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    pub fn subscribers(&self, kind: EventKind) -> &[RoleId] {
        self.subscriptions.get(&kind).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Adds an observer called synchronously for every published event.
    pub fn add_observer<F>(&mut self, observer: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.observers.push(Box::new(observer));
    }

    /// Read-only stream of published events, for dashboards.
    pub fn observe(&self) -> broadcast::Receiver<Event> {
        self.stream.subscribe()
    }

    pub fn publisher(&self) -> BusPublisher {
        BusPublisher {
            run_id: self.run_id.clone(),
            tx: self.external_tx.clone(),
        }
    }

    /// Append an event to the log and enqueue it for its recipients.
    ///
    /// The event is persisted first; if the sink fails the event is not
    /// logged at all. Returns the roles the event was queued for.
    pub fn publish(&mut self, mut event: Event) -> Result<Vec<RoleId>> {
        if event.run_id != self.run_id {
            return Err(VloopError::InvalidState(format!(
                "event for run {} published on bus of run {}",
                event.run_id, self.run_id
            )));
        }

        let seq = self.log.len() as u64;
        event.seq = seq;
        event.id = generate_event_id(&self.run_id, seq);

        self.sink.append(&event)?;
        self.log.push(event.clone());

        for observer in &self.observers {
            observer(&event);
        }
        // No receivers is fine
        let _ = self.stream.send(event.clone());

        if self.halted || event.kind.is_controller_handled() {
            return Ok(Vec::new());
        }

        let recipients: Vec<RoleId> = match &event.target {
            Some(target) if self.subscribers(event.kind).contains(target) => vec![target.clone()],
            Some(_) => Vec::new(),
            None => self.subscribers(event.kind).to_vec(),
        };

        for role in &recipients {
            self.queue.push_back(Delivery {
                role: role.clone(),
                event: event.clone(),
            });
        }

        Ok(recipients)
    }

    /// Load a persisted log without re-persisting it.
    pub fn restore(&mut self, events: Vec<Event>) -> Result<()> {
        if !self.log.is_empty() {
            return Err(VloopError::InvalidState(
                "cannot restore into a bus that already has events".to_string(),
            ));
        }
        for (i, event) in events.iter().enumerate() {
            if event.run_id != self.run_id {
                return Err(VloopError::Storage(format!(
                    "log of run {} contains event of run {}",
                    self.run_id, event.run_id
                )));
            }
            if event.seq != i as u64 {
                return Err(VloopError::Storage(format!(
                    "log of run {} has a gap: expected seq {}, found {}",
                    self.run_id, i, event.seq
                )));
            }
        }
        self.log = events;
        Ok(())
    }

    /// Re-queue an already logged event for a role (resume after restart).
    pub fn redeliver(&mut self, seq: u64, role: RoleId) -> Result<()> {
        let event = self
            .log
            .get(seq as usize)
            .cloned()
            .ok_or_else(|| VloopError::InvalidState(format!("no event with seq {}", seq)))?;
        self.queue.push_back(Delivery { role, event });
        Ok(())
    }

    /// Hand out the next delivery, unless one is still unacknowledged.
    pub fn next_delivery(&mut self) -> Option<Delivery> {
        if self.in_flight.is_some() {
            return None;
        }
        let delivery = self.queue.pop_front()?;
        self.in_flight = Some(delivery.clone());
        Some(delivery)
    }

    /// Acknowledge the in-flight delivery, releasing the queue.
    pub fn ack(&mut self, seq: u64, role: &RoleId) -> Result<()> {
        match &self.in_flight {
            Some(d) if d.seq() == seq && &d.role == role => {
                self.in_flight = None;
                Ok(())
            }
            Some(d) => Err(VloopError::InvalidState(format!(
                "ack for seq {} by {} but seq {} to {} is in flight",
                seq,
                role,
                d.seq(),
                d.role
            ))),
            None => Err(VloopError::InvalidState(format!(
                "ack for seq {} by {} with nothing in flight",
                seq, role
            ))),
        }
    }

    pub fn in_flight(&self) -> Option<&Delivery> {
        self.in_flight.as_ref()
    }

    /// True while a delivery awaits acknowledgement
    pub fn is_blocked(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn pending_count(&self) -> usize {
        self.queue.len()
    }

    /// Drop everything queued or in flight, returning how many deliveries
    /// were discarded. Used when a stall recovery resets the run's context.
    pub fn clear_pending(&mut self) -> usize {
        let dropped = self.queue.len() + usize::from(self.in_flight.is_some());
        self.queue.clear();
        self.in_flight = None;
        dropped
    }

    /// Stop delivering. Later events are still logged for audit.
    pub fn halt(&mut self) {
        self.halted = true;
        self.queue.clear();
        self.in_flight = None;
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    pub fn log(&self) -> &[Event] {
        &self.log
    }

    pub fn last(&self) -> Option<&Event> {
        self.log.last()
    }

    /// Wait for an event from an external publisher
    pub async fn recv_external(&mut self) -> Option<Event> {
        self.external_rx.recv().await
    }

    /// Take an external event if one is waiting
    pub fn try_recv_external(&mut self) -> Option<Event> {
        self.external_rx.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryEventLog;
    use std::sync::Mutex;

    const RUN: &str = "run-test";

    fn bus_with_roster() -> (EventBus, Arc<MemoryEventLog>) {
        let sink = Arc::new(MemoryEventLog::new());
        let mut bus = EventBus::new(RUN, sink.clone());
        bus.subscribe(RUN, EventKind::TaskStart, "planner").unwrap();
        bus.subscribe(RUN, EventKind::PlanReady, "builder").unwrap();
        bus.subscribe(RUN, EventKind::BuildDone, "verifier").unwrap();
        bus.subscribe(RUN, EventKind::TestFailed, "builder").unwrap();
        bus.subscribe(RUN, EventKind::TestFailed, "planner").unwrap();
        bus.seal();
        (bus, sink)
    }

    fn event(kind: EventKind) -> Event {
        Event::new(kind, RUN, 1, serde_json::Value::Null)
    }

    #[test]
    fn test_publish_assigns_sequence_and_persists() {
        let (mut bus, sink) = bus_with_roster();
        bus.publish(event(EventKind::TaskStart)).unwrap();
        bus.publish(event(EventKind::PlanReady)).unwrap();

        assert_eq!(bus.log()[0].seq, 0);
        assert_eq!(bus.log()[1].seq, 1);
        assert_eq!(bus.log()[1].id, "evt-run-test-000001");
        assert_eq!(sink.load(RUN).unwrap(), bus.log());
    }

    #[test]
    fn test_publish_routes_to_subscriber() {
        let (mut bus, _) = bus_with_roster();
        let recipients = bus.publish(event(EventKind::TaskStart)).unwrap();
        assert_eq!(recipients, vec![RoleId::new("planner")]);
    }

    #[test]
    fn test_target_narrows_recipients() {
        let (mut bus, _) = bus_with_roster();
        let recipients = bus
            .publish(event(EventKind::TestFailed).with_target("planner"))
            .unwrap();
        assert_eq!(recipients, vec![RoleId::new("planner")]);
    }

    #[test]
    fn test_target_without_subscription_has_no_recipient() {
        let (mut bus, _) = bus_with_roster();
        let recipients = bus
            .publish(event(EventKind::PlanReady).with_target("verifier"))
            .unwrap();
        assert!(recipients.is_empty());
        // Still logged for audit
        assert_eq!(bus.log().len(), 1);
    }

    #[test]
    fn test_controller_kinds_are_not_queued() {
        let (mut bus, _) = bus_with_roster();
        assert!(bus.publish(event(EventKind::StallDetected)).unwrap().is_empty());
        assert!(bus.publish(event(EventKind::TestPassed)).unwrap().is_empty());
        assert_eq!(bus.pending_count(), 0);
    }

    #[test]
    fn test_subscribe_after_seal_is_refused() {
        let (mut bus, _) = bus_with_roster();
        let err = bus.subscribe(RUN, EventKind::RecoveryInjected, "planner");
        assert!(matches!(err, Err(VloopError::InvalidState(_))));
    }

    #[test]
    fn test_subscribe_for_other_run_is_refused() {
        let sink = Arc::new(MemoryEventLog::new());
        let mut bus = EventBus::new(RUN, sink);
        assert!(bus.subscribe("run-other", EventKind::TaskStart, "planner").is_err());
    }

    #[test]
    fn test_unacked_delivery_blocks_queue() {
        let (mut bus, _) = bus_with_roster();
        bus.publish(event(EventKind::TaskStart)).unwrap();
        bus.publish(event(EventKind::PlanReady)).unwrap();

        let first = bus.next_delivery().unwrap();
        assert_eq!(first.event.kind, EventKind::TaskStart);
        assert!(bus.is_blocked());
        assert!(bus.next_delivery().is_none());

        bus.ack(first.seq(), &first.role).unwrap();
        let second = bus.next_delivery().unwrap();
        assert_eq!(second.event.kind, EventKind::PlanReady);
        assert_eq!(second.role.as_str(), "builder");
    }

    #[test]
    fn test_delivery_order_matches_publish_order() {
        let (mut bus, _) = bus_with_roster();
        for kind in [EventKind::TaskStart, EventKind::PlanReady, EventKind::BuildDone] {
            bus.publish(event(kind)).unwrap();
        }
        let mut seen = Vec::new();
        while let Some(d) = bus.next_delivery() {
            seen.push(d.seq());
            bus.ack(d.seq(), &d.role).unwrap();
        }
        assert_eq!(seen, vec![0, 1, 2]);
    }

    #[test]
    fn test_ack_mismatch_is_error() {
        let (mut bus, _) = bus_with_roster();
        bus.publish(event(EventKind::TaskStart)).unwrap();
        let d = bus.next_delivery().unwrap();
        assert!(bus.ack(d.seq() + 1, &d.role).is_err());
        assert!(bus.ack(d.seq(), &RoleId::new("builder")).is_err());
        assert!(bus.ack(d.seq(), &d.role).is_ok());
        assert!(bus.ack(d.seq(), &d.role).is_err());
    }

    #[test]
    fn test_clear_pending() {
        let (mut bus, _) = bus_with_roster();
        bus.publish(event(EventKind::TaskStart)).unwrap();
        bus.publish(event(EventKind::PlanReady)).unwrap();
        bus.next_delivery().unwrap();
        assert_eq!(bus.clear_pending(), 2);
        assert!(!bus.is_blocked());
        assert!(!bus.is_halted());
        bus.publish(event(EventKind::PlanReady)).unwrap();
        assert!(bus.next_delivery().is_some());
    }

    #[test]
    fn test_halt_logs_but_does_not_deliver() {
        let (mut bus, sink) = bus_with_roster();
        bus.publish(event(EventKind::TaskStart)).unwrap();
        bus.halt();
        let recipients = bus.publish(event(EventKind::PlanReady)).unwrap();
        assert!(recipients.is_empty());
        assert!(bus.next_delivery().is_none());
        assert_eq!(sink.load(RUN).unwrap().len(), 2);
    }

    #[test]
    fn test_observers_see_every_event() {
        let (mut bus, _) = bus_with_roster();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        bus.add_observer(move |e| seen_clone.lock().unwrap().push(e.kind));
        let mut stream = bus.observe();

        bus.publish(event(EventKind::TaskStart)).unwrap();
        bus.publish(event(EventKind::StallDetected)).unwrap();

        assert_eq!(
            *seen.lock().unwrap(),
            vec![EventKind::TaskStart, EventKind::StallDetected]
        );
        assert_eq!(stream.try_recv().unwrap().kind, EventKind::TaskStart);
        assert_eq!(stream.try_recv().unwrap().kind, EventKind::StallDetected);
    }

    #[test]
    fn test_publish_for_other_run_is_refused() {
        let (mut bus, _) = bus_with_roster();
        let other = Event::new(EventKind::TaskStart, "run-other", 1, serde_json::Value::Null);
        assert!(bus.publish(other).is_err());
        assert!(bus.log().is_empty());
    }

    #[test]
    fn test_restore_and_redeliver() {
        let (mut source, sink) = bus_with_roster();
        source.publish(event(EventKind::TaskStart)).unwrap();
        source.publish(event(EventKind::PlanReady)).unwrap();

        let mut resumed = EventBus::new(RUN, sink.clone());
        resumed.restore(sink.load(RUN).unwrap()).unwrap();
        assert_eq!(resumed.log().len(), 2);
        // Restoring does not write again
        assert_eq!(sink.load(RUN).unwrap().len(), 2);

        resumed.redeliver(1, RoleId::new("builder")).unwrap();
        let d = resumed.next_delivery().unwrap();
        assert_eq!(d.event.kind, EventKind::PlanReady);
    }

    #[test]
    fn test_restore_rejects_gaps() {
        let sink = Arc::new(MemoryEventLog::new());
        let mut bus = EventBus::new(RUN, sink);
        let mut e = event(EventKind::TaskStart);
        e.seq = 3;
        assert!(matches!(bus.restore(vec![e]), Err(VloopError::Storage(_))));
    }

    #[tokio::test]
    async fn test_external_publisher() {
        let (mut bus, _) = bus_with_roster();
        let publisher = bus.publisher();
        publisher.send(event(EventKind::StallDetected)).unwrap();

        let received = bus.recv_external().await.unwrap();
        assert_eq!(received.kind, EventKind::StallDetected);
        assert!(bus.try_recv_external().is_none());
    }

    #[test]
    fn test_external_publisher_rejects_foreign_run() {
        let (bus, _) = bus_with_roster();
        let publisher = bus.publisher();
        let other = Event::new(EventKind::StallDetected, "run-other", 1, serde_json::Value::Null);
        assert!(publisher.send(other).is_err());
    }

    #[test]
    fn test_external_publisher_closed_after_drop() {
        let (bus, _) = bus_with_roster();
        let publisher = bus.publisher();
        drop(bus);
        assert!(publisher.is_closed());
        assert!(matches!(
            publisher.send(event(EventKind::StallDetected)),
            Err(VloopError::RunNotFound(_))
        ));
    }
}
