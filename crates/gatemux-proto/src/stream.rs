//! Stream table and pending exchanges

use crate::{Envelope, StreamError, StreamId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Event delivered to the consumer of an exchange
#[derive(Debug)]
pub enum StreamEvent {
    /// A data envelope
    Data(Envelope),
    /// The exchange completed successfully
    Completed,
    /// The exchange failed
    Errored(StreamError),
}

/// Exchange state enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeState {
    /// Registered at send time, nothing received yet
    Registered,
    /// At least one data envelope delivered
    Active,
    /// Closed by a completion signal
    Completed,
    /// Closed by an error
    Errored,
    /// Abandoned by the local consumer
    Cancelled,
}

impl ExchangeState {
    /// Whether no further deliveries are accepted
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Errored | Self::Cancelled)
    }
}

/// The open logical exchange on one stream id.
///
/// Deliveries never block: the channel to the consumer is unbounded, so a
/// slow consumer only grows its own buffer.
#[derive(Debug)]
pub struct PendingExchange {
    /// Stream ID
    stream_id: StreamId,
    /// Current state; held while pushing so events follow state order
    state: Mutex<ExchangeState>,
    /// Sender side of the consumer channel
    sender: mpsc::UnboundedSender<StreamEvent>,
    /// Receiver side, handed to the single consumer
    receiver: Mutex<Option<mpsc::UnboundedReceiver<StreamEvent>>>,
}

impl PendingExchange {
    fn new(stream_id: StreamId) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            stream_id,
            state: Mutex::new(ExchangeState::Registered),
            sender,
            receiver: Mutex::new(Some(receiver)),
        }
    }

    /// Get the stream ID
    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    /// Get the current state
    pub fn state(&self) -> ExchangeState {
        *lock(&self.state)
    }

    /// Whether the exchange reached a terminal state
    pub fn is_terminated(&self) -> bool {
        self.state().is_terminal()
    }

    /// Take the consumer side of the exchange. Only the first call succeeds.
    pub fn take_receiver(&self) -> Option<mpsc::UnboundedReceiver<StreamEvent>> {
        lock(&self.receiver).take()
    }

    /// Whether a consumer took the receiving side
    pub fn has_consumer(&self) -> bool {
        lock(&self.receiver).is_none()
    }

    /// Push a data envelope to the consumer.
    ///
    /// The envelope is handed back when the exchange is already terminated or
    /// its consumer is gone; the caller then owns its release.
    pub fn deliver(&self, envelope: Envelope) -> Result<(), Envelope> {
        let mut state = lock(&self.state);
        if state.is_terminal() {
            return Err(envelope);
        }

        match self.sender.send(StreamEvent::Data(envelope)) {
            Ok(()) => {
                *state = ExchangeState::Active;
                Ok(())
            }
            Err(mpsc::error::SendError(StreamEvent::Data(envelope))) => Err(envelope),
            Err(_) => unreachable!("a data event is returned as sent"),
        }
    }

    /// Terminate with a completion. Returns `false` if already terminated.
    pub fn complete(&self) -> bool {
        self.terminate(ExchangeState::Completed, Some(StreamEvent::Completed))
    }

    /// Terminate with an error. Returns `false` if already terminated.
    pub fn fail(&self, error: StreamError) -> bool {
        self.terminate(ExchangeState::Errored, Some(StreamEvent::Errored(error)))
    }

    /// Terminate on behalf of the local consumer. Returns `false` if already terminated.
    pub fn cancel(&self) -> bool {
        self.terminate(ExchangeState::Cancelled, None)
    }

    fn terminate(&self, next: ExchangeState, event: Option<StreamEvent>) -> bool {
        let mut state = lock(&self.state);
        if state.is_terminal() {
            return false;
        }
        *state = next;
        if let Some(event) = event {
            // Nobody listening means the consumer already went away
            let _ = self.sender.send(event);
        }
        true
    }
}

#[derive(Debug, Default)]
struct TableInner {
    exchanges: HashMap<StreamId, Arc<PendingExchange>>,
    /// Set by `drain_all`; no registration is accepted afterwards
    sealed: bool,
}

/// Concurrent mapping from stream id to pending exchange.
///
/// Every operation holds the lock only for the map update itself, never while
/// delivering to a consumer.
#[derive(Debug, Default)]
pub struct StreamTable {
    inner: Mutex<TableInner>,
}

impl StreamTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an exchange for `stream_id`.
    ///
    /// An existing open exchange for the same id is returned as is; the reuse
    /// is logged so accidental id collisions can be spotted. An entry that
    /// already terminated is replaced. Fails with
    /// [`StreamError::ConnectionClosed`] once the table has been drained.
    pub fn register(&self, stream_id: StreamId) -> Result<Arc<PendingExchange>, StreamError> {
        let mut inner = self.lock();
        if inner.sealed {
            return Err(StreamError::ConnectionClosed);
        }

        if let Some(existing) = inner.exchanges.get(&stream_id) {
            if !existing.is_terminated() {
                warn!("Stream id {} reused while its exchange is still open", stream_id);
                return Ok(Arc::clone(existing));
            }
            debug!("Replacing terminated exchange on stream id {}", stream_id);
        }

        let exchange = Arc::new(PendingExchange::new(stream_id));
        inner.exchanges.insert(stream_id, Arc::clone(&exchange));
        debug!("Registered stream id {}", stream_id);
        Ok(exchange)
    }

    /// Look up the exchange for `stream_id`
    pub fn lookup(&self, stream_id: StreamId) -> Option<Arc<PendingExchange>> {
        self.lock().exchanges.get(&stream_id).cloned()
    }

    /// Remove the exchange for `stream_id`, if any
    pub fn remove(&self, stream_id: StreamId) -> Option<Arc<PendingExchange>> {
        let removed = self.lock().exchanges.remove(&stream_id);
        if removed.is_some() {
            debug!("Removed stream id {}", stream_id);
        }
        removed
    }

    /// Remove the entry for `stream_id` only if it is still `exchange`
    pub fn remove_exchange(&self, stream_id: StreamId, exchange: &Arc<PendingExchange>) -> bool {
        let mut inner = self.lock();
        match inner.exchanges.get(&stream_id) {
            Some(current) if Arc::ptr_eq(current, exchange) => {
                inner.exchanges.remove(&stream_id);
                debug!("Removed stream id {}", stream_id);
                true
            }
            _ => false,
        }
    }

    /// Remove a terminated exchange if its consumer is attached.
    ///
    /// Without a consumer the entry stays, so a later subscriber still reads
    /// the buffered events and removes it once it reaches the terminal.
    pub fn retire(&self, stream_id: StreamId, exchange: &Arc<PendingExchange>) -> bool {
        let mut inner = self.lock();
        match inner.exchanges.get(&stream_id) {
            Some(current) if Arc::ptr_eq(current, exchange) && exchange.has_consumer() => {
                inner.exchanges.remove(&stream_id);
                debug!("Removed stream id {}", stream_id);
                true
            }
            _ => false,
        }
    }

    /// Seal the table against new registrations and return every exchange.
    ///
    /// Exchanges with a consumer are removed. The others stay reachable
    /// through [`lookup`](Self::lookup) until a subscriber drains them.
    pub fn drain_all(&self) -> Vec<Arc<PendingExchange>> {
        let mut inner = self.lock();
        inner.sealed = true;
        let drained = inner.exchanges.values().cloned().collect();
        inner.exchanges.retain(|_, exchange| !exchange.has_consumer());
        drained
    }

    /// Whether `stream_id` has an entry
    pub fn contains(&self, stream_id: StreamId) -> bool {
        self.lock().exchanges.contains_key(&stream_id)
    }

    /// Number of entries, including terminated ones nobody consumed yet
    pub fn len(&self) -> usize {
        self.lock().exchanges.len()
    }

    /// Whether the table has no entry
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the table was drained
    pub fn is_sealed(&self) -> bool {
        self.lock().sealed
    }

    fn lock(&self) -> MutexGuard<'_, TableInner> {
        lock(&self.inner)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ServiceError;
    use bytes::Bytes;
    use proptest::prelude::*;
    use std::collections::HashSet;

    fn expect_data(event: Option<StreamEvent>) -> Bytes {
        match event {
            Some(StreamEvent::Data(envelope)) => envelope.into_payload().unwrap(),
            other => panic!("Expected data event, got {:?}", other),
        }
    }

    #[test]
    fn test_register_and_lookup() {
        let table = StreamTable::new();
        let exchange = table.register(1).unwrap();

        assert_eq!(exchange.stream_id(), 1);
        assert_eq!(exchange.state(), ExchangeState::Registered);
        assert!(table.contains(1));
        assert!(Arc::ptr_eq(&table.lookup(1).unwrap(), &exchange));
        assert!(table.lookup(2).is_none());
    }

    #[test]
    fn test_duplicate_registration_returns_existing() {
        let table = StreamTable::new();
        let first = table.register(5).unwrap();
        let second = table.register(5).unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let table = StreamTable::new();
        table.register(1).unwrap();

        assert!(table.remove(1).is_some());
        assert!(table.remove(1).is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn test_remove_exchange_spares_newer_entry() {
        let table = StreamTable::new();
        let old = table.register(9).unwrap();
        table.remove(9);
        let new = table.register(9).unwrap();

        assert!(!table.remove_exchange(9, &old));
        assert!(table.contains(9));
        assert!(table.remove_exchange(9, &new));
        assert!(!table.contains(9));
    }

    #[test]
    fn test_drain_all_empties_and_seals() {
        let table = StreamTable::new();
        for id in 0..4 {
            table.register(id).unwrap().take_receiver();
        }

        let drained = table.drain_all();
        assert_eq!(drained.len(), 4);
        assert!(table.is_empty());
        assert!(table.is_sealed());
        assert!(matches!(table.register(10), Err(StreamError::ConnectionClosed)));
        assert!(table.drain_all().is_empty());
    }

    #[tokio::test]
    async fn test_drain_all_keeps_unconsumed_exchanges() {
        let table = StreamTable::new();
        table.register(1).unwrap().take_receiver();
        let waiting = table.register(4).unwrap();

        for exchange in table.drain_all() {
            exchange.fail(StreamError::ConnectionClosed);
        }
        assert!(!table.contains(1));
        assert!(Arc::ptr_eq(&table.lookup(4).unwrap(), &waiting));

        let mut rx = table.lookup(4).unwrap().take_receiver().unwrap();
        assert!(matches!(rx.recv().await, Some(StreamEvent::Errored(StreamError::ConnectionClosed))));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_retire_waits_for_consumer() {
        let table = StreamTable::new();
        let exchange = table.register(2).unwrap();
        exchange.deliver(Envelope::data(2, "early")).unwrap();
        exchange.complete();

        assert!(!table.retire(2, &exchange));
        assert!(table.contains(2));

        let mut rx = table.lookup(2).unwrap().take_receiver().unwrap();
        assert_eq!(expect_data(rx.recv().await), Bytes::from("early"));
        assert!(matches!(rx.recv().await, Some(StreamEvent::Completed)));
        assert!(table.retire(2, &exchange));
        assert!(!table.contains(2));
    }

    #[test]
    fn test_register_replaces_terminated_exchange() {
        let table = StreamTable::new();
        let old = table.register(8).unwrap();
        old.complete();

        let new = table.register(8).unwrap();
        assert!(!Arc::ptr_eq(&old, &new));
        assert_eq!(new.state(), ExchangeState::Registered);
        assert!(!table.retire(8, &old));
        assert!(Arc::ptr_eq(&table.lookup(8).unwrap(), &new));
    }

    #[tokio::test]
    async fn test_delivery_order_and_completion() {
        let table = StreamTable::new();
        let exchange = table.register(2).unwrap();
        let mut rx = exchange.take_receiver().unwrap();

        for payload in ["a", "b", "c"] {
            exchange.deliver(Envelope::data(2, payload)).unwrap();
        }
        assert_eq!(exchange.state(), ExchangeState::Active);
        assert!(exchange.complete());

        assert_eq!(expect_data(rx.recv().await), Bytes::from("a"));
        assert_eq!(expect_data(rx.recv().await), Bytes::from("b"));
        assert_eq!(expect_data(rx.recv().await), Bytes::from("c"));
        assert!(matches!(rx.recv().await, Some(StreamEvent::Completed)));
    }

    #[tokio::test]
    async fn test_terminal_only_once() {
        let table = StreamTable::new();
        let exchange = table.register(3).unwrap();
        let mut rx = exchange.take_receiver().unwrap();

        assert!(exchange.fail(ServiceError::internal(500, "boom").into()));
        assert!(!exchange.complete());
        assert!(!exchange.fail(StreamError::ConnectionClosed));
        assert!(!exchange.cancel());
        assert_eq!(exchange.state(), ExchangeState::Errored);

        let late = exchange.deliver(Envelope::data(3, "late"));
        assert!(late.is_err());

        assert!(matches!(
            rx.recv().await,
            Some(StreamEvent::Errored(StreamError::Service(e))) if e.message() == "boom"
        ));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_receiver_taken_once() {
        let table = StreamTable::new();
        let exchange = table.register(4).unwrap();
        assert!(exchange.take_receiver().is_some());
        assert!(exchange.take_receiver().is_none());
    }

    #[test]
    fn test_delivery_to_dropped_consumer_returns_envelope() {
        let table = StreamTable::new();
        let exchange = table.register(6).unwrap();
        drop(exchange.take_receiver());

        let returned = exchange.deliver(Envelope::data(6, "nobody")).unwrap_err();
        assert_eq!(returned.payload(), Some(&Bytes::from("nobody")));
    }

    #[tokio::test]
    async fn test_concurrent_registration_and_removal() {
        let table = Arc::new(StreamTable::new());
        let mut tasks = Vec::new();

        for worker in 0..8u64 {
            let table = Arc::clone(&table);
            tasks.push(tokio::spawn(async move {
                for i in 0..100u64 {
                    let id = worker * 1000 + i;
                    table.register(id).unwrap();
                    if i % 2 == 0 {
                        table.remove(id);
                    }
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(table.len(), 8 * 50);
    }

    proptest! {
        #[test]
        fn test_deliveries_reach_only_their_exchange(
            ids in prop::collection::hash_set(0u64..10_000, 1..16),
            rounds in 1usize..5
        ) {
            tokio_test::block_on(async {
                let table = StreamTable::new();
                let mut receivers = Vec::new();
                for &id in &ids {
                    let exchange = table.register(id).unwrap();
                    receivers.push((id, exchange.take_receiver().unwrap()));
                }

                for round in 0..rounds {
                    for &id in &ids {
                        let exchange = table.lookup(id).unwrap();
                        let payload = format!("{}:{}", id, round);
                        prop_assert!(exchange.deliver(Envelope::data(id, payload)).is_ok());
                    }
                }

                for (id, mut rx) in receivers {
                    let mut seen = HashSet::new();
                    for round in 0..rounds {
                        let payload = expect_data(rx.recv().await);
                        prop_assert_eq!(payload, Bytes::from(format!("{}:{}", id, round)));
                        seen.insert(round);
                    }
                    prop_assert!(rx.try_recv().is_err());
                    prop_assert_eq!(seen.len(), rounds);
                }

                Ok(())
            })?;
        }
    }
}
