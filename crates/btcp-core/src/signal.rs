//! Signal/slot primitives used by btcp sockets and servers.
//!
//! Two kinds of event sources are provided:
//!
//! - [`Signal<Args>`] - a repeatable event with an ordered list of slots.
//! - [`OnceSignal<Args>`] - an event that fires at most once and latches its
//!   value, so slots connected after the fact still observe it.
//!
//! Slots are invoked in the order they were connected. Emission works on a
//! snapshot of the slot list taken before the first slot runs: a slot that
//! connects or disconnects slots (itself included) while being invoked never
//! causes a sibling to be skipped or invoked twice.
//!
//! # Example
//!
//! ```
//! use btcp_core::Signal;
//!
//! let data = Signal::<Vec<u8>>::new();
//!
//! let id = data.connect(|bytes| {
//!     println!("received {} bytes", bytes.len());
//! });
//!
//! data.emit(b"hello".to_vec());
//! data.disconnect(id);
//! ```
//!
//! # Latched Events
//!
//! ```
//! use btcp_core::OnceSignal;
//!
//! let closed = OnceSignal::<bool>::new();
//! closed.emit(false).unwrap();
//!
//! // Connected after the fact: invoked immediately with the latched value.
//! closed.connect(|had_error| assert!(!had_error));
//! ```

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::error::SignalError;
use crate::logging::targets;

/// A unique identifier for a connected slot.
///
/// Identifiers are unique across every signal in the process, so an id can be
/// offered to several signals and only the owning one will act on it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotId(u64);

impl SlotId {
    fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw id value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for SlotId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "slot-{}", self.0)
    }
}

type Slot<Args> = Arc<dyn Fn(&Args) + Send + Sync>;

struct Entry<Args> {
    id: SlotId,
    slot: Slot<Args>,
    once: bool,
}

/// A repeatable event with an ordered list of slots.
pub struct Signal<Args> {
    slots: Mutex<Vec<Entry<Args>>>,
}

impl<Args: Send + 'static> Default for Signal<Args> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Args: Send + 'static> Signal<Args> {
    /// Create a new signal with no slots.
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(Vec::new()),
        }
    }

    /// Connect a slot. It is invoked on every emission until disconnected.
    pub fn connect<F>(&self, slot: F) -> SlotId
    where
        F: Fn(&Args) + Send + Sync + 'static,
    {
        self.insert(Arc::new(slot), false)
    }

    /// Connect a slot that is disconnected right before its first invocation.
    pub fn connect_once<F>(&self, slot: F) -> SlotId
    where
        F: Fn(&Args) + Send + Sync + 'static,
    {
        self.insert(Arc::new(slot), true)
    }

    fn insert(&self, slot: Slot<Args>, once: bool) -> SlotId {
        let id = SlotId::next();
        self.slots.lock().push(Entry { id, slot, once });
        id
    }

    /// Disconnect a slot by id.
    ///
    /// Returns `true` if the slot belonged to this signal and was removed.
    pub fn disconnect(&self, id: SlotId) -> bool {
        let mut slots = self.slots.lock();
        match slots.iter().position(|entry| entry.id == id) {
            Some(index) => {
                slots.remove(index);
                true
            }
            None => false,
        }
    }

    /// Disconnect every slot.
    pub fn disconnect_all(&self) {
        self.slots.lock().clear();
    }

    /// Get the number of connected slots.
    pub fn connection_count(&self) -> usize {
        self.slots.lock().len()
    }

    /// Invoke every connected slot, in connection order.
    ///
    /// Returns the number of slots invoked.
    #[tracing::instrument(skip_all, target = "btcp_core::signal", level = "trace")]
    pub fn emit(&self, args: Args) -> usize {
        let snapshot: Vec<Slot<Args>> = {
            let mut slots = self.slots.lock();
            let snapshot = slots.iter().map(|entry| entry.slot.clone()).collect();
            slots.retain(|entry| !entry.once);
            snapshot
        };
        tracing::trace!(target: targets::SIGNAL, slot_count = snapshot.len(), "emitting signal");

        for slot in &snapshot {
            slot(&args);
        }
        snapshot.len()
    }
}

impl<Args> std::fmt::Debug for Signal<Args> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signal")
            .field("slots", &self.slots.lock().len())
            .finish()
    }
}

enum OnceState<Args> {
    Pending(Vec<(SlotId, Slot<Args>)>),
    Fired(Args),
}

/// An event that fires at most once and remembers its value.
///
/// Slots connected after the event fired are invoked immediately, on the
/// connecting thread, with a clone of the latched value. The event can also be
/// awaited through [`wait`](Self::wait).
pub struct OnceSignal<Args> {
    state: Mutex<OnceState<Args>>,
    latch: watch::Sender<Option<Args>>,
}

impl<Args: Clone + Send + Sync + 'static> Default for OnceSignal<Args> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Args: Clone + Send + Sync + 'static> OnceSignal<Args> {
    /// Create a new, unfired event.
    pub fn new() -> Self {
        let (latch, _) = watch::channel(None);
        Self {
            state: Mutex::new(OnceState::Pending(Vec::new())),
            latch,
        }
    }

    /// Connect a slot.
    ///
    /// If the event already fired the slot runs before this call returns and
    /// is not retained.
    pub fn connect<F>(&self, slot: F) -> SlotId
    where
        F: Fn(&Args) + Send + Sync + 'static,
    {
        let id = SlotId::next();
        let fired = {
            let mut state = self.state.lock();
            match &mut *state {
                OnceState::Pending(slots) => {
                    slots.push((id, Arc::new(slot)));
                    return id;
                }
                OnceState::Fired(args) => args.clone(),
            }
        };
        slot(&fired);
        id
    }

    /// Disconnect a pending slot by id.
    pub fn disconnect(&self, id: SlotId) -> bool {
        let mut state = self.state.lock();
        match &mut *state {
            OnceState::Pending(slots) => match slots.iter().position(|(slot_id, _)| *slot_id == id) {
                Some(index) => {
                    slots.remove(index);
                    true
                }
                None => false,
            },
            OnceState::Fired(_) => false,
        }
    }

    /// Disconnect every pending slot. The latched value, if any, is kept.
    pub fn disconnect_all(&self) {
        if let OnceState::Pending(slots) = &mut *self.state.lock() {
            slots.clear();
        }
    }

    /// Get the number of pending slots.
    pub fn connection_count(&self) -> usize {
        match &*self.state.lock() {
            OnceState::Pending(slots) => slots.len(),
            OnceState::Fired(_) => 0,
        }
    }

    /// Check whether the event has fired.
    pub fn is_fired(&self) -> bool {
        matches!(&*self.state.lock(), OnceState::Fired(_))
    }

    /// Get the latched value, if the event has fired.
    pub fn value(&self) -> Option<Args> {
        match &*self.state.lock() {
            OnceState::Fired(args) => Some(args.clone()),
            OnceState::Pending(_) => None,
        }
    }

    /// Fire the event, invoking pending slots in connection order.
    pub fn emit(&self, args: Args) -> Result<(), SignalError> {
        let slots = {
            let mut state = self.state.lock();
            match std::mem::replace(&mut *state, OnceState::Fired(args.clone())) {
                OnceState::Pending(slots) => slots,
                fired @ OnceState::Fired(_) => {
                    *state = fired;
                    return Err(SignalError::AlreadyFired);
                }
            }
        };
        self.latch.send_replace(Some(args.clone()));
        tracing::trace!(target: targets::SIGNAL, slot_count = slots.len(), "firing latched signal");

        for (_, slot) in &slots {
            slot(&args);
        }
        Ok(())
    }

    /// Wait until the event fires and return its value.
    ///
    /// The returned future does not borrow the signal.
    pub fn wait(&self) -> impl Future<Output = Args> + Send + 'static {
        let mut receiver = self.latch.subscribe();
        async move {
            loop {
                if let Some(args) = receiver.borrow_and_update().clone() {
                    return args;
                }
                if receiver.changed().await.is_err() {
                    // The sender is gone without ever firing; nothing left to wait for.
                    return std::future::pending().await;
                }
            }
        }
    }
}

impl<Args> std::fmt::Debug for OnceSignal<Args> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (fired, pending) = match &*self.state.lock() {
            OnceState::Pending(slots) => (false, slots.len()),
            OnceState::Fired(_) => (true, 0),
        };
        f.debug_struct("OnceSignal")
            .field("fired", &fired)
            .field("pending", &pending)
            .finish()
    }
}

static_assertions::assert_impl_all!(Signal<Vec<u8>>: Send, Sync);
static_assertions::assert_impl_all!(OnceSignal<bool>: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    #[test]
    fn test_signal_connect_emit() {
        let signal = Signal::<i32>::new();
        let received = Arc::new(Mutex::new(Vec::new()));

        let received_clone = received.clone();
        signal.connect(move |&value| {
            received_clone.lock().push(value);
        });

        signal.emit(42);
        signal.emit(100);

        assert_eq!(*received.lock(), vec![42, 100]);
    }

    #[test]
    fn test_slots_run_in_connection_order() {
        let signal = Signal::<()>::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for n in 0..5 {
            let order = order.clone();
            signal.connect(move |_| order.lock().push(n));
        }

        assert_eq!(signal.emit(()), 5);
        assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_signal_disconnect() {
        let signal = Signal::<i32>::new();
        let received = Arc::new(Mutex::new(Vec::new()));

        let received_clone = received.clone();
        let id = signal.connect(move |&value| {
            received_clone.lock().push(value);
        });

        signal.emit(1);
        assert!(signal.disconnect(id));
        assert!(!signal.disconnect(id));
        signal.emit(2);

        assert_eq!(*received.lock(), vec![1]);
    }

    #[test]
    fn test_self_removal_does_not_skip_sibling() {
        let signal = Arc::new(Signal::<()>::new());
        let calls = Arc::new(Mutex::new(Vec::new()));
        let own_id = Arc::new(Mutex::new(None::<SlotId>));

        let weak = Arc::downgrade(&signal);
        let calls_first = calls.clone();
        let own_id_first = own_id.clone();
        let first = signal.connect(move |_| {
            calls_first.lock().push("first");
            let id = *own_id_first.lock();
            if let (Some(signal), Some(id)) = (weak.upgrade(), id) {
                signal.disconnect(id);
            }
        });
        *own_id.lock() = Some(first);

        let calls_second = calls.clone();
        signal.connect(move |_| calls_second.lock().push("second"));

        signal.emit(());
        signal.emit(());

        assert_eq!(*calls.lock(), vec!["first", "second", "second"]);
    }

    #[test]
    fn test_connect_during_emit_waits_for_next_emit() {
        let signal = Arc::new(Signal::<()>::new());
        let late_calls = Arc::new(AtomicUsize::new(0));

        let weak = Arc::downgrade(&signal);
        let late = late_calls.clone();
        signal.connect_once(move |_| {
            if let Some(signal) = weak.upgrade() {
                let late = late.clone();
                signal.connect(move |_| {
                    late.fetch_add(1, Ordering::SeqCst);
                });
            }
        });

        signal.emit(());
        assert_eq!(late_calls.load(Ordering::SeqCst), 0);
        signal.emit(());
        assert_eq!(late_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_connect_once() {
        let signal = Signal::<i32>::new();
        let count = Arc::new(AtomicUsize::new(0));

        let count_clone = count.clone();
        signal.connect_once(move |_| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });

        signal.emit(1);
        signal.emit(2);

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(signal.connection_count(), 0);
    }

    #[test]
    fn test_disconnect_all() {
        let signal = Signal::<()>::new();

        for _ in 0..5 {
            signal.connect(|_| {});
        }

        assert_eq!(signal.connection_count(), 5);
        signal.disconnect_all();
        assert_eq!(signal.connection_count(), 0);
    }

    #[test]
    fn test_emit_from_multiple_threads() {
        let signal = Arc::new(Signal::<usize>::new());
        let counter = Arc::new(AtomicUsize::new(0));

        let counter_clone = counter.clone();
        signal.connect(move |_| {
            counter_clone.fetch_add(1, Ordering::SeqCst);
        });

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let signal = signal.clone();
                std::thread::spawn(move || {
                    for i in 0..100 {
                        signal.emit(i);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(counter.load(Ordering::SeqCst), 800);
    }

    #[test]
    fn test_once_signal_fires_once() {
        let signal = OnceSignal::<bool>::new();
        let count = Arc::new(AtomicUsize::new(0));

        let count_clone = count.clone();
        signal.connect(move |_| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });

        assert!(signal.emit(true).is_ok());
        assert_eq!(signal.emit(false), Err(SignalError::AlreadyFired));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(signal.value(), Some(true));
    }

    #[test]
    fn test_once_signal_late_slot_observes_value() {
        let signal = OnceSignal::<u32>::new();
        signal.emit(7).unwrap();

        let seen = Arc::new(Mutex::new(None));
        let seen_clone = seen.clone();
        signal.connect(move |&value| {
            *seen_clone.lock() = Some(value);
        });

        assert_eq!(*seen.lock(), Some(7));
        assert_eq!(signal.connection_count(), 0);
    }

    #[test]
    fn test_once_signal_disconnect_pending() {
        let signal = OnceSignal::<()>::new();
        let called = Arc::new(AtomicBool::new(false));

        let called_clone = called.clone();
        let id = signal.connect(move |_| called_clone.store(true, Ordering::SeqCst));
        assert!(signal.disconnect(id));

        signal.emit(()).unwrap();
        assert!(!called.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_once_signal_wait() {
        let signal = Arc::new(OnceSignal::<u8>::new());
        let wait = signal.wait();

        let emitter = signal.clone();
        tokio::spawn(async move {
            emitter.emit(3).unwrap();
        });

        assert_eq!(wait.await, 3);
        // Waiting after the fact resolves immediately.
        assert_eq!(signal.wait().await, 3);
    }
}
