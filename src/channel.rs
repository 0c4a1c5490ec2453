//! Buffered and unbuffered typed channels with cooperative blocking.
//!
//! A channel is shared by the coroutines that reference it; all access happens
//! while a single coroutine (or the dispatcher) has control, so the interior
//! `RefCell` is a single-threaded formality. Blocked senders and receivers are
//! queued as callbacks. A callback answers [`CallbackOutcome::Accepted`] to
//! consume an interaction or [`CallbackOutcome::Rejected`] to leave the value in
//! flight for other consumers; refused entries are dropped from the queue, which
//! is how selector cases that already fired disappear.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::marker::PhantomData;
use std::rc::Rc;

use serde::de::DeserializeOwned;

use crate::convert::{from_payload, DataConverter, Payload};
use crate::env::{MetricsSink, CORRUPTED_SIGNALS_COUNTER};
use crate::scope::Scope;

pub(crate) const ERR_SEND_CLOSED: &str = "send on a closed channel";

/// Answer of a delivery callback.
///
/// `Rejected` must hand back exactly the value it was offered so the channel can
/// keep it in flight.
pub(crate) enum CallbackOutcome<T> {
    Accepted,
    Rejected(Option<T>),
}

pub(crate) struct ReceiveCallback<T> {
    pub(crate) id: u64,
    pub(crate) deliver: Box<dyn FnMut(Option<T>, bool) -> CallbackOutcome<T>>,
}

pub(crate) struct BlockedSend<T> {
    pub(crate) id: u64,
    /// The parked value. Shared with the sender so an accepted handoff can take
    /// it and a refused one leaves it with the owner.
    pub(crate) value: Rc<RefCell<Option<T>>>,
    /// Returns true to accept the handoff.
    pub(crate) accepted: Box<dyn FnMut() -> bool>,
}

pub(crate) enum ReceiveAttempt<T> {
    Value(T),
    Closed,
    Blocked,
}

pub(crate) enum SendAttempt<T> {
    Sent,
    Parked,
    Full(T),
}

struct ChannelState<T> {
    capacity: usize,
    buffer: VecDeque<T>,
    blocked_sends: VecDeque<BlockedSend<T>>,
    blocked_receives: VecDeque<ReceiveCallback<T>>,
    closed: bool,
    /// One value a selector peeked but did not consume yet. `Some(None)` stashes
    /// an observed end-of-stream.
    prefetched: Option<Option<T>>,
    next_callback_id: u64,
}

/// A FIFO channel with capacity `0` (unbuffered, rendezvous only) or more.
pub struct Channel<T> {
    name: Rc<str>,
    state: Rc<RefCell<ChannelState<T>>>,
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Self {
            name: Rc::clone(&self.name),
            state: Rc::clone(&self.state),
        }
    }
}

impl<T: 'static> Channel<T> {
    pub fn new(capacity: usize) -> Self {
        Self::named("chan", capacity)
    }

    pub fn named(name: impl Into<String>, capacity: usize) -> Self {
        Self {
            name: Rc::from(name.into()),
            state: Rc::new(RefCell::new(ChannelState {
                capacity,
                buffer: VecDeque::new(),
                blocked_sends: VecDeque::new(),
                blocked_receives: VecDeque::new(),
                closed: false,
                prefetched: None,
                next_callback_id: 0,
            })),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_closed(&self) -> bool {
        self.state.borrow().closed
    }

    /// Blocking send. Suspends the calling coroutine until a receiver or a
    /// buffer slot takes the value. Panics if the channel is, or becomes,
    /// closed before the value is consumed.
    pub async fn send(&self, scope: &Scope, value: T) {
        let consumed = Rc::new(Cell::new(false));
        let flag = Rc::clone(&consumed);
        let entry = BlockedSend {
            id: self.next_callback_id(),
            value: Rc::new(RefCell::new(None)),
            accepted: Box::new(move || {
                flag.set(true);
                true
            }),
        };
        match self.send_async_impl(value, Some(entry)) {
            SendAttempt::Sent => {
                scope.coro().unblocked();
                return;
            }
            SendAttempt::Parked => {}
            SendAttempt::Full(_) => unreachable!("a parked send cannot report full"),
        }
        loop {
            if consumed.get() {
                scope.coro().unblocked();
                return;
            }
            if self.state.borrow().closed {
                panic!("{}", ERR_SEND_CLOSED);
            }
            scope.coro().yield_now(format!("{}.send", self.name)).await;
        }
    }

    /// Non-blocking send: hand the value to a waiting receiver or buffer it.
    /// Returns the value back when neither is possible. Panics if the channel
    /// is closed.
    pub fn send_async(&self, value: T) -> Result<(), T> {
        match self.send_async_impl(value, None) {
            SendAttempt::Sent => Ok(()),
            SendAttempt::Full(v) => Err(v),
            SendAttempt::Parked => unreachable!("send without a pending entry cannot park"),
        }
    }

    /// Blocking receive. `None` means the channel is closed and drained.
    pub async fn receive(&self, scope: &Scope) -> Option<T> {
        self.receive_with_more(scope).await.0
    }

    /// Blocking receive exposing the raw `(value, more)` pair. `more` is false
    /// only once the channel is closed and fully drained.
    pub async fn receive_with_more(&self, scope: &Scope) -> (Option<T>, bool) {
        let pending: Rc<RefCell<Option<(Option<T>, bool)>>> = Rc::new(RefCell::new(None));
        let slot = Rc::clone(&pending);
        let callback = ReceiveCallback {
            id: self.next_callback_id(),
            deliver: Box::new(move |value, more| {
                *slot.borrow_mut() = Some((value, more));
                CallbackOutcome::Accepted
            }),
        };
        match self.receive_async_impl(Some(callback)) {
            ReceiveAttempt::Value(v) => {
                scope.coro().unblocked();
                return (Some(v), true);
            }
            ReceiveAttempt::Closed => {
                scope.coro().unblocked();
                return (None, false);
            }
            ReceiveAttempt::Blocked => {}
        }
        loop {
            if let Some((value, more)) = pending.borrow_mut().take() {
                scope.coro().unblocked();
                return (value, more);
            }
            scope
                .coro()
                .yield_now(format!("{}.receive", self.name))
                .await;
        }
    }

    /// Non-blocking receive.
    pub fn receive_async(&self) -> Option<T> {
        self.receive_async_with_more().0
    }

    /// Non-blocking receive exposing the `(value, more)` pair.
    pub fn receive_async_with_more(&self) -> (Option<T>, bool) {
        match self.receive_async_impl(None) {
            ReceiveAttempt::Value(v) => (Some(v), true),
            ReceiveAttempt::Closed => (None, false),
            ReceiveAttempt::Blocked => (None, true),
        }
    }

    /// Close the channel. Buffered values may still be drained; every blocked
    /// receiver is completed with end-of-stream; blocked senders panic on their
    /// next slice.
    pub fn close(&self) {
        let waiters = {
            let mut state = self.state.borrow_mut();
            state.closed = true;
            std::mem::take(&mut state.blocked_receives)
        };
        // Snapshot first: the callbacks may reach back into this channel.
        for mut waiter in waiters {
            let _ = (waiter.deliver)(None, false);
        }
    }

    pub(crate) fn next_callback_id(&self) -> u64 {
        let mut state = self.state.borrow_mut();
        state.next_callback_id += 1;
        state.next_callback_id
    }

    /// Delivery order: pre-fetched value, then buffer head (pulling a blocked
    /// sender into the vacated slot), then end-of-stream when closed, then a
    /// direct handoff from a blocked sender. Registers `callback` only when
    /// nothing was available and the channel is still open.
    pub(crate) fn receive_async_impl(
        &self,
        callback: Option<ReceiveCallback<T>>,
    ) -> ReceiveAttempt<T> {
        {
            let mut state = self.state.borrow_mut();
            if let Some(prefetched) = state.prefetched.take() {
                return match prefetched {
                    Some(v) => ReceiveAttempt::Value(v),
                    None => ReceiveAttempt::Closed,
                };
            }
            if let Some(v) = state.buffer.pop_front() {
                drop(state);
                self.refill_from_blocked_sends();
                return ReceiveAttempt::Value(v);
            }
            if state.closed {
                return ReceiveAttempt::Closed;
            }
        }
        loop {
            let sender = self.state.borrow_mut().blocked_sends.pop_front();
            let Some(mut sender) = sender else { break };
            if (sender.accepted)() {
                let v = sender
                    .value
                    .borrow_mut()
                    .take()
                    .expect("accepted blocked send carries a value");
                return ReceiveAttempt::Value(v);
            }
            // Refused: the owning selector already fired. Drop the entry.
        }
        if let Some(callback) = callback {
            self.state.borrow_mut().blocked_receives.push_back(callback);
        }
        ReceiveAttempt::Blocked
    }

    /// Offer the value to blocked receivers in FIFO order, then to the buffer.
    /// With a pending entry the value parks in `blocked_sends` instead of
    /// reporting full.
    pub(crate) fn send_async_impl(
        &self,
        value: T,
        pending: Option<BlockedSend<T>>,
    ) -> SendAttempt<T> {
        if self.state.borrow().closed {
            panic!("{}", ERR_SEND_CLOSED);
        }
        let mut value = value;
        loop {
            let receiver = self.state.borrow_mut().blocked_receives.pop_front();
            let Some(mut receiver) = receiver else { break };
            match (receiver.deliver)(Some(value), true) {
                CallbackOutcome::Accepted => return SendAttempt::Sent,
                CallbackOutcome::Rejected(returned) => {
                    value = returned.expect("rejected delivery hands the value back");
                }
            }
        }
        let mut state = self.state.borrow_mut();
        if state.buffer.len() < state.capacity {
            state.buffer.push_back(value);
            return SendAttempt::Sent;
        }
        match pending {
            Some(entry) => {
                *entry.value.borrow_mut() = Some(value);
                state.blocked_sends.push_back(entry);
                SendAttempt::Parked
            }
            None => SendAttempt::Full(value),
        }
    }

    fn refill_from_blocked_sends(&self) {
        loop {
            let sender = self.state.borrow_mut().blocked_sends.pop_front();
            let Some(mut sender) = sender else { return };
            if (sender.accepted)() {
                let v = sender
                    .value
                    .borrow_mut()
                    .take()
                    .expect("accepted blocked send carries a value");
                self.state.borrow_mut().buffer.push_back(v);
                return;
            }
        }
    }

    /// Stash a value a selector peeked so the branch body's receive observes it.
    /// `None` stashes end-of-stream.
    pub(crate) fn stash_prefetch(&self, value: Option<T>) {
        self.state.borrow_mut().prefetched = Some(value);
    }

    pub(crate) fn remove_receive_callback(&self, id: u64) {
        self.state
            .borrow_mut()
            .blocked_receives
            .retain(|cb| cb.id != id);
    }

    pub(crate) fn remove_send_callback(&self, id: u64) {
        self.state
            .borrow_mut()
            .blocked_sends
            .retain(|entry| entry.id != id);
    }

    pub(crate) fn buffered_len(&self) -> usize {
        self.state.borrow().buffer.len()
    }

    #[cfg(test)]
    pub(crate) fn blocked_receive_count(&self) -> usize {
        self.state.borrow().blocked_receives.len()
    }

    #[cfg(test)]
    pub(crate) fn blocked_send_count(&self) -> usize {
        self.state.borrow().blocked_sends.len()
    }
}

/// A typed view over a payload channel that decodes on receive.
///
/// Blocking receives log and count corrupt payloads, drop them and retry; the
/// non-blocking variants drain silently until a valid value or end-of-stream.
pub struct DecodedChannel<T> {
    raw: Channel<Payload>,
    converter: Rc<dyn DataConverter>,
    metrics: Rc<dyn MetricsSink>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for DecodedChannel<T> {
    fn clone(&self) -> Self {
        Self {
            raw: self.raw.clone(),
            converter: Rc::clone(&self.converter),
            metrics: Rc::clone(&self.metrics),
            _marker: PhantomData,
        }
    }
}

impl<T: DeserializeOwned> DecodedChannel<T> {
    pub(crate) fn new(
        raw: Channel<Payload>,
        converter: Rc<dyn DataConverter>,
        metrics: Rc<dyn MetricsSink>,
    ) -> Self {
        Self {
            raw,
            converter,
            metrics,
            _marker: PhantomData,
        }
    }

    pub fn raw(&self) -> &Channel<Payload> {
        &self.raw
    }

    pub async fn receive(&self, scope: &Scope) -> Option<T> {
        loop {
            match self.raw.receive(scope).await {
                Some(payload) => match self.decode(&payload) {
                    Some(v) => return Some(v),
                    None => continue,
                },
                None => return None,
            }
        }
    }

    /// Non-blocking receive; corrupt payloads are dropped without ceremony.
    pub fn receive_async(&self) -> Option<T> {
        loop {
            match self.raw.receive_async() {
                Some(payload) => {
                    if let Ok(v) = from_payload::<T>(&*self.converter, &payload) {
                        return Some(v);
                    }
                }
                None => return None,
            }
        }
    }

    pub fn receive_async_with_more(&self) -> (Option<T>, bool) {
        loop {
            match self.raw.receive_async_with_more() {
                (Some(payload), more) => {
                    if let Ok(v) = from_payload::<T>(&*self.converter, &payload) {
                        return (Some(v), more);
                    }
                }
                (None, more) => return (None, more),
            }
        }
    }

    fn decode(&self, payload: &Payload) -> Option<T> {
        match from_payload::<T>(&*self.converter, payload) {
            Ok(v) => Some(v),
            Err(err) => {
                tracing::warn!(
                    channel = self.raw.name(),
                    error = %err,
                    "dropping corrupt payload"
                );
                self.metrics.counter(CORRUPTED_SIGNALS_COUNTER, 1);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::{to_payload, JsonDataConverter};
    use crate::env::NoopMetrics;

    #[test]
    fn buffered_values_are_fifo() {
        let ch = Channel::named("c", 3);
        ch.send_async(1).unwrap();
        ch.send_async(2).unwrap();
        ch.send_async(3).unwrap();
        assert!(ch.send_async(4).is_err());
        assert_eq!(ch.receive_async(), Some(1));
        assert_eq!(ch.receive_async(), Some(2));
        assert_eq!(ch.receive_async(), Some(3));
        assert_eq!(ch.receive_async(), None);
    }

    #[test]
    fn unbuffered_channel_rejects_async_send_without_receiver() {
        let ch = Channel::<u32>::new(0);
        assert!(ch.send_async(7).is_err());
    }

    #[test]
    fn closed_channel_still_drains_buffer() {
        let ch = Channel::named("c", 2);
        ch.send_async("a").unwrap();
        ch.send_async("b").unwrap();
        ch.close();
        assert_eq!(ch.receive_async_with_more(), (Some("a"), true));
        assert_eq!(ch.receive_async_with_more(), (Some("b"), true));
        assert_eq!(ch.receive_async_with_more(), (None, false));
    }

    #[test]
    #[should_panic(expected = "closed channel")]
    fn send_on_closed_channel_panics() {
        let ch = Channel::new(1);
        ch.close();
        let _ = ch.send_async(1);
    }

    #[test]
    fn prefetch_takes_precedence_over_buffer() {
        let ch = Channel::named("c", 2);
        ch.send_async(10).unwrap();
        ch.stash_prefetch(Some(99));
        assert_eq!(ch.receive_async(), Some(99));
        assert_eq!(ch.receive_async(), Some(10));
    }

    #[test]
    fn stashed_end_of_stream_is_observed_once() {
        let ch = Channel::<u32>::named("c", 1);
        ch.stash_prefetch(None);
        assert_eq!(ch.receive_async_with_more(), (None, false));
        // The stash is consumed; the channel is still open afterwards.
        assert_eq!(ch.receive_async_with_more(), (None, true));
    }

    #[test]
    fn decoded_channel_drops_corrupt_payloads() {
        let conv: Rc<dyn DataConverter> = Rc::new(JsonDataConverter);
        let raw = Channel::named("sig", 10);
        raw.send_async(Payload(b"not json".to_vec())).unwrap();
        raw.send_async(to_payload(&JsonDataConverter, &41_u32).unwrap())
            .unwrap();
        let typed: DecodedChannel<u32> =
            DecodedChannel::new(raw, conv, Rc::new(NoopMetrics));
        assert_eq!(typed.receive_async(), Some(41));
    }
}
