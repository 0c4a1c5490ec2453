//! Multi-way wait over channels and promises.
//!
//! Cases are attempted in registration order, first with their non-blocking
//! variant. When nothing is ready (and no default is registered) the selector
//! parks a claiming callback on every case and yields; the first callback to
//! claim the shared slot wins, every other callback refuses its delivery so the
//! value stays in flight. Whatever path `select` returns through, every callback
//! it registered is removed again.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::channel::{
    BlockedSend, CallbackOutcome, Channel, ReceiveAttempt, ReceiveCallback, SendAttempt,
};
use crate::promise::Promise;
use crate::scope::Scope;

const ERR_SEALED: &str = "selector cases cannot be added after select has returned";

#[derive(Clone, Copy, PartialEq, Eq)]
enum Claim {
    Empty,
    Claimed(usize),
    /// A branch already fired; late callbacks must keep refusing.
    Sentinel,
}

type ClaimSlot = Rc<Cell<Claim>>;

trait SelectorCase {
    /// Non-blocking attempt. Returns true when the branch fired synchronously.
    /// A false return either left a claiming callback behind on the case's
    /// channel, or found the slot already claimed (possibly by a sibling case
    /// this very attempt completed); the claimant's branch fires instead.
    fn try_select(&mut self, claim: &ClaimSlot, index: usize) -> bool;

    /// Run the branch after its callback claimed the slot.
    fn fire(&mut self);

    /// Remove the callback registered by the last `try_select`, if any.
    fn cleanup(&mut self);
}

struct ReceiveCase<T> {
    channel: Channel<T>,
    handler: Box<dyn FnMut(&Channel<T>, bool)>,
    pending: Rc<RefCell<Option<(Option<T>, bool)>>>,
    registered: Option<u64>,
}

impl<T: 'static> SelectorCase for ReceiveCase<T> {
    fn try_select(&mut self, claim: &ClaimSlot, index: usize) -> bool {
        if claim.get() != Claim::Empty {
            return false;
        }
        let id = self.channel.next_callback_id();
        let slot = Rc::clone(claim);
        let pending = Rc::clone(&self.pending);
        let callback = ReceiveCallback {
            id,
            deliver: Box::new(move |value, more| {
                if slot.get() != Claim::Empty {
                    return CallbackOutcome::Rejected(value);
                }
                slot.set(Claim::Claimed(index));
                *pending.borrow_mut() = Some((value, more));
                CallbackOutcome::Accepted
            }),
        };
        match self.channel.receive_async_impl(Some(callback)) {
            ReceiveAttempt::Value(v) => {
                // Draining the queue may have completed a sibling send parked
                // on this same channel, which then owns the slot. The value
                // stays receivable and the claimant's branch fires.
                if claim.get() != Claim::Empty {
                    self.channel.stash_prefetch(Some(v));
                    return false;
                }
                claim.set(Claim::Sentinel);
                self.channel.stash_prefetch(Some(v));
                (self.handler)(&self.channel, true);
                true
            }
            ReceiveAttempt::Closed => {
                claim.set(Claim::Sentinel);
                self.channel.stash_prefetch(None);
                (self.handler)(&self.channel, false);
                true
            }
            ReceiveAttempt::Blocked => {
                self.registered = Some(id);
                false
            }
        }
    }

    fn fire(&mut self) {
        let (value, more) = self
            .pending
            .borrow_mut()
            .take()
            .expect("claimed receive case carries a delivery");
        self.channel.stash_prefetch(value);
        (self.handler)(&self.channel, more);
    }

    fn cleanup(&mut self) {
        if let Some(id) = self.registered.take() {
            self.channel.remove_receive_callback(id);
        }
    }
}

struct SendCase<T> {
    channel: Channel<T>,
    /// Shared with the parked queue entry; a refused handoff leaves the value
    /// here for the next `select`.
    value: Rc<RefCell<Option<T>>>,
    handler: Box<dyn FnMut()>,
    registered: Option<u64>,
}

impl<T: 'static> SelectorCase for SendCase<T> {
    fn try_select(&mut self, claim: &ClaimSlot, index: usize) -> bool {
        if claim.get() != Claim::Empty {
            return false;
        }
        // Consumed by an earlier select; the case can never be ready again.
        let Some(value) = self.value.borrow_mut().take() else {
            return false;
        };
        let id = self.channel.next_callback_id();
        let slot = Rc::clone(claim);
        let entry = BlockedSend {
            id,
            value: Rc::clone(&self.value),
            accepted: Box::new(move || {
                if slot.get() != Claim::Empty {
                    return false;
                }
                slot.set(Claim::Claimed(index));
                true
            }),
        };
        match self.channel.send_async_impl(value, Some(entry)) {
            SendAttempt::Sent => {
                // The delivery may have landed in a sibling receive case
                // parked on this same channel, which then owns the slot; its
                // branch fires with the value, not this one.
                if claim.get() != Claim::Empty {
                    return false;
                }
                claim.set(Claim::Sentinel);
                (self.handler)();
                true
            }
            SendAttempt::Parked => {
                self.registered = Some(id);
                false
            }
            SendAttempt::Full(_) => unreachable!("a pending send cannot report full"),
        }
    }

    fn fire(&mut self) {
        (self.handler)();
    }

    fn cleanup(&mut self) {
        if let Some(id) = self.registered.take() {
            self.channel.remove_send_callback(id);
        }
    }
}

struct PromiseCase<T> {
    promise: Promise<T>,
    handler: Box<dyn FnMut(&Promise<T>)>,
    registered: Option<u64>,
}

impl<T> SelectorCase for PromiseCase<T> {
    fn try_select(&mut self, claim: &ClaimSlot, index: usize) -> bool {
        if claim.get() != Claim::Empty {
            return false;
        }
        if self.promise.is_ready() {
            claim.set(Claim::Sentinel);
            (self.handler)(&self.promise);
            return true;
        }
        let channel = self.promise.ready_channel();
        let id = channel.next_callback_id();
        let slot = Rc::clone(claim);
        let callback = ReceiveCallback {
            id,
            deliver: Box::new(move |value, _more| {
                if slot.get() != Claim::Empty {
                    return CallbackOutcome::Rejected(value);
                }
                slot.set(Claim::Claimed(index));
                CallbackOutcome::Accepted
            }),
        };
        // The readiness channel of an unready promise is open and empty, so
        // this always parks the callback.
        match channel.receive_async_impl(Some(callback)) {
            ReceiveAttempt::Blocked => {
                self.registered = Some(id);
                false
            }
            _ => {
                claim.set(Claim::Sentinel);
                (self.handler)(&self.promise);
                true
            }
        }
    }

    fn fire(&mut self) {
        (self.handler)(&self.promise);
    }

    fn cleanup(&mut self) {
        if let Some(id) = self.registered.take() {
            self.promise.ready_channel().remove_receive_callback(id);
        }
    }
}

/// A multi-way wait. Exactly one branch (counting the default) fires per
/// [`select`](Selector::select) call, no matter how many cases are ready.
pub struct Selector {
    name: Rc<str>,
    cases: Vec<Box<dyn SelectorCase>>,
    default_case: Option<Box<dyn FnMut()>>,
    sealed: bool,
}

impl Default for Selector {
    fn default() -> Self {
        Self::new()
    }
}

impl Selector {
    pub fn new() -> Self {
        Self::named("selector")
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Rc::from(name.into()),
            cases: Vec::new(),
            default_case: None,
            sealed: false,
        }
    }

    fn assert_unsealed(&self) {
        if self.sealed {
            panic!("{}", ERR_SEALED);
        }
    }

    /// Add a receive branch. The handler runs with the received value stashed
    /// in the channel's pre-fetch slot, so `receive_async` inside the handler
    /// observes it; `more` is false when the branch fired on a closed channel.
    pub fn add_receive<T: 'static>(
        &mut self,
        channel: &Channel<T>,
        handler: impl FnMut(&Channel<T>, bool) + 'static,
    ) -> &mut Self {
        self.assert_unsealed();
        self.cases.push(Box::new(ReceiveCase {
            channel: channel.clone(),
            handler: Box::new(handler),
            pending: Rc::new(RefCell::new(None)),
            registered: None,
        }));
        self
    }

    /// Add a send branch; the handler runs once the value was consumed.
    pub fn add_send<T: 'static>(
        &mut self,
        channel: &Channel<T>,
        value: T,
        handler: impl FnMut() + 'static,
    ) -> &mut Self {
        self.assert_unsealed();
        self.cases.push(Box::new(SendCase {
            channel: channel.clone(),
            value: Rc::new(RefCell::new(Some(value))),
            handler: Box::new(handler),
            registered: None,
        }));
        self
    }

    /// Add a promise branch; the handler runs once the promise resolves.
    pub fn add_future<T: 'static>(
        &mut self,
        promise: &Promise<T>,
        handler: impl FnMut(&Promise<T>) + 'static,
    ) -> &mut Self {
        self.assert_unsealed();
        self.cases.push(Box::new(PromiseCase {
            promise: promise.clone(),
            handler: Box::new(handler),
            registered: None,
        }));
        self
    }

    /// Add a default branch, fired when no case is ready at `select` time.
    pub fn add_default(&mut self, handler: impl FnMut() + 'static) -> &mut Self {
        self.assert_unsealed();
        self.default_case = Some(Box::new(handler));
        self
    }

    /// Wait until one branch fires.
    pub async fn select(&mut self, scope: &Scope) {
        let claim: ClaimSlot = Rc::new(Cell::new(Claim::Empty));
        for index in 0..self.cases.len() {
            if self.cases[index].try_select(&claim, index) {
                self.finish(scope);
                return;
            }
        }
        // A sync attempt may have completed a sibling case on the same channel
        // instead of its own; the claimant fires before the default is even
        // considered.
        if let Claim::Claimed(index) = claim.get() {
            self.cases[index].fire();
            self.finish(scope);
            return;
        }
        if claim.get() == Claim::Empty && self.default_case.is_some() {
            self.cleanup_registered();
            self.sealed = true;
            (self
                .default_case
                .as_mut()
                .expect("checked above"))();
            scope.coro().unblocked();
            return;
        }
        loop {
            if let Claim::Claimed(index) = claim.get() {
                self.cases[index].fire();
                self.finish(scope);
                return;
            }
            scope
                .coro()
                .yield_now(format!("{}.select", self.name))
                .await;
        }
    }

    fn finish(&mut self, scope: &Scope) {
        self.cleanup_registered();
        self.sealed = true;
        scope.coro().unblocked();
    }

    fn cleanup_registered(&mut self) {
        for case in &mut self.cases {
            case.cleanup();
        }
    }
}
