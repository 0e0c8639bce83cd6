//! Single-resolution futures for the engine's suspension points.
//!
//! Element resolution, parse-ready gating and visibility "ready" /
//! "report-ready" gating all suspend on a [`Promise`]. A [`Deferred`] is
//! the producer half; settling it delivers the result to every callback
//! queued via [`Promise::then`], in registration order. Settling twice is
//! ignored. [`CancelToken`] is checked by deferred callbacks so a disposed
//! tracker never invokes a stale listener.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::errors::AnalyticsError;

pub type PromiseResult<T> = Result<T, AnalyticsError>;

type Callback<T> = Box<dyn FnOnce(&PromiseResult<T>)>;

enum State<T> {
    Pending(Vec<Callback<T>>),
    Settled(Rc<PromiseResult<T>>),
}

/// Producer half; hand out [`Promise`]s via [`Deferred::promise`].
pub struct Deferred<T> {
    state: Rc<RefCell<State<T>>>,
}

/// Consumer handle; cheap to clone.
pub struct Promise<T> {
    state: Rc<RefCell<State<T>>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self { state: Rc::clone(&self.state) }
    }
}

impl<T: 'static> Deferred<T> {
    pub fn new() -> Self {
        Self { state: Rc::new(RefCell::new(State::Pending(Vec::new()))) }
    }

    pub fn promise(&self) -> Promise<T> {
        Promise { state: Rc::clone(&self.state) }
    }

    pub fn resolve(&self, value: T) {
        settle(&self.state, Ok(value));
    }

    pub fn reject(&self, error: AnalyticsError) {
        settle(&self.state, Err(error));
    }
}

impl<T: 'static> Default for Deferred<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: 'static> Promise<T> {
    pub fn resolved(value: T) -> Self {
        Self { state: Rc::new(RefCell::new(State::Settled(Rc::new(Ok(value))))) }
    }

    pub fn rejected(error: AnalyticsError) -> Self {
        Self { state: Rc::new(RefCell::new(State::Settled(Rc::new(Err(error))))) }
    }

    /// Queues `callback` for the settled result; runs immediately when the
    /// promise has already settled. Callbacks run outside any internal
    /// borrow, so re-entrant `then` calls are fine.
    pub fn then(&self, callback: impl FnOnce(&PromiseResult<T>) + 'static) {
        let settled = {
            let mut state = self.state.borrow_mut();
            match &mut *state {
                State::Pending(callbacks) => {
                    callbacks.push(Box::new(callback));
                    return;
                }
                State::Settled(result) => Rc::clone(result),
            }
        };
        callback(&settled);
    }

    /// Like [`Promise::then`], but only delivers successes and skips
    /// delivery entirely once `token` is canceled. Rejections are logged at
    /// debug level: a failed lookup degrades the listener to a no-op.
    pub fn then_ok(&self, token: &CancelToken, callback: impl FnOnce(&T) + 'static) {
        let token = token.clone();
        self.then(move |result| {
            if token.is_canceled() {
                return;
            }
            match result {
                Ok(value) => callback(value),
                Err(err) => log::debug!("dropped deferred callback: {err}"),
            }
        });
    }

    pub fn is_settled(&self) -> bool {
        matches!(&*self.state.borrow(), State::Settled(_))
    }
}

impl<T: Clone + 'static> Promise<T> {
    /// First settle wins, value or error.
    pub fn race(promises: Vec<Promise<T>>) -> Promise<T> {
        let deferred = Deferred::new();
        let out = deferred.promise();
        let deferred = Rc::new(deferred);
        for promise in promises {
            let deferred = Rc::clone(&deferred);
            promise.then(move |result| match result {
                Ok(value) => deferred.resolve(value.clone()),
                Err(err) => deferred.reject(err.clone()),
            });
        }
        out
    }

    /// Resolves with every value once all inputs resolve; rejects on the
    /// first rejection.
    pub fn all(promises: Vec<Promise<T>>) -> Promise<Vec<T>> {
        let total = promises.len();
        let deferred = Rc::new(Deferred::new());
        let out = deferred.promise();
        if total == 0 {
            deferred.resolve(Vec::new());
            return out;
        }
        let slots: Rc<RefCell<Vec<Option<T>>>> = Rc::new(RefCell::new(vec![None; total]));
        let remaining = Rc::new(Cell::new(total));
        for (index, promise) in promises.into_iter().enumerate() {
            let deferred = Rc::clone(&deferred);
            let slots = Rc::clone(&slots);
            let remaining = Rc::clone(&remaining);
            promise.then(move |result| match result {
                Ok(value) => {
                    slots.borrow_mut()[index] = Some(value.clone());
                    remaining.set(remaining.get() - 1);
                    if remaining.get() == 0 {
                        let values = slots.borrow_mut().iter_mut().map(|s| s.take().unwrap()).collect();
                        deferred.resolve(values);
                    }
                }
                Err(err) => deferred.reject(err.clone()),
            });
        }
        out
    }
}

fn settle<T>(state: &Rc<RefCell<State<T>>>, result: PromiseResult<T>) {
    let callbacks = {
        let mut state = state.borrow_mut();
        match &mut *state {
            State::Settled(_) => return,
            State::Pending(callbacks) => {
                let callbacks = std::mem::take(callbacks);
                *state = State::Settled(Rc::new(result));
                callbacks
            }
        }
    };
    let settled = match &*state.borrow() {
        State::Settled(result) => Rc::clone(result),
        State::Pending(_) => unreachable!(),
    };
    for callback in callbacks {
        callback(&settled);
    }
}

/// Cooperative cancellation flag shared between a tracker and its deferred
/// callbacks. Canceling is sticky.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    canceled: Rc<Cell<bool>>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.canceled.set(true);
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn then_after_resolve_runs_immediately() {
        let promise = Promise::resolved(7u32);
        let got = Rc::new(Cell::new(0));
        let got2 = Rc::clone(&got);
        promise.then(move |r| got2.set(*r.as_ref().unwrap()));
        assert_eq!(got.get(), 7);
    }

    #[test]
    fn callbacks_run_in_registration_order_on_resolve() {
        let deferred = Deferred::new();
        let promise = deferred.promise();
        let order = Rc::new(RefCell::new(Vec::new()));
        for tag in 0..3 {
            let order = Rc::clone(&order);
            promise.then(move |_| order.borrow_mut().push(tag));
        }
        deferred.resolve(());
        assert_eq!(*order.borrow(), vec![0, 1, 2]);
    }

    #[test]
    fn second_settle_is_ignored() {
        let deferred = Deferred::new();
        let promise = deferred.promise();
        let got = Rc::new(RefCell::new(Vec::new()));
        let got2 = Rc::clone(&got);
        promise.then(move |r| got2.borrow_mut().push(r.is_ok()));
        deferred.resolve(1u8);
        deferred.reject(AnalyticsError::Disposed);
        assert_eq!(*got.borrow(), vec![true]);
    }

    #[test]
    fn then_ok_respects_cancel_token() {
        let deferred = Deferred::new();
        let promise = deferred.promise();
        let token = CancelToken::new();
        let hit = Rc::new(Cell::new(false));

        let hit2 = Rc::clone(&hit);
        promise.then_ok(&token, move |_: &u8| hit2.set(true));
        token.cancel();
        deferred.resolve(1);
        assert!(!hit.get());
    }

    #[test]
    fn race_first_settle_wins() {
        let a = Deferred::new();
        let b = Deferred::new();
        let winner = Promise::race(vec![a.promise(), b.promise()]);
        let got = Rc::new(Cell::new(0u32));
        let got2 = Rc::clone(&got);
        winner.then(move |r| got2.set(*r.as_ref().unwrap()));

        b.resolve(2);
        a.resolve(1);
        assert_eq!(got.get(), 2);
    }

    #[test]
    fn all_collects_in_input_order() {
        let a = Deferred::new();
        let b = Deferred::new();
        let all = Promise::all(vec![a.promise(), b.promise()]);
        let got = Rc::new(RefCell::new(Vec::new()));
        let got2 = Rc::clone(&got);
        all.then(move |r| *got2.borrow_mut() = r.as_ref().unwrap().clone());

        b.resolve("b");
        assert!(got.borrow().is_empty());
        a.resolve("a");
        assert_eq!(*got.borrow(), vec!["a", "b"]);
    }

    #[test]
    fn all_rejects_on_first_error() {
        let a: Deferred<u8> = Deferred::new();
        let b: Deferred<u8> = Deferred::new();
        let all = Promise::all(vec![a.promise(), b.promise()]);
        let failed = Rc::new(Cell::new(false));
        let failed2 = Rc::clone(&failed);
        all.then(move |r| failed2.set(r.is_err()));
        b.reject(AnalyticsError::EmptySelector);
        assert!(failed.get());
    }
}
