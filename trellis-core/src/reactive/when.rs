//! One-shot reactive waits.
//!
//! [`Engine::when`] evaluates a selector inside an effect until it yields a
//! truthy value, then stops. The value is handed over exactly once, either
//! through the returned [`When`] future or to a callback passed to
//! [`Engine::when_then`].
//!
//! A selector that is already truthy completes the wait during the call, so
//! the future is ready on its first poll.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use super::computed::Computed;
use super::effect::ObserveHandle;
use super::observable::Observable;
use super::runtime::Engine;
use crate::error::{EngineError, Result};
use crate::value::Value;

/// What a wait evaluates on every run.
#[derive(Clone)]
pub enum Selector {
    /// The value of an observable.
    Observable(Observable),
    /// The result of a closure. Reads made by the closure are tracked.
    Fn(Rc<dyn Fn() -> Value>),
}

impl Selector {
    pub fn from_fn(f: impl Fn() -> Value + 'static) -> Self {
        Selector::Fn(Rc::new(f))
    }

    fn evaluate(&self) -> Value {
        match self {
            Selector::Observable(observable) => observable.get(),
            Selector::Fn(f) => f(),
        }
    }
}

impl From<Observable> for Selector {
    fn from(observable: Observable) -> Self {
        Selector::Observable(observable)
    }
}

impl From<&Observable> for Selector {
    fn from(observable: &Observable) -> Self {
        Selector::Observable(observable.clone())
    }
}

impl From<&Computed> for Selector {
    fn from(computed: &Computed) -> Self {
        Selector::Observable(computed.observable().clone())
    }
}

impl fmt::Debug for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Selector::Observable(observable) => f.debug_tuple("Observable").field(observable).finish(),
            Selector::Fn(_) => f.write_str("Fn(..)"),
        }
    }
}

/// Future returned by [`Engine::when`].
///
/// Resolves to the first truthy value of the selector, or to
/// [`EngineError::Cancelled`] if the wait is cancelled first. Dropping the
/// future cancels the wait.
#[must_use = "a wait does nothing unless polled or inspected"]
pub struct When {
    receiver: oneshot::Receiver<Value>,
    resolved: Option<Value>,
    effect: ObserveHandle,
}

impl When {
    /// The truthy value, if the wait has already completed.
    pub fn try_value(&mut self) -> Option<Value> {
        if self.resolved.is_none() {
            self.resolved = self.receiver.try_recv().ok();
        }
        self.resolved.clone()
    }

    /// Stop waiting. A pending future resolves to
    /// [`EngineError::Cancelled`].
    pub fn cancel(&self) {
        self.effect.dispose();
    }

    /// `true` once the wait has stopped, by completing or by cancellation.
    pub fn is_finished(&self) -> bool {
        self.effect.is_disposed()
    }
}

impl Future for When {
    type Output = Result<Value>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Some(value) = self.resolved.take() {
            return Poll::Ready(Ok(value));
        }
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|received| received.map_err(|_| EngineError::Cancelled))
    }
}

impl Drop for When {
    fn drop(&mut self) {
        self.effect.dispose();
    }
}

impl fmt::Debug for When {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("When")
            .field("resolved", &self.resolved)
            .field("effect", &self.effect)
            .finish()
    }
}

impl Engine {
    /// Wait until `selector` yields a truthy value.
    ///
    /// # Example
    ///
    /// ```rust
    /// use trellis_core::{Engine, Value};
    ///
    /// let engine = Engine::new();
    /// let ready = engine.observable(false);
    ///
    /// let mut wait = engine.when(&ready);
    /// assert_eq!(wait.try_value(), None);
    ///
    /// ready.set(true);
    /// assert_eq!(wait.try_value(), Some(Value::from(true)));
    /// ```
    pub fn when(&self, selector: impl Into<Selector>) -> When {
        let selector = selector.into();
        let (sender, receiver) = oneshot::channel();
        let mut sender = Some(sender);
        let effect = self.observe(move |event| {
            let value = selector.evaluate();
            if value.is_truthy() {
                if let Some(sender) = sender.take() {
                    let _ = sender.send(value);
                }
                event.cancel = true;
            }
        });
        When {
            receiver,
            resolved: None,
            effect,
        }
    }

    /// Run `effect` once, with the first truthy value of `selector`.
    ///
    /// `effect` runs untracked. Dispose the returned handle to give up the
    /// wait.
    pub fn when_then<F>(&self, selector: impl Into<Selector>, effect: F) -> ObserveHandle
    where
        F: FnOnce(Value) + 'static,
    {
        let selector = selector.into();
        let engine = self.downgrade();
        let mut effect = Some(effect);
        self.observe(move |event| {
            let value = selector.evaluate();
            if !value.is_truthy() {
                return;
            }
            event.cancel = true;
            if let (Some(effect), Some(engine)) = (effect.take(), engine.upgrade()) {
                engine.untracked(|| effect(value));
            }
        })
    }
}
