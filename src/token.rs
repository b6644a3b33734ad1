//! One-shot result-or-error notification, the handoff point between the
//! wire parsers and a caller.
//!
//! pbxwire's core is single-threaded cooperative: nothing here is
//! internally locked, and callbacks fire synchronously from inside the
//! call that delivers the result. [`Rc`]/[`RefCell`] is therefore the
//! right shared-ownership primitive, not `Arc`/`Mutex` — there is never
//! more than one logical thread driving a given token.
use std::cell::RefCell;
use std::rc::Rc;

use crate::ProgrammerError;

struct Inner<T, E> {
    triggered: bool,
    cancelled: bool,
    on_result: Option<Box<dyn FnOnce(T)>>,
    on_exception: Option<Box<dyn FnOnce(E)>>,
}

impl<T, E> Default for Inner<T, E> {
    fn default() -> Self {
        Self {
            triggered: false,
            cancelled: false,
            on_result: None,
            on_exception: None,
        }
    }
}

/// A one-shot notification of a result `T` or an error `E`.
///
/// A token fires exactly once, via [`CompletionToken::set_result`] or
/// [`CompletionToken::set_exception`]. Binding a second callback of the
/// same kind, or firing twice, is a [`ProgrammerError`]. If
/// [`CompletionToken::set_exception`] is called with no exception callback
/// bound, the error is returned to the *caller* of `set_exception` rather
/// than swallowed — this is how an unhandled protocol error on an action
/// propagates back to whoever is driving the parser.
///
/// Cloning a token gives another handle to the same underlying state;
/// callers typically keep one clone to bind callbacks on and give another
/// to whatever is tracking it internally (an action map, a command FIFO).
pub struct CompletionToken<T, E> {
    inner: Rc<RefCell<Inner<T, E>>>,
}

impl<T, E> Clone for CompletionToken<T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T, E> Default for CompletionToken<T, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, E> CompletionToken<T, E> {
    /// Creates a fresh, unfired token with no bound callbacks.
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner::default())),
        }
    }

    /// Binds `cb` as the result callback. Fails if a result callback is
    /// already bound.
    pub fn on_result(&self, cb: impl FnOnce(T) + 'static) -> Result<(), ProgrammerError> {
        let mut inner = self.inner.borrow_mut();
        if inner.on_result.is_some() {
            return Err(ProgrammerError::CallbackAlreadyBound);
        }
        inner.on_result = Some(Box::new(cb));
        Ok(())
    }

    /// Binds `cb` as the exception callback. Fails if an exception callback
    /// is already bound.
    pub fn on_exception(&self, cb: impl FnOnce(E) + 'static) -> Result<(), ProgrammerError> {
        let mut inner = self.inner.borrow_mut();
        if inner.on_exception.is_some() {
            return Err(ProgrammerError::CallbackAlreadyBound);
        }
        inner.on_exception = Some(Box::new(cb));
        Ok(())
    }

    /// Whether this token has already fired (successfully or not) or was
    /// cancelled.
    pub fn is_triggered(&self) -> bool {
        let inner = self.inner.borrow();
        inner.triggered || inner.cancelled
    }

    /// Detaches this token from whatever holds it pending. Cancelled tokens
    /// silently discard any later `set_result`/`set_exception`. Cancelling a
    /// token that already fired, or was already cancelled, is a no-op.
    pub fn cancel(&self) {
        self.inner.borrow_mut().cancelled = true;
    }

    /// Whether `self` and `other` are handles to the same underlying token.
    ///
    /// Used by owners that key a token by some external id (an AMI action
    /// id, say) to tell a live token apart from a different one that has
    /// since taken over the same key.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Fires this token with a successful `result`.
    ///
    /// # Errors
    /// Returns [`ProgrammerError::AlreadyTriggered`] if the token already
    /// fired. A cancelled token accepts and discards the result without
    /// error.
    pub fn set_result(&self, result: T) -> Result<(), ProgrammerError> {
        let cb = {
            let mut inner = self.inner.borrow_mut();
            if inner.cancelled {
                return Ok(());
            }
            if inner.triggered {
                return Err(ProgrammerError::AlreadyTriggered);
            }
            inner.triggered = true;
            inner.on_result.take()
        };
        if let Some(cb) = cb {
            cb(result);
        }
        Ok(())
    }

    /// Fires this token with a failure `exc`.
    ///
    /// If no exception callback is bound, `exc` is returned as `Err` rather
    /// than swallowed: the caller of `set_exception` becomes responsible
    /// for it.
    ///
    /// # Errors
    /// Returns [`ProgrammerError::AlreadyTriggered`] if the token already
    /// fired (wrapped, alongside `exc`, so nothing is lost; see
    /// [`SetExceptionError`]).
    pub fn set_exception(&self, exc: E) -> Result<(), SetExceptionError<E>> {
        let cb = {
            let mut inner = self.inner.borrow_mut();
            if inner.cancelled {
                return Ok(());
            }
            if inner.triggered {
                return Err(SetExceptionError::AlreadyTriggered(exc));
            }
            inner.triggered = true;
            inner.on_exception.take()
        };
        match cb {
            Some(cb) => {
                cb(exc);
                Ok(())
            }
            None => Err(SetExceptionError::Unhandled(exc)),
        }
    }
}

/// What went wrong delivering a [`CompletionToken::set_exception`] call.
///
/// `Unhandled` is not really an error in this crate's own bookkeeping — it
/// is the intended way an exception with no bound callback propagates to
/// the code driving the parser, per the token's documented contract.
#[derive(Debug)]
pub enum SetExceptionError<E> {
    /// The token had already fired; `exc` is handed back unconsumed.
    AlreadyTriggered(E),
    /// No exception callback was bound; `exc` must be handled by the
    /// caller of `set_exception`.
    Unhandled(E),
}

/// Combines several tokens into one that fires successfully with the
/// ordered list of their results once all of them succeed, or fires with
/// the first exception observed. Once the aggregate has fired, further
/// completions from its children are ignored.
pub fn aggregate<T: 'static, E: 'static>(
    tokens: Vec<CompletionToken<T, E>>,
) -> CompletionToken<Vec<T>, E> {
    let out: CompletionToken<Vec<T>, E> = CompletionToken::new();
    let remaining = Rc::new(RefCell::new(tokens.len()));
    let results: Rc<RefCell<Vec<Option<T>>>> =
        Rc::new(RefCell::new((0..tokens.len()).map(|_| None).collect()));
    let fired = Rc::new(RefCell::new(false));

    for (idx, token) in tokens.into_iter().enumerate() {
        let out_ok = out.clone();
        let out_err = out.clone();
        let remaining_ok = Rc::clone(&remaining);
        let results_ok = Rc::clone(&results);
        let fired_ok = Rc::clone(&fired);
        let fired_err = Rc::clone(&fired);
        let _ = token.on_result(move |v| {
            if *fired_ok.borrow() {
                return;
            }
            results_ok.borrow_mut()[idx] = Some(v);
            *remaining_ok.borrow_mut() -= 1;
            if *remaining_ok.borrow() == 0 {
                *fired_ok.borrow_mut() = true;
                let collected = results_ok
                    .borrow_mut()
                    .drain(..)
                    .map(|v| v.expect("all slots filled when remaining reaches zero"))
                    .collect();
                let _ = out_ok.set_result(collected);
            }
        });
        let _ = token.on_exception(move |e| {
            if *fired_err.borrow() {
                return;
            }
            *fired_err.borrow_mut() = true;
            let _ = out_err.set_exception(e);
        });
    }
    out
}
