//! The node running on the current thread.
//!
//! Node entry functions receive their [`NodeContext`] explicitly. Helpers
//! deep inside user code can reach it through these free functions instead
//! of threading it through every call. Outside a managed node they fail
//! with [`BusError::NoContext`].

use std::cell::RefCell;
use std::marker::PhantomData;
use std::time::Duration;

use bytes::Bytes;

use crate::error::BusError;
use crate::message::Envelope;
use crate::node::NodeContext;

thread_local! {
    static CURRENT: RefCell<Option<NodeContext>> = const { RefCell::new(None) };
}

/// Restores the previous context when dropped.
#[must_use = "the context is cleared when the guard is dropped"]
pub struct ContextGuard {
    previous: Option<NodeContext>,
    // Must be dropped on the thread that created it.
    _not_send: PhantomData<*const ()>,
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT.with(|current| *current.borrow_mut() = previous);
    }
}

/// Make `ctx` the current node for this thread.
pub fn enter(ctx: NodeContext) -> ContextGuard {
    let previous = CURRENT.with(|current| current.borrow_mut().replace(ctx));
    ContextGuard {
        previous,
        _not_send: PhantomData,
    }
}

/// Run `f` with the current node.
///
/// # Errors
///
/// Returns `NoContext` outside a managed node.
pub fn with_current<R>(f: impl FnOnce(&NodeContext) -> R) -> Result<R, BusError> {
    // Clone out so `f` may itself use the free functions.
    let ctx = current()?;
    Ok(f(&ctx))
}

/// Get a handle to the current node.
///
/// # Errors
///
/// Returns `NoContext` outside a managed node.
pub fn current() -> Result<NodeContext, BusError> {
    CURRENT.with(|current| current.borrow().clone().ok_or(BusError::NoContext))
}

/// Publish from the current node. See [`NodeContext::publish`].
///
/// # Errors
///
/// Returns `NoContext` outside a managed node.
pub fn publish(topic: impl Into<String>, payload: impl Into<Bytes>) -> Result<bool, BusError> {
    with_current(|ctx| ctx.publish(topic, payload))
}

/// Subscribe the current node. See [`NodeContext::subscribe`].
///
/// # Errors
///
/// Returns `NoContext` outside a managed node.
pub fn subscribe(
    topic: impl Into<String>,
    ensure_ack: bool,
    ack_timeout: Duration,
) -> Result<bool, BusError> {
    with_current(|ctx| ctx.subscribe(topic, ensure_ack, ack_timeout))
}

/// Unsubscribe the current node. See [`NodeContext::unsubscribe`].
///
/// # Errors
///
/// Returns `NoContext` outside a managed node.
pub fn unsubscribe(
    topic: impl Into<String>,
    ensure_ack: bool,
    ack_timeout: Duration,
) -> Result<bool, BusError> {
    with_current(|ctx| ctx.unsubscribe(topic, ensure_ack, ack_timeout))
}

/// Receive on the current node. See [`NodeContext::receive`].
///
/// # Errors
///
/// Returns `NoContext` outside a managed node.
pub fn receive(block: bool, timeout: Duration) -> Result<Vec<Envelope>, BusError> {
    with_current(|ctx| ctx.receive(block, timeout))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::tests::detached_context;

    #[test]
    fn test_no_context_outside_node() {
        assert!(matches!(current(), Err(BusError::NoContext)));
        assert!(matches!(
            publish("a", vec![1u8]),
            Err(BusError::NoContext)
        ));
        assert!(matches!(
            subscribe("a", false, Duration::ZERO),
            Err(BusError::NoContext)
        ));
    }

    #[test]
    fn test_enter_and_restore() {
        let (ctx, _record, outbound, _) = detached_context("outer");
        let (inner, _inner_record, _, _) = detached_context("inner");

        {
            let _guard = enter(ctx);
            assert_eq!(current().unwrap().name(), "outer");
            assert!(publish("lidar/scan", vec![9u8]).unwrap());

            {
                let _guard = enter(inner);
                assert_eq!(current().unwrap().name(), "inner");
            }
            assert_eq!(current().unwrap().name(), "outer");
        }

        assert!(matches!(current(), Err(BusError::NoContext)));
        assert_eq!(outbound.try_pop().unwrap().sender, "outer");
    }

    #[test]
    fn test_context_is_per_thread() {
        let (ctx, _record, _, _) = detached_context("n");
        let _guard = enter(ctx);

        let other = std::thread::spawn(|| matches!(current(), Err(BusError::NoContext)));
        assert!(other.join().unwrap());
    }
}
