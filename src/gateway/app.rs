use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::gateway::queue::{EventReceiver, EventSender};
use crate::gateway::scope::Scope;

/// The application contract: called once per scope with the scope record
/// and the `receive`/`send` halves bound to that scope's queues. The
/// returned future settles when the application is done with the scope.
///
/// Closures implement it directly; [`from_fn`] helps type inference along:
///
/// ```
/// use pagi::gateway::app::{from_fn, SharedApp};
/// use pagi::gateway::{Event, Scope};
///
/// let hello: SharedApp = from_fn(|scope, _receive, send| async move {
///     if let Scope::Http(_) = scope {
///         send.send(Event::response_start(200, [("content-type", "text/plain")]))
///             .await?;
///         send.send(Event::response_body("Hello from PAGI!", false)).await?;
///     }
///     Ok(())
/// });
/// ```
pub trait Application: Send + Sync + 'static {
    fn call(
        &self,
        scope: Scope,
        receive: EventReceiver,
        send: EventSender,
    ) -> BoxFuture<'static, anyhow::Result<()>>;
}

impl<F, Fut> Application for F
where
    F: Fn(Scope, EventReceiver, EventSender) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    fn call(
        &self,
        scope: Scope,
        receive: EventReceiver,
        send: EventSender,
    ) -> BoxFuture<'static, anyhow::Result<()>> {
        Box::pin(self(scope, receive, send))
    }
}

/// An application shared by every connection task.
pub type SharedApp = Arc<dyn Application>;

/// Wraps a closure as a [`SharedApp`].
pub fn from_fn<F, Fut>(f: F) -> SharedApp
where
    F: Fn(Scope, EventReceiver, EventSender) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(f)
}
