//! The application-facing side of the server.
//!
//! - **`scope`**: the per-request/per-stream context record
//! - **`event`**: the event vocabulary exchanged through `receive`/`send`
//! - **`queue`**: bounded inbound/outbound event queues (flow control)
//! - **`app`**: the [`Application`] contract
//! - **`driver`**: runs one application invocation per scope
//! - **`lifespan`**: process-wide startup/shutdown
//! - **`extensions`**: optional per-scope capabilities
//! - **`state`**: state shared from lifespan into every scope
//! - **`broadcast`**: in-process fan-out for applications

pub mod app;
pub mod broadcast;
pub mod driver;
pub mod event;
pub mod extensions;
pub mod lifespan;
pub mod queue;
pub mod scope;
pub mod state;

pub use app::{from_fn, Application, SharedApp};
pub use broadcast::{Broadcaster, LocalBroadcaster, Subscription};
pub use driver::{AppOutcome, AppTask};
pub use event::{Event, Message, SseEvent};
pub use extensions::{Extension, ExtensionRegistry, Extensions};
pub use lifespan::{LifespanController, LifespanError, LifespanPhase};
pub use queue::{EventReceiver, EventSender};
pub use scope::{ConnectionInfo, ConnectionScope, Scope, ScopeType, TlsInfo};
pub use state::State;
