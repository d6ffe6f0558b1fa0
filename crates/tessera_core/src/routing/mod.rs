//! Routes, members and routing event hooks.

mod event;
mod member;
mod route;

pub use event::{HookPhase, HookRegistry, RoutingEvent, RoutingEventHook};
pub use member::{Member, MemberRegistry, MemberStatus};
pub use route::{CatchUpCheck, Route, RoutingService};
