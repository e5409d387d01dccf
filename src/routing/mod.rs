//! Routing engine: matches an event payload against configured routes.
//!
//! Every route whose condition holds produces one dispatch; routes are
//! independent, so several may target the same destination.

mod condition;
mod router;

pub use condition::{Comparator, Condition, ConditionError, Operator, PathQuery};
pub use router::{DispatchTemplate, Route, RouteDefaults, RoutingConfig};
