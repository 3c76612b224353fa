pub mod guard;
pub mod routes;

pub use guard::{Decision, Navigation, NavigationError, NavigationGuard, Navigator};
pub use routes::{Route, RouteClass, RouteKind, RouteMeta, RouteTable};
