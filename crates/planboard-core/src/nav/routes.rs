/// Who may open a route.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteClass {
    Protected,
    GuestOnly,
    Public,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteMeta {
    pub requires_auth: bool,
    pub requires_guest: bool,
    pub title: Option<String>,
}

impl RouteMeta {
    /// `requires_auth` wins if both tags are set.
    pub fn class(&self) -> RouteClass {
        if self.requires_auth {
            RouteClass::Protected
        } else if self.requires_guest {
            RouteClass::GuestOnly
        } else {
            RouteClass::Public
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteKind {
    View,
    /// Pseudo-route that signs out instead of rendering.
    Logout,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub path: String,
    pub name: String,
    pub kind: RouteKind,
    pub meta: RouteMeta,
}

impl Route {
    fn view(path: &str, name: &str, meta: RouteMeta) -> Self {
        Self {
            path: normalize(path),
            name: name.to_string(),
            kind: RouteKind::View,
            meta,
        }
    }

    pub fn protected(path: &str, name: &str, title: &str) -> Self {
        Self::view(
            path,
            name,
            RouteMeta {
                requires_auth: true,
                title: Some(title.to_string()),
                ..RouteMeta::default()
            },
        )
    }

    pub fn guest_only(path: &str, name: &str, title: &str) -> Self {
        Self::view(
            path,
            name,
            RouteMeta {
                requires_guest: true,
                title: Some(title.to_string()),
                ..RouteMeta::default()
            },
        )
    }

    pub fn public(path: &str, name: &str, title: Option<&str>) -> Self {
        Self::view(
            path,
            name,
            RouteMeta {
                title: title.map(str::to_string),
                ..RouteMeta::default()
            },
        )
    }

    pub fn logout(path: &str) -> Self {
        Self {
            path: normalize(path),
            name: "Logout".to_string(),
            kind: RouteKind::Logout,
            meta: RouteMeta::default(),
        }
    }

    pub fn class(&self) -> RouteClass {
        self.meta.class()
    }
}

#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    routes: Vec<Route>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// The dashboard's route table.
    pub fn dashboard() -> Self {
        Self::new()
            .route(Route::protected("/", "Dashboard", "Dashboard"))
            .route(Route::protected("/projects", "Projects", "Projects"))
            .route(Route::protected("/tasks", "Tasks", "Tasks"))
            .route(Route::protected("/visualizations", "Visualizations", "Visualizations"))
            .route(Route::guest_only("/login", "Login", "Sign in"))
            .route(Route::guest_only("/register", "Register", "Create account"))
            .route(Route::public("/about", "About", None))
            .route(Route::logout("/logout"))
    }

    /// Add a route; a later route with the same path replaces the earlier.
    pub fn route(mut self, route: Route) -> Self {
        self.routes.retain(|existing| existing.path != route.path);
        self.routes.push(route);
        self
    }

    pub fn find(&self, path: &str) -> Option<&Route> {
        let path = normalize(path);
        self.routes.iter().find(|route| route.path == path)
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }
}

/// Strip query and fragment, ensure a leading slash, drop a trailing one.
pub fn normalize(path: &str) -> String {
    let path = path
        .split(|c: char| c == '?' || c == '#')
        .next()
        .unwrap_or_default()
        .trim();
    let trimmed = path.trim_matches('/');
    format!("/{}", trimmed)
}
