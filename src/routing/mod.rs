//! Content negotiating router.
//!
//! Routes are criteria (path, method, consumed media range, produced media type,
//! language) bound to a handler. An exchange walks a chain of stages, each
//! narrowing the candidates by one criterion:
//!
//! `Path → PathPattern → Method → Consumes → Produces → Language → Handler`
//!
//! Routes can be added, disabled, enabled and removed while the router serves.
//!
//! ```
//! use hreq_exchange::routing::Router;
//! use hreq_exchange::{Exchange, HttpError};
//! use http::Method;
//!
//! let router = Router::new();
//!
//! router
//!     .route()
//!     .path("/hello/{name}", false)
//!     .method(Method::GET)
//!     .produces("text/plain")
//!     .handler(|ex: &mut Exchange| -> Result<(), HttpError> {
//!         let name = ex.request().path_param("name").unwrap_or("world").to_string();
//!         ex.response_mut().body().string(format!("Hello {}", name))?;
//!         Ok(())
//!     })
//!     .unwrap();
//!
//! assert_eq!(router.routes().len(), 1);
//! ```

mod error;
mod link;
mod path;

pub use error::{ErrorRoute, ErrorRouteBuilder, ErrorRouter};
pub use path::{normalize_path, PathMatch, PathPattern};

use crate::exchange::{Exchange, ExchangeHandler};
use crate::media::MediaType;
use crate::{Error, HttpError};
use http::Method;
use link::{DispatchError, Link, Stage};
use path::is_parameterized;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

/// A registered criteria tuple.
///
/// Two routes are equal when their criteria are, whatever their state.
#[derive(Clone, Default)]
pub struct Route {
    path: Option<String>,
    path_pattern: Option<PathPattern>,
    method: Option<Method>,
    consumes: Option<MediaType>,
    produces: Option<MediaType>,
    language: Option<String>,
    disabled: bool,
}

impl Route {
    /// The path, or the pattern as registered for parameterized paths.
    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    /// The compiled pattern of a parameterized path.
    pub fn path_pattern(&self) -> Option<&PathPattern> {
        self.path_pattern.as_ref()
    }

    /// The request method handled.
    pub fn method(&self) -> Option<&Method> {
        self.method.as_ref()
    }

    /// The media range of request bodies handled.
    pub fn consumes(&self) -> Option<&MediaType> {
        self.consumes.as_ref()
    }

    /// The media type the handler produces.
    pub fn produces(&self) -> Option<&MediaType> {
        self.produces.as_ref()
    }

    /// The language tag the handler produces.
    pub fn language(&self) -> Option<&str> {
        self.language.as_deref()
    }

    /// Whether the route is kept out of matching.
    pub fn is_disabled(&self) -> bool {
        self.disabled
    }
}

impl PartialEq for Route {
    fn eq(&self, other: &Self) -> bool {
        self.path == other.path
            && self.path_pattern == other.path_pattern
            && self.method == other.method
            && self.consumes == other.consumes
            && self.produces == other.produces
            && self.language == other.language
    }
}

impl Eq for Route {}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("Route");
        if let Some(p) = &self.path {
            d.field("path", p);
        }
        if let Some(m) = &self.method {
            d.field("method", m);
        }
        if let Some(c) = &self.consumes {
            d.field("consumes", &c.to_string());
        }
        if let Some(p) = &self.produces {
            d.field("produces", &p.to_string());
        }
        if let Some(l) = &self.language {
            d.field("language", l);
        }
        d.field("disabled", &self.disabled).finish()
    }
}

struct Inner {
    root: Link,
    /// Serializes writers. Readers never take it.
    writer: Mutex<()>,
}

/// The routing chain, itself an [`ExchangeHandler`].
///
/// Cloning gives another handle to the same routes, so one clone can serve
/// while another changes the routes.
#[derive(Clone)]
pub struct Router {
    inner: Arc<Inner>,
}

impl Router {
    /// A router without routes. Every exchange is a 404.
    pub fn new() -> Self {
        Router {
            inner: Arc::new(Inner {
                root: Link::new(Stage::Path),
                writer: Mutex::new(()),
            }),
        }
    }

    /// Start describing routes, to register or to look up.
    pub fn route(&self) -> RouteBuilder<'_> {
        RouteBuilder {
            router: self,
            paths: vec![],
            methods: vec![],
            consumes: vec![],
            produces: vec![],
            languages: vec![],
        }
    }

    /// Every registered route, enabled or not.
    pub fn routes(&self) -> Vec<Route> {
        let mut routes = vec![];
        self.visit_routes(|route| routes.push(route.clone()));
        routes
    }

    /// Call `visitor` with every registered route.
    pub fn visit_routes(&self, mut visitor: impl FnMut(&Route)) {
        self.inner
            .root
            .visit(&Route::default(), &mut |route, _| visitor(&route));
    }

    /// Put a disabled route back into matching.
    pub fn enable_route(&self, route: &Route) {
        let _lock = self.write_lock();
        debug!("Enable route: {:?}", route);
        self.inner.root.set_disabled(route, false);
    }

    /// Take a route out of matching while keeping it registered.
    pub fn disable_route(&self, route: &Route) {
        let _lock = self.write_lock();
        debug!("Disable route: {:?}", route);
        self.inner.root.set_disabled(route, true);
    }

    /// Unregister a route. Exchanges already dispatched are not affected.
    pub fn remove_route(&self, route: &Route) {
        let _lock = self.write_lock();
        debug!("Remove route: {:?}", route);
        self.inner.root.remove_route(route);
    }

    fn write_lock(&self) -> MutexGuard<'_, ()> {
        match self.inner.writer.lock() {
            Ok(l) => l,
            Err(p) => p.into_inner(),
        }
    }
}

impl Default for Router {
    fn default() -> Self {
        Router::new()
    }
}

impl ExchangeHandler for Router {
    fn handle(&self, exchange: &mut Exchange) -> Result<(), HttpError> {
        match self.inner.root.dispatch(exchange) {
            Ok(()) => Ok(()),
            Err(DispatchError::NotFound) | Err(DispatchError::Disabled) => {
                debug!(
                    "No route: {} {}",
                    exchange.request().method(),
                    exchange.request().path()
                );
                Err(HttpError::RouteNotFound)
            }
            Err(DispatchError::Http(e)) => Err(e),
        }
    }
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router").field("routes", &self.routes()).finish()
    }
}

/// Criteria of routes to register or to look up.
///
/// Each criterion can be given several times. Registering creates one route
/// per combination.
#[derive(Debug)]
pub struct RouteBuilder<'a> {
    router: &'a Router,
    paths: Vec<(String, bool)>,
    methods: Vec<Method>,
    consumes: Vec<String>,
    produces: Vec<String>,
    languages: Vec<String>,
}

impl<'a> RouteBuilder<'a> {
    /// A path, possibly with `{name}`, `{name:regex}` or `{:regex}` parameters.
    /// With `match_trailing_slash` the path also matches with the trailing
    /// slash added or removed.
    pub fn path(mut self, path: impl Into<String>, match_trailing_slash: bool) -> Self {
        self.paths.push((path.into(), match_trailing_slash));
        self
    }

    /// A request method.
    pub fn method(mut self, method: Method) -> Self {
        self.methods.push(method);
        self
    }

    /// A media range the request content type must match.
    pub fn consumes(mut self, media_range: impl Into<String>) -> Self {
        self.consumes.push(media_range.into());
        self
    }

    /// A media type the handler produces, negotiated against `accept`.
    pub fn produces(mut self, media_type: impl Into<String>) -> Self {
        self.produces.push(media_type.into());
        self
    }

    /// A language tag negotiated against `accept-language`.
    pub fn language(mut self, language: impl Into<String>) -> Self {
        self.languages.push(language.into());
        self
    }

    /// Register the routes with `handler`. Returns the router to chain more routes.
    pub fn handler(self, handler: impl ExchangeHandler) -> Result<&'a Router, Error> {
        let routes = self.criteria()?;
        let handler: Arc<dyn ExchangeHandler> = Arc::new(handler);

        let router = self.router;
        let _lock = router.write_lock();

        for route in &routes {
            debug!("Set route: {:?}", route);
            router.inner.root.set_route(route, &handler);
        }

        Ok(router)
    }

    /// Registered routes with all the criteria given to this builder.
    ///
    /// A route without a criterion the builder names doesn't match.
    pub fn find_routes(&self) -> Result<Vec<Route>, Error> {
        let paths = expand_paths(&self.paths)?;
        let consumes = parse_all(&self.consumes)?;
        let produces = parse_all(&self.produces)?;

        let found = self
            .router
            .routes()
            .into_iter()
            .filter(|r| {
                (paths.is_empty()
                    || paths
                        .iter()
                        .any(|(p, pattern)| r.path.as_ref() == Some(p) && r.path_pattern == *pattern))
                    && contains(&self.methods, &r.method)
                    && contains(&consumes, &r.consumes)
                    && contains(&produces, &r.produces)
                    && (self.languages.is_empty()
                        || r.language
                            .as_ref()
                            .map(|l| self.languages.iter().any(|m| m.eq_ignore_ascii_case(l)))
                            .unwrap_or(false))
            })
            .collect();

        Ok(found)
    }

    /// Enable the routes found by [`find_routes`](#method.find_routes).
    pub fn enable(&self) -> Result<(), Error> {
        for route in self.find_routes()? {
            self.router.enable_route(&route);
        }
        Ok(())
    }

    /// Disable the routes found by [`find_routes`](#method.find_routes).
    pub fn disable(&self) -> Result<(), Error> {
        for route in self.find_routes()? {
            self.router.disable_route(&route);
        }
        Ok(())
    }

    /// Remove the routes found by [`find_routes`](#method.find_routes).
    pub fn remove(&self) -> Result<(), Error> {
        for route in self.find_routes()? {
            self.router.remove_route(&route);
        }
        Ok(())
    }

    /// The cartesian product of the criteria.
    fn criteria(&self) -> Result<Vec<Route>, Error> {
        let paths = optional(expand_paths(&self.paths)?);
        let methods = optional(self.methods.clone());
        let consumes = optional(parse_all(&self.consumes)?);
        let produces = optional(parse_all(&self.produces)?);
        let languages = optional(self.languages.clone());

        let mut routes = vec![];

        for path in &paths {
            for method in &methods {
                for consume in &consumes {
                    for produce in &produces {
                        for language in &languages {
                            let (path, path_pattern) = match path {
                                Some((p, pattern)) => (Some(p.clone()), pattern.clone()),
                                None => (None, None),
                            };
                            routes.push(Route {
                                path,
                                path_pattern,
                                method: method.clone(),
                                consumes: consume.clone(),
                                produces: produce.clone(),
                                language: language.clone(),
                                disabled: false,
                            });
                        }
                    }
                }
            }
        }

        Ok(routes)
    }
}

/// Path criteria: literal paths, with their trailing slash variant when
/// asked for, and compiled patterns.
fn expand_paths(paths: &[(String, bool)]) -> Result<Vec<(String, Option<PathPattern>)>, Error> {
    let mut out = vec![];

    for (path, trailing) in paths {
        if is_parameterized(path) {
            let pattern = PathPattern::parse(path, *trailing)?;
            out.push((pattern.as_str().to_string(), Some(pattern)));
            continue;
        }

        let path = normalize_path(path);
        if *trailing && path != "/" {
            let other = match path.strip_suffix('/') {
                Some(p) => p.to_string(),
                None => format!("{}/", path),
            };
            out.push((path, None));
            out.push((other, None));
        } else {
            out.push((path, None));
        }
    }

    Ok(out)
}

fn parse_all(media: &[String]) -> Result<Vec<MediaType>, Error> {
    media.iter().map(|m| MediaType::parse(m)).collect()
}

/// Each value as `Some`, or a single `None` when there are none.
fn optional<T>(values: Vec<T>) -> Vec<Option<T>> {
    if values.is_empty() {
        vec![None]
    } else {
        values.into_iter().map(Some).collect()
    }
}

fn contains<T: PartialEq>(wanted: &[T], value: &Option<T>) -> bool {
    wanted.is_empty() || value.as_ref().map(|v| wanted.contains(v)).unwrap_or(false)
}
