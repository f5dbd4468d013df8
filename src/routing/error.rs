//! Routing of failed exchanges to error handlers.
//!
//! An error route picks an [`ErrorExchangeHandler`] by the status of the
//! failure, the request path and the media type the handler produces. The
//! most specific matching route wins: a route naming the status beats one that
//! doesn't, a literal path beats a pattern which beats no path. Among equally
//! specific routes the `accept` header decides.

use super::path::{normalize_path, PathPattern};
use super::{contains, expand_paths, optional, parse_all};
use crate::exchange::{DefaultErrorHandler, ErrorExchange, ErrorExchangeHandler};
use crate::media::{Accept, MediaType};
use crate::{Error, HttpError};
use arc_swap::ArcSwap;
use http::header::CONTENT_TYPE;
use http::StatusCode;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

/// A registered error route.
///
/// Two routes are equal when their criteria are, whatever their state.
#[derive(Clone, Default)]
pub struct ErrorRoute {
    error: Option<StatusCode>,
    path: Option<String>,
    path_pattern: Option<PathPattern>,
    produces: Option<MediaType>,
    disabled: bool,
}

impl ErrorRoute {
    /// The status of the failures handled, `None` for any.
    pub fn error(&self) -> Option<StatusCode> {
        self.error
    }

    /// The path, or the pattern as registered for parameterized paths.
    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    /// The compiled pattern of a parameterized path.
    pub fn path_pattern(&self) -> Option<&PathPattern> {
        self.path_pattern.as_ref()
    }

    /// The media type the handler produces.
    pub fn produces(&self) -> Option<&MediaType> {
        self.produces.as_ref()
    }

    /// Whether the route is kept out of matching.
    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    /// How well the route matches, `None` when it doesn't.
    fn rank(&self, status: StatusCode, path: &str) -> Option<(u8, u8)> {
        let error = match self.error {
            None => 0,
            Some(s) if s == status => 1,
            Some(_) => return None,
        };

        let path = match (&self.path_pattern, &self.path) {
            (Some(pattern), _) => {
                pattern.matches(path)?;
                1
            }
            (None, Some(p)) if p == path => 2,
            (None, Some(_)) => return None,
            (None, None) => 0,
        };

        Some((error, path))
    }
}

impl PartialEq for ErrorRoute {
    fn eq(&self, other: &Self) -> bool {
        self.error == other.error
            && self.path == other.path
            && self.path_pattern == other.path_pattern
            && self.produces == other.produces
    }
}

impl Eq for ErrorRoute {}

impl fmt::Debug for ErrorRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("ErrorRoute");
        if let Some(e) = &self.error {
            d.field("error", &e.as_u16());
        }
        if let Some(p) = &self.path {
            d.field("path", p);
        }
        if let Some(p) = &self.produces {
            d.field("produces", &p.to_string());
        }
        d.field("disabled", &self.disabled).finish()
    }
}

struct Entry {
    route: ErrorRoute,
    handler: Arc<dyn ErrorExchangeHandler>,
}

struct Inner {
    routes: ArcSwap<Vec<Arc<Entry>>>,
    writer: Mutex<()>,
    fallback: Arc<dyn ErrorExchangeHandler>,
}

/// Error routes, itself an [`ErrorExchangeHandler`] for
/// [`Service::with_error_handler`](crate::Service::with_error_handler).
///
/// Failures no route matches go to the fallback handler, the
/// [`DefaultErrorHandler`] unless another is given.
///
/// ```
/// use hreq_exchange::routing::ErrorRouter;
/// use hreq_exchange::{ErrorExchange, HttpError};
/// use http::StatusCode;
///
/// let errors = ErrorRouter::new();
/// errors
///     .route()
///     .error(StatusCode::NOT_FOUND)
///     .produces("text/html")
///     .handler(|ex: &mut ErrorExchange| -> Result<(), HttpError> {
///         ex.response().headers().set_status(StatusCode::NOT_FOUND)?;
///         ex.response_mut().body().string("<h1>Not here</h1>")?;
///         Ok(())
///     })
///     .unwrap();
///
/// assert_eq!(errors.routes().len(), 1);
/// ```
#[derive(Clone)]
pub struct ErrorRouter {
    inner: Arc<Inner>,
}

impl ErrorRouter {
    /// No routes, failures go to the [`DefaultErrorHandler`].
    pub fn new() -> Self {
        Self::with_fallback(DefaultErrorHandler)
    }

    /// No routes, failures go to `fallback`.
    pub fn with_fallback(fallback: impl ErrorExchangeHandler) -> Self {
        ErrorRouter {
            inner: Arc::new(Inner {
                routes: ArcSwap::from_pointee(vec![]),
                writer: Mutex::new(()),
                fallback: Arc::new(fallback),
            }),
        }
    }

    /// Start describing error routes, to register or to look up.
    pub fn route(&self) -> ErrorRouteBuilder<'_> {
        ErrorRouteBuilder {
            router: self,
            errors: vec![],
            paths: vec![],
            produces: vec![],
        }
    }

    /// Every registered route, enabled or not.
    pub fn routes(&self) -> Vec<ErrorRoute> {
        self.inner
            .routes
            .load()
            .iter()
            .map(|e| e.route.clone())
            .collect()
    }

    /// Put a disabled route back into matching.
    pub fn enable_route(&self, route: &ErrorRoute) {
        debug!("Enable error route: {:?}", route);
        self.set_disabled(route, false);
    }

    /// Take a route out of matching while keeping it registered.
    pub fn disable_route(&self, route: &ErrorRoute) {
        debug!("Disable error route: {:?}", route);
        self.set_disabled(route, true);
    }

    /// Unregister a route.
    pub fn remove_route(&self, route: &ErrorRoute) {
        let _lock = self.write_lock();
        debug!("Remove error route: {:?}", route);
        let mut routes = (**self.inner.routes.load()).clone();
        routes.retain(|e| e.route != *route);
        self.inner.routes.store(Arc::new(routes));
    }

    fn set(&self, route: ErrorRoute, handler: &Arc<dyn ErrorExchangeHandler>) {
        let mut routes = (**self.inner.routes.load()).clone();
        let entry = Arc::new(Entry {
            route,
            handler: handler.clone(),
        });

        match routes.iter_mut().find(|e| e.route == entry.route) {
            Some(existing) => *existing = entry,
            None => routes.push(entry),
        }

        self.inner.routes.store(Arc::new(routes));
    }

    fn set_disabled(&self, route: &ErrorRoute, disabled: bool) {
        let _lock = self.write_lock();
        let routes = self
            .inner
            .routes
            .load()
            .iter()
            .map(|e| {
                if e.route == *route {
                    let mut changed = e.route.clone();
                    changed.disabled = disabled;
                    Arc::new(Entry {
                        route: changed,
                        handler: e.handler.clone(),
                    })
                } else {
                    e.clone()
                }
            })
            .collect();
        self.inner.routes.store(Arc::new(routes));
    }

    fn write_lock(&self) -> MutexGuard<'_, ()> {
        match self.inner.writer.lock() {
            Ok(l) => l,
            Err(p) => p.into_inner(),
        }
    }

    /// The handler for the exchange, and the media type it is to produce.
    fn select(&self, exchange: &ErrorExchange) -> Option<(Arc<dyn ErrorExchangeHandler>, Option<MediaType>)> {
        let routes = self.inner.routes.load();
        let status = exchange.error().status();
        let path = normalize_path(exchange.request().path());

        let mut candidates: Vec<((u8, u8), &Entry)> = routes
            .iter()
            .filter(|e| !e.route.disabled)
            .filter_map(|e| e.route.rank(status, &path).map(|r| (r, &**e)))
            .collect();

        // stable, equal ranks keep registration order.
        candidates.sort_by(|a, b| b.0.cmp(&a.0));

        let accept = Accept::from_headers(exchange.request().headers());

        let mut rest = &candidates[..];
        while let Some((rank, _)) = rest.first() {
            let len = rest.iter().take_while(|(r, _)| r == rank).count();
            let (group, tail) = rest.split_at(len);
            rest = tail;

            let plain = group.iter().find(|(_, e)| e.route.produces.is_none());

            let mut producing: Vec<(MediaType, &Entry)> = group
                .iter()
                .filter_map(|(_, e)| e.route.produces.clone().map(|m| (m, *e)))
                .collect();
            producing.sort_by(|a, b| a.0.compare_specificity(&b.0));

            match (accept.find_all_match(&producing).first(), plain) {
                (Some((range, _)), Some((_, e))) if range.media_type().is_any() => {
                    return Some((e.handler.clone(), None));
                }
                (Some((_, (media_type, e))), _) => {
                    return Some((e.handler.clone(), Some(media_type.clone())));
                }
                (None, Some((_, e))) => return Some((e.handler.clone(), None)),
                (None, None) => {
                    trace!("No acceptable error route of rank {:?}", rank);
                }
            }
        }

        None
    }
}

impl Default for ErrorRouter {
    fn default() -> Self {
        ErrorRouter::new()
    }
}

impl ErrorExchangeHandler for ErrorRouter {
    fn handle(&self, exchange: &mut ErrorExchange) -> Result<(), HttpError> {
        match self.select(exchange) {
            Some((handler, media_type)) => {
                if let Some(media_type) = media_type {
                    exchange
                        .response()
                        .headers()
                        .set(CONTENT_TYPE, media_type.to_string())?;
                }
                handler.handle(exchange)
            }
            None => {
                trace!("No error route for: {}", exchange.error());
                self.inner.fallback.handle(exchange)
            }
        }
    }
}

impl fmt::Debug for ErrorRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorRouter").field("routes", &self.routes()).finish()
    }
}

/// Criteria of error routes to register or to look up.
///
/// Each criterion can be given several times. Registering creates one route
/// per combination.
#[derive(Debug)]
pub struct ErrorRouteBuilder<'a> {
    router: &'a ErrorRouter,
    errors: Vec<StatusCode>,
    paths: Vec<(String, bool)>,
    produces: Vec<String>,
}

impl<'a> ErrorRouteBuilder<'a> {
    /// The status of the failures to handle.
    pub fn error(mut self, status: StatusCode) -> Self {
        self.errors.push(status);
        self
    }

    /// A request path, possibly with parameters, as for [`RouteBuilder::path`](super::RouteBuilder::path).
    pub fn path(mut self, path: impl Into<String>, match_trailing_slash: bool) -> Self {
        self.paths.push((path.into(), match_trailing_slash));
        self
    }

    /// A media type the handler produces, negotiated against `accept`.
    pub fn produces(mut self, media_type: impl Into<String>) -> Self {
        self.produces.push(media_type.into());
        self
    }

    /// Register the routes with `handler`. Returns the router to chain more routes.
    pub fn handler(self, handler: impl ErrorExchangeHandler) -> Result<&'a ErrorRouter, Error> {
        let routes = self.criteria()?;
        let handler: Arc<dyn ErrorExchangeHandler> = Arc::new(handler);

        let router = self.router;
        let _lock = router.write_lock();

        for route in routes {
            debug!("Set error route: {:?}", route);
            router.set(route, &handler);
        }

        Ok(router)
    }

    /// Registered routes with all the criteria given to this builder.
    pub fn find_routes(&self) -> Result<Vec<ErrorRoute>, Error> {
        let paths = expand_paths(&self.paths)?;
        let produces = parse_all(&self.produces)?;

        let found = self
            .router
            .routes()
            .into_iter()
            .filter(|r| {
                contains(&self.errors, &r.error)
                    && (paths.is_empty()
                        || paths
                            .iter()
                            .any(|(p, pattern)| r.path.as_ref() == Some(p) && r.path_pattern == *pattern))
                    && contains(&produces, &r.produces)
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

    fn criteria(&self) -> Result<Vec<ErrorRoute>, Error> {
        let errors = optional(self.errors.clone());
        let paths = optional(expand_paths(&self.paths)?);
        let produces = optional(parse_all(&self.produces)?);

        let mut routes = vec![];

        for error in &errors {
            for path in &paths {
                for produce in &produces {
                    let (path, path_pattern) = match path {
                        Some((p, pattern)) => (Some(p.clone()), pattern.clone()),
                        None => (None, None),
                    };
                    routes.push(ErrorRoute {
                        error: *error,
                        path,
                        path_pattern,
                        produces: produce.clone(),
                        disabled: false,
                    });
                }
            }
        }

        Ok(routes)
    }
}
