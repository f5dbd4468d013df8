//! The typed stages of the routing chain.
//!
//! A keyed stage maps criterion values to sub-chains starting at the following
//! stage, and holds one more chain (`next`) for routes that don't specify its
//! criterion. Each table is an immutable snapshot swapped whole on change, so
//! dispatch never waits for a writer.

use super::path::{normalize_path, PathPattern};
use super::Route;
use crate::exchange::{Exchange, ExchangeHandler};
use crate::media::{find_first_match, Accept, AcceptLanguage, MediaType};
use crate::HttpError;
use arc_swap::ArcSwap;
use http::header::CONTENT_TYPE;
use http::Method;
use std::cmp::Ordering;
use std::sync::Arc;

/// Why a chain didn't handle an exchange.
#[derive(Debug)]
pub(crate) enum DispatchError {
    /// No route for the exchange. Enclosing stages try their next alternative.
    NotFound,
    /// Only disabled routes for the exchange. Treated like `NotFound`.
    Disabled,
    /// A client visible failure that ends the dispatch.
    Http(HttpError),
}

impl DispatchError {
    fn is_miss(&self) -> bool {
        matches!(self, DispatchError::NotFound | DispatchError::Disabled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Stage {
    Path,
    PathPattern,
    Method,
    Consumes,
    Produces,
    Language,
    Handler,
}

impl Stage {
    fn next(self) -> Stage {
        match self {
            Stage::Path => Stage::PathPattern,
            Stage::PathPattern => Stage::Method,
            Stage::Method => Stage::Consumes,
            Stage::Consumes => Stage::Produces,
            Stage::Produces => Stage::Language,
            Stage::Language | Stage::Handler => Stage::Handler,
        }
    }
}

type Visitor<'a> = dyn FnMut(Route, &Arc<dyn ExchangeHandler>) + 'a;

pub(crate) enum Link {
    Path(Keyed<String>),
    PathPattern(Keyed<PathPattern>),
    Method(Keyed<Method>),
    Consumes(Keyed<MediaType>),
    Produces(Keyed<MediaType>),
    Language(Keyed<String>),
    Handler(HandlerLink),
}

impl Link {
    /// An empty chain starting at `stage`.
    pub fn new(stage: Stage) -> Link {
        match stage {
            Stage::Path => Link::Path(Keyed::new(stage, None)),
            Stage::PathPattern => Link::PathPattern(Keyed::new(stage, None)),
            Stage::Method => Link::Method(Keyed::new(stage, None)),
            Stage::Consumes => Link::Consumes(Keyed::new(stage, Some(by_specificity))),
            Stage::Produces => Link::Produces(Keyed::new(stage, Some(by_specificity))),
            Stage::Language => Link::Language(Keyed::new(stage, None)),
            Stage::Handler => Link::Handler(HandlerLink::default()),
        }
    }

    pub fn set_route(&self, route: &Route, handler: &Arc<dyn ExchangeHandler>) {
        match self {
            Link::Path(k) => k.set(path_key(route), route, handler),
            Link::PathPattern(k) => k.set(route.path_pattern.clone(), route, handler),
            Link::Method(k) => k.set(route.method.clone(), route, handler),
            Link::Consumes(k) => k.set(route.consumes.clone(), route, handler),
            Link::Produces(k) => k.set(route.produces.clone(), route, handler),
            Link::Language(k) => k.set(route.language.clone(), route, handler),
            Link::Handler(h) => h.set(handler),
        }
    }

    pub fn set_disabled(&self, route: &Route, disabled: bool) {
        match self {
            Link::Path(k) => k.set_disabled(path_key(route), route, disabled),
            Link::PathPattern(k) => k.set_disabled(route.path_pattern.clone(), route, disabled),
            Link::Method(k) => k.set_disabled(route.method.clone(), route, disabled),
            Link::Consumes(k) => k.set_disabled(route.consumes.clone(), route, disabled),
            Link::Produces(k) => k.set_disabled(route.produces.clone(), route, disabled),
            Link::Language(k) => k.set_disabled(route.language.clone(), route, disabled),
            Link::Handler(h) => h.set_disabled(disabled),
        }
    }

    pub fn remove_route(&self, route: &Route) {
        match self {
            Link::Path(k) => k.remove(path_key(route), route),
            Link::PathPattern(k) => k.remove(route.path_pattern.clone(), route),
            Link::Method(k) => k.remove(route.method.clone(), route),
            Link::Consumes(k) => k.remove(route.consumes.clone(), route),
            Link::Produces(k) => k.remove(route.produces.clone(), route),
            Link::Language(k) => k.remove(route.language.clone(), route),
            Link::Handler(h) => h.remove(),
        }
    }

    /// Whether any route, enabled or not, is reachable from this link.
    pub fn has_route(&self) -> bool {
        match self {
            Link::Path(k) => k.has_route(),
            Link::PathPattern(k) => k.has_route(),
            Link::Method(k) => k.has_route(),
            Link::Consumes(k) => k.has_route(),
            Link::Produces(k) => k.has_route(),
            Link::Language(k) => k.has_route(),
            Link::Handler(h) => h.slot.load().handler.is_some(),
        }
    }

    /// Whether there are routes and every one of them is disabled.
    pub fn is_disabled(&self) -> bool {
        match self {
            Link::Path(k) => k.is_disabled(),
            Link::PathPattern(k) => k.is_disabled(),
            Link::Method(k) => k.is_disabled(),
            Link::Consumes(k) => k.is_disabled(),
            Link::Produces(k) => k.is_disabled(),
            Link::Language(k) => k.is_disabled(),
            Link::Handler(h) => {
                let slot = h.slot.load();
                slot.handler.is_some() && slot.disabled
            }
        }
    }

    /// Walk every registered route. `criteria` holds the keys on the way here.
    pub fn visit(&self, criteria: &Route, visitor: &mut Visitor<'_>) {
        match self {
            Link::Path(k) => k.visit(criteria, visitor, |c, path| {
                c.path = Some(path.clone());
            }),
            Link::PathPattern(k) => k.visit(criteria, visitor, |c, pattern| {
                c.path = Some(pattern.as_str().to_string());
                c.path_pattern = Some(pattern.clone());
            }),
            Link::Method(k) => k.visit(criteria, visitor, |c, m| c.method = Some(m.clone())),
            Link::Consumes(k) => k.visit(criteria, visitor, |c, m| c.consumes = Some(m.clone())),
            Link::Produces(k) => k.visit(criteria, visitor, |c, m| c.produces = Some(m.clone())),
            Link::Language(k) => k.visit(criteria, visitor, |c, l| c.language = Some(l.clone())),
            Link::Handler(h) => {
                let slot = h.slot.load();
                if let Some(handler) = &slot.handler {
                    let mut route = criteria.clone();
                    route.disabled = slot.disabled;
                    visitor(route, handler);
                }
            }
        }
    }

    pub fn dispatch(&self, exchange: &mut Exchange) -> Result<(), DispatchError> {
        match self {
            Link::Path(k) => dispatch_path(k, exchange),
            Link::PathPattern(k) => dispatch_path_pattern(k, exchange),
            Link::Method(k) => dispatch_method(k, exchange),
            Link::Consumes(k) => dispatch_consumes(k, exchange),
            Link::Produces(k) => dispatch_produces(k, exchange),
            Link::Language(k) => dispatch_language(k, exchange),
            Link::Handler(h) => h.dispatch(exchange),
        }
    }
}

fn by_specificity(a: &MediaType, b: &MediaType) -> Ordering {
    a.compare_specificity(b)
}

fn path_key(route: &Route) -> Option<String> {
    if route.path_pattern.is_some() {
        None
    } else {
        route.path.clone()
    }
}

fn dispatch_path(k: &Keyed<String>, exchange: &mut Exchange) -> Result<(), DispatchError> {
    let table = k.table.load();
    if table.enabled.is_empty() {
        return k.next.dispatch(exchange);
    }

    let path = normalize_path(exchange.request().path());

    match table.enabled.iter().find(|(p, _)| *p == path) {
        Some((_, link)) => link.dispatch(exchange),
        None => k.next.dispatch(exchange),
    }
}

fn dispatch_path_pattern(k: &Keyed<PathPattern>, exchange: &mut Exchange) -> Result<(), DispatchError> {
    let table = k.table.load();
    if table.enabled.is_empty() {
        return k.next.dispatch(exchange);
    }

    let path = normalize_path(exchange.request().path());

    let best = table
        .enabled
        .iter()
        .filter_map(|(pattern, link)| pattern.matches(&path).map(|m| (m, link)))
        .max_by(|a, b| a.0.compare(&b.0));

    match best {
        Some((m, link)) => {
            trace!("Path {} matches {:?}", path, m);
            exchange.request_mut().set_path_params(m.params());
            link.dispatch(exchange)
        }
        None => k.next.dispatch(exchange),
    }
}

fn dispatch_method(k: &Keyed<Method>, exchange: &mut Exchange) -> Result<(), DispatchError> {
    let table = k.table.load();
    if table.enabled.is_empty() {
        return k.next.dispatch(exchange);
    }

    let method = exchange.request().method().clone();

    if let Some((_, link)) = table.enabled.iter().find(|(m, _)| *m == method) {
        return link.dispatch(exchange);
    }

    match k.next.dispatch(exchange) {
        Err(e) if e.is_miss() => {
            let allowed = table.enabled.iter().map(|(m, _)| m.clone()).collect();
            Err(DispatchError::Http(HttpError::MethodNotAllowed(allowed)))
        }
        r => r,
    }
}

fn dispatch_consumes(k: &Keyed<MediaType>, exchange: &mut Exchange) -> Result<(), DispatchError> {
    let table = k.table.load();
    if table.enabled.is_empty() {
        return k.next.dispatch(exchange);
    }

    let content_type = match exchange.request().content_type() {
        Some(c) => c,
        None => return k.next.dispatch(exchange),
    };

    match find_first_match(&content_type, &table.enabled) {
        Some((_, link)) => link.dispatch(exchange),
        None => Err(DispatchError::Http(HttpError::UnsupportedMediaType)),
    }
}

fn dispatch_produces(k: &Keyed<MediaType>, exchange: &mut Exchange) -> Result<(), DispatchError> {
    let table = k.table.load();
    if table.all.is_empty() {
        return k.next.dispatch(exchange);
    }

    let accept = Accept::from_headers(exchange.request().headers());

    // every producer is disabled: only a client accepting anything is served
    // by the routes that don't produce a particular type.
    if table.enabled.is_empty() {
        if accept.accepts_any() {
            return k.next.dispatch(exchange);
        }
        return Err(DispatchError::Http(HttpError::NotAcceptable(vec![])));
    }
    let mut next_tried = false;

    for (range, (media_type, link)) in accept.find_all_match(&table.enabled) {
        // a plain */* prefers the routes that don't produce a particular type.
        if !next_tried && range.media_type().is_any() {
            next_tried = true;
            match k.next.dispatch(exchange) {
                Err(e) if e.is_miss() => {}
                r => return r,
            }
        }

        let headers = exchange.response().headers();
        headers
            .set(CONTENT_TYPE, media_type.to_string())
            .map_err(|e| DispatchError::Http(e.into()))?;

        match link.dispatch(exchange) {
            Err(e) if e.is_miss() => {
                exchange
                    .response()
                    .headers()
                    .remove("content-type")
                    .map_err(|e| DispatchError::Http(e.into()))?;
            }
            r => return r,
        }
    }

    let produced = table.all.iter().map(|(m, _)| m.to_string()).collect();
    Err(DispatchError::Http(HttpError::NotAcceptable(produced)))
}

fn dispatch_language(k: &Keyed<String>, exchange: &mut Exchange) -> Result<(), DispatchError> {
    let table = k.table.load();

    if !table.enabled.is_empty() {
        let accept = AcceptLanguage::from_headers(exchange.request().headers());

        for (_, link) in accept.find_all_match(&table.enabled) {
            match link.dispatch(exchange) {
                Err(e) if e.is_miss() => {}
                r => return r,
            }
        }
    }

    k.next.dispatch(exchange)
}

struct Table<K> {
    /// Every entry, in dispatch order.
    all: Vec<(K, Arc<Link>)>,
    /// Entries with at least one enabled route.
    enabled: Vec<(K, Arc<Link>)>,
}

pub(crate) struct Keyed<K> {
    table: ArcSwap<Table<K>>,
    child: Stage,
    order: Option<fn(&K, &K) -> Ordering>,
    next: Box<Link>,
}

impl<K: Clone + PartialEq> Keyed<K> {
    fn new(stage: Stage, order: Option<fn(&K, &K) -> Ordering>) -> Self {
        let child = stage.next();
        Keyed {
            table: ArcSwap::from_pointee(Table {
                all: vec![],
                enabled: vec![],
            }),
            child,
            order,
            next: Box::new(Link::new(child)),
        }
    }

    fn find(&self, key: &K) -> Option<Arc<Link>> {
        self.table
            .load()
            .all
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, l)| l.clone())
    }

    fn publish(&self, all: Vec<(K, Arc<Link>)>) {
        let enabled = all
            .iter()
            .filter(|(_, l)| !l.is_disabled())
            .cloned()
            .collect();
        self.table.store(Arc::new(Table { all, enabled }));
    }

    fn set(&self, key: Option<K>, route: &Route, handler: &Arc<dyn ExchangeHandler>) {
        let key = match key {
            Some(k) => k,
            None => return self.next.set_route(route, handler),
        };

        if let Some(link) = self.find(&key) {
            link.set_route(route, handler);
            self.publish(self.table.load().all.clone());
            return;
        }

        let link = Link::new(self.child);
        link.set_route(route, handler);

        let mut all = self.table.load().all.clone();
        all.push((key, Arc::new(link)));
        if let Some(order) = self.order {
            // stable, equal keys keep registration order.
            all.sort_by(|a, b| order(&a.0, &b.0));
        }
        self.publish(all);
    }

    fn set_disabled(&self, key: Option<K>, route: &Route, disabled: bool) {
        let key = match key {
            Some(k) => k,
            None => return self.next.set_disabled(route, disabled),
        };

        if let Some(link) = self.find(&key) {
            link.set_disabled(route, disabled);
            self.publish(self.table.load().all.clone());
        }
    }

    fn remove(&self, key: Option<K>, route: &Route) {
        let key = match key {
            Some(k) => k,
            None => return self.next.remove_route(route),
        };

        if let Some(link) = self.find(&key) {
            link.remove_route(route);
            let mut all = self.table.load().all.clone();
            if !link.has_route() {
                all.retain(|(k, _)| *k != key);
            }
            self.publish(all);
        }
    }

    fn has_route(&self) -> bool {
        !self.table.load().all.is_empty() || self.next.has_route()
    }

    fn is_disabled(&self) -> bool {
        let table = self.table.load();
        let next_has_route = self.next.has_route();

        if table.all.is_empty() && !next_has_route {
            return false;
        }

        table.all.iter().all(|(_, l)| l.is_disabled()) && (!next_has_route || self.next.is_disabled())
    }

    fn visit(&self, criteria: &Route, visitor: &mut Visitor<'_>, apply: impl Fn(&mut Route, &K)) {
        let table = self.table.load_full();
        for (key, link) in &table.all {
            let mut c = criteria.clone();
            apply(&mut c, key);
            link.visit(&c, visitor);
        }
        self.next.visit(criteria, visitor);
    }
}

#[derive(Default)]
struct HandlerSlot {
    handler: Option<Arc<dyn ExchangeHandler>>,
    disabled: bool,
}

#[derive(Default)]
pub(crate) struct HandlerLink {
    slot: ArcSwap<HandlerSlot>,
}

impl HandlerLink {
    fn set(&self, handler: &Arc<dyn ExchangeHandler>) {
        self.slot.store(Arc::new(HandlerSlot {
            handler: Some(handler.clone()),
            disabled: false,
        }));
    }

    fn set_disabled(&self, disabled: bool) {
        let slot = self.slot.load();
        if let Some(handler) = &slot.handler {
            let handler = handler.clone();
            drop(slot);
            self.slot.store(Arc::new(HandlerSlot {
                handler: Some(handler),
                disabled,
            }));
        }
    }

    fn remove(&self) {
        self.slot.store(Arc::new(HandlerSlot::default()));
    }

    fn dispatch(&self, exchange: &mut Exchange) -> Result<(), DispatchError> {
        let slot = self.slot.load_full();
        match &slot.handler {
            None => Err(DispatchError::NotFound),
            Some(_) if slot.disabled => Err(DispatchError::Disabled),
            Some(handler) => handler.handle(exchange).map_err(DispatchError::Http),
        }
    }
}
