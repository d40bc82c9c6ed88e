//! Compile-time routing tables.
//!
//! REST APIs use hierarchical paths; a [`Router`] is responsible for one
//! path component and defines the methods served there plus the route to
//! its children: either a sorted static [`SubdirMap`] or a match-all
//! component captured as a path parameter. Routers are built in `const`
//! context, so the whole API tree is a static.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use anyhow::Error;
use hyper::body::Incoming;
use hyper::Request;
use serde_json::Value;

use crate::Body;

/// Future returned by regular API handlers.
pub type ApiFuture = Pin<Box<dyn Future<Output = Result<Value, Error>> + Send>>;

/// A regular API handler: json parameters in, json value out.
pub type ApiHandlerFn = &'static (dyn Fn(Value) -> ApiFuture + Send + Sync);

/// Future returned by low-level handlers (upgrades, custom responses).
pub type ApiResponseFuture =
    Pin<Box<dyn Future<Output = Result<http::Response<Body>, Error>> + Send>>;

/// A low-level handler with access to the raw request; used for WebSocket
/// upgrades.
pub type ApiRawHandlerFn =
    &'static (dyn Fn(Request<Incoming>, Value) -> ApiResponseFuture + Send + Sync);

pub enum ApiHandler {
    Async(ApiHandlerFn),
    Raw(ApiRawHandlerFn),
}

/// An API endpoint: handler plus the status code of a successful call.
pub struct ApiMethod {
    pub handler: &'static ApiHandler,
    pub success_status: u16,
}

impl ApiMethod {
    pub const fn new(handler: &'static ApiHandler) -> Self {
        Self {
            handler,
            success_status: 200,
        }
    }

    pub const fn status(mut self, status: u16) -> Self {
        self.success_status = status;
        self
    }
}

/// Sorted list of `(name, router)` pairs; binary-searched on lookup.
pub type SubdirMap = &'static [(&'static str, &'static Router)];

pub enum SubRoute {
    Map(SubdirMap),
    /// Always matches one component, stored under `param_name`.
    MatchAll {
        router: &'static Router,
        param_name: &'static str,
    },
}

pub struct Router {
    pub get: Option<&'static ApiMethod>,
    pub put: Option<&'static ApiMethod>,
    pub post: Option<&'static ApiMethod>,
    pub delete: Option<&'static ApiMethod>,
    pub subroute: Option<SubRoute>,
}

impl Router {
    pub const fn new() -> Self {
        Self {
            get: None,
            put: None,
            post: None,
            delete: None,
            subroute: None,
        }
    }

    pub const fn get(mut self, m: &'static ApiMethod) -> Self {
        self.get = Some(m);
        self
    }

    pub const fn put(mut self, m: &'static ApiMethod) -> Self {
        self.put = Some(m);
        self
    }

    pub const fn post(mut self, m: &'static ApiMethod) -> Self {
        self.post = Some(m);
        self
    }

    pub const fn delete(mut self, m: &'static ApiMethod) -> Self {
        self.delete = Some(m);
        self
    }

    pub const fn subdirs(mut self, map: SubdirMap) -> Self {
        self.subroute = Some(SubRoute::Map(map));
        self
    }

    pub const fn match_all(mut self, param_name: &'static str, router: &'static Router) -> Self {
        self.subroute = Some(SubRoute::MatchAll { router, param_name });
        self
    }

    /// Walk the tree along `components`, collecting path parameters.
    pub fn find_route(
        &self,
        components: &[&str],
        uri_params: &mut HashMap<String, String>,
    ) -> Option<&Router> {
        if components.is_empty() {
            return Some(self);
        }

        let (head, rest) = (components[0], &components[1..]);
        match self.subroute.as_ref()? {
            SubRoute::Map(map) => {
                let index = map.binary_search_by_key(&head, |(name, _)| *name).ok()?;
                map[index].1.find_route(rest, uri_params)
            }
            SubRoute::MatchAll { router, param_name } => {
                uri_params.insert(param_name.to_string(), head.to_string());
                router.find_route(rest, uri_params)
            }
        }
    }

    pub fn method(&self, method: &hyper::Method) -> Option<&'static ApiMethod> {
        match *method {
            hyper::Method::GET => self.get,
            hyper::Method::PUT => self.put,
            hyper::Method::POST => self.post,
            hyper::Method::DELETE => self.delete,
            _ => None,
        }
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf() -> &'static Router {
        static METHOD: ApiMethod = ApiMethod::new(&ApiHandler::Async(&|_| {
            Box::pin(async { Ok(Value::Null) })
        }));
        static LEAF: Router = Router::new().get(&METHOD);
        &LEAF
    }

    #[test]
    fn subdir_and_match_all_routing() {
        static ITEM: Router = Router::new();
        static LIST: Router = Router::new();
        static SUBDIRS: &[(&str, &Router)] = &[("items", &LIST)];
        static ROOT: Router = Router::new().subdirs(SUBDIRS);

        let mut params = HashMap::new();
        assert!(ROOT.find_route(&["items"], &mut params).is_some());
        assert!(ROOT.find_route(&["nope"], &mut params).is_none());

        static WILD: Router = Router::new().match_all("id", &ITEM);
        let mut params = HashMap::new();
        assert!(WILD.find_route(&["abc"], &mut params).is_some());
        assert_eq!(params.get("id").map(String::as_str), Some("abc"));
    }

    #[test]
    fn method_dispatch() {
        let router = leaf();
        assert!(router.method(&hyper::Method::GET).is_some());
        assert!(router.method(&hyper::Method::POST).is_none());
    }
}
