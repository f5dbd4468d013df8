use crate::exchange::{Exchange, ExchangeHandler};
use crate::resource::Resource;
use crate::HttpError;
use std::fmt;

/// Default name of the path parameter holding the resource path.
pub const DEFAULT_PATH_PARAMETER: &str = "path";

/// Serves resources below a base resource, such as the files of a directory.
///
/// The resource path is taken from a path parameter of the matched route:
///
/// ```
/// use hreq_exchange::routing::Router;
/// use hreq_exchange::{FileResource, StaticHandler};
/// use http::Method;
///
/// let router = Router::new();
/// router
///     .route()
///     .path("/static/{path:.*}", false)
///     .method(Method::GET)
///     .handler(StaticHandler::new(FileResource::new("/srv/www")))
///     .unwrap();
/// ```
///
/// A path that is absolute is a 400. A path that leaves the base resource,
/// or doesn't exist, is a 404. A directory is served by its `index.html`.
pub struct StaticHandler<R> {
    base: R,
    path_parameter: String,
}

impl<R: Resource + 'static> StaticHandler<R> {
    /// Serve from `base`, reading the path from [`DEFAULT_PATH_PARAMETER`].
    pub fn new(base: R) -> Self {
        StaticHandler {
            base,
            path_parameter: DEFAULT_PATH_PARAMETER.to_string(),
        }
    }

    /// Read the resource path from another path parameter.
    pub fn path_parameter(mut self, name: impl Into<String>) -> Self {
        self.path_parameter = name.into();
        self
    }
}

impl<R: Resource + 'static> ExchangeHandler for StaticHandler<R> {
    fn handle(&self, exchange: &mut Exchange) -> Result<(), HttpError> {
        let raw = exchange
            .request()
            .path_param(&self.path_parameter)
            .ok_or_else(|| HttpError::BadRequest(format!("{} is empty", self.path_parameter)))?;

        let path = relative_path(raw)?;

        let resource = self.base.resolve(&path).ok_or(HttpError::NotFound)?;

        let resource = match (resource.exists(), resource.is_file()) {
            (None, _) | (Some(true), Some(true)) | (Some(true), None) => resource,
            (Some(true), Some(false)) => resource.resolve("index.html").ok_or(HttpError::NotFound)?,
            (Some(false), _) => {
                debug!("No static resource: {}", path);
                return Err(HttpError::NotFound);
            }
        };

        exchange.response_mut().body().resource(resource)?;

        Ok(())
    }
}

impl<R: fmt::Debug> fmt::Debug for StaticHandler<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticHandler")
            .field("base", &self.base)
            .field("path_parameter", &self.path_parameter)
            .finish()
    }
}

/// Normalize a requested path so that it stays below the base resource.
fn relative_path(raw: &str) -> Result<String, HttpError> {
    if raw.starts_with('/') || raw.starts_with('\\') || raw.contains(':') {
        return Err(HttpError::BadRequest("Resource can't be absolute".into()));
    }

    let mut segments: Vec<&str> = vec![];

    for segment in raw.split(|c| c == '/' || c == '\\') {
        match segment {
            "" | "." => {}
            ".." => {
                if segments.pop().is_none() {
                    return Err(HttpError::NotFound);
                }
            }
            s => segments.push(s),
        }
    }

    Ok(segments.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{ExchangeId, Request, RequestHead};
    use crate::resource::FileResource;
    use crate::response::{BodySlot, Response, ResponseHeaders};
    use http::header::HeaderMap;
    use http::{Method, Version};
    use std::collections::HashMap;
    use std::path::PathBuf;
    use std::sync::Arc;

    fn exchange(path: &str) -> Exchange {
        let head = RequestHead::new(
            ExchangeId::Http1 {
                connection: 0,
                index: 0,
            },
            Method::GET,
            "/static".parse().unwrap(),
            Version::HTTP_11,
            HeaderMap::new(),
        );
        let mut request = Request::new(Arc::new(head), None);
        let mut params = HashMap::new();
        params.insert("path".to_string(), path.to_string());
        request.set_path_params(params);
        Exchange::new(request, Response::new(ResponseHeaders::new(), 4, false))
    }

    fn site(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("hreq_exchange_{}_{}", name, std::process::id()));
        std::fs::create_dir_all(dir.join("docs")).unwrap();
        std::fs::write(dir.join("app.css"), "body {}").unwrap();
        std::fs::write(dir.join("docs").join("index.html"), "<h1>docs</h1>").unwrap();
        dir
    }

    async fn served(handler: &StaticHandler<FileResource>, path: &str) -> Result<(String, String), HttpError> {
        let mut ex = exchange(path);
        handler.handle(&mut ex)?;
        let content_type = ex.response().headers().get("content-type").unwrap_or_default();
        match ex.response_mut().take_body() {
            BodySlot::Stream(rx) => Ok((content_type, rx.collect_string().await.unwrap())),
            _ => panic!("expected a streamed body"),
        }
    }

    #[test]
    fn relative_paths() {
        assert_eq!(relative_path("a/./b//c").unwrap(), "a/b/c");
        assert_eq!(relative_path("a/../b").unwrap(), "b");
        assert_eq!(relative_path("../etc/passwd"), Err(HttpError::NotFound));
        assert_eq!(relative_path("a/../../b"), Err(HttpError::NotFound));
        assert!(matches!(relative_path("/etc/passwd"), Err(HttpError::BadRequest(_))));
        assert!(matches!(relative_path("file:///etc/passwd"), Err(HttpError::BadRequest(_))));
    }

    #[async_std::test]
    async fn serves_files_and_directory_index() {
        let handler = StaticHandler::new(FileResource::new(site("files")));

        let (ct, body) = served(&handler, "app.css").await.unwrap();
        assert_eq!(ct, "text/css");
        assert_eq!(body, "body {}");

        let (ct, body) = served(&handler, "docs").await.unwrap();
        assert_eq!(ct, "text/html");
        assert_eq!(body, "<h1>docs</h1>");

        assert_eq!(served(&handler, "nope.css").await, Err(HttpError::NotFound));
        assert_eq!(served(&handler, "docs/../../secret").await, Err(HttpError::NotFound));
    }

    #[async_std::test]
    async fn directory_without_index_is_not_found() {
        let dir = site("no_index");
        std::fs::create_dir_all(dir.join("empty")).unwrap();
        let handler = StaticHandler::new(FileResource::new(dir));

        assert_eq!(served(&handler, "empty").await, Err(HttpError::NotFound));
    }

    #[test]
    fn missing_parameter_is_bad_request() {
        let handler = StaticHandler::new(FileResource::new(site("param"))).path_parameter("file");
        let mut ex = exchange("app.css");
        assert!(matches!(handler.handle(&mut ex), Err(HttpError::BadRequest(_))));
    }
}
