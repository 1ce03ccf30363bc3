//! Per-request pipeline: resolve, confine, stat, read, negotiate, respond

use crate::cache::{CacheEntry, CacheOptions, ObjectCache, SharedCache};
use crate::compression::Gzip;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::http::{self, Method, Request, Response, CACHE_CONTROL, SECURITY_HEADERS};
use crate::listing::DirectoryLister;
use crate::mime;
use crate::negotiate::{self, Decision};
use crate::store::{ContentStore, EntryKind, Stat};
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::BufReader;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Turns a parsed request into a response for [`serve_connection`].
pub trait Responder: Send + Sync + 'static {
    fn respond<'a>(&'a self, request: &'a Request) -> Pin<Box<dyn Future<Output = Response> + Send + 'a>>;
}

/// Everything a worker needs to answer requests. One per worker process.
#[derive(Debug)]
pub struct RequestHandler {
    store: ContentStore,
    cache: SharedCache,
    lister: DirectoryLister,
    index: Option<String>,
}

impl RequestHandler {
    pub fn new(
        store: ContentStore,
        cache: SharedCache,
        lister: DirectoryLister,
        index: Option<String>,
    ) -> Self {
        Self {
            store,
            cache,
            lister,
            index,
        }
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let store = ContentStore::open(&config.root)?;
        let cache = ObjectCache::shared(CacheOptions {
            max_size: config.max_cache_size,
            ttl: config.cache_ttl,
            gzip: Gzip::new(config.gzip_level),
        });
        let lister = DirectoryLister::load(config.listing_template.as_deref())?;
        Ok(Self::new(store, cache, lister, config.index.clone()))
    }

    pub fn cache(&self) -> &SharedCache {
        &self.cache
    }

    pub fn store(&self) -> &ContentStore {
        &self.store
    }

    /// Answer one request. Every failure becomes an error response.
    pub async fn handle(&self, request: &Request) -> Response {
        let response = match self.serve(request).await {
            Ok(response) => response,
            Err(e) => {
                if e.status() >= 500 {
                    error!("{} {} failed: {}", request.method.as_str(), request.target, e);
                }
                Response::from_error(&e)
            }
        };
        info!(
            "{} {} {}",
            request.method.as_str(),
            request.target,
            response.status
        );
        response
    }

    async fn serve(&self, request: &Request) -> Result<Response> {
        if let Method::Other(method) = &request.method {
            return Err(Error::MethodNotAllowed(method.clone()));
        }
        let url_path = request.path.as_str();

        let path = self.store.resolve(url_path)?;
        let stat = self.store.stat(&path, url_path).await?;
        if stat.kind == EntryKind::Symlink {
            debug!("Following symlink for {}", url_path);
        }
        // Intermediate directory links are confined as well as a final one.
        let (real, stat) = self.store.confine(&path, url_path).await?;

        match stat.kind {
            EntryKind::Directory => self.serve_directory(&real, request).await,
            EntryKind::File => self.serve_file(&real, &stat, request).await,
            _ => Err(Error::NotFound {
                path: url_path.to_string(),
            }),
        }
    }

    async fn serve_directory(&self, dir: &Path, request: &Request) -> Result<Response> {
        if let Some(index) = &self.index {
            let candidate = dir.join(index);
            let index_url = format!("{}/{}", request.path.trim_end_matches('/'), index);
            match self.store.confine(&candidate, &index_url).await {
                Ok((real, stat)) if stat.kind == EntryKind::File => {
                    return self.serve_file(&real, &stat, request).await;
                }
                Ok(_) | Err(Error::NotFound { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        let html = self.lister.render(dir, &request.path).await?;
        Ok(Response::html(html))
    }

    /// Cache key for a confined file: its path below the root.
    fn cache_key(&self, real: &Path) -> String {
        let relative = real.strip_prefix(self.store.root()).unwrap_or(real);
        format!("/{}", relative.to_string_lossy())
    }

    async fn load_entry(&self, real: &Path, stat: &Stat, request: &Request) -> Result<Arc<CacheEntry>> {
        let key = self.cache_key(real);
        let cached = self.cache.lock().get(&key);
        if let Some(entry) = cached {
            return Ok(entry);
        }

        let raw = self.store.read(real, &request.path).await?;
        let mut headers = vec![
            ("Content-Type".to_string(), mime::content_type(real).to_string()),
            ("Cache-Control".to_string(), CACHE_CONTROL.to_string()),
        ];
        headers.extend(
            SECURITY_HEADERS
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string())),
        );
        headers.push(("Last-Modified".to_string(), negotiate::http_date(stat.modified)));

        // Committed only now that the whole body has been read.
        let entry = self
            .cache
            .lock()
            .put(&key, real.to_path_buf(), &raw, headers)?;
        Ok(entry)
    }

    async fn serve_file(&self, real: &Path, stat: &Stat, request: &Request) -> Result<Response> {
        let entry = self.load_entry(real, stat, request).await?;
        let etag = entry.etag();
        let last_modified = entry.last_modified().unwrap_or_default();

        Ok(match negotiate::negotiate(&request.validators, &etag, last_modified) {
            Decision::EtagMatch => Response::not_modified("ETag", &etag),
            Decision::LastModifiedMatch => Response::not_modified("Last-Modified", last_modified),
            Decision::Full => Response::new(
                200,
                entry.headers.clone(),
                entry.compressed_body.clone(),
            ),
        })
    }
}

impl Responder for RequestHandler {
    fn respond<'a>(&'a self, request: &'a Request) -> Pin<Box<dyn Future<Output = Response> + Send + 'a>> {
        Box::pin(self.handle(request))
    }
}

/// Serve requests on one connection until the peer closes it, asks to
/// close, or stays idle longer than `keepalive`.
pub async fn serve_connection<H: Responder>(handler: Arc<H>, mut stream: TcpStream, keepalive: Duration) {
    let (read_half, mut write_half) = stream.split();
    let mut reader = BufReader::new(read_half);

    loop {
        let request = match timeout(keepalive, http::read_request(&mut reader)).await {
            Err(_) | Ok(Ok(None)) => break,
            Ok(Ok(Some(request))) => request,
            Ok(Err(Error::Io(_))) => break,
            Ok(Err(e)) => {
                warn!("Rejected request: {}", e);
                let _ = Response::from_error(&e)
                    .write_to(&mut write_half, true, false)
                    .await;
                break;
            }
        };

        let response = dispatch_isolated(Arc::clone(&handler), request.clone()).await;
        let include_body = request.method != Method::Head;
        if let Err(e) = response
            .write_to(&mut write_half, include_body, request.keep_alive)
            .await
        {
            debug!("Client went away while writing {}: {}", request.target, e);
            break;
        }
        if !request.keep_alive {
            break;
        }
    }
}

/// Run the handler in its own task so a panic turns into a 500 instead of
/// taking the worker down.
async fn dispatch_isolated<H: Responder>(handler: Arc<H>, request: Request) -> Response {
    let method = request.method.as_str().to_string();
    let target = request.target.clone();
    match tokio::spawn(async move { handler.respond(&request).await }).await {
        Ok(response) => response,
        Err(e) => {
            let err = Error::Internal(format!("request handler failed: {}", e));
            error!("{} {} 500: {}", method, target, err);
            Response::from_error(&err)
        }
    }
}
