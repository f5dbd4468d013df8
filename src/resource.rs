//! Resources served as response bodies.
//!
//! Only metadata is looked at on the connection task. The content is read on a
//! dedicated thread and streamed through a body channel, so a slow disk holds
//! up nothing but its own response.

use crate::body::BodySender;
use crate::Error;
use chrono::{DateTime, Utc};
use std::fmt;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::task::{Context, Poll, Wake, Waker};
use std::thread::{self, Thread};
use std::time::SystemTime;

/// Size of the chunks a resource is streamed in.
const READ_CHUNK_SIZE: usize = 16_384;

/// A readable resource such as a file.
pub trait Resource: Send + Sync + fmt::Debug {
    /// Whether the resource exists. `None` when it can't be determined, in
    /// which case reading is attempted anyway.
    fn exists(&self) -> Option<bool>;

    /// Whether the resource holds content, as opposed to being a directory.
    fn is_file(&self) -> Option<bool> {
        None
    }

    /// Content length in bytes.
    fn size(&self) -> Option<u64>;

    /// Time of the last change, sent as `last-modified`.
    fn last_modified(&self) -> Option<SystemTime>;

    /// Media type guessed from the resource name.
    fn media_type(&self) -> Option<String>;

    /// Open the content for reading.
    ///
    /// Runs on a thread of its own and may block.
    fn open(&self) -> io::Result<Box<dyn Read + Send>>;

    /// The resource at `path` relative to this one. `path` is normalized and
    /// never leaves this resource. `None` if the resource has no children.
    fn resolve(&self, path: &str) -> Option<Box<dyn Resource>> {
        let _ = path;
        None
    }
}

impl Resource for Box<dyn Resource> {
    fn exists(&self) -> Option<bool> {
        (**self).exists()
    }

    fn is_file(&self) -> Option<bool> {
        (**self).is_file()
    }

    fn size(&self) -> Option<u64> {
        (**self).size()
    }

    fn last_modified(&self) -> Option<SystemTime> {
        (**self).last_modified()
    }

    fn media_type(&self) -> Option<String> {
        (**self).media_type()
    }

    fn open(&self) -> io::Result<Box<dyn Read + Send>> {
        (**self).open()
    }

    fn resolve(&self, path: &str) -> Option<Box<dyn Resource>> {
        (**self).resolve(path)
    }
}

/// A resource on the local file system.
#[derive(Debug, Clone)]
pub struct FileResource {
    path: PathBuf,
}

impl FileResource {
    /// A file, or a directory to resolve files from.
    pub fn new(path: impl AsRef<Path>) -> Self {
        FileResource {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// The file system path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Resource for FileResource {
    fn exists(&self) -> Option<bool> {
        Some(self.path.exists())
    }

    fn is_file(&self) -> Option<bool> {
        Some(self.path.is_file())
    }

    fn size(&self) -> Option<u64> {
        self.path.metadata().ok().map(|m| m.len())
    }

    fn last_modified(&self) -> Option<SystemTime> {
        self.path.metadata().ok().and_then(|m| m.modified().ok())
    }

    fn media_type(&self) -> Option<String> {
        let ext = self.path.extension()?.to_str()?.to_ascii_lowercase();
        media_type_of(&ext).map(|m| m.to_string())
    }

    fn open(&self) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(std::fs::File::open(&self.path)?))
    }

    fn resolve(&self, path: &str) -> Option<Box<dyn Resource>> {
        Some(Box::new(FileResource::new(self.path.join(path))))
    }
}

fn media_type_of(ext: &str) -> Option<&'static str> {
    Some(match ext {
        "html" | "htm" => "text/html",
        "txt" => "text/plain",
        "css" => "text/css",
        "js" => "application/javascript",
        "json" => "application/json",
        "xml" => "application/xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "ico" => "image/x-icon",
        "pdf" => "application/pdf",
        "wasm" => "application/wasm",
        _ => return None,
    })
}

/// RFC 1123 date as used in `last-modified`.
pub(crate) fn http_date(t: SystemTime) -> String {
    let t: DateTime<Utc> = t.into();
    t.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Stream the content of `resource` into `tx` from a new thread.
pub(crate) fn spawn_reader<R>(resource: R, tx: BodySender) -> Result<(), Error>
where
    R: Resource + 'static,
{
    thread::Builder::new()
        .name("hreq-exchange-resource".into())
        .spawn(move || read_into(&resource, tx))?;
    Ok(())
}

struct ThreadWaker(Thread);

impl Wake for ThreadWaker {
    fn wake(self: Arc<Self>) {
        self.0.unpark();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.0.unpark();
    }
}

/// Park the thread until `tx` has credit. `false` if the consumer is gone.
fn wait_ready(tx: &mut BodySender, cx: &mut Context) -> bool {
    loop {
        match tx.poll_ready(cx) {
            Poll::Ready(r) => return r.is_ok(),
            Poll::Pending => thread::park(),
        }
    }
}

fn read_into(resource: &dyn Resource, mut tx: BodySender) {
    let mut reader = match resource.open() {
        Ok(r) => r,
        Err(e) => {
            debug!("Resource {:?} is not readable: {}", resource, e);
            tx.abort(e);
            return;
        }
    };

    let waker = Waker::from(Arc::new(ThreadWaker(thread::current())));
    let mut cx = Context::from_waker(&waker);
    let mut sent = 0_u64;

    loop {
        if !wait_ready(&mut tx, &mut cx) {
            trace!("Resource {:?} abandoned after {} bytes", resource, sent);
            return;
        }

        let mut buf = vec![0; READ_CHUNK_SIZE];
        let amount = match reader.read(&mut buf) {
            Ok(0) => {
                trace!("Resource {:?} read: {} bytes", resource, sent);
                tx.finish();
                return;
            }
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!("Resource {:?} failed after {} bytes: {}", resource, sent, e);
                tx.abort(e);
                return;
            }
        };

        buf.truncate(amount);
        sent += amount as u64;

        if tx.try_send(buf).is_err() {
            return;
        }
    }
}
