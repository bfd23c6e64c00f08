//! The blocking fetch primitive the client talks through

use tracing::debug;
use url::Url;

/// Fetch a URL and return its body, or `None` on any failure
pub trait Transport {
    fn fetch(&self, url: &str) -> Option<String>;
}

/// In-process transport that hands the query string straight to a server
pub struct LoopbackTransport {
    serve: Box<dyn Fn(&str) -> Option<String>>,
}

impl LoopbackTransport {
    /// `serve` receives the raw (still urlencoded) query string of each request
    pub fn new<F>(serve: F) -> Self
    where
        F: Fn(&str) -> Option<String> + 'static,
    {
        Self {
            serve: Box::new(serve),
        }
    }
}

impl Transport for LoopbackTransport {
    fn fetch(&self, url: &str) -> Option<String> {
        let parsed = match Url::parse(url) {
            Ok(parsed) => parsed,
            Err(e) => {
                debug!(error = %e, "loopback transport got an unparsable url");
                return None;
            }
        };
        (self.serve)(parsed.query().unwrap_or(""))
    }
}
