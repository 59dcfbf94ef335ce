use std::path::Path;

use url::Url;

use crate::error::TransportError;

/// Bytes received so far and the announced length, when the transport knows it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub loaded: u64,
    pub total: Option<u64>,
}

/// Fetches model bodies and their sibling resources.
///
/// Implementations are driven from a single-threaded executor
/// (`pollster` natively, the browser event loop on the web), so the futures
/// are not required to be `Send`.
#[allow(async_fn_in_trait)]
pub trait Transport {
    /// Downloads a whole body, reporting progress as it arrives.
    async fn fetch(
        &self,
        url: &str,
        on_progress: &mut dyn FnMut(Progress),
    ) -> Result<Vec<u8>, TransportError>;

    /// Downloads at most `max_bytes` from the start of the body.
    async fn fetch_prefix(&self, url: &str, max_bytes: usize) -> Result<Vec<u8>, TransportError>;
}

pub fn is_http(url: &str) -> bool {
    let lowered = url.to_ascii_lowercase();
    lowered.starts_with("http://") || lowered.starts_with("https://")
}

fn has_scheme(reference: &str) -> bool {
    Url::parse(reference).is_ok_and(|url| url.scheme().len() > 1)
}

/// Directory portion of a model location, including the trailing separator.
///
/// Used as the resource base path for sibling textures and buffers.
pub fn directory_of(location: &str) -> String {
    let path = crate::format::strip_query(location);
    match path.rfind(['/', '\\']) {
        Some(index) => path[..=index].to_string(),
        None => String::new(),
    }
}

/// Resolves `reference` against `base`, which is either a model location or
/// a directory ending in a separator. Works for URLs and filesystem paths.
pub fn resolve_relative(base: &str, reference: &str) -> String {
    let reference = reference.replace('\\', "/");
    if reference.starts_with("data:") || has_scheme(&reference) {
        return reference;
    }
    if let Ok(base_url) = Url::parse(base) {
        if base_url.scheme().len() > 1 {
            return base_url
                .join(&reference)
                .map(String::from)
                .unwrap_or(reference);
        }
    }
    if Path::new(&reference).is_absolute() {
        return reference;
    }
    let directory = directory_of(base);
    if directory.is_empty() {
        reference
    } else {
        Path::new(&directory)
            .join(&reference)
            .to_string_lossy()
            .into_owned()
    }
}

#[cfg(not(target_arch = "wasm32"))]
pub use native::NativeTransport;

#[cfg(not(target_arch = "wasm32"))]
mod native {
    use std::fs::File;
    use std::io::Read;

    use anyhow::{Context, Result};
    use reqwest::blocking::Client;
    use reqwest::header::{ACCEPT, RANGE};

    use super::{is_http, Progress, Transport};
    use crate::error::TransportError;
    use crate::format::accept_for;

    const CHUNK: usize = 64 * 1024;
    /// Most a declared `Content-Length` may reserve up front.
    const MAX_PREALLOC: usize = 16 * CHUNK;

    fn initial_capacity(declared: Option<u64>) -> usize {
        declared.map_or(0, |len| len.min(MAX_PREALLOC as u64) as usize)
    }

    /// Blocking HTTP client plus local file access for the CLI.
    #[derive(Debug, Clone)]
    pub struct NativeTransport {
        client: Client,
    }

    impl NativeTransport {
        pub fn new() -> Result<Self> {
            let client = Client::builder()
                .user_agent(concat!("model-viewer/", env!("CARGO_PKG_VERSION")))
                .build()
                .context("failed to build HTTP client")?;
            Ok(Self { client })
        }

        fn open_http(
            &self,
            url: &str,
            range: Option<usize>,
        ) -> Result<reqwest::blocking::Response, TransportError> {
            let mut request = self.client.get(url).header(ACCEPT, accept_for(url));
            if let Some(max_bytes) = range {
                request = request.header(RANGE, format!("bytes=0-{}", max_bytes.saturating_sub(1)));
            }
            let response = request.send().map_err(|err| TransportError::Network {
                url: url.to_string(),
                message: err.to_string(),
            })?;
            let status = response.status();
            if !status.is_success() {
                return Err(TransportError::Status {
                    url: url.to_string(),
                    status: status.as_u16(),
                });
            }
            Ok(response)
        }
    }

    fn local_path(location: &str) -> &str {
        location.strip_prefix("file://").unwrap_or(location)
    }

    fn io_error(path: &str, err: std::io::Error) -> TransportError {
        TransportError::Io {
            path: path.to_string(),
            message: err.to_string(),
        }
    }

    impl Transport for NativeTransport {
        async fn fetch(
            &self,
            url: &str,
            on_progress: &mut dyn FnMut(Progress),
        ) -> Result<Vec<u8>, TransportError> {
            if !is_http(url) {
                let path = local_path(url);
                let bytes = std::fs::read(path).map_err(|err| io_error(path, err))?;
                let len = bytes.len() as u64;
                on_progress(Progress {
                    loaded: len,
                    total: Some(len),
                });
                return Ok(bytes);
            }

            let mut response = self.open_http(url, None)?;
            let total = response.content_length();
            let mut body = Vec::with_capacity(initial_capacity(total));
            let mut chunk = vec![0u8; CHUNK];
            loop {
                let read = response
                    .read(&mut chunk)
                    .map_err(|err| TransportError::Network {
                        url: url.to_string(),
                        message: err.to_string(),
                    })?;
                if read == 0 {
                    break;
                }
                body.extend_from_slice(&chunk[..read]);
                on_progress(Progress {
                    loaded: body.len() as u64,
                    total,
                });
            }
            Ok(body)
        }

        async fn fetch_prefix(
            &self,
            url: &str,
            max_bytes: usize,
        ) -> Result<Vec<u8>, TransportError> {
            let mut prefix = Vec::with_capacity(max_bytes.min(MAX_PREALLOC));
            if is_http(url) {
                let response = self.open_http(url, Some(max_bytes))?;
                response
                    .take(max_bytes as u64)
                    .read_to_end(&mut prefix)
                    .map_err(|err| TransportError::Network {
                        url: url.to_string(),
                        message: err.to_string(),
                    })?;
            } else {
                let path = local_path(url);
                let file = File::open(path).map_err(|err| io_error(path, err))?;
                file.take(max_bytes as u64)
                    .read_to_end(&mut prefix)
                    .map_err(|err| io_error(path, err))?;
            }
            Ok(prefix)
        }
    }

    #[cfg(test)]
    mod tests {
        use std::io::{BufRead, BufReader, Write};
        use std::net::TcpListener;
        use std::thread;

        use pollster::block_on;

        use super::*;

        /// Serves one response and returns the URL to request it from.
        fn serve_once(response: &'static [u8]) -> String {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            let addr = listener.local_addr().unwrap();
            thread::spawn(move || {
                let (stream, _) = listener.accept().unwrap();
                let mut reader = BufReader::new(stream);
                let mut line = String::new();
                while reader.read_line(&mut line).unwrap_or(0) > 0 && line != "\r\n" {
                    line.clear();
                }
                let mut stream = reader.into_inner();
                let _ = stream.write_all(response);
            });
            format!("http://{addr}/model.glb")
        }

        #[test]
        fn declared_length_only_bounds_the_reservation() {
            assert_eq!(initial_capacity(None), 0);
            assert_eq!(initial_capacity(Some(1024)), 1024);
            assert_eq!(initial_capacity(Some(99_999_999_999)), MAX_PREALLOC);
        }

        #[test]
        fn huge_content_length_with_short_body_is_a_network_error() {
            let url = serve_once(
                b"HTTP/1.1 200 OK\r\nContent-Length: 99999999999\r\nConnection: close\r\n\r\nglTF",
            );
            let transport = NativeTransport::new().unwrap();
            let mut totals = Vec::new();
            let result = block_on(transport.fetch(&url, &mut |progress| totals.push(progress.total)));
            assert!(matches!(result, Err(TransportError::Network { .. })), "{result:?}");
            assert!(totals.iter().all(|&total| total == Some(99_999_999_999)));
        }

        #[test]
        fn body_matching_its_length_is_returned_whole() {
            let url = serve_once(b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\nConnection: close\r\n\r\nglTF");
            let transport = NativeTransport::new().unwrap();
            let body = block_on(transport.fetch(&url, &mut |_| {})).unwrap();
            assert_eq!(body, b"glTF");
        }
    }
}
