use js_sys::{Reflect, Uint8Array};
use wasm_bindgen::{JsCast, JsValue};
use wasm_bindgen_futures::JsFuture;
use web_sys::{ReadableStreamDefaultReader, Request, RequestInit, RequestMode, Response};

use crate::error::TransportError;
use crate::format::accept_for;
use crate::transport::{Progress, Transport};

/// `window.fetch` transport. Bodies are read as a stream so progress can be
/// reported while they arrive.
#[derive(Debug, Clone, Default)]
pub struct FetchTransport;

impl FetchTransport {
    pub fn new() -> Self {
        Self
    }

    async fn open(&self, url: &str, range: Option<usize>) -> Result<Response, TransportError> {
        let window = web_sys::window().ok_or_else(|| network(url, "window not available"))?;
        let init = RequestInit::new();
        init.set_method("GET");
        init.set_mode(RequestMode::Cors);
        let request = Request::new_with_str_and_init(url, &init)
            .map_err(|_| TransportError::InvalidUrl(url.to_string()))?;
        request
            .headers()
            .set("Accept", accept_for(url))
            .map_err(|err| network(url, &describe(&err)))?;
        if let Some(max_bytes) = range {
            request
                .headers()
                .set("Range", &format!("bytes=0-{}", max_bytes.saturating_sub(1)))
                .map_err(|err| network(url, &describe(&err)))?;
        }

        let value = JsFuture::from(window.fetch_with_request(&request))
            .await
            .map_err(|err| network(url, &describe(&err)))?;
        let response: Response = value
            .dyn_into()
            .map_err(|_| network(url, "fetch did not return a Response"))?;
        if !response.ok() {
            return Err(TransportError::Status {
                url: url.to_string(),
                status: response.status(),
            });
        }
        Ok(response)
    }
}

impl Transport for FetchTransport {
    async fn fetch(
        &self,
        url: &str,
        on_progress: &mut dyn FnMut(Progress),
    ) -> Result<Vec<u8>, TransportError> {
        let response = self.open(url, None).await?;
        let total = response
            .headers()
            .get("Content-Length")
            .ok()
            .flatten()
            .and_then(|value| value.trim().parse::<u64>().ok());
        read_body(url, &response, None, total, on_progress).await
    }

    async fn fetch_prefix(&self, url: &str, max_bytes: usize) -> Result<Vec<u8>, TransportError> {
        let response = self.open(url, Some(max_bytes)).await?;
        let mut body = read_body(url, &response, Some(max_bytes), None, &mut |_| {}).await?;
        body.truncate(max_bytes);
        Ok(body)
    }
}

/// Drains the response stream, stopping early once `limit` bytes arrived.
async fn read_body(
    url: &str,
    response: &Response,
    limit: Option<usize>,
    total: Option<u64>,
    on_progress: &mut dyn FnMut(Progress),
) -> Result<Vec<u8>, TransportError> {
    let Some(stream) = response.body() else {
        return Ok(Vec::new());
    };
    let reader: ReadableStreamDefaultReader = stream.get_reader().unchecked_into();
    let mut bytes = Vec::new();

    loop {
        let chunk = JsFuture::from(reader.read())
            .await
            .map_err(|err| network(url, &describe(&err)))?;
        let done = Reflect::get(&chunk, &JsValue::from_str("done"))
            .ok()
            .and_then(|value| value.as_bool())
            .unwrap_or(true);
        if done {
            break;
        }
        let value = Reflect::get(&chunk, &JsValue::from_str("value"))
            .map_err(|err| network(url, &describe(&err)))?;
        let array = Uint8Array::new(&value);
        let start = bytes.len();
        bytes.resize(start + array.length() as usize, 0);
        array.copy_to(&mut bytes[start..]);
        on_progress(Progress {
            loaded: bytes.len() as u64,
            total,
        });

        if limit.is_some_and(|limit| bytes.len() >= limit) {
            let _ = reader.cancel();
            break;
        }
    }
    Ok(bytes)
}

fn network(url: &str, message: &str) -> TransportError {
    TransportError::Network {
        url: url.to_string(),
        message: message.to_string(),
    }
}

fn describe(value: &JsValue) -> String {
    value
        .as_string()
        .or_else(|| {
            Reflect::get(value, &JsValue::from_str("message"))
                .ok()
                .and_then(|message| message.as_string())
        })
        .unwrap_or_else(|| format!("{value:?}"))
}
