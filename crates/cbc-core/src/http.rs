//! Blocking HTTP plumbing shared by the signed service clients.

use chrono::Utc;
use reqwest::blocking::{Client, Response};
use reqwest::{Method, Url};
use std::time::Duration;

use crate::error::{CbcError, Result};
use crate::sigv4::Signer;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

pub fn build_client() -> Result<Client> {
    Ok(Client::builder().timeout(DEFAULT_TIMEOUT).build()?)
}

/// Sign and send one request. `headers` are covered by the signature.
pub fn send_signed(
    client: &Client,
    signer: &Signer,
    method: Method,
    url: Url,
    headers: &[(&str, &str)],
    body: Vec<u8>,
) -> Result<Response> {
    let signed = signer.sign(method.as_str(), &url, headers, &body, Utc::now())?;
    let mut req = client.request(method, url);
    for (name, value) in signed {
        // reqwest derives Host from the URL; the signed value is identical.
        if name == "host" {
            continue;
        }
        req = req.header(name, value);
    }
    Ok(req.body(body).send()?)
}

/// Read a response body as text for error messages, capped so a large HTML
/// error page does not flood the logs.
pub fn error_body(response: Response) -> String {
    let text = response.text().unwrap_or_default();
    text.chars().take(500).collect()
}

pub fn parse_url(raw: &str) -> Result<Url> {
    Url::parse(raw).map_err(|e| CbcError::Upstream(format!("invalid url '{raw}': {e}")))
}
