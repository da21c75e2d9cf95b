use std::fmt;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CONNECTION};
use reqwest::{StatusCode, Url};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{debug, info_span, Instrument};

/// PKCS12 client certificate used for mutual TLS.
#[derive(Clone)]
pub struct ClientIdentity {
    pub pfx_bytes: Vec<u8>,
    pub passphrase: String,
}

impl fmt::Debug for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientIdentity")
            .field("pfx_bytes", &format_args!("<{} bytes>", self.pfx_bytes.len()))
            .field("passphrase", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub identity: Option<ClientIdentity>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            user_agent: None,
            identity: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("building http client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("invalid client certificate: {0}")]
    Identity(#[source] reqwest::Error),
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("malformed payload from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Returns `url` with every `(key, value)` of `query` set, replacing earlier values of the same key.
pub fn with_query(url: &Url, query: &[(&str, &str)]) -> Url {
    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(key, _)| !query.iter().any(|(k, _)| *k == &**key))
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();

    let mut url = url.clone();
    url.set_query(None);
    if kept.is_empty() && query.is_empty() {
        return url;
    }
    url.query_pairs_mut()
        .extend_pairs(kept)
        .extend_pairs(query.iter().copied());
    url
}

/// Thin GET-only client; failures are returned to the caller without retrying.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> Result<Self, FetchError> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json;charset=utf-8"));
        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));

        let mut builder = reqwest::Client::builder()
            .default_headers(headers)
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        if let Some(identity) = &config.identity {
            let identity =
                reqwest::Identity::from_pkcs12_der(&identity.pfx_bytes, &identity.passphrase)
                    .map_err(FetchError::Identity)?;
            builder = builder.use_native_tls().identity(identity);
        }

        let client = builder.build().map_err(FetchError::Client)?;
        Ok(Self { client })
    }

    pub async fn get_text(&self, url: &Url, query: &[(&str, &str)]) -> Result<String, FetchError> {
        let url = with_query(url, query);
        let span = info_span!("http_fetch", url = %url);
        async {
            let response = self
                .client
                .get(url.clone())
                .send()
                .await
                .map_err(|source| FetchError::Request {
                    url: url.to_string(),
                    source,
                })?;

            let status = response.status();
            if !status.is_success() {
                return Err(http_status_error(status, &url));
            }

            let body = response.text().await.map_err(|source| FetchError::Request {
                url: url.to_string(),
                source,
            })?;
            debug!(bytes = body.len(), "fetched payload");
            Ok(body)
        }
        .instrument(span)
        .await
    }

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        url: &Url,
        query: &[(&str, &str)],
    ) -> Result<T, FetchError> {
        let body = self.get_text(url, query).await?;
        serde_json::from_str(&body).map_err(|source| FetchError::Decode {
            url: with_query(url, query).to_string(),
            source,
        })
    }
}

fn http_status_error(status: StatusCode, url: &Url) -> FetchError {
    FetchError::HttpStatus {
        status: status.as_u16(),
        url: url.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).expect("url")
    }

    #[test]
    fn query_parameters_are_set_not_duplicated() {
        let base = url("https://monalisa.example/passes?res_path=html&other=1");
        let out = with_query(&base, &[("res_path", "csv")]);
        let pairs: Vec<(String, String)> = out
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        assert_eq!(
            pairs,
            vec![
                ("other".to_string(), "1".to_string()),
                ("res_path".to_string(), "csv".to_string()),
            ]
        );
    }

    #[test]
    fn query_values_are_encoded() {
        let base = url("https://monalisa.example/details");
        let out = with_query(&base, &[("res_path", "json"), ("filter_jobtype", "LHC22b skimmed")]);
        assert_eq!(
            out.as_str(),
            "https://monalisa.example/details?res_path=json&filter_jobtype=LHC22b+skimmed"
        );
    }

    #[test]
    fn identity_debug_output_hides_secrets() {
        let identity = ClientIdentity {
            pfx_bytes: vec![1, 2, 3],
            passphrase: "hunter2".into(),
        };
        let rendered = format!("{identity:?}");
        assert!(rendered.contains("<3 bytes>"));
        assert!(!rendered.contains("hunter2"));
    }

    #[test]
    fn garbage_certificate_is_rejected() {
        let err = HttpFetcher::new(HttpClientConfig {
            identity: Some(ClientIdentity {
                pfx_bytes: b"not a pkcs12 archive".to_vec(),
                passphrase: "secret".into(),
            }),
            ..Default::default()
        })
        .unwrap_err();
        assert!(matches!(err, FetchError::Identity(_)));
    }

    #[test]
    fn anonymous_client_builds() {
        assert!(HttpFetcher::new(HttpClientConfig::default()).is_ok());
    }
}
