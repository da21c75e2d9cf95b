//! MonAlisa client: fetches data pass and simulation pass listings and normalizes them.

mod payload;

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bkp_storage::{ClientIdentity, FetchError, HttpClientConfig, HttpFetcher, Url};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info};

pub use payload::{
    extract_jira_id, parse_data_pass_version_details, parse_data_pass_versions,
    parse_simulation_passes, DataPassVersionDetails, DataPassVersionRecord,
    RawSimulationPass, SimulationPassAssociations, SimulationPassRecord,
};

pub const CRATE_NAME: &str = "bkp-monalisa";

#[derive(Debug, Error)]
pub enum MonAlisaError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("invalid MonAlisa configuration: {0}")]
    Config(String),
    #[error("reading client certificate {path}: {source}")]
    Certificate {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonAlisaConfig {
    pub data_passes_url: Url,
    pub data_pass_details_url: Url,
    pub simulation_passes_url: Url,
    /// Periods of earlier years are ignored.
    pub year_lower_limit: i32,
}

impl MonAlisaConfig {
    pub fn parse(
        data_passes_url: &str,
        data_pass_details_url: &str,
        simulation_passes_url: &str,
        year_lower_limit: i32,
    ) -> Result<Self, MonAlisaError> {
        Ok(Self {
            data_passes_url: parse_url("data passes", data_passes_url)?,
            data_pass_details_url: parse_url("data pass details", data_pass_details_url)?,
            simulation_passes_url: parse_url("simulation passes", simulation_passes_url)?,
            year_lower_limit,
        })
    }
}

fn parse_url(label: &str, raw: &str) -> Result<Url, MonAlisaError> {
    if raw.trim().is_empty() {
        return Err(MonAlisaError::Config(format!("{label} url is not set")));
    }
    Url::parse(raw.trim()).map_err(|err| MonAlisaError::Config(format!("{label} url `{raw}`: {err}")))
}

/// Reads a PKCS12 certificate for mutual TLS. No path means anonymous requests.
pub fn load_identity(
    path: Option<&Path>,
    passphrase: Option<&str>,
) -> Result<Option<ClientIdentity>, MonAlisaError> {
    let Some(path) = path else {
        return Ok(None);
    };
    let pfx_bytes = std::fs::read(path).map_err(|source| MonAlisaError::Certificate {
        path: path.to_path_buf(),
        source,
    })?;
    debug!(path = %path.display(), bytes = pfx_bytes.len(), "loaded client certificate");
    Ok(Some(ClientIdentity {
        pfx_bytes,
        passphrase: passphrase.unwrap_or_default().to_string(),
    }))
}

/// Source of external pass listings consumed by the synchronizer.
#[async_trait]
pub trait PassSource: Send + Sync {
    async fn data_pass_versions(&self) -> Result<Vec<DataPassVersionRecord>, MonAlisaError>;

    async fn data_pass_version_details(
        &self,
        description: &str,
    ) -> Result<DataPassVersionDetails, MonAlisaError>;

    async fn simulation_passes(&self) -> Result<Vec<SimulationPassRecord>, MonAlisaError>;
}

#[derive(Debug, Clone)]
pub struct MonAlisaClient {
    http: HttpFetcher,
    config: MonAlisaConfig,
}

impl MonAlisaClient {
    pub fn new(config: MonAlisaConfig, http: HttpClientConfig) -> Result<Self, MonAlisaError> {
        Ok(Self {
            http: HttpFetcher::new(http)?,
            config,
        })
    }
}

#[async_trait]
impl PassSource for MonAlisaClient {
    async fn data_pass_versions(&self) -> Result<Vec<DataPassVersionRecord>, MonAlisaError> {
        let body = self
            .http
            .get_text(&self.config.data_passes_url, &[("res_path", "csv")])
            .await?;
        let records = parse_data_pass_versions(&body, self.config.year_lower_limit);
        info!(count = records.len(), "fetched data pass versions");
        Ok(records)
    }

    async fn data_pass_version_details(
        &self,
        description: &str,
    ) -> Result<DataPassVersionDetails, MonAlisaError> {
        let payload: JsonValue = self
            .http
            .get_json(
                &self.config.data_pass_details_url,
                &[("res_path", "json"), ("filter_jobtype", description)],
            )
            .await?;
        Ok(parse_data_pass_version_details(&payload))
    }

    async fn simulation_passes(&self) -> Result<Vec<SimulationPassRecord>, MonAlisaError> {
        let payload: BTreeMap<String, RawSimulationPass> = self
            .http
            .get_json(&self.config.simulation_passes_url, &[("res_path", "json")])
            .await?;
        let records = parse_simulation_passes(&payload, self.config.year_lower_limit);
        info!(count = records.len(), "fetched simulation passes");
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread::{self, JoinHandle};

    use super::*;

    /// Answers a single HTTP request with `status` and `body`; joins to the raw request head.
    fn serve_once(status: &'static str, body: &'static str) -> (String, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().expect("accept");
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = stream.read(&mut buf).expect("read request");
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
            }
            let response = format!(
                "HTTP/1.1 {status}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            stream.write_all(response.as_bytes()).expect("write response");
            String::from_utf8_lossy(&request).into_owned()
        });
        (format!("http://{addr}"), handle)
    }

    fn client_at(base: &str) -> MonAlisaClient {
        let config = MonAlisaConfig::parse(
            &format!("{base}/raw?x=1"),
            &format!("{base}/details?timesel=0"),
            &format!("{base}/mc"),
            2022,
        )
        .expect("config");
        MonAlisaClient::new(config, HttpClientConfig::default()).expect("client")
    }

    fn request_line(request: &str) -> &str {
        request.lines().next().unwrap_or_default()
    }

    fn config() -> MonAlisaConfig {
        MonAlisaConfig::parse(
            "https://alimonitor.example/production/raw.jsp",
            "https://alimonitor.example/raw/raw_details.jsp?timesel=0",
            "https://alimonitor.example/MC/prodDetails.jsp",
            2022,
        )
        .expect("config")
    }

    #[test]
    fn config_rejects_missing_or_malformed_urls() {
        assert!(matches!(
            MonAlisaConfig::parse("", "https://a.example", "https://b.example", 2022),
            Err(MonAlisaError::Config(_))
        ));
        assert!(matches!(
            MonAlisaConfig::parse("https://a.example", "not a url", "https://b.example", 2022),
            Err(MonAlisaError::Config(_))
        ));
        assert_eq!(config().year_lower_limit, 2022);
    }

    #[test]
    fn identity_is_optional() {
        assert!(load_identity(None, Some("secret")).expect("no identity").is_none());
    }

    #[test]
    fn identity_is_read_from_disk() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        file.write_all(b"pfx-bytes").expect("write");

        let identity = load_identity(Some(file.path()), None)
            .expect("read identity")
            .expect("identity present");
        assert_eq!(identity.pfx_bytes, b"pfx-bytes");
        assert_eq!(identity.passphrase, "");
    }

    #[test]
    fn missing_certificate_is_reported_with_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("missing.p12");
        let err = load_identity(Some(&path), None).expect_err("missing file");
        assert!(matches!(err, MonAlisaError::Certificate { .. }));
        assert!(err.to_string().contains("missing.p12"));
    }

    #[tokio::test]
    async fn listing_is_requested_as_csv_with_json_headers() {
        let (base, server) = serve_once(
            "200 OK",
            "# header\n\"LHC23f_apass1\";\"A\";;;;;;;;;1;;;;2;;3\n\"LHC23g_apass1\";\"B\";;;;;;;;;1;;;;2;;3\n",
        );
        let records = client_at(&base).data_pass_versions().await.expect("listing");
        assert_eq!(records.len(), 2);

        let request = server.join().expect("server");
        assert_eq!(request_line(&request), "GET /raw?x=1&res_path=csv HTTP/1.1");
        let headers = request.to_lowercase();
        assert!(headers.contains("accept: application/json;charset=utf-8"), "{request}");
        assert!(headers.contains("connection: keep-alive"), "{request}");
    }

    #[tokio::test]
    async fn details_are_filtered_by_description() {
        let (base, server) = serve_once("200 OK", r#"{"1":{"run_no":54},"2":{"run_no":54}}"#);
        let details = client_at(&base)
            .data_pass_version_details("LHC22b skimmed")
            .await
            .expect("details");
        assert_eq!(details.run_numbers, vec![54]);

        let request = server.join().expect("server");
        assert_eq!(
            request_line(&request),
            "GET /details?timesel=0&res_path=json&filter_jobtype=LHC22b+skimmed HTTP/1.1"
        );
    }

    #[tokio::test]
    async fn non_success_status_is_reported() {
        let (base, server) = serve_once("503 Service Unavailable", "busy");
        let err = client_at(&base).simulation_passes().await.expect_err("503");
        assert!(matches!(
            err,
            MonAlisaError::Fetch(FetchError::HttpStatus { status: 503, .. })
        ));

        let request = server.join().expect("server");
        assert_eq!(request_line(&request), "GET /mc?res_path=json HTTP/1.1");
    }

    #[tokio::test]
    async fn anonymous_client_reports_unreachable_host() {
        let mut config = config();
        config.data_passes_url = Url::parse("http://127.0.0.1:9/raw").expect("url");
        let client = MonAlisaClient::new(config, HttpClientConfig::default()).expect("client");
        let err = client.data_pass_versions().await.expect_err("connection refused");
        assert!(matches!(err, MonAlisaError::Fetch(FetchError::Request { .. })));
    }
}
