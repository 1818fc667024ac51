//! An HTTP client that fetches experiment definitions from a remote admin service.
use std::sync::atomic::{AtomicBool, Ordering};

use reqwest::{StatusCode, Url};

use super::ExperimentSource;
use crate::{experiment::Experiment, Error, Result};

/// Configuration for [`HttpExperimentSource`].
#[derive(Debug, Clone)]
pub struct HttpExperimentSourceConfig {
    /// Base URL of the admin service. Experiments are read from `{base_url}/experiments/{testId}`.
    pub base_url: String,
    /// Sent as the `apiKey` query parameter.
    pub api_key: String,
}

impl HttpExperimentSourceConfig {
    /// Default base URL for a co-located admin service.
    pub const DEFAULT_BASE_URL: &'static str = "http://localhost:8080/api";

    #[allow(missing_docs)]
    pub fn new(api_key: impl Into<String>) -> HttpExperimentSourceConfig {
        HttpExperimentSourceConfig {
            base_url: Self::DEFAULT_BASE_URL.to_owned(),
            api_key: api_key.into(),
        }
    }

    #[allow(missing_docs)]
    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

/// Reads experiment definitions over HTTP.
pub struct HttpExperimentSource {
    // Client holds a connection pool internally, so we're reusing the client between requests.
    client: reqwest::blocking::Client,
    base_url: Url,
    api_key: String,
    /// If we receive a 401 Unauthorized error during a request, it means the API key is not
    /// valid. We cache this error so we don't issue additional requests to the server.
    unauthorized: AtomicBool,
}

impl HttpExperimentSource {
    /// Create a source from `config`. Fails if the base URL cannot be parsed.
    pub fn new(config: HttpExperimentSourceConfig) -> Result<HttpExperimentSource> {
        Self::with_client(config, reqwest::blocking::Client::new())
    }

    /// Same as [`HttpExperimentSource::new`] but reusing an existing HTTP client.
    pub fn with_client(
        config: HttpExperimentSourceConfig,
        client: reqwest::blocking::Client,
    ) -> Result<HttpExperimentSource> {
        let mut base_url = Url::parse(&config.base_url).map_err(Error::InvalidBaseUrl)?;
        if base_url.cannot_be_a_base() {
            return Err(Error::InvalidBaseUrl(url::ParseError::RelativeUrlWithCannotBeABaseBase));
        }
        // Path segments are appended, so a trailing slash would produce an empty segment.
        if let Ok(mut segments) = base_url.path_segments_mut() {
            segments.pop_if_empty();
        }

        Ok(HttpExperimentSource {
            client,
            base_url,
            api_key: config.api_key,
            unauthorized: AtomicBool::new(false),
        })
    }

    fn experiment_url(&self, test_id: &str) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            // Percent-encodes the id, so ids containing `/` or `?` stay a single segment.
            segments.extend(["experiments", test_id]);
        }
        url.query_pairs_mut().append_pair("apiKey", &self.api_key);
        url
    }
}

impl ExperimentSource for HttpExperimentSource {
    fn fetch(&self, test_id: &str) -> Result<Option<Experiment>> {
        if self.unauthorized.load(Ordering::Relaxed) {
            return Err(Error::Unauthorized);
        }

        log::debug!(target: "abkit", test_id; "fetching experiment definition over HTTP");
        let response = self.client.get(self.experiment_url(test_id)).send()?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let response = response.error_for_status().map_err(|err| {
            if err.status() == Some(StatusCode::UNAUTHORIZED) {
                log::warn!(target: "abkit", "experiment source is not authorized. Check your API key");
                self.unauthorized.store(true, Ordering::Relaxed);
                Error::Unauthorized
            } else {
                log::warn!(target: "abkit", test_id; "received non-200 response while fetching experiment: {:?}", err);
                Error::from(err)
            }
        })?;

        let experiment = response.json()?;

        log::debug!(target: "abkit", test_id; "successfully fetched experiment definition");

        Ok(Some(experiment))
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io::{BufRead, BufReader, Write},
        net::TcpListener,
        sync::mpsc,
        thread::JoinHandle,
    };

    use super::{HttpExperimentSource, HttpExperimentSourceConfig};
    use crate::{registry::ExperimentSource, Error};

    /// Serve `responses` one connection at a time, reporting each request line.
    fn serve(
        responses: Vec<(&'static str, &'static str)>,
    ) -> (String, mpsc::Receiver<String>, JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let base_url = format!("http://{}/api/", listener.local_addr().unwrap());
        let (tx, rx) = mpsc::channel();

        let handle = std::thread::spawn(move || {
            for (status, body) in responses {
                let (mut stream, _) = listener.accept().unwrap();
                let mut reader = BufReader::new(stream.try_clone().unwrap());
                let mut request_line = String::new();
                reader.read_line(&mut request_line).unwrap();
                // Drain headers.
                loop {
                    let mut line = String::new();
                    reader.read_line(&mut line).unwrap();
                    if line == "\r\n" || line.is_empty() {
                        break;
                    }
                }
                tx.send(request_line.trim_end().to_owned()).unwrap();

                write!(
                    stream,
                    "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                )
                .unwrap();
            }
        });

        (base_url, rx, handle)
    }

    fn source(base_url: &str) -> HttpExperimentSource {
        let client = reqwest::blocking::Client::builder()
            .no_proxy()
            .build()
            .unwrap();
        HttpExperimentSource::with_client(
            HttpExperimentSourceConfig::new("secret").base_url(base_url),
            client,
        )
        .unwrap()
    }

    const EXPERIMENT: &str = r#"{
        "id": "homepage cta",
        "name": "Homepage CTA",
        "status": "running",
        "variants": [{"variantId": "A", "name": "A", "weight": 50}, {"variantId": "B", "name": "B", "weight": 50}],
        "trafficAllocationPercent": 100,
        "createdAt": "2024-05-01T00:00:00Z",
        "updatedAt": "2024-05-01T00:00:00Z"
    }"#;

    #[test]
    fn fetches_and_parses_experiment() {
        let (base_url, requests, server) = serve(vec![("200 OK", EXPERIMENT)]);
        let source = source(&base_url);

        let experiment = source.fetch("homepage cta").unwrap().unwrap();
        assert_eq!(experiment.id, "homepage cta");
        assert_eq!(experiment.variants.len(), 2);

        assert_eq!(
            requests.recv().unwrap(),
            "GET /api/experiments/homepage%20cta?apiKey=secret HTTP/1.1"
        );
        server.join().unwrap();
    }

    #[test]
    fn not_found_is_none() {
        let (base_url, _requests, server) = serve(vec![("404 Not Found", "{}")]);
        assert!(source(&base_url).fetch("missing").unwrap().is_none());
        server.join().unwrap();
    }

    #[test]
    fn unauthorized_is_cached() {
        let (base_url, requests, server) = serve(vec![("401 Unauthorized", "{}")]);
        let source = source(&base_url);

        assert!(matches!(source.fetch("exp"), Err(Error::Unauthorized)));
        server.join().unwrap();
        requests.recv().unwrap();

        // No second request is issued.
        assert!(matches!(source.fetch("exp"), Err(Error::Unauthorized)));
        assert!(requests.try_recv().is_err());
    }

    #[test]
    fn server_errors_are_network_errors() {
        let (base_url, _requests, server) = serve(vec![("503 Service Unavailable", "{}")]);
        assert!(matches!(
            source(&base_url).fetch("exp"),
            Err(Error::Network(_))
        ));
        server.join().unwrap();
    }

    #[test]
    fn rejects_invalid_base_url() {
        assert!(matches!(
            HttpExperimentSource::new(HttpExperimentSourceConfig::new("key").base_url("not a url")),
            Err(Error::InvalidBaseUrl(_))
        ));
    }
}
