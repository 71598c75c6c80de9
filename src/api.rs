//! HTTP clients for the flag configuration and cohort download endpoints.
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::{header, StatusCode, Url};

use crate::{
    cohort::{Cohort, CohortDownload},
    flag::FlagConfig,
    Error, Result,
};

pub(crate) const USER_AGENT: &str = concat!("flagsync/", env!("CARGO_PKG_VERSION"));

/// Fetches a full snapshot of flag configurations.
pub trait FlagConfigApi: Send + Sync {
    fn get_flag_configs(&self) -> Result<Vec<FlagConfig>>;
}

/// Downloads a single cohort.
pub trait CohortApi: Send + Sync {
    /// Download `cohort_id`. `existing` is the version the client already holds, if any; the server
    /// may answer [`CohortDownload::NotModified`] in that case.
    fn get_cohort(&self, cohort_id: &str, existing: Option<&Cohort>) -> Result<CohortDownload>;
}

/// Parse `base` and append `segments` to its path.
pub(crate) fn endpoint_url(base: &str, segments: &[&str]) -> Result<Url> {
    let mut url = Url::parse(base).map_err(Error::InvalidUrl)?;
    url.path_segments_mut()
        .map_err(|()| Error::InvalidUrl(url::ParseError::RelativeUrlWithCannotBeABaseBase))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

/// [`FlagConfigApi`] requesting `GET {server_url}/sdk/v2/flags`.
pub struct HttpFlagConfigApi {
    // Client holds a connection pool internally, so we're reusing the client between requests.
    client: reqwest::blocking::Client,
    url: Url,
    authorization: String,
}

impl HttpFlagConfigApi {
    /// # Errors
    ///
    /// - [`Error::InvalidUrl`] if `server_url` is not a valid base URL.
    /// - [`Error::Network`] if the HTTP client could not be created.
    pub fn new(server_url: &str, deployment_key: &str, timeout: Duration) -> Result<HttpFlagConfigApi> {
        let mut url = endpoint_url(server_url, &["sdk", "v2", "flags"])?;
        url.query_pairs_mut().append_pair("v", "0");

        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()?;

        Ok(HttpFlagConfigApi {
            client,
            url,
            authorization: format!("Api-Key {deployment_key}"),
        })
    }
}

impl FlagConfigApi for HttpFlagConfigApi {
    fn get_flag_configs(&self) -> Result<Vec<FlagConfig>> {
        log::debug!(target: "flagsync", "fetching flag configs");
        let response = self
            .client
            .get(self.url.clone())
            .header(header::AUTHORIZATION, &self.authorization)
            .send()?;

        match response.status() {
            StatusCode::OK => {}
            StatusCode::UNAUTHORIZED => {
                log::warn!(target: "flagsync", "client is not authorized. Check your deployment key");
                return Err(Error::Unauthorized);
            }
            status => {
                log::warn!(target: "flagsync", "received non-200 response while fetching flag configs: {status}");
                return Err(Error::UnexpectedStatus(status.as_u16()));
            }
        }

        let body = response.bytes()?;
        let flags: Vec<FlagConfig> = serde_json::from_slice(&body)?;
        log::debug!(target: "flagsync", count = flags.len(); "successfully fetched flag configs");
        Ok(flags)
    }
}

/// [`CohortApi`] requesting `GET {cohort_server_url}/sdk/v1/cohort/{id}`.
pub struct HttpCohortApi {
    client: reqwest::blocking::Client,
    base_url: Url,
    authorization: String,
    max_cohort_size: usize,
}

impl HttpCohortApi {
    pub fn new(
        cohort_server_url: &str,
        api_key: &str,
        secret_key: &str,
        max_cohort_size: usize,
        timeout: Duration,
    ) -> Result<HttpCohortApi> {
        let base_url = endpoint_url(cohort_server_url, &["sdk", "v1", "cohort"])?;
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()?;

        Ok(HttpCohortApi {
            client,
            base_url,
            authorization: format!("Basic {}", STANDARD.encode(format!("{api_key}:{secret_key}"))),
            max_cohort_size,
        })
    }

    fn cohort_url(&self, cohort_id: &str, existing: Option<&Cohort>) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.push(cohort_id);
        }
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("maxCohortSize", &self.max_cohort_size.to_string());
            if let Some(existing) = existing {
                query.append_pair("lastModified", &existing.last_modified.to_string());
            }
        }
        url
    }
}

impl CohortApi for HttpCohortApi {
    fn get_cohort(&self, cohort_id: &str, existing: Option<&Cohort>) -> Result<CohortDownload> {
        log::debug!(target: "flagsync", cohort_id; "downloading cohort");
        let response = self
            .client
            .get(self.cohort_url(cohort_id, existing))
            .header(header::AUTHORIZATION, &self.authorization)
            .send()?;

        match response.status() {
            StatusCode::OK => {
                let body = response.bytes()?;
                let cohort: Cohort = serde_json::from_slice(&body)?;
                Ok(CohortDownload::Updated(cohort))
            }
            StatusCode::NO_CONTENT => Ok(CohortDownload::NotModified),
            StatusCode::PAYLOAD_TOO_LARGE => Ok(CohortDownload::TooLarge),
            StatusCode::UNAUTHORIZED => {
                log::warn!(target: "flagsync", "cohort download is not authorized. Check your cohort api key and secret");
                Err(Error::Unauthorized)
            }
            status => Err(Error::UnexpectedStatus(status.as_u16())),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{endpoint_url, HttpCohortApi, HttpFlagConfigApi};
    use crate::{storage::tests::cohort, Error};

    #[test]
    fn builds_endpoint_urls() {
        let url = endpoint_url("https://example.com", &["sdk", "v2", "flags"]).unwrap();
        assert_eq!(url.as_str(), "https://example.com/sdk/v2/flags");

        let url = endpoint_url("https://example.com/proxy/", &["sdk", "v2", "flags"]).unwrap();
        assert_eq!(url.as_str(), "https://example.com/proxy/sdk/v2/flags");
    }

    #[test]
    fn rejects_invalid_server_url() {
        let result = HttpFlagConfigApi::new("not a url", "key", Duration::from_secs(1));
        assert!(matches!(result, Err(Error::InvalidUrl(_))));
    }

    #[test]
    fn cohort_url_carries_size_limit_and_version() {
        let api = HttpCohortApi::new(
            "https://cohorts.example.com",
            "api",
            "secret",
            100,
            Duration::from_secs(1),
        )
        .unwrap();

        let url = api.cohort_url("abc", None);
        assert_eq!(
            url.as_str(),
            "https://cohorts.example.com/sdk/v1/cohort/abc?maxCohortSize=100"
        );

        let url = api.cohort_url("abc", Some(&cohort("abc", 42, &[])));
        assert_eq!(
            url.as_str(),
            "https://cohorts.example.com/sdk/v1/cohort/abc?maxCohortSize=100&lastModified=42"
        );
    }

    #[test]
    fn cohort_requests_use_basic_auth() {
        let api = HttpCohortApi::new(
            "https://cohorts.example.com",
            "api",
            "secret",
            100,
            Duration::from_secs(1),
        )
        .unwrap();
        assert_eq!(api.authorization, "Basic YXBpOnNlY3JldA==");
    }
}
