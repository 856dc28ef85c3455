use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{Body, Client, Response};
use url::Url;
use crate::config::ClientConfig;
use crate::errors::{Result, TransferError};
use crate::types::{RemoteFileRef, UploadItem};

pub const AUTH_HEADER: &str = "X-Auth";

/// Endpoints and credentials of the storage service.
#[derive(Debug, Clone)]
pub struct RemoteApi {
    client: Client,
    endpoint: Url,
    auth: HeaderValue,
}

impl RemoteApi {
    pub fn new(endpoint: &str, token: &str) -> Result<Self> {
        Self::with_client(Client::new(), endpoint, token)
    }

    pub fn from_config(config: &ClientConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout())
            .tcp_nodelay(true)
            .build()?;

        Self::with_client(client, &config.endpoint, &config.token)
    }

    pub fn with_client(client: Client, endpoint: &str, token: &str) -> Result<Self> {
        let mut endpoint = Url::parse(endpoint)?;
        if endpoint.cannot_be_a_base() {
            return Err(TransferError::InvalidUrl(url::ParseError::RelativeUrlWithCannotBeABaseBase));
        }
        endpoint.set_query(None);

        let mut auth = HeaderValue::from_str(token)?;
        auth.set_sensitive(true);

        Ok(Self { client, endpoint, auth })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    pub fn create_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(AUTH_HEADER, self.auth.clone());
        headers
    }

    /// `{endpoint}/files/{id}/download[?version=..]`
    pub fn download_url(&self, file: &RemoteFileRef, version: Option<&str>) -> Result<Url> {
        let mut url = self.url_for(&["files", &file.id, "download"])?;
        if let Some(version) = version {
            url.query_pairs_mut().append_pair("version", version);
        }

        Ok(url)
    }

    /// `{endpoint}/files/{existing}` for new content of a known file,
    /// `{endpoint}/files?path=..` otherwise.
    pub fn upload_url(&self, item: &UploadItem) -> Result<Url> {
        let mut url = match &item.existing {
            Some(existing) => self.url_for(&["files", &existing.id])?,
            None => self.url_for(&["files"])?,
        };

        {
            let mut query = url.query_pairs_mut();
            if item.existing.is_none() {
                if let Some(target) = &item.target {
                    query.append_pair("path", target);
                }
            }
            query.append_pair("public", if item.public { "1" } else { "0" });
            if item.create_version {
                query.append_pair("version", "1");
            }
            if let Some(algorithm) = &item.encryption {
                query.append_pair("encryption", algorithm);
            }
        }

        Ok(url)
    }

    pub async fn download(&self, file: &RemoteFileRef, version: Option<&str>) -> Result<Response> {
        let url = self.download_url(file, version)?;

        let response = self.client
            .get(url)
            .headers(self.create_headers())
            .send()
            .await?;

        Ok(response)
    }

    pub async fn upload(&self, item: &UploadItem, body: Body) -> Result<Response> {
        let url = self.upload_url(item)?;

        let response = self.client
            .put(url)
            .headers(self.create_headers())
            .header("Content-Type", "application/octet-stream")
            .body(body)
            .send()
            .await?;

        Ok(response)
    }

    fn url_for(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.endpoint.clone();
        url.path_segments_mut()
            .map_err(|_| TransferError::InvalidUrl(url::ParseError::RelativeUrlWithCannotBeABaseBase))?
            .pop_if_empty()
            .extend(segments);

        Ok(url)
    }
}
