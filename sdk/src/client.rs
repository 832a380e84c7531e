use {
    anyhow::{bail, format_err, Context as _, Result},
    bytes::Bytes,
    futures::Stream,
    reqwest::{
        header::{CONTENT_LENGTH, USER_AGENT},
        Body, Response, StatusCode, Url,
    },
    std::time::Duration,
    tracing::{debug, instrument},
};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
/// Transferring large files may take a long time.
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(3600 * 24);

const AGENT: &str = concat!("kasta/", env!("CARGO_PKG_VERSION"));

/// Reuse created client or clone it in order to reuse a connection pool.
#[derive(Clone)]
pub struct Client {
    reqwest: reqwest::Client,
    /// Upload destination; downloads carry their own full URLs.
    base_url: Option<Url>,
}

/// Server-side retention limits attached to an upload.
#[derive(Debug, Clone, Copy, Default)]
pub struct UploadOptions {
    /// Days the blob is kept before expiring.
    pub max_days: Option<u32>,
    /// Downloads allowed before the blob expires.
    pub max_downloads: Option<u32>,
}

impl Client {
    pub fn new(base_url: Option<Url>) -> Result<Self> {
        if let Some(base_url) = &base_url {
            if base_url.cannot_be_a_base() {
                bail!("invalid server URL: {base_url}");
            }
        }
        Ok(Self {
            base_url,
            reqwest: reqwest::Client::builder()
                .connect_timeout(DEFAULT_TIMEOUT)
                .timeout(RESPONSE_TIMEOUT)
                .build()?,
        })
    }

    /// Uploads a container streamed from `body` as `{base_url}/{name}` and
    /// returns the download URL assigned by the server.
    ///
    /// The body is a one-shot stream, so a failed upload is reported as-is
    /// instead of being retried.
    #[instrument(skip_all, fields(name))]
    pub async fn upload(
        &self,
        name: &str,
        body: impl Stream<Item = std::io::Result<Bytes>> + Send + Sync + 'static,
        size: Option<u64>,
        options: UploadOptions,
    ) -> Result<String> {
        let url = self.blob_url(name)?;
        let mut request = self
            .reqwest
            .put(url)
            .header(USER_AGENT, AGENT)
            .body(Body::wrap_stream(body));
        if let Some(size) = size {
            request = request.header(CONTENT_LENGTH, size);
        }
        if let Some(days) = options.max_days {
            request = request.header("Max-Days", days);
        }
        if let Some(downloads) = options.max_downloads {
            request = request.header("Max-Downloads", downloads);
        }
        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            bail!("server rejected the upload ({status}): {}", text.trim());
        }
        let download_url = text.trim();
        if download_url.is_empty() {
            bail!("server returned an empty download URL");
        }
        debug!(url = download_url, "upload complete");
        Ok(download_url.to_owned())
    }

    /// Starts a download and returns the streaming response body.
    #[instrument(skip(self))]
    pub async fn download(&self, url: &Url) -> Result<Response> {
        let response = self
            .reqwest
            .get(url.clone())
            .header(USER_AGENT, AGENT)
            .send()
            .await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            bail!("not found: {url}");
        }
        response
            .error_for_status()
            .with_context(|| format!("download of {url} failed"))
    }

    fn blob_url(&self, name: &str) -> Result<Url> {
        let mut url = self
            .base_url
            .clone()
            .context("no server URL configured")?;
        url.path_segments_mut()
            .map_err(|()| format_err!("failed server URL extension"))?
            .pop_if_empty()
            .push(name);
        Ok(url)
    }
}
