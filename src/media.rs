use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use reqwest::Client;
use thiserror::Error;

const DEFAULT_MIME: &str = "image/jpeg";

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("failed to fetch image: {0}")]
    Fetch(String),
    #[error("image fetch returned HTTP {0}")]
    Status(u16),
    #[error("malformed data url")]
    InvalidDataUrl,
}

/// An image held in memory alongside its content type, ready to be inlined
/// into a model request as a data URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedImage {
    pub mime: String,
    pub data: String,
}

impl EncodedImage {
    pub fn from_bytes(mime: &str, bytes: &[u8]) -> Self {
        Self {
            mime: mime.to_string(),
            data: BASE64.encode(bytes),
        }
    }

    pub fn data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime, self.data)
    }
}

/// Fetches `reference` into an [`EncodedImage`]. Data URLs pass through
/// without a network round trip; anything else is downloaded with `http`.
pub async fn fetch_image(http: &Client, reference: &str) -> Result<EncodedImage, MediaError> {
    if reference.starts_with("data:") {
        let (mime, bytes) = parse_data_url(reference)?;
        return Ok(EncodedImage::from_bytes(&mime, &bytes));
    }

    let response = http
        .get(reference)
        .send()
        .await
        .map_err(|err| MediaError::Fetch(err.to_string()))?;
    let status = response.status();
    if !status.is_success() {
        return Err(MediaError::Status(status.as_u16()));
    }
    let mime = mime_from_header(response.headers().get(reqwest::header::CONTENT_TYPE));
    let bytes = response
        .bytes()
        .await
        .map_err(|err| MediaError::Fetch(err.to_string()))?;
    Ok(EncodedImage::from_bytes(&mime, &bytes))
}

pub fn parse_data_url(url: &str) -> Result<(String, Vec<u8>), MediaError> {
    let rest = url.strip_prefix("data:").ok_or(MediaError::InvalidDataUrl)?;
    let (header, payload) = rest.split_once(',').ok_or(MediaError::InvalidDataUrl)?;
    let Some(mime) = header.strip_suffix(";base64") else {
        return Err(MediaError::InvalidDataUrl);
    };
    let bytes = BASE64
        .decode(payload.trim())
        .map_err(|_| MediaError::InvalidDataUrl)?;
    let mime = if mime.is_empty() { DEFAULT_MIME } else { mime };
    Ok((mime.to_string(), bytes))
}

fn mime_from_header(value: Option<&reqwest::header::HeaderValue>) -> String {
    value
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(';').next().unwrap_or(v).trim())
        .filter(|v| !v.is_empty())
        .unwrap_or(DEFAULT_MIME)
        .to_string()
}
