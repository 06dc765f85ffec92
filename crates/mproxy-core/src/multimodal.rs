//! Message-content normalization: local image files are inlined as data
//! URLs, remote image URLs are fetched and inlined on a best-effort basis,
//! and malformed image references are rejected before any upstream work.

use std::path::Path;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;

use mproxy_protocol::openai::{ChatCompletionRequest, ContentPart, MessageContent};

use crate::error::{ProxyError, ProxyResult};

const SUPPORTED_IMAGE_MIME: &[&str] = &[
    "image/jpeg",
    "image/jpg",
    "image/png",
    "image/gif",
    "image/webp",
    "image/bmp",
    "image/tiff",
    "image/svg+xml",
];

fn is_supported_mime(mime: &str) -> bool {
    SUPPORTED_IMAGE_MIME.contains(&mime)
}

pub struct MultimodalProcessor {
    client: wreq::Client,
    fetch_timeout: Duration,
}

impl MultimodalProcessor {
    pub fn new(fetch_timeout: Duration) -> ProxyResult<Self> {
        let client = wreq::Client::builder()
            .timeout(fetch_timeout)
            .build()
            .map_err(|err| ProxyError::Configuration(format!("image fetch client: {err}")))?;
        Ok(Self {
            client,
            fetch_timeout,
        })
    }

    /// Reject requests whose image references cannot possibly resolve.
    pub fn validate(&self, request: &ChatCompletionRequest) -> ProxyResult<()> {
        for message in &request.messages {
            let MessageContent::Parts(parts) = &message.content else {
                continue;
            };
            for part in parts {
                let ContentPart::ImageUrl { image_url } = part else {
                    continue;
                };
                let url = image_url.url.as_str();
                if url.is_empty() {
                    return Err(ProxyError::Validation("empty image url".to_string()));
                }
                let resolvable = url.starts_with("data:")
                    || url.starts_with("http://")
                    || url.starts_with("https://")
                    || Path::new(url).exists();
                if !resolvable {
                    return Err(ProxyError::Validation(format!(
                        "unresolvable image url: {url}"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Rewrite message content so no local path remains and remote images
    /// are inlined where possible. Fetch failures downgrade to the
    /// original URL instead of failing the request.
    pub async fn process(
        &self,
        mut request: ChatCompletionRequest,
    ) -> ProxyResult<ChatCompletionRequest> {
        for message in &mut request.messages {
            let MessageContent::Parts(parts) = &mut message.content else {
                continue;
            };
            for part in parts {
                let ContentPart::ImageUrl { image_url } = part else {
                    continue;
                };
                let url = image_url.url.clone();
                if url.starts_with("data:") {
                    continue;
                }
                if url.starts_with("http://") || url.starts_with("https://") {
                    match self.download_image(&url).await {
                        Ok(data_url) => image_url.url = data_url,
                        Err(reason) => {
                            tracing::warn!(%url, %reason, "image fetch failed, keeping url");
                        }
                    }
                    continue;
                }
                // Anything else passed validation as an existing local path.
                image_url.url = encode_local_image(Path::new(&url))?;
            }
        }
        Ok(request)
    }

    async fn download_image(&self, url: &str) -> Result<String, String> {
        let response = tokio::time::timeout(
            self.fetch_timeout,
            self.client.request(wreq::Method::GET, url).send(),
        )
        .await
        .map_err(|_| "timeout".to_string())?
        .map_err(|err| err.to_string())?;

        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            return Err(format!("status {status}"));
        }

        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|value| value.to_str().ok())
            .map(|value| value.split(';').next().unwrap_or(value).trim().to_string())
            .unwrap_or_default();
        if !content_type.starts_with("image/") || !is_supported_mime(&content_type) {
            return Err(format!("unsupported content type: {content_type}"));
        }

        let body = response.bytes().await.map_err(|err| err.to_string())?;
        Ok(format!("data:{content_type};base64,{}", BASE64.encode(&body)))
    }
}

/// Read a local image file into a data URL, detecting MIME from the
/// extension. Unsupported extensions fail the request.
fn encode_local_image(path: &Path) -> ProxyResult<String> {
    let mime = mime_guess::from_path(path).first_raw().unwrap_or("");
    if !is_supported_mime(mime) {
        return Err(ProxyError::Validation(format!(
            "unsupported image format: {}",
            path.display()
        )));
    }
    let bytes = std::fs::read(path).map_err(|err| {
        ProxyError::Validation(format!("unreadable image {}: {err}", path.display()))
    })?;
    Ok(format!("data:{mime};base64,{}", BASE64.encode(&bytes)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use mproxy_protocol::openai::{ChatMessage, ImageUrl, MessageRole};

    fn processor() -> MultimodalProcessor {
        MultimodalProcessor::new(Duration::from_secs(5)).unwrap()
    }

    fn request_with_image(url: &str) -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: "gpt-4".to_string(),
            messages: vec![ChatMessage {
                role: MessageRole::User,
                content: MessageContent::Parts(vec![
                    ContentPart::Text {
                        text: "look".to_string(),
                    },
                    ContentPart::ImageUrl {
                        image_url: ImageUrl {
                            url: url.to_string(),
                            detail: None,
                        },
                    },
                ]),
            }],
            max_tokens: None,
            temperature: None,
            top_p: None,
            stream: None,
            stop: None,
        }
    }

    fn temp_file(name: &str, contents: &[u8]) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!("mproxy-mm-{}-{name}", std::process::id()));
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn validation_rejects_empty_and_unresolvable_urls() {
        let processor = processor();
        let empty = request_with_image("");
        assert!(matches!(
            processor.validate(&empty),
            Err(ProxyError::Validation(_))
        ));

        let missing = request_with_image("/definitely/not/here.png");
        assert!(matches!(
            processor.validate(&missing),
            Err(ProxyError::Validation(_))
        ));

        let data = request_with_image("data:image/png;base64,AAAA");
        assert!(processor.validate(&data).is_ok());

        let remote = request_with_image("https://example.com/x.png");
        assert!(processor.validate(&remote).is_ok());

        let plain = ChatCompletionRequest {
            messages: vec![ChatMessage::text(MessageRole::User, "no images here")],
            ..request_with_image("ignored")
        };
        assert!(processor.validate(&plain).is_ok());
    }

    #[tokio::test]
    async fn local_image_is_inlined_with_matching_bytes() {
        let processor = processor();
        let bytes = b"\x89PNG\r\n\x1a\nfakepixels";
        let path = temp_file("inline.png", bytes);

        let request = request_with_image(path.to_str().unwrap());
        let processed = processor.process(request).await.unwrap();

        let MessageContent::Parts(parts) = &processed.messages[0].content else {
            panic!("expected parts");
        };
        let ContentPart::ImageUrl { image_url } = &parts[1] else {
            panic!("expected image part");
        };
        let expected = format!("data:image/png;base64,{}", BASE64.encode(bytes));
        assert_eq!(image_url.url, expected);

        let (_, payload) = image_url.url.split_once(",").unwrap();
        assert_eq!(BASE64.decode(payload).unwrap(), bytes);

        std::fs::remove_file(path).ok();
    }

    #[tokio::test]
    async fn unsupported_extension_fails_validation() {
        let processor = processor();
        let path = temp_file("notes.txt", b"not an image");

        let request = request_with_image(path.to_str().unwrap());
        let err = processor.process(request).await.unwrap_err();
        assert!(matches!(err, ProxyError::Validation(_)));

        std::fs::remove_file(path).ok();
    }

    #[tokio::test]
    async fn data_urls_and_text_pass_through_untouched() {
        let processor = processor();
        let request = request_with_image("data:image/gif;base64,R0lGOD");
        let processed = processor.process(request.clone()).await.unwrap();
        assert_eq!(processed, request);
    }
}
