use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use tracing::warn;

use baton_core::{
    BlobFetcher, ChatMessage, ContentPart, DataSource, MessageContent, ModelDescriptor, Result,
    Role,
};

/// Instruction inserted ahead of attached images.
const IMAGE_INSTRUCTION: &str =
    "The user attached the following image(s) as context for their message.";

/// Fetch image data sources (up to the model's limit), base64-encode them,
/// and rebuild the last user message as
/// `[instruction, image parts..., original text]`.
///
/// Called before provider dispatch; providers then translate the canonical
/// image parts into their own wire shape.
pub async fn attach_images(
    messages: &mut [ChatMessage],
    image_sources: &[DataSource],
    fetcher: &dyn BlobFetcher,
    model: &ModelDescriptor,
) -> Result<usize> {
    if image_sources.is_empty() || !model.supports_images {
        return Ok(0);
    }
    let Some(last_user) = messages.iter_mut().rev().find(|m| m.role == Role::User) else {
        return Ok(0);
    };

    let mut parts: Vec<ContentPart> = vec![ContentPart::Text {
        text: IMAGE_INSTRUCTION.to_string(),
    }];
    let mut attached = 0usize;
    for source in image_sources.iter().take(model.image_limit) {
        match fetcher.fetch(source).await {
            Ok(blob) => {
                parts.push(ContentPart::Image {
                    data: BASE64.encode(&blob.bytes),
                    media_type: blob.content_type,
                });
                attached += 1;
            }
            Err(e) => {
                // A missing image degrades the request, it does not fail it.
                warn!(source = %source.id, error = %e, "image fetch failed, skipping");
            }
        }
    }
    if attached == 0 {
        return Ok(0);
    }
    if image_sources.len() > model.image_limit {
        warn!(
            total = image_sources.len(),
            limit = model.image_limit,
            "image sources exceed model limit, extra sources dropped"
        );
    }

    parts.push(ContentPart::Text {
        text: last_user.text_content(),
    });
    last_user.content = MessageContent::Parts(parts);
    Ok(attached)
}
