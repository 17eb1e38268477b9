//! Turns uploaded files into plain text for the knowledge base.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde_json::{json, Value};

use crate::ai::AiClient;
use crate::error::{ApiError, ApiResult};
use crate::prompting::{
    text_extraction_instruction, HTML_EXTRACTION_PROMPT, IMAGE_EXTRACTION_PROMPT,
    PDF_EXTRACTION_PROMPT,
};

pub const OCTET_STREAM: &str = "application/octet-stream";

const SUPPORTED_IMAGE_TYPES: [&str; 4] = ["image/png", "image/jpeg", "image/gif", "image/webp"];

/// How a file of a given mime type is turned into text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Extraction {
    Image,
    Pdf,
    PlainText,
    Markup,
}

/// `type/subtype` without parameters, lowercased: `Text/Plain; charset=utf-8` → `text/plain`.
pub fn mime_essence(mime_type: &str) -> String {
    mime_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase()
}

impl Extraction {
    pub fn for_mime(mime_type: &str) -> ApiResult<Self> {
        let lower = mime_essence(mime_type);
        if SUPPORTED_IMAGE_TYPES.contains(&lower.as_str()) {
            Ok(Self::Image)
        } else if lower.contains("pdf") {
            Ok(Self::Pdf)
        } else if lower.contains("text") {
            if lower == "text/plain" {
                Ok(Self::PlainText)
            } else {
                Ok(Self::Markup)
            }
        } else {
            Err(ApiError::bad_request(format!(
                "Unsupported mime type: {mime_type}"
            )))
        }
    }
}

fn mime_from_extension(file_name: &str) -> Option<&'static str> {
    let (_, ext) = file_name.rsplit_once('.')?;
    let mime = match ext.to_ascii_lowercase().as_str() {
        "txt" | "text" | "log" => "text/plain",
        "md" | "markdown" => "text/markdown",
        "html" | "htm" => "text/html",
        "csv" => "text/csv",
        "json" => "application/json",
        "xml" => "text/xml",
        "pdf" => "application/pdf",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        _ => return None,
    };
    Some(mime)
}

fn mime_from_contents(bytes: &[u8]) -> Option<&'static str> {
    if bytes.starts_with(b"%PDF") {
        Some("application/pdf")
    } else if bytes.starts_with(&[0x89, b'P', b'N', b'G']) {
        Some("image/png")
    } else if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        Some("image/jpeg")
    } else if bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a") {
        Some("image/gif")
    } else if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        Some("image/webp")
    } else {
        None
    }
}

pub fn guess_mime_type(file_name: &str, bytes: &[u8]) -> String {
    mime_from_extension(file_name)
        .or_else(|| mime_from_contents(bytes))
        .unwrap_or(OCTET_STREAM)
        .to_string()
}

fn data_url(mime_type: &str, bytes: &[u8]) -> String {
    format!("data:{mime_type};base64,{}", STANDARD.encode(bytes))
}

fn image_messages(mime_type: &str, bytes: &[u8]) -> Vec<Value> {
    vec![
        json!({ "role": "system", "content": IMAGE_EXTRACTION_PROMPT }),
        json!({
            "role": "user",
            "content": [{ "type": "image_url", "image_url": { "url": data_url(mime_type, bytes) } }],
        }),
    ]
}

fn pdf_messages(file_name: &str, mime_type: &str, bytes: &[u8]) -> Vec<Value> {
    vec![
        json!({ "role": "system", "content": PDF_EXTRACTION_PROMPT }),
        json!({
            "role": "user",
            "content": [
                { "type": "file", "file": { "filename": file_name, "file_data": data_url(mime_type, bytes) } },
                { "type": "text", "text": "Extract all the text from this document." },
            ],
        }),
    ]
}

fn markup_messages(mime_type: &str, text: &str) -> Vec<Value> {
    vec![
        json!({ "role": "system", "content": HTML_EXTRACTION_PROMPT }),
        json!({
            "role": "user",
            "content": [
                { "type": "text", "text": text },
                { "type": "text", "text": text_extraction_instruction(mime_type) },
            ],
        }),
    ]
}

pub async fn extract_text_content(
    ai: &AiClient,
    file_name: &str,
    mime_type: &str,
    bytes: &[u8],
) -> ApiResult<String> {
    let mime_type = mime_essence(mime_type);
    let mime_type = mime_type.as_str();
    let text = match Extraction::for_mime(mime_type)? {
        Extraction::Image => {
            ai.complete(&ai.chat_model, image_messages(mime_type, bytes))
                .await?
        }
        Extraction::Pdf => {
            ai.complete(&ai.document_model, pdf_messages(file_name, mime_type, bytes))
                .await?
        }
        Extraction::PlainText => String::from_utf8_lossy(bytes).into_owned(),
        Extraction::Markup => {
            let decoded = String::from_utf8_lossy(bytes);
            ai.complete(&ai.document_model, markup_messages(mime_type, &decoded))
                .await?
        }
    };
    Ok(text)
}
