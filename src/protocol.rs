//! Messages exchanged between the scanner and the inference service.
//!
//! Requests travel scanner → engine, responses engine → scanner. A response is
//! only ever sent for a flagged image; silence means the image is safe or could
//! not be analyzed.

use serde::{Deserialize, Serialize};

/// Analysis request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action")]
pub enum ImageRequest {
    #[serde(rename = "img_find")]
    ImgFind { image_src: String },
}

impl ImageRequest {
    pub fn img_find(src: impl Into<String>) -> Self {
        ImageRequest::ImgFind {
            image_src: src.into(),
        }
    }

    pub fn image_src(&self) -> &str {
        match self {
            ImageRequest::ImgFind { image_src } => image_src,
        }
    }
}

/// Sent back only when the image is flagged
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageResponse {
    pub src: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_wire_shape() {
        let req = ImageRequest::img_find("http://x/a.png");
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(
            json,
            serde_json::json!({ "action": "img_find", "image_src": "http://x/a.png" })
        );
    }

    #[test]
    fn unknown_action_is_rejected() {
        let parsed: Result<ImageRequest, _> =
            serde_json::from_str(r#"{"action":"img_forget","image_src":"x"}"#);
        assert!(parsed.is_err());
    }

    #[test]
    fn response_wire_shape() {
        let resp: ImageResponse = serde_json::from_str(r#"{"src":"http://x/a.png"}"#).unwrap();
        assert_eq!(resp.src, "http://x/a.png");
    }
}
