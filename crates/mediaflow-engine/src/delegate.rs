//! Payload schemas for delegate units
//!
//! Every unit the engine submits to the task runner has exactly one request
//! type here. Requests are validated before submission so that a malformed
//! node fails locally instead of burning retries on the worker.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::NodeError;
use crate::types::Measure;

/// Unit name for image cropping
pub const CROP_UNIT: &str = "crop";
/// Unit name for video frame extraction
pub const EXTRACT_FRAME_UNIT: &str = "extract-frame";
/// Unit name for LLM generation
pub const LLM_UNIT: &str = "llm-generate";

/// Crop an image; all four values are percentages of the source size
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CropRequest {
    pub image_url: String,
    pub x: Measure,
    pub y: Measure,
    pub width: Measure,
    pub height: Measure,
}

/// Extract one frame from a video
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractFrameRequest {
    pub video_url: String,
    /// Seconds, or `"N%"` of the duration
    pub timestamp: Measure,
}

/// Generate text, optionally grounded on images
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LlmRequest {
    pub system_prompt: String,
    pub user_message: String,
    pub image_urls: Vec<String>,
    pub model: String,
}

/// A request for one of the delegate units
#[derive(Debug, Clone, PartialEq)]
pub enum DelegateRequest {
    Crop(CropRequest),
    ExtractFrame(ExtractFrameRequest),
    Llm(LlmRequest),
}

impl DelegateRequest {
    /// Unit name this request is submitted under
    pub fn unit(&self) -> &'static str {
        match self {
            Self::Crop(_) => CROP_UNIT,
            Self::ExtractFrame(_) => EXTRACT_FRAME_UNIT,
            Self::Llm(_) => LLM_UNIT,
        }
    }

    /// Check the request against its unit's schema
    pub fn validate(&self) -> Result<(), NodeError> {
        match self {
            Self::Crop(req) => {
                require_url(CROP_UNIT, "imageUrl", &req.image_url)?;
                let axes = [("x", &req.x, "width", &req.width), ("y", &req.y, "height", &req.height)];
                for (offset_field, offset, size_field, size) in axes {
                    let start = percentage(CROP_UNIT, offset_field, offset)?;
                    let extent = percentage(CROP_UNIT, size_field, size)?;
                    if extent <= 0.0 {
                        return Err(invalid(CROP_UNIT, format!("{} must be greater than 0%", size_field)));
                    }
                    if start + extent > 100.0 + 1e-9 {
                        return Err(invalid(
                            CROP_UNIT,
                            format!("{} + {} exceeds 100% of the image", offset_field, size_field),
                        ));
                    }
                }
                Ok(())
            }
            Self::ExtractFrame(req) => {
                require_url(EXTRACT_FRAME_UNIT, "videoUrl", &req.video_url)?;
                if req.timestamp.is_percent_literal() {
                    percentage(EXTRACT_FRAME_UNIT, "timestamp", &req.timestamp)?;
                } else {
                    match req.timestamp.value() {
                        Some(seconds) if seconds >= 0.0 && seconds.is_finite() => {}
                        _ => {
                            return Err(invalid(
                                EXTRACT_FRAME_UNIT,
                                format!("timestamp '{}' is not a percentage or a number of seconds", req.timestamp),
                            ))
                        }
                    }
                }
                Ok(())
            }
            Self::Llm(req) => {
                if req.user_message.trim().is_empty() {
                    return Err(invalid(LLM_UNIT, "userMessage is empty"));
                }
                if req.model.trim().is_empty() {
                    return Err(invalid(LLM_UNIT, "model is empty"));
                }
                Ok(())
            }
        }
    }

    /// Validate and encode the wire payload
    pub fn to_payload(&self) -> Result<Value, NodeError> {
        self.validate()?;
        let encoded = match self {
            Self::Crop(req) => serde_json::to_value(req),
            Self::ExtractFrame(req) => serde_json::to_value(req),
            Self::Llm(req) => serde_json::to_value(req),
        };
        encoded.map_err(|e| invalid(self.unit(), e.to_string()))
    }
}

fn invalid(unit: &str, reason: impl Into<String>) -> NodeError {
    NodeError::InvalidPayload {
        unit: unit.to_string(),
        reason: reason.into(),
    }
}

fn require_url(unit: &str, field: &str, url: &str) -> Result<(), NodeError> {
    if url.trim().is_empty() {
        return Err(invalid(unit, format!("{} is missing", field)));
    }
    Ok(())
}

fn percentage(unit: &str, field: &str, measure: &Measure) -> Result<f64, NodeError> {
    match measure.value() {
        Some(v) if (0.0..=100.0).contains(&v) => Ok(v),
        Some(v) => Err(invalid(unit, format!("{} must be within 0-100%, got {}", field, v))),
        None => Err(invalid(unit, format!("{} '{}' is not a percentage", field, measure))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn crop(url: &str, x: Measure, width: Measure) -> DelegateRequest {
        DelegateRequest::Crop(CropRequest {
            image_url: url.to_string(),
            x,
            y: Measure::text("0%"),
            width,
            height: Measure::text("100%"),
        })
    }

    #[test]
    fn test_crop_payload_keeps_numbers() {
        let req = DelegateRequest::Crop(CropRequest {
            image_url: "http://x/i.jpg".into(),
            x: Measure::int(10),
            y: Measure::int(10),
            width: Measure::int(80),
            height: Measure::int(80),
        });
        assert_eq!(req.unit(), "crop");
        assert_eq!(
            req.to_payload().unwrap(),
            json!({"imageUrl": "http://x/i.jpg", "x": 10, "y": 10, "width": 80, "height": 80})
        );
    }

    #[test]
    fn test_crop_validation() {
        assert!(crop("http://x/i.jpg", Measure::text("10%"), Measure::text("80")).validate().is_ok());
        assert!(crop("", Measure::int(0), Measure::int(100)).validate().is_err());
        assert!(crop("http://x/i.jpg", Measure::int(120), Measure::int(50)).validate().is_err());
        assert!(crop("http://x/i.jpg", Measure::int(0), Measure::int(0)).validate().is_err());
        assert!(crop("http://x/i.jpg", Measure::text("left"), Measure::int(50)).validate().is_err());
    }

    #[test]
    fn test_crop_must_stay_inside_image() {
        assert!(crop("http://x/i.jpg", Measure::int(20), Measure::int(80)).validate().is_ok());
        assert!(crop("http://x/i.jpg", Measure::text("33.3%"), Measure::text("66.7%")).validate().is_ok());

        match crop("http://x/i.jpg", Measure::int(30), Measure::int(80)).validate() {
            Err(NodeError::InvalidPayload { unit, reason }) => {
                assert_eq!(unit, "crop");
                assert_eq!(reason, "x + width exceeds 100% of the image");
            }
            other => panic!("Expected InvalidPayload, got {:?}", other),
        }

        let tall = DelegateRequest::Crop(CropRequest {
            image_url: "http://x/i.jpg".into(),
            x: Measure::int(0),
            y: Measure::text("60%"),
            width: Measure::int(50),
            height: Measure::text("50%"),
        });
        assert!(tall.to_payload().is_err());
    }

    #[test]
    fn test_timestamp_validation() {
        let extract = |ts: Measure| {
            DelegateRequest::ExtractFrame(ExtractFrameRequest {
                video_url: "http://x/v.mp4".into(),
                timestamp: ts,
            })
        };
        assert!(extract(Measure::text("50%")).validate().is_ok());
        assert!(extract(Measure::text("0")).validate().is_ok());
        assert!(extract(Measure::int(12)).validate().is_ok());
        assert!(extract(Measure::text("150%")).validate().is_err());
        assert!(extract(Measure::int(-3)).validate().is_err());
        assert!(extract(Measure::text("soon")).validate().is_err());
    }

    #[test]
    fn test_llm_validation() {
        let req = DelegateRequest::Llm(LlmRequest {
            system_prompt: String::new(),
            user_message: "  ".into(),
            image_urls: vec![],
            model: "gemini-2.0-flash".into(),
        });
        match req.validate() {
            Err(NodeError::InvalidPayload { unit, .. }) => assert_eq!(unit, "llm-generate"),
            other => panic!("Expected InvalidPayload, got {:?}", other),
        }
    }
}
