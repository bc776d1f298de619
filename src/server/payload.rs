//! Turns an HTTP body into a [`DiagnosisRequest`].
//!
//! Two encodings are accepted:
//!
//! * `multipart/form-data` with an `image` file part and optional
//!   `mime_type`, `stages` and `aggregation_weights` text fields.
//! * `application/json` with `image` as base64 or a `data:` URL.
//!
//! `stages` is either a JSON array or a comma-separated list.
//! `aggregation_weights` is a JSON object of stage id to weight.

use axum::Json;
use axum::extract::{FromRequest, Multipart, Request};
use axum::http::header::CONTENT_TYPE;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::engine::DiagnosisRequest;
use crate::error::DiagnosisError;
use crate::ingest::MimeType;

/// JSON form of an upload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiagnoseJson {
    pub image: String,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub stages: Option<Vec<String>>,
    #[serde(default)]
    pub aggregation_weights: Option<BTreeMap<String, f64>>,
}

pub async fn parse(request: Request) -> Result<DiagnosisRequest, DiagnosisError> {
    let content_type = request
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_ascii_lowercase();

    if content_type.starts_with("multipart/form-data") {
        let multipart = Multipart::from_request(request, &())
            .await
            .map_err(|e| DiagnosisError::Validation(e.body_text()))?;
        from_multipart(multipart).await
    } else if content_type.starts_with("application/json") {
        let Json(body) = Json::<DiagnoseJson>::from_request(request, &())
            .await
            .map_err(|e| DiagnosisError::Validation(e.body_text()))?;
        from_json(body)
    } else {
        Err(DiagnosisError::Validation(format!(
            "unsupported content type '{content_type}' (expected multipart/form-data or application/json)"
        )))
    }
}

fn bad_multipart(err: axum::extract::multipart::MultipartError) -> DiagnosisError {
    DiagnosisError::Validation(format!("malformed multipart body: {}", err.body_text()))
}

pub async fn from_multipart(mut multipart: Multipart) -> Result<DiagnosisRequest, DiagnosisError> {
    let mut request = DiagnosisRequest::default();
    let mut declared: Option<String> = None;
    let mut image: Option<(Vec<u8>, Option<String>, Option<String>)> = None;

    while let Some(field) = multipart.next_field().await.map_err(bad_multipart)? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "image" | "file" => {
                let part_type = field.content_type().map(str::to_string);
                let file_name = field.file_name().map(str::to_string);
                let bytes = field.bytes().await.map_err(bad_multipart)?;
                image = Some((bytes.to_vec(), part_type, file_name));
            }
            "mime_type" => {
                declared = Some(field.text().await.map_err(bad_multipart)?);
            }
            "stages" => {
                let text = field.text().await.map_err(bad_multipart)?;
                request.stages = Some(parse_stage_list(&text)?);
            }
            "aggregation_weights" => {
                let text = field.text().await.map_err(bad_multipart)?;
                request.aggregation_weights = Some(parse_weights(&text)?);
            }
            other => tracing::debug!(field = other, "ignoring unknown multipart field"),
        }
    }

    let (bytes, part_type, file_name) = image.ok_or_else(|| {
        DiagnosisError::Validation("missing 'image' file part".to_string())
    })?;
    request.image = bytes;
    request.mime_type = declared
        .filter(|m| !m.trim().is_empty())
        .or_else(|| part_type.clone().filter(|t| MimeType::parse(t).is_some()))
        .or_else(|| {
            file_name
                .as_deref()
                .and_then(|n| MimeType::from_path(Path::new(n)))
                .map(|m| m.as_str().to_string())
        })
        .or(part_type)
        .unwrap_or_default();
    Ok(request)
}

pub fn from_json(body: DiagnoseJson) -> Result<DiagnosisRequest, DiagnosisError> {
    let (url_mime, encoded) = split_data_url(&body.image)?;
    let image = if encoded.is_empty() {
        Vec::new()
    } else {
        STANDARD
            .decode(encoded)
            .map_err(|e| DiagnosisError::Validation(format!("image is not valid base64: {e}")))?
    };
    Ok(DiagnosisRequest {
        image,
        mime_type: body.mime_type.or(url_mime).unwrap_or_default(),
        stages: body.stages,
        aggregation_weights: body.aggregation_weights,
    })
}

/// `data:image/png;base64,AAAA` → `(Some("image/png"), "AAAA")`. Anything
/// not starting with `data:` is taken as bare base64.
fn split_data_url(image: &str) -> Result<(Option<String>, &str), DiagnosisError> {
    let image = image.trim();
    let Some(rest) = image.strip_prefix("data:") else {
        return Ok((None, image));
    };
    let (meta, encoded) = rest
        .split_once(',')
        .ok_or_else(|| DiagnosisError::Validation("data URL has no ',' separator".to_string()))?;
    let mime = meta.strip_suffix(";base64").ok_or_else(|| {
        DiagnosisError::Validation("data URL must be base64-encoded".to_string())
    })?;
    let mime = (!mime.is_empty()).then(|| mime.to_string());
    Ok((mime, encoded))
}

pub fn parse_stage_list(raw: &str) -> Result<Vec<String>, DiagnosisError> {
    let raw = raw.trim();
    if raw.starts_with('[') {
        return serde_json::from_str(raw)
            .map_err(|e| DiagnosisError::Validation(format!("stages is not a JSON array of ids: {e}")));
    }
    Ok(raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect())
}

pub fn parse_weights(raw: &str) -> Result<BTreeMap<String, f64>, DiagnosisError> {
    serde_json::from_str(raw.trim()).map_err(|e| {
        DiagnosisError::Validation(format!("aggregation_weights is not a JSON object of numbers: {e}"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_list_accepts_json_and_commas() {
        assert_eq!(parse_stage_list(r#"["a", "b"]"#).unwrap(), vec!["a", "b"]);
        assert_eq!(parse_stage_list(" a, b ,,c ").unwrap(), vec!["a", "b", "c"]);
        assert!(parse_stage_list("").unwrap().is_empty());
        assert!(parse_stage_list("[1, 2]").is_err());
    }

    #[test]
    fn weights_must_be_an_object_of_numbers() {
        let weights = parse_weights(r#"{"a": 2, "b": 0.5}"#).unwrap();
        assert_eq!(weights["a"], 2.0);
        assert_eq!(weights["b"], 0.5);
        assert!(parse_weights(r#"{"a": "heavy"}"#).is_err());
        assert!(parse_weights("[1]").is_err());
    }

    #[test]
    fn json_body_with_bare_base64() {
        let body = DiagnoseJson {
            image: STANDARD.encode([0x89, b'P', b'N', b'G']),
            mime_type: Some("image/png".into()),
            ..Default::default()
        };
        let request = from_json(body).unwrap();
        assert_eq!(request.image, vec![0x89, b'P', b'N', b'G']);
        assert_eq!(request.mime_type, "image/png");
        assert!(request.stages.is_none());
    }

    #[test]
    fn data_url_supplies_mime_type() {
        let body = DiagnoseJson {
            image: format!("data:image/jpeg;base64,{}", STANDARD.encode([0xFF, 0xD8, 0xFF])),
            ..Default::default()
        };
        let request = from_json(body).unwrap();
        assert_eq!(request.mime_type, "image/jpeg");
        assert_eq!(request.image, vec![0xFF, 0xD8, 0xFF]);
    }

    #[test]
    fn explicit_mime_type_beats_data_url() {
        let body = DiagnoseJson {
            image: "data:image/jpeg;base64,AAAA".into(),
            mime_type: Some("image/png".into()),
            ..Default::default()
        };
        assert_eq!(from_json(body).unwrap().mime_type, "image/png");
    }

    #[test]
    fn empty_image_passes_through_for_ingest_to_reject() {
        let request = from_json(DiagnoseJson::default()).unwrap();
        assert!(request.image.is_empty());
    }

    #[test]
    fn malformed_images_are_validation_errors() {
        let bad_base64 = DiagnoseJson {
            image: "not base64!".into(),
            ..Default::default()
        };
        assert!(matches!(from_json(bad_base64), Err(DiagnosisError::Validation(_))));

        let not_base64_url = DiagnoseJson {
            image: "data:image/png,rawbytes".into(),
            ..Default::default()
        };
        assert!(matches!(from_json(not_base64_url), Err(DiagnosisError::Validation(_))));
    }
}
