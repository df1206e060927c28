// Orchestration client: one API call resolved into a typed result

use std::sync::Arc;

use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use super::auth::{AuthProvider, MANAGED_AUTH_SCHEME};
use super::config::{ApiSettings, AuthMethod, RequestTemplate};
use super::errors::OrchestrationError;
use super::models::{
    AssetDescriptor, DownloadMode, LocalProcessingDescriptor, OrchestrationResult, PickerOption,
    ProcessingType,
};
use super::traits::ProgressEmitter;
use super::utils::{audio_companion_filename, response_error_detail};

pub struct OrchestrationClient {
    http: reqwest::Client,
    settings: ApiSettings,
    template: RequestTemplate,
    auth: Arc<dyn AuthProvider>,
    progress: ProgressEmitter,
}

impl OrchestrationClient {
    pub fn new(
        http: reqwest::Client,
        settings: ApiSettings,
        template: RequestTemplate,
        auth: Arc<dyn AuthProvider>,
    ) -> Self {
        Self {
            http,
            settings,
            template,
            auth,
            progress: ProgressEmitter::noop(),
        }
    }

    pub fn with_progress(mut self, progress: ProgressEmitter) -> Self {
        self.progress = progress;
        self
    }

    fn endpoint(&self) -> Result<Url, OrchestrationError> {
        match &self.settings.auth_method {
            AuthMethod::Managed => {
                self.settings.auth_server.join("ios-request").map_err(|_| {
                    OrchestrationError::InvalidApiUrl(self.settings.auth_server.to_string())
                })
            }
            _ => self
                .settings
                .custom_api_url
                .clone()
                .ok_or_else(|| OrchestrationError::InvalidApiUrl(String::new())),
        }
    }

    fn request_body(&self, input_url: &str, mode: Option<DownloadMode>) -> Value {
        let mut body = self.template.to_body();
        body.insert("url".to_string(), Value::String(input_url.to_string()));
        if self.settings.auth_method == AuthMethod::Managed {
            body.insert(
                "api-url".to_string(),
                Value::String(self.settings.upstream_api_url.clone()),
            );
        }
        if let Some(mode) = mode {
            body.insert(
                "downloadMode".to_string(),
                Value::String(mode.as_str().to_string()),
            );
        }
        Value::Object(body)
    }

    async fn authorization(&self) -> Result<Option<String>, OrchestrationError> {
        match &self.settings.auth_method {
            AuthMethod::Managed => {
                self.progress.status("Authenticating");
                let credential = self.auth.ensure_valid(&self.progress).await?;
                Ok(Some(format!("{} {}", MANAGED_AUTH_SCHEME, credential)))
            }
            AuthMethod::ApiKey { scheme, key } => Ok(Some(format!("{} {}", scheme, key))),
            AuthMethod::None => Ok(None),
        }
    }

    /// Ask the API how `input_url` can be retrieved
    pub async fn fetch_result(
        &self,
        input_url: &str,
        mode: Option<DownloadMode>,
        cancel: &CancellationToken,
    ) -> Result<OrchestrationResult, OrchestrationError> {
        check_cancelled(cancel)?;
        let endpoint = self.endpoint()?;
        let body = self.request_body(input_url, mode);

        check_cancelled(cancel)?;
        let authorization = self.authorization().await?;

        check_cancelled(cancel)?;
        self.progress.status("Sending request");
        info!("[Orchestrator] POST {} for {}", endpoint, input_url);

        let mut request = self
            .http
            .post(endpoint)
            .header(ACCEPT, "application/json")
            .header(CONTENT_TYPE, "application/json")
            .json(&body);
        if let Some(value) = authorization {
            request = request.header(AUTHORIZATION, value);
        }

        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;

        check_cancelled(cancel)?;
        if status == StatusCode::NOT_FOUND {
            warn!("[Orchestrator] API endpoint returned 404");
            return Err(OrchestrationError::ServerUnavailable);
        }
        if status != StatusCode::OK {
            let detail = response_error_detail(&text);
            warn!("[Orchestrator] Request failed with {}: {}", status, detail);
            return Err(OrchestrationError::RequestFailed {
                status: status.as_u16(),
                detail: if detail.is_empty() {
                    status.canonical_reason().unwrap_or("unknown error").to_string()
                } else {
                    detail
                },
            });
        }

        let value: Value = serde_json::from_str(&text)
            .map_err(|e| OrchestrationError::Parsing(format!("invalid JSON: {}", e)))?;
        let result = parse_response(&value)?;
        debug!("[Orchestrator] Resolved {} -> {:?}", input_url, result_kind(&result));
        Ok(result)
    }
}

fn check_cancelled(cancel: &CancellationToken) -> Result<(), OrchestrationError> {
    if cancel.is_cancelled() {
        Err(OrchestrationError::Cancelled)
    } else {
        Ok(())
    }
}

fn result_kind(result: &OrchestrationResult) -> &'static str {
    match result {
        OrchestrationResult::Success { .. } => "success",
        OrchestrationResult::PickerOptions(_) => "picker",
        OrchestrationResult::LocalProcessing(_) => "local-processing",
    }
}

fn str_field<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value.get(key).and_then(Value::as_str)
}

fn required_str<'a>(value: &'a Value, key: &str) -> Result<&'a str, OrchestrationError> {
    str_field(value, key)
        .ok_or_else(|| OrchestrationError::Parsing(format!("missing `{}`", key)))
}

fn is_fetchable(url: &str) -> bool {
    Url::parse(url).is_ok()
}

/// Turn a decoded API response into a typed result
pub fn parse_response(value: &Value) -> Result<OrchestrationResult, OrchestrationError> {
    let status = required_str(value, "status")?;

    match status {
        "redirect" | "stream" | "tunnel" => Ok(OrchestrationResult::Success {
            url: required_str(value, "url")?.to_string(),
            filename: str_field(value, "filename").map(str::to_string),
        }),
        "picker" => Ok(OrchestrationResult::PickerOptions(parse_picker(value)?)),
        "local-processing" => Ok(OrchestrationResult::LocalProcessing(
            parse_local_processing(value)?,
        )),
        "error" => {
            let code = value
                .pointer("/error/code")
                .and_then(Value::as_str)
                .or_else(|| str_field(value, "error"))
                .unwrap_or("unknown error");
            Err(OrchestrationError::Api(code.to_string()))
        }
        other => Err(OrchestrationError::UnexpectedStatus(other.to_string())),
    }
}

fn parse_picker(value: &Value) -> Result<Vec<PickerOption>, OrchestrationError> {
    let entries = value
        .get("picker")
        .and_then(Value::as_array)
        .ok_or_else(|| OrchestrationError::Parsing("missing `picker`".to_string()))?;

    let mut options: Vec<PickerOption> = entries
        .iter()
        .filter_map(|entry| {
            let url = str_field(entry, "url").filter(|u| is_fetchable(u))?;
            Some(PickerOption {
                label: str_field(entry, "type").unwrap_or("media").to_string(),
                url: url.to_string(),
            })
        })
        .collect();

    if let Some(audio) = str_field(value, "audio").filter(|u| is_fetchable(u)) {
        options.push(PickerOption {
            label: "audio".to_string(),
            url: audio.to_string(),
        });
    }

    Ok(options)
}

fn parse_local_processing(value: &Value) -> Result<LocalProcessingDescriptor, OrchestrationError> {
    let raw_type = required_str(value, "type")?;
    let processing_type: ProcessingType = raw_type
        .parse()
        .map_err(|_| OrchestrationError::UnsupportedType(raw_type.to_string()))?;
    let service = required_str(value, "service")?.to_string();

    let tunnel: Vec<String> = value
        .get("tunnel")
        .and_then(Value::as_array)
        .ok_or_else(|| OrchestrationError::Parsing("missing `tunnel`".to_string()))?
        .iter()
        .filter_map(Value::as_str)
        .map(str::to_string)
        .collect();
    if tunnel.is_empty() {
        return Err(OrchestrationError::Parsing("`tunnel` is empty".to_string()));
    }

    let output_value = value
        .get("output")
        .ok_or_else(|| OrchestrationError::Parsing("missing `output`".to_string()))?;
    let output = AssetDescriptor {
        url: str_field(output_value, "url").unwrap_or(tunnel[0].as_str()).to_string(),
        filename: required_str(output_value, "filename")
            .map_err(|_| OrchestrationError::Parsing("missing `output.filename`".to_string()))?
            .to_string(),
        size: output_value.get("size").and_then(Value::as_u64),
        format: str_field(output_value, "format").map(str::to_string),
    };

    let audio = match value.get("audio").filter(|a| a.is_object()) {
        Some(audio_value) => {
            let url = str_field(audio_value, "url").or_else(|| tunnel.get(1).map(String::as_str));
            match url {
                Some(url) => Some(AssetDescriptor {
                    url: url.to_string(),
                    filename: str_field(audio_value, "filename")
                        .map(str::to_string)
                        .unwrap_or_else(|| audio_companion_filename(&output.filename)),
                    size: audio_value.get("size").and_then(Value::as_u64),
                    format: str_field(audio_value, "format").map(str::to_string),
                }),
                // Only merge fetches a second asset; elsewhere the object is encoding metadata
                None if processing_type == ProcessingType::Merge => {
                    return Err(OrchestrationError::Parsing(
                        "audio asset has no URL".to_string(),
                    ));
                }
                None => None,
            }
        }
        None if processing_type == ProcessingType::Merge && tunnel.len() > 1 => {
            Some(AssetDescriptor {
                url: tunnel[1].clone(),
                filename: audio_companion_filename(&output.filename),
                size: None,
                format: None,
            })
        }
        None => None,
    };

    Ok(LocalProcessingDescriptor {
        processing_type,
        service,
        tunnel,
        output,
        audio,
        is_hls: value.get("isHLS").and_then(Value::as_bool).unwrap_or(false),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_tunnel_is_success() {
        let result = parse_response(&json!({"status":"tunnel","url":"https://x/y.mp4"})).unwrap();
        assert_eq!(
            result,
            OrchestrationResult::Success {
                url: "https://x/y.mp4".to_string(),
                filename: None
            }
        );

        let redirect = json!({"status": "redirect", "url": "https://x", "filename": "a.mp4"});
        let result = parse_response(&redirect).unwrap();
        assert!(matches!(
            result,
            OrchestrationResult::Success { filename: Some(f), .. } if f == "a.mp4"
        ));
    }

    #[test]
    fn test_picker_appends_audio() {
        let result = parse_response(&json!({
            "status": "picker",
            "picker": [{"type":"video","url":"https://a"}, {"type":"photo"}, {"url":"::bad"}],
            "audio": "https://b"
        }))
        .unwrap();
        let OrchestrationResult::PickerOptions(options) = result else {
            panic!("expected picker");
        };
        assert_eq!(options.len(), 2);
        assert_eq!(options[0].label, "video");
        assert_eq!(options[1].label, "audio");
        assert_eq!(options[1].url, "https://b");
    }

    #[test]
    fn test_merge_synthesizes_audio() {
        let result = parse_response(&json!({
            "status": "local-processing",
            "type": "merge",
            "service": "s",
            "tunnel": ["https://v", "https://a"],
            "output": {"filename": "out.mp4"}
        }))
        .unwrap();
        let OrchestrationResult::LocalProcessing(descriptor) = result else {
            panic!("expected local processing");
        };
        assert_eq!(descriptor.processing_type, ProcessingType::Merge);
        assert_eq!(descriptor.output.url, "https://v");
        let audio = descriptor.audio.unwrap();
        assert_eq!(audio.filename, "out_audio.m4a");
        assert_eq!(audio.url, "https://a");
        assert!(!descriptor.is_hls);
    }

    #[test]
    fn test_mute_does_not_synthesize_audio() {
        let result = parse_response(&json!({
            "status": "local-processing",
            "type": "mute",
            "service": "s",
            "tunnel": ["https://v", "https://a"],
            "output": {"filename": "out.mp4", "size": 42},
            "isHLS": true
        }))
        .unwrap();
        let OrchestrationResult::LocalProcessing(descriptor) = result else {
            panic!("expected local processing");
        };
        assert!(descriptor.audio.is_none());
        assert_eq!(descriptor.output.size, Some(42));
        assert!(descriptor.is_hls);
    }

    #[test]
    fn test_local_processing_validation() {
        let unknown = json!({
            "status": "local-processing",
            "type": "unknown",
            "service": "s",
            "tunnel": ["https://v"],
            "output": {"filename": "out.mp4"}
        });
        assert!(matches!(
            parse_response(&unknown),
            Err(OrchestrationError::UnsupportedType(t)) if t == "unknown"
        ));

        let empty_tunnel = json!({
            "status": "local-processing",
            "type": "remux",
            "service": "s",
            "tunnel": [],
            "output": {"filename": "out.mp4"}
        });
        assert!(matches!(
            parse_response(&empty_tunnel),
            Err(OrchestrationError::Parsing(_))
        ));

        let no_filename = json!({
            "status": "local-processing",
            "type": "remux",
            "service": "s",
            "tunnel": ["https://v"],
            "output": {}
        });
        assert!(matches!(
            parse_response(&no_filename),
            Err(OrchestrationError::Parsing(_))
        ));
    }

    #[test]
    fn test_audio_metadata_without_url() {
        let audio_only = json!({
            "status": "local-processing",
            "type": "audio",
            "service": "youtube",
            "tunnel": ["https://t/1"],
            "output": {"filename": "song.mp3"},
            "audio": {"copy": false, "format": "mp3", "bitrate": "128"}
        });
        let OrchestrationResult::LocalProcessing(descriptor) = parse_response(&audio_only).unwrap()
        else {
            panic!("expected local processing");
        };
        assert_eq!(descriptor.processing_type, ProcessingType::Audio);
        assert_eq!(descriptor.output.url, "https://t/1");
        assert!(descriptor.audio.is_none());

        let merge = json!({
            "status": "local-processing",
            "type": "merge",
            "service": "youtube",
            "tunnel": ["https://t/1"],
            "output": {"filename": "out.mp4"},
            "audio": {"format": "m4a"}
        });
        assert!(matches!(
            parse_response(&merge),
            Err(OrchestrationError::Parsing(msg)) if msg.contains("audio asset has no URL")
        ));
    }

    #[test]
    fn test_error_and_unknown_status() {
        assert!(matches!(
            parse_response(&json!({"status":"error","error":{"code":"error.api.fetch.fail"}})),
            Err(OrchestrationError::Api(code)) if code == "error.api.fetch.fail"
        ));
        assert!(matches!(
            parse_response(&json!({"status":"rate-limit"})),
            Err(OrchestrationError::UnexpectedStatus(s)) if s == "rate-limit"
        ));
        assert!(matches!(
            parse_response(&json!({"url":"https://x"})),
            Err(OrchestrationError::Parsing(_))
        ));
        assert!(matches!(
            parse_response(&json!({"status":"tunnel"})),
            Err(OrchestrationError::Parsing(_))
        ));
    }
}
