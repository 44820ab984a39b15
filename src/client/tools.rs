//! Browser tools and the processing endpoints behind them

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::tier::{ActionType, PlanLimits};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Tool {
    AudioEnhancer,
    Compressor,
    Converter,
    GifConverter,
    MetadataEditor,
    MusicIdentifier,
    Transcriber,
    SubtitleTranslator,
}

const AUDIO: &[&str] = &["mp3", "wav", "flac", "m4a", "aac", "ogg", "opus", "wma"];
const VIDEO: &[&str] = &["mp4", "mov", "avi", "mkv", "webm", "flv", "wmv", "m4v"];
const SUBTITLES: &[&str] = &["srt", "vtt", "ass"];

impl Tool {
    pub const ALL: [Tool; 8] = [
        Tool::AudioEnhancer,
        Tool::Compressor,
        Tool::Converter,
        Tool::GifConverter,
        Tool::MetadataEditor,
        Tool::MusicIdentifier,
        Tool::Transcriber,
        Tool::SubtitleTranslator,
    ];

    pub fn slug(&self) -> &'static str {
        match self {
            Tool::AudioEnhancer => "audio-enhancer",
            Tool::Compressor => "compressor",
            Tool::Converter => "converter",
            Tool::GifConverter => "gif-converter",
            Tool::MetadataEditor => "metadata-editor",
            Tool::MusicIdentifier => "music-identifier",
            Tool::Transcriber => "transcriber",
            Tool::SubtitleTranslator => "subtitle-translator",
        }
    }

    pub fn action_type(&self) -> ActionType {
        match self {
            Tool::AudioEnhancer => ActionType::Enhancement,
            Tool::Compressor => ActionType::Compression,
            Tool::Converter => ActionType::Conversion,
            Tool::GifConverter => ActionType::GifCreation,
            Tool::MetadataEditor => ActionType::MetadataEdit,
            Tool::MusicIdentifier => ActionType::Identification,
            Tool::Transcriber => ActionType::Transcription,
            Tool::SubtitleTranslator => ActionType::Translation,
        }
    }

    pub fn endpoint(&self) -> &'static str {
        match self {
            Tool::AudioEnhancer => "/api/enhance-audio",
            Tool::Compressor => "/api/compress-video",
            Tool::Converter => "/api/convert",
            Tool::GifConverter => "/api/video-to-gif",
            Tool::MetadataEditor => "/api/update-metadata",
            Tool::MusicIdentifier => "/api/identify-music",
            Tool::Transcriber => "/api/transcribe",
            Tool::SubtitleTranslator => "/api/translate-subtitle",
        }
    }

    pub fn accepted_extensions(&self) -> Vec<&'static str> {
        match self {
            Tool::AudioEnhancer | Tool::MusicIdentifier => AUDIO.to_vec(),
            Tool::Compressor | Tool::GifConverter => VIDEO.to_vec(),
            Tool::Converter | Tool::MetadataEditor | Tool::Transcriber => {
                AUDIO.iter().chain(VIDEO).copied().collect()
            }
            Tool::SubtitleTranslator => SUBTITLES.to_vec(),
        }
    }

    /// Tools that answer with JSON instead of a file to download
    pub fn returns_json(&self) -> bool {
        matches!(self, Tool::MusicIdentifier | Tool::Transcriber)
    }
}

impl FromStr for Tool {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace('_', "-");
        Tool::ALL
            .into_iter()
            .find(|tool| tool.slug() == normalized)
            .ok_or_else(|| format!("Unknown tool: {}", s))
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Please select a file first")]
    NoFile,
    #[error("File is empty")]
    EmptyFile,
    #[error("Unsupported file type '.{extension}' for {tool}")]
    UnsupportedType { tool: &'static str, extension: String },
    #[error("File is {size_mb} MB, your plan allows up to {limit_mb} MB")]
    TooLarge { size_mb: u64, limit_mb: u32 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectedFile {
    pub name: String,
    pub bytes: Vec<u8>,
}

impl SelectedFile {
    pub fn new(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            bytes,
        }
    }

    pub async fn read(path: &Path) -> std::io::Result<Self> {
        let bytes = tokio::fs::read(path).await?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "upload".to_string());
        Ok(Self { name, bytes })
    }

    pub fn extension(&self) -> Option<String> {
        Path::new(&self.name)
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
    }

    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }

    /// Local checks before any upload. Without `limits` the plan is not
    /// known yet, and the size ceiling is left to the server.
    pub fn validate(&self, tool: Tool, limits: Option<&PlanLimits>) -> Result<(), ValidationError> {
        if self.bytes.is_empty() {
            return Err(ValidationError::EmptyFile);
        }

        let extension = self.extension().unwrap_or_default();
        if !tool.accepted_extensions().contains(&extension.as_str()) {
            return Err(ValidationError::UnsupportedType {
                tool: tool.slug(),
                extension,
            });
        }

        if let Some(limits) = limits {
            if !limits.allows_file_size(self.size()) {
                return Err(ValidationError::TooLarge {
                    size_mb: self.size().div_ceil(1024 * 1024),
                    limit_mb: limits.max_file_size_mb.bounded().unwrap_or(u32::MAX),
                });
            }
        }

        Ok(())
    }
}

/// User-chosen processing options, sent as the `options` JSON part
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProcessedOutput {
    Download { file_name: String, bytes: Vec<u8> },
    Json(serde_json::Value),
}

impl ProcessedOutput {
    /// Write a download into `dir`; JSON results are written as `<stem>.json`
    pub async fn save_to(&self, dir: &Path, stem: &str) -> std::io::Result<PathBuf> {
        tokio::fs::create_dir_all(dir).await?;
        match self {
            ProcessedOutput::Download { file_name, bytes } => {
                let path = dir.join(file_name);
                tokio::fs::write(&path, bytes).await?;
                Ok(path)
            }
            ProcessedOutput::Json(value) => {
                let path = dir.join(format!("{}.json", stem));
                let content = serde_json::to_string_pretty(value).map_err(std::io::Error::other)?;
                tokio::fs::write(&path, content).await?;
                Ok(path)
            }
        }
    }
}

#[derive(Error, Debug)]
pub enum ProcessingError {
    #[error("Processing failed ({status}): {message}")]
    Status { status: u16, message: String },
    #[error("Request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("Invalid server URL: {0}")]
    Url(#[from] url::ParseError),
    #[error("Invalid response: {0}")]
    Decode(#[from] serde_json::Error),
}

/// The external call that does the actual media work
#[async_trait]
pub trait ToolProcessor: Send + Sync {
    async fn process(
        &self,
        tool: Tool,
        file: &SelectedFile,
        options: &ToolOptions,
    ) -> Result<ProcessedOutput, ProcessingError>;
}

pub struct HttpProcessor {
    base_url: Url,
    client: reqwest::Client,
}

impl HttpProcessor {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ProcessingError> {
        Ok(Self {
            base_url: Url::parse(base_url)?,
            client: reqwest::Client::builder().timeout(timeout).build()?,
        })
    }
}

fn output_file_name(tool: Tool, input: &SelectedFile, options: &ToolOptions) -> String {
    let stem = Path::new(&input.name)
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "output".to_string());
    let extension = match tool {
        Tool::GifConverter => "gif".to_string(),
        Tool::Converter => options
            .format
            .clone()
            .or_else(|| input.extension())
            .unwrap_or_else(|| "bin".to_string()),
        _ => input.extension().unwrap_or_else(|| "bin".to_string()),
    };
    format!("{}-{}.{}", stem, tool.slug(), extension)
}

fn content_disposition_name(headers: &reqwest::header::HeaderMap) -> Option<String> {
    let value = headers
        .get(reqwest::header::CONTENT_DISPOSITION)?
        .to_str()
        .ok()?;
    value.split(';').find_map(|part| {
        part.trim()
            .strip_prefix("filename=")
            .map(|name| name.trim_matches('"').to_string())
            .filter(|name| !name.is_empty() && !name.contains('/') && !name.contains('\\'))
    })
}

#[async_trait]
impl ToolProcessor for HttpProcessor {
    async fn process(
        &self,
        tool: Tool,
        file: &SelectedFile,
        options: &ToolOptions,
    ) -> Result<ProcessedOutput, ProcessingError> {
        let url = self.base_url.join(tool.endpoint())?;
        let form = reqwest::multipart::Form::new()
            .part(
                "file",
                reqwest::multipart::Part::bytes(file.bytes.clone()).file_name(file.name.clone()),
            )
            .text("options", serde_json::to_string(options)?);

        tracing::info!(tool = tool.slug(), file = %file.name, "Sending file for processing");
        let response = self.client.post(url).multipart(form).send().await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<crate::rpc::ErrorBody>(&text)
                .map(|body| body.error)
                .unwrap_or_else(|_| if text.is_empty() { status.to_string() } else { text });
            return Err(ProcessingError::Status {
                status: status.as_u16(),
                message,
            });
        }

        let is_json = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.starts_with("application/json"));

        if tool.returns_json() || is_json {
            return Ok(ProcessedOutput::Json(response.json().await?));
        }

        let file_name = content_disposition_name(response.headers())
            .unwrap_or_else(|| output_file_name(tool, file, options));
        let bytes = response.bytes().await?.to_vec();
        Ok(ProcessedOutput::Download { file_name, bytes })
    }
}
