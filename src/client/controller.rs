//! Quota-gated tool flow shared by every tool
//!
//! Idle -> FileSelected -> Submitting -> Success | Failed. A refused
//! increment goes back to FileSelected. Failed keeps the file, and submitting
//! from it retries as from FileSelected. The server's answer to the increment
//! is the only gate; quota spent on a failed processing call is not refunded.

use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;

use super::analytics::AnalyticsSink;
use super::binding::UsageLimit;
use super::store::{UsageLimitsStore, LIMIT_REACHED_MESSAGE};
use super::tools::{ProcessedOutput, SelectedFile, Tool, ToolOptions, ToolProcessor, ValidationError};
use crate::rpc::AnalyticsEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolPhase {
    Idle,
    FileSelected,
    Submitting,
    Success,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ToastKind {
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Toast {
    pub kind: ToastKind,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    /// Rejected locally; nothing was sent
    Invalid(ValidationError),
    /// Quota gate refused; the processing endpoint was not called
    Blocked(String),
    Completed(ProcessedOutput),
    /// Processing failed after quota was spent
    Failed(String),
}

pub struct ToolController {
    tool: Tool,
    usage: UsageLimit,
    processor: Arc<dyn ToolProcessor>,
    analytics: Arc<dyn AnalyticsSink>,
    phase: ToolPhase,
    file: Option<SelectedFile>,
    toasts: Vec<Toast>,
}

impl ToolController {
    /// Mount the tool: binds its action type and loads the current usage
    pub async fn mount(
        tool: Tool,
        store: UsageLimitsStore,
        processor: Arc<dyn ToolProcessor>,
        analytics: Arc<dyn AnalyticsSink>,
    ) -> Self {
        let usage = UsageLimit::bind(store, tool.action_type()).await;
        Self {
            tool,
            usage,
            processor,
            analytics,
            phase: ToolPhase::Idle,
            file: None,
            toasts: Vec::new(),
        }
    }

    pub fn tool(&self) -> Tool {
        self.tool
    }

    pub fn usage(&self) -> &UsageLimit {
        &self.usage
    }

    pub fn phase(&self) -> ToolPhase {
        self.phase
    }

    pub fn file(&self) -> Option<&SelectedFile> {
        self.file.as_ref()
    }

    pub fn toasts(&self) -> &[Toast] {
        &self.toasts
    }

    pub fn select_file(&mut self, file: SelectedFile) {
        tracing::debug!(tool = self.tool.slug(), file = %file.name, "File selected");
        self.file = Some(file);
        self.phase = ToolPhase::FileSelected;
    }

    pub fn clear_file(&mut self) {
        self.file = None;
        self.phase = ToolPhase::Idle;
    }

    fn toast(&mut self, kind: ToastKind, message: impl Into<String>) {
        let message = message.into();
        match kind {
            ToastKind::Success => tracing::info!(tool = self.tool.slug(), "{}", message),
            ToastKind::Error => tracing::warn!(tool = self.tool.slug(), "{}", message),
        }
        self.toasts.push(Toast { kind, message });
    }

    fn invalid(&mut self, err: ValidationError) -> SubmitOutcome {
        self.toast(ToastKind::Error, err.to_string());
        SubmitOutcome::Invalid(err)
    }

    pub async fn submit(&mut self, options: &ToolOptions) -> SubmitOutcome {
        let Some(file) = self.file.clone() else {
            return self.invalid(ValidationError::NoFile);
        };

        let status = self.usage.status();
        // size ceilings depend on a tier we only know from a loaded status
        let limits = (!status.loading && status.error.is_none())
            .then(|| &status.tier.plan().limits);
        if let Err(err) = file.validate(self.tool, limits) {
            return self.invalid(err);
        }

        // advisory only; the increment below is authoritative
        if status.limit_reached {
            self.toast(ToastKind::Error, LIMIT_REACHED_MESSAGE);
            return SubmitOutcome::Blocked(LIMIT_REACHED_MESSAGE.to_string());
        }

        self.phase = ToolPhase::Submitting;
        let gate = self.usage.increment_usage().await;
        if !gate.success {
            let message = gate
                .error
                .unwrap_or_else(|| LIMIT_REACHED_MESSAGE.to_string());
            self.phase = ToolPhase::FileSelected;
            self.toast(ToastKind::Error, message.clone());
            return SubmitOutcome::Blocked(message);
        }

        let started = Instant::now();
        let result = self.processor.process(self.tool, &file, options).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(output) => {
                self.track(&file, options, elapsed_ms, None).await;
                self.phase = ToolPhase::Success;
                self.toast(
                    ToastKind::Success,
                    format!("{} finished in {} ms", self.tool.slug(), elapsed_ms),
                );
                SubmitOutcome::Completed(output)
            }
            Err(e) => {
                let message = e.to_string();
                self.track(&file, options, elapsed_ms, Some(message.clone()))
                    .await;
                self.phase = ToolPhase::Failed;
                self.toast(ToastKind::Error, message.clone());
                SubmitOutcome::Failed(message)
            }
        }
    }

    async fn track(
        &self,
        file: &SelectedFile,
        options: &ToolOptions,
        elapsed_ms: u64,
        error: Option<String>,
    ) {
        let mut event = AnalyticsEvent::new("tool_usage");
        event.event_category = Some(self.tool.slug().to_string());
        event.event_data = Some(serde_json::json!({
            "actionType": self.tool.action_type(),
            "options": options,
        }));
        event.file_size = Some(file.size());
        event.processing_time = Some(elapsed_ms);
        event.format_from = file.extension();
        event.format_to = options.format.clone();
        event.quality = options.quality.clone();
        event.success = Some(error.is_none());
        event.error_message = error;

        self.analytics.track(event).await;
    }
}
