// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Streaming lifecycle state machine (§4.6): ARMED waits out the TTFB
//! budget for a first delta, STREAMING resets a silence timer on every
//! delta, SILENCE_CHECK probes the page for genuine ongoing activity before
//! declaring the response stale. Every suspension point also selects on the
//! request's cancellation token (§5).

use std::time::Duration;

use tokio::sync::mpsc;

use relay_model::{FinishReason, StreamEvent};

use crate::browser::{BrowserSession, UiActivity};
use crate::cancel::CancellationToken;

/// Floor below which the silence-check re-arm interval is never shrunk,
/// even after repeated UI-active snoozes (§4.6).
const MIN_SILENCE_RECHECK: Duration = Duration::from_millis(1_000);

/// Bound on a single UI-activity probe during SILENCE_CHECK (§4.6).
const UI_ACTIVITY_PROBE_TIMEOUT: Duration = Duration::from_millis(2_000);

#[derive(Debug, Clone, PartialEq)]
pub enum TerminalState {
    Completed(FinishReason),
    TtfbTimeout,
    StaleTimeout,
    Cancelled,
    Error(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Armed,
    Streaming,
}

/// Drive one request's response-acquisition events to a terminal state,
/// invoking `on_event` for every delta/finish/error event observed along
/// the way. `browser` is only used for the SILENCE_CHECK UI-activity probe;
/// acquiring the events themselves is the caller's concern (wire channel,
/// helper poll, or DOM poll — §4.5).
///
/// `hard_cap` bounds the whole call regardless of UI activity (§4.6): a
/// wedged page that keeps reporting `Generating` would otherwise let the
/// silence re-arm interval snooze down to `MIN_SILENCE_RECHECK` and re-probe
/// forever. Once `hard_cap` elapses since the first poll, the stream is
/// forced to `StaleTimeout` even if the UI still looks active.
pub async fn drive<B, F>(
    mut events: mpsc::UnboundedReceiver<StreamEvent>,
    browser: &B,
    cancel: &CancellationToken,
    ttfb_budget: Duration,
    silence_budget: Duration,
    hard_cap: Duration,
    mut on_event: F,
) -> TerminalState
where
    B: BrowserSession + ?Sized,
    F: FnMut(&StreamEvent),
{
    let mut phase = Phase::Armed;
    let mut recheck_interval = silence_budget;
    let start = tokio::time::Instant::now();

    loop {
        let elapsed = start.elapsed();
        if elapsed >= hard_cap {
            return TerminalState::StaleTimeout;
        }
        let wait = if phase == Phase::Armed { ttfb_budget } else { recheck_interval };
        let wait = wait.min(hard_cap - elapsed);

        tokio::select! {
            biased;

            _ = cancel.cancelled() => return TerminalState::Cancelled,

            maybe_event = events.recv() => {
                match maybe_event {
                    Some(StreamEvent::Finish(reason)) => {
                        on_event(&StreamEvent::Finish(reason));
                        return TerminalState::Completed(reason);
                    }
                    Some(StreamEvent::TransportError { kind, detail }) => {
                        return TerminalState::Error(format!("{kind}: {detail}"));
                    }
                    Some(ev) => {
                        on_event(&ev);
                        phase = Phase::Streaming;
                        recheck_interval = silence_budget;
                    }
                    None => return TerminalState::Error("event source closed".into()),
                }
            }

            _ = tokio::time::sleep(wait) => {
                if phase == Phase::Armed {
                    return TerminalState::TtfbTimeout;
                }
                if start.elapsed() >= hard_cap {
                    return TerminalState::StaleTimeout;
                }
                match probe_ui_activity(browser).await {
                    UiActivity::Generating => {
                        recheck_interval = (recheck_interval / 2).max(MIN_SILENCE_RECHECK);
                    }
                    UiActivity::Idle => return TerminalState::StaleTimeout,
                }
            }
        }
    }
}

async fn probe_ui_activity<B: BrowserSession + ?Sized>(browser: &B) -> UiActivity {
    match tokio::time::timeout(UI_ACTIVITY_PROBE_TIMEOUT, browser.poll_ui_activity()).await {
        Ok(Ok(activity)) => activity,
        Ok(Err(_)) | Err(_) => UiActivity::Idle,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::{Attachment, NullBrowserSession};

    fn event_pipe() -> (mpsc::UnboundedSender<StreamEvent>, mpsc::UnboundedReceiver<StreamEvent>) {
        mpsc::unbounded_channel()
    }

    /// Always reports the page as still generating -- used to exercise the
    /// §4.6 hard cap, since [`NullBrowserSession`] reports idle immediately.
    #[derive(Debug, Default)]
    struct AlwaysGeneratingBrowser(NullBrowserSession);

    #[async_trait::async_trait]
    impl BrowserSession for AlwaysGeneratingBrowser {
        async fn open_page(&self) -> Result<(), crate::error::EngineError> {
            self.0.open_page().await
        }
        async fn set_model(&self, model_id: &str) -> Result<(), crate::error::EngineError> {
            self.0.set_model(model_id).await
        }
        async fn set_parameter(&self, param: &crate::browser::BrowserParam) -> Result<(), crate::error::EngineError> {
            self.0.set_parameter(param).await
        }
        async fn upload_attachment(&self, attachment: &Attachment) -> Result<(), crate::error::EngineError> {
            self.0.upload_attachment(attachment).await
        }
        async fn submit_prompt(&self, prompt: &str) -> Result<(), crate::error::EngineError> {
            self.0.submit_prompt(prompt).await
        }
        async fn poll_ui_activity(&self) -> Result<UiActivity, crate::error::EngineError> {
            Ok(UiActivity::Generating)
        }
        async fn read_final_text(&self) -> Result<String, crate::error::EngineError> {
            self.0.read_final_text().await
        }
        async fn set_function_toggle(&self, enabled: bool) -> Result<(), crate::error::EngineError> {
            self.0.set_function_toggle(enabled).await
        }
        async fn function_toggle_state(&self) -> Result<bool, crate::error::EngineError> {
            self.0.function_toggle_state().await
        }
        async fn install_function_declarations(&self, canonical_json: &str) -> Result<(), crate::error::EngineError> {
            self.0.install_function_declarations(canonical_json).await
        }
        async fn clear_chat(&self) -> Result<(), crate::error::EngineError> {
            self.0.clear_chat().await
        }
        async fn click_stop_generating(&self) -> Result<(), crate::error::EngineError> {
            self.0.click_stop_generating().await
        }
        async fn quick_refresh(&self) -> Result<(), crate::error::EngineError> {
            self.0.quick_refresh().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn armed_times_out_when_no_first_delta_arrives() {
        let (_tx, rx) = event_pipe();
        let browser = NullBrowserSession::default();
        let cancel = CancellationToken::new();
        let result = drive(rx, &browser, &cancel, Duration::from_millis(50), Duration::from_secs(30), Duration::from_secs(90), |_| {}).await;
        assert_eq!(result, TerminalState::TtfbTimeout);
    }

    #[tokio::test(start_paused = true)]
    async fn completes_on_finish_event() {
        let (tx, rx) = event_pipe();
        let browser = NullBrowserSession::default();
        let cancel = CancellationToken::new();
        tx.send(StreamEvent::TextDelta("hi".into())).unwrap();
        tx.send(StreamEvent::Finish(FinishReason::Stop)).unwrap();
        let mut seen = Vec::new();
        let result = drive(rx, &browser, &cancel, Duration::from_secs(5), Duration::from_secs(30), Duration::from_secs(90), |ev| {
            seen.push(format!("{ev:?}"));
        })
        .await;
        assert_eq!(result, TerminalState::Completed(FinishReason::Stop));
        assert_eq!(seen.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_wins_immediately() {
        let (_tx, rx) = event_pipe();
        let browser = NullBrowserSession::default();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = drive(rx, &browser, &cancel, Duration::from_secs(5), Duration::from_secs(30), Duration::from_secs(90), |_| {}).await;
        assert_eq!(result, TerminalState::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn transport_error_event_becomes_error_terminal_state() {
        let (tx, rx) = event_pipe();
        let browser = NullBrowserSession::default();
        let cancel = CancellationToken::new();
        tx.send(StreamEvent::TransportError { kind: "upstream_error".into(), detail: "quota".into() }).unwrap();
        let result = drive(rx, &browser, &cancel, Duration::from_secs(5), Duration::from_secs(30), Duration::from_secs(90), |_| {}).await;
        assert!(matches!(result, TerminalState::Error(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn silence_after_streaming_with_idle_ui_is_stale_timeout() {
        let (tx, rx) = event_pipe();
        let browser = NullBrowserSession::default();
        let cancel = CancellationToken::new();
        tx.send(StreamEvent::TextDelta("a".into())).unwrap();
        let result = drive(rx, &browser, &cancel, Duration::from_secs(5), Duration::from_millis(50), Duration::from_secs(90), |_| {}).await;
        assert_eq!(result, TerminalState::StaleTimeout);
    }

    #[tokio::test(start_paused = true)]
    async fn wedged_active_ui_still_hits_the_hard_cap() {
        let (tx, rx) = event_pipe();
        let browser = AlwaysGeneratingBrowser::default();
        let cancel = CancellationToken::new();
        tx.send(StreamEvent::TextDelta("a".into())).unwrap();
        let result = drive(
            rx,
            &browser,
            &cancel,
            Duration::from_secs(5),
            Duration::from_millis(100),
            Duration::from_secs(2),
            |_| {},
        )
        .await;
        assert_eq!(result, TerminalState::StaleTimeout, "a UI that always reports Generating must still be cut off at the hard cap");
    }
}
