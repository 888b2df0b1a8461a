//! Command bridge between the head unit and its controlling UI.
//!
//! The UI never touches the session manager directly.  It calls the command
//! functions here, which return serialisable snapshots wrapped in a
//! [`CommandResult`] envelope:
//!
//! ```json
//! { "success": true,  "data": { "connected": false, "state": "idle", ... }, "error": null }
//! { "success": false, "data": null, "error": "no device watcher installed" }
//! ```
//!
//! `state` uses the session state's kebab-case name (`"idle"`,
//! `"transport-starting"`, ...) and `frame_source` is `"live"` or
//! `"simulated"`, so a UI can switch on plain strings.

use headunit_core::FrameSource;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::head_unit::HeadUnit;

// ── DTOs ──────────────────────────────────────────────────────────────────────

/// Status snapshot returned to the UI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeadUnitStatusDto {
    pub connected: bool,
    pub state: String,
    pub frame_source: String,
    /// Identity of the device the current session belongs to.
    pub device: Option<String>,
    /// `true` while the device watcher is running.
    pub detecting: bool,
}

/// Unified response wrapper for every command.
#[derive(Debug, Serialize, Deserialize)]
pub struct CommandResult<T: Serialize> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
}

impl<T: Serialize> CommandResult<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

// ── Commands ──────────────────────────────────────────────────────────────────

/// Returns the current status snapshot.
pub fn get_status(head_unit: &HeadUnit) -> CommandResult<HeadUnitStatusDto> {
    let session = head_unit.session();
    CommandResult::ok(HeadUnitStatusDto {
        connected: session.is_connected(),
        state: session.state().to_string(),
        frame_source: frame_source_name(session.frame_source()).to_string(),
        device: session.current_device().map(|d| d.to_string()),
        detecting: head_unit.is_detecting(),
    })
}

/// Restarts the installed device watcher.
pub fn start_detection(head_unit: &HeadUnit) -> CommandResult<()> {
    match head_unit.resume_detection() {
        Ok(()) => CommandResult::ok(()),
        Err(e) => {
            warn!(error = %e, "start_detection command failed");
            CommandResult::err(e.to_string())
        }
    }
}

/// Stops the device watcher.  The current session, if any, is kept.
pub fn stop_detection(head_unit: &HeadUnit) -> CommandResult<()> {
    head_unit.stop_detection();
    CommandResult::ok(())
}

fn frame_source_name(source: FrameSource) -> &'static str {
    match source {
        FrameSource::Live => "live",
        FrameSource::Simulated => "simulated",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use crate::infrastructure::backend::ScriptedBackend;
    use crate::infrastructure::config::HeadUnitConfig;
    use crate::infrastructure::device_watcher::mock::MockUsbBus;
    use crate::infrastructure::device_watcher::{DeviceWatcher, DeviceWatcherConfig};
    use crate::infrastructure::video_surface::VideoSurface;

    fn make_head_unit() -> HeadUnit {
        HeadUnit::new(
            &HeadUnitConfig::default(),
            Arc::new(ScriptedBackend::new()),
            Arc::new(VideoSurface::new()),
        )
        .unwrap()
    }

    #[test]
    fn test_get_status_reports_idle_simulated_initially() {
        // Arrange
        let head_unit = make_head_unit();

        // Act
        let result = get_status(&head_unit);

        // Assert
        assert!(result.success);
        assert_eq!(
            result.data.unwrap(),
            HeadUnitStatusDto {
                connected: false,
                state: "idle".into(),
                frame_source: "simulated".into(),
                device: None,
                detecting: false,
            }
        );
    }

    #[test]
    fn test_start_detection_without_watcher_is_an_error() {
        let head_unit = make_head_unit();

        let result = start_detection(&head_unit);

        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("no device watcher installed"));
    }

    #[test]
    fn test_stop_then_start_detection_toggles_watcher() {
        // Arrange
        let head_unit = make_head_unit();
        let bus = MockUsbBus::polling();
        let config = DeviceWatcherConfig {
            poll_interval: Duration::from_millis(20),
            event_wait: Duration::from_millis(20),
        };
        let (watcher, events) = DeviceWatcher::new(bus.factory(), config);
        head_unit.attach_watcher(events).unwrap();
        head_unit.start_detection(watcher).unwrap();

        // Act / Assert
        assert!(stop_detection(&head_unit).success);
        assert!(!get_status(&head_unit).data.unwrap().detecting);
        assert!(start_detection(&head_unit).success);
        assert!(get_status(&head_unit).data.unwrap().detecting);
    }

    #[test]
    fn test_command_result_serializes_envelope() {
        let json = serde_json::to_value(CommandResult::<u8>::err("boom")).unwrap();
        assert_eq!(json, serde_json::json!({ "success": false, "data": null, "error": "boom" }));
    }
}
