//! Simulated printer driven by the runtime's tick.

use async_trait::async_trait;
use printlink_core::{FirmwareInfo, JobFlag, PrinterConfig, PrinterStatus, Temperature};
use printlink_sync::camera::{CameraError, CameraFrame, CaptureRequest, FrameSource};
use printlink_sync::{Demand, PrinterContext, PrinterHandler, SyncResult};
use serde_json::json;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Degrees per second the simulated heaters move.
const HEAT_RATE: f64 = 4.0;
const BED_TARGET: f64 = 60.0;
const NOZZLE_TARGET: f64 = 210.0;
const ROOM: f64 = 22.0;
/// Seconds a simulated job takes.
const JOB_LENGTH: f64 = 300.0;

pub struct SimulatedPrinter {
    label: String,
    bed: f64,
    nozzle: f64,
    heating: bool,
    printing: bool,
    paused: bool,
    elapsed: f64,
    announced: bool,
}

impl SimulatedPrinter {
    pub fn new(config: &PrinterConfig) -> Self {
        SimulatedPrinter {
            label: config.label(),
            bed: ROOM,
            nozzle: ROOM,
            heating: false,
            printing: false,
            paused: false,
            elapsed: 0.0,
            announced: false,
        }
    }

    fn approach(current: f64, target: f64, step: f64) -> f64 {
        if current < target {
            (current + step).min(target)
        } else {
            (current - step).max(target)
        }
    }

    fn start_job(&mut self) {
        info!(printer = %self.label, "Starting simulated job");
        self.heating = true;
        self.printing = false;
        self.paused = false;
        self.elapsed = 0.0;
    }

    fn stop_job(&mut self, ctx: &mut PrinterContext<'_>, flag: JobFlag) {
        self.heating = false;
        self.printing = false;
        self.paused = false;
        let state = ctx.state_mut();
        state.set_status(PrinterStatus::Operational);
        state.update_job(|job| job.set_flag(flag));
    }
}

#[async_trait]
impl PrinterHandler for SimulatedPrinter {
    async fn on_connected(&mut self, ctx: &mut PrinterContext<'_>) -> SyncResult<()> {
        if !self.announced {
            let state = ctx.state_mut();
            state.set_firmware(FirmwareInfo {
                name: Some("virtual".into()),
                version: Some(env!("CARGO_PKG_VERSION").into()),
                date: None,
                link: None,
            });
            state.set_status(PrinterStatus::Operational);
            self.announced = true;
        }
        info!(printer = %self.label, "Simulated printer online");
        Ok(())
    }

    async fn on_tick(&mut self, ctx: &mut PrinterContext<'_>, elapsed: Duration) -> SyncResult<()> {
        let dt = elapsed.as_secs_f64();
        let step = HEAT_RATE * dt;
        let (bed_target, nozzle_target) = if self.heating || self.printing {
            (BED_TARGET, NOZZLE_TARGET)
        } else {
            (ROOM, ROOM)
        };
        self.bed = Self::approach(self.bed, bed_target, step);
        self.nozzle = Self::approach(self.nozzle, nozzle_target, step * 5.0);

        if self.heating && self.bed >= BED_TARGET && self.nozzle >= NOZZLE_TARGET {
            self.heating = false;
            self.printing = true;
            ctx.state_mut().update_job(|job| {
                job.filename = Some("benchy.gcode".into());
                job.initial_estimate = Some(JOB_LENGTH as u64);
                job.set_flag(JobFlag::Started);
            });
        }

        if self.printing && !self.paused {
            self.elapsed += dt;
            let percent = self.elapsed / JOB_LENGTH * 100.0;
            let seconds = self.elapsed as u64;
            ctx.state_mut().update_job(|job| {
                job.set_progress(percent);
                job.time = Some(seconds);
            });
            if self.elapsed >= JOB_LENGTH {
                info!(printer = %self.label, "Simulated job finished");
                self.stop_job(ctx, JobFlag::Finished);
            }
        }

        let status = match (self.heating, self.printing, self.paused) {
            (_, true, true) => PrinterStatus::Paused,
            (_, true, false) => PrinterStatus::Printing,
            (true, false, _) => PrinterStatus::Printing,
            _ => PrinterStatus::Operational,
        };

        let state = ctx.state_mut();
        state.set_status(status);
        state.set_bed_temperature(Temperature::new(self.bed, bed_target));
        state.set_tool_temperature(0, Temperature::new(self.nozzle, nozzle_target))?;
        state.set_active_tool(Some(0));
        Ok(())
    }

    async fn on_demand(&mut self, ctx: &mut PrinterContext<'_>, demand: &Demand) -> SyncResult<()> {
        debug!(printer = %self.label, demand = demand.name(), "Demand received");
        match demand {
            Demand::Pause if self.printing => self.paused = true,
            Demand::Resume if self.printing => self.paused = false,
            Demand::Cancel => self.stop_job(ctx, JobFlag::Cancelled),
            Demand::File { .. } => self.start_job(),
            Demand::Gcode { lines } => {
                for line in lines {
                    ctx.send("terminal", json!({ "line": format!("ok {line}") }))?;
                }
            }
            Demand::WebcamSnapshot { id, .. } => {
                let Some(camera) = ctx.camera().cloned() else {
                    warn!(printer = %self.label, "Snapshot requested but no camera attached");
                    return Ok(());
                };
                let frame = camera.request(CaptureRequest::snapshot(id.clone())).await?;
                ctx.send(
                    "webcam_snapshot",
                    json!({
                        "id": id,
                        "content_type": frame.content_type,
                        "size": frame.data.len(),
                        "captured_at": frame.captured_at.to_rfc3339(),
                    }),
                )?;
            }
            other => debug!(printer = %self.label, demand = other.name(), "Demand ignored"),
        }
        Ok(())
    }
}

/// Camera that returns a fixed test frame.
pub struct TestPattern;

#[async_trait]
impl FrameSource for TestPattern {
    async fn capture(&mut self, _request: &CaptureRequest) -> Result<CameraFrame, CameraError> {
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok(CameraFrame::jpeg(vec![0xFF, 0xD8, 0xFF, 0xD9]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_approach_clamps_to_target() {
        assert_eq!(SimulatedPrinter::approach(20.0, 60.0, 50.0), 60.0);
        assert_eq!(SimulatedPrinter::approach(60.0, 22.0, 4.0), 56.0);
    }

    #[tokio::test]
    async fn test_test_pattern_frame() {
        tokio::time::pause();
        let frame = TestPattern
            .capture(&CaptureRequest::snapshot(None))
            .await
            .unwrap();
        assert_eq!(frame.content_type, "image/jpeg");
        assert_eq!(frame.data.len(), 4);
    }
}
