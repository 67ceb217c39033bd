//! Tick driver for the frame orchestrator.
//!
//! Calls `run_tick` from a fixed-rate tokio interval until Ctrl-C, the tick
//! budget or a fatal error. Ticks never overlap: each one finishes,
//! including GPU synchronization, before the next interval tick is awaited.
//! Late ticks are skipped, not queued.

use anyhow::Result;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{info, warn};

use crate::capture::{FramePresenter, FrameSource};
use crate::gpu::ComputeDevice;
use crate::orchestrator::{FrameOrchestrator, TickStats};
use crate::types::RuntimeCfg;

/// Runs the frame loop until Ctrl-C, the tick budget or a fatal error.
///
/// Every tick refreshes `source`, runs the orchestrator and hands the
/// report to `presenter`. A failure in any of the three drops that frame
/// and the loop continues; only lifecycle errors stop it. The orchestrator
/// is torn down on every exit path.
///
/// # Arguments
///
/// * `orchestrator` - Initialized orchestrator, consumed by the loop
/// * `source` - Capture collaborator providing the source frame
/// * `presenter` - Presentation collaborator owning the destination frame
/// * `runtime` - Tick rate, tick budget and reporting settings
///
/// # Returns
///
/// * `Ok(stats)` - Loop ended normally, final tick statistics
/// * `Err(e)` - Invalid tick rate or fatal pipeline error
pub async fn run_frame_loop<D, S, P>(
    mut orchestrator: FrameOrchestrator<D>,
    source: &mut S,
    presenter: &mut P,
    runtime: &RuntimeCfg,
) -> Result<TickStats>
where
    D: ComputeDevice,
    S: FrameSource<D>,
    P: FramePresenter<D>,
{
    let result = drive(&mut orchestrator, source, presenter, runtime).await;
    orchestrator.teardown();
    result.map(|()| orchestrator.stats())
}

async fn drive<D, S, P>(
    orchestrator: &mut FrameOrchestrator<D>,
    source: &mut S,
    presenter: &mut P,
    runtime: &RuntimeCfg,
) -> Result<()>
where
    D: ComputeDevice,
    S: FrameSource<D>,
    P: FramePresenter<D>,
{
    let period = runtime.tick_period()?;
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    info!(
        tick_hz = runtime.tick_hz,
        max_ticks = runtime.max_ticks,
        source = ?runtime.source,
        "Starte Frame-Loop"
    );

    let device = std::sync::Arc::clone(orchestrator.device());
    let mut tick: u64 = 0;
    loop {
        if runtime.max_ticks > 0 && tick >= runtime.max_ticks {
            info!(ticks = tick, "Tick-Budget erreicht");
            break;
        }

        tokio::select! {
            _ = ticker.tick() => {}
            res = &mut ctrl_c => {
                if let Err(e) = res {
                    warn!(error = %e, "Ctrl-C handler failed");
                }
                info!("Ctrl-C, stoppe Frame-Loop");
                break;
            }
        }

        let refreshed = source.refresh(device.as_ref(), tick);
        tick += 1;
        // No fresh input, nothing to present.
        if let Err(e) = refreshed {
            orchestrator.record_dropped(&e);
            if e.is_fatal() {
                return Err(e.into());
            }
            continue;
        }

        match orchestrator.run_tick(source.frame(), presenter.frame()) {
            Ok(report) => {
                if let Err(e) = presenter.present(device.as_ref(), &report) {
                    orchestrator.record_present_failure(&report, &e);
                    if e.is_fatal() {
                        return Err(e.into());
                    }
                }
            }
            Err(e) if e.is_fatal() => return Err(e.into()),
            Err(_) => {}
        }
    }
    Ok(())
}
