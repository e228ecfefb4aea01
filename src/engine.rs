//! The stream subsystem's cooperative loop: backend notifications, schedule
//! polls, announcement triggers and the output heartbeat

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use color_eyre::{eyre::eyre, Result};
use crossbeam::utils::CachePadded;
use flume::Receiver;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::announce::{AnnouncementDucker, TriggerWatcher};
use crate::events::{Dispatch, EventDispatcher};
use crate::graph::{BackendEvent, BranchKey, BranchRole, GraphController, MediaBackend};
use crate::overlay::ProducerStats;
use crate::schedule::{PollOutcome, ProgramScheduler, ScheduleAction, ScheduleClient};
use crate::Config;

/// Bound on draining encoders and mux at shutdown
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(3);

/// Whether the loop should keep going after an event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Exit(String),
}

#[derive(Debug, Clone, Copy)]
pub struct EngineTimers {
    pub poll: Duration,
    pub trigger: Duration,
    pub heartbeat: Duration,
}

impl EngineTimers {
    pub fn from_config(config: &Config) -> Self {
        Self {
            poll: Duration::from_secs(config.schedule.poll_interval_secs.max(1)),
            trigger: Duration::from_millis(config.announcer.check_interval_ms.max(10)),
            heartbeat: Duration::from_secs(config.supervisor.heartbeat_log_secs.max(1)),
        }
    }
}

pub struct Engine<B: MediaBackend> {
    ctrl: GraphController<B>,
    scheduler: ProgramScheduler,
    watcher: TriggerWatcher,
    ducker: AnnouncementDucker,
    dispatcher: EventDispatcher,
    overlay_stats: Option<Arc<CachePadded<ProducerStats>>>,
    last_frames: u64,
}

impl<B: MediaBackend> Engine<B> {
    /// `started_at` is the subsystem start in seconds since the epoch;
    /// announcement triggers older than that are not replayed.
    pub fn new(ctrl: GraphController<B>, config: &Config, started_at: f64) -> Self {
        Self {
            ctrl,
            scheduler: ProgramScheduler::new(&config.schedule.media_root),
            watcher: TriggerWatcher::new(&config.announcer.trigger_file, started_at),
            ducker: AnnouncementDucker::new(&config.audio),
            dispatcher: EventDispatcher::new(config.events.error_policy),
            overlay_stats: None,
            last_frames: 0,
        }
    }

    pub fn with_overlay_stats(mut self, stats: Arc<CachePadded<ProducerStats>>) -> Self {
        self.overlay_stats = Some(stats);
        self
    }

    pub fn controller(&self) -> &GraphController<B> {
        &self.ctrl
    }

    pub fn controller_mut(&mut self) -> &mut GraphController<B> {
        &mut self.ctrl
    }

    pub fn scheduler(&self) -> &ProgramScheduler {
        &self.scheduler
    }

    pub fn ducker(&self) -> &AnnouncementDucker {
        &self.ducker
    }

    pub fn handle_poll(&mut self, outcome: PollOutcome) {
        match self.scheduler.on_poll(outcome) {
            ScheduleAction::Hold => {}
            ScheduleAction::Start { program, source } => {
                match self.ctrl.attach_branch(BranchRole::Program, source) {
                    Ok(key) => {
                        self.scheduler.attached(key);
                        if let Err(e) = self.ctrl.switch_when_ready(BranchRole::Program) {
                            warn!("Failed to switch to program {}: {}", program.id, e);
                        }
                    }
                    Err(e) => {
                        error!("Failed to start program {}: {}", program.id, e);
                        self.scheduler.abandon();
                    }
                }
            }
            ScheduleAction::Stop { id } => {
                info!(program = %id, "Returning to default composite");
                self.leave_program();
            }
        }
    }

    fn leave_program(&mut self) {
        if let Err(e) = self.ctrl.switch_to_default() {
            warn!("Failed to switch to default: {}", e);
        }
        if let Err(e) = self.ctrl.teardown_branch(BranchRole::Program) {
            warn!("Failed to tear down program: {}", e);
        }
    }

    pub fn check_trigger(&mut self) {
        let Some(trigger) = self.watcher.check() else {
            return;
        };
        let program_on_air = self.ctrl.program_audio_on_air();
        if let Err(e) = self.ducker.on_trigger(&mut self.ctrl, &trigger, program_on_air) {
            warn!("Announcement failed: {}", e);
        }
    }

    pub fn handle_backend_event(&mut self, event: BackendEvent) -> Flow {
        match event {
            BackendEvent::PadResolved { branch, media } => {
                if let Err(e) = self.ctrl.on_pad_resolved(branch, media) {
                    warn!(branch = %branch, "Dropping branch: {}", e);
                    self.branch_finished(branch);
                }
            }
            BackendEvent::FirstSample { branch, media } => {
                if let Err(e) = self.ctrl.on_first_sample(branch, media) {
                    warn!(branch = %branch, "Failed to switch: {}", e);
                }
            }
            BackendEvent::Drained { branch, media } => {
                debug!(branch = %branch, "{} drained", media);
                if let Some(key) = self.ctrl.on_branch_drained(branch, media) {
                    self.branch_finished(key);
                }
            }
            BackendEvent::Bus(event) => match self.dispatcher.dispatch(&event) {
                Dispatch::Continue => {}
                Dispatch::BranchFinished(key) => self.branch_finished(key),
                Dispatch::Shutdown(reason) => return Flow::Exit(reason),
            },
        }
        Flow::Continue
    }

    /// A branch ended, failed, or could not be linked.
    fn branch_finished(&mut self, key: BranchKey) {
        match key.role {
            BranchRole::Program => {
                if self.ctrl.current_key(BranchRole::Program) != Some(key) {
                    return;
                }
                if self.scheduler.mark_finished(key) {
                    info!(branch = %key, "Program ended");
                }
                self.leave_program();
            }
            BranchRole::Announcement => {
                if let Err(e) = self.ducker.on_finished(&mut self.ctrl, key) {
                    warn!(branch = %key, "Failed to end announcement: {}", e);
                }
            }
        }
    }

    /// Logs a heartbeat line if output advanced since the last call. Stays
    /// silent otherwise so a stalled stream looks dead to the supervisor.
    pub fn heartbeat(&mut self) -> bool {
        let frames = self.ctrl.backend().frames_out();
        let advanced = frames > self.last_frames;
        self.last_frames = frames;

        if !advanced {
            debug!("No output progress since last heartbeat");
            return false;
        }
        match &self.overlay_stats {
            Some(stats) => {
                let (published, skipped) = stats.snapshot();
                info!(
                    "Heartbeat: {} buffers out, overlay {} published / {} skipped",
                    frames, published, skipped
                );
            }
            None => info!("Heartbeat: {} buffers out", frames),
        }
        true
    }

    /// Drive the loop until `shutdown` resolves or a graph error ends it.
    pub async fn run(
        &mut self,
        events: Receiver<BackendEvent>,
        client: Option<ScheduleClient>,
        timers: EngineTimers,
        shutdown: impl Future<Output = ()>,
    ) -> Result<()> {
        let (poll_tx, poll_rx) = flume::bounded::<PollOutcome>(1);
        let mut poll_in_flight = false;

        let mut poll_timer = tokio::time::interval(timers.poll);
        let mut trigger_timer = tokio::time::interval(timers.trigger);
        let mut heartbeat_timer = tokio::time::interval(timers.heartbeat);
        for timer in [&mut poll_timer, &mut trigger_timer, &mut heartbeat_timer] {
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        }
        // The first heartbeat tick fires immediately, before any output.
        heartbeat_timer.tick().await;

        tokio::pin!(shutdown);
        info!("Stream loop running");

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    return Ok(());
                }
                event = events.recv_async() => {
                    let event = event.map_err(|_| eyre!("Media backend closed its event channel"))?;
                    if let Flow::Exit(reason) = self.handle_backend_event(event) {
                        return Err(eyre!("Graph error: {}", reason));
                    }
                }
                Ok(outcome) = poll_rx.recv_async() => {
                    poll_in_flight = false;
                    self.handle_poll(outcome);
                }
                _ = poll_timer.tick(), if client.is_some() && !poll_in_flight => {
                    if let Some(client) = client.clone() {
                        poll_in_flight = true;
                        let tx = poll_tx.clone();
                        tokio::spawn(async move {
                            let _ = tx.send_async(client.poll().await).await;
                        });
                    }
                }
                _ = trigger_timer.tick() => self.check_trigger(),
                _ = heartbeat_timer.tick() => {
                    self.heartbeat();
                }
            }
        }
    }

    /// Tear down branches and drain the graph.
    pub fn shutdown(&mut self, timeout: Duration) -> Result<()> {
        self.ctrl.shutdown(timeout)?;
        Ok(())
    }
}

/// Resolves on Ctrl-C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };

    #[cfg(unix)]
    let term = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let term = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = term => {},
    }

    warn!("Shutdown signal received");
}

/// Run the stream subsystem until a shutdown signal or a fatal graph error.
#[cfg(feature = "gstreamer-pipeline")]
pub fn run_stream(config: Config) -> Result<()> {
    use std::time::{SystemTime, UNIX_EPOCH};

    use crate::graph::gst::GstBackend;
    use crate::graph::BackbonePlan;
    use crate::overlay::{FrameGeometry, ImageSurface, OverlaySource, RenderThread, SharedFrame};

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| eyre!("Failed to create runtime: {}", e))?;

    runtime.block_on(async move {
        let started_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);

        let frame = SharedFrame::new(FrameGeometry::new(config.video.width, config.video.height));
        let source = OverlaySource::parse(&config.overlay.url)?;
        let reload = (config.overlay.reload_interval_secs > 0)
            .then(|| Duration::from_secs(config.overlay.reload_interval_secs));
        let mut render = RenderThread::spawn(
            move || ImageSurface::new(source, reload),
            frame.clone(),
            config.frame_period(),
        )?;

        let plan = BackbonePlan::from_config(&config)?;
        let (backend, events) = GstBackend::new(&config, frame)?;
        let mut ctrl = GraphController::build(backend, &plan)?;
        ctrl.start()?;
        ctrl.set_music_gain(config.audio.music_gain)?;
        for endpoint in &plan.endpoints {
            info!("Streaming to {} endpoint", endpoint.name);
        }

        let client = if config.schedule.endpoint.trim().is_empty() {
            info!("No schedule endpoint, program scheduling disabled");
            None
        } else {
            Some(ScheduleClient::new(&config.schedule)?)
        };

        let mut engine = Engine::new(ctrl, &config, started_at).with_overlay_stats(render.stats());
        let result = engine
            .run(events, client, EngineTimers::from_config(&config), shutdown_signal())
            .await;

        if let Err(e) = engine.shutdown(DRAIN_TIMEOUT) {
            warn!("Unclean shutdown: {}", e);
        }
        render.stop();
        info!("Stream subsystem stopped");
        result
    })
}
