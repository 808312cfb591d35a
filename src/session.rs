//! The device session: scan, connect, find the write characteristic, poll until
//! the printer talks, then hand out [`ReadyPrinter`]s and stream print jobs.
//!
//! Everything mutable lives in [`Session`] and is only touched from its event
//! loop. The polling loop and the print streamer are separate tasks holding a
//! clone of the link; both are aborted, not abandoned, when they stop being
//! wanted.

use std::{sync::Arc, time::Duration};

use futures::StreamExt;
use log::{debug, error, info, trace, warn};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::Instant,
};
use uuid::Uuid;

use crate::{
    error::{LinkError, PrintError},
    link::{Availability, CharProps, CharacteristicInfo, Frames, LinkEvent, RadioLink, WriteKind},
    printer::{Command, Fault, FaultKind, PrinterState, ReadyPrinter},
    raster::PrintJob,
    status::StatusTracker,
    t02::{self, Query},
};

/// How the write characteristic is picked out of the discovered ones.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum WriteSelection {
    /// First characteristic able to write without response.
    #[default]
    Capability,
    /// The second characteristic of the first service, as the stock app does.
    /// Still checked for write support.
    Positional,
}

#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub service: Uuid,
    pub poll_interval: Duration,
    /// Give up if the printer hasn't answered this long after scanning starts.
    pub ready_timeout: Option<Duration>,
    pub write_selection: WriteSelection,
    /// Bytes per link write while streaming a job.
    pub chunk_size: usize,
    pub chunk_delay: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            service: t02::SERVICE_UUID,
            poll_interval: Duration::from_millis(500),
            ready_timeout: None,
            write_selection: WriteSelection::Capability,
            chunk_size: 128,
            chunk_delay: Duration::from_millis(10),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Idle,
    Scanning,
    Connecting,
    Discovering,
    Polling,
    Ready,
    NotReady,
    Printing,
    Disconnected,
    Error,
}

impl Phase {
    /// The public state for phases that don't carry anything. `None` for
    /// ready, not-ready and error, which need a payload.
    fn plain_state(self) -> Option<PrinterState> {
        match self {
            Phase::Idle | Phase::Disconnected => Some(PrinterState::Disconnected),
            Phase::Scanning => Some(PrinterState::Scanning),
            Phase::Connecting | Phase::Discovering | Phase::Polling => {
                Some(PrinterState::Connecting)
            }
            Phase::Printing => Some(PrinterState::Printing),
            Phase::Ready | Phase::NotReady | Phase::Error => None,
        }
    }
}

enum TaskEvent {
    Streamed(u64),
    StreamFailed(u64, LinkError),
}

pub struct Session<L: RadioLink> {
    link: Arc<L>,
    config: SessionConfig,
    phase: Phase,
    device: Option<L::DeviceId>,
    write_target: Option<CharacteristicInfo>,
    frames: Option<Frames>,
    tracker: StatusTracker,
    poller: Option<JoinHandle<()>>,
    streamer: Option<JoinHandle<()>>,
    print_id: u64,
    deadline: Option<Instant>,
    epoch: u64,
    commands: mpsc::Receiver<Command>,
    weak_commands: mpsc::WeakSender<Command>,
    tasks_tx: mpsc::UnboundedSender<TaskEvent>,
    tasks_rx: mpsc::UnboundedReceiver<TaskEvent>,
    state: watch::Sender<PrinterState>,
    observers: Vec<mpsc::UnboundedSender<PrinterState>>,
}

/// The consumer side of a session. Dropping every handle shuts the session down.
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<PrinterState>,
}

pub fn spawn<L: RadioLink>(
    link: L,
    config: SessionConfig,
) -> (SessionHandle, JoinHandle<Result<(), LinkError>>) {
    let (session, handle) = Session::new(link, config);
    (handle, tokio::spawn(session.run()))
}

impl<L: RadioLink> Session<L> {
    pub fn new(link: L, config: SessionConfig) -> (Self, SessionHandle) {
        let (commands_tx, commands) = mpsc::channel(8);
        let (tasks_tx, tasks_rx) = mpsc::unbounded_channel();
        let (state, state_rx) = watch::channel(PrinterState::Disconnected);

        let session = Self {
            link: Arc::new(link),
            config,
            phase: Phase::Idle,
            device: None,
            write_target: None,
            frames: None,
            tracker: StatusTracker::new(),
            poller: None,
            streamer: None,
            print_id: 0,
            deadline: None,
            epoch: 0,
            commands,
            weak_commands: commands_tx.downgrade(),
            tasks_tx,
            tasks_rx,
            state,
            observers: vec![],
        };
        let handle = SessionHandle {
            commands: commands_tx,
            state: state_rx,
        };
        (session, handle)
    }

    /// Every state change from here on, starting with the current state.
    pub fn observe(&mut self) -> mpsc::UnboundedReceiver<PrinterState> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.add_observer(tx);
        rx
    }

    pub async fn run(mut self) -> Result<(), LinkError> {
        let mut events = self.link.events().await?;

        loop {
            tokio::select! {
                event = events.next() => match event {
                    Some(event) => self.on_link_event(event).await,
                    None => {
                        warn!("radio link event stream ended");
                        break;
                    }
                },
                frame = next_frame(&mut self.frames) => match frame {
                    Some(frame) => self.on_frame(&frame).await,
                    None => {
                        debug!("notification stream closed");
                        self.frames = None;
                    }
                },
                Some(task) = self.tasks_rx.recv() => self.on_task(task).await,
                command = self.commands.recv() => match command {
                    Some(command) => self.on_command(command),
                    None => {
                        debug!("all session handles dropped");
                        break;
                    }
                },
                _ = wait_until(self.deadline) => self.on_timeout().await,
            }
        }

        self.shutdown().await;
        Ok(())
    }

    async fn on_link_event(&mut self, event: LinkEvent<L::DeviceId>) {
        match event {
            LinkEvent::Availability(Availability::PoweredOn) => {
                let idle = matches!(self.phase, Phase::Idle | Phase::Error | Phase::Disconnected);
                if idle && self.device.is_none() {
                    self.start_scanning().await;
                }
            }
            LinkEvent::Availability(Availability::Unknown) => debug!("radio state unknown"),
            LinkEvent::Availability(other) => {
                self.drop_connection();
                self.deadline = None;
                self.fail(FaultKind::Radio, other.to_string());
            }
            LinkEvent::Discovered(id) => {
                if self.phase != Phase::Scanning {
                    trace!("ignoring {:?}, not scanning", id);
                    return;
                }
                info!("found printer {:?}", id);
                if let Err(e) = self.link.stop_scan().await {
                    warn!("couldn't stop scan: {}", e);
                }
                self.connect(id).await;
            }
            LinkEvent::Disconnected(id) => {
                if self.device.as_ref() != Some(&id) {
                    trace!("ignoring disconnect of {:?}", id);
                    return;
                }
                self.on_disconnect().await;
            }
        }
    }

    async fn start_scanning(&mut self) {
        self.transition(Phase::Scanning);
        if self.deadline.is_none() {
            self.deadline = self.config.ready_timeout.map(|t| Instant::now() + t);
        }
        if let Err(e) = self.link.start_scan(self.config.service).await {
            self.fail(FaultKind::Scan, format!("couldn't start scan: {}", e));
        }
    }

    async fn connect(&mut self, id: L::DeviceId) {
        self.device = Some(id.clone());
        self.transition(Phase::Connecting);

        if let Err(e) = self.link.connect(&id).await {
            error!("BLE connection to printer failed: {}", e);
            self.device = None;
            self.fail(FaultKind::Connect, format!("Failed to connect: {}", e));
            self.start_scanning().await;
            return;
        }

        info!("discovering services and characteristics...");
        self.transition(Phase::Discovering);
        match self.setup(&id).await {
            Ok(()) => self.start_polling(),
            Err(msg) => {
                error!("{}", msg);
                // abandon this attempt; the disconnect below won't trigger a rescan
                self.drop_connection();
                if let Err(e) = self.link.disconnect(&id).await {
                    debug!("disconnect after failed discovery: {}", e);
                }
                self.fail(FaultKind::Discovery, msg);
            }
        }
    }

    async fn setup(&mut self, id: &L::DeviceId) -> Result<(), String> {
        let services = self
            .link
            .discover_services(id)
            .await
            .map_err(|e| format!("Service discovery failed: {}", e))?;
        if services.is_empty() {
            return Err("No services found".into());
        }

        let candidates = match self.config.write_selection {
            WriteSelection::Positional => &services[..1],
            WriteSelection::Capability => &services[..],
        };

        let mut reason = String::new();
        for service in candidates {
            let chars = self
                .link
                .discover_characteristics(id, service)
                .await
                .map_err(|e| format!("Characteristic discovery failed: {}", e))?;
            debug!("service {}: {:?}", service.uuid, chars);

            let target = match select_write_target(&chars, self.config.write_selection) {
                Ok(target) => target.clone(),
                Err(why) => {
                    debug!("service {} unusable: {}", service.uuid, why);
                    reason = why;
                    continue;
                }
            };

            self.frames = Some(
                self.link
                    .notifications(id)
                    .await
                    .map_err(|e| format!("couldn't open notifications: {}", e))?,
            );
            for c in chars.iter().filter(|c| c.can_notify()) {
                self.link
                    .subscribe(id, c)
                    .await
                    .map_err(|e| format!("couldn't subscribe to {}: {}", c.uuid, e))?;
                debug!("subscribed to {}", c.uuid);
            }

            info!("found write characteristic {}", target.uuid);
            self.write_target = Some(target);
            return Ok(());
        }

        Err(reason)
    }

    fn start_polling(&mut self) {
        let (Some(device), Some(target)) = (self.device.clone(), self.write_target.clone()) else {
            return;
        };
        self.transition(Phase::Polling);
        self.poller = Some(tokio::spawn(poll(
            Arc::clone(&self.link),
            device,
            target,
            self.config.poll_interval,
        )));
    }

    fn stop_polling(&mut self) {
        if let Some(poller) = self.poller.take() {
            poller.abort();
            debug!("polling stopped");
        }
    }

    async fn on_frame(&mut self, frame: &[u8]) {
        debug!("NOTIFY {:02x?}", frame);
        let Some((event, update)) = self.tracker.feed(frame) else {
            return;
        };

        if update.first_contact {
            info!("printer answered ({:?})", event);
            self.stop_polling();
            self.deadline = None;
        }

        match self.phase {
            Phase::Polling | Phase::Ready | Phase::NotReady => self.refresh(),
            Phase::Printing if update.print_complete => {
                info!("print complete");
                // the printer is done with this job whatever is still queued for it
                self.abort_streamer();
                self.refresh();
            }
            Phase::Printing if !self.tracker.flags().is_empty() => {
                warn!("printer stopped mid-print: {:?}", self.tracker.flags());
                self.abort_streamer();
                self.refresh();
            }
            _ => trace!("status {:?} while {:?}", event, self.phase),
        }
    }

    /// Recompute Ready/NotReady from the flags.
    fn refresh(&mut self) {
        if !self.tracker.contacted() {
            return;
        }

        let flags = self.tracker.flags();
        if !flags.is_empty() {
            self.phase = Phase::NotReady;
            self.publish(PrinterState::NotReady(flags));
        } else if self.phase != Phase::Ready {
            self.phase = Phase::Ready;
            self.epoch += 1;
            let printer = ReadyPrinter::new(self.weak_commands.clone(), self.epoch);
            self.publish(PrinterState::Ready(printer));
        }
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Observe(tx) => self.add_observer(tx),
            Command::Print { job, epoch, reply } => {
                let result = self.start_print(job, epoch);
                if let Err(e) = &result {
                    info!("print rejected: {}", e);
                }
                let _ = reply.send(result);
            }
        }
    }

    fn start_print(&mut self, job: PrintJob, epoch: u64) -> Result<(), PrintError> {
        match self.phase {
            Phase::Ready => {}
            Phase::Printing => return Err(PrintError::Busy),
            _ => return Err(PrintError::NotReady),
        }
        if epoch != self.epoch {
            return Err(PrintError::Stale);
        }
        let (Some(device), Some(target)) = (self.device.clone(), self.write_target.clone()) else {
            return Err(PrintError::NotReady);
        };

        let rows = job.raster().height();
        let data = t02::encode(job);
        info!("printing {} rows, {} bytes", rows, data.len());

        self.print_id += 1;
        self.transition(Phase::Printing);
        self.streamer = Some(tokio::spawn(stream_job(
            Arc::clone(&self.link),
            device,
            target,
            data,
            self.config.chunk_size,
            self.config.chunk_delay,
            self.tasks_tx.clone(),
            self.print_id,
        )));
        Ok(())
    }

    fn abort_streamer(&mut self) {
        if let Some(streamer) = self.streamer.take() {
            streamer.abort();
        }
    }

    async fn on_task(&mut self, task: TaskEvent) {
        match task {
            TaskEvent::Streamed(id) if id == self.print_id => {
                debug!("print data sent, waiting for completion");
                self.streamer = None;
            }
            TaskEvent::StreamFailed(id, e) if id == self.print_id && self.phase == Phase::Printing => {
                error!("print write failed: {}", e);
                self.streamer = None;
                self.fail(FaultKind::Print, format!("print failed: {}", e));
                // let the regular reconnect path pick the printer up again
                if let Some(device) = self.device.clone() {
                    if let Err(e) = self.link.disconnect(&device).await {
                        warn!("disconnect after failed print: {}", e);
                    }
                }
            }
            _ => trace!("stale print task event"),
        }
    }

    async fn on_disconnect(&mut self) {
        info!("printer disconnected");
        if self.phase == Phase::Printing {
            warn!("link dropped mid-print, job lost");
        }
        self.drop_connection();
        self.transition(Phase::Disconnected);
        self.start_scanning().await;
    }

    async fn on_timeout(&mut self) {
        self.deadline = None;
        if self.tracker.contacted() {
            return;
        }
        let secs = self.config.ready_timeout.unwrap_or_default().as_secs_f32();
        error!("printer not ready after {}s", secs);

        if self.phase == Phase::Scanning {
            if let Err(e) = self.link.stop_scan().await {
                warn!("couldn't stop scan: {}", e);
            }
        }
        if let Some(device) = self.device.clone() {
            self.drop_connection();
            if let Err(e) = self.link.disconnect(&device).await {
                debug!("disconnect after timeout: {}", e);
            }
        }
        self.fail(
            FaultKind::Timeout,
            format!("Printer not found within {}s. Make sure it's on.", secs),
        );
    }

    fn drop_connection(&mut self) {
        self.stop_polling();
        self.abort_streamer();
        self.frames = None;
        self.write_target = None;
        self.device = None;
        self.tracker.reset();
    }

    async fn shutdown(&mut self) {
        let device = self.device.clone();
        self.drop_connection();
        if self.phase == Phase::Scanning {
            if let Err(e) = self.link.stop_scan().await {
                debug!("stop scan on shutdown: {}", e);
            }
        }
        if let Some(device) = device {
            if let Err(e) = self.link.disconnect(&device).await {
                debug!("disconnect on shutdown: {}", e);
            }
        }
        self.transition(Phase::Idle);
        info!("session closed");
    }

    /// Enter a phase whose public state carries no payload. Readiness goes
    /// through `refresh`, errors through `fail`.
    fn transition(&mut self, phase: Phase) {
        match phase.plain_state() {
            Some(state) => {
                self.phase = phase;
                self.publish(state);
            }
            None => warn!("{:?} can't be entered directly", phase),
        }
    }

    fn fail(&mut self, kind: FaultKind, msg: String) {
        self.phase = Phase::Error;
        self.publish(PrinterState::Error(Fault::new(kind, msg)));
    }

    fn add_observer(&mut self, tx: mpsc::UnboundedSender<PrinterState>) {
        if tx.send(self.state.borrow().clone()).is_ok() {
            self.observers.push(tx);
        }
    }

    fn publish(&mut self, state: PrinterState) {
        if *self.state.borrow() == state {
            return;
        }
        info!("state -> {}", state);
        self.observers.retain(|o| o.send(state.clone()).is_ok());
        self.state.send_replace(state);
    }
}

impl SessionHandle {
    pub fn state(&self) -> PrinterState {
        self.state.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<PrinterState> {
        self.state.clone()
    }

    /// Unbounded stream of every state change, starting with the current one.
    pub async fn observe(&self) -> Result<mpsc::UnboundedReceiver<PrinterState>, PrintError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.commands
            .send(Command::Observe(tx))
            .await
            .map_err(|_| PrintError::SessionClosed)?;
        Ok(rx)
    }

    pub async fn wait_for(
        &self,
        mut f: impl FnMut(&PrinterState) -> bool,
    ) -> Result<PrinterState, PrintError> {
        let mut rx = self.state.clone();
        let state = rx
            .wait_for(|s| f(s))
            .await
            .map_err(|_| PrintError::SessionClosed)?
            .clone();
        Ok(state)
    }

    /// Wait for `Ready`. Gives up with [`PrintError::Faulted`] on a fault the
    /// session won't get past by itself; other faults are waited out.
    pub async fn wait_ready(&self) -> Result<ReadyPrinter, PrintError> {
        let state = self
            .wait_for(|s| match s {
                PrinterState::Ready(_) => true,
                PrinterState::Error(fault) => fault.is_terminal(),
                _ => false,
            })
            .await?;
        match state {
            PrinterState::Ready(printer) => Ok(printer),
            PrinterState::Error(fault) => Err(PrintError::Faulted(fault)),
            _ => Err(PrintError::NotReady),
        }
    }

    /// Print with whatever capability the current state carries.
    pub async fn print(&self, job: PrintJob) -> Result<(), PrintError> {
        match self.state() {
            PrinterState::Ready(printer) => printer.print(job).await,
            PrinterState::Printing => Err(PrintError::Busy),
            _ => Err(PrintError::NotReady),
        }
    }
}

/// Pick where commands go. Positional selection is kept for firmware that
/// only works that way, but a non-writable pick is still refused.
pub fn select_write_target(
    chars: &[CharacteristicInfo],
    selection: WriteSelection,
) -> Result<&CharacteristicInfo, String> {
    if chars.is_empty() {
        return Err("No characteristics found".into());
    }

    match selection {
        WriteSelection::Positional => match chars.get(1) {
            Some(c) if c.can_write() => Ok(c),
            Some(c) => Err(format!("characteristic {} is not writable", c.uuid)),
            None => Err(format!("expected 2 characteristics, found {}", chars.len())),
        },
        WriteSelection::Capability => {
            let both = CharProps::WRITE | CharProps::WRITE_WITHOUT_RESPONSE;
            chars
                .iter()
                .find(|c| c.properties.contains(both))
                .or_else(|| {
                    chars
                        .iter()
                        .find(|c| c.properties.contains(CharProps::WRITE_WITHOUT_RESPONSE))
                })
                .or_else(|| chars.iter().find(|c| c.can_write()))
                .ok_or_else(|| "no writable characteristic".to_string())
        }
    }
}

async fn poll<L: RadioLink>(
    link: Arc<L>,
    device: L::DeviceId,
    target: CharacteristicInfo,
    period: Duration,
) {
    let mut ticker = tokio::time::interval(period);
    loop {
        ticker.tick().await;
        for query in Query::CYCLE {
            trace!("poll {:?}", query);
            let kind = WriteKind::acked(query.wants_ack());
            if let Err(e) = link.write(&device, &target, query.bytes(), kind).await {
                warn!("{:?} query failed: {}", query, e);
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn stream_job<L: RadioLink>(
    link: Arc<L>,
    device: L::DeviceId,
    target: CharacteristicInfo,
    data: Vec<u8>,
    chunk_size: usize,
    delay: Duration,
    done: mpsc::UnboundedSender<TaskEvent>,
    id: u64,
) {
    for dat in data.chunks(chunk_size.max(1)) {
        trace!("CMD {:02x?}", dat);
        if let Err(e) = link.write(&device, &target, dat, WriteKind::WithoutResponse).await {
            let _ = done.send(TaskEvent::StreamFailed(id, e));
            return;
        }
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
    let _ = done.send(TaskEvent::Streamed(id));
}

async fn next_frame(frames: &mut Option<Frames>) -> Option<Vec<u8>> {
    match frames {
        Some(frames) => frames.next().await,
        None => std::future::pending().await,
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
