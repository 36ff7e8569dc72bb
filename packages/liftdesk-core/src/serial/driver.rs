//! PanelDriver - the read loop and command path for one session
//!
//! A single task owns the session and runs a `tokio::select!` loop over:
//! - cancellation (`PanelHandle::request_stop`)
//! - the handshake deadline while awaiting the ack
//! - the staleness watchdog
//! - operator commands arriving on the handle
//! - the next chunk from the reader (paused while waiting to retry)
//!
//! Whatever ends the loop, teardown runs exactly once: the session is
//! closed, the reassembler cleared, the state machines reset and the
//! emitter told the final status.

use super::codec::{CodecError, Command, Decoder, ProtocolEvent};
use super::handshake::{Gate, Handshake, HandshakeState, DEFAULT_HANDSHAKE_TIMEOUT};
use super::homing::{HomingMachine, HomingState, SetPositionAction};
use super::profile::ProtocolProfile;
use super::reassembler::LineReassembler;
use super::session::{Chunk, Session, DEFAULT_STALE_AFTER};
use super::transport::{Connector, TransportError};
use crate::telemetry::{RegulatorSnapshot, TelemetrySample};
use crate::{format_percent, ConnectionStatus, PanelEvent, RegulatorTerms};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Trait for pushing panel updates to a frontend (adapter pattern).
pub trait PanelEmitter: Send + Sync {
    fn emit_status(&self, status: ConnectionStatus);

    fn emit_event(&self, event: PanelEvent);

    /// Human-readable failure the operator should see
    fn emit_error(&self, error: String);
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PanelError {
    #[error("Already connected. Disconnect first.")]
    AlreadyConnected,
    #[error("Not connected")]
    NotConnected,
    #[error("Device has not acknowledged the handshake yet")]
    NotReady,
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("Session ended")]
    SessionEnded,
}

/// Operator commands accepted by a running driver.
#[derive(Debug, Clone, PartialEq)]
pub enum DriverCommand {
    /// Move to a target position, 0-100
    SetTarget(u8),
    /// Context-sensitive homing step: min, then max, then nothing
    SetPosition,
    SetMin,
    SetMax,
    Calibrate,
    Motor(bool),
    /// Send P, S and D with a short pause between lines
    Regulator(RegulatorTerms),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOutcome {
    Sent,
    /// Nothing to send in the current state (e.g. already homed)
    Skipped,
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionEnd {
    Requested,
    EndOfStream,
    DeviceLost,
    HandshakeTimeout,
    HandshakeWriteFailed,
    Stale,
}

impl SessionEnd {
    pub fn status(&self) -> ConnectionStatus {
        match self {
            SessionEnd::Requested => ConnectionStatus::Disconnected,
            SessionEnd::HandshakeTimeout | SessionEnd::HandshakeWriteFailed => {
                ConnectionStatus::HandshakeFailed
            }
            SessionEnd::EndOfStream | SessionEnd::DeviceLost | SessionEnd::Stale => {
                ConnectionStatus::ConnectionLost
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub profile: ProtocolProfile,

    /// How long the device gets to acknowledge the handshake
    pub handshake_timeout: Duration,

    /// No data for longer than this while established ends the session
    pub stale_after: Duration,

    /// How often staleness is checked
    pub watchdog_interval: Duration,

    /// Wait before reading again after a transient read error
    pub read_retry_delay: Duration,

    /// Pause between lines of a multi-line command
    pub inter_command_delay: Duration,

    pub command_buffer: usize,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            profile: ProtocolProfile::default(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            stale_after: DEFAULT_STALE_AFTER,
            watchdog_interval: Duration::from_secs(5),
            read_retry_delay: Duration::from_secs(1),
            inter_command_delay: Duration::from_millis(50),
            command_buffer: 32,
        }
    }
}

impl DriverConfig {
    pub fn with_profile(profile: ProtocolProfile) -> Self {
        Self {
            profile,
            ..Self::default()
        }
    }
}

/// Upper bound on chunks taken in one pass before a timer decision
const READY_DRAIN_LIMIT: usize = 64;

struct Request {
    command: DriverCommand,
    reply: oneshot::Sender<Result<CommandOutcome, PanelError>>,
}

/// Cloneable handle to a running driver.
#[derive(Clone)]
pub struct PanelHandle {
    tx: mpsc::Sender<Request>,
    cancel: CancellationToken,
}

impl PanelHandle {
    /// Queue a command and wait for the driver's answer.
    pub async fn send(&self, command: DriverCommand) -> Result<CommandOutcome, PanelError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Request { command, reply })
            .await
            .map_err(|_| PanelError::SessionEnded)?;
        rx.await.map_err(|_| PanelError::SessionEnded)?
    }

    /// Ask the read loop to stop; teardown happens on the driver task.
    pub fn request_stop(&self) {
        self.cancel.cancel();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopState {
    Running,
    /// Transient read error; reading resumes at the instant
    RetryWait(Instant),
    Stopping,
    Stopped,
}

pub struct PanelDriver {
    session: Session,
    reassembler: LineReassembler,
    decoder: Decoder,
    handshake: Handshake,
    homing: HomingMachine,
    config: DriverConfig,
    command_rx: mpsc::Receiver<Request>,
    cancel: CancellationToken,
    loop_state: LoopState,
    target: f64,
    actual: f64,
    regulator: RegulatorSnapshot,
}

impl PanelDriver {
    /// Open the device. Returns the driver and a handle for sending it commands.
    pub async fn connect(
        connector: &dyn Connector,
        config: DriverConfig,
    ) -> Result<(Self, PanelHandle), PanelError> {
        let decoder = Decoder::new(&config.profile)?;
        let mut session = Session::open(connector, config.stale_after).await?;
        session.touch();

        let (tx, command_rx) = mpsc::channel(config.command_buffer.max(1));
        let cancel = CancellationToken::new();

        log::info!(
            "[driver] connected to {} using the {} profile",
            session.device(),
            config.profile.name
        );

        Ok((
            Self {
                session,
                reassembler: LineReassembler::new(),
                decoder,
                handshake: Handshake::new(config.handshake_timeout),
                homing: HomingMachine::new(),
                config,
                command_rx,
                cancel: cancel.clone(),
                loop_state: LoopState::Running,
                target: 0.0,
                actual: 0.0,
                regulator: RegulatorSnapshot::default(),
            },
            PanelHandle { tx, cancel },
        ))
    }

    pub fn handshake_state(&self) -> HandshakeState {
        self.handshake.state()
    }

    pub fn homing_state(&self) -> HomingState {
        self.homing.state()
    }

    pub fn is_session_open(&self) -> bool {
        self.session.is_open()
    }

    /// Run the session to completion.
    ///
    /// Sends the handshake (if the profile has one), then processes inbound
    /// data and commands until cancelled, the device goes away, the
    /// handshake times out or the link goes stale.
    pub async fn run<E: PanelEmitter + ?Sized>(&mut self, emitter: &E) -> SessionEnd {
        if self.loop_state == LoopState::Stopped {
            return SessionEnd::Requested;
        }

        emitter.emit_status(ConnectionStatus::Connecting);
        let end = match self.start_handshake(emitter).await {
            Ok(()) => self.event_loop(emitter).await,
            Err(end) => end,
        };
        self.teardown(end, emitter).await;
        end
    }

    async fn start_handshake<E: PanelEmitter + ?Sized>(
        &mut self,
        emitter: &E,
    ) -> Result<(), SessionEnd> {
        if !self.config.profile.has_handshake() {
            self.handshake.establish();
            self.on_established(emitter);
            return Ok(());
        }

        let line = Command::Handshake.encode(&self.config.profile).map_err(|e| {
            emitter.emit_error(e.to_string());
            SessionEnd::HandshakeWriteFailed
        })?;
        if let Err(e) = self.session.write(line.as_bytes()).await {
            log::error!("[driver] failed to send handshake: {}", e);
            emitter.emit_error(format!("Failed to send handshake: {}", e));
            return Err(SessionEnd::HandshakeWriteFailed);
        }
        self.handshake.begin(Instant::now());
        log::debug!("[driver] handshake sent, waiting for ack");
        Ok(())
    }

    async fn event_loop<E: PanelEmitter + ?Sized>(&mut self, emitter: &E) -> SessionEnd {
        let interval = self.config.watchdog_interval;
        let mut watchdog = tokio::time::interval_at(Instant::now() + interval, interval);
        watchdog.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let far_future = Instant::now() + Duration::from_secs(3600);
            let handshake_deadline = self.handshake.deadline();
            let retry_at = match self.loop_state {
                LoopState::RetryWait(at) => Some(at),
                _ => None,
            };

            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    log::info!("[driver] stop requested");
                    return SessionEnd::Requested;
                }

                _ = tokio::time::sleep_until(handshake_deadline.unwrap_or(far_future)), if handshake_deadline.is_some() => {
                    if let Some(end) = self.on_handshake_deadline(emitter).await {
                        return end;
                    }
                }

                _ = watchdog.tick() => {
                    if let Some(end) = self.on_watchdog_tick(emitter).await {
                        return end;
                    }
                }

                _ = tokio::time::sleep_until(retry_at.unwrap_or(far_future)), if retry_at.is_some() => {
                    self.loop_state = LoopState::Running;
                }

                request = self.command_rx.recv() => {
                    match request {
                        Some(Request { command, reply }) => {
                            let result = self.handle_command(command, emitter).await;
                            let _ = reply.send(result);
                        }
                        None => {
                            log::info!("[driver] all handles dropped, stopping");
                            return SessionEnd::Requested;
                        }
                    }
                }

                read = self.session.read_chunk(), if retry_at.is_none() => {
                    if let Some(end) = self.on_read(read, emitter) {
                        return end;
                    }
                }
            }
        }
    }

    /// Handle one read result. Returns why the session ends, if it does.
    fn on_read<E: PanelEmitter + ?Sized>(
        &mut self,
        read: Result<Chunk, TransportError>,
        emitter: &E,
    ) -> Option<SessionEnd> {
        match read {
            Ok(Chunk::Data(bytes)) => {
                self.on_chunk(&bytes, emitter);
                None
            }
            Ok(Chunk::EndOfStream) => {
                log::info!("[driver] reader closed by the device");
                Some(SessionEnd::EndOfStream)
            }
            Err(e) if e.is_device_lost() => {
                log::error!("[driver] device lost: {}", e);
                emitter.emit_error(format!("Device disconnected: {}", e));
                Some(SessionEnd::DeviceLost)
            }
            Err(e) => {
                log::warn!(
                    "[driver] read error, retrying in {:?}: {}",
                    self.config.read_retry_delay,
                    e
                );
                self.loop_state = LoopState::RetryWait(Instant::now() + self.config.read_retry_delay);
                None
            }
        }
    }

    /// Process chunks that are already waiting, without suspending.
    ///
    /// Timer branches call this first so data that arrived before the timer
    /// fired is not mistaken for silence.
    async fn drain_ready<E: PanelEmitter + ?Sized>(&mut self, emitter: &E) -> Option<SessionEnd> {
        for _ in 0..READY_DRAIN_LIMIT {
            if self.loop_state != LoopState::Running {
                break;
            }
            match tokio::time::timeout(Duration::ZERO, self.session.read_chunk()).await {
                Ok(read) => {
                    if let Some(end) = self.on_read(read, emitter) {
                        return Some(end);
                    }
                }
                Err(_) => break,
            }
        }
        None
    }

    async fn on_handshake_deadline<E: PanelEmitter + ?Sized>(
        &mut self,
        emitter: &E,
    ) -> Option<SessionEnd> {
        if let Some(end) = self.drain_ready(emitter).await {
            return Some(end);
        }
        if self.handshake.check_timeout(Instant::now()) {
            log::warn!("[driver] no handshake ack within {:?}", self.config.handshake_timeout);
            emitter.emit_error("Handshake timed out: the device did not respond".to_string());
            return Some(SessionEnd::HandshakeTimeout);
        }
        None
    }

    async fn on_watchdog_tick<E: PanelEmitter + ?Sized>(
        &mut self,
        emitter: &E,
    ) -> Option<SessionEnd> {
        if !self.handshake.is_established() {
            return None;
        }
        if let Some(end) = self.drain_ready(emitter).await {
            return Some(end);
        }
        if self.session.is_stale(Instant::now()) {
            log::warn!(
                "[driver] no data for more than {:?}, closing",
                self.session.stale_after()
            );
            return Some(SessionEnd::Stale);
        }
        None
    }

    fn on_chunk<E: PanelEmitter + ?Sized>(&mut self, bytes: &[u8], emitter: &E) {
        for record in self.reassembler.feed(bytes) {
            self.dispatch_record(&record, emitter);
        }
    }

    fn dispatch_record<E: PanelEmitter + ?Sized>(&mut self, record: &str, emitter: &E) {
        let is_ack = self.decoder.is_ack(record);
        match self.handshake.on_record(is_ack) {
            Gate::Discard => {
                log::debug!("[driver] discarding record before handshake: {:?}", record);
            }
            Gate::Acknowledged => {
                log::info!("[driver] handshake acknowledged");
                self.on_established(emitter);
            }
            Gate::Forward => {
                for event in self.decoder.decode(record) {
                    self.apply_event(event, emitter);
                }
            }
        }
    }

    fn on_established<E: PanelEmitter + ?Sized>(&mut self, emitter: &E) {
        self.homing.reset();
        emitter.emit_status(ConnectionStatus::Connected);
        emitter.emit_event(PanelEvent::Ready);
        emitter.emit_event(PanelEvent::Homing {
            state: self.homing.state(),
        });
    }

    fn apply_event<E: PanelEmitter + ?Sized>(&mut self, event: ProtocolEvent, emitter: &E) {
        match event {
            ProtocolEvent::HeightReading { value } => {
                self.actual = value;
                emitter.emit_event(PanelEvent::Height {
                    value,
                    display: format_percent(value),
                });
                self.record_sample(emitter);
            }
            ProtocolEvent::AngleReading { value } => {
                self.actual = value;
                emitter.emit_event(PanelEvent::Angle {
                    value,
                    display: format_percent(value),
                });
                self.record_sample(emitter);
            }
            ProtocolEvent::RegulatorTerm { which, value } => {
                self.regulator.set(which, value);
                emitter.emit_event(PanelEvent::Regulator { which, value });
            }
            ProtocolEvent::MinPositionConfirmed | ProtocolEvent::MaxPositionConfirmed => {
                if let Some(state) = self.homing.on_event(&event) {
                    log::info!("[driver] homing: {}", state.display_text());
                    emitter.emit_event(PanelEvent::Homing { state });
                }
            }
            ProtocolEvent::MotorStatus { on } => {
                emitter.emit_event(PanelEvent::Motor { on });
            }
            ProtocolEvent::HandshakeAck => {
                log::debug!("[driver] repeated handshake ack ignored");
            }
            ProtocolEvent::Unrecognized { raw } => {
                log::debug!("[driver] unrecognized record: {:?}", raw);
            }
        }
    }

    fn record_sample<E: PanelEmitter + ?Sized>(&self, emitter: &E) {
        let sample = TelemetrySample::now(self.target, self.actual, self.regulator);
        emitter.emit_event(PanelEvent::Sample(sample));
    }

    async fn handle_command<E: PanelEmitter + ?Sized>(
        &mut self,
        command: DriverCommand,
        emitter: &E,
    ) -> Result<CommandOutcome, PanelError> {
        if !self.handshake.is_established() {
            return Err(PanelError::NotReady);
        }

        match command {
            DriverCommand::SetTarget(percent) => {
                let cmd = Command::set_target(percent)?;
                self.send(&cmd, emitter).await?;
                self.target = f64::from(percent);
                self.record_sample(emitter);
                Ok(CommandOutcome::Sent)
            }
            DriverCommand::SetPosition => match self.homing.current_command() {
                SetPositionAction::Send(cmd) => {
                    self.send(&cmd, emitter).await?;
                    Ok(CommandOutcome::Sent)
                }
                SetPositionAction::Disabled => {
                    log::info!("[driver] already homed, set position ignored");
                    Ok(CommandOutcome::Skipped)
                }
            },
            DriverCommand::SetMin | DriverCommand::SetMax if self.homing.is_fully_homed() => {
                log::info!("[driver] already homed, min/max command ignored");
                Ok(CommandOutcome::Skipped)
            }
            DriverCommand::SetMin => self.send(&Command::SetMin, emitter).await,
            DriverCommand::SetMax => self.send(&Command::SetMax, emitter).await,
            DriverCommand::Calibrate => self.send(&Command::Calibrate, emitter).await,
            DriverCommand::Motor(on) => self.send(&Command::Motor(on), emitter).await,
            DriverCommand::Regulator(terms) => {
                let burst = Command::regulator_burst(&terms.clamped());
                self.send_burst(&burst, emitter).await
            }
        }
    }

    async fn send<E: PanelEmitter + ?Sized>(
        &mut self,
        command: &Command,
        emitter: &E,
    ) -> Result<CommandOutcome, PanelError> {
        let line = command.encode(&self.config.profile)?;
        if let Err(e) = self.session.write(line.as_bytes()).await {
            log::warn!("[driver] failed to send {}: {}", command.name(), e);
            emitter.emit_error(format!("Failed to send {}: {}", command.name(), e));
            return Err(e.into());
        }
        log::debug!("[driver] sent {:?}", line.trim_end());
        Ok(CommandOutcome::Sent)
    }

    async fn send_burst<E: PanelEmitter + ?Sized>(
        &mut self,
        commands: &[Command],
        emitter: &E,
    ) -> Result<CommandOutcome, PanelError> {
        for (i, command) in commands.iter().enumerate() {
            if i > 0 {
                tokio::select! {
                    _ = self.cancel.cancelled() => return Err(PanelError::SessionEnded),
                    _ = tokio::time::sleep(self.config.inter_command_delay) => {}
                }
            }
            self.send(command, emitter).await?;
        }
        Ok(CommandOutcome::Sent)
    }

    async fn teardown<E: PanelEmitter + ?Sized>(&mut self, end: SessionEnd, emitter: &E) {
        self.loop_state = LoopState::Stopping;
        self.cancel.cancel();

        self.session.close().await;
        self.reassembler.clear();

        let was_established = self.handshake.is_established();
        if self.handshake.state() != HandshakeState::Failed {
            self.handshake.reset();
        }
        self.homing.reset();

        // Fail anything still queued
        self.command_rx.close();
        while let Ok(request) = self.command_rx.try_recv() {
            let _ = request.reply.send(Err(PanelError::SessionEnded));
        }

        self.loop_state = LoopState::Stopped;
        log::info!("[driver] session ended: {:?}", end);

        emitter.emit_status(end.status());
        if was_established {
            emitter.emit_event(PanelEvent::Homing {
                state: self.homing.state(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serial::testing::{settle, FakeDevice, RecordingEmitter};
    use crate::serial::ReadErrorKind;
    use std::sync::Arc;
    use tokio::task::JoinHandle;

    type Running = JoinHandle<(PanelDriver, SessionEnd)>;

    async fn start(
        device: &FakeDevice,
        config: DriverConfig,
    ) -> (PanelHandle, Arc<RecordingEmitter>, Running) {
        let (mut driver, handle) = PanelDriver::connect(&device.connector(), config)
            .await
            .unwrap();
        let emitter = Arc::new(RecordingEmitter::default());
        let task = tokio::spawn({
            let emitter = Arc::clone(&emitter);
            async move {
                let end = driver.run(emitter.as_ref()).await;
                (driver, end)
            }
        });
        settle().await;
        (handle, emitter, task)
    }

    /// Connect and complete the handshake.
    async fn start_established(
        device: &FakeDevice,
    ) -> (PanelHandle, Arc<RecordingEmitter>, Running) {
        let running = start(device, DriverConfig::default()).await;
        device.push(b"N\n");
        settle().await;
        device.clear_written();
        running
    }

    fn has_event(emitter: &RecordingEmitter, wanted: &PanelEvent) -> bool {
        emitter.events().iter().any(|e| e == wanted)
    }

    #[test]
    fn test_config_default() {
        let config = DriverConfig::default();
        assert_eq!(config.handshake_timeout, Duration::from_millis(3000));
        assert_eq!(config.stale_after, Duration::from_secs(10));
        assert_eq!(config.inter_command_delay, Duration::from_millis(50));
        assert_eq!(config.profile.name, "handshake");
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_timeout_discards_records_and_closes() {
        let device = FakeDevice::new();
        let (_handle, emitter, task) = start(&device, DriverConfig::default()).await;
        assert_eq!(device.written(), vec!["M\n"]);

        // Data before the ack is never dispatched
        device.push(b"HEIGHT:42.5\n");
        settle().await;

        let (driver, end) = task.await.unwrap();
        assert_eq!(end, SessionEnd::HandshakeTimeout);
        assert_eq!(driver.handshake_state(), HandshakeState::Failed);
        assert!(!driver.is_session_open());
        assert!(!device.is_link_open());
        assert_eq!(device.stats().link_closes, 1);

        assert!(emitter.events().is_empty());
        assert_eq!(emitter.last_status(), Some(ConnectionStatus::HandshakeFailed));
        assert!(!emitter.errors().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_establishes_session() {
        let device = FakeDevice::new();
        let (handle, emitter, task) = start_established(&device).await;

        assert_eq!(
            emitter.statuses(),
            vec![ConnectionStatus::Connecting, ConnectionStatus::Connected]
        );
        assert!(has_event(&emitter, &PanelEvent::Ready));
        assert!(has_event(
            &emitter,
            &PanelEvent::Homing {
                state: HomingState::NotStarted
            }
        ));

        handle.request_stop();
        let (_, end) = task.await.unwrap();
        assert_eq!(end, SessionEnd::Requested);
        assert_eq!(emitter.last_status(), Some(ConnectionStatus::Disconnected));
    }

    #[tokio::test(start_paused = true)]
    async fn test_height_reading_updates_display_and_samples() {
        let device = FakeDevice::new();
        let (handle, emitter, task) = start_established(&device).await;

        device.push(b"HEIGHT:42.5\n");
        settle().await;

        assert!(has_event(
            &emitter,
            &PanelEvent::Height {
                value: 42.5,
                display: "42.5%".to_string()
            }
        ));
        let sample = emitter
            .events()
            .into_iter()
            .find_map(|e| match e {
                PanelEvent::Sample(s) => Some(s),
                _ => None,
            })
            .unwrap();
        assert_eq!(sample.actual, 42.5);
        assert_eq!(sample.target, 0.0);

        handle.request_stop();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_motor_status() {
        let device = FakeDevice::new();
        let (handle, emitter, task) = start_established(&device).await;

        // Split across chunks
        device.push(b"Z:");
        device.push(b"1\n");
        settle().await;
        assert!(has_event(&emitter, &PanelEvent::Motor { on: true }));

        handle.request_stop();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_commands_rejected_before_ack() {
        let device = FakeDevice::new();
        let (handle, _emitter, task) = start(&device, DriverConfig::default()).await;

        let result = handle.send(DriverCommand::SetTarget(50)).await;
        assert_eq!(result, Err(PanelError::NotReady));
        assert_eq!(device.written(), vec!["M\n"]);

        handle.request_stop();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_target_sends_and_samples() {
        let device = FakeDevice::new();
        let (handle, emitter, task) = start_established(&device).await;

        device.push(b"HEIGHT:10\n");
        settle().await;

        assert_eq!(
            handle.send(DriverCommand::SetTarget(50)).await,
            Ok(CommandOutcome::Sent)
        );
        assert_eq!(device.written(), vec!["T:50\n"]);

        let last = emitter.events().pop().unwrap();
        match last {
            PanelEvent::Sample(sample) => {
                assert_eq!(sample.target, 50.0);
                assert_eq!(sample.actual, 10.0);
            }
            other => panic!("expected sample, got {:?}", other),
        }

        assert!(matches!(
            handle.send(DriverCommand::SetTarget(101)).await,
            Err(PanelError::Codec(CodecError::TargetOutOfRange(101)))
        ));

        handle.request_stop();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_homing_sequence() {
        let device = FakeDevice::new();
        let (handle, emitter, task) = start_established(&device).await;

        handle.send(DriverCommand::SetPosition).await.unwrap();
        assert_eq!(device.written(), vec!["B\n"]);

        device.push(b"D\n");
        settle().await;
        assert!(has_event(
            &emitter,
            &PanelEvent::Homing {
                state: HomingState::MinSet
            }
        ));

        handle.send(DriverCommand::SetPosition).await.unwrap();
        assert_eq!(device.written(), vec!["B\n", "C\n"]);

        device.push(b"E\n");
        settle().await;
        assert!(has_event(
            &emitter,
            &PanelEvent::Homing {
                state: HomingState::FullyHomed
            }
        ));

        assert_eq!(
            handle.send(DriverCommand::SetPosition).await,
            Ok(CommandOutcome::Skipped)
        );
        assert_eq!(device.written().len(), 2);

        handle.request_stop();
        let (driver, _) = task.await.unwrap();
        assert_eq!(driver.homing_state(), HomingState::NotStarted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_regulator_burst_is_paced() {
        let device = FakeDevice::new();
        let (handle, _emitter, task) = start_established(&device).await;

        let started = Instant::now();
        let outcome = handle
            .send(DriverCommand::Regulator(RegulatorTerms {
                p: 1.5,
                s: 250.0,
                d: 3.0,
            }))
            .await;
        assert_eq!(outcome, Ok(CommandOutcome::Sent));
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert_eq!(device.written(), vec!["P:1.5\n", "S:200\n", "D:3\n"]);

        handle.request_stop();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_regulator_telemetry_included_in_samples() {
        let device = FakeDevice::new();
        let (handle, emitter, task) = start_established(&device).await;

        device.push(b"P:2.5\nHEIGHT:30\n");
        settle().await;

        let sample = emitter
            .events()
            .into_iter()
            .find_map(|e| match e {
                PanelEvent::Sample(s) => Some(s),
                _ => None,
            })
            .unwrap();
        assert_eq!(sample.regulator.and_then(|r| r.p), Some(2.5));

        handle.request_stop();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_staleness_ends_session() {
        let device = FakeDevice::new();
        let (_handle, emitter, task) = start_established(&device).await;

        let (driver, end) = task.await.unwrap();
        assert_eq!(end, SessionEnd::Stale);
        assert!(!driver.is_session_open());
        assert_eq!(driver.handshake_state(), HandshakeState::Idle);
        assert_eq!(driver.homing_state(), HomingState::NotStarted);
        assert_eq!(emitter.last_status(), Some(ConnectionStatus::ConnectionLost));
    }

    #[tokio::test(start_paused = true)]
    async fn test_regular_data_keeps_session_alive() {
        let device = FakeDevice::new();
        let (handle, _emitter, task) = start_established(&device).await;

        for _ in 0..5 {
            tokio::time::sleep(Duration::from_secs(4)).await;
            device.push(b"HEIGHT:1\n");
        }
        settle().await;
        assert!(!task.is_finished());

        handle.request_stop();
        let (_, end) = task.await.unwrap();
        assert_eq!(end, SessionEnd::Requested);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_read_error_retries() {
        let device = FakeDevice::new();
        let (handle, emitter, task) = start_established(&device).await;

        device.push_error(TransportError::Read {
            kind: ReadErrorKind::Transient,
            message: "framing error".to_string(),
        });
        device.push(b"Z:1\n");
        settle().await;
        assert!(!has_event(&emitter, &PanelEvent::Motor { on: true }));

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert!(has_event(&emitter, &PanelEvent::Motor { on: true }));

        handle.request_stop();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_during_retry_wait() {
        let device = FakeDevice::new();
        let (handle, _emitter, task) = start_established(&device).await;

        device.push_error(TransportError::Read {
            kind: ReadErrorKind::Transient,
            message: "framing error".to_string(),
        });
        settle().await;

        let stopped_at = Instant::now();
        handle.request_stop();
        let (_, end) = task.await.unwrap();
        assert_eq!(end, SessionEnd::Requested);
        assert!(stopped_at.elapsed() < Duration::from_millis(500));
        assert!(!device.is_link_open());
    }

    #[tokio::test(start_paused = true)]
    async fn test_device_lost_ends_session() {
        let device = FakeDevice::new();
        let (_handle, emitter, task) = start_established(&device).await;

        device.push_error(TransportError::Read {
            kind: ReadErrorKind::DeviceLost,
            message: "The device has been lost.".to_string(),
        });

        let (_, end) = task.await.unwrap();
        assert_eq!(end, SessionEnd::DeviceLost);
        assert_eq!(emitter.last_status(), Some(ConnectionStatus::ConnectionLost));
        assert!(!device.is_link_open());
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_of_stream_ends_session() {
        let device = FakeDevice::new();
        let (handle, _emitter, task) = start_established(&device).await;

        device.end_stream();
        let (_, end) = task.await.unwrap();
        assert_eq!(end, SessionEnd::EndOfStream);

        // The handle no longer reaches a driver
        assert_eq!(
            handle.send(DriverCommand::Motor(true)).await,
            Err(PanelError::SessionEnded)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_failure_does_not_end_session() {
        let device = FakeDevice::new();
        let (handle, emitter, task) = start_established(&device).await;

        device.fail_writes(Some(TransportError::Write("port busy".to_string())));
        let result = handle.send(DriverCommand::Motor(true)).await;
        assert!(matches!(result, Err(PanelError::Transport(_))));
        assert!(!emitter.errors().is_empty());

        device.fail_writes(None);
        assert_eq!(
            handle.send(DriverCommand::Motor(false)).await,
            Ok(CommandOutcome::Sent)
        );
        assert_eq!(device.written(), vec!["Z:0\n"]);

        handle.request_stop();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_write_failure() {
        let device = FakeDevice::new();
        device.fail_writes(Some(TransportError::Write("port busy".to_string())));
        let (_handle, emitter, task) = start(&device, DriverConfig::default()).await;

        let (_, end) = task.await.unwrap();
        assert_eq!(end, SessionEnd::HandshakeWriteFailed);
        assert_eq!(emitter.last_status(), Some(ConnectionStatus::HandshakeFailed));
        assert!(!device.is_link_open());
    }

    #[tokio::test(start_paused = true)]
    async fn test_classic_profile_is_ready_without_handshake() {
        let device = FakeDevice::new();
        let config = DriverConfig::with_profile(ProtocolProfile::classic());
        let (handle, emitter, task) = start(&device, config).await;

        assert!(device.written().is_empty());
        assert!(has_event(&emitter, &PanelEvent::Ready));

        handle.send(DriverCommand::SetTarget(30)).await.unwrap();
        handle.send(DriverCommand::SetPosition).await.unwrap();
        assert_eq!(device.written(), vec!["A:30\n", "H:0\n"]);

        device.push(b"ok H:0\n");
        settle().await;
        assert!(has_event(
            &emitter,
            &PanelEvent::Homing {
                state: HomingState::MinSet
            }
        ));

        assert!(matches!(
            handle.send(DriverCommand::Calibrate).await,
            Err(PanelError::Codec(CodecError::Unsupported { .. }))
        ));

        handle.request_stop();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_starts_fresh() {
        let device = FakeDevice::new();
        let (handle, _emitter, task) = start_established(&device).await;
        device.push(b"D\n");
        settle().await;
        handle.request_stop();
        task.await.unwrap();

        // Second session: handshake again, homing from scratch
        let (handle, emitter, task) = start(&device, DriverConfig::default()).await;
        assert_eq!(device.stats().opens, 2);
        assert_eq!(device.written(), vec!["M\n"]);
        assert_eq!(
            handle.send(DriverCommand::SetPosition).await,
            Err(PanelError::NotReady)
        );

        device.push(b"N\n");
        settle().await;
        assert_eq!(emitter.last_status(), Some(ConnectionStatus::Connected));
        device.clear_written();
        handle.send(DriverCommand::SetPosition).await.unwrap();
        assert_eq!(device.written(), vec!["B\n"]);

        handle.request_stop();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_during_read_releases_everything() {
        let device = FakeDevice::new();
        let (handle, _emitter, task) = start_established(&device).await;

        handle.request_stop();
        let (driver, end) = task.await.unwrap();
        assert_eq!(end, SessionEnd::Requested);
        assert!(!driver.is_session_open());
        let stats = device.stats();
        assert_eq!(stats.reader_cancels, 1);
        assert_eq!(stats.writer_closes, 1);
        assert_eq!(stats.link_closes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_min_and_max_skipped_once_homed() {
        let device = FakeDevice::new();
        let (handle, _emitter, task) = start_established(&device).await;

        handle.send(DriverCommand::SetPosition).await.unwrap();
        device.push(b"D\n");
        settle().await;
        handle.send(DriverCommand::SetPosition).await.unwrap();
        device.push(b"E\n");
        settle().await;

        assert_eq!(
            handle.send(DriverCommand::SetMin).await,
            Ok(CommandOutcome::Skipped)
        );
        assert_eq!(
            handle.send(DriverCommand::SetMax).await,
            Ok(CommandOutcome::Skipped)
        );
        assert_eq!(device.written(), vec!["B\n", "C\n"]);

        handle.request_stop();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_homing_confirmations_before_ack_are_dropped() {
        let device = FakeDevice::new();
        let (handle, emitter, task) = start(&device, DriverConfig::default()).await;

        device.push(b"D\nHEIGHT:10\n");
        settle().await;
        device.push(b"N\n");
        settle().await;

        assert_eq!(emitter.last_status(), Some(ConnectionStatus::Connected));
        assert!(!has_event(
            &emitter,
            &PanelEvent::Homing {
                state: HomingState::MinSet
            }
        ));
        assert!(!emitter
            .events()
            .iter()
            .any(|e| matches!(e, PanelEvent::Height { .. })));

        // Homing still starts from the minimum
        device.clear_written();
        handle.send(DriverCommand::SetPosition).await.unwrap();
        assert_eq!(device.written(), vec!["B\n"]);

        handle.request_stop();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_waiting_at_deadline_wins() {
        let device = FakeDevice::new();
        let emitter = RecordingEmitter::default();
        let (mut driver, _handle) =
            PanelDriver::connect(&device.connector(), DriverConfig::default())
                .await
                .unwrap();
        driver.start_handshake(&emitter).await.unwrap();

        device.push(b"N\n");
        tokio::time::advance(Duration::from_secs(4)).await;

        assert_eq!(driver.on_handshake_deadline(&emitter).await, None);
        assert_eq!(driver.handshake_state(), HandshakeState::Established);
        assert!(emitter.errors().is_empty());

        driver.teardown(SessionEnd::Requested, &emitter).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_data_waiting_at_watchdog_tick_keeps_session() {
        let device = FakeDevice::new();
        let emitter = RecordingEmitter::default();
        let config = DriverConfig::with_profile(ProtocolProfile::classic());
        let (mut driver, _handle) = PanelDriver::connect(&device.connector(), config)
            .await
            .unwrap();
        driver.start_handshake(&emitter).await.unwrap();

        tokio::time::advance(Duration::from_secs(11)).await;
        device.push(b"Z:1\n");
        assert_eq!(driver.on_watchdog_tick(&emitter).await, None);
        assert!(has_event(&emitter, &PanelEvent::Motor { on: true }));

        // Nothing waiting this time
        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(
            driver.on_watchdog_tick(&emitter).await,
            Some(SessionEnd::Stale)
        );

        driver.teardown(SessionEnd::Stale, &emitter).await;
    }

    #[test]
    fn test_session_end_status() {
        assert_eq!(SessionEnd::Stale.status(), ConnectionStatus::ConnectionLost);
        assert_eq!(
            SessionEnd::HandshakeTimeout.status(),
            ConnectionStatus::HandshakeFailed
        );
        assert_eq!(SessionEnd::Requested.status(), ConnectionStatus::Disconnected);
    }
}
