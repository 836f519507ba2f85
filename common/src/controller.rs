use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use tracing::{debug, error, info, warn};

use crate::{
    config::{OptionMapping, RuntimeConfig},
    error::{ConfigurationError, TransportError},
    machine::{ControlStateMachine, EntryAction},
    schedule::{FinishWindow, PriceFeed, ScheduleOptimizer, SchedulePlan},
    state::{DeviceContext, DeviceState},
    types::{
        CommandPath, ControlState, ControllerStatus, IssuedCommand, ProgramRequest,
        ScheduleDecision,
    },
};

pub trait DeviceTransport {
    fn submit_command(
        &mut self,
        path: CommandPath,
        request: &ProgramRequest,
    ) -> Result<(), TransportError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    Opened,
    StateDelta(Vec<u8>),
    Closed { code: Option<u16>, reason: String },
}

#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub timezone: Tz,
    pub finish_window: FinishWindow,
    pub fallback_duration: Duration,
    pub program_id: u32,
    pub mirrored_options: Vec<OptionMapping>,
}

impl ControllerSettings {
    pub fn from_config(runtime: &RuntimeConfig) -> Result<Self, ConfigurationError> {
        Ok(Self {
            timezone: runtime.tz()?,
            finish_window: runtime.scheduler.finish_window()?,
            fallback_duration: runtime.scheduler.fallback_duration(),
            program_id: runtime.program.program_id,
            mirrored_options: runtime.program.mirrored_options.clone(),
        })
    }
}

pub struct Controller<T> {
    context: DeviceContext,
    machine: ControlStateMachine,
    optimizer: ScheduleOptimizer,
    transport: T,
    price_feed: Option<Box<dyn PriceFeed + Send>>,
    settings: ControllerSettings,
    connected: bool,
    last_plan: Option<SchedulePlan>,
    last_command: Option<IssuedCommand>,
    events_processed: u64,
    malformed_events: u64,
}

impl<T: DeviceTransport> Controller<T> {
    pub fn new(transport: T, settings: ControllerSettings, optimizer: ScheduleOptimizer) -> Self {
        Self {
            context: DeviceContext::new(),
            machine: ControlStateMachine::new(),
            optimizer,
            transport,
            price_feed: None,
            settings,
            connected: false,
            last_plan: None,
            last_command: None,
            events_processed: 0,
            malformed_events: 0,
        }
    }

    pub fn with_price_feed(mut self, feed: Box<dyn PriceFeed + Send>) -> Self {
        self.price_feed = Some(feed);
        self
    }

    pub fn context(&self) -> &DeviceContext {
        &self.context
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn state(&self) -> ControlState {
        self.machine.state()
    }

    pub fn last_plan(&self) -> Option<&SchedulePlan> {
        self.last_plan.as_ref()
    }

    pub fn local_time(&self, instant: DateTime<Utc>) -> DateTime<Tz> {
        instant.with_timezone(&self.settings.timezone)
    }

    pub fn handle_event(&mut self, event: DeviceEvent, now: DateTime<Tz>) -> Result<(), TransportError> {
        match event {
            DeviceEvent::Opened => {
                self.connected = true;
                info!("device connection established");
                Ok(())
            }
            DeviceEvent::Closed { code, reason } => {
                self.connected = false;
                info!(?code, "device connection closed: {reason}");
                Ok(())
            }
            DeviceEvent::StateDelta(raw) => self.handle_delta(&raw, now),
        }
    }

    fn handle_delta(&mut self, raw: &[u8], now: DateTime<Tz>) -> Result<(), TransportError> {
        self.events_processed += 1;

        let outcome = self.context.merge_and_snapshot(raw);
        match outcome.written {
            Ok(0) => {
                debug!("empty state delta ignored");
                return Ok(());
            }
            Ok(written) => debug!(written, "state delta merged"),
            // Still drive the machine: the unchanged state may satisfy a guard.
            Err(err) => {
                self.malformed_events += 1;
                warn!("state delta not merged: {err}");
            }
        }

        let trigger = self.machine.next_trigger();
        match self.machine.trigger(trigger, &outcome.snapshot) {
            Some(EntryAction::StartProgram) => {
                info!("start conditions met");
                self.on_enter_start(&outcome.snapshot, now)
            }
            Some(EntryAction::ProgramFinished) => {
                info!("program finished");
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn on_enter_start(&mut self, snapshot: &DeviceState, now: DateTime<Tz>) -> Result<(), TransportError> {
        let decision = self.plan(snapshot, now);
        if decision == ScheduleDecision::NoEligibleSlot {
            info!("no start slot meets the next deadline, waiting for the next window");
            self.machine.reset();
            return Ok(());
        }

        let request = ProgramRequest::build(
            self.settings.program_id,
            snapshot,
            &self.settings.mirrored_options,
            decision.delay_secs(),
        );
        self.submit(CommandPath::ActivateProgram, request, now)
    }

    pub fn start_program(
        &mut self,
        program_id: u32,
        start_in: Option<u32>,
        now: DateTime<Tz>,
    ) -> Result<ScheduleDecision, TransportError> {
        self.issue(CommandPath::ActivateProgram, program_id, start_in, now)
    }

    pub fn select_program(
        &mut self,
        program_id: u32,
        start_in: Option<u32>,
        now: DateTime<Tz>,
    ) -> Result<ScheduleDecision, TransportError> {
        self.issue(CommandPath::SelectProgram, program_id, start_in, now)
    }

    fn issue(
        &mut self,
        path: CommandPath,
        program_id: u32,
        start_in: Option<u32>,
        now: DateTime<Tz>,
    ) -> Result<ScheduleDecision, TransportError> {
        let snapshot = self.context.snapshot();
        let decision = match start_in.filter(|secs| *secs > 0) {
            Some(secs) => ScheduleDecision::StartIn(secs),
            None => self.plan(&snapshot, now),
        };
        if decision == ScheduleDecision::NoEligibleSlot {
            info!(path = path.as_str(), "command skipped, no eligible start slot");
            return Ok(decision);
        }

        let request = ProgramRequest::build(
            program_id,
            &snapshot,
            &self.settings.mirrored_options,
            decision.delay_secs(),
        );
        self.submit(path, request, now)?;
        Ok(decision)
    }

    fn plan(&mut self, snapshot: &DeviceState, now: DateTime<Tz>) -> ScheduleDecision {
        let duration = snapshot
            .remaining_program_time()
            .unwrap_or(self.settings.fallback_duration);

        let price_feed: Option<&mut (dyn PriceFeed + Send)> = match self.price_feed.as_mut() {
            Some(feed) => Some(feed.as_mut()),
            None => None,
        };
        let plan = self
            .optimizer
            .plan(now, &self.settings.finish_window, duration, price_feed);
        let decision = plan.decision;
        self.last_plan = Some(plan);
        decision
    }

    fn submit(
        &mut self,
        path: CommandPath,
        request: ProgramRequest,
        now: DateTime<Tz>,
    ) -> Result<(), TransportError> {
        if let Err(err) = self.transport.submit_command(path, &request) {
            error!(
                path = path.as_str(),
                program = request.program,
                "command submission failed: {err}"
            );
            return Err(err);
        }

        info!(
            path = path.as_str(),
            program = request.program,
            delay_secs = ?request.start_delay(),
            "command submitted"
        );
        self.last_command = Some(IssuedCommand {
            path,
            request,
            issued_at_epoch: now.timestamp(),
        });
        Ok(())
    }

    pub fn status(&self) -> ControllerStatus {
        let plan = self.last_plan.as_ref();
        ControllerStatus {
            state: self.machine.state().as_str(),
            connected: self.connected,
            last_decision: plan.map(|plan| plan.decision),
            next_deadline_epoch: plan
                .and_then(|plan| plan.deadline)
                .map(|deadline| deadline.timestamp()),
            last_command: self.last_command.clone(),
            events_processed: self.events_processed,
            malformed_events: self.malformed_events,
            device_state: self.context.snapshot(),
            timezone: self.settings.timezone.name().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::SchedulerConfig,
        state::KEY_ACTIVE_PROGRAM,
        types::{ProgramOption, OPTION_START_DELAY},
    };
    use chrono::{NaiveTime, TimeZone};
    use chrono_tz::Europe::Berlin;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[derive(Default)]
    struct RecordingTransport {
        commands: Vec<(CommandPath, ProgramRequest)>,
        fail: bool,
    }

    impl DeviceTransport for RecordingTransport {
        fn submit_command(
            &mut self,
            path: CommandPath,
            request: &ProgramRequest,
        ) -> Result<(), TransportError> {
            if self.fail {
                return Err(TransportError::Disconnected);
            }
            self.commands.push((path, request.clone()));
            Ok(())
        }
    }

    fn settings() -> ControllerSettings {
        ControllerSettings {
            timezone: Berlin,
            finish_window: FinishWindow::new(
                vec![
                    NaiveTime::from_hms_opt(6, 0, 0).unwrap(),
                    NaiveTime::from_hms_opt(18, 30, 0).unwrap(),
                ],
                NaiveTime::from_hms_opt(6, 0, 0).unwrap(),
            ),
            fallback_duration: Duration::from_secs(7_200),
            program_id: 8227,
            mirrored_options: vec![OptionMapping {
                key: "Dishcare.Dishwasher.Option.IntensivZone".to_string(),
                uid: 5124,
            }],
        }
    }

    fn controller(fail: bool) -> Controller<RecordingTransport> {
        Controller::new(
            RecordingTransport {
                fail,
                ..RecordingTransport::default()
            },
            settings(),
            ScheduleOptimizer::new(&SchedulerConfig::default()),
        )
    }

    fn evening() -> DateTime<Tz> {
        Berlin.with_ymd_and_hms(2024, 1, 1, 20, 0, 0).unwrap()
    }

    fn delta(value: serde_json::Value) -> DeviceEvent {
        DeviceEvent::StateDelta(serde_json::to_vec(&value).unwrap())
    }

    fn ready_delta() -> DeviceEvent {
        delta(json!({
            "BSH.Common.Status.DoorState": "Closed",
            "BSH.Common.Status.RemoteControlStartAllowed": true,
            "BSH.Common.Setting.PowerState": "On",
        }))
    }

    #[test]
    fn ready_appliance_is_started_with_delay() {
        let mut controller = controller(false);
        controller.handle_event(ready_delta(), evening()).unwrap();

        assert_eq!(controller.state(), ControlState::Start);
        assert_eq!(
            controller.transport().commands,
            vec![(
                CommandPath::ActivateProgram,
                ProgramRequest {
                    program: 8227,
                    options: vec![ProgramOption {
                        uid: OPTION_START_DELAY,
                        value: 28_800
                    }],
                }
            )]
        );
    }

    #[test]
    fn preconditions_can_arrive_over_several_events() {
        let mut controller = controller(false);
        controller
            .handle_event(
                delta(json!({"BSH.Common.Status.DoorState": "Closed"})),
                evening(),
            )
            .unwrap();
        controller
            .handle_event(
                delta(json!({"BSH.Common.Setting.PowerState": "On"})),
                evening(),
            )
            .unwrap();
        assert_eq!(controller.state(), ControlState::Idle);

        controller
            .handle_event(
                delta(json!({"BSH.Common.Status.RemoteControlStartAllowed": true})),
                evening(),
            )
            .unwrap();
        assert_eq!(controller.state(), ControlState::Start);
        assert_eq!(controller.transport().commands.len(), 1);
    }

    #[test]
    fn repeated_events_do_not_restart() {
        let mut controller = controller(false);
        controller.handle_event(ready_delta(), evening()).unwrap();
        controller.handle_event(ready_delta(), evening()).unwrap();
        controller
            .handle_event(
                delta(json!({"BSH.Common.Status.OperationState": "DelayedStart"})),
                evening(),
            )
            .unwrap();

        assert_eq!(controller.state(), ControlState::Start);
        assert_eq!(controller.transport().commands.len(), 1);
    }

    #[test]
    fn finished_program_returns_to_idle_and_can_restart() {
        let mut controller = controller(false);
        controller.handle_event(ready_delta(), evening()).unwrap();
        controller
            .handle_event(
                delta(json!({
                    "BSH.Common.Status.ActiveProgram": 8227,
                    "BSH.Common.Status.OperationState": "Finished",
                })),
                evening(),
            )
            .unwrap();
        assert_eq!(controller.state(), ControlState::Idle);

        controller
            .handle_event(
                delta(json!({
                    "BSH.Common.Status.ActiveProgram": null,
                    "BSH.Common.Status.OperationState": "Ready",
                })),
                evening(),
            )
            .unwrap();
        assert_eq!(controller.state(), ControlState::Start);
        assert_eq!(controller.transport().commands.len(), 2);
    }

    #[test]
    fn mirrors_active_option_flags() {
        let mut controller = controller(false);
        controller
            .handle_event(
                delta(json!({
                    "BSH.Common.Status.DoorState": "Closed",
                    "BSH.Common.Status.RemoteControlStartAllowed": true,
                    "BSH.Common.Setting.PowerState": "On",
                    "Dishcare.Dishwasher.Option.IntensivZone": true,
                })),
                evening(),
            )
            .unwrap();

        let (_, request) = &controller.transport().commands[0];
        assert_eq!(
            request.options.first(),
            Some(&ProgramOption { uid: 5124, value: 1 })
        );
        assert_eq!(request.start_delay(), Some(28_800));
    }

    #[test]
    fn reported_remaining_time_replaces_fallback_duration() {
        let mut controller = controller(false);
        controller
            .handle_event(
                delta(json!({
                    "BSH.Common.Status.DoorState": "Closed",
                    "BSH.Common.Status.RemoteControlStartAllowed": true,
                    "BSH.Common.Setting.PowerState": "On",
                    "BSH.Common.Option.RemainingProgramTime": 10_800,
                })),
                evening(),
            )
            .unwrap();

        // Deadline 06:00, three hour run: start at 03:00, seven hours from now.
        let (_, request) = &controller.transport().commands[0];
        assert_eq!(request.start_delay(), Some(7 * 3_600));
    }

    #[test]
    fn malformed_delta_is_counted_and_skipped() {
        let mut controller = controller(false);
        controller
            .handle_event(DeviceEvent::StateDelta(b"\"offline\"".to_vec()), evening())
            .unwrap();

        let status = controller.status();
        assert_eq!(status.events_processed, 1);
        assert_eq!(status.malformed_events, 1);
        assert!(status.device_state.is_empty());
        assert_eq!(controller.state(), ControlState::Idle);
    }

    #[test]
    fn empty_delta_is_ignored() {
        let mut controller = controller(false);
        controller
            .handle_event(DeviceEvent::StateDelta(b"{}".to_vec()), evening())
            .unwrap();
        assert_eq!(controller.status().malformed_events, 0);
        assert!(controller.transport().commands.is_empty());
    }

    #[test]
    fn command_failure_is_returned() {
        let mut controller = controller(true);
        let result = controller.handle_event(ready_delta(), evening());

        assert!(matches!(result, Err(TransportError::Disconnected)));
        assert!(controller.status().last_command.is_none());
    }

    #[test]
    fn unreachable_deadline_sends_nothing_and_waits() {
        let mut controller = controller(false);
        let too_late = Berlin.with_ymd_and_hms(2024, 1, 2, 5, 0, 0).unwrap();
        controller.handle_event(ready_delta(), too_late).unwrap();

        assert_eq!(controller.state(), ControlState::Idle);
        assert!(controller.transport().commands.is_empty());
        assert_eq!(
            controller.status().last_decision,
            Some(ScheduleDecision::NoEligibleSlot)
        );

        // Later the evening deadline becomes the target.
        let afternoon = Berlin.with_ymd_and_hms(2024, 1, 2, 14, 0, 0).unwrap();
        controller
            .handle_event(delta(json!({"BSH.Common.Status.DoorState": "Closed"})), afternoon)
            .unwrap();
        assert_eq!(controller.state(), ControlState::Start);
        assert_eq!(
            controller.transport().commands[0].1.start_delay(),
            Some(9_000)
        );
    }

    #[test]
    fn select_program_honours_explicit_delay() {
        let mut controller = controller(false);
        let decision = controller
            .select_program(8195, Some(900), evening())
            .unwrap();

        assert_eq!(decision, ScheduleDecision::StartIn(900));
        assert_eq!(
            controller.transport().commands,
            vec![(
                CommandPath::SelectProgram,
                ProgramRequest {
                    program: 8195,
                    options: vec![ProgramOption {
                        uid: OPTION_START_DELAY,
                        value: 900
                    }],
                }
            )]
        );
        assert_eq!(controller.state(), ControlState::Idle);
    }

    #[test]
    fn start_program_without_delay_asks_optimizer() {
        let mut controller = controller(false);
        let decision = controller.start_program(8227, Some(0), evening()).unwrap();

        assert_eq!(decision, ScheduleDecision::StartIn(28_800));
        assert_eq!(
            controller.transport().commands[0].0,
            CommandPath::ActivateProgram
        );
    }

    #[test]
    fn status_reports_machine_and_deadline() {
        let mut controller = controller(false);
        controller.handle_event(DeviceEvent::Opened, evening()).unwrap();
        controller.handle_event(ready_delta(), evening()).unwrap();

        let status = controller.status();
        assert!(status.connected);
        assert_eq!(status.state, "START");
        assert_eq!(status.timezone, "Europe/Berlin");
        assert_eq!(
            status.next_deadline_epoch,
            Some(Berlin.with_ymd_and_hms(2024, 1, 2, 6, 0, 0).unwrap().timestamp())
        );
        assert_eq!(status.device_state.get(KEY_ACTIVE_PROGRAM), None);

        controller
            .handle_event(
                DeviceEvent::Closed {
                    code: Some(1006),
                    reason: "abnormal closure".to_string(),
                },
                evening(),
            )
            .unwrap();
        assert!(!controller.status().connected);
    }
}
