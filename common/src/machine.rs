use crate::{
    conditions::{can_start, is_finished},
    state::DeviceState,
    types::ControlState,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Start,
    Finish,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Guard {
    CanStart,
    IsFinished,
}

impl Guard {
    fn holds(self, state: &DeviceState) -> bool {
        match self {
            Self::CanStart => can_start(state),
            Self::IsFinished => is_finished(state),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryAction {
    StartProgram,
    ProgramFinished,
}

#[derive(Debug, Clone, Copy)]
struct Transition {
    trigger: Trigger,
    source: ControlState,
    dest: Option<ControlState>,
    guard: Option<Guard>,
}

// A `None` destination is an internal transition: matched, but nothing changes.
const TRANSITIONS: [Transition; 4] = [
    Transition {
        trigger: Trigger::Start,
        source: ControlState::Start,
        dest: None,
        guard: None,
    },
    Transition {
        trigger: Trigger::Start,
        source: ControlState::Idle,
        dest: Some(ControlState::Start),
        guard: Some(Guard::CanStart),
    },
    Transition {
        trigger: Trigger::Finish,
        source: ControlState::Idle,
        dest: None,
        guard: None,
    },
    Transition {
        trigger: Trigger::Finish,
        source: ControlState::Start,
        dest: Some(ControlState::Idle),
        guard: Some(Guard::IsFinished),
    },
];

fn entry_action(state: ControlState) -> EntryAction {
    match state {
        ControlState::Start => EntryAction::StartProgram,
        ControlState::Idle => EntryAction::ProgramFinished,
    }
}

#[derive(Debug, Clone)]
pub struct ControlStateMachine {
    state: ControlState,
}

impl Default for ControlStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl ControlStateMachine {
    pub fn new() -> Self {
        Self {
            state: ControlState::Idle,
        }
    }

    pub fn state(&self) -> ControlState {
        self.state
    }

    pub fn next_trigger(&self) -> Trigger {
        match self.state {
            ControlState::Idle => Trigger::Start,
            ControlState::Start => Trigger::Finish,
        }
    }

    pub fn trigger(&mut self, trigger: Trigger, snapshot: &DeviceState) -> Option<EntryAction> {
        let transition = TRANSITIONS
            .iter()
            .find(|transition| transition.trigger == trigger && transition.source == self.state)?;

        let dest = transition.dest?;
        if let Some(guard) = transition.guard {
            if !guard.holds(snapshot) {
                return None;
            }
        }

        self.state = dest;
        Some(entry_action(dest))
    }

    pub fn reset(&mut self) {
        self.state = ControlState::Idle;
    }
}
