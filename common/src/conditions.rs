use crate::state::{
    DeviceState, KEY_ACTIVE_PROGRAM, KEY_DOOR_STATE, KEY_OPERATION_STATE, KEY_POWER_STATE,
    KEY_REMOTE_START_ALLOWED,
};

pub fn can_start(state: &DeviceState) -> bool {
    state.get_str(KEY_DOOR_STATE) == Some("Closed")
        && state.get_bool(KEY_REMOTE_START_ALLOWED) == Some(true)
        && state.get(KEY_ACTIVE_PROGRAM).is_none()
        && state.get_str(KEY_POWER_STATE) == Some("On")
}

pub fn is_finished(state: &DeviceState) -> bool {
    state.get_str(KEY_POWER_STATE) == Some("Off")
        || state.get_str(KEY_OPERATION_STATE) == Some("Finished")
}
