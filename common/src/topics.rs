use crate::types::CommandPath;

pub const TOPIC_STATE: &str = "state";
pub const TOPIC_ACTIVE_PROGRAM: &str = "activeProgram";
pub const TOPIC_SELECTED_PROGRAM: &str = "selectedProgram";
pub const TOPIC_AVAILABILITY: &str = "LWT";

pub fn device_topic(prefix: &str, device: &str, leaf: &str) -> String {
    format!("{prefix}/{device}/{leaf}")
}

pub fn command_topic(prefix: &str, device: &str, path: CommandPath) -> String {
    let leaf = match path {
        CommandPath::SelectProgram => TOPIC_SELECTED_PROGRAM,
        CommandPath::ActivateProgram => TOPIC_ACTIVE_PROGRAM,
    };
    device_topic(prefix, device, leaf)
}
