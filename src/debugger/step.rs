use strum_macros::{Display, EnumString};

/// Kind of a single step, each one is armed by a `GsProcess` message taking the
/// originating frame level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum StepKind {
    /// Step over sends of the current frame.
    Over,
    /// Step into the next send.
    Into,
    /// Step into blocks but not into sends.
    Through,
}

impl StepKind {
    pub fn selector(self) -> &'static str {
        match self {
            StepKind::Over => "gciStepOverFromLevel:",
            StepKind::Into => "gciStepIntoFromLevel:",
            StepKind::Through => "gciStepThruFromLevel:",
        }
    }

    /// Step kind of a debug adapter request.
    pub fn from_dap_command(command: &str) -> Option<Self> {
        match command {
            "next" => Some(StepKind::Over),
            "stepIn" => Some(StepKind::Into),
            "stepOut" => Some(StepKind::Through),
            _ => None,
        }
    }
}
