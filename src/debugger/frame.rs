use crate::debugger::error::Error;
use crate::gci::{Oop, OopKind};

/// Slot positions in the array answered by `GsProcess>>_frameContentsAt:`.
pub mod slot {
    pub const METHOD: usize = 0;
    pub const IP_OFFSET: usize = 1;
    pub const ARG_AND_TEMP_NAMES: usize = 8;
    pub const RECEIVER: usize = 9;
    pub const FIRST_ARG_OR_TEMP: usize = 10;
}

/// Decoded frame contents of one stack level.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameContents {
    pub method: Oop,
    pub ip_offset: i64,
    pub receiver: Oop,
    /// Array of argument and temporary names, nil when the method has none.
    pub names: Oop,
    pub arg_and_temps: Vec<Oop>,
}

impl FrameContents {
    /// Decode a frame array, failing when it is shorter than the fixed layout.
    pub fn from_oops(oops: &[Oop]) -> Result<Self, Error> {
        if oops.len() < slot::FIRST_ARG_OR_TEMP {
            return Err(Error::FrameShape {
                expected: slot::FIRST_ARG_OR_TEMP,
                actual: oops.len(),
            });
        }

        let ip_offset = match oops[slot::IP_OFFSET].kind() {
            OopKind::SmallInt(ip) => ip,
            OopKind::Nil => 0,
            _ => return Err(Error::UnexpectedValue(oops[slot::IP_OFFSET], "ip offset")),
        };

        Ok(Self {
            method: oops[slot::METHOD],
            ip_offset,
            receiver: oops[slot::RECEIVER],
            names: oops[slot::ARG_AND_TEMP_NAMES],
            arg_and_temps: oops[slot::FIRST_ARG_OR_TEMP..].to_vec(),
        })
    }
}

/// Pair names with values. Values without a name get a positional one.
pub fn name_locals(names: &[String], values: &[Oop]) -> Vec<(String, Oop)> {
    values
        .iter()
        .enumerate()
        .map(|(idx, &value)| {
            let name = names
                .get(idx)
                .cloned()
                .unwrap_or_else(|| format!(".t{}", idx + 1));
            (name, value)
        })
        .collect()
}

/// A stack level as presented to a client.
#[derive(Debug, Clone, PartialEq)]
pub struct StackFrameView {
    /// 1-based, 1 is the innermost frame.
    pub level: u32,
    pub name: String,
    pub source_ref: i64,
    pub line: u32,
    pub column: u32,
    pub method: Oop,
}
