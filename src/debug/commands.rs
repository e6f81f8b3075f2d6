//! Debug-command opcodes signaled by the target's trap stubs.

/// Commands the target volunteers by trapping with an opcode byte planted
/// after the marker. Keep in sync with the command stubs in the target
/// build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugCommand {
    /// Polling trap: resume, servicing any queued injected call first.
    Nop,
    /// Publish the callback table address and entry count.
    SetCallbacks,
    /// Register a dedicated stack region for injected calls.
    RegisterAltStack,
}

impl DebugCommand {
    /// Decode the opcode byte that follows the marker.
    pub fn from_opcode(opcode: u8) -> Option<Self> {
        match opcode {
            0 => Some(Self::Nop),
            1 => Some(Self::SetCallbacks),
            2 => Some(Self::RegisterAltStack),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_opcodes_decode() {
        assert_eq!(DebugCommand::from_opcode(0), Some(DebugCommand::Nop));
        assert_eq!(DebugCommand::from_opcode(1), Some(DebugCommand::SetCallbacks));
        assert_eq!(
            DebugCommand::from_opcode(2),
            Some(DebugCommand::RegisterAltStack)
        );
        assert_eq!(DebugCommand::from_opcode(3), None);
        assert_eq!(DebugCommand::from_opcode(0xff), None);
    }
}
