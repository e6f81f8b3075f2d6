//! Captured CPU state for the injected-call round trip.

use super::wire;

/// What one snapshot output line contributed to the context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Absorb {
    /// Nothing recognized on the line.
    None,
    /// One or more integer-register fields.
    Scalar,
    /// A vector register pair.
    Vector { index: usize },
}

/// x64 register snapshot.
///
/// The REPL only ever shows register values as text; they are parsed into
/// integers here once at capture time and formatted back only when a
/// command is written.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegisterContext {
    pub rax: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rbx: u64,
    pub rsp: u64,
    pub rbp: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub rflags: u64,
    /// High 64-bit halves of xmm0-xmm15.
    pub xmm_high: [u64; 16],
    /// Low 64-bit halves of xmm0-xmm15.
    pub xmm_low: [u64; 16],
}

impl RegisterContext {
    /// Fold one line of snapshot output into the context. The bare `r`
    /// command packs several fields per line; the vector registers arrive
    /// one per line afterwards.
    pub fn absorb_line(&mut self, line: &str) -> Absorb {
        if let Some((index, high, low)) = wire::parse_xmm_line(line) {
            self.xmm_high[index] = high;
            self.xmm_low[index] = low;
            return Absorb::Vector { index };
        }

        let mut any = false;
        if let Some(v) = wire::parse_register_field(line, "rax") {
            self.rax = v;
            any = true;
        }
        if let Some(v) = wire::parse_register_field(line, "rcx") {
            self.rcx = v;
            any = true;
        }
        if let Some(v) = wire::parse_register_field(line, "rdx") {
            self.rdx = v;
            any = true;
        }
        if let Some(v) = wire::parse_register_field(line, "rbx") {
            self.rbx = v;
            any = true;
        }
        if let Some(v) = wire::parse_register_field(line, "rsp") {
            self.rsp = v;
            any = true;
        }
        if let Some(v) = wire::parse_register_field(line, "rbp") {
            self.rbp = v;
            any = true;
        }
        if let Some(v) = wire::parse_register_field(line, "rsi") {
            self.rsi = v;
            any = true;
        }
        if let Some(v) = wire::parse_register_field(line, "rdi") {
            self.rdi = v;
            any = true;
        }
        if let Some(v) = wire::parse_register_field(line, "r8") {
            self.r8 = v;
            any = true;
        }
        if let Some(v) = wire::parse_register_field(line, "r9") {
            self.r9 = v;
            any = true;
        }
        if let Some(v) = wire::parse_register_field(line, "r10") {
            self.r10 = v;
            any = true;
        }
        if let Some(v) = wire::parse_register_field(line, "r11") {
            self.r11 = v;
            any = true;
        }
        if let Some(v) = wire::parse_register_field(line, "r12") {
            self.r12 = v;
            any = true;
        }
        if let Some(v) = wire::parse_register_field(line, "r13") {
            self.r13 = v;
            any = true;
        }
        if let Some(v) = wire::parse_register_field(line, "r14") {
            self.r14 = v;
            any = true;
        }
        if let Some(v) = wire::parse_register_field(line, "r15") {
            self.r15 = v;
            any = true;
        }
        if let Some(v) = wire::parse_register_field(line, "rip") {
            self.rip = v;
            any = true;
        }
        if let Some(v) = wire::parse_register_field(line, "efl") {
            self.rflags = v;
            any = true;
        }

        if any {
            Absorb::Scalar
        } else {
            Absorb::None
        }
    }
}
