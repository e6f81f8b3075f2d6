//! Wire formats for the debugger REPL.
//!
//! Every interaction with the debugger is text over its stdio: commands
//! written to stdin, output cut into records by the stop patterns. This
//! module owns the pattern strings, the command builders, and the
//! output-line parsers, so the protocol code never touches raw text.

use std::sync::OnceLock;

use crate::channel::Pattern;

use super::registers::RegisterContext;

/// Index of the any-full-line pattern in [`stop_patterns`].
pub const PATTERN_LINE: usize = 0;
/// Index of the idle-prompt pattern in [`stop_patterns`].
pub const PATTERN_PROMPT: usize = 1;

/// Stop patterns for one tick: any text ending in a newline, or an idle
/// REPL prompt (`0:000> ` style: optional digit group and colon, then a
/// digit group and `> ` with its trailing space).
pub fn stop_patterns() -> &'static [Pattern; 2] {
    static PATTERNS: OnceLock<[Pattern; 2]> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            Pattern::new(r".*\n").expect("line pattern"),
            Pattern::new(r"(?:[0-9]+:)?[0-9]+> ").expect("prompt pattern"),
        ]
    })
}

/// Resume execution.
pub const CMD_GO: &str = "g\n";
/// Resume with the current exception marked handled (steps over the trap).
pub const CMD_GO_HANDLED: &str = "gh\n";
/// Dump the eight bytes at the instruction pointer.
pub const CMD_DUMP_TRAP_SITE: &str = "db @rip L8\n";
/// Stack trace, then continue with the exception unhandled.
pub const CMD_STACK_TRACE: &str = "kn; gn\n";
/// First two integer-argument registers.
pub const CMD_READ_ARG_REGISTERS: &str = "r rcx;r rdx\n";
/// First integer-argument register.
pub const CMD_READ_FIRST_ARG: &str = "r rcx\n";
/// Integer return register.
pub const CMD_READ_RETURN: &str = "r rax\n";

/// Marker bytes planted after the int3/jmp pair in the target's command
/// stubs.
pub const COMMAND_MARKER: [u8; 4] = *b"DCMD";

const BYTE_INT3: u8 = 0xcc;
const BYTE_JMP_SHORT: u8 = 0xeb;

/// All integer registers, then each vector register pair one at a time
/// (the only form the REPL prints them in that can be parsed back).
pub fn snapshot_command() -> String {
    let mut cmd = String::from("r;");
    for i in 0..16 {
        cmd.push_str(&format!("r xmm{}:uq;", i));
    }
    cmd.push('\n');
    cmd
}

/// Read `count` pointer-sized values starting at `address`, all on one
/// output line.
pub fn dump_qwords_command(address: u64, count: u32) -> String {
    format!("dq /c{count} {address:x} L{count}\n")
}

/// Launch an injected call: jump to `target`, swing the stack to `frame`,
/// place the arguments, plant the zero sentinel return address so the call
/// re-traps on return, and resume with the trap stepped over.
pub fn launch_call_command(target: u64, frame: u64, flags: u64, args: [u64; 3]) -> String {
    format!(
        "r rip=0x{target:x};r rsp=0x{frame:x};r efl=0x{flags:x};r rcx=0x{a0:x};r rdx=0x{a1:x};r r8=0x{a2:x};eq {frame:x} 0;gh\n",
        a0 = args[0],
        a1 = args[1],
        a2 = args[2],
    )
}

/// Restore the volatile half of a captured context in one command line.
///
/// The callee preserved the non-volatile registers itself; only the
/// volatile set, the stack and instruction pointers, and the flags need to
/// be put back by hand. Vector values are assigned low half first, in
/// decimal, which is the only form the REPL's assignment accepts.
pub fn restore_volatile_command(ctx: &RegisterContext) -> String {
    let mut cmd = format!(
        "r rsp={:016x};r rip={:016x};r efl={:08x};r rcx={:016x};r rdx={:016x};r r8={:016x};r r9={:016x};r r10={:016x};r r11={:016x}",
        ctx.rsp, ctx.rip, ctx.rflags, ctx.rcx, ctx.rdx, ctx.r8, ctx.r9, ctx.r10, ctx.r11
    );
    for i in 0..6 {
        cmd.push_str(&format!(
            ";r xmm{}={} {}",
            i, ctx.xmm_low[i], ctx.xmm_high[i]
        ));
    }
    cmd.push_str(&format!(";r rax={:016x}\n", ctx.rax));
    cmd
}

/// Find `name=<hex>` in an output line and parse the value. Several fields
/// may share one line; the name must sit on a word boundary so `r8` never
/// matches inside another identifier.
pub fn parse_register_field(line: &str, name: &str) -> Option<u64> {
    let bytes = line.as_bytes();
    let mut search = 0;
    while let Some(pos) = line[search..].find(name) {
        let at = search + pos;
        let boundary = at == 0 || !bytes[at - 1].is_ascii_alphanumeric();
        let rest = &line[at + name.len()..];
        if boundary {
            if let Some(hex) = rest.strip_prefix('=') {
                let digits: &str = hex
                    .find(|c: char| !c.is_ascii_hexdigit())
                    .map_or(hex, |end| &hex[..end]);
                if !digits.is_empty() {
                    return u64::from_str_radix(digits, 16).ok();
                }
            }
        }
        search = at + name.len();
    }
    None
}

/// Parse one `xmm<N>=<hex-high> <hex-low>` line as produced by
/// `r xmm<N>:uq`.
pub fn parse_xmm_line(line: &str) -> Option<(usize, u64, u64)> {
    let rest = line.trim().strip_prefix("xmm")?;
    let eq = rest.find('=')?;
    let index: usize = rest[..eq].parse().ok()?;
    if index > 15 {
        return None;
    }
    let mut halves = rest[eq + 1..].split_whitespace();
    let high = u64::from_str_radix(halves.next()?, 16).ok()?;
    let low = u64::from_str_radix(halves.next()?, 16).ok()?;
    Some((index, high, low))
}

/// Parse a pointer-array dump line: an address label, then the values.
/// Every 64-bit value is printed as two backtick-joined 32-bit halves.
pub fn parse_qword_values(line: &str) -> Vec<u64> {
    line.split_whitespace()
        .skip(1)
        .map_while(parse_joined_qword)
        .collect()
}

/// `<8 hex>` backtick `<8 hex>` -> u64.
fn parse_joined_qword(token: &str) -> Option<u64> {
    let (high, low) = token.split_once('`')?;
    let high = u32::from_str_radix(high, 16).ok()?;
    let low = u32::from_str_radix(low, 16).ok()?;
    Some(((high as u64) << 32) | low as u64)
}

/// Inspect a trap-site dump line for the synthetic-command signature:
/// int3, short jmp, one offset byte, the 4-byte marker, then the command
/// opcode. Returns the opcode when the signature is present.
///
/// The dump line renders as an address label followed by space-separated
/// hex byte pairs, then an ASCII gloss:
/// ``00007ff6`6ce72589  cc eb 05 44 43 4d 44 01  ...DCMD.``
pub fn parse_trap_signature(line: &str) -> Option<u8> {
    let mut fields = line.split_whitespace();
    parse_joined_qword(fields.next()?)?;

    let mut bytes = [0u8; 8];
    for slot in bytes.iter_mut() {
        let pair = hex::decode(fields.next()?).ok()?;
        if pair.len() != 1 {
            return None;
        }
        *slot = pair[0];
    }

    if bytes[0] != BYTE_INT3 || bytes[1] != BYTE_JMP_SHORT {
        return None;
    }
    if bytes[3..7] != COMMAND_MARKER {
        return None;
    }
    Some(bytes[7])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trap_signature_decodes_opcodes() {
        let set = "00007ff6`6ce72589  cc eb 05 44 43 4d 44 01  ...DCMD.\n";
        assert_eq!(parse_trap_signature(set), Some(1));

        let nop = "00007ff6`6ce72589  cc eb 05 44 43 4d 44 00  ...DCMD.\n";
        assert_eq!(parse_trap_signature(nop), Some(0));
    }

    #[test]
    fn trap_signature_rejects_foreign_breaks() {
        // Ordinary code at the stop site, not a command stub.
        let code = "00007ff6`6ce71000  48 8b 05 11 22 33 44 55  H.......\n";
        assert_eq!(parse_trap_signature(code), None);

        // int3 without the marker.
        let bare = "00007ff6`6ce71000  cc eb 05 41 41 41 41 00  ...AAAA.\n";
        assert_eq!(parse_trap_signature(bare), None);

        // No address label.
        assert_eq!(parse_trap_signature("cc eb 05 44 43 4d 44 01\n"), None);

        // Truncated dump.
        assert_eq!(parse_trap_signature("00007ff6`6ce72589  cc eb 05\n"), None);
    }

    #[test]
    fn register_fields_parse_from_shared_lines() {
        let line = "rax=0000000000000042 rbx=0000000000001000 rcx=00007ff66ce7d170\n";
        assert_eq!(parse_register_field(line, "rax"), Some(0x42));
        assert_eq!(parse_register_field(line, "rbx"), Some(0x1000));
        assert_eq!(parse_register_field(line, "rcx"), Some(0x7ff6_6ce7_d170));
        assert_eq!(parse_register_field(line, "rdx"), None);
    }

    #[test]
    fn register_names_respect_word_boundaries() {
        let line = " r8=0000000000000008  r9=0000000000000009 r10=000000000000000a\n";
        assert_eq!(parse_register_field(line, "r8"), Some(8));
        assert_eq!(parse_register_field(line, "r9"), Some(9));
        assert_eq!(parse_register_field(line, "r10"), Some(0xa));

        // `efl` sits at the end of the segment-register line.
        let segs = "cs=0033 ss=002b ds=002b es=002b fs=0053 gs=002b  efl=00000246\n";
        assert_eq!(parse_register_field(segs, "efl"), Some(0x246));

        // A name embedded in a longer identifier does not count.
        assert_eq!(parse_register_field("xr8=0000000000000001\n", "r8"), None);
    }

    #[test]
    fn xmm_lines_parse_high_then_low() {
        let line = "xmm5=000000000000000a 0000000000000001\n";
        assert_eq!(parse_xmm_line(line), Some((5, 0xa, 0x1)));

        assert_eq!(parse_xmm_line("xmm16=0 0\n"), None);
        assert_eq!(parse_xmm_line("rax=0000000000000001\n"), None);
    }

    #[test]
    fn qword_dump_parses_all_values_after_the_label() {
        let line = "00007ff6`6ce7d170  00007ff6`6ce72200 00007ff6`6ce72260 00007ff6`6ce71055\n";
        assert_eq!(
            parse_qword_values(line),
            vec![0x7ff6_6ce7_2200, 0x7ff6_6ce7_2260, 0x7ff6_6ce7_1055]
        );
    }

    #[test]
    fn command_builders_render_expected_text() {
        assert_eq!(
            dump_qwords_command(0x7ff66ce7d170, 2),
            "dq /c2 7ff66ce7d170 L2\n"
        );

        let snapshot = snapshot_command();
        assert!(snapshot.starts_with("r;r xmm0:uq;"));
        assert!(snapshot.contains("r xmm15:uq;"));
        assert!(snapshot.ends_with(";\n"));

        let launch = launch_call_command(0x1000, 0x14fe68, 0x246, [7, 0, 0]);
        assert!(launch.starts_with("r rip=0x1000;r rsp=0x14fe68;r efl=0x246;"));
        assert!(launch.contains("r rcx=0x7;r rdx=0x0;r r8=0x0;"));
        assert!(launch.contains(";eq 14fe68 0;"));
        assert!(launch.ends_with(";gh\n"));
    }

    #[test]
    fn restore_touches_only_the_volatile_set() {
        let mut ctx = RegisterContext::default();
        ctx.rsp = 0x14fe98;
        ctx.rip = 0x7ff6_0000_1000;
        ctx.rflags = 0x646;
        ctx.rbx = 0xdead;
        ctx.xmm_low[0] = 17;
        ctx.xmm_high[0] = 16;
        ctx.xmm_low[6] = 99;

        let cmd = restore_volatile_command(&ctx);
        assert!(cmd.starts_with("r rsp=000000000014fe98;r rip=00007ff600001000;r efl=00000646;"));
        for volatile in ["rcx=", "rdx=", "r8=", "r9=", "r10=", "r11="] {
            assert!(cmd.contains(volatile), "missing {volatile}");
        }
        // Low half first, decimal.
        assert!(cmd.contains(";r xmm0=17 16"));
        assert!(cmd.contains(";r xmm5=0 0"));
        // Non-volatile registers are the callee's responsibility.
        for preserved in ["rbx=", "rbp=", "rsi=", "rdi=", "r12=", "r13=", "r14=", "r15=", "xmm6="] {
            assert!(!cmd.contains(preserved), "must not restore {preserved}");
        }
        assert!(cmd.ends_with(";r rax=0000000000000000\n"));
    }
}
