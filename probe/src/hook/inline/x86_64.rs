use iced_x86::{
    BlockEncoder, BlockEncoderOptions, Code, Decoder, DecoderOptions, FlowControl, Instruction,
    InstructionBlock,
};

use super::{discard, readable, seal, trampoline_page, unsupported, Layout};
use crate::error::HookError;

/// `jmp $`
pub(super) const PARK: &[u8] = &[0xeb, 0xfe];

const REL32_REACH: usize = 0x7fff_0000;
const JMP_REL32_LEN: usize = 5;
/// `jmp qword ptr [rip]` followed by the absolute target.
const JMP_ABS_LEN: usize = 14;
/// The relay at the start of the trampoline page, padded.
const RELAY_LEN: usize = 16;
/// Instructions decoded past the displaced ones, looking for branches back into them.
const SCAN_AFTER: usize = 32;

/// # Safety
///
/// `entry` must be writable and `head` two bytes long.
pub(super) unsafe fn store_head(entry: usize, head: &[u8]) {
    let value = u16::from_ne_bytes([head[0], head[1]]);
    if entry % 2 == 0 {
        (*(entry as *const std::sync::atomic::AtomicU16))
            .store(value, std::sync::atomic::Ordering::SeqCst);
    } else {
        // Unaligned stores that do not cross a cache line are atomic.
        (entry as *mut u16).write_unaligned(value);
    }
}

pub(super) fn prepare(name: &str, entry: usize, handler: usize) -> Result<Layout, HookError> {
    if entry % 64 == 63 {
        return Err(unsupported(name, entry, "entry straddles a cache line"));
    }
    let (page, near) = trampoline_page(entry, REL32_REACH)?;
    let layout = build(name, entry, handler, page, near);
    if layout.is_err() {
        discard(page);
    }
    layout
}

fn build(
    name: &str,
    entry: usize,
    handler: usize,
    page: usize,
    near: bool,
) -> Result<Layout, HookError> {
    let patch = if !near {
        jmp_abs(handler)
    } else if let Some(jump) = jmp_rel32(entry, handler) {
        jump
    } else {
        // Through the relay at the start of the page.
        jmp_rel32(entry, page).ok_or_else(|| unsupported(name, entry, "relay out of reach"))?
    };

    let code = readable(name, entry, 64)?;
    let (displaced, len) =
        displaced_instructions(code, entry as u64, patch.len()).map_err(|r| unsupported(name, entry, r))?;

    let trampoline = page + RELAY_LEN;
    let mut block = displaced;
    let back = Instruction::with_branch(Code::Jmp_rel32_64, (entry + len) as u64)
        .map_err(|err| unsupported(name, entry, err.to_string()))?;
    block.push(back);
    let relocated = BlockEncoder::encode(
        64,
        InstructionBlock::new(&block, trampoline as u64),
        BlockEncoderOptions::NONE,
    )
    .map_err(|err| unsupported(name, entry, format!("cannot relocate prologue: {}", err)))?
    .code_buffer;
    if RELAY_LEN + relocated.len() > crate::memory::page_size() {
        return Err(unsupported(name, entry, "relocated prologue too large"));
    }

    let mut contents = jmp_abs(handler);
    contents.resize(RELAY_LEN, 0xcc);
    contents.extend_from_slice(&relocated);
    seal(page, 0, &contents)?;

    Ok(Layout { patch, trampoline })
}

/// `jmp rel32` from `from` to `to`, if in range.
fn jmp_rel32(from: usize, to: usize) -> Option<Vec<u8>> {
    let delta = (to as i64).wrapping_sub((from + JMP_REL32_LEN) as i64);
    let delta = i32::try_from(delta).ok()?;
    let mut jump = vec![0xe9];
    jump.extend_from_slice(&delta.to_le_bytes());
    Some(jump)
}

fn jmp_abs(to: usize) -> Vec<u8> {
    let mut jump = vec![0xff, 0x25, 0, 0, 0, 0];
    jump.extend_from_slice(&(to as u64).to_le_bytes());
    debug_assert_eq!(jump.len(), JMP_ABS_LEN);
    jump
}

/// Decode whole instructions covering at least `needed` bytes from `ip`.
///
/// Returns the instructions and the number of bytes they occupy.
fn displaced_instructions(
    code: &[u8],
    ip: u64,
    needed: usize,
) -> Result<(Vec<Instruction>, usize), String> {
    let mut decoder = Decoder::with_ip(64, code, ip, DecoderOptions::NONE);
    let mut displaced = Vec::new();
    let mut len = 0;
    while len < needed {
        if !decoder.can_decode() {
            return Err(format!("function too short: {} of {} bytes", len, needed));
        }
        let instruction = decoder.decode();
        if instruction.is_invalid() {
            return Err(format!("invalid instruction at {:#x}", instruction.ip()));
        }
        len += instruction.len();
        let ends = matches!(
            instruction.flow_control(),
            FlowControl::Return
                | FlowControl::UnconditionalBranch
                | FlowControl::IndirectBranch
                | FlowControl::Interrupt
                | FlowControl::Exception
        );
        displaced.push(instruction);
        if ends && len < needed {
            return Err(format!("function too short: ends after {} bytes", len));
        }
    }

    let inside = ip + 1..ip + len as u64;
    let mut after = Vec::new();
    while decoder.can_decode() && after.len() < SCAN_AFTER {
        let instruction = decoder.decode();
        if instruction.is_invalid() {
            break;
        }
        after.push(instruction);
    }
    for instruction in displaced.iter().chain(after.iter()) {
        let branches = matches!(
            instruction.flow_control(),
            FlowControl::ConditionalBranch | FlowControl::UnconditionalBranch | FlowControl::Call
        );
        if branches && inside.contains(&instruction.near_branch_target()) {
            return Err(format!(
                "{:#x} branches into the displaced bytes",
                instruction.ip()
            ));
        }
    }
    Ok((displaced, len))
}

#[cfg(test)]
mod tests {
    use super::*;

    const IP: u64 = 0x40_1000;

    #[test]
    fn test_displaces_whole_instructions() {
        // push rbp; mov rbp, rsp; sub rsp, 0x10; ret
        let code = [0x55, 0x48, 0x89, 0xe5, 0x48, 0x83, 0xec, 0x10, 0xc3];
        let (displaced, len) = displaced_instructions(&code, IP, JMP_REL32_LEN).unwrap();
        assert_eq!(displaced.len(), 3);
        assert_eq!(len, 8);
    }

    #[test]
    fn test_rejects_short_function() {
        // xor eax, eax; ret; int3...
        let code = [0x31, 0xc0, 0xc3, 0xcc, 0xcc, 0xcc, 0xcc, 0xcc];
        let err = displaced_instructions(&code, IP, JMP_REL32_LEN).unwrap_err();
        assert!(err.contains("function too short"), "{}", err);
    }

    #[test]
    fn test_rejects_branch_into_displaced_bytes() {
        // je +1; nop; nop; nop; nop; nop; ret
        let code = [0x74, 0x01, 0x90, 0x90, 0x90, 0x90, 0x90, 0xc3];
        let err = displaced_instructions(&code, IP, JMP_REL32_LEN).unwrap_err();
        assert!(err.contains("branches into"), "{}", err);
    }

    #[test]
    fn test_branch_encodings() {
        assert_eq!(jmp_rel32(0x1000, 0x1005).unwrap(), vec![0xe9, 0, 0, 0, 0]);
        assert_eq!(jmp_rel32(0x1000, 0x1000).unwrap(), vec![0xe9, 0xfb, 0xff, 0xff, 0xff]);
        assert!(jmp_rel32(0x1000, 0x1_0000_1000).is_none());
        let abs = jmp_abs(0x1122_3344_5566_7788);
        assert_eq!(abs.len(), JMP_ABS_LEN);
        assert_eq!(&abs[6..], &0x1122_3344_5566_7788u64.to_le_bytes());
    }
}
