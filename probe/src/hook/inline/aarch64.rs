use super::{discard, readable, seal, trampoline_page, unsupported, Layout};
use crate::error::HookError;

/// `b .`
pub(super) const PARK: &[u8] = &[0x00, 0x00, 0x00, 0x14];

const B_REACH: usize = 0x07ff_0000;
/// `ldr x17, #8; br x17; .quad target`
const JMP_ABS_WORDS: usize = 4;
const RELAY_LEN: usize = 16;
const SCAN_AFTER: usize = 16;

const LDR_X17_8: u32 = 0x5800_0051;
const BR_X17: u32 = 0xd61f_0220;
const BLR_X17: u32 = 0xd63f_0220;

/// # Safety
///
/// `entry` must be writable, word aligned, and `head` four bytes long.
pub(super) unsafe fn store_head(entry: usize, head: &[u8]) {
    let value = u32::from_le_bytes([head[0], head[1], head[2], head[3]]);
    (*(entry as *const std::sync::atomic::AtomicU32))
        .store(value, std::sync::atomic::Ordering::SeqCst);
}

pub(super) fn prepare(name: &str, entry: usize, handler: usize) -> Result<Layout, HookError> {
    if entry % 4 != 0 {
        return Err(unsupported(name, entry, "entry is not word aligned"));
    }
    let (page, near) = trampoline_page(entry, B_REACH)?;
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
    let redirect = if let Some(branch) = b(entry, handler) {
        vec![branch]
    } else if let (true, Some(branch)) = (near, b(entry, page)) {
        vec![branch]
    } else {
        jmp_abs(handler)
    };

    let code = readable(name, entry, (redirect.len() + SCAN_AFTER) * 4)?;
    let words: Vec<u32> = code
        .chunks_exact(4)
        .map(|word| u32::from_le_bytes([word[0], word[1], word[2], word[3]]))
        .collect();
    let trampoline = page + RELAY_LEN;
    let relocated = relocate(&words, entry, redirect.len()).map_err(|r| unsupported(name, entry, r))?;
    if RELAY_LEN + relocated.len() * 4 > crate::memory::page_size() {
        return Err(unsupported(name, entry, "relocated prologue too large"));
    }

    let mut contents = words_to_bytes(&jmp_abs(handler));
    contents.extend_from_slice(&words_to_bytes(&relocated));
    seal(page, 0, &contents)?;

    Ok(Layout {
        patch: words_to_bytes(&redirect),
        trampoline,
    })
}

fn words_to_bytes(words: &[u32]) -> Vec<u8> {
    words.iter().flat_map(|word| word.to_le_bytes()).collect()
}

/// `b` from `from` to `to`, if in range.
fn b(from: usize, to: usize) -> Option<u32> {
    let delta = (to as i64).wrapping_sub(from as i64);
    if delta % 4 != 0 || !(-(1 << 27)..(1 << 27)).contains(&delta) {
        return None;
    }
    Some(0x1400_0000 | ((delta >> 2) as u32 & 0x03ff_ffff))
}

fn jmp_abs(to: usize) -> Vec<u32> {
    let to = to as u64;
    vec![LDR_X17_8, BR_X17, to as u32, (to >> 32) as u32]
}

fn sign_extend(value: u32, bits: u32) -> i64 {
    let shift = 64 - bits;
    ((value as i64) << shift) >> shift
}

/// Target of a PC-relative branch, if `word` is one.
fn branch_target(word: u32, pc: usize) -> Option<usize> {
    let offset = if word & 0x7c00_0000 == 0x1400_0000 {
        // b, bl
        sign_extend(word & 0x03ff_ffff, 26) << 2
    } else if word & 0xff00_0010 == 0x5400_0000 || word & 0x7e00_0000 == 0x3400_0000 {
        // b.cond, cbz, cbnz
        sign_extend((word >> 5) & 0x7_ffff, 19) << 2
    } else if word & 0x7e00_0000 == 0x3600_0000 {
        // tbz, tbnz
        sign_extend((word >> 5) & 0x3fff, 14) << 2
    } else {
        return None;
    };
    Some((pc as i64).wrapping_add(offset) as usize)
}

/// Relocate the first `count` words at `entry` and append a branch back.
fn relocate(words: &[u32], entry: usize, count: usize) -> Result<Vec<u32>, String> {
    if words.len() < count {
        return Err(format!("function too short: {} of {} words", words.len(), count));
    }
    let inside = entry + 4..entry + count * 4;
    for (i, word) in words.iter().enumerate() {
        let pc = entry + i * 4;
        if let Some(target) = branch_target(*word, pc) {
            if inside.contains(&target) {
                return Err(format!("{:#x} branches into the displaced bytes", pc));
            }
        }
    }

    let mut out = Vec::new();
    for (i, &word) in words[..count].iter().enumerate() {
        let pc = entry + i * 4;
        let last = i + 1 == count;
        let terminates = word & 0xfc00_0000 == 0x1400_0000
            || word & 0xffff_fc1f == 0xd65f_0000
            || word & 0xffff_fc1f == 0xd61f_0000;
        if terminates && !last {
            return Err(format!("function too short: ends after {} bytes", (i + 1) * 4));
        }

        if word & 0x7c00_0000 == 0x1400_0000 {
            let target = branch_target(word, pc).unwrap_or_default() as u64;
            if word & 0x8000_0000 != 0 {
                // bl: ldr x17, #12; blr x17; b #12; .quad target
                out.extend_from_slice(&[0x5800_0071, BLR_X17, 0x1400_0003]);
            } else {
                out.extend_from_slice(&[LDR_X17_8, BR_X17]);
            }
            out.extend_from_slice(&[target as u32, (target >> 32) as u32]);
        } else if word & 0x1f00_0000 == 0x1000_0000 {
            // adr, adrp: ldr xd, #8; b #12; .quad value
            let rd = word & 0x1f;
            let imm = sign_extend(((word >> 5) & 0x7_ffff) << 2 | (word >> 29) & 0x3, 21);
            let value = if word & 0x8000_0000 != 0 {
                ((pc & !0xfff) as i64).wrapping_add(imm << 12)
            } else {
                (pc as i64).wrapping_add(imm)
            } as u64;
            out.extend_from_slice(&[0x5800_0040 | rd, 0x1400_0003]);
            out.extend_from_slice(&[value as u32, (value >> 32) as u32]);
        } else if branch_target(word, pc).is_some() || word & 0x3b00_0000 == 0x1800_0000 {
            return Err(format!("unsupported PC-relative instruction {:#010x} at {:#x}", word, pc));
        } else {
            out.push(word);
        }
    }
    out.extend_from_slice(&jmp_abs(entry + count * 4));
    debug_assert!(out.len() >= JMP_ABS_WORDS);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ENTRY: usize = 0x40_0000;

    #[test]
    fn test_branch_range() {
        assert_eq!(b(ENTRY, ENTRY + 8), Some(0x1400_0002));
        assert_eq!(b(ENTRY, ENTRY - 4), Some(0x17ff_ffff));
        assert_eq!(b(ENTRY, ENTRY + (1 << 28)), None);
    }

    #[test]
    fn test_plain_prologue_is_copied() {
        // stp x29, x30, [sp, #-16]!; mov x29, sp; ...
        let words = [0xa9bf_7bfd, 0x9100_03fd, 0xd503_201f, 0xd503_201f, 0xd65f_03c0];
        let out = relocate(&words, ENTRY, 1).unwrap();
        assert_eq!(out[0], 0xa9bf_7bfd);
        assert_eq!(&out[1..], &jmp_abs(ENTRY + 4)[..]);
    }

    #[test]
    fn test_adrp_is_materialized() {
        // adrp x0, #0x1000
        let words = [0xb000_0000, 0xd65f_03c0];
        let out = relocate(&words, ENTRY + 0x10, 1).unwrap();
        assert_eq!(out[0], 0x5800_0040);
        assert_eq!(out[2] as u64 | (out[3] as u64) << 32, (ENTRY + 0x1000) as u64);
    }

    #[test]
    fn test_rejects_conditional_branch_in_prologue() {
        // cbz x0, #8
        let words = [0xb400_0040, 0xd503_201f, 0xd503_201f, 0xd503_201f, 0xd65f_03c0];
        assert!(relocate(&words, ENTRY, 4).is_err());
        // ret as first instruction
        assert!(relocate(&[0xd65f_03c0, 0, 0, 0], ENTRY, 4)
            .unwrap_err()
            .contains("too short"));
    }
}
