use std::sync::atomic::{AtomicU64, Ordering};

static CALL_ID_COUNTER: AtomicU64 = AtomicU64::new(1);
const HEX: &[u8; 16] = b"0123456789abcdef";

#[inline]
pub(crate) fn mix_u64(mut x: u64) -> u64 {
    x ^= x >> 30;
    x = x.wrapping_mul(0xbf58_476d_1ce4_e5b9);
    x ^= x >> 27;
    x = x.wrapping_mul(0x94d0_49bb_1331_11eb);
    x ^ (x >> 31)
}

/// Tool-call id used when the provider never sent one for a call index.
#[inline]
pub(crate) fn next_call_id() -> String {
    let id = mix_u64(CALL_ID_COUNTER.fetch_add(1, Ordering::Relaxed));
    let mut out = String::with_capacity(21);
    out.push_str("call_");
    push_u64_hex_16(&mut out, id);
    out
}

#[inline]
fn push_u64_hex_16(out: &mut String, mut value: u64) {
    let mut buf = [b'0'; 16];
    let mut idx = 16;
    while idx > 0 {
        idx -= 1;
        buf[idx] = HEX[(value & 0x0f) as usize];
        value >>= 4;
    }
    for byte in buf {
        out.push(char::from(byte));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_ids_are_prefixed_fixed_width_hex() {
        let id = next_call_id();
        assert_eq!(id.len(), 21);
        assert!(id.starts_with("call_"));
        assert!(id[5..].bytes().all(|b| HEX.contains(&b)));
        assert_ne!(id, next_call_id());
    }

    #[test]
    fn hex_is_zero_padded() {
        let mut out = String::new();
        push_u64_hex_16(&mut out, 0xabc);
        assert_eq!(out, "0000000000000abc");
    }
}
