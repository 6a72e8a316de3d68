use getrandom::getrandom;

const BASE36_ALPHABET: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
const SUFFIX_SPACE: u32 = 36 * 36 * 36 * 36;

pub fn new_instance_id() -> String {
    let now = chrono::Utc::now().timestamp();
    let timestamp = u64::try_from(now).unwrap_or(0);
    let mut bytes = [0_u8; 4];
    let sample = match getrandom(&mut bytes) {
        Ok(()) => u32::from_le_bytes(bytes) % SUFFIX_SPACE,
        Err(_) => (std::process::id().wrapping_mul(2654435761)) % SUFFIX_SPACE,
    };
    let ts = base36_encode_u64(timestamp);
    let suffix = base36_encode_fixed_u32(sample, 4);
    format!("wf-{ts}-{suffix}")
}

fn base36_encode_u64(mut value: u64) -> String {
    if value == 0 {
        return "0".to_string();
    }
    let mut chars = Vec::new();
    while value > 0 {
        let idx = (value % 36) as usize;
        chars.push(BASE36_ALPHABET[idx] as char);
        value /= 36;
    }
    chars.iter().rev().collect()
}

fn base36_encode_fixed_u32(mut value: u32, width: usize) -> String {
    let mut chars = vec!['0'; width];
    for idx in (0..width).rev() {
        chars[idx] = BASE36_ALPHABET[(value % 36) as usize] as char;
        value /= 36;
    }
    chars.into_iter().collect()
}
