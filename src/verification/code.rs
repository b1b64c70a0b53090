use rand::Rng;
use sha2::{Digest, Sha256};

const BASE36: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

pub fn to_base36(mut value: u64) -> String {
    if value == 0 {
        return "0".to_string();
    }
    let mut digits = Vec::new();
    while value > 0 {
        digits.push(BASE36[(value % 36) as usize]);
        value /= 36;
    }
    digits.reverse();
    String::from_utf8(digits).unwrap_or_default()
}

pub fn sha256_hex(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// `DEL-<millis36>-<random5>-<sha256(order_id + millis36)[..6]>`, uppercased.
pub fn delivery_code<R: Rng + ?Sized>(order_id: &str, issued_at_millis: u64, rng: &mut R) -> String {
    let time36 = to_base36(issued_at_millis);
    let random: String = (0..5)
        .map(|_| BASE36[rng.random_range(0..BASE36.len())] as char)
        .collect();
    let digest = sha256_hex(&format!("{order_id}{time36}"));
    format!("DEL-{time36}-{random}-{}", &digest[..6]).to_uppercase()
}

pub fn looks_like_code(candidate: &str) -> bool {
    candidate.len() > 4
        && candidate
            .get(..4)
            .is_some_and(|prefix| prefix.eq_ignore_ascii_case("DEL-"))
}

/// Keeps only the digits so formatting differences do not fail a match.
pub fn normalize_phone(phone: &str) -> String {
    phone.chars().filter(char::is_ascii_digit).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base36_encoding() {
        assert_eq!(to_base36(0), "0");
        assert_eq!(to_base36(35), "z");
        assert_eq!(to_base36(36), "10");
        assert_eq!(to_base36(1_700_000_000_000), "loyw3v28");
    }

    #[test]
    fn code_layout() {
        let code = delivery_code("order-42", 1_700_000_000_000, &mut rand::rng());
        let parts: Vec<&str> = code.split('-').collect();

        assert_eq!(parts.len(), 4);
        assert_eq!(parts[0], "DEL");
        assert_eq!(parts[1], "LOYW3V28");
        assert_eq!(parts[2].len(), 5);
        assert_eq!(parts[3], sha256_hex("order-42loyw3v28")[..6].to_uppercase());
        assert_eq!(code, code.to_uppercase());
        assert!(looks_like_code(&code));
        assert!(!looks_like_code("eyJhbGciOi"));
    }

    #[test]
    fn phone_normalization() {
        assert_eq!(normalize_phone("+1 (555) 010-0199"), "15550100199");
    }
}
