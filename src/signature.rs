//! HMAC-SHA256 签名与校验。

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

fn keyed_mac(secret: &[u8]) -> HmacSha256 {
    // HMAC accepts keys of any length.
    match HmacSha256::new_from_slice(secret) {
        Ok(mac) => mac,
        Err(_) => unreachable!("hmac key length is unrestricted"),
    }
}

/// 计算 `message` 的 HMAC-SHA256，返回小写十六进制字符串。
pub fn sign(message: &[u8], secret: &[u8]) -> String {
    let mut mac = keyed_mac(secret);
    mac.update(message);
    hex::encode(mac.finalize().into_bytes())
}

/// 重新计算签名并以常量时间比较。
pub fn verify(message: &[u8], signature: &str, secret: &[u8]) -> bool {
    // sign() only emits lowercase; any other spelling is a different token.
    if !signature
        .bytes()
        .all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
    {
        return false;
    }
    let Ok(expected) = hex::decode(signature) else {
        return false;
    };
    let mut mac = keyed_mac(secret);
    mac.update(message);
    mac.verify_slice(&expected).is_ok()
}

#[cfg(test)]
mod tests {
    use super::{sign, verify};

    #[test]
    fn matches_known_vector() {
        // RFC 4231 test case 2
        let signature = sign(b"what do ya want for nothing?", b"Jefe");
        assert_eq!(
            signature,
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn verify_round_trip_and_wrong_secret() {
        let signature = sign(b"payload", b"secret-one");
        assert!(verify(b"payload", &signature, b"secret-one"));
        assert!(!verify(b"payload", &signature, b"secret-two"));
        assert!(!verify(b"payload!", &signature, b"secret-one"));
    }

    #[test]
    fn verify_rejects_malformed_signature() {
        assert!(!verify(b"payload", "not-hex", b"secret"));
        assert!(!verify(b"payload", "", b"secret"));
        assert!(!verify(b"payload", "abcd", b"secret"));
    }

    #[test]
    fn verify_rejects_uppercase_spelling() {
        let signature = sign(b"payload", b"secret");
        assert!(!verify(b"payload", &signature.to_uppercase(), b"secret"));
    }
}
