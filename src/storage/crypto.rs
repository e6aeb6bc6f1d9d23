//! ウォレットファイルの暗号化。
//!
//! パスワードから PBKDF2 で secp256k1 の秘密鍵を導出し、その公開鍵宛てに
//! ECIES (`BIE1` 形式) で暗号化する。

use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use hmac::{Hmac, Mac};
use secp256k1::constants::CURVE_ORDER;
use secp256k1::{PublicKey, Scalar, SecretKey, SECP256K1};
use sha2::{Digest, Sha256, Sha512};

use crate::error::{AppError, Result};

type HmacSha256 = Hmac<Sha256>;
type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;

pub const MAGIC: &[u8; 4] = b"BIE1";
const PBKDF2_ROUNDS: u32 = 1024;
const MAC_LEN: usize = 32;
// magic + 圧縮公開鍵 + 最小1ブロック + MAC
const MIN_FRAME_LEN: usize = 4 + 33 + 16 + MAC_LEN;

// 2^256 mod n
const TWO_POW_256_MOD_N: [u8; 32] = [
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1, //
    0x45, 0x51, 0x23, 0x19, 0x50, 0xb7, 0x5f, 0xc4, 0x40, 0x2d, 0xa1, 0x73, 0x2f, 0xc9, 0xbe, 0xbf,
];

/// 32バイトのビッグエンディアン整数を n 未満に折り返す (2^256 < 2n なので1回の減算で足りる)
fn reduce_once(mut value: [u8; 32]) -> [u8; 32] {
    if value < CURVE_ORDER {
        return value;
    }
    let mut borrow = 0i16;
    for i in (0..32).rev() {
        let diff = value[i] as i16 - CURVE_ORDER[i] as i16 - borrow;
        borrow = if diff < 0 { 1 } else { 0 };
        value[i] = (diff + (borrow << 8)) as u8;
    }
    value
}

fn scalar(bytes: [u8; 32]) -> Result<Scalar> {
    Scalar::from_be_bytes(reduce_once(bytes)).map_err(|_| AppError::Crypto("スカラー変換に失敗".to_string()))
}

/// PBKDF2-HMAC-SHA512(password, "", 1024) の 64 バイトを n で割った余りを秘密鍵にする
pub fn ec_key_from_password(password: &str) -> Result<SecretKey> {
    let mut stretched = [0u8; 64];
    pbkdf2::pbkdf2::<Hmac<Sha512>>(password.as_bytes(), b"", PBKDF2_ROUNDS, &mut stretched)
        .map_err(|e| AppError::Crypto(format!("PBKDF2 失敗: {e}")))?;

    let mut hi = [0u8; 32];
    let mut lo = [0u8; 32];
    hi.copy_from_slice(&stretched[..32]);
    lo.copy_from_slice(&stretched[32..]);

    // hi * 2^256 + lo (mod n)
    let factor = scalar(TWO_POW_256_MOD_N)?;
    let high = SecretKey::from_slice(&reduce_once(hi))
        .and_then(|key| key.mul_tweak(&factor))
        .map_err(|e| AppError::Crypto(format!("パスワード鍵の導出に失敗: {e}")))?;
    high.add_tweak(&scalar(lo)?)
        .map_err(|e| AppError::Crypto(format!("パスワード鍵の導出に失敗: {e}")))
}

struct DerivedKeys {
    iv: [u8; 16],
    key_e: [u8; 16],
    key_m: [u8; 32],
}

fn derive_keys(point: &PublicKey, secret: &SecretKey) -> Result<DerivedKeys> {
    let shared = point.mul_tweak(SECP256K1, &Scalar::from(*secret))?;
    let digest = Sha512::digest(shared.serialize());
    let mut keys = DerivedKeys { iv: [0; 16], key_e: [0; 16], key_m: [0; 32] };
    keys.iv.copy_from_slice(&digest[..16]);
    keys.key_e.copy_from_slice(&digest[16..32]);
    keys.key_m.copy_from_slice(&digest[32..]);
    Ok(keys)
}

fn mac(key: &[u8], data: &[u8]) -> Result<HmacSha256> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| AppError::Crypto(format!("HMAC-SHA256 の初期化に失敗: {e}")))?;
    mac.update(data);
    Ok(mac)
}

/// 公開鍵宛てに暗号化し base64 文字列で返す
pub fn encrypt_message(recipient: &PublicKey, message: &[u8]) -> Result<String> {
    let ephemeral = SecretKey::new(&mut secp256k1::rand::thread_rng());
    let keys = derive_keys(recipient, &ephemeral)?;

    let ciphertext = Aes128CbcEnc::new_from_slices(&keys.key_e, &keys.iv)
        .map_err(|e| AppError::Crypto(format!("AES の初期化に失敗: {e}")))?
        .encrypt_padded_vec_mut::<Pkcs7>(message);

    let mut frame = Vec::with_capacity(MIN_FRAME_LEN + ciphertext.len());
    frame.extend_from_slice(MAGIC);
    frame.extend_from_slice(&ephemeral.public_key(SECP256K1).serialize());
    frame.extend_from_slice(&ciphertext);
    let tag = mac(&keys.key_m, &frame)?.finalize().into_bytes();
    frame.extend_from_slice(&tag);
    Ok(STANDARD.encode(frame))
}

/// base64 文字列が暗号化フレームとして始まるか
pub fn is_encrypted_frame(text: &str) -> bool {
    STANDARD
        .decode(text.trim())
        .map(|bytes| bytes.starts_with(MAGIC))
        .unwrap_or(false)
}

/// MAC が一致しなければ `InvalidPassword`
pub fn decrypt_message(secret: &SecretKey, encrypted: &str) -> Result<Vec<u8>> {
    let frame = STANDARD
        .decode(encrypted.trim())
        .map_err(|e| AppError::Crypto(format!("base64 デコードに失敗: {e}")))?;
    if frame.len() < MIN_FRAME_LEN {
        return Err(AppError::Crypto(format!("暗号文が短すぎます: {} バイト", frame.len())));
    }
    if !frame.starts_with(MAGIC) {
        return Err(AppError::Crypto("マジックバイトが一致しません".to_string()));
    }
    let (body, tag) = frame.split_at(frame.len() - MAC_LEN);
    let ephemeral = PublicKey::from_slice(&body[4..37])?;
    let keys = derive_keys(&ephemeral, secret)?;
    mac(&keys.key_m, body)?
        .verify_slice(tag)
        .map_err(|_| AppError::InvalidPassword)?;

    Aes128CbcDec::new_from_slices(&keys.key_e, &keys.iv)
        .map_err(|e| AppError::Crypto(format!("AES の初期化に失敗: {e}")))?
        .decrypt_padded_vec_mut::<Pkcs7>(&body[37..])
        .map_err(|e| AppError::Crypto(format!("復号に失敗: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_key_is_stable() {
        let secret = ec_key_from_password("password").unwrap();
        assert_eq!(
            hex::encode(secret.secret_bytes()),
            "d52dec9c60ccd12b95e3b897d6d4f9672c6a5bac248856a2e0419f719dbd8d77"
        );
        assert_eq!(
            secret.public_key(SECP256K1).to_string(),
            "02ea3ff2a7da5fedd8cdee3de2c536639a46959fdd20b12531104bbb8d1eaefc01"
        );
    }

    #[test]
    fn reduce_subtracts_order() {
        let mut above = CURVE_ORDER;
        above[31] += 5;
        let mut expected = [0u8; 32];
        expected[31] = 5;
        assert_eq!(reduce_once(above), expected);
        assert_eq!(reduce_once([0xff; 32])[..15], [0u8; 15]);
    }

    #[test]
    fn encrypt_then_decrypt() {
        let secret = ec_key_from_password("secret phrase").unwrap();
        let public = secret.public_key(SECP256K1);
        let encrypted = encrypt_message(&public, b"{\"seed_version\": 19}").unwrap();
        assert!(is_encrypted_frame(&encrypted));
        assert_eq!(decrypt_message(&secret, &encrypted).unwrap(), b"{\"seed_version\": 19}");
    }

    #[test]
    fn wrong_password_is_reported() {
        let public = ec_key_from_password("right").unwrap().public_key(SECP256K1);
        let encrypted = encrypt_message(&public, b"payload").unwrap();
        let wrong = ec_key_from_password("wrong").unwrap();
        assert!(matches!(decrypt_message(&wrong, &encrypted), Err(AppError::InvalidPassword)));
    }

    #[test]
    fn malformed_frames_are_rejected() {
        assert!(decrypt_message(&ec_key_from_password("x").unwrap(), "QklFMQ==").is_err());
        assert!(!is_encrypted_frame("{\"seed_version\": 19}"));
    }
}
