//! QR credential tokens for loyalty cards.
//!
//! A token is `base64url(envelope) "." base64url(cmac)`. The envelope is a
//! small JSON object carrying the token type, issue and expiry times, the IV
//! and the AES-256-GCM ciphertext of the card payload. The CMAC (AES-128)
//! covers the raw envelope bytes.
//!
//! All keys derive from one system secret. The IV comes from an [`IvSource`];
//! the default [`DerivedIv`] reuses one IV derived from the secret for every
//! token, which keeps tokens reproducible but is a known weakness of GCM.
//! [`RandomIv`] draws a fresh IV per token. The IV travels inside the
//! envelope, so tokens minted under either source validate the same way.

use aes::Aes128;
use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Duration, Utc};
use cmac::{Cmac, Mac};
use qrcode::{QrCode, render::svg};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::{fmt, sync::Arc};

pub const TOKEN_VERSION: u32 = 1;
pub const DEFAULT_VALIDITY_DAYS: i64 = 30;
pub const MAX_PAYLOAD_AGE_DAYS: i64 = 30;
pub const TRANSIENT_VALIDITY_MINUTES: i64 = 5;

const IV_LEN: usize = 12;
const TEMPORARY: &str = "temporary";

/// A 16-byte AES key
#[derive(Clone, PartialEq, Eq)]
pub struct AesKey([u8; 16]);

impl AesKey {
    fn from_digest(digest: &[u8; 32]) -> Self {
        let mut arr = [0u8; 16];
        arr.copy_from_slice(&digest[..16]);
        Self(arr)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Debug for AesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AesKey(..)")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("malformed token: {0}")]
    Malformed(String),
    #[error("invalid token signature")]
    BadSignature,
    #[error("token expired")]
    Expired,
    #[error("token payload issued more than {MAX_PAYLOAD_AGE_DAYS} days ago")]
    Stale,
    #[error("unable to decrypt token payload")]
    Decryption,
    #[error("unsupported token version {0}")]
    UnsupportedVersion(u32),
    #[error("key error: {0}")]
    Key(String),
    #[error("unable to encrypt token payload")]
    Encryption,
    #[error("unable to render QR code: {0}")]
    Render(String),
}

/// Who a card credential belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardIdentity {
    pub client_id: i64,
    pub client_number: String,
    pub pass_serial_number: String,
    pub company_id: i64,
}

impl CardIdentity {
    /// Fresh random serial for a newly issued pass.
    pub fn generate_serial() -> String {
        hex::encode(rand::random::<[u8; 16]>())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenType {
    Card,
    Temporary,
}

/// Decrypted token contents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialPayload {
    pub client_id: i64,
    pub client_number: String,
    pub pass_serial_number: String,
    pub company_id: i64,
    /// Issue time, unix milliseconds.
    pub timestamp: i64,
    pub version: u32,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
}

impl CredentialPayload {
    pub fn identity(&self) -> CardIdentity {
        CardIdentity {
            client_id: self.client_id,
            client_number: self.client_number.clone(),
            pass_serial_number: self.pass_serial_number.clone(),
            company_id: self.company_id,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    typ: TokenType,
    iat: i64,
    exp: i64,
    iv: String,
    ct: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct MintedCredential {
    pub token: String,
    pub qr_svg: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ValidationResult {
    Valid {
        payload: CredentialPayload,
        token_type: TokenType,
        expires_at: DateTime<Utc>,
    },
    Invalid(CodecError),
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        matches!(self, ValidationResult::Valid { .. })
    }
}

/// Supplies the GCM nonce for each minted token.
pub trait IvSource: Send + Sync {
    fn next_iv(&self) -> [u8; IV_LEN];
}

/// One IV derived from the system secret, shared by every token.
pub struct DerivedIv([u8; IV_LEN]);

impl DerivedIv {
    pub fn from_secret(secret: &str) -> Self {
        let digest = derive(secret, "iv");
        let mut iv = [0u8; IV_LEN];
        iv.copy_from_slice(&digest[..IV_LEN]);
        Self(iv)
    }
}

impl IvSource for DerivedIv {
    fn next_iv(&self) -> [u8; IV_LEN] {
        self.0
    }
}

/// Fresh random IV per token.
pub struct RandomIv;

impl IvSource for RandomIv {
    fn next_iv(&self) -> [u8; IV_LEN] {
        rand::random()
    }
}

fn derive(secret: &str, label: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(b"loyalty-credential:");
    hasher.update(label.as_bytes());
    hasher.update([0u8]);
    hasher.update(secret.as_bytes());
    hasher.finalize().into()
}

#[derive(Clone)]
pub struct CredentialCodec {
    enc_key: [u8; 32],
    mac_key: AesKey,
    iv_source: Arc<dyn IvSource>,
    validity: Duration,
    max_payload_age: Duration,
}

impl CredentialCodec {
    pub fn new(secret: &str) -> Self {
        Self {
            enc_key: derive(secret, "enc"),
            mac_key: AesKey::from_digest(&derive(secret, "mac")),
            iv_source: Arc::new(DerivedIv::from_secret(secret)),
            validity: Duration::days(DEFAULT_VALIDITY_DAYS),
            max_payload_age: Duration::days(MAX_PAYLOAD_AGE_DAYS),
        }
    }

    pub fn with_iv_source(mut self, iv_source: Arc<dyn IvSource>) -> Self {
        self.iv_source = iv_source;
        self
    }

    pub fn with_validity(mut self, validity: Duration) -> Self {
        self.validity = validity;
        self
    }

    pub fn mint(&self, identity: &CardIdentity) -> Result<MintedCredential, CodecError> {
        self.mint_at(identity, Utc::now())
    }

    pub fn mint_at(&self, identity: &CardIdentity, now: DateTime<Utc>) -> Result<MintedCredential, CodecError> {
        let payload = CredentialPayload {
            client_id: identity.client_id,
            client_number: identity.client_number.clone(),
            pass_serial_number: identity.pass_serial_number.clone(),
            company_id: identity.company_id,
            timestamp: now.timestamp_millis(),
            version: TOKEN_VERSION,
            kind: None,
            expires_at: None,
            nonce: None,
        };
        self.seal(&payload, TokenType::Card, now, now + self.validity)
    }

    /// Re-issues a card token keeping the serial printed on existing passes.
    pub fn rotate(&self, identity: &CardIdentity, existing_serial: &str) -> Result<MintedCredential, CodecError> {
        let identity = CardIdentity {
            pass_serial_number: existing_serial.to_string(),
            ..identity.clone()
        };
        self.mint(&identity)
    }

    /// Short-lived token for a single transaction QR code.
    pub fn mint_transient(&self, identity: &CardIdentity) -> Result<MintedCredential, CodecError> {
        self.mint_transient_at(identity, Utc::now())
    }

    pub fn mint_transient_at(
        &self,
        identity: &CardIdentity,
        now: DateTime<Utc>,
    ) -> Result<MintedCredential, CodecError> {
        let expires_at = now + Duration::minutes(TRANSIENT_VALIDITY_MINUTES);
        let payload = CredentialPayload {
            client_id: identity.client_id,
            client_number: identity.client_number.clone(),
            pass_serial_number: identity.pass_serial_number.clone(),
            company_id: identity.company_id,
            timestamp: now.timestamp_millis(),
            version: TOKEN_VERSION,
            kind: Some(TEMPORARY.to_string()),
            expires_at: Some(expires_at.timestamp_millis()),
            nonce: Some(hex::encode(rand::random::<[u8; 8]>())),
        };
        self.seal(&payload, TokenType::Temporary, now, expires_at)
    }

    pub fn validate(&self, token: &str) -> ValidationResult {
        self.validate_at(token, Utc::now())
    }

    pub fn validate_at(&self, token: &str, now: DateTime<Utc>) -> ValidationResult {
        match self.open(token, now) {
            Ok((payload, token_type, expires_at)) => ValidationResult::Valid {
                payload,
                token_type,
                expires_at,
            },
            Err(e) => ValidationResult::Invalid(e),
        }
    }

    fn seal(
        &self,
        payload: &CredentialPayload,
        typ: TokenType,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<MintedCredential, CodecError> {
        let plaintext = serde_json::to_vec(payload).map_err(|_| CodecError::Encryption)?;
        let iv = self.iv_source.next_iv();

        let cipher = Aes256Gcm::new_from_slice(&self.enc_key)
            .map_err(|e| CodecError::Key(format!("{e:?}")))?;
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&iv), plaintext.as_slice())
            .map_err(|_| CodecError::Encryption)?;

        let envelope = Envelope {
            typ,
            iat: now.timestamp(),
            exp: expires_at.timestamp(),
            iv: hex::encode(iv),
            ct: hex::encode(ciphertext),
        };
        let body = serde_json::to_vec(&envelope).map_err(|_| CodecError::Encryption)?;
        let signature = self.sign(&body)?;

        let token = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(&body),
            URL_SAFE_NO_PAD.encode(signature)
        );
        let qr_svg = render_qr(&token)?;

        Ok(MintedCredential {
            token,
            qr_svg,
            expires_at,
        })
    }

    fn open(
        &self,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<(CredentialPayload, TokenType, DateTime<Utc>), CodecError> {
        let (body_b64, sig_b64) = token
            .trim()
            .split_once('.')
            .ok_or_else(|| CodecError::Malformed("missing signature".to_string()))?;
        let body = URL_SAFE_NO_PAD
            .decode(body_b64)
            .map_err(|_| CodecError::Malformed("envelope is not base64".to_string()))?;
        let signature = URL_SAFE_NO_PAD
            .decode(sig_b64)
            .map_err(|_| CodecError::Malformed("signature is not base64".to_string()))?;

        let mut mac = self.mac()?;
        mac.update(&body);
        mac.verify_slice(&signature)
            .map_err(|_| CodecError::BadSignature)?;

        let envelope: Envelope = serde_json::from_slice(&body)
            .map_err(|e| CodecError::Malformed(e.to_string()))?;

        if now.timestamp() >= envelope.exp {
            return Err(CodecError::Expired);
        }
        let expires_at = DateTime::<Utc>::from_timestamp(envelope.exp, 0)
            .ok_or_else(|| CodecError::Malformed("expiry out of range".to_string()))?;

        let iv = hex::decode(&envelope.iv)
            .map_err(|_| CodecError::Malformed("iv is not hex".to_string()))?;
        if iv.len() != IV_LEN {
            return Err(CodecError::Malformed("iv must be 12 bytes".to_string()));
        }
        let ciphertext = hex::decode(&envelope.ct)
            .map_err(|_| CodecError::Malformed("ciphertext is not hex".to_string()))?;

        let cipher = Aes256Gcm::new_from_slice(&self.enc_key)
            .map_err(|e| CodecError::Key(format!("{e:?}")))?;
        let plaintext = cipher
            .decrypt(Nonce::from_slice(&iv), ciphertext.as_slice())
            .map_err(|_| CodecError::Decryption)?;

        let payload: CredentialPayload = serde_json::from_slice(&plaintext)
            .map_err(|e| CodecError::Malformed(e.to_string()))?;

        if payload.version != TOKEN_VERSION {
            return Err(CodecError::UnsupportedVersion(payload.version));
        }

        // Checked on the embedded issue time as well as the envelope expiry.
        if now.timestamp_millis() - payload.timestamp > self.max_payload_age.num_milliseconds() {
            return Err(CodecError::Stale);
        }

        let is_temporary = payload.kind.as_deref() == Some(TEMPORARY);
        match envelope.typ {
            TokenType::Temporary => {
                if !is_temporary {
                    return Err(CodecError::Malformed("token type mismatch".to_string()));
                }
                match payload.expires_at {
                    Some(exp) if exp > now.timestamp_millis() => {}
                    _ => return Err(CodecError::Expired),
                }
            }
            TokenType::Card if is_temporary => {
                return Err(CodecError::Malformed("token type mismatch".to_string()));
            }
            TokenType::Card => {}
        }

        Ok((payload, envelope.typ, expires_at))
    }

    fn mac(&self) -> Result<Cmac<Aes128>, CodecError> {
        <Cmac<Aes128> as Mac>::new_from_slice(self.mac_key.as_bytes())
            .map_err(|e| CodecError::Key(format!("{e:?}")))
    }

    fn sign(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        let mut mac = self.mac()?;
        mac.update(data);
        Ok(mac.finalize().into_bytes().to_vec())
    }
}

fn render_qr(token: &str) -> Result<String, CodecError> {
    let code = QrCode::new(token.as_bytes()).map_err(|e| CodecError::Render(e.to_string()))?;
    Ok(code
        .render::<svg::Color>()
        .min_dimensions(240, 240)
        .build())
}
