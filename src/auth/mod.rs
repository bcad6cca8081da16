//! Signed request construction for the Showstart WAP API.
//!
//! Every request carries a fresh trace id, a signature over the exact body
//! that goes on the wire, and the full set of session headers the mobile
//! client sends. Paths on the encryption allow-list have their body replaced
//! by `{"q": <ciphertext>}` before signing, with the key derived from the
//! trace id and session token.
//!
//! The signature and cipher primitives are collaborators behind the
//! [`Signer`] and [`Cipher`] traits. [`HmacSigner`] and [`AesCipher`] are the
//! default implementations.

use std::sync::Arc;

use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockEncryptMut, KeyIvInit};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use rand::distributions::Alphanumeric;
use rand::Rng;
use reqwest::header::{HeaderMap, HeaderValue, InvalidHeaderValue, CONTENT_TYPE};
use reqwest::Method;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;

use crate::config::ShowstartConfig;

type HmacSha256 = Hmac<Sha256>;
type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;

/// Length of the per-request `crtraceid`.
pub const TRACE_ID_LEN: usize = 32;

/// Paths whose JSON body must be encrypted before signing.
pub const ENCRYPTED_PATHS: &[&str] = &["/wap/activity/list"];

/// Sent in place of an empty access or id token.
const EMPTY_TOKEN: &str = "nil";

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("body encryption failed: {0}")]
    Encrypt(String),
    #[error("request signing failed: {0}")]
    Sign(String),
    #[error("invalid value for header {name}: {source}")]
    InvalidHeader {
        name: &'static str,
        #[source]
        source: InvalidHeaderValue,
    },
}

/// Session material bound to one client instance. Never mutated after
/// construction; refreshable tokens live in [`SessionTokens`].
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub sign: String,
    pub token: String,
    pub cookie: String,
    pub device_info: String,
    pub device_no: String,
    pub user_ut: String,
    pub app_id: String,
    pub terminal: String,
    pub user_id: String,
    pub user_name: String,
    pub user_ref: String,
    pub client_version: String,
    pub st_flpv: String,
}

impl Credentials {
    /// The mobile client reuses the session token as device number and user
    /// ref, the terminal as app id, and the sign as `cusut`.
    pub fn from_config(cfg: &ShowstartConfig) -> Self {
        Self {
            sign: cfg.sign.clone(),
            token: cfg.token.clone(),
            cookie: cfg.cookie.clone(),
            device_info: cfg.cdeviceinfo.clone(),
            device_no: cfg.token.clone(),
            user_ut: cfg.sign.clone(),
            app_id: cfg.cterminal.clone(),
            terminal: cfg.cterminal.clone(),
            user_id: cfg.cusid.clone(),
            user_name: cfg.cusname.clone(),
            user_ref: cfg.token.clone(),
            client_version: cfg.cversion.clone(),
            st_flpv: cfg.st_flpv.clone(),
        }
    }
}

/// Access and id tokens obtained from a token refresh. Empty until the first
/// successful refresh.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionTokens {
    pub access_token: String,
    pub id_token: String,
}

/// Everything the signature binds to.
#[derive(Debug, Clone, Copy)]
pub struct SignInput<'a> {
    pub path: &'a str,
    pub body: &'a str,
    pub trace_id: &'a str,
    pub sign: &'a str,
    pub token: &'a str,
    pub access_token: &'a str,
    pub id_token: &'a str,
    pub user_id: &'a str,
    pub terminal: &'a str,
}

pub trait Signer: Send + Sync {
    fn sign(&self, input: &SignInput<'_>) -> Result<String, AuthError>;
}

pub trait Cipher: Send + Sync {
    fn derive_key(&self, trace_id: &str, token: &str) -> Vec<u8>;
    fn encrypt(&self, plaintext: &str, key: &[u8]) -> Result<String, AuthError>;
}

/// Hex HMAC-SHA256 keyed by the `sign` credential.
#[derive(Debug, Clone, Copy, Default)]
pub struct HmacSigner;

impl Signer for HmacSigner {
    fn sign(&self, input: &SignInput<'_>) -> Result<String, AuthError> {
        let mut mac = HmacSha256::new_from_slice(input.sign.as_bytes())
            .map_err(|e| AuthError::Sign(e.to_string()))?;
        for part in [
            input.path,
            input.body,
            input.access_token,
            input.id_token,
            input.user_id,
            input.terminal,
            input.trace_id,
        ] {
            mac.update(part.as_bytes());
        }
        Ok(hex::encode(mac.finalize().into_bytes()))
    }
}

/// AES-128-CBC with PKCS#7 padding, base64 output.
///
/// Key material is SHA-256(trace_id ‖ token): the first 16 bytes are the
/// key, the last 16 the IV.
#[derive(Debug, Clone, Copy, Default)]
pub struct AesCipher;

impl Cipher for AesCipher {
    fn derive_key(&self, trace_id: &str, token: &str) -> Vec<u8> {
        let mut hasher = Sha256::new();
        hasher.update(trace_id.as_bytes());
        hasher.update(token.as_bytes());
        hasher.finalize().to_vec()
    }

    fn encrypt(&self, plaintext: &str, key: &[u8]) -> Result<String, AuthError> {
        if key.len() < 32 {
            return Err(AuthError::Encrypt(format!(
                "key material is {} bytes, need 32",
                key.len()
            )));
        }
        let encryptor = Aes128CbcEnc::new_from_slices(&key[..16], &key[16..32])
            .map_err(|e| AuthError::Encrypt(e.to_string()))?;

        let pt = plaintext.as_bytes();
        let mut buf = vec![0u8; pt.len() + 16 - pt.len() % 16];
        let ct = encryptor
            .encrypt_padded_b2b_mut::<Pkcs7>(pt, &mut buf)
            .map_err(|_| AuthError::Encrypt("padding buffer too small".to_string()))?;
        Ok(BASE64.encode(ct))
    }
}

/// Random alphanumeric trace id of [`TRACE_ID_LEN`] characters.
pub fn generate_trace_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(TRACE_ID_LEN)
        .map(char::from)
        .collect()
}

pub fn requires_encryption(path: &str) -> bool {
    ENCRYPTED_PATHS.contains(&path)
}

/// A fully built request, ready to hand to the transport.
#[derive(Debug, Clone)]
pub struct SignedRequest {
    pub method: Method,
    pub path: String,
    pub url: String,
    /// Body exactly as transmitted (post-encryption).
    pub body: String,
    pub trace_id: String,
    pub signature: String,
    pub headers: HeaderMap,
}

/// Builds [`SignedRequest`]s for one credential bundle.
#[derive(Clone)]
pub struct RequestSigner {
    base_url: String,
    creds: Arc<Credentials>,
    signer: Arc<dyn Signer>,
    cipher: Arc<dyn Cipher>,
}

impl RequestSigner {
    pub fn new(base_url: String, creds: Credentials) -> Self {
        Self::with_collaborators(base_url, creds, Arc::new(HmacSigner), Arc::new(AesCipher))
    }

    pub fn with_collaborators(
        base_url: String,
        creds: Credentials,
        signer: Arc<dyn Signer>,
        cipher: Arc<dyn Cipher>,
    ) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            creds: Arc::new(creds),
            signer,
            cipher,
        }
    }

    pub fn credentials(&self) -> &Credentials {
        &self.creds
    }

    /// Build a request with a freshly generated trace id.
    pub fn build(
        &self,
        method: Method,
        path: &str,
        body: &str,
        session: &SessionTokens,
    ) -> Result<SignedRequest, AuthError> {
        self.build_with_trace_id(method, path, body, session, generate_trace_id())
    }

    fn build_with_trace_id(
        &self,
        method: Method,
        path: &str,
        body: &str,
        session: &SessionTokens,
        trace_id: String,
    ) -> Result<SignedRequest, AuthError> {
        let creds = &*self.creds;

        let body = if requires_encryption(path) {
            let key = self.cipher.derive_key(&trace_id, &creds.token);
            let ciphertext = self.cipher.encrypt(body, &key)?;
            serde_json::json!({ "q": ciphertext }).to_string()
        } else {
            body.to_string()
        };

        let signature = self.signer.sign(&SignInput {
            path,
            body: &body,
            trace_id: &trace_id,
            sign: &creds.sign,
            token: &creds.token,
            access_token: &session.access_token,
            id_token: &session.id_token,
            user_id: &creds.user_id,
            terminal: &creds.terminal,
        })?;

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let pairs: [(&'static str, &str); 15] = [
            ("cookie", &creds.cookie),
            ("cdeviceinfo", &creds.device_info),
            ("cdeviceno", &creds.device_no),
            ("cusut", &creds.user_ut),
            ("csappid", &creds.app_id),
            ("cterminal", &creds.terminal),
            ("cusid", &creds.user_id),
            ("cusname", &creds.user_name),
            ("cuuserref", &creds.user_ref),
            ("cversion", &creds.client_version),
            ("st_flpv", &creds.st_flpv),
            ("crtraceid", &trace_id),
            ("crpsign", &signature),
            ("cusat", or_nil(&session.access_token)),
            ("cusit", or_nil(&session.id_token)),
        ];
        for (name, value) in pairs {
            let value = HeaderValue::from_str(value)
                .map_err(|source| AuthError::InvalidHeader { name, source })?;
            headers.insert(name, value);
        }

        debug!(
            method = %method,
            path = path,
            trace_id = %trace_id,
            encrypted = requires_encryption(path),
            "built signed request"
        );

        Ok(SignedRequest {
            url: format!("{}{}", self.base_url, path),
            method,
            path: path.to_string(),
            body,
            trace_id,
            signature,
            headers,
        })
    }
}

fn or_nil(token: &str) -> &str {
    if token.is_empty() {
        EMPTY_TOKEN
    } else {
        token
    }
}
