//! SCRAM SASL mechanisms (SHA-1, SHA-256 and SHA-512).
//!
//! Implements the server side of SCRAM authentication per:
//! - RFC 5802: Salted Challenge Response Authentication Mechanism (SCRAM)
//! - RFC 7677: SCRAM-SHA-256
//!
//! Channel binding is not supported; clients must send the `n` GS2 flag.
//!
//! ## Protocol Flow
//!
//! 1. Client sends client-first-message: `n,,n=user,r=clientnonce`
//! 2. Server sends server-first-message: `r=clientnonce+servernonce,s=salt,i=iterations`
//! 3. Client sends client-final-message: `c=channel,r=nonce,p=clientproof`
//! 4. Server verifies and sends server-final-message: `v=serversignature`

use base64::prelude::*;
use hmac::{Hmac, Mac};
use pbkdf2::pbkdf2_hmac;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};

use super::SaslError;

/// Default number of PBKDF2 iterations.
pub const DEFAULT_ITERATIONS: u32 = 4096;

/// Length of generated nonce in bytes (will be base64 encoded).
const NONCE_LENGTH: usize = 24;

/// Hash function backing a SCRAM variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScramHash {
    Sha1,
    Sha256,
    Sha512,
}

impl ScramHash {
    fn output_len(self) -> usize {
        match self {
            ScramHash::Sha1 => 20,
            ScramHash::Sha256 => 32,
            ScramHash::Sha512 => 64,
        }
    }

    /// Hi() from RFC 5802: PBKDF2 with this hash's HMAC.
    fn hi(self, password: &[u8], salt: &[u8], iterations: u32) -> Vec<u8> {
        let mut output = vec![0u8; self.output_len()];
        match self {
            ScramHash::Sha1 => pbkdf2_hmac::<Sha1>(password, salt, iterations, &mut output),
            ScramHash::Sha256 => pbkdf2_hmac::<Sha256>(password, salt, iterations, &mut output),
            ScramHash::Sha512 => pbkdf2_hmac::<Sha512>(password, salt, iterations, &mut output),
        }
        output
    }

    fn hmac(self, key: &[u8], data: &[u8]) -> Result<Vec<u8>, SaslError> {
        let invalid_key = |_| SaslError::TemporaryAuthFailure("invalid HMAC key".to_string());
        Ok(match self {
            ScramHash::Sha1 => {
                let mut mac = Hmac::<Sha1>::new_from_slice(key).map_err(invalid_key)?;
                mac.update(data);
                mac.finalize().into_bytes().to_vec()
            }
            ScramHash::Sha256 => {
                let mut mac = Hmac::<Sha256>::new_from_slice(key).map_err(invalid_key)?;
                mac.update(data);
                mac.finalize().into_bytes().to_vec()
            }
            ScramHash::Sha512 => {
                let mut mac = Hmac::<Sha512>::new_from_slice(key).map_err(invalid_key)?;
                mac.update(data);
                mac.finalize().into_bytes().to_vec()
            }
        })
    }

    fn digest(self, data: &[u8]) -> Vec<u8> {
        match self {
            ScramHash::Sha1 => Sha1::digest(data).to_vec(),
            ScramHash::Sha256 => Sha256::digest(data).to_vec(),
            ScramHash::Sha512 => Sha512::digest(data).to_vec(),
        }
    }
}

/// Stored SCRAM keys for one hash function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScramCredentials {
    pub stored_key: Vec<u8>,
    pub server_key: Vec<u8>,
    pub salt: Vec<u8>,
    pub iterations: u32,
}

impl ScramCredentials {
    /// Derive the stored keys for `password`. The plaintext is never kept.
    pub fn derive(
        hash: ScramHash,
        password: &str,
        salt: Vec<u8>,
        iterations: u32,
    ) -> Result<Self, SaslError> {
        let salted_password = hash.hi(password.as_bytes(), &salt, iterations);
        let client_key = hash.hmac(&salted_password, b"Client Key")?;
        let stored_key = hash.digest(&client_key);
        let server_key = hash.hmac(&salted_password, b"Server Key")?;
        Ok(Self {
            stored_key,
            server_key,
            salt,
            iterations,
        })
    }

    /// Check a plaintext password against these keys.
    pub fn verify_password(&self, hash: ScramHash, password: &str) -> Result<bool, SaslError> {
        let salted_password = hash.hi(password.as_bytes(), &self.salt, self.iterations);
        let client_key = hash.hmac(&salted_password, b"Client Key")?;
        Ok(constant_time_eq(&hash.digest(&client_key), &self.stored_key))
    }
}

/// Per-hash SCRAM material stored for a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PasswordMaterial {
    pub sha1: ScramCredentials,
    pub sha256: ScramCredentials,
    pub sha512: ScramCredentials,
}

impl PasswordMaterial {
    /// Derive keys for every supported hash, each with its own salt.
    pub fn derive(password: &str, iterations: u32) -> Result<Self, SaslError> {
        Ok(Self {
            sha1: ScramCredentials::derive(ScramHash::Sha1, password, generate_salt(), iterations)?,
            sha256: ScramCredentials::derive(ScramHash::Sha256, password, generate_salt(), iterations)?,
            sha512: ScramCredentials::derive(ScramHash::Sha512, password, generate_salt(), iterations)?,
        })
    }

    pub fn for_hash(&self, hash: ScramHash) -> &ScramCredentials {
        match hash {
            ScramHash::Sha1 => &self.sha1,
            ScramHash::Sha256 => &self.sha256,
            ScramHash::Sha512 => &self.sha512,
        }
    }
}

/// SCRAM authentication state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScramState {
    /// Initial state, waiting for client-first-message
    Initial,
    /// Client-first parsed, credentials not yet attached
    ClientFirstReceived,
    /// Received client-first, waiting for client-final
    WaitingForClientFinal,
    /// Authentication complete (success or failure)
    Complete,
}

/// State machine for SCRAM server-side authentication.
#[derive(Debug, Clone)]
pub struct ScramServer {
    hash: ScramHash,
    state: ScramState,
    client_first_message_bare: String,
    server_first_message: String,
    client_nonce: String,
    combined_nonce: String,
    username: String,
    credentials: Option<ScramCredentials>,
}

/// Parsed client-first-message components.
#[derive(Debug, Clone)]
struct ClientFirstMessage {
    gs2_cbind_flag: char,
    authzid: Option<String>,
    username: String,
    client_nonce: String,
    bare: String,
}

/// Parsed client-final-message components.
#[derive(Debug, Clone)]
struct ClientFinalMessage {
    channel_binding: String,
    nonce: String,
    proof: String,
    without_proof: String,
}

impl ScramServer {
    pub fn new(hash: ScramHash) -> Self {
        Self {
            hash,
            state: ScramState::Initial,
            client_first_message_bare: String::new(),
            server_first_message: String::new(),
            client_nonce: String::new(),
            combined_nonce: String::new(),
            username: String::new(),
            credentials: None,
        }
    }

    pub fn state(&self) -> &ScramState {
        &self.state
    }

    /// Username extracted from the client-first-message.
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Parse the client-first-message and return the username to look up.
    pub fn process_client_first(&mut self, client_first: &str) -> Result<String, SaslError> {
        if self.state != ScramState::Initial {
            return Err(SaslError::MalformedRequest("unexpected client-first-message".into()));
        }
        let parsed = parse_client_first(client_first)?;

        if parsed.gs2_cbind_flag != 'n' {
            self.state = ScramState::Complete;
            return Err(SaslError::MalformedRequest("channel binding not supported".into()));
        }
        if let Some(authzid) = &parsed.authzid {
            if authzid != &parsed.username && !authzid.starts_with(&format!("{}@", parsed.username)) {
                self.state = ScramState::Complete;
                return Err(SaslError::InvalidAuthzid);
            }
        }

        self.username = parsed.username;
        self.client_first_message_bare = parsed.bare;
        self.client_nonce = parsed.client_nonce;
        self.state = ScramState::ClientFirstReceived;
        Ok(self.username.clone())
    }

    /// Build the server-first-message from the user's stored keys.
    pub fn server_first(&mut self, credentials: ScramCredentials) -> Result<String, SaslError> {
        if self.state != ScramState::ClientFirstReceived {
            return Err(SaslError::MalformedRequest("unexpected server-first".into()));
        }
        self.combined_nonce = format!("{}{}", self.client_nonce, generate_nonce());
        self.server_first_message = format!(
            "r={},s={},i={}",
            self.combined_nonce,
            BASE64_STANDARD.encode(&credentials.salt),
            credentials.iterations
        );
        self.credentials = Some(credentials);
        self.state = ScramState::WaitingForClientFinal;
        Ok(self.server_first_message.clone())
    }

    /// Verify the client proof and build the server-final-message.
    pub fn process_client_final(&mut self, client_final: &str) -> Result<String, SaslError> {
        if self.state != ScramState::WaitingForClientFinal {
            return Err(SaslError::MalformedRequest("unexpected client-final-message".into()));
        }
        self.state = ScramState::Complete;
        let credentials = self
            .credentials
            .take()
            .ok_or_else(|| SaslError::TemporaryAuthFailure("missing credentials".into()))?;

        let parsed = parse_client_final(client_final)?;
        if parsed.nonce != self.combined_nonce {
            return Err(SaslError::NotAuthorized);
        }
        // Without channel binding the only valid value is base64("n,,") or
        // the GS2 header echoed back with an authzid.
        if BASE64_STANDARD.decode(&parsed.channel_binding).is_err() {
            return Err(SaslError::IncorrectEncoding);
        }

        // AuthMessage = client-first-message-bare + "," + server-first-message + "," + client-final-message-without-proof
        let auth_message = format!(
            "{},{},{}",
            self.client_first_message_bare, self.server_first_message, parsed.without_proof
        );

        let client_signature = self.hash.hmac(&credentials.stored_key, auth_message.as_bytes())?;
        let client_proof = BASE64_STANDARD
            .decode(&parsed.proof)
            .map_err(|_| SaslError::IncorrectEncoding)?;
        if client_proof.len() != client_signature.len() {
            return Err(SaslError::NotAuthorized);
        }

        // ClientKey = ClientProof XOR ClientSignature; H(ClientKey) must equal StoredKey
        let client_key: Vec<u8> = client_proof
            .iter()
            .zip(client_signature.iter())
            .map(|(a, b)| a ^ b)
            .collect();
        if !constant_time_eq(&self.hash.digest(&client_key), &credentials.stored_key) {
            return Err(SaslError::NotAuthorized);
        }

        let server_signature = self.hash.hmac(&credentials.server_key, auth_message.as_bytes())?;
        Ok(format!("v={}", BASE64_STANDARD.encode(&server_signature)))
    }
}

/// Generate a random salt for SCRAM.
pub fn generate_salt() -> Vec<u8> {
    let mut salt = vec![0u8; 16];
    rand::rng().fill(&mut salt[..]);
    salt
}

fn generate_nonce() -> String {
    let mut nonce_bytes = vec![0u8; NONCE_LENGTH];
    rand::rng().fill(&mut nonce_bytes[..]);
    BASE64_STANDARD.encode(&nonce_bytes)
}

pub(crate) fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Parse client-first-message.
///
/// Format: `gs2-header client-first-message-bare`
/// gs2-header: `[flag],authzid,`
/// client-first-message-bare: `n=username,r=nonce[,extensions]`
fn parse_client_first(message: &str) -> Result<ClientFirstMessage, SaslError> {
    let parts: Vec<&str> = message.splitn(3, ',').collect();
    if parts.len() < 3 {
        return Err(SaslError::MalformedRequest("invalid client-first-message".into()));
    }

    let gs2_cbind_flag = parts[0]
        .chars()
        .next()
        .ok_or_else(|| SaslError::MalformedRequest("missing GS2 flag".into()))?;

    let authzid = if let Some(a) = parts[1].strip_prefix("a=") {
        Some(decode_sasl_name(a)?)
    } else if parts[1].is_empty() {
        None
    } else {
        return Err(SaslError::MalformedRequest("invalid authzid".into()));
    };

    let bare = parts[2].to_string();
    let mut username = None;
    let mut client_nonce = None;
    for attr in bare.split(',') {
        if let Some(val) = attr.strip_prefix("n=") {
            username = Some(decode_sasl_name(val)?);
        } else if let Some(val) = attr.strip_prefix("r=") {
            client_nonce = Some(val.to_string());
        }
    }

    let username = username
        .filter(|u| !u.is_empty())
        .ok_or_else(|| SaslError::MalformedRequest("missing username".into()))?;
    let client_nonce = client_nonce
        .filter(|n| !n.is_empty())
        .ok_or_else(|| SaslError::MalformedRequest("missing nonce".into()))?;

    Ok(ClientFirstMessage {
        gs2_cbind_flag,
        authzid,
        username,
        client_nonce,
        bare,
    })
}

/// Parse client-final-message.
///
/// Format: `c=channel-binding,r=nonce,p=proof`
fn parse_client_final(message: &str) -> Result<ClientFinalMessage, SaslError> {
    let proof_idx = message
        .rfind(",p=")
        .ok_or_else(|| SaslError::MalformedRequest("missing proof".into()))?;
    let without_proof = &message[..proof_idx];

    let mut channel_binding = None;
    let mut nonce = None;
    let mut proof = None;
    for attr in message.split(',') {
        if let Some(val) = attr.strip_prefix("c=") {
            channel_binding = Some(val.to_string());
        } else if let Some(val) = attr.strip_prefix("r=") {
            nonce = Some(val.to_string());
        } else if let Some(val) = attr.strip_prefix("p=") {
            proof = Some(val.to_string());
        }
    }

    Ok(ClientFinalMessage {
        channel_binding: channel_binding
            .ok_or_else(|| SaslError::MalformedRequest("missing channel binding".into()))?,
        nonce: nonce.ok_or_else(|| SaslError::MalformedRequest("missing nonce".into()))?,
        proof: proof.ok_or_else(|| SaslError::MalformedRequest("missing proof".into()))?,
        without_proof: without_proof.to_string(),
    })
}

/// Decode a SASL name (RFC 5802 escaping).
/// - `=2C` -> `,`
/// - `=3D` -> `=`
fn decode_sasl_name(name: &str) -> Result<String, SaslError> {
    let mut result = String::new();
    let mut chars = name.chars();
    while let Some(c) = chars.next() {
        if c == '=' {
            let escape: String = chars.by_ref().take(2).collect();
            match escape.as_str() {
                "2C" => result.push(','),
                "3D" => result.push('='),
                _ => return Err(SaslError::MalformedRequest(format!("invalid SASL name escape: ={escape}"))),
            }
        } else {
            result.push(c);
        }
    }
    Ok(result)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Client side of a SCRAM exchange, enough to drive the server in tests.
    pub(crate) fn client_final(
        hash: ScramHash,
        password: &str,
        client_first_bare: &str,
        server_first: &str,
    ) -> (String, Vec<u8>) {
        let mut nonce = "";
        let mut salt = Vec::new();
        let mut iterations = 0;
        for attr in server_first.split(',') {
            if let Some(v) = attr.strip_prefix("r=") {
                nonce = v;
            } else if let Some(v) = attr.strip_prefix("s=") {
                salt = BASE64_STANDARD.decode(v).unwrap();
            } else if let Some(v) = attr.strip_prefix("i=") {
                iterations = v.parse().unwrap();
            }
        }
        let salted = hash.hi(password.as_bytes(), &salt, iterations);
        let client_key = hash.hmac(&salted, b"Client Key").unwrap();
        let stored_key = hash.digest(&client_key);
        let server_key = hash.hmac(&salted, b"Server Key").unwrap();

        let without_proof = format!("c={},r={}", BASE64_STANDARD.encode("n,,"), nonce);
        let auth_message = format!("{client_first_bare},{server_first},{without_proof}");
        let signature = hash.hmac(&stored_key, auth_message.as_bytes()).unwrap();
        let proof: Vec<u8> = client_key.iter().zip(signature.iter()).map(|(a, b)| a ^ b).collect();
        let server_signature = hash.hmac(&server_key, auth_message.as_bytes()).unwrap();
        (
            format!("{without_proof},p={}", BASE64_STANDARD.encode(proof)),
            server_signature,
        )
    }

    fn run_exchange(hash: ScramHash, stored_password: &str, password: &str) -> Result<String, SaslError> {
        let credentials = ScramCredentials::derive(hash, stored_password, generate_salt(), 4096).unwrap();
        let mut server = ScramServer::new(hash);
        let username = server.process_client_first("n,,n=ortuman,r=fyko+d2lbbFgONRv9qkxdawL")?;
        assert_eq!(username, "ortuman");
        let server_first = server.server_first(credentials)?;
        assert!(server_first.starts_with("r=fyko+d2lbbFgONRv9qkxdawL"));

        let (final_msg, expected_signature) =
            client_final(hash, password, "n=ortuman,r=fyko+d2lbbFgONRv9qkxdawL", &server_first);
        let server_final = server.process_client_final(&final_msg)?;
        assert_eq!(
            server_final,
            format!("v={}", BASE64_STANDARD.encode(expected_signature))
        );
        Ok(server_final)
    }

    #[test]
    fn test_full_exchange_all_hashes() {
        for hash in [ScramHash::Sha1, ScramHash::Sha256, ScramHash::Sha512] {
            assert!(run_exchange(hash, "pencil", "pencil").is_ok());
        }
    }

    #[test]
    fn test_wrong_password() {
        let credentials = ScramCredentials::derive(ScramHash::Sha256, "pencil", generate_salt(), 4096).unwrap();
        let mut server = ScramServer::new(ScramHash::Sha256);
        server.process_client_first("n,,n=ortuman,r=abc").unwrap();
        let server_first = server.server_first(credentials).unwrap();
        let (final_msg, _) = client_final(ScramHash::Sha256, "crayon", "n=ortuman,r=abc", &server_first);
        assert_eq!(
            server.process_client_final(&final_msg),
            Err(SaslError::NotAuthorized)
        );
        assert_eq!(server.state(), &ScramState::Complete);
    }

    #[test]
    fn test_channel_binding_rejected() {
        let mut server = ScramServer::new(ScramHash::Sha1);
        assert!(server.process_client_first("p=tls-unique,,n=user,r=abc").is_err());
    }

    #[test]
    fn test_malformed_client_first() {
        let mut server = ScramServer::new(ScramHash::Sha1);
        assert!(matches!(
            server.process_client_first("garbage"),
            Err(SaslError::MalformedRequest(_))
        ));
    }

    #[test]
    fn test_sasl_name_escaping() {
        assert_eq!(decode_sasl_name("a=2Cb=3Dc").unwrap(), "a,b=c");
        assert!(decode_sasl_name("a=ZZ").is_err());
    }

    #[test]
    fn test_verify_password() {
        let creds = ScramCredentials::derive(ScramHash::Sha256, "secret", generate_salt(), 4096).unwrap();
        assert!(creds.verify_password(ScramHash::Sha256, "secret").unwrap());
        assert!(!creds.verify_password(ScramHash::Sha256, "other").unwrap());
    }

    #[test]
    fn test_password_material_uses_distinct_salts() {
        let material = PasswordMaterial::derive("secret", 4096).unwrap();
        assert_ne!(material.sha1.salt, material.sha256.salt);
        assert_eq!(material.for_hash(ScramHash::Sha512).stored_key.len(), 64);
    }
}
