//! SCRAM-SHA-256 client authentication.
//!
//! Implements the client side of RFC 5802 / RFC 7677 as postgres speaks it.
//! The server learns the username from the startup message, so the
//! client-first-message carries an empty SASL name.
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

/// Mechanism name without channel binding.
pub const SCRAM_SHA_256: &str = "SCRAM-SHA-256";

/// Mechanism name with tls-server-end-point channel binding.
pub const SCRAM_SHA_256_PLUS: &str = "SCRAM-SHA-256-PLUS";

/// SCRAM-SHA-256 client state machine.
///
/// Drives the client-first / server-first / client-final / server-final
/// exchange. The caller owns the transport; this type only computes the
/// message payloads.
pub struct ScramClient {
    password: String,
    client_nonce: String,
    auth_message: String,
    salted_password: [u8; 32],
}

impl ScramClient {
    pub fn new(password: &str) -> ScramClient {
        // 18 bytes of randomness, base64 encoded (24 chars)
        let nonce_bytes: [u8; 18] = rand::thread_rng().gen();
        ScramClient {
            password: password.to_string(),
            client_nonce: BASE64.encode(nonce_bytes),
            auth_message: String::new(),
            salted_password: [0; 32],
        }
    }

    fn client_first_bare(&self) -> String {
        format!("n=,r={}", self.client_nonce)
    }

    /// The client-first-message, sent in SASLInitialResponse.
    ///
    /// The `n,,` GS2 header means no channel binding and no authzid.
    pub fn client_first_message(&self) -> String {
        format!("n,,{}", self.client_first_bare())
    }

    /// Process the server-first-message (`r=<nonce>,s=<salt>,i=<iterations>`)
    /// and produce the client-final-message.
    pub fn process_server_first(&mut self, server_first: &[u8]) -> Result<String, SaslError> {
        let server_first =
            std::str::from_utf8(server_first).map_err(|_| SaslError::InvalidServerMessage)?;

        let mut nonce = None;
        let mut salt = None;
        let mut iterations = None;

        for part in server_first.split(',') {
            if let Some(value) = part.strip_prefix("r=") {
                nonce = Some(value.to_string());
            } else if let Some(value) = part.strip_prefix("s=") {
                salt = Some(BASE64.decode(value).map_err(|_| SaslError::InvalidSalt)?);
            } else if let Some(value) = part.strip_prefix("i=") {
                iterations = Some(value.parse::<u32>().map_err(|_| SaslError::InvalidIterations)?);
            }
        }

        let combined_nonce = nonce.ok_or(SaslError::MissingNonce)?;
        let salt = salt.ok_or(SaslError::MissingSalt)?;
        let iterations = iterations.ok_or(SaslError::MissingIterations)?;

        // The combined nonce must extend the one we sent.
        if !combined_nonce.starts_with(&self.client_nonce) {
            return Err(SaslError::NonceMismatch);
        }

        self.salted_password = hi(&self.password, &salt, iterations);

        // c=biws is base64("n,,"), matching the GS2 header sent in
        // the client-first-message.
        let client_final_without_proof = format!("c=biws,r={combined_nonce}");
        self.auth_message = format!(
            "{},{},{}",
            self.client_first_bare(),
            server_first,
            client_final_without_proof
        );

        let client_key = hmac_sha256(&self.salted_password, b"Client Key");
        let stored_key = sha256(&client_key);
        let client_signature = hmac_sha256(&stored_key, self.auth_message.as_bytes());

        let mut client_proof = [0u8; 32];
        for i in 0..32 {
            client_proof[i] = client_key[i] ^ client_signature[i];
        }

        Ok(format!(
            "{client_final_without_proof},p={}",
            BASE64.encode(client_proof)
        ))
    }

    /// Verify the server-final-message (`v=<verifier>`) proves the server
    /// also knows the password.
    pub fn verify_server_final(&self, server_final: &[u8]) -> Result<(), SaslError> {
        let server_final =
            std::str::from_utf8(server_final).map_err(|_| SaslError::InvalidServerMessage)?;

        let verifier = server_final
            .strip_prefix("v=")
            .ok_or(SaslError::InvalidServerSignature)?;
        let server_signature = BASE64
            .decode(verifier)
            .map_err(|_| SaslError::InvalidServerSignature)?;

        let server_key = hmac_sha256(&self.salted_password, b"Server Key");
        let expected = hmac_sha256(&server_key, self.auth_message.as_bytes());

        if server_signature != expected {
            return Err(SaslError::ServerSignatureMismatch);
        }
        Ok(())
    }
}

/// SCRAM exchange failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SaslError {
    #[error("server SASL message is not valid utf8")]
    InvalidServerMessage,
    #[error("server salt is not valid base64")]
    InvalidSalt,
    #[error("invalid iteration count")]
    InvalidIterations,
    #[error("server-first-message carries no nonce")]
    MissingNonce,
    #[error("server-first-message carries no salt")]
    MissingSalt,
    #[error("server-first-message carries no iteration count")]
    MissingIterations,
    #[error("server nonce does not extend the client nonce")]
    NonceMismatch,
    #[error("server-final-message carries no valid signature")]
    InvalidServerSignature,
    #[error("server signature mismatch")]
    ServerSignatureMismatch,
}

/// Hi() per RFC 5802: PBKDF2 with HMAC-SHA-256.
fn hi(password: &str, salt: &[u8], iterations: u32) -> [u8; 32] {
    let mut output = [0u8; 32];
    pbkdf2::pbkdf2::<HmacSha256>(password.as_bytes(), salt, iterations, &mut output)
        .expect("valid output length");
    output
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scram_exchange_shape() {
        let mut client = ScramClient::new("pencil");

        let first = client.client_first_message();
        assert!(first.starts_with("n,,n=,r="));

        let client_nonce = first.strip_prefix("n,,n=,r=").unwrap().to_string();
        let server_first = format!(
            "r={client_nonce}SERVERNONCE,s={},i=4096",
            BASE64.encode(b"salt1234salt1234")
        );

        let client_final = client.process_server_first(server_first.as_bytes()).unwrap();
        assert!(client_final.starts_with(&format!("c=biws,r={client_nonce}SERVERNONCE,p=")));
    }

    #[test]
    fn rejects_foreign_nonce() {
        let mut client = ScramClient::new("pencil");
        let server_first = format!("r=notmine,s={},i=4096", BASE64.encode(b"salt"));
        assert_eq!(
            client.process_server_first(server_first.as_bytes()),
            Err(SaslError::NonceMismatch)
        );
    }

    #[test]
    fn verifies_server_signature() {
        // run both sides with a known salt so the expected signature
        // can be computed independently
        let mut client = ScramClient::new("pencil");
        let first = client.client_first_message();
        let client_nonce = first.strip_prefix("n,,n=,r=").unwrap().to_string();

        let salt = b"0123456789abcdef";
        let server_first = format!("r={client_nonce}XYZ,s={},i=1024", BASE64.encode(salt));
        let client_final = client.process_server_first(server_first.as_bytes()).unwrap();

        // recompute the server signature the way the server would
        let salted = hi("pencil", salt, 1024);
        let bare = format!("n=,r={client_nonce}");
        let without_proof = client_final.rsplit_once(",p=").unwrap().0;
        let auth_message = format!("{bare},{server_first},{without_proof}");
        let server_key = hmac_sha256(&salted, b"Server Key");
        let signature = hmac_sha256(&server_key, auth_message.as_bytes());

        let server_final = format!("v={}", BASE64.encode(signature));
        client.verify_server_final(server_final.as_bytes()).unwrap();

        assert_eq!(
            client.verify_server_final(b"v=AAAA"),
            Err(SaslError::ServerSignatureMismatch)
        );
    }
}
