use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hex::ToHex;
use pik_contracts::API_KEY_PREFIX;
use rand::RngCore;
use rand::rngs::OsRng;
use serde::Deserialize;
use sha2::Digest;
use webauthn_rs::prelude::*;

#[derive(Debug, Clone)]
pub struct AuthError {
    pub code: &'static str,
    pub message: String,
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for AuthError {}

#[derive(Debug, Clone)]
pub struct PasskeyConfig {
    pub rp_id: String,
    pub rp_name: String,
    pub origin: String,
}

/// Thin wrapper over the WebAuthn verifier. The engine's callers own
/// challenge lifetime, credential storage and counter discipline; this type
/// only runs the cryptographic ceremonies against the configured relying
/// party.
#[derive(Clone, Debug)]
pub struct PasskeyEngine {
    webauthn: Webauthn,
}

impl PasskeyEngine {
    pub fn new(config: &PasskeyConfig) -> Result<Self, AuthError> {
        let origin = Url::parse(&config.origin).map_err(|_| AuthError {
            code: "ERR_WEBAUTHN_CONFIG",
            message: format!("WEBAUTHN_ORIGIN `{}` is not a valid URL", config.origin),
        })?;

        let webauthn = WebauthnBuilder::new(&config.rp_id, &origin)
            .map_err(|err| AuthError {
                code: "ERR_WEBAUTHN_CONFIG",
                message: format!("invalid relying party configuration: {}", err),
            })?
            .rp_name(&config.rp_name)
            .build()
            .map_err(|err| AuthError {
                code: "ERR_WEBAUTHN_CONFIG",
                message: format!("failed to build WebAuthn verifier: {}", err),
            })?;

        Ok(Self { webauthn })
    }

    pub fn start_registration(
        &self,
        display_name: &str,
        exclude: Vec<CredentialID>,
    ) -> Result<(CreationChallengeResponse, PasskeyRegistration), AuthError> {
        let exclude = if exclude.is_empty() {
            None
        } else {
            Some(exclude)
        };
        self.webauthn
            .start_passkey_registration(Uuid::new_v4(), display_name, display_name, exclude)
            .map_err(verify_error)
    }

    pub fn finish_registration(
        &self,
        credential: &RegisterPublicKeyCredential,
        state: &PasskeyRegistration,
    ) -> Result<Passkey, AuthError> {
        self.webauthn
            .finish_passkey_registration(credential, state)
            .map_err(verify_error)
    }

    pub fn start_authentication(
        &self,
        credentials: &[Passkey],
    ) -> Result<(RequestChallengeResponse, PasskeyAuthentication), AuthError> {
        self.webauthn
            .start_passkey_authentication(credentials)
            .map_err(verify_error)
    }

    pub fn start_discoverable(
        &self,
    ) -> Result<(RequestChallengeResponse, DiscoverableAuthentication), AuthError> {
        self.webauthn
            .start_discoverable_authentication()
            .map_err(verify_error)
    }

    pub fn finish_authentication(
        &self,
        credential: &PublicKeyCredential,
        state: &PasskeyAuthentication,
    ) -> Result<AuthenticationResult, AuthError> {
        self.webauthn
            .finish_passkey_authentication(credential, state)
            .map_err(verify_error)
    }

    pub fn finish_discoverable(
        &self,
        credential: &PublicKeyCredential,
        state: DiscoverableAuthentication,
        keys: &[DiscoverableKey],
    ) -> Result<AuthenticationResult, AuthError> {
        self.webauthn
            .finish_discoverable_authentication(credential, state, keys)
            .map_err(verify_error)
    }
}

fn verify_error(err: WebauthnError) -> AuthError {
    AuthError {
        code: "ERR_WEBAUTHN_VERIFY",
        message: format!("webauthn verification failed: {}", err),
    }
}

pub fn registration_challenge(ccr: &CreationChallengeResponse) -> String {
    URL_SAFE_NO_PAD.encode(ccr.public_key.challenge.as_ref())
}

pub fn request_challenge(rcr: &RequestChallengeResponse) -> String {
    URL_SAFE_NO_PAD.encode(rcr.public_key.challenge.as_ref())
}

#[derive(Debug, Deserialize)]
struct ClientData {
    challenge: String,
}

/// Pulls the challenge string out of `clientDataJSON` so the stored
/// challenge row can be located before verification runs.
pub fn client_data_challenge(client_data_json: &[u8]) -> Result<String, AuthError> {
    let data: ClientData = serde_json::from_slice(client_data_json).map_err(|_| AuthError {
        code: "ERR_CLIENT_DATA",
        message: "clientDataJSON is not valid JSON".to_string(),
    })?;

    let challenge = data.challenge.trim();
    if challenge.is_empty() {
        return Err(AuthError {
            code: "ERR_CLIENT_DATA",
            message: "clientDataJSON carries no challenge".to_string(),
        });
    }
    Ok(challenge.to_string())
}

pub fn registration_client_challenge(
    credential: &RegisterPublicKeyCredential,
) -> Result<String, AuthError> {
    client_data_challenge(credential.response.client_data_json.as_ref())
}

pub fn assertion_client_challenge(credential: &PublicKeyCredential) -> Result<String, AuthError> {
    client_data_challenge(credential.response.client_data_json.as_ref())
}

pub fn credential_id_str(id: &CredentialID) -> String {
    URL_SAFE_NO_PAD.encode(id.as_ref())
}

pub fn credential_id_from_str(id: &str) -> Result<CredentialID, AuthError> {
    let bytes = URL_SAFE_NO_PAD.decode(id).map_err(|_| AuthError {
        code: "ERR_CLIENT_DATA",
        message: "credential id is not base64url".to_string(),
    })?;
    Ok(CredentialID::from(bytes))
}

/// Opaque session credential: 32 random bytes as lowercase hex. Only the
/// SHA-256 of this value is ever persisted.
pub fn new_session_token() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Source API key: `pik_` + 48 hex chars (24 random bytes). Returned to the
/// operator exactly once; the store keeps the hash.
pub fn new_api_key() -> String {
    let mut bytes = [0u8; 24];
    OsRng.fill_bytes(&mut bytes);
    format!("{}{}", API_KEY_PREFIX, hex::encode(bytes))
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = sha2::Sha256::new();
    hasher.update(bytes);
    hasher.finalize().encode_hex::<String>()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_tokens_are_64_lowercase_hex_and_unique() {
        let a = new_session_token();
        let b = new_session_token();
        assert_eq!(a.len(), pik_contracts::SESSION_TOKEN_HEX_LEN);
        assert!(a.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')));
        assert_ne!(a, b);
    }

    #[test]
    fn api_keys_match_the_published_format() {
        let key = new_api_key();
        assert!(pik_contracts::is_valid_api_key(&key));
        assert_ne!(key, new_api_key());
    }

    #[test]
    fn sha256_hex_matches_known_vector() {
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn client_data_challenge_extracts_the_challenge_field() {
        let raw = br#"{"type":"webauthn.create","challenge":"dGVzdC1jaGFsbGVuZ2U","origin":"http://localhost:8080"}"#;
        let challenge = client_data_challenge(raw).unwrap();
        assert_eq!(challenge, "dGVzdC1jaGFsbGVuZ2U");
    }

    #[test]
    fn client_data_challenge_rejects_garbage() {
        assert!(client_data_challenge(b"not json").is_err());
        assert!(client_data_challenge(br#"{"challenge":"  "}"#).is_err());
    }

    #[test]
    fn credential_ids_round_trip_through_base64url() {
        let id = CredentialID::from(vec![1u8, 2, 3, 250, 251, 252]);
        let encoded = credential_id_str(&id);
        let decoded = credential_id_from_str(&encoded).unwrap();
        assert_eq!(id, decoded);
    }

    #[test]
    fn engine_rejects_a_malformed_origin() {
        let err = PasskeyEngine::new(&PasskeyConfig {
            rp_id: "localhost".to_string(),
            rp_name: "PIK".to_string(),
            origin: "not a url".to_string(),
        })
        .unwrap_err();
        assert_eq!(err.code, "ERR_WEBAUTHN_CONFIG");
    }
}
