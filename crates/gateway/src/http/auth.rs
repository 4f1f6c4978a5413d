use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::Json;
use chrono::{DateTime, Utc};
use pik_auth::{
    assertion_client_challenge, credential_id_from_str, credential_id_str, new_session_token,
    registration_challenge, registration_client_challenge, request_challenge, sha256_hex,
};
use pik_contracts::{ChallengeKind, event_types};
use pik_ledger::{
    AuthKeyRow, ChallengeRow, FirstTimeEnrollment, LinkSpec, NewAuthKey, NewChallenge,
    RegistrationTarget, RevokeKeyOutcome,
};
use serde::Deserialize;
use serde_json::json;
use webauthn_rs::prelude::{
    DiscoverableAuthentication, DiscoverableKey, Passkey, PasskeyAuthentication,
    PasskeyRegistration, PublicKeyCredential, RegisterPublicKeyCredential,
};

use crate::config::RuntimeEnv;

use super::{
    ApiError, ApiResult, AppState, bad_request, conflict, forbidden, internal_error,
    kernel_settings, not_found, ok, publish_events, session_root, store_error, unauthorized,
};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(super) struct RegisterOptionsRequest {
    hero_name: String,
    fate_alignment: String,
    origin: Option<String>,
    source_id: Option<String>,
}

pub(super) async fn register_options(
    State(state): State<AppState>,
    req: Result<Json<RegisterOptionsRequest>, JsonRejection>,
) -> ApiResult {
    let Json(req) = req.map_err(|_| bad_request("invalid JSON body"))?;

    let hero_name = req.hero_name.trim();
    let fate_alignment = req.fate_alignment.trim();
    if hero_name.is_empty() || fate_alignment.is_empty() {
        return Err(bad_request("hero_name and fate_alignment must be non-empty"));
    }

    if let Some(source_id) = req.source_id.as_deref() {
        let source = state
            .store
            .get_source(source_id)
            .await
            .map_err(store_error)?
            .ok_or_else(|| not_found("Unknown source"))?;
        if !source.is_active() {
            return Err(bad_request("Source is not active"));
        }
    }

    let (ccr, reg_state) = state
        .passkeys
        .start_registration(hero_name, Vec::new())
        .map_err(|err| {
            tracing::error!(error = %err, "webauthn.start_registration_failed");
            internal_error()
        })?;

    let challenge = registration_challenge(&ccr);
    let metadata = json!({
        "purpose": "enroll",
        "hero_name": hero_name,
        "fate_alignment": fate_alignment,
        "origin": req.origin.as_deref().map(str::trim).filter(|o| !o.is_empty()),
        "source_id": req.source_id,
        "state": reg_state,
    });

    state
        .store
        .create_challenge(NewChallenge {
            challenge: &challenge,
            kind: ChallengeKind::Registration,
            root_id: None,
            metadata,
            expires_at: challenge_expiry(&state),
        })
        .await
        .map_err(store_error)?;

    Ok(ok(serde_json::to_value(&ccr).map_err(|_| internal_error())?))
}

#[derive(Debug, Deserialize)]
pub(super) struct RegisterVerifyRequest {
    credential: RegisterPublicKeyCredential,
    friendly_name: Option<String>,
    device_type: Option<String>,
}

pub(super) async fn register_verify(
    State(state): State<AppState>,
    req: Result<Json<RegisterVerifyRequest>, JsonRejection>,
) -> ApiResult {
    let Json(req) = req.map_err(|_| bad_request("invalid JSON body"))?;

    let row = consume_challenge(
        &state,
        registration_client_challenge(&req.credential)
            .map_err(|_| bad_request("invalid clientDataJSON"))?,
        ChallengeKind::Registration,
    )
    .await?;

    let metadata = row.metadata.clone().unwrap_or_else(|| json!({}));
    if metadata.get("purpose").and_then(|v| v.as_str()) != Some("enroll") {
        return Err(bad_request("challenge was not issued for enrollment"));
    }

    let reg_state: PasskeyRegistration =
        serde_json::from_value(metadata.get("state").cloned().unwrap_or_default()).map_err(
            |_| {
                tracing::error!("webauthn.challenge_state_corrupt");
                internal_error()
            },
        )?;

    let passkey = state
        .passkeys
        .finish_registration(&req.credential, &reg_state)
        .map_err(|err| {
            tracing::warn!(error = %err, "webauthn.registration_rejected");
            bad_request("attestation verification failed")
        })?;

    let hero_name = metadata
        .get("hero_name")
        .and_then(|v| v.as_str())
        .ok_or_else(internal_error)?
        .to_string();
    let fate_alignment = metadata
        .get("fate_alignment")
        .and_then(|v| v.as_str())
        .ok_or_else(internal_error)?
        .to_string();
    let origin = metadata
        .get("origin")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    let link = match metadata.get("source_id").and_then(|v| v.as_str()) {
        Some(source_id) => {
            let source = state
                .store
                .get_source(source_id)
                .await
                .map_err(store_error)?;
            match source {
                Some(source) if source.is_active() => {
                    let scope = kernel_settings(&state).await?.default_link_scope;
                    Some((source.source_id, scope))
                }
                _ => None,
            }
        }
        None => None,
    };

    let credential_id = credential_id_str(passkey.cred_id());
    let passkey_json = serde_json::to_value(&passkey).map_err(|_| internal_error())?;
    let transports = serde_json::to_value(
        req.credential
            .response
            .transports
            .clone()
            .unwrap_or_default(),
    )
    .map_err(|_| internal_error())?;

    let record = state
        .store
        .register_key(
            RegistrationTarget::NewIdentity(FirstTimeEnrollment {
                hero_name: &hero_name,
                fate_alignment: &fate_alignment,
                origin: origin.as_deref(),
                enrolled_by: "passkey-enrollment",
                link: link.as_ref().map(|(source_id, scope)| LinkSpec {
                    source_id,
                    granted_by: "passkey-enrollment",
                    scope,
                }),
            }),
            NewAuthKey {
                credential_id: &credential_id,
                passkey_json: &passkey_json,
                sign_count: 0,
                device_type: req.device_type.as_deref(),
                transports: &transports,
                friendly_name: req.friendly_name.as_deref(),
            },
        )
        .await
        .map_err(|err| {
            if err.is_unique_violation() {
                conflict("Credential already registered")
            } else {
                store_error(err)
            }
        })?;

    let (session_token, session_expires_at) = issue_session(&state, &record.root_id).await?;
    publish_events(&state, &record.events);
    tracing::info!(root_id = %record.root_id, key_id = %record.key_id, "auth.enrolled");

    Ok(ok(json!({
        "root_id": record.root_id,
        "key_id": record.key_id,
        "hero_name": hero_name,
        "session_token": session_token,
        "session_expires_at": session_expires_at,
        "link_id": record.link_id,
    })))
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(super) struct AuthenticateOptionsRequest {
    #[serde(default)]
    root_id: Option<String>,
}

pub(super) async fn authenticate_options(
    State(state): State<AppState>,
    req: Result<Json<AuthenticateOptionsRequest>, JsonRejection>,
) -> ApiResult {
    let Json(req) = req.map_err(|_| bad_request("invalid JSON body"))?;

    let (rcr, metadata, root_id) = match req.root_id.as_deref() {
        Some(root_id) => {
            state
                .store
                .get_root(root_id)
                .await
                .map_err(store_error)?
                .ok_or_else(|| not_found("Unknown root identity"))?;

            let keys = state.store.active_keys(root_id).await.map_err(store_error)?;
            let passkeys = deserialize_passkeys(&keys);
            if passkeys.is_empty() {
                return Err(bad_request("No active keys for this identity"));
            }

            let (rcr, auth_state) = state
                .passkeys
                .start_authentication(&passkeys)
                .map_err(|err| {
                    tracing::error!(error = %err, "webauthn.start_authentication_failed");
                    internal_error()
                })?;
            (
                rcr,
                json!({ "mode": "scoped", "state": auth_state }),
                Some(root_id.to_string()),
            )
        }
        None => {
            let (rcr, auth_state) = state.passkeys.start_discoverable().map_err(|err| {
                tracing::error!(error = %err, "webauthn.start_discoverable_failed");
                internal_error()
            })?;
            (rcr, json!({ "mode": "discoverable", "state": auth_state }), None)
        }
    };

    let challenge = request_challenge(&rcr);
    state
        .store
        .create_challenge(NewChallenge {
            challenge: &challenge,
            kind: ChallengeKind::Authentication,
            root_id: root_id.as_deref(),
            metadata,
            expires_at: challenge_expiry(&state),
        })
        .await
        .map_err(store_error)?;

    Ok(ok(serde_json::to_value(&rcr).map_err(|_| internal_error())?))
}

#[derive(Debug, Deserialize)]
pub(super) struct AuthenticateVerifyRequest {
    credential: PublicKeyCredential,
}

pub(super) async fn authenticate_verify(
    State(state): State<AppState>,
    req: Result<Json<AuthenticateVerifyRequest>, JsonRejection>,
) -> ApiResult {
    let Json(req) = req.map_err(|_| bad_request("invalid JSON body"))?;

    let row = consume_challenge(
        &state,
        assertion_client_challenge(&req.credential)
            .map_err(|_| bad_request("invalid clientDataJSON"))?,
        ChallengeKind::Authentication,
    )
    .await?;

    let key = state
        .store
        .find_key_by_credential(&req.credential.id)
        .await
        .map_err(store_error)?
        .ok_or_else(|| unauthorized("Unknown credential"))?;
    if !key.is_active() {
        return Err(unauthorized("Credential is revoked"));
    }

    let root = state
        .store
        .get_root(&key.root_id)
        .await
        .map_err(store_error)?
        .ok_or_else(|| unauthorized("Unknown credential"))?;
    if !root.is_active() {
        return Err(unauthorized("Identity is not active"));
    }

    if let Some(challenge_root) = row.root_id.as_deref()
        && challenge_root != key.root_id
    {
        return Err(unauthorized("Credential does not match the challenge"));
    }

    let metadata = row.metadata.clone().unwrap_or_else(|| json!({}));
    let mode = metadata.get("mode").and_then(|v| v.as_str()).unwrap_or("scoped");
    let mut passkey: Passkey =
        serde_json::from_value(key.passkey_json.clone()).map_err(|_| {
            tracing::error!(key_id = %key.key_id, "webauthn.stored_passkey_corrupt");
            internal_error()
        })?;

    let result = match mode {
        "discoverable" => {
            let auth_state: DiscoverableAuthentication =
                serde_json::from_value(metadata.get("state").cloned().unwrap_or_default())
                    .map_err(|_| internal_error())?;
            let keys = [DiscoverableKey::from(&passkey)];
            state
                .passkeys
                .finish_discoverable(&req.credential, auth_state, &keys)
        }
        _ => {
            let auth_state: PasskeyAuthentication =
                serde_json::from_value(metadata.get("state").cloned().unwrap_or_default())
                    .map_err(|_| internal_error())?;
            state.passkeys.finish_authentication(&req.credential, &auth_state)
        }
    }
    .map_err(|err| {
        tracing::warn!(error = %err, key_id = %key.key_id, "webauthn.assertion_rejected");
        unauthorized("Assertion verification failed")
    })?;

    // An equal or lower counter on a key that has counted before signals a
    // cloned authenticator.
    let new_counter = i64::from(result.counter());
    if key.sign_count > 0 && new_counter <= key.sign_count {
        tracing::warn!(
            key_id = %key.key_id,
            stored = key.sign_count,
            presented = new_counter,
            "webauthn.counter_regression"
        );
        return Err(unauthorized("Credential counter regression"));
    }

    passkey.update_credential(&result);
    let passkey_json = serde_json::to_value(&passkey).map_err(|_| internal_error())?;

    let events = state
        .store
        .record_authentication(
            &key.key_id,
            &key.root_id,
            &passkey_json,
            new_counter,
            result.backup_state(),
        )
        .await
        .map_err(store_error)?;
    publish_events(&state, &events);

    let (session_token, session_expires_at) = issue_session(&state, &key.root_id).await?;
    tracing::info!(root_id = %key.root_id, key_id = %key.key_id, "auth.authenticated");

    Ok(ok(json!({
        "root_id": key.root_id,
        "key_id": key.key_id,
        "session_token": session_token,
        "session_expires_at": session_expires_at,
    })))
}

pub(super) async fn list_keys(State(state): State<AppState>, headers: HeaderMap) -> ApiResult {
    let root_id = session_root(&state, &headers).await?;
    let keys = state.store.list_keys(&root_id).await.map_err(store_error)?;
    Ok(ok(json!(keys.iter().map(key_json).collect::<Vec<_>>())))
}

pub(super) async fn rotate_options(State(state): State<AppState>, headers: HeaderMap) -> ApiResult {
    let root_id = session_root(&state, &headers).await?;
    let root = state
        .store
        .get_root(&root_id)
        .await
        .map_err(store_error)?
        .ok_or_else(|| not_found("Unknown root identity"))?;

    let keys = state.store.active_keys(&root_id).await.map_err(store_error)?;
    let exclude = keys
        .iter()
        .filter_map(|k| credential_id_from_str(&k.credential_id).ok())
        .collect::<Vec<_>>();

    let (ccr, reg_state) = state
        .passkeys
        .start_registration(&root.hero_name, exclude)
        .map_err(|err| {
            tracing::error!(error = %err, "webauthn.start_rotation_failed");
            internal_error()
        })?;

    let challenge = registration_challenge(&ccr);
    state
        .store
        .create_challenge(NewChallenge {
            challenge: &challenge,
            kind: ChallengeKind::Registration,
            root_id: Some(&root_id),
            metadata: json!({ "purpose": "rotation", "state": reg_state }),
            expires_at: challenge_expiry(&state),
        })
        .await
        .map_err(store_error)?;

    Ok(ok(serde_json::to_value(&ccr).map_err(|_| internal_error())?))
}

#[derive(Debug, Deserialize)]
pub(super) struct RotateVerifyRequest {
    credential: RegisterPublicKeyCredential,
    friendly_name: Option<String>,
    device_type: Option<String>,
}

pub(super) async fn rotate_verify(
    State(state): State<AppState>,
    headers: HeaderMap,
    req: Result<Json<RotateVerifyRequest>, JsonRejection>,
) -> ApiResult {
    let root_id = session_root(&state, &headers).await?;
    let Json(req) = req.map_err(|_| bad_request("invalid JSON body"))?;

    let row = consume_challenge(
        &state,
        registration_client_challenge(&req.credential)
            .map_err(|_| bad_request("invalid clientDataJSON"))?,
        ChallengeKind::Registration,
    )
    .await?;

    let metadata = row.metadata.clone().unwrap_or_else(|| json!({}));
    if metadata.get("purpose").and_then(|v| v.as_str()) != Some("rotation") {
        return Err(bad_request("challenge was not issued for key rotation"));
    }
    if row.root_id.as_deref() != Some(root_id.as_str()) {
        return Err(bad_request("challenge belongs to a different identity"));
    }

    let reg_state: PasskeyRegistration =
        serde_json::from_value(metadata.get("state").cloned().unwrap_or_default())
            .map_err(|_| internal_error())?;

    let passkey = state
        .passkeys
        .finish_registration(&req.credential, &reg_state)
        .map_err(|err| {
            tracing::warn!(error = %err, "webauthn.rotation_rejected");
            bad_request("attestation verification failed")
        })?;

    let credential_id = credential_id_str(passkey.cred_id());
    let passkey_json = serde_json::to_value(&passkey).map_err(|_| internal_error())?;
    let transports = serde_json::to_value(
        req.credential
            .response
            .transports
            .clone()
            .unwrap_or_default(),
    )
    .map_err(|_| internal_error())?;

    let record = state
        .store
        .register_key(
            RegistrationTarget::Existing(&root_id),
            NewAuthKey {
                credential_id: &credential_id,
                passkey_json: &passkey_json,
                sign_count: 0,
                device_type: req.device_type.as_deref(),
                transports: &transports,
                friendly_name: req.friendly_name.as_deref(),
            },
        )
        .await
        .map_err(|err| {
            if err.is_unique_violation() {
                conflict("Credential already registered")
            } else {
                store_error(err)
            }
        })?;

    publish_events(&state, &record.events);
    tracing::info!(root_id = %root_id, key_id = %record.key_id, "auth.key_rotated");

    Ok(ok(json!({
        "root_id": record.root_id,
        "key_id": record.key_id,
    })))
}

pub(super) async fn revoke_key(
    State(state): State<AppState>,
    Path(key_id): Path<String>,
    headers: HeaderMap,
) -> ApiResult {
    let root_id = session_root(&state, &headers).await?;

    match state
        .store
        .revoke_key(&root_id, &key_id)
        .await
        .map_err(store_error)?
    {
        RevokeKeyOutcome::Revoked { events } => {
            publish_events(&state, &events);
            tracing::info!(root_id = %root_id, key_id = %key_id, "auth.key_revoked");
            Ok(ok(json!({ "key_id": key_id, "status": "revoked" })))
        }
        RevokeKeyOutcome::LastActiveKey => Err(conflict("Cannot revoke the last active key")),
        RevokeKeyOutcome::AlreadyRevoked => Err(conflict("Key is already revoked")),
        RevokeKeyOutcome::NotFound => Err(not_found("Unknown key")),
    }
}

/// Operator backdoor: mints a session without a ceremony. Refused outright in
/// production.
pub(super) async fn impersonate(
    State(state): State<AppState>,
    Path(root_id): Path<String>,
) -> ApiResult {
    if state.config.env == RuntimeEnv::Production {
        return Err(forbidden("Impersonation is disabled in production"));
    }

    let root = state
        .store
        .get_root(&root_id)
        .await
        .map_err(store_error)?
        .ok_or_else(|| not_found("Unknown root identity"))?;
    if !root.is_active() {
        return Err(bad_request("Identity is not active"));
    }

    let (session_token, session_expires_at) = issue_session(&state, &root_id).await?;

    let event = state
        .store
        .append_event(
            &root_id,
            event_types::IDENTITY_AUTHENTICATED,
            None,
            json!({ "method": "impersonation" }),
            None,
        )
        .await
        .map_err(store_error)?;
    publish_events(&state, &[event]);
    tracing::warn!(root_id = %root_id, "auth.impersonated");

    Ok(ok(json!({
        "root_id": root_id,
        "session_token": session_token,
        "session_expires_at": session_expires_at,
    })))
}

/// Mints an opaque session token; only its hash is persisted.
pub(super) async fn issue_session(
    state: &AppState,
    root_id: &str,
) -> Result<(String, DateTime<Utc>), ApiError> {
    let settings = kernel_settings(state).await?;
    let token = new_session_token();
    let expires_at =
        Utc::now() + chrono::Duration::seconds(settings.session_token_ttl_secs as i64);

    state
        .store
        .insert_session_token(&sha256_hex(token.as_bytes()), root_id, expires_at)
        .await
        .map_err(store_error)?;

    Ok((token, expires_at))
}

fn challenge_expiry(state: &AppState) -> DateTime<Utc> {
    Utc::now() + chrono::Duration::seconds(state.config.challenge_ttl_secs as i64)
}

async fn consume_challenge(
    state: &AppState,
    challenge: String,
    expected: ChallengeKind,
) -> Result<ChallengeRow, ApiError> {
    let row = state
        .store
        .take_challenge(&challenge)
        .await
        .map_err(store_error)?
        .ok_or_else(|| bad_request("unknown or already-used challenge"))?;

    if row.kind() != Some(expected) {
        return Err(bad_request("challenge type mismatch"));
    }
    if row.is_expired() {
        return Err(bad_request("challenge expired"));
    }
    Ok(row)
}

fn deserialize_passkeys(keys: &[AuthKeyRow]) -> Vec<Passkey> {
    keys.iter()
        .filter_map(|key| match serde_json::from_value(key.passkey_json.clone()) {
            Ok(passkey) => Some(passkey),
            Err(_) => {
                tracing::warn!(key_id = %key.key_id, "webauthn.stored_passkey_corrupt");
                None
            }
        })
        .collect()
}

fn key_json(key: &AuthKeyRow) -> serde_json::Value {
    json!({
        "key_id": key.key_id,
        "credential_id": key.credential_id,
        "status": key.status,
        "friendly_name": key.friendly_name,
        "device_type": key.device_type,
        "backed_up": key.backed_up,
        "transports": key.transports,
        "sign_count": key.sign_count,
        "created_at": key.created_at,
        "last_used_at": key.last_used_at,
        "revoked_at": key.revoked_at,
    })
}
