// SPDX-FileCopyrightText: 2022 Profian Inc. <opensource@profian.com>
// SPDX-License-Identifier: Apache-2.0

use super::{Grant, State};
use crate::{Failure, PeerCertificate};

use std::sync::Arc;

use axum::extract::Extension;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;
use tracing::info;
use usage::token::COMPLETED;
use usage::{Claims, IssuedToken, Rejection, SignedDeclaration};

#[derive(Debug, Serialize)]
pub struct Completed {
    status: &'static str,

    #[serde(flatten)]
    token: IssuedToken,
}

/// Reconciles a usage declaration with the providing policy of its data
/// and issues a usage token for the saved terms.
pub async fn apply(
    Extension(state): Extension<Arc<State>>,
    peer: PeerCertificate,
    Json(declaration): Json<SignedDeclaration>,
) -> Result<(StatusCode, Json<Completed>), Failure> {
    let (subject, _) = state.attest(&peer)?;

    let declaration = declaration.verify(&peer.certificate()?)?;
    let spec = state.registry.processing_spec(&declaration.app_id).await?;
    let policy = state.store.policy(&declaration.data_id)?;
    let terms = usage::reconcile::reconcile(&declaration, &subject, &spec, &policy).map_err(Rejection::from)?;

    let grant = Grant {
        consumer: &subject,
        app_id: &declaration.app_id,
        data_id: &declaration.data_id,
    };
    let claims = Claims::granted(&declaration, terms.clone());
    let token = state.store.save(grant, &terms, || {
        state
            .issuer
            .issue(&claims)
            .map_err(|e| Rejection::Storage(format!("failed to sign token: {e:#}")))
    })?;

    info!(
        consumer = %subject,
        app_id = %declaration.app_id,
        data_id = %declaration.data_id,
        terms = ?terms,
        "issued usage token"
    );

    let completed = Completed {
        status: COMPLETED,
        token,
    };
    Ok((StatusCode::CREATED, Json(completed)))
}

#[cfg(test)]
mod tests {
    use super::super::tests::{peer, policy, registry, state, DATA_ID};
    use super::super::{app, Grant, State};
    use super::*;
    use crate::init_tracing;
    use crate::tests::testdata::*;
    use crate::tests::{body, TRACING};

    use attestation::crypto::TrustAnchor;
    use axum::body::Body;
    use axum::http::Request;
    use rstest::rstest;
    use serde_json::{json, Value};
    use tower::ServiceExt; // for `app.oneshot()`
    use usage::TokenVerifier;

    const GRANT: Grant<'static> = Grant {
        consumer: "alice",
        app_id: MRENCLAVE,
        data_id: DATA_ID,
    };

    fn declaration() -> SignedDeclaration {
        SignedDeclaration {
            consumer: "alice".into(),
            app_id: MRENCLAVE.into(),
            data_id: DATA_ID.into(),
            arg_num: "1".into(),
            counter: "5".into(),
            location: "JP".into(),
            duration: "30".into(),
            expiration_date: "2030-01-01".into(),
            signature: String::new(),
        }
    }

    fn signed(declaration: SignedDeclaration) -> SignedDeclaration {
        declaration.sign(&usage::read_rsa_key(CONSUMER_KEY.as_bytes()).unwrap())
    }

    fn request(client: Option<&str>, declaration: &SignedDeclaration) -> Request<Body> {
        let builder = Request::builder()
            .method("POST")
            .uri("/apply")
            .header("content-type", "application/json");
        let builder = match client {
            Some(pem) => builder.extension(peer(pem)),
            None => builder,
        };
        builder
            .body(Body::from(serde_json::to_vec(declaration).unwrap()))
            .unwrap()
    }

    async fn send(state: State, request: Request<Body>) -> (StatusCode, Value) {
        TRACING.call_once(init_tracing);
        let response = app(state, None).oneshot(request).await.unwrap();
        let status = response.status();
        (status, body(response).await)
    }

    #[tokio::test]
    async fn tighter_terms_are_saved() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry();
        let state = state(registry.clone(), dir.path());
        state.store().insert_policy(&policy(Some(10))).unwrap();

        let request = request(Some(CONSUMER_CRT), &signed(declaration()));
        let (status, body) = send(state, request).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["status"], "completed");
        assert_eq!(*registry.lookups.lock().unwrap(), [MRENCLAVE]);

        let token: IssuedToken = serde_json::from_value(body).unwrap();
        let verifier = TokenVerifier::new(TrustAnchor::read(CA_CRT.as_bytes()).unwrap());
        let claims = verifier.verify(&token).unwrap();
        assert_eq!(claims.status, "completed");
        assert_eq!(claims.consumer, "alice");
        assert_eq!(claims.app_id, MRENCLAVE);
        assert_eq!(claims.data_id, DATA_ID);
        assert_eq!(claims.arg_num, 1);
        assert_eq!(claims.terms.counter, Some(5));
        assert_eq!(claims.terms.location.as_deref(), Some("JP"));
        assert_eq!(claims.terms.duration, Some(30));
    }

    #[tokio::test]
    async fn saved_row() {
        let dir = tempfile::tempdir().unwrap();
        let state = Arc::new(state(registry(), dir.path()));
        state.store().insert_policy(&policy(Some(10))).unwrap();

        let (status, _) = apply(
            Extension(state.clone()),
            peer(CONSUMER_CRT),
            Json(signed(declaration())),
        )
        .await
        .unwrap();
        assert_eq!(status, StatusCode::CREATED);

        let saved = state.store().saved(GRANT).unwrap().unwrap();
        assert_eq!(saved.counter, Some(5));
        assert_eq!(saved.location.as_deref(), Some("JP"));
        assert_eq!(saved.expiration_date, Some("2030-01-01".parse().unwrap()));
    }

    #[tokio::test]
    async fn zero_policy_counter_is_unlimited() {
        let dir = tempfile::tempdir().unwrap();
        let state = Arc::new(state(registry(), dir.path()));
        state.store().insert_policy(&policy(Some(0))).unwrap();

        let declaration = signed(SignedDeclaration {
            duration: "0".into(),
            ..declaration()
        });
        let (status, _) = apply(Extension(state.clone()), peer(CONSUMER_CRT), Json(declaration))
            .await
            .unwrap();
        assert_eq!(status, StatusCode::CREATED);

        let saved = state.store().saved(GRANT).unwrap().unwrap();
        assert_eq!(saved.counter, Some(5));
        assert_eq!(saved.duration, None);
    }

    #[tokio::test]
    async fn counter_exceeded() {
        let dir = tempfile::tempdir().unwrap();
        let state = Arc::new(state(registry(), dir.path()));
        state.store().insert_policy(&policy(Some(3))).unwrap();

        let failure = apply(
            Extension(state.clone()),
            peer(CONSUMER_CRT),
            Json(signed(declaration())),
        )
        .await
        .unwrap_err();
        assert_eq!(failure.status(), StatusCode::BAD_REQUEST);
        assert_eq!(failure.description(), "exceeded number of accesses allowed");
        assert_eq!(state.store().saved(GRANT).unwrap(), None);
    }

    fn tampered() -> SignedDeclaration {
        let mut declaration = signed(declaration());
        declaration.counter = "50".into();
        declaration
    }

    fn impostor() -> SignedDeclaration {
        signed(SignedDeclaration {
            consumer: "bob".into(),
            ..declaration()
        })
    }

    fn unknown_data() -> SignedDeclaration {
        signed(SignedDeclaration {
            data_id: "https://provider.example/data/personal/2".into(),
            ..declaration()
        })
    }

    fn elsewhere() -> SignedDeclaration {
        signed(SignedDeclaration {
            location: "US".into(),
            ..declaration()
        })
    }

    fn second_argument() -> SignedDeclaration {
        signed(SignedDeclaration {
            arg_num: "2".into(),
            ..declaration()
        })
    }

    #[rstest]
    #[case(tampered, "failed to verify data usage declaration's signature")]
    #[case(impostor, "certificate and declaration information does not match")]
    #[case(unknown_data, "failed to get data providing policy")]
    #[case(elsewhere, "location where access is not permitted")]
    #[case(second_argument, "not allowed to disclose the processing output")]
    #[tokio::test]
    async fn rejected(#[case] declaration: fn() -> SignedDeclaration, #[case] description: &str) {
        let dir = tempfile::tempdir().unwrap();
        let state = state(registry(), dir.path());
        let mut policy = policy(Some(10));
        policy.terms.location = Some("JP".into());
        state.store().insert_policy(&policy).unwrap();

        let (status, body) = send(state, request(Some(CONSUMER_CRT), &declaration())).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, json!({"status": "failed", "description": description}));
    }

    #[tokio::test]
    async fn revoked_client() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(registry(), dir.path());
        state.store().insert_policy(&policy(None)).unwrap();

        let request = request(Some(ENCLAVE_REVOKED_CRT), &signed(declaration()));
        let (status, body) = send(state, request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["status"], "failed");
        assert!(body["description"]
            .as_str()
            .unwrap()
            .starts_with("attestation rejected"));
    }

    #[tokio::test]
    async fn no_client_certificate() {
        let dir = tempfile::tempdir().unwrap();
        let request = request(None, &signed(declaration()));
        let (status, body) = send(state(registry(), dir.path()), request).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["description"], "client certificate required");
    }
}
