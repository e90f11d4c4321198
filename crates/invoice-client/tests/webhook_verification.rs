use std::sync::Arc;

use anyhow::Result;
use axum::{Json, Router, extract::State, routing::get};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bitcoin::secp256k1::{Message, PublicKey, Secp256k1, SecretKey};
use chrono::{Duration, Utc};
use invoice_client::{
    ClientConfig, HttpInvoiceService, InvoiceError, KeyStore, SignatureVerifier,
};
use reqwest::header::{HeaderMap, HeaderValue};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use tokio::net::TcpListener;

const IDENTITY: &str = "pay.example.com";
const BODY: &[u8] = br#"{"event":"broadcasted","invoiceId":"abc"}"#;

fn public_hex(secret: &SecretKey) -> String {
    hex::encode(PublicKey::from_secret_key(&Secp256k1::new(), secret).serialize())
}

fn signed_headers(secret: &SecretKey, body: &[u8]) -> Result<HeaderMap> {
    let digest: [u8; 32] = Sha256::digest(body).into();
    let signature = Secp256k1::new().sign_ecdsa(&Message::from_digest(digest), secret);

    let mut headers = HeaderMap::new();
    headers.insert(
        "digest",
        HeaderValue::from_str(&format!("SHA-256={}", BASE64.encode(digest)))?,
    );
    headers.insert("x-identity", HeaderValue::from_static(IDENTITY));
    headers.insert(
        "x-signature",
        HeaderValue::from_str(&BASE64.encode(signature.serialize_der().to_vec()))?,
    );
    headers.insert("x-signature-type", HeaderValue::from_static("ECC"));
    Ok(headers)
}

async fn keys_handler(State(keys): State<Arc<Vec<String>>>) -> Json<Value> {
    Json(json!({
        "owner": IDENTITY,
        "expirationDate": (Utc::now() + Duration::hours(1)).to_rfc3339(),
        "publicKeys": keys.as_slice()
    }))
}

async fn trusted_verifier(trusted: &SecretKey) -> Result<SignatureVerifier> {
    let app = Router::new()
        .route("/signingKeys/paymentProtocol.json", get(keys_handler))
        .with_state(Arc::new(vec![public_hex(trusted)]));
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    let endpoint = format!("http://{addr}");
    let service = HttpInvoiceService::new(&ClientConfig::new(endpoint.clone()))?;
    let keystore = Arc::new(KeyStore::new(Arc::new(service)));
    keystore.register_trusted(&endpoint).await?;
    Ok(SignatureVerifier::new(keystore))
}

#[tokio::test]
async fn webhook_signed_by_untrusted_key_is_rejected() -> Result<()> {
    let trusted = SecretKey::from_slice(&[0x11; 32])?;
    let intruder = SecretKey::from_slice(&[0x22; 32])?;
    let verifier = trusted_verifier(&trusted).await?;

    let result = verifier
        .verify_webhook(BODY, &signed_headers(&intruder, BODY)?)
        .await;

    let error = result.expect_err("untrusted signature must not verify");
    assert!(error.is_verification_failure());
    assert!(matches!(
        error,
        InvoiceError::SignatureInvalid { identity } if identity == IDENTITY
    ));
    Ok(())
}

#[tokio::test]
async fn webhook_signed_by_trusted_key_yields_notification() -> Result<()> {
    let trusted = SecretKey::from_slice(&[0x11; 32])?;
    let verifier = trusted_verifier(&trusted).await?;

    let notification = verifier
        .verify_webhook(BODY, &signed_headers(&trusted, BODY)?)
        .await?;
    assert_eq!(notification.event, "broadcasted");
    assert_eq!(notification.invoice_id, "abc");

    let tampered = br#"{"event":"broadcasted","invoiceId":"abd"}"#;
    let result = verifier
        .verify_webhook(tampered, &signed_headers(&trusted, BODY)?)
        .await;
    assert!(matches!(result, Err(InvoiceError::DigestMismatch)));
    Ok(())
}
