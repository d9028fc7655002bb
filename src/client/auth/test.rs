use std::str::FromStr;

use bson::doc;

use super::{AuthMechanism, Credential};

#[test]
fn mechanism_round_trips_through_str() {
    for mechanism in [
        AuthMechanism::ScramSha1,
        AuthMechanism::ScramSha256,
        AuthMechanism::MongoDbX509,
        AuthMechanism::Gssapi,
        AuthMechanism::Plain,
        AuthMechanism::MongoDbOidc,
    ] {
        assert_eq!(
            AuthMechanism::from_str(mechanism.as_str()).unwrap(),
            mechanism
        );
    }

    assert!(AuthMechanism::from_str("MONGODB-CR").is_err());
    assert!(AuthMechanism::from_str("SCRAM-SHA-512").is_err());
}

#[test]
fn default_sources() {
    assert_eq!(AuthMechanism::ScramSha1.default_source(None), "admin");
    assert_eq!(AuthMechanism::ScramSha256.default_source(Some("db")), "db");
    assert_eq!(AuthMechanism::Plain.default_source(Some("db")), "$external");
    assert_eq!(AuthMechanism::MongoDbX509.default_source(None), "$external");
    assert_eq!(AuthMechanism::MongoDbOidc.default_source(None), "$external");
}

#[test]
fn scram_requires_username() {
    let credential = Credential::builder().password("pass".to_string()).build();
    assert!(AuthMechanism::ScramSha256
        .validate_credential(&credential)
        .is_err());

    let credential = Credential::builder()
        .username("user".to_string())
        .password("pass".to_string())
        .build();
    assert!(AuthMechanism::ScramSha256
        .validate_credential(&credential)
        .is_ok());
}

#[test]
fn x509_rejects_password_and_foreign_source() {
    let credential = Credential::builder().password("pass".to_string()).build();
    assert!(AuthMechanism::MongoDbX509
        .validate_credential(&credential)
        .is_err());

    let credential = Credential::builder().source("admin".to_string()).build();
    assert!(AuthMechanism::MongoDbX509
        .validate_credential(&credential)
        .is_err());

    let credential = Credential::builder().build();
    assert!(AuthMechanism::MongoDbX509
        .validate_credential(&credential)
        .is_ok());
}

#[test]
fn oidc_requires_callback_or_environment() {
    let credential = Credential::builder().build();
    assert!(AuthMechanism::MongoDbOidc
        .validate_credential(&credential)
        .is_err());

    let credential = Credential::builder()
        .mechanism_properties(doc! { "ENVIRONMENT": "test" })
        .build();
    assert!(AuthMechanism::MongoDbOidc
        .validate_credential(&credential)
        .is_ok());

    let mut credential = Credential::builder()
        .mechanism_properties(doc! { "ENVIRONMENT": "test" })
        .build();
    credential.oidc_callback = super::oidc::Callback::machine(|_| {
        Box::pin(async { Err(crate::error::Error::internal("unused")) })
    });
    assert!(AuthMechanism::MongoDbOidc
        .validate_credential(&credential)
        .is_err());
}

#[test]
fn oidc_environment_token_resource_rules() {
    // test/k8s must not carry TOKEN_RESOURCE.
    let credential = Credential::builder()
        .mechanism_properties(doc! { "ENVIRONMENT": "k8s", "TOKEN_RESOURCE": "resource" })
        .build();
    assert!(AuthMechanism::MongoDbOidc
        .validate_credential(&credential)
        .is_err());

    // azure/gcp require TOKEN_RESOURCE.
    let credential = Credential::builder()
        .mechanism_properties(doc! { "ENVIRONMENT": "azure" })
        .build();
    assert!(AuthMechanism::MongoDbOidc
        .validate_credential(&credential)
        .is_err());

    let credential = Credential::builder()
        .mechanism_properties(doc! { "ENVIRONMENT": "azure", "TOKEN_RESOURCE": "resource" })
        .build();
    assert!(AuthMechanism::MongoDbOidc
        .validate_credential(&credential)
        .is_ok());

    // Unknown environments are rejected.
    let credential = Credential::builder()
        .mechanism_properties(doc! { "ENVIRONMENT": "aws" })
        .build();
    assert!(AuthMechanism::MongoDbOidc
        .validate_credential(&credential)
        .is_err());
}

#[test]
fn nonces_are_24_random_bytes() {
    use base64::Engine;

    let nonce = super::generate_nonce();
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(nonce)
        .unwrap();
    assert_eq!(decoded.len(), 24);

    assert_ne!(super::generate_nonce(), super::generate_nonce());
}

#[test]
fn negotiation_key_is_appended_when_mechanism_is_unset() {
    let credential = Credential::builder()
        .username("alice".to_string())
        .password("pass".to_string())
        .build();

    let mut body = bson::rawdoc! { "hello": 1 };
    credential.append_needed_mechanism_negotiation(&mut body);
    assert_eq!(
        body.get_str("saslSupportedMechs").unwrap(),
        "admin.alice"
    );

    let credential = Credential::builder()
        .username("alice".to_string())
        .mechanism(AuthMechanism::ScramSha256)
        .build();
    let mut body = bson::rawdoc! { "hello": 1 };
    credential.append_needed_mechanism_negotiation(&mut body);
    assert!(body.get_str("saslSupportedMechs").is_err());
}
