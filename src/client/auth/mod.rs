//! Contains the types needed to specify the auth configuration for a
//! [`Client`](crate::Client).

#[cfg(feature = "gssapi-auth")]
mod gssapi;
pub mod oidc;
mod plain;
mod sasl;
mod scram;
#[cfg(test)]
mod test;
mod x509;

use std::{borrow::Cow, fmt::Debug, str::FromStr};

use bson::RawDocumentBuf;
use hmac::{digest::KeyInit, Mac};
use rand::Rng;
use serde::Deserialize;
use typed_builder::TypedBuilder;

use self::scram::ScramVersion;
use crate::{
    bson::Document,
    cmap::{Command, Connection, StreamDescription},
    error::{Error, ErrorKind, Result},
};

const SCRAM_SHA_1_STR: &str = "SCRAM-SHA-1";
const SCRAM_SHA_256_STR: &str = "SCRAM-SHA-256";
const MONGODB_X509_STR: &str = "MONGODB-X509";
const GSSAPI_STR: &str = "GSSAPI";
const PLAIN_STR: &str = "PLAIN";
const MONGODB_OIDC_STR: &str = "MONGODB-OIDC";

pub(crate) const ENVIRONMENT_PROP_STR: &str = "ENVIRONMENT";
pub(crate) const TOKEN_RESOURCE_PROP_STR: &str = "TOKEN_RESOURCE";
pub(crate) const TEST_ENVIRONMENT_VALUE_STR: &str = "test";
pub(crate) const AZURE_ENVIRONMENT_VALUE_STR: &str = "azure";
pub(crate) const GCP_ENVIRONMENT_VALUE_STR: &str = "gcp";
pub(crate) const K8S_ENVIRONMENT_VALUE_STR: &str = "k8s";

/// The authentication mechanisms supported by MongoDB.
#[derive(Clone, Deserialize, PartialEq, Debug)]
#[non_exhaustive]
pub enum AuthMechanism {
    /// The SCRAM-SHA-1 mechanism as defined in [RFC 5802](http://tools.ietf.org/html/rfc5802).
    ///
    /// See the [MongoDB documentation](https://www.mongodb.com/docs/manual/core/security-scram/) for more information.
    ScramSha1,

    /// The SCRAM-SHA-256 mechanism which extends [RFC 5802](http://tools.ietf.org/html/rfc5802) and is formally defined in [RFC 7677](https://tools.ietf.org/html/rfc7677).
    ///
    /// See the [MongoDB documentation](https://www.mongodb.com/docs/manual/core/security-scram/) for more information.
    ScramSha256,

    /// The MONGODB-X509 mechanism based on the usage of X.509 certificates to validate a client
    /// where the distinguished subject name of the client certificate acts as the username.
    ///
    /// See the [MongoDB documentation](https://www.mongodb.com/docs/manual/core/security-x.509/) for more information.
    MongoDbX509,

    /// Kerberos authentication mechanism as defined in [RFC 4752](http://tools.ietf.org/html/rfc4752).
    ///
    /// See the [MongoDB documentation](https://www.mongodb.com/docs/manual/core/kerberos/) for more information.
    ///
    /// Note: This mechanism is only available with the `gssapi-auth` feature flag.
    Gssapi,

    /// The SASL PLAIN mechanism, as defined in [RFC 4616](https://tools.ietf.org/html/rfc4616), is used in MongoDB to perform LDAP
    /// authentication and cannot be used for any other type of authentication.
    /// Since the credentials are stored outside of MongoDB, the "$external" database must be used
    /// for authentication.
    ///
    /// See the [MongoDB documentation](https://www.mongodb.com/docs/manual/core/security-ldap/#ldap-proxy-authentication) for more information on LDAP authentication.
    Plain,

    /// MONGODB-OIDC authenticates using [OpenID Connect](https://openid.net/developers/specs/) access tokens obtained either from an
    /// application-supplied callback or from a cloud provider's identity endpoint
    /// (`ENVIRONMENT` mechanism property).
    MongoDbOidc,
}

impl AuthMechanism {
    /// Determines the mechanism to use based on handshake-time mechanism negotiation.
    pub(crate) fn from_stream_description(description: &StreamDescription) -> AuthMechanism {
        let scram_sha_256_found = description
            .sasl_supported_mechs
            .as_ref()
            .map(|ms| ms.iter().any(|m| m == SCRAM_SHA_256_STR))
            .unwrap_or(false);

        if scram_sha_256_found {
            AuthMechanism::ScramSha256
        } else {
            AuthMechanism::ScramSha1
        }
    }

    /// Determines if the provided credentials have the required information to perform
    /// authentication.
    pub fn validate_credential(&self, credential: &Credential) -> Result<()> {
        match self {
            AuthMechanism::ScramSha1 | AuthMechanism::ScramSha256 => {
                if credential.username.is_none() {
                    return Err(ErrorKind::InvalidArgument {
                        message: "No username provided for SCRAM authentication".to_string(),
                    }
                    .into());
                };
                Ok(())
            }
            AuthMechanism::MongoDbX509 => {
                if credential.password.is_some() {
                    return Err(ErrorKind::InvalidArgument {
                        message: "A password cannot be specified with MONGODB-X509".to_string(),
                    }
                    .into());
                }

                if credential.source.as_deref().unwrap_or("$external") != "$external" {
                    return Err(ErrorKind::InvalidArgument {
                        message: "only $external may be specified as an auth source for \
                                  MONGODB-X509"
                            .to_string(),
                    }
                    .into());
                }

                Ok(())
            }
            AuthMechanism::Plain => {
                if credential.username.is_none() {
                    return Err(ErrorKind::InvalidArgument {
                        message: "No username provided for PLAIN authentication".to_string(),
                    }
                    .into());
                }

                if credential.username.as_deref() == Some("") {
                    return Err(ErrorKind::InvalidArgument {
                        message: "Username for PLAIN authentication must be non-empty".to_string(),
                    }
                    .into());
                }

                if credential.password.is_none() {
                    return Err(ErrorKind::InvalidArgument {
                        message: "No password provided for PLAIN authentication".to_string(),
                    }
                    .into());
                }

                Ok(())
            }
            AuthMechanism::MongoDbOidc => oidc::validate_credential(credential),
            AuthMechanism::Gssapi => Ok(()),
        }
    }

    /// Returns this `AuthMechanism` as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthMechanism::ScramSha1 => SCRAM_SHA_1_STR,
            AuthMechanism::ScramSha256 => SCRAM_SHA_256_STR,
            AuthMechanism::MongoDbX509 => MONGODB_X509_STR,
            AuthMechanism::Gssapi => GSSAPI_STR,
            AuthMechanism::Plain => PLAIN_STR,
            AuthMechanism::MongoDbOidc => MONGODB_OIDC_STR,
        }
    }

    /// Get the default authSource for a given mechanism depending on the database provided in the
    /// connection string.
    pub(crate) fn default_source<'a>(&'a self, uri_db: Option<&'a str>) -> &'a str {
        match self {
            AuthMechanism::ScramSha1 | AuthMechanism::ScramSha256 => uri_db.unwrap_or("admin"),
            AuthMechanism::MongoDbX509
            | AuthMechanism::Plain
            | AuthMechanism::Gssapi
            | AuthMechanism::MongoDbOidc => "$external",
        }
    }

    /// Constructs the first message to be sent to the server as part of the authentication
    /// handshake, which can be used for speculative authentication.
    pub(crate) async fn build_speculative_client_first(
        &self,
        credential: &Credential,
    ) -> Result<Option<ClientFirst>> {
        match self {
            Self::ScramSha1 => {
                let client_first = ScramVersion::Sha1.build_speculative_client_first(credential)?;

                Ok(Some(ClientFirst::Scram(ScramVersion::Sha1, client_first)))
            }
            Self::ScramSha256 => {
                let client_first =
                    ScramVersion::Sha256.build_speculative_client_first(credential)?;

                Ok(Some(ClientFirst::Scram(ScramVersion::Sha256, client_first)))
            }
            Self::MongoDbX509 => Ok(Some(ClientFirst::X509(Box::new(
                x509::build_speculative_client_first(credential),
            )))),
            Self::MongoDbOidc => Ok(oidc::build_speculative_client_first(credential)
                .await
                .map(ClientFirst::Oidc)),
            Self::Plain => Ok(None),
            Self::Gssapi => Ok(None),
        }
    }

    /// Performs the authentication conversation for this mechanism on a freshly-handshaken
    /// connection.
    pub(crate) async fn authenticate_stream(
        &self,
        stream: &mut Connection,
        credential: &Credential,
    ) -> Result<()> {
        self.validate_credential(credential)?;

        match self {
            AuthMechanism::ScramSha1 => {
                ScramVersion::Sha1
                    .authenticate_stream(stream, credential, None)
                    .await
            }
            AuthMechanism::ScramSha256 => {
                ScramVersion::Sha256
                    .authenticate_stream(stream, credential, None)
                    .await
            }
            AuthMechanism::MongoDbX509 => x509::authenticate_stream(stream, credential, None).await,
            AuthMechanism::Plain => plain::authenticate_stream(stream, credential).await,
            AuthMechanism::MongoDbOidc => {
                oidc::authenticate_stream(stream, credential, None).await
            }
            #[cfg(feature = "gssapi-auth")]
            AuthMechanism::Gssapi => gssapi::authenticate_stream(stream, credential).await,
            #[cfg(not(feature = "gssapi-auth"))]
            AuthMechanism::Gssapi => Err(ErrorKind::InvalidArgument {
                message: "GSSAPI auth is only supported with the gssapi-auth feature flag".into(),
            }
            .into()),
        }
    }

    /// Runs the mechanism's reauthentication protocol in response to a
    /// ReauthenticationRequired (391) server error. The OIDC flow invalidates the connection's
    /// cached token first; other mechanisms simply authenticate again.
    pub(crate) async fn reauthenticate_stream(
        &self,
        stream: &mut Connection,
        credential: &Credential,
    ) -> Result<()> {
        self.validate_credential(credential)?;

        match self {
            AuthMechanism::MongoDbOidc => oidc::reauthenticate_stream(stream, credential).await,
            _ => self.authenticate_stream(stream, credential).await,
        }
    }
}

impl FromStr for AuthMechanism {
    type Err = Error;

    fn from_str(str: &str) -> Result<Self> {
        match str {
            SCRAM_SHA_1_STR => Ok(AuthMechanism::ScramSha1),
            SCRAM_SHA_256_STR => Ok(AuthMechanism::ScramSha256),
            MONGODB_X509_STR => Ok(AuthMechanism::MongoDbX509),
            GSSAPI_STR => Ok(AuthMechanism::Gssapi),
            PLAIN_STR => Ok(AuthMechanism::Plain),
            MONGODB_OIDC_STR => Ok(AuthMechanism::MongoDbOidc),

            _ => Err(ErrorKind::InvalidArgument {
                message: format!("invalid mechanism string: {}", str),
            }
            .into()),
        }
    }
}

/// A struct containing authentication information.
///
/// Some fields (mechanism and source) may be omitted and will either be negotiated or assigned a
/// default value, depending on the values of other fields in the credential.
#[derive(Clone, Default, Deserialize, TypedBuilder)]
#[builder(field_defaults(default, setter(into, strip_option)))]
#[non_exhaustive]
pub struct Credential {
    /// The username to authenticate with. This applies to all mechanisms but may be omitted when
    /// authenticating via MONGODB-X509.
    pub username: Option<String>,

    /// The database used to authenticate. This applies to all mechanisms and defaults to "admin"
    /// in SCRAM authentication mechanisms and "$external" for GSSAPI, MONGODB-X509, PLAIN, and
    /// MONGODB-OIDC.
    pub source: Option<String>,

    /// The password to authenticate with. This does not apply to all mechanisms.
    pub password: Option<String>,

    /// Which authentication mechanism to use. If not provided, one will be negotiated with the
    /// server.
    pub mechanism: Option<AuthMechanism>,

    /// Additional properties for the given mechanism.
    pub mechanism_properties: Option<Document>,

    /// The token callback for MONGODB-OIDC authentication.
    #[serde(skip)]
    #[builder(setter(!into, !strip_option))]
    pub oidc_callback: oidc::Callback,
}

impl Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("username", &self.username)
            .field("source", &self.source)
            .field("password", &self.password.as_ref().map(|_| "REDACTED"))
            .field("mechanism", &self.mechanism)
            .field("mechanism_properties", &self.mechanism_properties)
            .finish()
    }
}

impl Credential {
    /// The database this credential authenticates against, accounting for mechanism defaults.
    pub(crate) fn resolved_source(&self) -> &str {
        self.source
            .as_deref()
            .unwrap_or_else(|| match self.mechanism {
                Some(ref mechanism) => mechanism.default_source(None),
                None => "admin",
            })
    }

    /// Validate the credential, including any mechanism-specific requirements.
    pub(crate) fn validate(&self) -> Result<()> {
        if let Some(ref mechanism) = self.mechanism {
            mechanism.validate_credential(self)?;
        }
        Ok(())
    }

    /// If the mechanism is missing, append the appropriate mechanism negotiation key-value-pair
    /// to the provided hello command body.
    pub(crate) fn append_needed_mechanism_negotiation(&self, body: &mut RawDocumentBuf) {
        if let (Some(username), None) = (self.username.as_ref(), self.mechanism.as_ref()) {
            body.append(
                "saslSupportedMechs",
                format!("{}.{}", self.resolved_source(), username),
            );
        }
    }

    /// Constructs the speculative-auth payload for the initial hello, if this credential's
    /// mechanism supports one.
    pub(crate) async fn build_speculative_client_first(&self) -> Result<Option<ClientFirst>> {
        match self.mechanism {
            Some(ref mechanism) => mechanism.build_speculative_client_first(self).await,
            // If a mechanism will be negotiated, speculate with SCRAM-SHA-256.
            None if self.username.is_some() => {
                AuthMechanism::ScramSha256
                    .build_speculative_client_first(self)
                    .await
            }
            None => Ok(None),
        }
    }

    /// Attempts to authenticate a stream according to this credential, returning an error
    /// result on failure. A mechanism may be negotiated if one is not provided as part of the
    /// credential.
    pub(crate) async fn authenticate_stream(
        &self,
        conn: &mut Connection,
        first_round: Option<FirstRound>,
    ) -> Result<()> {
        let stream_description = conn.stream_description()?;

        // Verify server can authenticate.
        if !stream_description.initial_server_type.can_auth() {
            return Ok(());
        };

        // If speculative authentication returned a response, then short-circuit the
        // authentication logic and use the first round from the handshake.
        if let Some(first_round) = first_round {
            return match first_round {
                FirstRound::Scram(version, first_round) => {
                    version
                        .authenticate_stream(conn, self, first_round)
                        .await
                }
                FirstRound::X509(server_first) => {
                    x509::authenticate_stream(conn, self, server_first).await
                }
                FirstRound::Oidc(server_first) => {
                    oidc::authenticate_stream(conn, self, server_first).await
                }
            };
        }

        let mechanism = match self.mechanism {
            None => Cow::Owned(AuthMechanism::from_stream_description(stream_description)),
            Some(ref m) => Cow::Borrowed(m),
        };

        // Authenticate according to the chosen mechanism.
        mechanism.authenticate_stream(conn, self).await
    }

    /// Refreshes this credential's materials and re-runs the authentication conversation on the
    /// given connection in response to a 391 server error.
    pub(crate) async fn reauthenticate_stream(&self, conn: &mut Connection) -> Result<()> {
        let mechanism = match self.mechanism {
            None => Cow::Owned(AuthMechanism::from_stream_description(
                conn.stream_description()?,
            )),
            Some(ref m) => Cow::Borrowed(m),
        };
        mechanism.reauthenticate_stream(conn, self).await
    }
}

/// Contains the first client message sent as part of the authentication handshake.
pub(crate) enum ClientFirst {
    Scram(ScramVersion, scram::ClientFirst),
    X509(Box<Command>),
    Oidc(RawDocumentBuf),
}

impl ClientFirst {
    pub(crate) fn to_document(&self) -> Result<RawDocumentBuf> {
        Ok(match self {
            Self::Scram(version, client_first) => {
                let mut body = client_first.to_command(version).body;
                body.append("db", client_first.source());
                body
            }
            Self::X509(command) => {
                let mut body = command.body.clone();
                body.append("db", "$external");
                body
            }
            Self::Oidc(payload) => payload.clone(),
        })
    }

    pub(crate) fn into_first_round(self, server_first: Document) -> FirstRound {
        match self {
            Self::Scram(version, client_first) => FirstRound::Scram(
                version,
                scram::FirstRound {
                    client_first,
                    server_first,
                },
            ),
            Self::X509(..) => FirstRound::X509(server_first),
            Self::Oidc(..) => FirstRound::Oidc(server_first),
        }
    }
}

/// Contains the complete first round of the authentication handshake, including the client
/// message and the server response.
#[derive(Debug)]
pub(crate) enum FirstRound {
    Scram(ScramVersion, scram::FirstRound),
    X509(Document),
    Oidc(Document),
}

pub(crate) fn generate_nonce_bytes() -> [u8; 24] {
    rand::thread_rng().gen()
}

pub(crate) fn generate_nonce() -> String {
    use base64::Engine;
    let result = generate_nonce_bytes();
    base64::engine::general_purpose::STANDARD.encode(result)
}

fn mac<M: Mac + KeyInit>(
    key: &[u8],
    input: &[u8],
    auth_mechanism: &str,
) -> Result<impl AsRef<[u8]>> {
    let mut mac = <M as Mac>::new_from_slice(key)
        .map_err(|_| Error::unknown_authentication_error(auth_mechanism))?;
    mac.update(input);
    Ok(mac.finalize().into_bytes())
}

fn mac_verify<M: Mac + KeyInit>(
    key: &[u8],
    input: &[u8],
    signature: &[u8],
    auth_mechanism: &str,
) -> Result<()> {
    let mut mac = <M as Mac>::new_from_slice(key)
        .map_err(|_| Error::unknown_authentication_error(auth_mechanism))?;
    mac.update(input);
    mac.verify_slice(signature)
        .map_err(|_| Error::authentication_error(auth_mechanism, "Authentication failed."))
}
