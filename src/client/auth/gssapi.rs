#![cfg(feature = "gssapi-auth")]

use cross_krb5::{ClientCtx, InitiateFlags, Step};

use crate::{
    bson::Bson,
    client::auth::{
        sasl::{SaslContinue, SaslResponse, SaslStart},
        AuthMechanism,
        Credential,
    },
    cmap::Connection,
    error::{Error, ErrorKind, Result},
};

const MAX_SASL_ROUND_TRIPS: usize = 10;

#[derive(Debug, Clone)]
pub(crate) struct GssapiProperties {
    pub service_name: String,
    pub canonicalize_host_name: CanonicalizeHostName,
    pub service_realm: Option<String>,
    pub service_host: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub(crate) enum CanonicalizeHostName {
    #[default]
    None,
    Forward,
    ForwardAndReverse,
}

impl GssapiProperties {
    pub fn from_credential(credential: &Credential) -> Result<Self> {
        let mut properties = GssapiProperties {
            service_name: "mongodb".to_string(),
            canonicalize_host_name: CanonicalizeHostName::None,
            service_realm: None,
            service_host: None,
        };

        if let Some(mechanism_properties) = &credential.mechanism_properties {
            if let Some(Bson::String(name)) = mechanism_properties.get("SERVICE_NAME") {
                properties.service_name = name.clone();
            }

            if let Some(canonicalize) = mechanism_properties.get("CANONICALIZE_HOST_NAME") {
                properties.canonicalize_host_name = match canonicalize {
                    Bson::String(s) => match s.as_str() {
                        "none" => CanonicalizeHostName::None,
                        "forward" => CanonicalizeHostName::Forward,
                        "forwardAndReverse" => CanonicalizeHostName::ForwardAndReverse,
                        _ => {
                            return Err(ErrorKind::InvalidArgument {
                                message: format!(
                                    "Invalid CANONICALIZE_HOST_NAME value: {}. Valid values are \
                                     'none', 'forward', 'forwardAndReverse'",
                                    s
                                ),
                            }
                            .into())
                        }
                    },
                    Bson::Boolean(true) => CanonicalizeHostName::ForwardAndReverse,
                    Bson::Boolean(false) => CanonicalizeHostName::None,
                    _ => {
                        return Err(ErrorKind::InvalidArgument {
                            message: "CANONICALIZE_HOST_NAME must be a string or boolean"
                                .to_string(),
                        }
                        .into())
                    }
                };
            }

            if let Some(Bson::String(realm)) = mechanism_properties.get("SERVICE_REALM") {
                properties.service_realm = Some(realm.clone());
            }

            if let Some(Bson::String(host)) = mechanism_properties.get("SERVICE_HOST") {
                properties.service_host = Some(host.clone());
            }
        }

        Ok(properties)
    }
}

struct GssapiAuthenticator {
    pending_ctx: Option<cross_krb5::PendingClientCtx>,
    client_ctx: Option<ClientCtx>,
    service_principal: String,
    is_complete: bool,
    user_principal: Option<String>,
}

impl GssapiAuthenticator {
    fn new(credential: &Credential, properties: &GssapiProperties, hostname: &str) -> Self {
        let mut service_principal = format!("{}/{}", properties.service_name, hostname);
        if let Some(ref realm) = properties.service_realm {
            service_principal.push('@');
            service_principal.push_str(realm);
        }

        Self {
            pending_ctx: None,
            client_ctx: None,
            service_principal,
            is_complete: false,
            user_principal: credential.username.clone(),
        }
    }

    fn step(&mut self, challenge: Option<&[u8]>) -> Result<Option<Vec<u8>>> {
        if self.pending_ctx.is_none() && self.client_ctx.is_none() {
            let (pending_ctx, initial_token) = ClientCtx::new(
                InitiateFlags::empty(),
                self.user_principal.as_deref(),
                &self.service_principal,
                None, // No channel bindings
            )
            .map_err(|e| {
                Error::authentication_error(
                    "GSSAPI",
                    &format!("Failed to initialize GSSAPI context: {}", e),
                )
            })?;

            self.pending_ctx = Some(pending_ctx);
            return Ok(Some(initial_token.to_vec()));
        }

        let challenge_data = challenge.ok_or_else(|| {
            Error::authentication_error("GSSAPI", "Expected challenge data for GSSAPI continuation")
        })?;
        let pending_ctx = self.pending_ctx.take().ok_or_else(|| {
            Error::authentication_error("GSSAPI", "Authentication context not initialized")
        })?;

        match pending_ctx.step(challenge_data).map_err(|e| {
            Error::authentication_error("GSSAPI", &format!("GSSAPI step failed: {}", e))
        })? {
            Step::Finished((ctx, token)) => {
                self.client_ctx = Some(ctx);
                self.is_complete = true;
                Ok(token.map(|t| t.to_vec()))
            }
            Step::Continue((ctx, token)) => {
                self.pending_ctx = Some(ctx);
                Ok(Some(token.to_vec()))
            }
        }
    }

    fn is_complete(&self) -> bool {
        self.is_complete
    }
}

async fn canonicalize_hostname(hostname: &str, mode: &CanonicalizeHostName) -> Result<String> {
    match mode {
        CanonicalizeHostName::None => Ok(hostname.to_string()),
        // Without a resolver stack, forward and forward-and-reverse canonicalization both
        // resolve to the name the forward lookup confirms.
        CanonicalizeHostName::Forward | CanonicalizeHostName::ForwardAndReverse => {
            let mut addrs = tokio::net::lookup_host((hostname, 0)).await.map_err(|e| {
                Error::authentication_error(
                    "GSSAPI",
                    &format!("DNS resolution failed for hostname '{}': {}", hostname, e),
                )
            })?;
            if addrs.next().is_none() {
                return Err(Error::authentication_error(
                    "GSSAPI",
                    &format!("No addresses found for hostname '{}'", hostname),
                ));
            }
            Ok(hostname.to_lowercase())
        }
    }
}

pub(crate) async fn authenticate_stream(
    conn: &mut Connection,
    credential: &Credential,
) -> Result<()> {
    let properties = GssapiProperties::from_credential(credential)?;
    let hostname = match properties.service_host {
        Some(ref host) => host.clone(),
        None => {
            canonicalize_hostname(conn.address().host(), &properties.canonicalize_host_name)
                .await?
        }
    };

    let mut authenticator = GssapiAuthenticator::new(credential, &properties, &hostname);

    let source = credential.source.as_deref().unwrap_or("$external");
    let mut conversation_id = None;
    let mut payload = Vec::new();

    for _ in 0..MAX_SASL_ROUND_TRIPS {
        let challenge = if payload.is_empty() {
            None
        } else {
            Some(payload.as_slice())
        };
        let output_token = authenticator.step(challenge)?;

        if let Some(token) = output_token {
            let command = match conversation_id {
                None => {
                    SaslStart::new(source.to_string(), AuthMechanism::Gssapi, token).into_command()
                }
                Some(ref id) => {
                    SaslContinue::new(source.to_string(), Bson::clone(id), token).into_command()
                }
            };

            let response = conn.send_command(command).await?;
            let sasl_response = SaslResponse::parse("GSSAPI", response.auth_response_body("GSSAPI")?)?;

            conversation_id = Some(sasl_response.conversation_id);
            payload = sasl_response.payload;

            if sasl_response.done && authenticator.is_complete() {
                return Ok(());
            }
        } else if authenticator.is_complete() {
            return Ok(());
        }
    }

    Err(Error::authentication_error(
        "GSSAPI",
        &format!(
            "GSSAPI authentication failed after {} attempts",
            MAX_SASL_ROUND_TRIPS
        ),
    ))
}
