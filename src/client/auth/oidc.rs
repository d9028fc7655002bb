//! Contains the functionality for [`OIDC`](https://openid.net/developers/how-connect-works/) authorization and authentication.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use bson::{rawdoc, spec::BinarySubtype, Binary, Document, RawDocumentBuf};
use tokio::sync::Mutex;
use typed_builder::TypedBuilder;

use crate::{
    client::auth::{
        sasl::{SaslResponse, SaslStart},
        AuthMechanism,
        Credential,
        AZURE_ENVIRONMENT_VALUE_STR,
        ENVIRONMENT_PROP_STR,
        GCP_ENVIRONMENT_VALUE_STR,
        K8S_ENVIRONMENT_VALUE_STR,
        MONGODB_OIDC_STR,
        TEST_ENVIRONMENT_VALUE_STR,
        TOKEN_RESOURCE_PROP_STR,
    },
    cmap::Connection,
    error::{Error, ErrorKind, Result, REAUTHENTICATION_REQUIRED_CODE},
    BoxFuture,
};

/// The deadline handed to a machine callback when the operation itself has none.
const MACHINE_CALLBACK_TIMEOUT: Duration = Duration::from_secs(60);

/// The minimum wall-clock spacing between two callback invocations.
const CALLBACK_MIN_SPACING: Duration = Duration::from_millis(100);

const API_VERSION: u32 = 1;

/// The environment variable holding the token file path for `ENVIRONMENT:test`.
const TEST_TOKEN_FILE_ENV_VAR: &str = "OIDC_TOKEN_FILE";

/// The callback to use for OIDC authentication.
///
/// This is set either by the application via [`Callback::machine`] or by the driver itself when
/// the credential carries an `ENVIRONMENT` mechanism property.
#[derive(Clone)]
#[non_exhaustive]
pub struct Callback {
    inner: Arc<Mutex<Option<TokenCache>>>,
    is_user_provided: bool,
}

impl Default for Callback {
    fn default() -> Self {
        Self::unset()
    }
}

impl std::fmt::Debug for Callback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Callback")
            .field("is_user_provided", &self.is_user_provided)
            .finish()
    }
}

impl Callback {
    pub(crate) fn unset() -> Self {
        Self {
            inner: Arc::new(Mutex::new(None)),
            is_user_provided: false,
        }
    }

    pub(crate) fn is_user_provided(&self) -> bool {
        self.is_user_provided
    }

    /// Create a new machine token request callback for OIDC. The callback receives a
    /// [`CallbackContext`] with the deadline it must honor and the username from the URI, if one
    /// was configured, and returns an access token.
    pub fn machine<F>(function: F) -> Callback
    where
        F: Fn(CallbackContext) -> BoxFuture<'static, Result<IdpServerResponse>>
            + Send
            + Sync
            + 'static,
    {
        Callback {
            inner: Arc::new(Mutex::new(Some(TokenCache::new(Function::new(function))))),
            is_user_provided: true,
        }
    }
}

/// The function the cache invokes to obtain a fresh token.
struct Function {
    f: Box<dyn Fn(CallbackContext) -> BoxFuture<'static, Result<IdpServerResponse>> + Send + Sync>,
}

impl Function {
    fn new<F>(function: F) -> Self
    where
        F: Fn(CallbackContext) -> BoxFuture<'static, Result<IdpServerResponse>>
            + Send
            + Sync
            + 'static,
    {
        Self {
            f: Box::new(function),
        }
    }
}

impl std::fmt::Debug for Function {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Function").finish()
    }
}

type SleepFn = Arc<dyn Fn(Duration) -> BoxFuture<'static, ()> + Send + Sync>;

/// The process-wide (per-client) OIDC token cache.
///
/// All fields are guarded by the mutex in [`Callback`]; holding that mutex across the callback
/// invocation is what makes callback execution single-flight.
struct TokenCache {
    function: Function,

    /// The most recent token returned by the callback, if it has not been invalidated.
    cached_token: Option<CachedToken>,

    /// When the callback last returned, used to enforce the minimum spacing between
    /// invocations.
    last_call_time: Instant,

    /// How this cache waits out the spacing interval. Tests inject a recording stub.
    sleep: SleepFn,
}

impl std::fmt::Debug for TokenCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCache")
            .field("cached_token", &self.cached_token.is_some())
            .field("last_call_time", &self.last_call_time)
            .finish()
    }
}

#[derive(Clone, Debug)]
struct CachedToken {
    access_token: String,
    expires: Option<Instant>,
}

impl CachedToken {
    fn is_expired(&self) -> bool {
        match self.expires {
            Some(expires) => expires <= Instant::now(),
            None => false,
        }
    }
}

impl TokenCache {
    fn new(function: Function) -> Self {
        Self {
            function,
            cached_token: None,
            // Saturate into the past so the first invocation never waits.
            last_call_time: Instant::now()
                .checked_sub(CALLBACK_MIN_SPACING)
                .unwrap_or_else(Instant::now),
            sleep: Arc::new(|duration| Box::pin(tokio::time::sleep(duration))),
        }
    }

    /// Returns a token to authenticate with and whether it came from the cache.
    ///
    /// When the cache is empty (or its token has expired), the callback is invoked with a
    /// deadline of `min(deadline, now + 60s)`, after first waiting out the minimum spacing since
    /// the previous invocation. A callback failure leaves the cache untouched.
    async fn get_token(
        &mut self,
        deadline: Option<Instant>,
        username: Option<&str>,
    ) -> Result<(String, bool)> {
        if let Some(ref token) = self.cached_token {
            if !token.is_expired() {
                return Ok((token.access_token.clone(), true));
            }
            self.cached_token = None;
        }

        let elapsed = self.last_call_time.elapsed();
        if elapsed < CALLBACK_MIN_SPACING {
            (self.sleep)(CALLBACK_MIN_SPACING - elapsed).await;
        }

        let callback_timeout = Instant::now() + MACHINE_CALLBACK_TIMEOUT;
        let timeout = match deadline {
            Some(deadline) => deadline.min(callback_timeout),
            None => callback_timeout,
        };
        let context = CallbackContext {
            timeout: Some(timeout),
            version: API_VERSION,
            username: username.map(String::from),
        };

        let response = (self.function.f)(context).await.map_err(|e| {
            Error::authentication_error(
                MONGODB_OIDC_STR,
                &format!("the OIDC callback failed: {}", e),
            )
        })?;

        self.cached_token = Some(CachedToken {
            access_token: response.access_token.clone(),
            expires: response.expires,
        });
        self.last_call_time = Instant::now();

        Ok((response.access_token, false))
    }

    /// Clears the cached token, but only if it is still the given one. Keying the invalidation
    /// by token value prevents a connection holding a stale token from clobbering a fresh token
    /// fetched by another connection in the meantime.
    fn invalidate(&mut self, token: &str) {
        if self
            .cached_token
            .as_ref()
            .map(|t| t.access_token.as_str())
            == Some(token)
        {
            self.cached_token = None;
        }
    }
}

/// CallbackContext contains the information given to the token callback: the deadline it must
/// honor, the API version, and the username from the URI if one was configured.
#[derive(Clone, Debug, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
#[non_exhaustive]
pub struct CallbackContext {
    /// The time in the future when the callback should return an error if it
    /// has not completed.
    pub timeout: Option<Instant>,
    /// The version of the callback API that the driver is using.
    pub version: u32,
    /// The username from the connection options, if any.
    pub username: Option<String>,
}

/// The return type of the OIDC token callback: the access token and, optionally, when it
/// expires.
#[derive(Clone, Debug, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
#[non_exhaustive]
pub struct IdpServerResponse {
    /// The token that the driver will present to the server.
    #[builder(!default)]
    pub access_token: String,

    /// The time when the access token expires, after which the cache will refresh it.
    pub expires: Option<Instant>,
}

/// Validates the OIDC-specific parts of a credential.
pub(super) fn validate_credential(credential: &Credential) -> Result<()> {
    let has_callback = credential.oidc_callback.is_user_provided();
    let environment = credential
        .mechanism_properties
        .as_ref()
        .and_then(|p| p.get_str(ENVIRONMENT_PROP_STR).ok());
    let has_token_resource = credential
        .mechanism_properties
        .as_ref()
        .map(|p| p.get_str(TOKEN_RESOURCE_PROP_STR).is_ok())
        .unwrap_or(false);

    match (has_callback, environment) {
        (true, Some(_)) => {
            return Err(ErrorKind::InvalidArgument {
                message: format!(
                    "OIDC callback cannot be set for {}:{} auth",
                    ENVIRONMENT_PROP_STR,
                    environment.unwrap_or_default()
                ),
            }
            .into())
        }
        (false, None) => {
            return Err(ErrorKind::InvalidArgument {
                message: format!(
                    "MONGODB-OIDC requires a callback or an {} mechanism property",
                    ENVIRONMENT_PROP_STR
                ),
            }
            .into())
        }
        (true, None) => {
            if has_token_resource {
                return Err(ErrorKind::InvalidArgument {
                    message: format!(
                        "{} must not be set when an OIDC callback is provided",
                        TOKEN_RESOURCE_PROP_STR
                    ),
                }
                .into());
            }
        }
        (false, Some(environment)) => match environment {
            TEST_ENVIRONMENT_VALUE_STR | K8S_ENVIRONMENT_VALUE_STR => {
                if has_token_resource {
                    return Err(ErrorKind::InvalidArgument {
                        message: format!(
                            "{} must not be set for {}:{} auth",
                            TOKEN_RESOURCE_PROP_STR, ENVIRONMENT_PROP_STR, environment
                        ),
                    }
                    .into());
                }
                if credential.username.is_some() {
                    return Err(ErrorKind::InvalidArgument {
                        message: format!(
                            "username must not be set for {}:{} auth",
                            ENVIRONMENT_PROP_STR, environment
                        ),
                    }
                    .into());
                }
            }
            AZURE_ENVIRONMENT_VALUE_STR | GCP_ENVIRONMENT_VALUE_STR => {
                if !has_token_resource {
                    return Err(ErrorKind::InvalidArgument {
                        message: format!(
                            "{} must be set for {}:{} auth",
                            TOKEN_RESOURCE_PROP_STR, ENVIRONMENT_PROP_STR, environment
                        ),
                    }
                    .into());
                }
                if environment == GCP_ENVIRONMENT_VALUE_STR && credential.username.is_some() {
                    return Err(ErrorKind::InvalidArgument {
                        message: format!(
                            "username must not be set for {}:{} auth",
                            ENVIRONMENT_PROP_STR, environment
                        ),
                    }
                    .into());
                }
            }
            other => {
                return Err(ErrorKind::InvalidArgument {
                    message: format!("unsupported {} value {:?}", ENVIRONMENT_PROP_STR, other),
                }
                .into())
            }
        },
    }

    Ok(())
}

/// Installs the driver-supplied callback named by the credential's `ENVIRONMENT` mechanism
/// property when the application did not provide one. A no-op if a callback (from either
/// source) is already in place, e.g. on reauthentication.
fn setup_automatic_providers(
    credential: &Credential,
    cache: &mut Option<TokenCache>,
) -> Result<()> {
    if cache.is_some() {
        return Ok(());
    }
    let props = match credential.mechanism_properties {
        Some(ref p) => p,
        None => return Ok(()),
    };
    let environment = props.get_str(ENVIRONMENT_PROP_STR).unwrap_or("");
    #[cfg_attr(not(any(feature = "azure-oidc", feature = "gcp-oidc")), allow(unused))]
    let resource = props.get_str(TOKEN_RESOURCE_PROP_STR).unwrap_or("");

    let function = match environment {
        TEST_ENVIRONMENT_VALUE_STR => Some(test_callback()),
        K8S_ENVIRONMENT_VALUE_STR => Some(k8s_callback()),
        #[cfg(feature = "azure-oidc")]
        AZURE_ENVIRONMENT_VALUE_STR => {
            Some(azure_callback(credential.username.as_deref(), resource))
        }
        #[cfg(not(feature = "azure-oidc"))]
        AZURE_ENVIRONMENT_VALUE_STR => {
            return Err(ErrorKind::InvalidArgument {
                message: "the azure-oidc feature flag must be enabled for ENVIRONMENT:azure auth"
                    .to_string(),
            }
            .into())
        }
        #[cfg(feature = "gcp-oidc")]
        GCP_ENVIRONMENT_VALUE_STR => Some(gcp_callback(resource)),
        #[cfg(not(feature = "gcp-oidc"))]
        GCP_ENVIRONMENT_VALUE_STR => {
            return Err(ErrorKind::InvalidArgument {
                message: "the gcp-oidc feature flag must be enabled for ENVIRONMENT:gcp auth"
                    .to_string(),
            }
            .into())
        }
        _ => None,
    };

    if let Some(function) = function {
        *cache = Some(TokenCache::new(function));
    }
    Ok(())
}

/// Reads the token from the file named by the `OIDC_TOKEN_FILE` environment variable.
fn test_callback() -> Function {
    Function::new(move |_| {
        Box::pin(async move {
            let path = std::env::var(TEST_TOKEN_FILE_ENV_VAR).map_err(|_| {
                auth_error(format!("{} must be set", TEST_TOKEN_FILE_ENV_VAR))
            })?;
            let access_token = tokio::fs::read_to_string(path).await?;
            Ok(IdpServerResponse {
                access_token: access_token.trim().to_string(),
                expires: None,
            })
        })
    })
}

/// Reads the Kubernetes service-account token.
fn k8s_callback() -> Function {
    Function::new(move |_| {
        Box::pin(async move {
            let path = std::env::var("AZURE_FEDERATED_TOKEN_FILE")
                .or_else(|_| std::env::var("AWS_WEB_IDENTITY_TOKEN_FILE"))
                .unwrap_or_else(|_| {
                    "/var/run/secrets/kubernetes.io/serviceaccount/token".to_string()
                });
            let access_token = tokio::fs::read_to_string(path).await?;
            Ok(IdpServerResponse {
                access_token: access_token.trim().to_string(),
                expires: None,
            })
        })
    })
}

/// Queries the Azure Instance Metadata Service for an access token. The IMDS address is fixed;
/// only the resource and optional client id (the credential's username) are caller-controlled.
#[cfg(feature = "azure-oidc")]
fn azure_callback(client_id: Option<&str>, resource: &str) -> Function {
    let resource = resource.to_string();
    let client_id = client_id.map(|s| s.to_string());
    let mut url = format!(
        "http://169.254.169.254/metadata/identity/oauth2/token?api-version=2018-02-01&resource={}",
        resource
    );
    if let Some(ref client_id) = client_id {
        url.push_str(&format!("&client_id={}", client_id));
    }
    Function::new(move |_| {
        let url = url.clone();
        Box::pin(async move {
            let response = reqwest::Client::new()
                .get(&url)
                .header("Metadata", "true")
                .header("Accept", "application/json")
                .send()
                .await
                .map_err(|e| {
                    auth_error(format!("Failed to get access token from Azure IMDS: {}", e))
                })?
                .json::<Document>()
                .await
                .map_err(|e| {
                    auth_error(format!("Failed to get access token from Azure IMDS: {}", e))
                })?;
            let access_token = response
                .get_str("access_token")
                .map_err(|e| {
                    auth_error(format!("Failed to get access token from Azure IMDS: {}", e))
                })?
                .to_string();
            let expires_in = response
                .get_str("expires_in")
                .map_err(|e| {
                    auth_error(format!("Failed to get expires_in from Azure IMDS: {}", e))
                })?
                .parse::<u64>()
                .map_err(|e| {
                    auth_error(format!(
                        "Failed to parse expires_in from Azure IMDS as u64: {}",
                        e
                    ))
                })?;
            Ok(IdpServerResponse {
                access_token,
                expires: Some(Instant::now() + Duration::from_secs(expires_in)),
            })
        })
    })
}

/// Queries the GCP metadata server for an identity token. The metadata address is fixed; only
/// the audience resource is caller-controlled.
#[cfg(feature = "gcp-oidc")]
fn gcp_callback(resource: &str) -> Function {
    let url = format!(
        "http://metadata/computeMetadata/v1/instance/service-accounts/default/identity?audience={}",
        resource
    );
    Function::new(move |_| {
        let url = url.clone();
        Box::pin(async move {
            let access_token = reqwest::Client::new()
                .get(&url)
                .header("Metadata-Flavor", "Google")
                .send()
                .await
                .map_err(|e| {
                    auth_error(format!("Failed to get access token from GCP IMDS: {}", e))
                })?
                .text()
                .await
                .map_err(|e| {
                    auth_error(format!("Failed to get access token from GCP IMDS: {}", e))
                })?;
            Ok(IdpServerResponse {
                access_token,
                expires: None,
            })
        })
    })
}

/// Constructs the one-step speculative saslStart payload from the cached token, if one is
/// present. The callback is never invoked on this path.
pub(crate) async fn build_speculative_client_first(
    credential: &Credential,
) -> Option<RawDocumentBuf> {
    let guard = credential.oidc_callback.inner.lock().await;
    let cache = guard.as_ref()?;
    let token = cache.cached_token.as_ref().filter(|t| !t.is_expired())?;

    let payload = rawdoc! { "jwt": token.access_token.as_str() };
    Some(rawdoc! {
        "saslStart": 1,
        "mechanism": MONGODB_OIDC_STR,
        "payload": Binary { subtype: BinarySubtype::Generic, bytes: payload.into_bytes() },
        "db": "$external",
    })
}

/// Authenticates a connection using the one-step MONGODB-OIDC conversation.
pub(crate) async fn authenticate_stream(
    conn: &mut Connection,
    credential: &Credential,
    server_first: impl Into<Option<Document>>,
) -> Result<()> {
    // The lock is held for the entire conversation: callback invocation is single-flight
    // across the process, and the token recorded on the connection always matches what the
    // cache handed out.
    let mut guard = credential.oidc_callback.inner.lock().await;
    setup_automatic_providers(credential, &mut guard)?;
    let cache = guard
        .as_mut()
        .ok_or_else(|| auth_error("no callback or ENVIRONMENT supplied"))?;

    if server_first.into().is_some() {
        // Speculative authentication succeeded; record which token the hello presented.
        conn.oidc_access_token = cache
            .cached_token
            .as_ref()
            .map(|t| t.access_token.clone());
        return Ok(());
    }

    authenticate_machine(conn, credential, cache).await
}

/// Reauthenticates a connection in response to a 391 server error.
///
/// The connection's last-used token is invalidated first, so the subsequent `get_token` is
/// guaranteed to return a strictly newer token than the one the server just rejected. The
/// speculative shortcut is never used here; the full saslStart conversation always runs.
pub(crate) async fn reauthenticate_stream(
    conn: &mut Connection,
    credential: &Credential,
) -> Result<()> {
    let mut guard = credential.oidc_callback.inner.lock().await;
    setup_automatic_providers(credential, &mut guard)?;
    let cache = guard
        .as_mut()
        .ok_or_else(|| auth_error("no callback or ENVIRONMENT supplied"))?;

    if let Some(used_token) = conn.oidc_access_token.take() {
        cache.invalidate(&used_token);
    }

    authenticate_machine(conn, credential, cache).await
}

async fn authenticate_machine(
    conn: &mut Connection,
    credential: &Credential,
    cache: &mut TokenCache,
) -> Result<()> {
    let source = credential.source.as_deref().unwrap_or("$external");

    let (token, was_cached) = cache
        .get_token(None, credential.username.as_deref())
        .await?;
    conn.oidc_access_token = Some(token.clone());

    let result = send_sasl_start_command(source, conn, &token).await;
    match result {
        Ok(response) if response.done => Ok(()),
        Ok(_) => Err(invalid_auth_response()),
        Err(e) => {
            // A rejected cached token earns one retry with a freshly-fetched one.
            if was_cached && e.sdam_code() == Some(REAUTHENTICATION_REQUIRED_CODE) {
                cache.invalidate(&token);
                let (token, _) = cache
                    .get_token(None, credential.username.as_deref())
                    .await?;
                conn.oidc_access_token = Some(token.clone());
                let response = send_sasl_start_command(source, conn, &token).await?;
                if response.done {
                    Ok(())
                } else {
                    Err(invalid_auth_response())
                }
            } else {
                Err(e)
            }
        }
    }
}

async fn send_sasl_start_command(
    source: &str,
    conn: &mut Connection,
    access_token: &str,
) -> Result<SaslResponse> {
    let start_doc = rawdoc! { "jwt": access_token };
    let sasl_start = SaslStart::new(
        source.to_string(),
        AuthMechanism::MongoDbOidc,
        start_doc.into_bytes(),
    )
    .into_command();

    let response = conn.send_command(sasl_start).await?;
    SaslResponse::parse(
        MONGODB_OIDC_STR,
        response.auth_response_body(MONGODB_OIDC_STR)?,
    )
}

fn auth_error(s: impl AsRef<str>) -> Error {
    Error::authentication_error(MONGODB_OIDC_STR, s.as_ref())
}

fn invalid_auth_response() -> Error {
    Error::invalid_authentication_response(MONGODB_OIDC_STR)
}

#[cfg(test)]
mod test {
    use std::{
        sync::{
            atomic::{AtomicU32, Ordering},
            Arc,
            Mutex,
        },
        time::{Duration, Instant},
    };

    use super::{CachedToken, Function, IdpServerResponse, TokenCache, CALLBACK_MIN_SPACING};

    fn counting_cache(counter: Arc<AtomicU32>) -> TokenCache {
        let mut cache = TokenCache::new(Function::new(move |_| {
            let counter = counter.clone();
            Box::pin(async move {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                Ok(IdpServerResponse {
                    access_token: format!("t{}", n),
                    expires: None,
                })
            })
        }));
        // No spacing delays in tests; record the requested sleeps instead.
        cache.sleep = Arc::new(|_| Box::pin(async {}));
        cache
    }

    #[tokio::test]
    async fn consecutive_gets_invoke_callback_at_most_once() {
        let counter = Arc::new(AtomicU32::new(0));
        let mut cache = counting_cache(counter.clone());

        let (token, was_cached) = cache.get_token(None, None).await.unwrap();
        assert_eq!(token, "t1");
        assert!(!was_cached);

        let (token, was_cached) = cache.get_token(None, None).await.unwrap();
        assert_eq!(token, "t1");
        assert!(was_cached);

        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn invalidate_then_get_invokes_callback() {
        let counter = Arc::new(AtomicU32::new(0));
        let mut cache = counting_cache(counter.clone());

        let (token, _) = cache.get_token(None, None).await.unwrap();
        cache.invalidate(&token);

        let (token, was_cached) = cache.get_token(None, None).await.unwrap();
        assert_eq!(token, "t2");
        assert!(!was_cached);
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn invalidate_is_keyed_by_token_value() {
        let counter = Arc::new(AtomicU32::new(0));
        let mut cache = counting_cache(counter.clone());

        let (stale, _) = cache.get_token(None, None).await.unwrap();
        cache.invalidate(&stale);
        let (fresh, _) = cache.get_token(None, None).await.unwrap();

        // A connection still holding the first token must not clobber the fresh one.
        cache.invalidate(&stale);
        let (token, was_cached) = cache.get_token(None, None).await.unwrap();
        assert_eq!(token, fresh);
        assert!(was_cached);
    }

    #[tokio::test]
    async fn callback_invocations_are_spaced_out() {
        let counter = Arc::new(AtomicU32::new(0));
        let slept = Arc::new(Mutex::new(Vec::new()));
        let mut cache = counting_cache(counter);
        let slept_clone = slept.clone();
        cache.sleep = Arc::new(move |duration| {
            slept_clone.lock().unwrap().push(duration);
            Box::pin(async {})
        });

        let (t1, _) = cache.get_token(None, None).await.unwrap();
        // The first invocation happens immediately.
        assert!(slept.lock().unwrap().is_empty());

        cache.invalidate(&t1);
        let _ = cache.get_token(None, None).await.unwrap();

        let slept = slept.lock().unwrap();
        assert_eq!(slept.len(), 1);
        assert!(slept[0] <= CALLBACK_MIN_SPACING);
        assert!(slept[0] > Duration::ZERO);
    }

    #[tokio::test]
    async fn callback_failure_leaves_cache_untouched() {
        let mut cache = TokenCache::new(Function::new(|_| {
            Box::pin(async { Err(crate::error::Error::internal("idp unavailable")) })
        }));
        cache.sleep = Arc::new(|_| Box::pin(async {}));
        cache.cached_token = Some(CachedToken {
            access_token: "expired".to_string(),
            expires: Some(Instant::now() - Duration::from_secs(1)),
        });

        let error = cache.get_token(None, None).await.unwrap_err();
        assert!(error.is_auth_error());
        assert!(cache.cached_token.is_none());
    }

    #[tokio::test]
    async fn expired_tokens_are_refreshed() {
        let counter = Arc::new(AtomicU32::new(0));
        let mut cache = counting_cache(counter);
        cache.cached_token = Some(CachedToken {
            access_token: "old".to_string(),
            expires: Some(Instant::now() - Duration::from_secs(1)),
        });

        let (token, was_cached) = cache.get_token(None, None).await.unwrap();
        assert_eq!(token, "t1");
        assert!(!was_cached);
    }

    #[tokio::test]
    async fn callback_deadline_is_capped() {
        let observed = Arc::new(Mutex::new(None));
        let observed_clone = observed.clone();
        let mut cache = TokenCache::new(Function::new(move |ctx| {
            let observed = observed_clone.clone();
            Box::pin(async move {
                *observed.lock().unwrap() = ctx.timeout;
                Ok(IdpServerResponse {
                    access_token: "t".to_string(),
                    expires: None,
                })
            })
        }));
        cache.sleep = Arc::new(|_| Box::pin(async {}));

        let deadline = Instant::now() + Duration::from_secs(5);
        cache.get_token(Some(deadline), None).await.unwrap();

        let observed = observed.lock().unwrap().unwrap();
        assert!(observed <= deadline);
    }
}
