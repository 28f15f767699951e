//! SSO login state machine.
//!
//! The portal hands off to a separate SSO host. The flow replays what a
//! browser does: hit the portal's SSO entry, walk the redirect chain to the
//! login form, submit the RSA-encrypted secret, then touch the menu
//! endpoint so the portal materializes its own session cookies.

use crate::cipher;
use crate::config::HarvestConfig;
use crate::extract::extract_form_action;
use crate::fields::{SSO_ENTRY_PATH, WARMUP_PATH};
use crate::http_client::HttpClient;
use crate::types::{now_ms, Credentials, HarvestError, HarvestResult};

/// Redirect hops tolerated between the SSO entry and the login form.
pub const MAX_SSO_HOPS: usize = 10;

/// Where the flow currently stands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginState {
    Start,
    SsoEntryRedirect { location: String },
    SsoLoginPageLoaded { page_url: String, html: String },
    CredentialsSubmitted { status: u16 },
    PostLoginRedirectOrOk,
    WarmedUp,
}

impl LoginState {
    pub fn name(&self) -> &'static str {
        match self {
            LoginState::Start => "start",
            LoginState::SsoEntryRedirect { .. } => "sso-entry-redirect",
            LoginState::SsoLoginPageLoaded { .. } => "sso-login-page-loaded",
            LoginState::CredentialsSubmitted { .. } => "credentials-submitted",
            LoginState::PostLoginRedirectOrOk => "post-login",
            LoginState::WarmedUp => "warmed-up",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, LoginState::WarmedUp)
    }
}

/// Drives one login attempt over a client whose jar receives the cookies.
pub struct LoginFlow<'a> {
    client: &'a HttpClient,
    config: &'a HarvestConfig,
    credentials: &'a Credentials,
    state: LoginState,
}

impl<'a> LoginFlow<'a> {
    pub fn new(
        client: &'a HttpClient,
        config: &'a HarvestConfig,
        credentials: &'a Credentials,
    ) -> Self {
        Self {
            client,
            config,
            credentials,
            state: LoginState::Start,
        }
    }

    pub fn state(&self) -> &LoginState {
        &self.state
    }

    /// Perform one transition.
    pub async fn advance(&mut self) -> HarvestResult<()> {
        let current = std::mem::replace(&mut self.state, LoginState::Start);
        match self.step(current.clone()).await {
            Ok(next) => {
                tracing::debug!("login: {} -> {}", current.name(), next.name());
                self.state = next;
                Ok(())
            }
            Err(e) => {
                self.state = current;
                Err(e)
            }
        }
    }

    /// Run to `WarmedUp`.
    pub async fn run(mut self) -> HarvestResult<()> {
        tracing::info!("logging in through SSO");
        while !self.state.is_terminal() {
            if let Err(e) = self.advance().await {
                tracing::warn!("login failed in state {}: {e}", self.state.name());
                return Err(e);
            }
        }
        tracing::info!("login complete");
        Ok(())
    }

    async fn step(&self, state: LoginState) -> HarvestResult<LoginState> {
        match state {
            LoginState::Start => self.enter_sso().await,
            LoginState::SsoEntryRedirect { location } => self.load_login_page(location).await,
            LoginState::SsoLoginPageLoaded { page_url, html } => {
                self.submit_credentials(&page_url, &html).await
            }
            LoginState::CredentialsSubmitted { status } => {
                // Only 5xx is treated as failure. Some SSO deployments end the
                // chain on a POST-only endpoint (405 on GET) with the session
                // already established; the selection page load afterwards is
                // the real check. Known fragility: a rejected password that
                // answers 200 also passes here.
                if status >= 500 {
                    Err(HarvestError::LoginFailed(status))
                } else {
                    Ok(LoginState::PostLoginRedirectOrOk)
                }
            }
            LoginState::PostLoginRedirectOrOk => {
                warm_up(self.client, self.config).await?;
                Ok(LoginState::WarmedUp)
            }
            LoginState::WarmedUp => Ok(LoginState::WarmedUp),
        }
    }

    async fn enter_sso(&self) -> HarvestResult<LoginState> {
        let resp = self
            .client
            .get_manual(&self.config.portal_url(SSO_ENTRY_PATH))
            .await?;
        match resp.location() {
            Some(location) if resp.is_redirect() => Ok(LoginState::SsoEntryRedirect { location }),
            _ => Err(HarvestError::UnexpectedSsoEntryStatus(resp.status)),
        }
    }

    async fn load_login_page(&self, location: String) -> HarvestResult<LoginState> {
        let mut url = location;
        for _ in 0..MAX_SSO_HOPS {
            let resp = self.client.get_manual(&url).await?;
            if resp.is_redirect() {
                url = resp.location().ok_or_else(|| HarvestError::UnexpectedStatus {
                    context: "SSO redirect without Location".to_string(),
                    status: resp.status,
                    snippet: resp.snippet(),
                })?;
                continue;
            }
            resp.require_ok("SSO login page")?;
            return Ok(LoginState::SsoLoginPageLoaded {
                page_url: resp.final_url,
                html: resp.body,
            });
        }
        Err(HarvestError::UnexpectedStatus {
            context: format!("SSO redirect chain longer than {MAX_SSO_HOPS} hops"),
            status: 302,
            snippet: url,
        })
    }

    async fn submit_credentials(&self, page_url: &str, html: &str) -> HarvestResult<LoginState> {
        let action = extract_form_action(html, page_url).unwrap_or_else(|| page_url.to_string());
        let encrypted = cipher::encrypt_secret(&self.config.sso_public_key_pem, &self.credentials.secret)?;

        let form = vec![
            ("username".to_string(), self.credentials.identifier.clone()),
            ("password".to_string(), encrypted),
        ];
        let headers = vec![
            ("Origin".to_string(), self.config.sso_origin.clone()),
            ("Referer".to_string(), page_url.to_string()),
        ];
        let resp = self.client.post_form(&action, &form, &headers).await?;
        tracing::debug!("credential POST answered {}", resp.status);
        Ok(LoginState::CredentialsSubmitted {
            status: resp.status,
        })
    }
}

/// Touch the menu endpoint. Completing the request is success.
pub async fn warm_up(client: &HttpClient, config: &HarvestConfig) -> HarvestResult<()> {
    let url = format!(
        "{}?jsdm=xs&_t={}",
        config.portal_url(WARMUP_PATH),
        now_ms()
    );
    let resp = client.get(&url).await?;
    tracing::debug!("warm-up answered {}", resp.status);
    Ok(())
}

/// Convenience wrapper: run a full login.
pub async fn login(
    client: &HttpClient,
    config: &HarvestConfig,
    credentials: &Credentials,
) -> HarvestResult<()> {
    LoginFlow::new(client, config, credentials).run().await
}
